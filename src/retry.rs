// Copyright 2024 FastLabs Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;
use std::time::Instant;

use crate::Error;

/// Calls an operation until it succeeds or a timeout expires, sleeping between
/// attempts.
///
/// The operation reports its outcome as `Ok(Some(value))` on success, `Ok(None)`
/// when it should be tried again, and `Err(_)` when retrying is pointless.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RetryManager {
    initial_delay: Duration,
    timeout: Duration,
    exponential: bool,
}

impl RetryManager {
    /// Create a retry manager.
    ///
    /// With `exponential` set, the delay doubles after every attempt; the delay is
    /// never longer than the time left before `timeout`.
    pub fn new(initial_delay: Duration, timeout: Duration, exponential: bool) -> Self {
        Self {
            initial_delay,
            timeout,
            exponential,
        }
    }

    /// The delay before the first retry.
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// The total time allowed for all attempts.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invoke `op` until it yields a value. Returns `Ok(None)` on timeout.
    ///
    /// The operation is always attempted at least once.
    pub fn invoke<T, E>(
        &self,
        mut op: impl FnMut() -> Result<Option<T>, E>,
    ) -> Result<Option<T>, E> {
        let deadline = Instant::now() + self.timeout;
        let mut delay = self.initial_delay;

        loop {
            if let Some(value) = op()? {
                return Ok(Some(value));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            std::thread::sleep(delay.min(deadline - now));
            if self.exponential {
                delay = delay.saturating_mul(2);
            }
        }
    }

    /// Like [`invoke`](Self::invoke), but a timeout becomes an [`Error`] with the
    /// given message.
    pub fn invoke_or_fail<T, E>(
        &self,
        op: impl FnMut() -> Result<Option<T>, E>,
        message: &str,
    ) -> Result<T, Error>
    where
        E: Into<anyhow::Error>,
    {
        match self.invoke(op) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(Error::new(message)
                .with_context("timeout_ms", self.timeout.as_millis())),
            Err(err) => Err(Error::new(message).with_source(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceError;

    #[test]
    fn test_returns_first_success() {
        let retry = RetryManager::new(Duration::from_millis(1), Duration::from_secs(1), false);
        let mut calls = 0;
        let value = retry
            .invoke(|| {
                calls += 1;
                Ok::<_, ServiceError>((calls == 3).then_some(calls))
            })
            .unwrap();
        assert_eq!(value, Some(3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_times_out() {
        let retry = RetryManager::new(Duration::from_millis(5), Duration::from_millis(40), true);
        let start = Instant::now();
        let mut calls = 0;
        let value = retry
            .invoke(|| {
                calls += 1;
                Ok::<Option<()>, ServiceError>(None)
            })
            .unwrap();
        assert_eq!(value, None);
        assert!(start.elapsed() >= Duration::from_millis(40));
        // 5 + 10 + 20 fits in 40ms, then one more attempt after the capped sleep
        assert!(calls >= 3, "only {calls} attempts");
    }

    #[test]
    fn test_error_aborts_immediately() {
        let retry = RetryManager::new(Duration::from_millis(1), Duration::from_secs(10), false);
        let mut calls = 0;
        let result = retry.invoke(|| {
            calls += 1;
            Err::<Option<()>, _>(ServiceError::other("boom"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_invoke_or_fail_reports_timeout() {
        let retry = RetryManager::new(Duration::from_millis(1), Duration::from_millis(5), false);
        let err = retry
            .invoke_or_fail(|| Ok::<Option<()>, ServiceError>(None), "stream never became active")
            .unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @"stream never became active, context: { timeout_ms: 5 }"
        );
    }
}
