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

use jiff::Timestamp;

/// Source of the current time for message timestamps and rotation.
#[derive(Debug)]
pub(crate) enum Clock {
    DefaultClock,
    #[cfg(test)]
    ManualClock(ManualClock),
}

impl Clock {
    pub(crate) fn now(&self) -> Timestamp {
        match self {
            Clock::DefaultClock => Timestamp::now(),
            #[cfg(test)]
            Clock::ManualClock(clock) => clock.now(),
        }
    }

    /// Milliseconds since the Unix epoch; rotation works at this resolution.
    pub(crate) fn now_millis(&self) -> i64 {
        self.now().as_millisecond()
    }

    #[cfg(test)]
    pub(crate) fn set_now(&mut self, now: Timestamp) {
        if let Clock::ManualClock(clock) = self {
            clock.set_now(now);
        }
    }

    #[cfg(test)]
    pub(crate) fn advance(&mut self, duration: jiff::SignedDuration) {
        if let Clock::ManualClock(clock) = self {
            clock.advance(duration);
        }
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
#[cfg(test)]
pub(crate) struct ManualClock {
    now: Timestamp,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new(now: Timestamp) -> ManualClock {
        ManualClock { now }
    }

    fn now(&self) -> Timestamp {
        self.now
    }

    fn set_now(&mut self, now: Timestamp) {
        self.now = now;
    }

    // saturates at the edges of the supported range
    fn advance(&mut self, duration: jiff::SignedDuration) {
        self.now = self.now.saturating_add(duration).unwrap_or(self.now);
    }
}
