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

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use jiff::Timestamp;
use serde::Serialize;

use crate::Error;

/// Counters and the last error of a writer.
///
/// Only the writer (and its dispatcher) updates the statistics; anyone holding
/// a reference may read them. An [`AwsAppender`](crate::AwsAppender) keeps the
/// same statistics across writer rotations and restarts.
#[derive(Debug, Default)]
pub struct WriterStatistics {
    destination_name: Mutex<Option<String>>,
    messages_sent: AtomicU64,
    messages_sent_last_batch: AtomicU64,
    messages_requeued_last_batch: AtomicU64,
    oversize_messages: AtomicU64,
    writer_failures: AtomicU64,
    last_error: Mutex<Option<LastError>>,
}

/// The most recent error reported by a writer.
#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    /// What the writer was doing.
    pub message: String,
    /// The error and its causes, outermost first.
    pub causes: Vec<String>,
    /// When the error was recorded.
    pub timestamp: Timestamp,
}

/// A point-in-time copy of [`WriterStatistics`], suitable for export.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    /// Resolved name of the destination currently written to.
    pub destination_name: Option<String>,
    /// Messages delivered since the statistics were created.
    pub messages_sent: u64,
    /// Messages delivered by the most recent batch.
    pub messages_sent_last_batch: u64,
    /// Messages returned to the queue by the most recent batch.
    pub messages_requeued_last_batch: u64,
    /// Messages truncated or dropped for being too large.
    pub oversize_messages: u64,
    /// Writer threads that died on an unexpected failure.
    pub writer_failures: u64,
    /// The most recent error.
    pub last_error: Option<LastError>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl WriterStatistics {
    /// Resolved name of the destination currently written to.
    pub fn destination_name(&self) -> Option<String> {
        lock(&self.destination_name).clone()
    }

    pub(crate) fn set_destination_name(&self, name: impl Into<String>) {
        *lock(&self.destination_name) = Some(name.into());
    }

    /// Messages delivered since the statistics were created.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Acquire)
    }

    /// Messages delivered by the most recent batch.
    pub fn messages_sent_last_batch(&self) -> u64 {
        self.messages_sent_last_batch.load(Ordering::Acquire)
    }

    /// Messages returned to the queue by the most recent batch.
    pub fn messages_requeued_last_batch(&self) -> u64 {
        self.messages_requeued_last_batch.load(Ordering::Acquire)
    }

    pub(crate) fn update_batch(&self, sent: usize, requeued: usize) {
        self.messages_sent.fetch_add(sent as u64, Ordering::AcqRel);
        self.messages_sent_last_batch
            .store(sent as u64, Ordering::Release);
        self.messages_requeued_last_batch
            .store(requeued as u64, Ordering::Release);
    }

    /// Messages truncated or dropped for being too large.
    pub fn oversize_messages(&self) -> u64 {
        self.oversize_messages.load(Ordering::Acquire)
    }

    pub(crate) fn increment_oversize_messages(&self) {
        self.oversize_messages.fetch_add(1, Ordering::AcqRel);
    }

    /// Writer threads that died on an unexpected failure.
    pub fn writer_failures(&self) -> u64 {
        self.writer_failures.load(Ordering::Acquire)
    }

    pub(crate) fn increment_writer_failures(&self) {
        self.writer_failures.fetch_add(1, Ordering::AcqRel);
    }

    /// The most recent error, if any.
    pub fn last_error(&self) -> Option<LastError> {
        lock(&self.last_error).clone()
    }

    pub(crate) fn set_last_error(&self, message: &str, err: Option<&Error>) {
        let causes = match err {
            Some(err) => std::iter::once(err.to_string())
                .chain(err.causes())
                .collect(),
            None => vec![],
        };

        *lock(&self.last_error) = Some(LastError {
            message: message.to_string(),
            causes,
            timestamp: Timestamp::now(),
        });
    }

    /// Take a point-in-time copy of all statistics.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            destination_name: self.destination_name(),
            messages_sent: self.messages_sent(),
            messages_sent_last_batch: self.messages_sent_last_batch(),
            messages_requeued_last_batch: self.messages_requeued_last_batch(),
            oversize_messages: self.oversize_messages(),
            writer_failures: self.writer_failures(),
            last_error: self.last_error(),
        }
    }
}

impl StatisticsSnapshot {
    /// Render the snapshot as a JSON object.
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self)
            .map_err(|err| Error::new("failed to serialize statistics").with_source(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceError;

    #[test]
    fn test_batch_counters() {
        let stats = WriterStatistics::default();
        stats.update_batch(8, 2);
        stats.update_batch(10, 0);
        assert_eq!(stats.messages_sent(), 18);
        assert_eq!(stats.messages_sent_last_batch(), 10);
        assert_eq!(stats.messages_requeued_last_batch(), 0);
    }

    #[test]
    fn test_last_error_keeps_cause_chain() {
        let stats = WriterStatistics::default();
        let err = Error::new("failed to send batch").with_source(ServiceError::other("boom"));
        stats.set_last_error("failed to send batch", Some(&err));

        let last = stats.last_error().unwrap();
        assert_eq!(last.message, "failed to send batch");
        assert_eq!(
            last.causes,
            vec![
                "failed to send batch, sources: [Other: boom]".to_string(),
                "Other: boom".to_string()
            ]
        );
    }

    #[test]
    fn test_snapshot_to_json() {
        let stats = WriterStatistics::default();
        stats.set_destination_name("my-group/my-stream");
        stats.update_batch(3, 1);
        stats.increment_oversize_messages();

        let json = stats.snapshot().to_json().unwrap();
        insta::assert_snapshot!(
            json,
            @r#"{"destinationName":"my-group/my-stream","messagesSent":3,"messagesSentLastBatch":3,"messagesRequeuedLastBatch":1,"oversizeMessages":1,"writerFailures":0,"lastError":null}"#
        );
    }
}
