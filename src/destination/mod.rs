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

//! Destinations that a [`LogWriter`](crate::LogWriter) sends batches to.
//!
//! Each destination speaks to its AWS service through a client trait
//! ([`CloudWatchLogsClient`], [`KinesisClient`], [`SnsClient`]) that the
//! application implements with the SDK of its choice.

use std::fmt;

use crate::Error;
use crate::ServiceError;
use crate::message::LogMessage;

mod cloudwatch;
mod kinesis;
mod names;
mod sns;

pub use self::cloudwatch::CloudWatchDestination;
pub use self::cloudwatch::CloudWatchLogsClient;
pub use self::cloudwatch::InputLogEvent;
pub use self::cloudwatch::LogStreamDescription;
pub use self::cloudwatch::PutLogEventsRequest;
pub use self::cloudwatch::PutLogEventsResponse;
pub use self::cloudwatch::RejectedLogEventsInfo;
pub use self::kinesis::KinesisClient;
pub use self::kinesis::KinesisDestination;
pub use self::kinesis::PutRecordsEntry;
pub use self::kinesis::PutRecordsResult;
pub use self::kinesis::StreamStatus;
pub use self::sns::SnsClient;
pub use self::sns::SnsDestination;
pub use self::sns::TopicPage;

/// The service-specific half of a writer.
///
/// A writer is written once against this trait; every AWS service has its own
/// implementation. The writer thread owns the destination, so implementations
/// never see concurrent calls.
pub trait Destination: fmt::Debug + Send + 'static {
    /// Resolved name of the destination, for statistics and diagnostics.
    fn name(&self) -> String;

    /// Check that the destination exists, creating it if configured to.
    ///
    /// This is called once before the first batch and may be called again by
    /// the destination itself when it finds its resource gone. Transient service
    /// errors are retried here; an `Err` means the destination will never become
    /// available, and the writer stops trying to send.
    fn ensure_available(&mut self) -> Result<(), Error>;

    /// Send a batch, returning the positions of the messages to retry.
    ///
    /// Positions are ascending indexes into `batch`. An `Err` means nothing was
    /// delivered: the writer retries the whole batch.
    fn send_batch(&mut self, batch: &[LogMessage]) -> Result<Vec<usize>, Error>;

    /// Size of a message as the service accounts it, including per-record
    /// overhead.
    fn effective_size(&self, message: &LogMessage) -> usize {
        message.size()
    }

    /// Whether a batch of `count` messages totalling `bytes` effective bytes is
    /// acceptable to the service.
    fn within_service_limits(&self, bytes: usize, count: usize) -> bool;

    /// Largest size, in message bytes, a single message may have.
    fn max_message_size(&self) -> usize;

    /// Release the service client.
    fn shutdown(&mut self) {}
}

impl<T: Destination> From<T> for Box<dyn Destination> {
    fn from(value: T) -> Self {
        Box::new(value)
    }
}

// Adapt a client call to `RetryManager::invoke`: transient failures ask for
// another attempt, anything else aborts.
fn retry_transient<T>(result: Result<T, ServiceError>) -> Result<Option<T>, ServiceError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_transient() => Ok(None),
        Err(err) => Err(err),
    }
}
