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

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::DefaultInternalLogger;
use crate::Error;
use crate::InternalLogger;
use crate::ServiceError;
use crate::ServiceErrorKind;
use crate::config::CloudWatchConfig;
use crate::destination::Destination;
use crate::destination::names;
use crate::destination::retry_transient;
use crate::message::LogMessage;
use crate::retry::RetryManager;

const MAX_BATCH_BYTES: usize = 1_048_576;
const MAX_BATCH_COUNT: usize = 10_000;
const MESSAGE_OVERHEAD: usize = 26;
const MAX_MESSAGE_SIZE: usize = 256 * 1024 - MESSAGE_OVERHEAD;

/// One event of a `PutLogEvents` call.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InputLogEvent {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// The message text.
    pub message: String,
}

/// A `PutLogEvents` call.
#[derive(Debug, Clone)]
pub struct PutLogEventsRequest {
    /// Target log group.
    pub log_group: String,
    /// Target log stream.
    pub log_stream: String,
    /// Sequence token from the previous call, if known.
    pub sequence_token: Option<String>,
    /// Events in chronological order.
    pub events: Vec<InputLogEvent>,
}

/// Which events of a `PutLogEvents` call the service refused to store.
///
/// Indexes refer to the events of the request.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RejectedLogEventsInfo {
    /// Events from this index on were too far in the future.
    pub too_new_log_event_start_index: Option<usize>,
    /// Events up to this index were too old.
    pub too_old_log_event_end_index: Option<usize>,
    /// Events up to this index were older than the retention period.
    pub expired_log_event_end_index: Option<usize>,
}

/// Response of a `PutLogEvents` call.
#[derive(Debug, Clone, Default)]
pub struct PutLogEventsResponse {
    /// Token for the next call.
    pub next_sequence_token: Option<String>,
    /// Events the service refused to store.
    pub rejected_log_events_info: Option<RejectedLogEventsInfo>,
}

/// A log stream as reported by `DescribeLogStreams`.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct LogStreamDescription {
    /// The stream name.
    pub name: String,
    /// Token for the next `PutLogEvents` call.
    pub upload_sequence_token: Option<String>,
}

/// The CloudWatch Logs operations used by [`CloudWatchDestination`].
pub trait CloudWatchLogsClient: fmt::Debug + Send + 'static {
    /// Whether the log group exists.
    fn log_group_exists(&mut self, log_group: &str) -> Result<bool, ServiceError>;

    /// Create a log group.
    fn create_log_group(&mut self, log_group: &str) -> Result<(), ServiceError>;

    /// Set the retention period, in days, of a log group.
    fn put_retention_policy(&mut self, log_group: &str, days: u32) -> Result<(), ServiceError>;

    /// Describe a log stream, or `None` if it does not exist.
    fn describe_log_stream(
        &mut self,
        log_group: &str,
        log_stream: &str,
    ) -> Result<Option<LogStreamDescription>, ServiceError>;

    /// Create a log stream.
    fn create_log_stream(&mut self, log_group: &str, log_stream: &str)
    -> Result<(), ServiceError>;

    /// Store a batch of events.
    fn put_log_events(
        &mut self,
        request: PutLogEventsRequest,
    ) -> Result<PutLogEventsResponse, ServiceError>;

    /// Release the client's resources.
    fn shutdown(&mut self) {}
}

impl<T: CloudWatchLogsClient> From<T> for Box<dyn CloudWatchLogsClient> {
    fn from(value: T) -> Self {
        Box::new(value)
    }
}

/// Sends batches to a CloudWatch Logs log stream.
///
/// CloudWatch treats a batch as a unit: either every event is accepted or the
/// call fails. Events the service accepts but refuses to store (too old, too
/// new) are reported and dropped, never retried.
#[derive(Debug)]
pub struct CloudWatchDestination {
    config: CloudWatchConfig,
    client: Box<dyn CloudWatchLogsClient>,
    logger: Arc<dyn InternalLogger>,
    init_retry: RetryManager,
    send_retry: RetryManager,
    sequence_token: Option<String>,
}

impl CloudWatchDestination {
    /// Create a destination for a resolved configuration.
    pub fn new(config: CloudWatchConfig, client: impl Into<Box<dyn CloudWatchLogsClient>>) -> Self {
        Self {
            config,
            client: client.into(),
            logger: Arc::new(DefaultInternalLogger::default()),
            init_retry: RetryManager::new(
                Duration::from_millis(100),
                Duration::from_secs(60),
                true,
            ),
            send_retry: RetryManager::new(
                Duration::from_millis(100),
                Duration::from_secs(10),
                true,
            ),
            sequence_token: None,
        }
    }

    /// Set the logger for diagnostics.
    pub fn with_logger(mut self, logger: Arc<dyn InternalLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Set the retry policies used while checking the destination and while sending.
    pub fn with_retry(mut self, init_retry: RetryManager, send_retry: RetryManager) -> Self {
        self.init_retry = init_retry;
        self.send_retry = send_retry;
        self
    }

    fn ensure_log_group(&mut self) -> Result<(), Error> {
        let retry = self.init_retry;
        let client = &mut self.client;
        let log_group = self.config.log_group.as_str();

        self.logger
            .debug(&format!("checking for existence of log group: {log_group}"));
        let exists = retry.invoke_or_fail(
            || retry_transient(client.log_group_exists(log_group)),
            "failed to check for log group",
        )?;
        if exists {
            return Ok(());
        }

        self.logger.debug(&format!("creating log group: {log_group}"));
        retry.invoke_or_fail(
            || match client.create_log_group(log_group) {
                Err(err) if err.kind() == ServiceErrorKind::ResourceAlreadyExists => Ok(Some(())),
                result => retry_transient(result),
            },
            "failed to create log group",
        )?;
        retry.invoke_or_fail(
            || retry_transient(client.log_group_exists(log_group)).map(|v| v.filter(|&e| e)),
            "log group did not become available",
        )?;

        if let Some(days) = self.config.retention_period {
            let result = retry.invoke_or_fail(
                || retry_transient(client.put_retention_policy(log_group, days)),
                "failed to set log group retention policy",
            );
            if let Err(err) = result {
                // the group is usable without a retention policy
                self.logger.error("failed to set retention policy", Some(&err));
            }
        }

        Ok(())
    }

    fn ensure_log_stream(&mut self) -> Result<(), Error> {
        let retry = self.init_retry;
        let client = &mut self.client;
        let log_group = self.config.log_group.as_str();
        let log_stream = self.config.log_stream.as_str();

        let description = retry.invoke_or_fail(
            || retry_transient(client.describe_log_stream(log_group, log_stream)),
            "failed to check for log stream",
        )?;
        if let Some(description) = description {
            self.sequence_token = description.upload_sequence_token;
            return Ok(());
        }

        self.logger.debug(&format!(
            "creating log stream: {log_group} / {log_stream}"
        ));
        retry.invoke_or_fail(
            || match client.create_log_stream(log_group, log_stream) {
                Err(err) if err.kind() == ServiceErrorKind::ResourceAlreadyExists => Ok(Some(())),
                result => retry_transient(result),
            },
            "failed to create log stream",
        )?;
        let description = retry.invoke_or_fail(
            || {
                retry_transient(client.describe_log_stream(log_group, log_stream))
                    .map(Option::flatten)
            },
            "log stream did not become available",
        )?;

        self.sequence_token = description.upload_sequence_token;
        Ok(())
    }

    fn fetch_sequence_token(&mut self) -> Result<Option<String>, ServiceError> {
        let description = self
            .client
            .describe_log_stream(&self.config.log_group, &self.config.log_stream)?;
        Ok(description.and_then(|d| d.upload_sequence_token))
    }

    fn report_rejected(&self, info: &RejectedLogEventsInfo) {
        if let Some(index) = info.too_old_log_event_end_index {
            self.logger
                .warn(&format!("{} messages rejected as too old", index + 1));
        }
        if let Some(index) = info.expired_log_event_end_index {
            self.logger
                .warn(&format!("{} messages rejected as expired", index + 1));
        }
        if let Some(index) = info.too_new_log_event_start_index {
            self.logger
                .warn(&format!("messages from position {index} rejected as too new"));
        }
    }
}

impl Destination for CloudWatchDestination {
    fn name(&self) -> String {
        format!("{}/{}", self.config.log_group, self.config.log_stream)
    }

    fn ensure_available(&mut self) -> Result<(), Error> {
        if !names::is_valid_log_group_name(&self.config.log_group) {
            return Err(Error::new("invalid log group name")
                .with_context("log_group", &self.config.log_group));
        }
        if !names::is_valid_log_stream_name(&self.config.log_stream) {
            return Err(Error::new("invalid log stream name")
                .with_context("log_stream", &self.config.log_stream));
        }

        self.ensure_log_group()
            .and_then(|()| self.ensure_log_stream())
            .map_err(|err| err.with_context("destination", self.name()))
    }

    fn send_batch(&mut self, batch: &[LogMessage]) -> Result<Vec<usize>, Error> {
        if batch.is_empty() {
            return Ok(vec![]);
        }

        // the service requires chronological order; a stable sort keeps the
        // insertion order of messages with the same timestamp
        let mut events = batch
            .iter()
            .map(|m| InputLogEvent {
                timestamp: m.timestamp_millis(),
                message: m.text().to_string(),
            })
            .collect::<Vec<_>>();
        events.sort_by_key(|e| e.timestamp);

        if !self.config.dedicated_writer || self.sequence_token.is_none() {
            self.sequence_token = match self.fetch_sequence_token() {
                Ok(token) => token,
                Err(err) if err.kind() == ServiceErrorKind::ResourceNotFound => {
                    return self.recover_missing_stream(batch.len(), err);
                }
                Err(err) if err.is_transient() => None,
                Err(err) => {
                    return Err(Error::new("failed to retrieve sequence token").with_source(err));
                }
            };
        }

        let retry = self.send_retry;
        let result = retry.invoke(|| {
            let request = PutLogEventsRequest {
                log_group: self.config.log_group.clone(),
                log_stream: self.config.log_stream.clone(),
                sequence_token: self.sequence_token.clone(),
                events: events.clone(),
            };
            match self.client.put_log_events(request) {
                Ok(response) => Ok(Some(response)),
                Err(err) => match err.kind() {
                    ServiceErrorKind::DataAlreadyAccepted => {
                        Ok(Some(PutLogEventsResponse::default()))
                    }
                    ServiceErrorKind::InvalidSequenceToken => {
                        self.sequence_token = self.fetch_sequence_token().ok().flatten();
                        Ok(None)
                    }
                    _ => retry_transient(Err(err)),
                },
            }
        });

        match result {
            Ok(Some(response)) => {
                if response.next_sequence_token.is_some() {
                    self.sequence_token = response.next_sequence_token;
                }
                if let Some(info) = &response.rejected_log_events_info {
                    self.report_rejected(info);
                }
                Ok(vec![])
            }
            Ok(None) => Err(Error::new("timed out sending batch")
                .with_context("destination", self.name())
                .with_context("timeout_ms", retry.timeout().as_millis())),
            Err(err) if err.kind() == ServiceErrorKind::ResourceNotFound => {
                self.recover_missing_stream(batch.len(), err)
            }
            Err(err) => Err(Error::new("failed to send batch")
                .with_context("destination", self.name())
                .with_source(err)),
        }
    }

    fn effective_size(&self, message: &LogMessage) -> usize {
        message.size() + MESSAGE_OVERHEAD
    }

    fn within_service_limits(&self, bytes: usize, count: usize) -> bool {
        bytes <= MAX_BATCH_BYTES && count <= MAX_BATCH_COUNT
    }

    fn max_message_size(&self) -> usize {
        MAX_MESSAGE_SIZE
    }

    fn shutdown(&mut self) {
        self.client.shutdown();
    }
}

impl CloudWatchDestination {
    // The group or stream was deleted while we were writing to it. Recreate it
    // and have the writer retry the whole batch.
    fn recover_missing_stream(
        &mut self,
        batch_len: usize,
        err: ServiceError,
    ) -> Result<Vec<usize>, Error> {
        self.logger.warn(&format!(
            "log stream {} missing, recreating: {err}",
            self.name()
        ));
        self.sequence_token = None;
        self.ensure_available()?;
        Ok((0..batch_len).collect())
    }
}
