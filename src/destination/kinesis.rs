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

use rand::Rng;

use crate::DefaultInternalLogger;
use crate::Error;
use crate::InternalLogger;
use crate::ServiceError;
use crate::ServiceErrorKind;
use crate::config::KinesisConfig;
use crate::config::RANDOM_PARTITION_KEY;
use crate::destination::Destination;
use crate::destination::names;
use crate::destination::retry_transient;
use crate::message::LogMessage;
use crate::retry::RetryManager;

const MAX_BATCH_BYTES: usize = 5 * 1024 * 1024;
const MAX_BATCH_COUNT: usize = 500;
const MAX_RECORD_BYTES: usize = 1024 * 1024;
const MAX_PARTITION_KEY_BYTES: usize = 256;
const RANDOM_PARTITION_KEY_BYTES: usize = 8;

/// Status of a Kinesis stream.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StreamStatus {
    /// Being created; not writable yet.
    Creating,
    /// Ready for writes.
    Active,
    /// Being resharded or reconfigured; writable.
    Updating,
    /// Being deleted.
    Deleting,
}

/// One record of a `PutRecords` call.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PutRecordsEntry {
    /// Partition key of the record.
    pub partition_key: String,
    /// Record payload.
    pub data: Vec<u8>,
}

/// Outcome of one record of a `PutRecords` call.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PutRecordsResult {
    /// Set when the record was not stored.
    pub error_code: Option<String>,
    /// Details of the failure.
    pub error_message: Option<String>,
}

/// The Kinesis operations used by [`KinesisDestination`].
pub trait KinesisClient: fmt::Debug + Send + 'static {
    /// Status of the stream, or `None` if it does not exist.
    fn describe_stream(&mut self, stream_name: &str) -> Result<Option<StreamStatus>, ServiceError>;

    /// Create a stream.
    fn create_stream(&mut self, stream_name: &str, shard_count: u32) -> Result<(), ServiceError>;

    /// Raise the retention period, in hours, of a stream.
    fn increase_retention(&mut self, stream_name: &str, hours: u32) -> Result<(), ServiceError>;

    /// Store records; the results are in the order of `records`.
    fn put_records(
        &mut self,
        stream_name: &str,
        records: Vec<PutRecordsEntry>,
    ) -> Result<Vec<PutRecordsResult>, ServiceError>;

    /// Release the client's resources.
    fn shutdown(&mut self) {}
}

impl<T: KinesisClient> From<T> for Box<dyn KinesisClient> {
    fn from(value: T) -> Self {
        Box::new(value)
    }
}

/// Sends batches to a Kinesis data stream.
///
/// Kinesis reports success per record, so only the records it refused are
/// retried.
#[derive(Debug)]
pub struct KinesisDestination {
    config: KinesisConfig,
    client: Box<dyn KinesisClient>,
    logger: Arc<dyn InternalLogger>,
    init_retry: RetryManager,
    send_retry: RetryManager,
}

impl KinesisDestination {
    /// Create a destination for a resolved configuration.
    pub fn new(config: KinesisConfig, client: impl Into<Box<dyn KinesisClient>>) -> Self {
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

    fn random_partition_key(&self) -> bool {
        self.config.partition_key == RANDOM_PARTITION_KEY
    }

    fn partition_key_size(&self) -> usize {
        if self.random_partition_key() {
            RANDOM_PARTITION_KEY_BYTES
        } else {
            self.config.partition_key.len()
        }
    }

    fn partition_key(&self) -> String {
        if self.random_partition_key() {
            let value: u32 = rand::rng().random();
            format!("{value:08x}")
        } else {
            self.config.partition_key.clone()
        }
    }

    fn wait_until_active(&mut self) -> Result<(), Error> {
        let retry = self.init_retry;
        let client = &mut self.client;
        let stream_name = self.config.stream_name.as_str();

        retry.invoke_or_fail(
            || match retry_transient(client.describe_stream(stream_name))? {
                Some(Some(StreamStatus::Active | StreamStatus::Updating)) => Ok(Some(())),
                Some(Some(StreamStatus::Deleting)) => Err(ServiceError::new(
                    ServiceErrorKind::ResourceInUse,
                    "stream is being deleted",
                )),
                _ => Ok(None),
            },
            "stream did not become active",
        )
    }
}

impl Destination for KinesisDestination {
    fn name(&self) -> String {
        self.config.stream_name.clone()
    }

    fn ensure_available(&mut self) -> Result<(), Error> {
        let stream_name = self.config.stream_name.clone();
        if !names::is_valid_stream_name(&stream_name) {
            return Err(Error::new("invalid stream name").with_context("stream_name", &stream_name));
        }
        if !self.random_partition_key()
            && !(1..=MAX_PARTITION_KEY_BYTES).contains(&self.config.partition_key.len())
        {
            return Err(Error::new("invalid partition key")
                .with_context("partition_key", &self.config.partition_key));
        }

        self.logger
            .debug(&format!("checking status of stream: {stream_name}"));
        let retry = self.init_retry;
        let client = &mut self.client;
        let status = retry.invoke_or_fail(
            || retry_transient(client.describe_stream(&stream_name)),
            "failed to describe stream",
        )?;

        if status.is_some() {
            return self.wait_until_active();
        }
        if !self.config.auto_create {
            return Err(Error::new("stream does not exist and auto-create is disabled")
                .with_context("stream_name", &stream_name));
        }

        let shard_count = self.config.shard_count;
        self.logger
            .debug(&format!("creating stream: {stream_name} with {shard_count} shard(s)"));
        retry.invoke_or_fail(
            || match client.create_stream(&stream_name, shard_count) {
                Err(err) if err.kind() == ServiceErrorKind::ResourceAlreadyExists => Ok(Some(())),
                result => retry_transient(result),
            },
            "failed to create stream",
        )?;
        self.wait_until_active()?;

        if let Some(hours) = self.config.retention_period {
            let client = &mut self.client;
            retry.invoke_or_fail(
                || retry_transient(client.increase_retention(&stream_name, hours)),
                "failed to set stream retention period",
            )?;
            // changing retention puts the stream back into the updating state
            self.wait_until_active()?;
        }

        Ok(())
    }

    fn send_batch(&mut self, batch: &[LogMessage]) -> Result<Vec<usize>, Error> {
        if batch.is_empty() {
            return Ok(vec![]);
        }

        let records = batch
            .iter()
            .map(|m| PutRecordsEntry {
                partition_key: self.partition_key(),
                data: m.bytes().to_vec(),
            })
            .collect::<Vec<_>>();

        let retry = self.send_retry;
        let client = &mut self.client;
        let stream_name = self.config.stream_name.as_str();
        let result =
            retry.invoke(|| retry_transient(client.put_records(stream_name, records.clone())));

        let results = match result {
            Ok(Some(results)) => results,
            Ok(None) => {
                return Err(Error::new("timed out sending batch")
                    .with_context("destination", stream_name)
                    .with_context("timeout_ms", retry.timeout().as_millis()));
            }
            Err(err) => {
                return Err(Error::new("failed to send batch")
                    .with_context("destination", stream_name)
                    .with_source(err));
            }
        };

        if results.len() != batch.len() {
            return Err(Error::new("record count mismatch in response")
                .with_context("sent", batch.len())
                .with_context("received", results.len()));
        }

        let failed = results
            .iter()
            .enumerate()
            .filter(|(_, result)| result.error_code.is_some())
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        if let Some(first) = failed.first() {
            let result = &results[*first];
            self.logger.debug(&format!(
                "{} of {} records rejected, first failure: {}: {}",
                failed.len(),
                batch.len(),
                result.error_code.as_deref().unwrap_or_default(),
                result.error_message.as_deref().unwrap_or_default(),
            ));
        }
        Ok(failed)
    }

    fn effective_size(&self, message: &LogMessage) -> usize {
        message.size() + self.partition_key_size()
    }

    fn within_service_limits(&self, bytes: usize, count: usize) -> bool {
        bytes <= MAX_BATCH_BYTES && count <= MAX_BATCH_COUNT
    }

    fn max_message_size(&self) -> usize {
        MAX_RECORD_BYTES - self.partition_key_size()
    }

    fn shutdown(&mut self) {
        self.client.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    struct MockState {
        streams: Vec<(String, u32)>,
        statuses: VecDeque<StreamStatus>,
        retention: Option<u32>,
        put_errors: VecDeque<ServiceError>,
        fail_every: Option<usize>,
        requests: Vec<Vec<PutRecordsEntry>>,
    }

    #[derive(Debug, Clone, Default)]
    struct MockClient(Arc<Mutex<MockState>>);

    impl MockClient {
        fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.0.lock().unwrap()
        }
    }

    impl KinesisClient for MockClient {
        fn describe_stream(
            &mut self,
            stream_name: &str,
        ) -> Result<Option<StreamStatus>, ServiceError> {
            let mut state = self.state();
            if !state.streams.iter().any(|(s, _)| s == stream_name) {
                return Ok(None);
            }
            Ok(Some(state.statuses.pop_front().unwrap_or(StreamStatus::Active)))
        }

        fn create_stream(
            &mut self,
            stream_name: &str,
            shard_count: u32,
        ) -> Result<(), ServiceError> {
            let mut state = self.state();
            state.streams.push((stream_name.to_string(), shard_count));
            state.statuses.push_back(StreamStatus::Creating);
            Ok(())
        }

        fn increase_retention(&mut self, _: &str, hours: u32) -> Result<(), ServiceError> {
            self.state().retention = Some(hours);
            Ok(())
        }

        fn put_records(
            &mut self,
            _: &str,
            records: Vec<PutRecordsEntry>,
        ) -> Result<Vec<PutRecordsResult>, ServiceError> {
            let mut state = self.state();
            if let Some(err) = state.put_errors.pop_front() {
                return Err(err);
            }
            let fail_every = state.fail_every;
            let results = (0..records.len())
                .map(|i| match fail_every {
                    Some(n) if i % n == n - 1 => PutRecordsResult {
                        error_code: Some("ProvisionedThroughputExceededException".to_string()),
                        error_message: Some("slow down".to_string()),
                    },
                    _ => PutRecordsResult::default(),
                })
                .collect();
            state.requests.push(records);
            Ok(results)
        }
    }

    fn destination(client: &MockClient, config: KinesisConfig) -> KinesisDestination {
        let fast = RetryManager::new(Duration::from_millis(1), Duration::from_millis(200), false);
        KinesisDestination::new(config, client.clone()).with_retry(fast, fast)
    }

    #[test]
    fn test_missing_stream_without_auto_create_fails() {
        let client = MockClient::default();
        let err = destination(&client, KinesisConfig::new("logs"))
            .ensure_available()
            .unwrap_err();
        assert_eq!(err.message(), "stream does not exist and auto-create is disabled");
    }

    #[test]
    fn test_auto_create_waits_for_active() {
        let client = MockClient::default();
        let mut config = KinesisConfig::new("logs");
        config.auto_create = true;
        config.shard_count = 2;
        config.retention_period = Some(48);

        destination(&client, config).ensure_available().unwrap();
        let state = client.state();
        assert_eq!(state.streams, vec![("logs".to_string(), 2)]);
        assert_eq!(state.retention, Some(48));
        assert!(state.statuses.is_empty());
    }

    #[test]
    fn test_invalid_names_fail() {
        let client = MockClient::default();
        let err = destination(&client, KinesisConfig::new("no/slashes"))
            .ensure_available()
            .unwrap_err();
        assert_eq!(err.message(), "invalid stream name");

        let mut config = KinesisConfig::new("logs");
        config.partition_key = String::new();
        let err = destination(&client, config).ensure_available().unwrap_err();
        assert_eq!(err.message(), "invalid partition key");
    }

    #[test]
    fn test_partial_failure_returns_failed_positions() {
        let client = MockClient::default();
        client.state().streams.push(("logs".to_string(), 1));
        client.state().fail_every = Some(3);

        let mut dest = destination(&client, KinesisConfig::new("logs"));
        dest.ensure_available().unwrap();

        let batch = (0..7)
            .map(|i| LogMessage::now(format!("message {i}")))
            .collect::<Vec<_>>();
        assert_eq!(dest.send_batch(&batch).unwrap(), vec![2, 5]);
    }

    #[test]
    fn test_throttled_call_is_retried() {
        let client = MockClient::default();
        client.state().streams.push(("logs".to_string(), 1));
        client
            .state()
            .put_errors
            .push_back(ServiceError::throttled("rate exceeded"));

        let mut dest = destination(&client, KinesisConfig::new("logs"));
        assert!(dest.send_batch(&[LogMessage::now("x")]).unwrap().is_empty());
        assert_eq!(client.state().requests.len(), 1);
    }

    #[test]
    fn test_partition_keys() {
        let client = MockClient::default();
        client.state().streams.push(("logs".to_string(), 1));

        let mut config = KinesisConfig::new("logs");
        config.partition_key = "fixed".to_string();
        let mut dest = destination(&client, config);
        dest.send_batch(&[LogMessage::now("abc")]).unwrap();
        assert_eq!(dest.effective_size(&LogMessage::now("abc")), 8);
        assert_eq!(dest.max_message_size(), 1024 * 1024 - 5);

        let mut config = KinesisConfig::new("logs");
        config.partition_key = RANDOM_PARTITION_KEY.to_string();
        let mut dest = destination(&client, config);
        dest.send_batch(&[LogMessage::now("a"), LogMessage::now("b")])
            .unwrap();

        let state = client.state();
        assert_eq!(state.requests[0][0].partition_key, "fixed");
        assert_eq!(state.requests[1][0].partition_key.len(), 8);
        assert_eq!(state.requests[1][1].partition_key.len(), 8);
    }

    #[test]
    fn test_limits() {
        let client = MockClient::default();
        let dest = destination(&client, KinesisConfig::new("logs"));
        assert!(dest.within_service_limits(5 * 1024 * 1024, 500));
        assert!(!dest.within_service_limits(5 * 1024 * 1024 + 1, 1));
        assert!(!dest.within_service_limits(10, 501));
    }
}
