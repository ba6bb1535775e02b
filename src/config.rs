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

//! Writer configuration.
//!
//! A [`WriterConfig`] is what an appender hands to a
//! [`WriterFactory`](crate::WriterFactory). Destination names may contain
//! substitution tokens such as `{date}`; they are resolved with
//! [`WriterConfig::resolve`] right before a writer is created.
//!
//! # Examples
//!
//! ```
//! use logforth_append_aws::config::DestinationConfig;
//! use logforth_append_aws::config::WriterConfig;
//!
//! let config: WriterConfig = serde_json::from_str(
//!     r#"{
//!         "destination": { "type": "kinesis", "stream_name": "app-logs" },
//!         "batch_delay_ms": 500
//!     }"#,
//! )
//! .unwrap();
//!
//! assert!(matches!(config.destination, DestinationConfig::Kinesis(_)));
//! assert_eq!(config.batch_delay_ms, 500);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::appender::RotationMode;
use crate::queue::DiscardAction;
use crate::substitution::Substitutions;

const DEFAULT_BATCH_DELAY_MS: u64 = 2000;
const DEFAULT_DISCARD_THRESHOLD: usize = 10_000;
const DEFAULT_INITIALIZATION_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;
const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 100;
const DEFAULT_RETRY_TIMEOUT_MS: u64 = 10_000;

/// Everything a writer needs to know about its destination and its queue.
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Where the messages go.
    pub destination: DestinationConfig,

    /// How long to keep accumulating a batch after its first message arrives.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    /// Queue length beyond which messages are discarded.
    #[serde(default = "default_discard_threshold")]
    pub discard_threshold: usize,

    /// Which messages are discarded once the threshold is reached.
    #[serde(default)]
    pub discard_action: DiscardAction,

    /// Send every message on the appending thread instead of a background thread.
    #[serde(default)]
    pub synchronous: bool,

    /// Truncate messages over the destination's size limit instead of dropping them.
    #[serde(default = "default_true")]
    pub truncate_oversize_messages: bool,

    /// How long to keep trying to make the destination available.
    #[serde(default = "default_initialization_timeout_ms")]
    pub initialization_timeout_ms: u64,

    /// Flush the writer when its appender is dropped.
    #[serde(default = "default_true")]
    pub use_shutdown_hook: bool,

    /// How long closing the appender waits for the writer to drain.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Delay before retrying a throttled or otherwise transient service call.
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    /// How long a single send keeps retrying transient failures.
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,
}

impl WriterConfig {
    /// Create a configuration with default queue and timing settings.
    pub fn new(destination: impl Into<DestinationConfig>) -> Self {
        Self {
            destination: destination.into(),
            batch_delay_ms: DEFAULT_BATCH_DELAY_MS,
            discard_threshold: DEFAULT_DISCARD_THRESHOLD,
            discard_action: DiscardAction::default(),
            synchronous: false,
            truncate_oversize_messages: true,
            initialization_timeout_ms: DEFAULT_INITIALIZATION_TIMEOUT_MS,
            use_shutdown_hook: true,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            retry_initial_delay_ms: DEFAULT_RETRY_INITIAL_DELAY_MS,
            retry_timeout_ms: DEFAULT_RETRY_TIMEOUT_MS,
        }
    }

    /// The batch delay as a [`Duration`].
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// The initialization timeout as a [`Duration`].
    pub fn initialization_timeout(&self) -> Duration {
        Duration::from_millis(self.initialization_timeout_ms)
    }

    /// The shutdown timeout as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// The initial retry delay as a [`Duration`].
    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    /// The retry timeout as a [`Duration`].
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    /// A copy of this configuration with every destination name resolved.
    pub fn resolve(&self, substitutions: &Substitutions) -> WriterConfig {
        let mut resolved = self.clone();
        resolved.destination = self.destination.resolve(substitutions);
        resolved
    }
}

/// Destination-specific configuration, tagged by `type` when deserialized.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DestinationConfig {
    /// A CloudWatch Logs log stream.
    CloudWatch(CloudWatchConfig),
    /// A Kinesis data stream.
    Kinesis(KinesisConfig),
    /// An SNS topic.
    Sns(SnsConfig),
}

impl DestinationConfig {
    fn resolve(&self, substitutions: &Substitutions) -> DestinationConfig {
        match self {
            DestinationConfig::CloudWatch(config) => {
                DestinationConfig::CloudWatch(CloudWatchConfig {
                    log_group: substitutions.apply(&config.log_group),
                    log_stream: substitutions.apply(&config.log_stream),
                    ..config.clone()
                })
            }
            DestinationConfig::Kinesis(config) => DestinationConfig::Kinesis(KinesisConfig {
                stream_name: substitutions.apply(&config.stream_name),
                partition_key: if config.partition_key == RANDOM_PARTITION_KEY {
                    config.partition_key.clone()
                } else {
                    substitutions.apply(&config.partition_key)
                },
                ..config.clone()
            }),
            DestinationConfig::Sns(config) => DestinationConfig::Sns(SnsConfig {
                topic_name: config.topic_name.as_deref().map(|s| substitutions.apply(s)),
                topic_arn: config.topic_arn.as_deref().map(|s| substitutions.apply(s)),
                subject: config.subject.as_deref().map(|s| substitutions.apply(s)),
                ..config.clone()
            }),
        }
    }

    /// The rotation policy of this destination.
    ///
    /// Only log streams rotate; every other destination reports
    /// [`RotationMode::None`].
    pub fn rotation(&self) -> (RotationMode, u64) {
        match self {
            DestinationConfig::CloudWatch(config) => {
                (config.rotation_mode, config.rotation_interval)
            }
            DestinationConfig::Kinesis(_) | DestinationConfig::Sns(_) => (RotationMode::None, 0),
        }
    }

    /// The first rotation sequence number.
    pub fn initial_sequence(&self) -> u64 {
        match self {
            DestinationConfig::CloudWatch(config) => config.sequence,
            DestinationConfig::Kinesis(_) | DestinationConfig::Sns(_) => 0,
        }
    }
}

impl From<CloudWatchConfig> for DestinationConfig {
    fn from(value: CloudWatchConfig) -> Self {
        DestinationConfig::CloudWatch(value)
    }
}

impl From<KinesisConfig> for DestinationConfig {
    fn from(value: KinesisConfig) -> Self {
        DestinationConfig::Kinesis(value)
    }
}

impl From<SnsConfig> for DestinationConfig {
    fn from(value: SnsConfig) -> Self {
        DestinationConfig::Sns(value)
    }
}

/// Configuration of a CloudWatch Logs destination.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudWatchConfig {
    /// The log group; created if missing.
    pub log_group: String,

    /// The log stream; created if missing.
    #[serde(default = "default_log_stream")]
    pub log_stream: String,

    /// Retention in days applied when the writer creates the log group.
    #[serde(default)]
    pub retention_period: Option<u32>,

    /// Whether this writer is the only one writing to its log stream.
    #[serde(default = "default_true")]
    pub dedicated_writer: bool,

    /// When to switch to a new log stream.
    #[serde(default)]
    pub rotation_mode: RotationMode,

    /// Message count or milliseconds, depending on the rotation mode.
    #[serde(default)]
    pub rotation_interval: u64,

    /// The value of `{sequence}` for the first log stream.
    #[serde(default)]
    pub sequence: u64,
}

impl CloudWatchConfig {
    /// Create a configuration writing to the given log group and stream.
    pub fn new(log_group: impl Into<String>, log_stream: impl Into<String>) -> Self {
        Self {
            log_group: log_group.into(),
            log_stream: log_stream.into(),
            retention_period: None,
            dedicated_writer: true,
            rotation_mode: RotationMode::None,
            rotation_interval: 0,
            sequence: 0,
        }
    }

    /// Set the rotation policy.
    pub fn with_rotation(mut self, mode: RotationMode, interval: u64) -> Self {
        self.rotation_mode = mode;
        self.rotation_interval = interval;
        self
    }
}

/// The partition key value requesting a random key for every record.
pub const RANDOM_PARTITION_KEY: &str = "{random}";

/// Configuration of a Kinesis destination.
#[derive(Debug, Clone, Deserialize)]
pub struct KinesisConfig {
    /// The stream name.
    pub stream_name: String,

    /// The partition key of every record, or [`RANDOM_PARTITION_KEY`].
    #[serde(default = "default_partition_key")]
    pub partition_key: String,

    /// Create the stream if it does not exist.
    #[serde(default)]
    pub auto_create: bool,

    /// Shard count of a created stream.
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// Retention in hours applied when the writer creates the stream.
    #[serde(default)]
    pub retention_period: Option<u32>,
}

impl KinesisConfig {
    /// Create a configuration writing to the given stream.
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            partition_key: default_partition_key(),
            auto_create: false,
            shard_count: 1,
            retention_period: None,
        }
    }
}

/// Configuration of an SNS destination.
///
/// The topic is found by ARN when one is given, by name otherwise.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnsConfig {
    /// The topic name.
    #[serde(default)]
    pub topic_name: Option<String>,

    /// The topic ARN.
    #[serde(default)]
    pub topic_arn: Option<String>,

    /// The subject attached to every published message.
    #[serde(default)]
    pub subject: Option<String>,

    /// Create the topic (by name) if it does not exist.
    #[serde(default)]
    pub auto_create: bool,
}

fn default_true() -> bool {
    true
}

fn default_batch_delay_ms() -> u64 {
    DEFAULT_BATCH_DELAY_MS
}

fn default_discard_threshold() -> usize {
    DEFAULT_DISCARD_THRESHOLD
}

fn default_initialization_timeout_ms() -> u64 {
    DEFAULT_INITIALIZATION_TIMEOUT_MS
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

fn default_retry_initial_delay_ms() -> u64 {
    DEFAULT_RETRY_INITIAL_DELAY_MS
}

fn default_retry_timeout_ms() -> u64 {
    DEFAULT_RETRY_TIMEOUT_MS
}

fn default_log_stream() -> String {
    "{startupTimestamp}".to_string()
}

fn default_partition_key() -> String {
    "{startupTimestamp}".to_string()
}

fn default_shard_count() -> u32 {
    1
}
