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

//! Batching log appenders for AWS CloudWatch Logs, Kinesis and SNS.
//!
//! # Overview
//!
//! Application threads hand messages to an [`AwsAppender`], which queues them
//! without blocking. A [`LogWriter`], usually on its own thread, collects queued
//! messages into batches that fit the service limits and sends them to a
//! [`Destination`](destination::Destination). Messages the service refuses are
//! put back at the head of the queue and retried in their original order. When
//! the queue grows past its discard threshold, the oldest or newest messages are
//! dropped.
//!
//! The crate does not depend on an AWS SDK. Each destination talks to its
//! service through a client trait that the application implements, and a
//! [`ClientFactory`] supplies those clients.
//!
//! # Examples
//!
//! ```
//! use logforth_append_aws::AwsAppender;
//! use logforth_append_aws::ClientFactory;
//! use logforth_append_aws::DefaultWriterFactory;
//! use logforth_append_aws::Error;
//! use logforth_append_aws::ServiceError;
//! use logforth_append_aws::config::KinesisConfig;
//! use logforth_append_aws::config::WriterConfig;
//! use logforth_append_aws::destination::KinesisClient;
//! use logforth_append_aws::destination::PutRecordsEntry;
//! use logforth_append_aws::destination::PutRecordsResult;
//! use logforth_append_aws::destination::StreamStatus;
//!
//! #[derive(Debug)]
//! struct Stdout;
//!
//! impl KinesisClient for Stdout {
//!     fn describe_stream(&mut self, _: &str) -> Result<Option<StreamStatus>, ServiceError> {
//!         Ok(Some(StreamStatus::Active))
//!     }
//!
//!     fn create_stream(&mut self, _: &str, _: u32) -> Result<(), ServiceError> {
//!         Ok(())
//!     }
//!
//!     fn increase_retention(&mut self, _: &str, _: u32) -> Result<(), ServiceError> {
//!         Ok(())
//!     }
//!
//!     fn put_records(
//!         &mut self,
//!         _: &str,
//!         records: Vec<PutRecordsEntry>,
//!     ) -> Result<Vec<PutRecordsResult>, ServiceError> {
//!         for record in &records {
//!             println!("{}", String::from_utf8_lossy(&record.data));
//!         }
//!         Ok(vec![PutRecordsResult::default(); records.len()])
//!     }
//! }
//!
//! #[derive(Debug)]
//! struct Clients;
//!
//! impl ClientFactory for Clients {
//!     fn kinesis_client(&self) -> Result<Box<dyn KinesisClient>, Error> {
//!         Ok(Box::new(Stdout))
//!     }
//! }
//!
//! let mut config = WriterConfig::new(KinesisConfig::new("app-logs"));
//! config.batch_delay_ms = 100;
//!
//! let appender = AwsAppender::builder(config, DefaultWriterFactory::new(Clients))
//!     .build()
//!     .unwrap();
//! appender.append("hello, world");
//! appender.close();
//! assert_eq!(appender.statistics().messages_sent(), 1);
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod config;
pub mod destination;
pub mod message;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod substitution;

mod appender;
mod dispatch;
mod error;
mod factory;
mod internal;
mod writer;

pub use self::appender::AwsAppender;
pub use self::appender::AwsAppenderBuilder;
pub use self::appender::RotationMode;
pub use self::dispatch::DefaultThreadFactory;
pub use self::dispatch::FailureHandler;
pub use self::dispatch::InlineThreadFactory;
pub use self::dispatch::ThreadFactory;
pub use self::error::Error;
pub use self::error::ServiceError;
pub use self::error::ServiceErrorKind;
pub use self::factory::ClientFactory;
pub use self::factory::DefaultWriterFactory;
pub use self::factory::WriterFactory;
pub use self::internal::DefaultInternalLogger;
pub use self::internal::InternalLogger;
pub use self::internal::LogCrateInternalLogger;
pub use self::writer::LogWriter;
