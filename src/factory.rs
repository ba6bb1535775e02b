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

//! Creating writers from configuration.

use std::fmt;
use std::sync::Arc;

use crate::Error;
use crate::InternalLogger;
use crate::config::DestinationConfig;
use crate::config::WriterConfig;
use crate::destination::CloudWatchDestination;
use crate::destination::CloudWatchLogsClient;
use crate::destination::Destination;
use crate::destination::KinesisClient;
use crate::destination::KinesisDestination;
use crate::destination::SnsClient;
use crate::destination::SnsDestination;
use crate::retry::RetryManager;
use crate::stats::WriterStatistics;
use crate::writer::LogWriter;

/// Creates a [`LogWriter`] for a resolved configuration.
pub trait WriterFactory: fmt::Debug + Send + Sync + 'static {
    /// Create a writer; the writer is not started.
    fn create(
        &self,
        config: &WriterConfig,
        statistics: Arc<WriterStatistics>,
        logger: Arc<dyn InternalLogger>,
    ) -> Result<LogWriter, Error>;
}

impl<T: WriterFactory> From<T> for Box<dyn WriterFactory> {
    fn from(value: T) -> Self {
        Box::new(value)
    }
}

/// Creates service clients for the destinations.
///
/// Every method has a default that reports the service as unsupported, so an
/// application implements only the services it uses.
pub trait ClientFactory: fmt::Debug + Send + Sync + 'static {
    /// A CloudWatch Logs client.
    fn cloudwatch_client(&self) -> Result<Box<dyn CloudWatchLogsClient>, Error> {
        Err(Error::new("no CloudWatch Logs client available"))
    }

    /// A Kinesis client.
    fn kinesis_client(&self) -> Result<Box<dyn KinesisClient>, Error> {
        Err(Error::new("no Kinesis client available"))
    }

    /// An SNS client.
    fn sns_client(&self) -> Result<Box<dyn SnsClient>, Error> {
        Err(Error::new("no SNS client available"))
    }
}

/// Builds the destination named by the configuration with clients from a
/// [`ClientFactory`].
#[derive(Debug, Clone)]
pub struct DefaultWriterFactory {
    clients: Arc<dyn ClientFactory>,
}

impl DefaultWriterFactory {
    /// Create a factory using the given clients.
    pub fn new(clients: impl ClientFactory) -> Self {
        Self {
            clients: Arc::new(clients),
        }
    }

    fn destination(
        &self,
        config: &WriterConfig,
        logger: Arc<dyn InternalLogger>,
    ) -> Result<Box<dyn Destination>, Error> {
        let init_retry = RetryManager::new(
            config.retry_initial_delay(),
            config.initialization_timeout(),
            true,
        );
        let send_retry =
            RetryManager::new(config.retry_initial_delay(), config.retry_timeout(), true);

        let destination: Box<dyn Destination> = match &config.destination {
            DestinationConfig::CloudWatch(cloudwatch) => Box::new(
                CloudWatchDestination::new(cloudwatch.clone(), self.clients.cloudwatch_client()?)
                    .with_logger(logger)
                    .with_retry(init_retry, send_retry),
            ),
            DestinationConfig::Kinesis(kinesis) => Box::new(
                KinesisDestination::new(kinesis.clone(), self.clients.kinesis_client()?)
                    .with_logger(logger)
                    .with_retry(init_retry, send_retry),
            ),
            DestinationConfig::Sns(sns) => Box::new(
                SnsDestination::new(sns.clone(), self.clients.sns_client()?)
                    .with_logger(logger)
                    .with_retry(init_retry, send_retry),
            ),
        };
        Ok(destination)
    }
}

impl WriterFactory for DefaultWriterFactory {
    fn create(
        &self,
        config: &WriterConfig,
        statistics: Arc<WriterStatistics>,
        logger: Arc<dyn InternalLogger>,
    ) -> Result<LogWriter, Error> {
        let destination = self.destination(config, logger.clone())?;
        Ok(LogWriter::new(destination, config, statistics, logger))
    }
}
