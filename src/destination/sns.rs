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
use crate::config::SnsConfig;
use crate::destination::Destination;
use crate::destination::names;
use crate::destination::retry_transient;
use crate::message::LogMessage;
use crate::retry::RetryManager;

const MAX_MESSAGE_BYTES: usize = 256 * 1024;
const MAX_BATCH_COUNT: usize = 10;

/// One page of a `ListTopics` call.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TopicPage {
    /// ARNs of the topics on this page.
    pub topic_arns: Vec<String>,
    /// Token for the next page, if there is one.
    pub next_token: Option<String>,
}

/// The SNS operations used by [`SnsDestination`].
pub trait SnsClient: fmt::Debug + Send + 'static {
    /// List one page of topics.
    fn list_topics(&mut self, next_token: Option<&str>) -> Result<TopicPage, ServiceError>;

    /// Create a topic, returning its ARN. Creating an existing topic returns the
    /// existing ARN.
    fn create_topic(&mut self, name: &str) -> Result<String, ServiceError>;

    /// Publish one message.
    fn publish(
        &mut self,
        topic_arn: &str,
        subject: Option<&str>,
        message: &str,
    ) -> Result<(), ServiceError>;

    /// Release the client's resources.
    fn shutdown(&mut self) {}
}

impl<T: SnsClient> From<T> for Box<dyn SnsClient> {
    fn from(value: T) -> Self {
        Box::new(value)
    }
}

/// Publishes messages to an SNS topic.
///
/// SNS has no batch publish for this use, so a batch is published one message at a
/// time, in order.
#[derive(Debug)]
pub struct SnsDestination {
    config: SnsConfig,
    client: Box<dyn SnsClient>,
    logger: Arc<dyn InternalLogger>,
    init_retry: RetryManager,
    send_retry: RetryManager,
    topic_arn: Option<String>,
}

impl SnsDestination {
    /// Create a destination for a resolved configuration.
    pub fn new(config: SnsConfig, client: impl Into<Box<dyn SnsClient>>) -> Self {
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
            topic_arn: None,
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

    fn matches(&self, arn: &str) -> bool {
        match (&self.config.topic_arn, &self.config.topic_name) {
            (Some(topic_arn), _) => arn == topic_arn,
            (None, Some(name)) => arn.rsplit(':').next() == Some(name.as_str()),
            (None, None) => false,
        }
    }

    fn find_topic(&mut self) -> Result<Option<String>, Error> {
        let retry = self.init_retry;
        let mut next_token: Option<String> = None;

        loop {
            let client = &mut self.client;
            let token = next_token.as_deref();
            let page = retry.invoke_or_fail(
                || retry_transient(client.list_topics(token)),
                "failed to list topics",
            )?;

            if let Some(arn) = page.topic_arns.into_iter().find(|arn| self.matches(arn)) {
                return Ok(Some(arn));
            }
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => return Ok(None),
            }
        }
    }
}

impl Destination for SnsDestination {
    fn name(&self) -> String {
        self.topic_arn
            .clone()
            .or_else(|| self.config.topic_name.clone())
            .or_else(|| self.config.topic_arn.clone())
            .unwrap_or_default()
    }

    fn ensure_available(&mut self) -> Result<(), Error> {
        if self.topic_arn.is_some() {
            return Ok(());
        }

        match (&self.config.topic_name, &self.config.topic_arn) {
            (None, None) => return Err(Error::new("neither topic name nor topic ARN configured")),
            (Some(name), None) if !names::is_valid_topic_name(name) => {
                return Err(Error::new("invalid topic name").with_context("topic_name", name));
            }
            _ => {}
        }
        if let Some(subject) = &self.config.subject {
            if !names::is_valid_subject(subject) {
                return Err(Error::new("invalid subject").with_context("subject", subject));
            }
        }

        self.logger.debug(&format!("looking up topic: {}", self.name()));
        if let Some(arn) = self.find_topic()? {
            self.topic_arn = Some(arn);
            return Ok(());
        }

        let name = match (&self.config.topic_name, self.config.auto_create) {
            (Some(name), true) if self.config.topic_arn.is_none() => name.clone(),
            _ => {
                return Err(Error::new("topic does not exist")
                    .with_context("topic", self.name())
                    .with_context("auto_create", self.config.auto_create));
            }
        };

        self.logger.debug(&format!("creating topic: {name}"));
        let retry = self.init_retry;
        let client = &mut self.client;
        let arn = retry.invoke_or_fail(
            || retry_transient(client.create_topic(&name)),
            "failed to create topic",
        )?;
        self.topic_arn = Some(arn);
        Ok(())
    }

    fn send_batch(&mut self, batch: &[LogMessage]) -> Result<Vec<usize>, Error> {
        let Some(topic_arn) = self.topic_arn.as_deref() else {
            return Err(Error::new("topic is not available"));
        };

        let retry = self.send_retry;
        let client = &mut self.client;
        let subject = self.config.subject.as_deref();

        for (i, message) in batch.iter().enumerate() {
            let result = retry.invoke(|| {
                retry_transient(client.publish(topic_arn, subject, message.text()))
            });
            let err = match result {
                Ok(Some(())) => continue,
                Ok(None) => Error::new("timed out publishing message")
                    .with_context("timeout_ms", retry.timeout().as_millis()),
                Err(err) => Error::new("failed to publish message").with_source(err),
            };

            let err = err.with_context("topic_arn", topic_arn);
            if i == 0 {
                return Err(err);
            }
            self.logger
                .warn(&format!("published {i} of {} messages: {err}", batch.len()));
            return Ok((i..batch.len()).collect());
        }

        Ok(vec![])
    }

    fn within_service_limits(&self, bytes: usize, count: usize) -> bool {
        bytes <= MAX_MESSAGE_BYTES && count <= MAX_BATCH_COUNT
    }

    fn max_message_size(&self) -> usize {
        MAX_MESSAGE_BYTES
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
        pages: Vec<Vec<String>>,
        created: Vec<String>,
        publish_errors: VecDeque<Option<ServiceError>>,
        published: Vec<(String, Option<String>, String)>,
    }

    #[derive(Debug, Clone, Default)]
    struct MockClient(Arc<Mutex<MockState>>);

    impl MockClient {
        fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.0.lock().unwrap()
        }
    }

    impl SnsClient for MockClient {
        fn list_topics(&mut self, next_token: Option<&str>) -> Result<TopicPage, ServiceError> {
            let state = self.state();
            let page = next_token.map_or(0, |t| t.parse::<usize>().unwrap());
            Ok(TopicPage {
                topic_arns: state.pages.get(page).cloned().unwrap_or_default(),
                next_token: (page + 1 < state.pages.len()).then(|| (page + 1).to_string()),
            })
        }

        fn create_topic(&mut self, name: &str) -> Result<String, ServiceError> {
            let arn = format!("arn:aws:sns:us-east-1:123456789012:{name}");
            self.state().created.push(arn.clone());
            Ok(arn)
        }

        fn publish(
            &mut self,
            topic_arn: &str,
            subject: Option<&str>,
            message: &str,
        ) -> Result<(), ServiceError> {
            let mut state = self.state();
            if let Some(Some(err)) = state.publish_errors.pop_front() {
                return Err(err);
            }
            state.published.push((
                topic_arn.to_string(),
                subject.map(str::to_string),
                message.to_string(),
            ));
            Ok(())
        }
    }

    fn destination(client: &MockClient, config: SnsConfig) -> SnsDestination {
        let fast = RetryManager::new(Duration::from_millis(1), Duration::from_millis(50), false);
        SnsDestination::new(config, client.clone()).with_retry(fast, fast)
    }

    fn by_name(name: &str) -> SnsConfig {
        SnsConfig {
            topic_name: Some(name.to_string()),
            ..SnsConfig::default()
        }
    }

    fn batch(n: usize) -> Vec<LogMessage> {
        (0..n).map(|i| LogMessage::now(format!("message {i}"))).collect()
    }

    #[test]
    fn test_finds_topic_by_name_across_pages() {
        let client = MockClient::default();
        client.state().pages = vec![
            vec!["arn:aws:sns:us-east-1:123456789012:other".to_string()],
            vec!["arn:aws:sns:us-east-1:123456789012:alerts".to_string()],
        ];

        let mut dest = destination(&client, by_name("alerts"));
        dest.ensure_available().unwrap();
        assert_eq!(dest.name(), "arn:aws:sns:us-east-1:123456789012:alerts");
        assert!(client.state().created.is_empty());
    }

    #[test]
    fn test_finds_topic_by_arn() {
        let client = MockClient::default();
        let arn = "arn:aws:sns:us-east-1:123456789012:alerts".to_string();
        client.state().pages = vec![vec![arn.clone()]];

        let config = SnsConfig {
            topic_arn: Some(arn.clone()),
            ..SnsConfig::default()
        };
        let mut dest = destination(&client, config);
        dest.ensure_available().unwrap();
        assert_eq!(dest.name(), arn);
    }

    #[test]
    fn test_missing_topic() {
        let client = MockClient::default();
        let err = destination(&client, by_name("alerts"))
            .ensure_available()
            .unwrap_err();
        assert_eq!(err.message(), "topic does not exist");

        let mut config = by_name("alerts");
        config.auto_create = true;
        let mut dest = destination(&client, config);
        dest.ensure_available().unwrap();
        assert_eq!(
            client.state().created,
            vec!["arn:aws:sns:us-east-1:123456789012:alerts".to_string()]
        );
    }

    #[test]
    fn test_invalid_configuration() {
        let client = MockClient::default();
        let err = destination(&client, SnsConfig::default())
            .ensure_available()
            .unwrap_err();
        assert_eq!(err.message(), "neither topic name nor topic ARN configured");

        let err = destination(&client, by_name("no.dots"))
            .ensure_available()
            .unwrap_err();
        assert_eq!(err.message(), "invalid topic name");

        let mut config = by_name("alerts");
        config.subject = Some(" padded".to_string());
        let err = destination(&client, config).ensure_available().unwrap_err();
        assert_eq!(err.message(), "invalid subject");
    }

    #[test]
    fn test_publishes_in_order_with_subject() {
        let client = MockClient::default();
        let mut config = by_name("alerts");
        config.auto_create = true;
        config.subject = Some("app errors".to_string());

        let mut dest = destination(&client, config);
        dest.ensure_available().unwrap();
        assert!(dest.send_batch(&batch(3)).unwrap().is_empty());

        let state = client.state();
        let texts = state
            .published
            .iter()
            .map(|(_, _, text)| text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["message 0", "message 1", "message 2"]);
        assert_eq!(state.published[0].1.as_deref(), Some("app errors"));
    }

    #[test]
    fn test_first_failure_returns_remainder() {
        let client = MockClient::default();
        let mut config = by_name("alerts");
        config.auto_create = true;
        let mut dest = destination(&client, config);
        dest.ensure_available().unwrap();

        client.state().publish_errors =
            VecDeque::from([None, None, Some(ServiceError::other("boom"))]);
        assert_eq!(dest.send_batch(&batch(5)).unwrap(), vec![2, 3, 4]);

        client.state().publish_errors = VecDeque::from([Some(ServiceError::other("boom"))]);
        let err = dest.send_batch(&batch(2)).unwrap_err();
        assert_eq!(err.message(), "failed to publish message");
    }

    #[test]
    fn test_throttled_publish_is_retried() {
        let client = MockClient::default();
        let mut config = by_name("alerts");
        config.auto_create = true;
        let mut dest = destination(&client, config);
        dest.ensure_available().unwrap();

        client.state().publish_errors =
            VecDeque::from([Some(ServiceError::throttled("slow down"))]);
        assert!(dest.send_batch(&batch(1)).unwrap().is_empty());
        assert_eq!(client.state().published.len(), 1);
    }

    #[test]
    fn test_limits() {
        let client = MockClient::default();
        let dest = destination(&client, by_name("alerts"));
        assert_eq!(dest.max_message_size(), 262_144);
        assert!(dest.within_service_limits(262_144, 10));
        assert!(!dest.within_service_limits(262_145, 1));
        assert!(!dest.within_service_limits(10, 11));
    }
}
