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

//! The appender that owns a writer and rotates it.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::DefaultInternalLogger;
use crate::Error;
use crate::InternalLogger;
use crate::config::WriterConfig;
use crate::dispatch::DefaultThreadFactory;
use crate::dispatch::InlineThreadFactory;
use crate::dispatch::ThreadFactory;
use crate::factory::WriterFactory;
use crate::message::LogMessage;
use crate::queue::DiscardAction;
use crate::stats::WriterStatistics;
use crate::substitution::Substitutions;
use crate::writer::LogWriter;

mod clock;
mod rotation;

pub use self::rotation::RotationMode;

use self::clock::Clock;
use self::rotation::RotationState;

/// Sends log messages to AWS through a [`LogWriter`] that it creates, restarts
/// and rotates.
///
/// Appending never blocks on the network and never fails: errors are visible
/// through [`statistics`](Self::statistics) and the internal logger only.
///
/// # Examples
///
/// ```no_run
/// use logforth_append_aws::AwsAppender;
/// use logforth_append_aws::ClientFactory;
/// use logforth_append_aws::DefaultWriterFactory;
/// use logforth_append_aws::config::CloudWatchConfig;
/// use logforth_append_aws::config::WriterConfig;
///
/// #[derive(Debug)]
/// struct Clients;
///
/// // supply a CloudWatch Logs client here
/// impl ClientFactory for Clients {}
///
/// let config = WriterConfig::new(CloudWatchConfig::new("my-app", "{date}-{sequence}"));
/// let appender = AwsAppender::builder(config, DefaultWriterFactory::new(Clients))
///     .build()
///     .unwrap();
/// appender.append("hello, world");
/// appender.close();
/// ```
#[derive(Debug)]
pub struct AwsAppender {
    factory: Box<dyn WriterFactory>,
    thread_factory: Box<dyn ThreadFactory>,
    logger: Arc<dyn InternalLogger>,
    statistics: Arc<WriterStatistics>,
    header: Option<String>,
    footer: Option<String>,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    config: WriterConfig,
    writer: Option<ActiveWriter>,
    sequence: u64,
    rotation: RotationState,
    clock: Clock,
    closed: bool,
}

#[derive(Debug)]
struct ActiveWriter {
    writer: LogWriter,
    failed: Arc<AtomicBool>,
}

impl AwsAppender {
    /// Create a builder for an appender with the given configuration.
    ///
    /// Destination names in `config` may contain substitution tokens; they are
    /// resolved every time a writer is created.
    pub fn builder(
        config: WriterConfig,
        factory: impl Into<Box<dyn WriterFactory>>,
    ) -> AwsAppenderBuilder {
        AwsAppenderBuilder {
            config,
            factory: factory.into(),
            thread_factory: Box::new(DefaultThreadFactory::default()),
            logger: Arc::new(DefaultInternalLogger::default()),
            statistics: Arc::new(WriterStatistics::default()),
            header: None,
            footer: None,
            clock: Clock::DefaultClock,
        }
    }

    /// Append a message timestamped now.
    pub fn append(&self, text: impl Into<String>) {
        let mut state = self.state();
        let message = LogMessage::new(state.clock.now(), text);
        self.append_locked(&mut state, message);
    }

    /// Append a message with its own timestamp.
    pub fn append_message(&self, message: LogMessage) {
        let mut state = self.state();
        self.append_locked(&mut state, message);
    }

    /// Switch to a new writer, incrementing the rotation sequence.
    ///
    /// The old writer sends what it has queued on its own thread.
    pub fn rotate(&self) {
        let mut state = self.state();
        if !state.closed {
            self.rotate_locked(&mut state);
        }
    }

    /// Stop the writer and wait up to the shutdown timeout for it to drain.
    ///
    /// Messages appended after `close` are dropped.
    pub fn close(&self) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        state.closed = true;

        let Some(active) = state.writer.take() else {
            return;
        };
        self.retire(&state, active.writer.clone());

        let timeout = state.config.shutdown_timeout();
        if !active.writer.wait_until_stopped(timeout) {
            self.logger.warn(&format!(
                "writer did not stop within {}ms, {} messages may be lost",
                timeout.as_millis(),
                active.writer.queue().len()
            ));
        }
    }

    /// Change the batch delay of the current and future writers.
    pub fn set_batch_delay(&self, batch_delay: Duration) {
        let mut state = self.state();
        state.config.batch_delay_ms = u64::try_from(batch_delay.as_millis()).unwrap_or(u64::MAX);
        if let Some(active) = &state.writer {
            active.writer.set_batch_delay(batch_delay);
        }
    }

    /// Change the discard threshold of the current and future writers.
    pub fn set_discard_threshold(&self, discard_threshold: usize) {
        let mut state = self.state();
        state.config.discard_threshold = discard_threshold;
        if let Some(active) = &state.writer {
            active.writer.set_discard_threshold(discard_threshold);
        }
    }

    /// Change the discard action of the current and future writers.
    pub fn set_discard_action(&self, discard_action: DiscardAction) {
        let mut state = self.state();
        state.config.discard_action = discard_action;
        if let Some(active) = &state.writer {
            active.writer.set_discard_action(discard_action);
        }
    }

    /// Statistics shared by every writer of this appender.
    pub fn statistics(&self) -> &Arc<WriterStatistics> {
        &self.statistics
    }

    /// The current rotation sequence number.
    pub fn sequence(&self) -> u64 {
        self.state().sequence
    }

    /// The current writer, if one is running.
    pub fn writer(&self) -> Option<LogWriter> {
        self.state().writer.as_ref().map(|active| active.writer.clone())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append_locked(&self, state: &mut State, message: LogMessage) {
        if state.closed {
            return;
        }

        if state.rotation.should_rotate(state.clock.now_millis()) {
            self.rotate_locked(state);
        }

        let failed = state
            .writer
            .as_ref()
            .is_some_and(|active| active.failed.load(Ordering::Acquire));
        if failed {
            self.logger.warn("writer failed, creating a new one");
            state.writer = None;
        }
        if state.writer.is_none() {
            self.replace_writer(state);
        }

        if let Some(active) = &state.writer {
            active.writer.add_message(message);
            state.rotation.record_message();
        }
    }

    fn rotate_locked(&self, state: &mut State) {
        if let Some(active) = state.writer.take() {
            self.retire(state, active.writer);
        }
        state.sequence += 1;
        state.rotation.reset(state.clock.now_millis());
        self.replace_writer(state);
    }

    fn replace_writer(&self, state: &mut State) {
        match self.start_writer(state) {
            Ok(active) => state.writer = Some(active),
            Err(err) => {
                let message = "failed to create writer";
                self.statistics.set_last_error(message, Some(&err));
                self.logger.error(message, Some(&err));
            }
        }
    }

    fn start_writer(&self, state: &State) -> Result<ActiveWriter, Error> {
        let now = state.clock.now();
        let config = state.config.resolve(&Substitutions::new(now, state.sequence));
        let writer = self
            .factory
            .create(&config, self.statistics.clone(), self.logger.clone())?;

        let failed = Arc::new(AtomicBool::new(false));
        let on_failure = {
            let failed = failed.clone();
            Box::new(move |_: Error| failed.store(true, Ordering::Release))
        };
        if config.synchronous {
            InlineThreadFactory::default().start(writer.clone(), on_failure)?;
        } else {
            self.thread_factory.start(writer.clone(), on_failure)?;
        }

        if let Some(header) = &self.header {
            writer.add_message(LogMessage::new(now, header.clone()));
        }
        Ok(ActiveWriter { writer, failed })
    }

    fn retire(&self, state: &State, writer: LogWriter) {
        if let Some(footer) = &self.footer {
            writer.add_message(LogMessage::new(state.clock.now(), footer.clone()));
        }
        writer.stop();
    }
}

impl Drop for AwsAppender {
    fn drop(&mut self) {
        let use_shutdown_hook = self.state().config.use_shutdown_hook;
        if use_shutdown_hook {
            self.close();
        } else if let Some(active) = self.state().writer.take() {
            active.writer.stop();
        }
    }
}

/// A builder for configuring [`AwsAppender`].
#[derive(Debug)]
pub struct AwsAppenderBuilder {
    config: WriterConfig,
    factory: Box<dyn WriterFactory>,
    thread_factory: Box<dyn ThreadFactory>,
    logger: Arc<dyn InternalLogger>,
    statistics: Arc<WriterStatistics>,
    header: Option<String>,
    footer: Option<String>,
    clock: Clock,
}

impl AwsAppenderBuilder {
    /// Set how writers are run; asynchronous writers get their own thread by
    /// default. Synchronous writers always run on the appending thread.
    pub fn with_thread_factory(
        mut self,
        thread_factory: impl Into<Box<dyn ThreadFactory>>,
    ) -> Self {
        self.thread_factory = thread_factory.into();
        self
    }

    /// Set where the appender and its writers report their own diagnostics.
    pub fn with_internal_logger(mut self, logger: impl Into<Box<dyn InternalLogger>>) -> Self {
        self.logger = Arc::from(logger.into());
        self
    }

    /// Share statistics with another component, such as an exporter.
    pub fn with_statistics(mut self, statistics: Arc<WriterStatistics>) -> Self {
        self.statistics = statistics;
        self
    }

    /// Set a message written first to every new writer.
    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = Some(header.into());
        self
    }

    /// Set a message written last to every writer before it stops.
    pub fn with_footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Build the appender and start its first writer.
    pub fn build(self) -> Result<AwsAppender, Error> {
        let now = self.clock.now_millis();
        let (mode, interval) = self.config.destination.rotation();
        let sequence = self.config.destination.initial_sequence();

        let appender = AwsAppender {
            factory: self.factory,
            thread_factory: self.thread_factory,
            logger: self.logger,
            statistics: self.statistics,
            header: self.header,
            footer: self.footer,
            state: Mutex::new(State {
                config: self.config,
                writer: None,
                sequence,
                rotation: RotationState::new(mode, interval, now),
                clock: self.clock,
                closed: false,
            }),
        };

        {
            let mut state = appender.state();
            let active = appender.start_writer(&state)?;
            state.writer = Some(active);
        }
        Ok(appender)
    }
}

#[cfg(test)]
mod tests {
    use jiff::SignedDuration;
    use jiff::Timestamp;

    use super::*;
    use crate::config::CloudWatchConfig;
    use crate::destination::Destination;

    use super::clock::ManualClock;

    #[derive(Debug, Default)]
    struct Delivered {
        created: Vec<String>,
        messages: Vec<(String, String)>,
        panic_on_init: bool,
        refuse_create: bool,
    }

    #[derive(Debug)]
    struct RecordingDestination {
        name: String,
        delivered: Arc<Mutex<Delivered>>,
    }

    impl Destination for RecordingDestination {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn ensure_available(&mut self) -> Result<(), Error> {
            if self.delivered.lock().unwrap().panic_on_init {
                panic!("cannot initialize");
            }
            Ok(())
        }

        fn send_batch(&mut self, batch: &[LogMessage]) -> Result<Vec<usize>, Error> {
            let mut delivered = self.delivered.lock().unwrap();
            for message in batch {
                delivered
                    .messages
                    .push((self.name.clone(), message.text().to_string()));
            }
            Ok(vec![])
        }

        fn within_service_limits(&self, _: usize, _: usize) -> bool {
            true
        }

        fn max_message_size(&self) -> usize {
            1024
        }
    }

    #[derive(Debug, Clone, Default)]
    struct RecordingFactory(Arc<Mutex<Delivered>>);

    impl RecordingFactory {
        fn delivered(&self) -> MutexGuard<'_, Delivered> {
            self.0.lock().unwrap()
        }

        fn streams(&self) -> Vec<String> {
            self.delivered().created.clone()
        }

        fn messages_in(&self, stream: &str) -> Vec<String> {
            self.delivered()
                .messages
                .iter()
                .filter(|(s, _)| s == stream)
                .map(|(_, text)| text.clone())
                .collect()
        }
    }

    impl WriterFactory for RecordingFactory {
        fn create(
            &self,
            config: &WriterConfig,
            statistics: Arc<WriterStatistics>,
            logger: Arc<dyn InternalLogger>,
        ) -> Result<LogWriter, Error> {
            let crate::config::DestinationConfig::CloudWatch(cloudwatch) = &config.destination
            else {
                return Err(Error::new("unsupported destination"));
            };
            if self.delivered().refuse_create {
                return Err(Error::new("client unavailable"));
            }
            self.delivered().created.push(cloudwatch.log_stream.clone());
            let destination = RecordingDestination {
                name: cloudwatch.log_stream.clone(),
                delivered: self.0.clone(),
            };
            Ok(LogWriter::new(destination, config, statistics, logger))
        }
    }

    fn at(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    fn synchronous(mode: RotationMode, interval: u64) -> WriterConfig {
        let mut config = WriterConfig::new(
            CloudWatchConfig::new("app", "stream-{sequence}").with_rotation(mode, interval),
        );
        config.synchronous = true;
        config
    }

    fn texts(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("message {i}")).collect()
    }

    #[test]
    fn test_count_rotation_fills_each_stream() {
        let factory = RecordingFactory::default();
        let appender = AwsAppender::builder(synchronous(RotationMode::Count, 3), factory.clone())
            .build()
            .unwrap();

        for i in 0..7 {
            appender.append(format!("message {i}"));
        }
        appender.close();

        assert_eq!(factory.streams(), vec!["stream-0", "stream-1", "stream-2"]);
        assert_eq!(factory.messages_in("stream-0"), texts(0..3));
        assert_eq!(factory.messages_in("stream-1"), texts(3..6));
        assert_eq!(factory.messages_in("stream-2"), texts(6..7));
        assert_eq!(appender.sequence(), 2);
    }

    #[test]
    fn test_hourly_rotation_triggers_once_per_boundary() {
        let factory = RecordingFactory::default();
        let clock = Clock::ManualClock(ManualClock::new(at("2024-08-10T17:58:00Z")));
        let appender = AwsAppender::builder(synchronous(RotationMode::Hourly, 0), factory.clone())
            .with_clock(clock)
            .build()
            .unwrap();

        appender.append("before");
        appender.state().clock.set_now(at("2024-08-10T18:00:01Z"));
        for _ in 0..5 {
            appender.append("burst");
        }
        appender.state().clock.advance(SignedDuration::from_mins(59));
        appender.append("same hour");

        assert_eq!(factory.streams(), vec!["stream-0", "stream-1"]);
        assert_eq!(factory.messages_in("stream-0"), vec!["before"]);
        assert_eq!(factory.messages_in("stream-1").len(), 6);
    }

    #[test]
    fn test_header_and_footer_surround_each_stream() {
        let factory = RecordingFactory::default();
        let appender = AwsAppender::builder(synchronous(RotationMode::None, 0), factory.clone())
            .with_header("-- start --")
            .with_footer("-- end --")
            .build()
            .unwrap();

        appender.append("one");
        appender.rotate();
        appender.append("two");
        appender.close();
        appender.append("dropped");

        assert_eq!(
            factory.messages_in("stream-0"),
            vec!["-- start --", "one", "-- end --"]
        );
        assert_eq!(
            factory.messages_in("stream-1"),
            vec!["-- start --", "two", "-- end --"]
        );
    }

    #[test]
    fn test_failed_writer_is_replaced() {
        let factory = RecordingFactory::default();
        factory.delivered().panic_on_init = true;
        let appender = AwsAppender::builder(synchronous(RotationMode::None, 0), factory.clone())
            .build()
            .unwrap();
        assert_eq!(appender.statistics().writer_failures(), 1);

        factory.delivered().panic_on_init = false;
        appender.append("after restart");

        assert_eq!(factory.streams(), vec!["stream-0", "stream-0"]);
        assert_eq!(factory.messages_in("stream-0"), vec!["after restart"]);
        assert_eq!(appender.sequence(), 0);
    }

    #[test]
    fn test_writer_is_recreated_after_factory_recovers() {
        let factory = RecordingFactory::default();
        let appender = AwsAppender::builder(synchronous(RotationMode::Count, 1), factory.clone())
            .build()
            .unwrap();
        appender.append("m0");

        factory.delivered().refuse_create = true;
        appender.append("m1");
        assert!(appender.writer().is_none());
        let last_error = appender.statistics().last_error().unwrap();
        assert_eq!(last_error.message, "failed to create writer");

        factory.delivered().refuse_create = false;
        for i in 2..5 {
            appender.append(format!("m{i}"));
        }
        assert!(appender.writer().is_some());

        assert_eq!(
            factory.streams(),
            vec!["stream-0", "stream-1", "stream-2", "stream-3"]
        );
        assert_eq!(factory.messages_in("stream-0"), vec!["m0"]);
        assert_eq!(factory.messages_in("stream-1"), vec!["m2"]);
        assert_eq!(factory.messages_in("stream-3"), vec!["m4"]);
    }

    #[test]
    fn test_live_settings_reach_writer() {
        let factory = RecordingFactory::default();
        let mut config = synchronous(RotationMode::None, 0);
        config.synchronous = false;
        let appender = AwsAppender::builder(config, factory)
            .with_thread_factory(DefaultThreadFactory::default())
            .build()
            .unwrap();

        appender.set_batch_delay(Duration::from_millis(5));
        appender.set_discard_threshold(7);
        appender.set_discard_action(DiscardAction::Newest);

        let writer = appender.writer().unwrap();
        assert_eq!(writer.batch_delay(), Duration::from_millis(5));
        assert_eq!(writer.queue().discard_threshold(), 7);
        assert_eq!(writer.queue().discard_action(), DiscardAction::Newest);

        appender.close();
        assert!(writer.wait_until_stopped(Duration::ZERO));
    }
}
