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

use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use crossbeam_channel::TryRecvError;
use crossbeam_channel::bounded;

use crate::InternalLogger;
use crate::config::WriterConfig;
use crate::destination::Destination;
use crate::dispatch::panic_to_error;
use crate::message::LogMessage;
use crate::queue::DiscardAction;
use crate::queue::MessageQueue;
use crate::stats::WriterStatistics;

/// Batches queued messages and sends them to a [`Destination`].
///
/// Application threads call [`add_message`](Self::add_message), which never
/// blocks on the destination and never fails. The batching loop in
/// [`run`](Self::run) is driven by a [`ThreadFactory`](crate::ThreadFactory):
/// normally on a dedicated thread, or on the caller's thread for a synchronous
/// writer, in which case every `add_message` sends inline.
///
/// `LogWriter` is a cheap handle; clones share the same queue and destination.
#[derive(Debug, Clone)]
pub struct LogWriter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    queue: MessageQueue,
    destination: Mutex<Box<dyn Destination>>,
    statistics: Arc<WriterStatistics>,
    logger: Arc<dyn InternalLogger>,
    max_message_size: usize,
    truncate_oversize_messages: bool,
    synchronous: bool,
    batch_delay_ms: AtomicU64,
    shutdown_deadline: Mutex<Option<Instant>>,
    available: AtomicBool,
    initialized: Signal,
    stopped: Signal,
}

// A one-shot event: firing drops the sender, which disconnects every waiter.
#[derive(Debug)]
struct Signal {
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Signal {
    fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    fn fire(&self) {
        lock(&self.sender).take();
    }

    fn is_fired(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn wait(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

// Fires its signal when dropped, so waiters are released even if `run` panics.
struct FireOnDrop<'a>(&'a Signal);

impl Drop for FireOnDrop<'_> {
    fn drop(&mut self) {
        self.0.fire();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl LogWriter {
    /// Create a writer sending to `destination`.
    ///
    /// Only the queue, batching and shutdown settings of `config` are used here;
    /// the destination is expected to be built from the same configuration.
    pub fn new(
        destination: impl Into<Box<dyn Destination>>,
        config: &WriterConfig,
        statistics: Arc<WriterStatistics>,
        logger: Arc<dyn InternalLogger>,
    ) -> Self {
        let destination = destination.into();
        statistics.set_destination_name(destination.name());

        Self {
            inner: Arc::new(Inner {
                queue: MessageQueue::new(config.discard_threshold, config.discard_action),
                max_message_size: destination.max_message_size(),
                destination: Mutex::new(destination),
                statistics,
                logger,
                truncate_oversize_messages: config.truncate_oversize_messages,
                synchronous: config.synchronous,
                batch_delay_ms: AtomicU64::new(config.batch_delay_ms),
                shutdown_deadline: Mutex::new(None),
                available: AtomicBool::new(false),
                initialized: Signal::new(),
                stopped: Signal::new(),
            }),
        }
    }

    /// Queue a message for sending.
    ///
    /// Empty messages are ignored. A message larger than the destination allows
    /// is truncated or dropped, depending on configuration.
    pub fn add_message(&self, mut message: LogMessage) {
        let inner = &self.inner;
        if message.size() == 0 {
            return;
        }

        let max_size = inner.max_message_size;
        if message.size() > max_size {
            inner.statistics.increment_oversize_messages();
            if inner.truncate_oversize_messages {
                inner.logger.debug(&format!(
                    "truncating oversize message from {} to {max_size} bytes",
                    message.size()
                ));
                message.truncate(max_size);
            } else {
                inner.logger.warn(&format!(
                    "discarding oversize message of {} bytes",
                    message.size()
                ));
                return;
            }
        }

        inner.queue.enqueue(message);

        if inner.synchronous && inner.initialized.is_fired() && !self.is_stopped() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                self.process_batch(Some(Instant::now()));
            }));
            if let Err(payload) = result {
                let err = panic_to_error(payload);
                let message = "synchronous send panicked";
                inner.statistics.increment_writer_failures();
                inner.statistics.set_last_error(message, Some(&err));
                inner.logger.error(message, Some(&err));
            }
        }
    }

    /// Initialize the destination and, for an asynchronous writer, run the
    /// batching loop until the writer is stopped and drained.
    ///
    /// A synchronous writer returns as soon as it is initialized.
    pub fn run(&self) {
        let inner = &self.inner;
        // a synchronous writer is driven by `add_message` and `stop`
        let _stopped = (!inner.synchronous).then(|| FireOnDrop(&inner.stopped));
        {
            let _initialized = FireOnDrop(&inner.initialized);
            self.initialize();
        }

        if inner.synchronous {
            return;
        }

        loop {
            let deadline = self.shutdown_deadline();
            if deadline.is_some() && inner.queue.is_empty() {
                break;
            }
            let expired = deadline.is_some_and(|d| Instant::now() >= d);

            let progressed = self.process_batch(deadline);
            if expired && !progressed {
                inner.logger.warn(&format!(
                    "shutdown deadline passed with {} unsent messages",
                    inner.queue.len()
                ));
                break;
            }
        }

        self.shutdown_destination();
    }

    /// Ask the writer to stop once the queue is drained.
    ///
    /// The writer gets one more batch delay to send what is queued. Calling
    /// `stop` again has no effect.
    pub fn stop(&self) {
        let inner = &self.inner;
        {
            let mut deadline = lock(&inner.shutdown_deadline);
            if deadline.is_some() {
                return;
            }
            *deadline = Some(Instant::now() + self.batch_delay());
        }
        inner.logger.debug(&format!(
            "stopping log writer for {}",
            inner.statistics.destination_name().unwrap_or_default()
        ));

        if inner.synchronous {
            let _stopped = FireOnDrop(&inner.stopped);
            if inner.initialized.is_fired() {
                while !inner.queue.is_empty() && self.process_batch(Some(Instant::now())) {}
            }
            self.shutdown_destination();
        } else {
            inner.queue.interrupt();
        }
    }

    /// Wait until the writer has checked its destination. Returns `true` if the
    /// destination is available.
    pub fn wait_until_initialized(&self, timeout: Duration) -> bool {
        self.inner.initialized.wait(timeout) && self.inner.available.load(Ordering::Acquire)
    }

    /// Wait until the batching loop has exited and the destination is shut down.
    /// Returns `false` on timeout.
    pub fn wait_until_stopped(&self, timeout: Duration) -> bool {
        self.inner.stopped.wait(timeout)
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        lock(&self.inner.shutdown_deadline).is_some()
    }

    /// Whether messages are sent on the appending thread.
    pub fn is_synchronous(&self) -> bool {
        self.inner.synchronous
    }

    /// The time spent accumulating a batch after its first message.
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.inner.batch_delay_ms.load(Ordering::Acquire))
    }

    /// Change the batch delay; takes effect with the next batch.
    pub fn set_batch_delay(&self, batch_delay: Duration) {
        let millis = u64::try_from(batch_delay.as_millis()).unwrap_or(u64::MAX);
        self.inner.batch_delay_ms.store(millis, Ordering::Release);
    }

    /// Change the queue's discard threshold.
    pub fn set_discard_threshold(&self, discard_threshold: usize) {
        self.inner.queue.set_discard_threshold(discard_threshold);
    }

    /// Change the queue's discard action.
    pub fn set_discard_action(&self, discard_action: DiscardAction) {
        self.inner.queue.set_discard_action(discard_action);
    }

    /// The statistics this writer updates.
    pub fn statistics(&self) -> &Arc<WriterStatistics> {
        &self.inner.statistics
    }

    /// The internal logger of this writer.
    pub fn logger(&self) -> &Arc<dyn InternalLogger> {
        &self.inner.logger
    }

    /// The queue of messages waiting to be sent.
    pub fn queue(&self) -> &MessageQueue {
        &self.inner.queue
    }

    fn shutdown_deadline(&self) -> Option<Instant> {
        *lock(&self.inner.shutdown_deadline)
    }

    fn initialize(&self) {
        let inner = &self.inner;
        let result = lock(&inner.destination).ensure_available();

        match result {
            Ok(()) => {
                inner.available.store(true, Ordering::Release);
                inner.logger.debug(&format!(
                    "log writer initialized for {}",
                    inner.statistics.destination_name().unwrap_or_default()
                ));
            }
            Err(err) => {
                inner.queue.set_discard_threshold(0);
                inner.queue.set_discard_action(DiscardAction::Oldest);
                while inner.queue.try_dequeue().is_some() {}

                let message = "unable to configure destination, discarding all messages";
                inner.statistics.set_last_error(message, Some(&err));
                inner.logger.error(message, Some(&err));
            }
        }
    }

    // Build and send one batch. Returns `false` if messages were waiting but
    // none of them could be delivered.
    fn process_batch(&self, wait_until: Option<Instant>) -> bool {
        let inner = &self.inner;
        let batch = self.build_batch(wait_until);
        if batch.is_empty() {
            return true;
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            lock(&inner.destination).send_batch(&batch)
        }))
        .unwrap_or_else(|payload| Err(panic_to_error(payload)));
        match result {
            Ok(mut failed) => {
                let batch_len = batch.len();
                failed.sort_unstable();
                failed.dedup();
                let mut failed = failed.into_iter().peekable();
                let retry = batch
                    .into_iter()
                    .enumerate()
                    .filter_map(|(i, message)| failed.next_if_eq(&i).map(|_| message))
                    .collect::<Vec<_>>();

                let requeued = retry.len();
                inner.statistics.update_batch(batch_len - requeued, requeued);
                if requeued > 0 {
                    inner.logger.debug(&format!(
                        "requeueing {requeued} of {batch_len} messages"
                    ));
                    inner.queue.requeue_all(retry);
                }
                requeued < batch_len
            }
            Err(err) => {
                inner.statistics.update_batch(0, batch.len());
                let message = "failed to send batch";
                inner.statistics.set_last_error(message, Some(&err));
                inner.logger.error(message, Some(&err));
                inner.queue.requeue_all(batch);
                false
            }
        }
    }

    fn build_batch(&self, wait_until: Option<Instant>) -> Vec<LogMessage> {
        let inner = &self.inner;
        let Some(first) = inner.queue.dequeue_until(wait_until) else {
            return vec![];
        };

        let destination = lock(&inner.destination);
        let mut batch_bytes = destination.effective_size(&first);
        let mut batch = vec![first];

        let accumulate_until = if inner.synchronous {
            Instant::now()
        } else {
            let end = Instant::now() + self.batch_delay();
            match self.shutdown_deadline() {
                Some(deadline) => end.min(deadline),
                None => end,
            }
        };

        while let Some(message) = inner.queue.dequeue_until(Some(accumulate_until)) {
            let size = destination.effective_size(&message);
            if !destination.within_service_limits(batch_bytes + size, batch.len() + 1) {
                inner.queue.requeue(message);
                break;
            }
            batch_bytes += size;
            batch.push(message);
        }

        batch
    }

    fn shutdown_destination(&self) {
        let inner = &self.inner;
        lock(&inner.destination).shutdown();
        inner.logger.debug(&format!(
            "log writer stopped for {}",
            inner.statistics.destination_name().unwrap_or_default()
        ));
    }
}
