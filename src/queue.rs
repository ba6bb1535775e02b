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

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::message::LogMessage;

/// What to drop when the queue grows past its discard threshold.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardAction {
    /// Never drop; the queue is unbounded.
    None,
    /// Drop the oldest queued messages.
    #[default]
    Oldest,
    /// Drop the incoming messages.
    Newest,
}

impl fmt::Display for DiscardAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscardAction::None => f.write_str("none"),
            DiscardAction::Oldest => f.write_str("oldest"),
            DiscardAction::Newest => f.write_str("newest"),
        }
    }
}

impl FromStr for DiscardAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(DiscardAction::None),
            "oldest" => Ok(DiscardAction::Oldest),
            "newest" => Ok(DiscardAction::Newest),
            _ => Err(Error::new("invalid discard action").with_context("value", s)),
        }
    }
}

/// A thread-safe FIFO of log messages with a discard policy.
///
/// Producers call [`enqueue`](Self::enqueue) from any thread. A single consumer
/// takes messages with [`dequeue`](Self::dequeue) and can give back the ones it
/// failed to send with [`requeue_all`](Self::requeue_all), which places them
/// ahead of everything enqueued since.
#[derive(Debug)]
pub struct MessageQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

#[derive(Debug)]
struct QueueState {
    messages: VecDeque<LogMessage>,
    discard_threshold: usize,
    discard_action: DiscardAction,
    interrupted: bool,
}

impl MessageQueue {
    /// Create a new queue.
    pub fn new(discard_threshold: usize, discard_action: DiscardAction) -> Self {
        Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                discard_threshold,
                discard_action,
                interrupted: false,
            }),
            available: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The current discard threshold.
    pub fn discard_threshold(&self) -> usize {
        self.state().discard_threshold
    }

    /// Set the discard threshold; applied on the next enqueue.
    pub fn set_discard_threshold(&self, discard_threshold: usize) {
        self.state().discard_threshold = discard_threshold;
    }

    /// The current discard action.
    pub fn discard_action(&self) -> DiscardAction {
        self.state().discard_action
    }

    /// Set the discard action; applied on the next enqueue.
    pub fn set_discard_action(&self, discard_action: DiscardAction) {
        self.state().discard_action = discard_action;
    }

    /// Append a message, then apply the discard policy.
    pub fn enqueue(&self, message: LogMessage) {
        let mut state = self.state();
        state.messages.push_back(message);

        let threshold = state.discard_threshold;
        if state.messages.len() > threshold {
            match state.discard_action {
                DiscardAction::None => {}
                DiscardAction::Oldest => {
                    let excess = state.messages.len() - threshold;
                    state.messages.drain(..excess);
                }
                DiscardAction::Newest => state.messages.truncate(threshold),
            }
        }

        drop(state);
        self.available.notify_one();
    }

    /// Put a single message back at the head of the queue.
    pub fn requeue(&self, message: LogMessage) {
        self.requeue_all(vec![message]);
    }

    /// Put messages back at the head of the queue; the first one becomes the head.
    ///
    /// The discard policy is not applied: these messages were already accepted.
    pub fn requeue_all(&self, messages: Vec<LogMessage>) {
        if messages.is_empty() {
            return;
        }

        let mut state = self.state();
        for message in messages.into_iter().rev() {
            state.messages.push_front(message);
        }

        drop(state);
        self.available.notify_one();
    }

    /// Take the oldest message, waiting up to `wait` for one to arrive.
    ///
    /// Returns `None` on timeout, or when [`interrupt`](Self::interrupt) is called
    /// while the queue is empty.
    pub fn dequeue(&self, wait: Duration) -> Option<LogMessage> {
        self.dequeue_until(Instant::now().checked_add(wait))
    }

    /// Take the oldest message, waiting until one arrives or the queue is interrupted.
    pub fn dequeue_blocking(&self) -> Option<LogMessage> {
        self.dequeue_until(None)
    }

    pub(crate) fn dequeue_until(&self, deadline: Option<Instant>) -> Option<LogMessage> {
        let mut state = self.state();
        loop {
            if let Some(message) = state.messages.pop_front() {
                return Some(message);
            }
            if state.interrupted {
                state.interrupted = false;
                return None;
            }

            state = match deadline {
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Take the oldest message if there is one, without waiting.
    pub fn try_dequeue(&self) -> Option<LogMessage> {
        self.state().messages.pop_front()
    }

    /// Wake the consumer blocked in `dequeue`; it returns `None` once.
    ///
    /// If no consumer is waiting, the next empty-queue `dequeue` returns
    /// immediately instead.
    pub fn interrupt(&self) {
        self.state().interrupted = true;
        self.available.notify_all();
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.state().messages.len()
    }

    /// Whether the queue holds no messages.
    pub fn is_empty(&self) -> bool {
        self.state().messages.is_empty()
    }

    /// A copy of the queued messages, head first.
    pub fn to_vec(&self) -> Vec<LogMessage> {
        self.state().messages.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn fill(queue: &MessageQueue, count: usize) {
        for i in 0..count {
            queue.enqueue(LogMessage::now(format!("message {i}")));
        }
    }

    fn texts(queue: &MessageQueue) -> Vec<String> {
        queue
            .to_vec()
            .iter()
            .map(|m| m.text().to_string())
            .collect()
    }

    fn expected(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("message {i}")).collect()
    }

    #[test]
    fn test_discard_oldest() {
        let queue = MessageQueue::new(10, DiscardAction::Oldest);
        fill(&queue, 20);
        assert_eq!(queue.len(), 10);
        assert_eq!(texts(&queue), expected(10..20));
    }

    #[test]
    fn test_discard_newest() {
        let queue = MessageQueue::new(10, DiscardAction::Newest);
        fill(&queue, 20);
        assert_eq!(queue.len(), 10);
        assert_eq!(texts(&queue), expected(0..10));
    }

    #[test]
    fn test_discard_none() {
        let queue = MessageQueue::new(10, DiscardAction::None);
        fill(&queue, 20);
        assert_eq!(texts(&queue), expected(0..20));
    }

    #[test]
    fn test_reconfigure_applies_on_next_enqueue() {
        let queue = MessageQueue::new(100, DiscardAction::Oldest);
        fill(&queue, 20);

        queue.set_discard_threshold(5);
        assert_eq!(queue.len(), 20);

        queue.enqueue(LogMessage::now("message 20"));
        assert_eq!(texts(&queue), expected(16..21));

        queue.set_discard_action(DiscardAction::Newest);
        queue.enqueue(LogMessage::now("message 21"));
        assert_eq!(texts(&queue), expected(16..21));
    }

    #[test]
    fn test_zero_threshold_drops_everything() {
        let queue = MessageQueue::new(0, DiscardAction::Oldest);
        fill(&queue, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_goes_ahead_of_later_messages() {
        let queue = MessageQueue::new(100, DiscardAction::Oldest);
        fill(&queue, 4);

        let batch = (0..4)
            .map(|_| queue.try_dequeue().unwrap())
            .collect::<Vec<_>>();
        queue.enqueue(LogMessage::now("message 4"));

        let failed = vec![batch[1].clone(), batch[3].clone()];
        queue.requeue_all(failed);

        assert_eq!(
            texts(&queue),
            vec!["message 1", "message 3", "message 4"]
        );
    }

    #[test]
    fn test_requeue_ignores_discard_threshold() {
        let queue = MessageQueue::new(2, DiscardAction::Oldest);
        fill(&queue, 2);
        queue.requeue_all(vec![LogMessage::now("a"), LogMessage::now("b")]);
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_dequeue_times_out() {
        let queue = MessageQueue::new(10, DiscardAction::Oldest);
        let start = Instant::now();
        assert!(queue.dequeue(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(MessageQueue::new(10, DiscardAction::Oldest));

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.dequeue(Duration::from_secs(10)))
        };

        thread::sleep(Duration::from_millis(50));
        queue.enqueue(LogMessage::now("wake up"));

        let message = consumer.join().unwrap().unwrap();
        assert_eq!(message.text(), "wake up");
    }

    #[test]
    fn test_interrupt_releases_blocked_consumer_once() {
        let queue = Arc::new(MessageQueue::new(10, DiscardAction::Oldest));

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.dequeue_blocking())
        };

        thread::sleep(Duration::from_millis(50));
        queue.interrupt();
        assert!(consumer.join().unwrap().is_none());

        // the interrupt was consumed, so this one waits for its timeout again
        let start = Instant::now();
        assert!(queue.dequeue(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_many_producers_one_consumer() {
        let queue = Arc::new(MessageQueue::new(10_000, DiscardAction::None));

        let producers = (0..4)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        queue.enqueue(LogMessage::now(format!("{p}-{i}")));
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut received = 0;
        while received < 1000 {
            if queue.dequeue(Duration::from_secs(5)).is_some() {
                received += 1;
            } else {
                panic!("lost a wake-up after {received} messages");
            }
        }

        for producer in producers {
            producer.join().unwrap();
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_parse_discard_action() {
        assert_eq!("OLDEST".parse::<DiscardAction>().unwrap(), DiscardAction::Oldest);
        assert_eq!("newest".parse::<DiscardAction>().unwrap(), DiscardAction::Newest);
        assert_eq!(" none ".parse::<DiscardAction>().unwrap(), DiscardAction::None);
        assert!("sometimes".parse::<DiscardAction>().is_err());
    }
}
