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

use std::cmp::Ordering;

use jiff::Timestamp;

/// A formatted log message, waiting to be sent to a destination.
///
/// Messages compare by timestamp only. Two messages with the same timestamp are
/// equal for ordering purposes, so any sort applied to a batch must be stable to
/// keep their insertion order.
#[derive(Debug, Clone)]
pub struct LogMessage {
    timestamp: Timestamp,
    text: String,
}

impl LogMessage {
    /// Create a new message.
    pub fn new(timestamp: Timestamp, text: impl Into<String>) -> Self {
        Self {
            timestamp,
            text: text.into(),
        }
    }

    /// Create a new message stamped with the current time.
    pub fn now(text: impl Into<String>) -> Self {
        Self::new(Timestamp::now(), text)
    }

    /// The time the message was created.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Milliseconds since the Unix epoch, as the AWS services expect it.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.as_millisecond()
    }

    /// The message text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The UTF-8 encoding of the message text.
    pub fn bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    /// Size of the message in bytes, as UTF-8.
    pub fn size(&self) -> usize {
        self.text.len()
    }

    /// Cut the message to at most `max_bytes` bytes.
    ///
    /// The cut happens at a character boundary, so a message holding multi-byte
    /// characters may end up a few bytes shorter than `max_bytes`.
    pub fn truncate(&mut self, max_bytes: usize) {
        if self.text.len() <= max_bytes {
            return;
        }

        let mut end = max_bytes;
        while !self.text.is_char_boundary(end) {
            end -= 1;
        }
        self.text.truncate(end);
    }
}

impl PartialEq for LogMessage {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
    }
}

impl Eq for LogMessage {}

impl PartialOrd for LogMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp.cmp(&other.timestamp)
    }
}
