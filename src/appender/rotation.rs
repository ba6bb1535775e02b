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

use serde::Deserialize;

const MILLIS_PER_HOUR: i64 = 60 * 60 * 1000;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// When an appender switches to a new log stream.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationMode {
    /// Never rotate.
    #[default]
    None,
    /// Rotate after `rotation_interval` messages.
    Count,
    /// Rotate when `rotation_interval` milliseconds have passed since the last
    /// rotation.
    Interval,
    /// Rotate at the top of every hour, UTC.
    Hourly,
    /// Rotate at midnight, UTC.
    Daily,
}

#[derive(Debug)]
pub(crate) struct RotationState {
    mode: RotationMode,
    interval: u64,
    messages_since_rotation: u64,
    last_rotation_millis: i64,
}

impl RotationState {
    pub(crate) fn new(mode: RotationMode, interval: u64, now_millis: i64) -> Self {
        Self {
            mode,
            interval,
            messages_since_rotation: 0,
            last_rotation_millis: now_millis,
        }
    }

    pub(crate) fn should_rotate(&self, now: i64) -> bool {
        match self.mode {
            RotationMode::None => false,
            RotationMode::Count => {
                self.interval > 0 && self.messages_since_rotation >= self.interval
            }
            RotationMode::Interval => {
                self.interval > 0
                    && i128::from(now) - i128::from(self.last_rotation_millis)
                        > i128::from(self.interval)
            }
            RotationMode::Hourly => self.crossed(now, MILLIS_PER_HOUR),
            RotationMode::Daily => self.crossed(now, MILLIS_PER_DAY),
        }
    }

    pub(crate) fn record_message(&mut self) {
        self.messages_since_rotation += 1;
    }

    pub(crate) fn reset(&mut self, now_millis: i64) {
        self.messages_since_rotation = 0;
        self.last_rotation_millis = now_millis;
    }

    fn crossed(&self, now: i64, period: i64) -> bool {
        self.last_rotation_millis.div_euclid(period) != now.div_euclid(period)
    }
}
