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

//! Substitution of `{token}` placeholders in destination names.
//!
//! | Token | Value |
//! |---|---|
//! | `{date}` | `yyyyMMdd`, UTC |
//! | `{timestamp}` | `yyyyMMddHHmmss`, UTC |
//! | `{hourlyTimestamp}` | `yyyyMMddHH0000`, UTC |
//! | `{startupTimestamp}` | `yyyyMMddHHmmss` of the first substitution in this process |
//! | `{pid}` | the process id |
//! | `{sequence}` | the rotation sequence number |
//! | `{env:NAME}` | the environment variable `NAME` |
//!
//! Unknown tokens, and `{env:NAME}` for unset variables, are left as they are.

use std::sync::OnceLock;

use jiff::Timestamp;
use jiff::tz::TimeZone;

fn startup_timestamp() -> Timestamp {
    static STARTUP: OnceLock<Timestamp> = OnceLock::new();
    *STARTUP.get_or_init(Timestamp::now)
}

/// Values for the substitution tokens, captured at one point in time.
#[derive(Debug, Clone)]
pub struct Substitutions {
    now: Timestamp,
    startup: Timestamp,
    sequence: u64,
}

impl Substitutions {
    /// Capture substitution values for the given time and rotation sequence.
    pub fn new(now: Timestamp, sequence: u64) -> Self {
        Self {
            now,
            startup: startup_timestamp(),
            sequence,
        }
    }

    /// Replace every known token in `template`.
    pub fn apply(&self, template: &str) -> String {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find('{') {
            output.push_str(&rest[..start]);
            let candidate = &rest[start..];

            let Some(end) = candidate.find('}') else {
                output.push_str(candidate);
                return output;
            };

            let token = &candidate[1..end];
            // an inner `{` starts the token
            if let Some(inner) = token.rfind('{') {
                output.push_str(&candidate[..=inner]);
                rest = &candidate[inner + 1..];
                continue;
            }
            match self.lookup(token) {
                Some(value) => output.push_str(&value),
                None => output.push_str(&candidate[..=end]),
            }
            rest = &candidate[end + 1..];
        }

        output.push_str(rest);
        output
    }

    fn lookup(&self, token: &str) -> Option<String> {
        let now = self.now.to_zoned(TimeZone::UTC);
        match token {
            "date" => Some(now.strftime("%Y%m%d").to_string()),
            "timestamp" => Some(now.strftime("%Y%m%d%H%M%S").to_string()),
            "hourlyTimestamp" => Some(now.strftime("%Y%m%d%H0000").to_string()),
            "startupTimestamp" => Some(
                self.startup
                    .to_zoned(TimeZone::UTC)
                    .strftime("%Y%m%d%H%M%S")
                    .to_string(),
            ),
            "pid" => Some(std::process::id().to_string()),
            "sequence" => Some(self.sequence.to_string()),
            _ => {
                let name = token.strip_prefix("env:")?;
                std::env::var(name).ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn substitutions() -> Substitutions {
        let now = "2024-08-10T17:12:52Z".parse::<Timestamp>().unwrap();
        Substitutions::new(now, 42)
    }

    #[test]
    fn test_time_tokens() {
        let subs = substitutions();
        assert_eq!(subs.apply("{date}"), "20240810");
        assert_eq!(subs.apply("{timestamp}"), "20240810171252");
        assert_eq!(subs.apply("{hourlyTimestamp}"), "20240810170000");
        assert_eq!(subs.apply("{startupTimestamp}").len(), 14);
    }

    #[test]
    fn test_mixed_template() {
        let subs = substitutions();
        assert_eq!(
            subs.apply("app/{date}/stream-{sequence}"),
            "app/20240810/stream-42"
        );
        assert_eq!(
            subs.apply("{pid}-x"),
            format!("{}-x", std::process::id())
        );
    }

    #[test]
    fn test_env_token() {
        let subs = substitutions();
        let path = std::env::var("PATH").unwrap_or_else(|_| "{env:PATH}".to_string());
        assert_eq!(subs.apply("{env:PATH}"), path);
        assert_eq!(
            subs.apply("{env:LOGFORTH_SURELY_NOT_SET_ANYWHERE}"),
            "{env:LOGFORTH_SURELY_NOT_SET_ANYWHERE}"
        );
    }

    #[test]
    fn test_unknown_and_malformed_tokens_are_kept() {
        let subs = substitutions();
        assert_eq!(subs.apply("{nope}-{date}"), "{nope}-20240810");
        assert_eq!(subs.apply("dangling {date"), "dangling {date");
        assert_eq!(subs.apply("no tokens"), "no tokens");
        assert_eq!(subs.apply("{x{date}}"), "{x20240810}");
        assert_eq!(subs.apply("{{sequence}"), "{42");
        assert_eq!(subs.apply(""), "");
    }
}
