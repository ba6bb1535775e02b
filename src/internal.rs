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

//! Diagnostics emitted by the appenders themselves.
//!
//! A writer cannot log through the appender it belongs to, so it reports its own
//! progress and failures to an [`InternalLogger`].

use std::fmt;
use std::io;
use std::io::Write;

use crate::Error;

/// A sink for the appenders' own debug, warning and error messages.
pub trait InternalLogger: fmt::Debug + Send + Sync + 'static {
    /// Report progress useful when troubleshooting.
    fn debug(&self, message: &str);

    /// Report a condition that loses or alters data but is not a failure.
    fn warn(&self, message: &str);

    /// Report a failure, with its cause if any.
    fn error(&self, message: &str, err: Option<&Error>);
}

impl<T: InternalLogger> From<T> for Box<dyn InternalLogger> {
    fn from(value: T) -> Self {
        Box::new(value)
    }
}

/// Writes warnings and errors to standard error.
///
/// Debug messages are dropped unless enabled with [`DefaultInternalLogger::with_debug`].
#[derive(Debug, Default)]
pub struct DefaultInternalLogger {
    debug: bool,
}

impl DefaultInternalLogger {
    /// Set whether debug messages are written.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

impl InternalLogger for DefaultInternalLogger {
    fn debug(&self, message: &str) {
        if self.debug {
            let _ = writeln!(io::stderr(), "logforth-append-aws: DEBUG: {message}");
        }
    }

    fn warn(&self, message: &str) {
        let _ = writeln!(io::stderr(), "logforth-append-aws: WARN: {message}");
    }

    fn error(&self, message: &str, err: Option<&Error>) {
        let _ = match err {
            Some(err) => writeln!(io::stderr(), "logforth-append-aws: ERROR: {message}: {err}"),
            None => writeln!(io::stderr(), "logforth-append-aws: ERROR: {message}"),
        };
    }
}

/// Forwards to the `log` crate macros.
///
/// Do not use this when the appender itself is the `log` crate's backend:
/// the messages would be queued to the very writer reporting them.
#[derive(Debug, Default)]
pub struct LogCrateInternalLogger {}

impl InternalLogger for LogCrateInternalLogger {
    fn debug(&self, message: &str) {
        log::debug!(target: "logforth_append_aws", "{message}");
    }

    fn warn(&self, message: &str) {
        log::warn!(target: "logforth_append_aws", "{message}");
    }

    fn error(&self, message: &str, err: Option<&Error>) {
        match err {
            Some(err) => log::error!(target: "logforth_append_aws", "{message}: {err}"),
            None => log::error!(target: "logforth_append_aws", "{message}"),
        }
    }
}
