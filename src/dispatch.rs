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

//! Running a writer's batching loop.

use std::any::Any;
use std::fmt;
use std::panic;
use std::panic::AssertUnwindSafe;

use crate::Error;
use crate::writer::LogWriter;

/// Called with the failure when a writer's loop panics.
pub type FailureHandler = Box<dyn FnOnce(Error) + Send + 'static>;

/// Decides where a writer's [`run`](LogWriter::run) loop executes.
pub trait ThreadFactory: fmt::Debug + Send + Sync + 'static {
    /// Start running `writer`.
    ///
    /// If the loop panics, the failure is recorded in the writer's statistics
    /// and passed to `on_failure`. An `Err` means the writer could not be
    /// started at all.
    fn start(&self, writer: LogWriter, on_failure: FailureHandler) -> Result<(), Error>;
}

impl<T: ThreadFactory> From<T> for Box<dyn ThreadFactory> {
    fn from(value: T) -> Self {
        Box::new(value)
    }
}

/// Runs every writer on its own named thread.
#[derive(Debug)]
pub struct DefaultThreadFactory {
    thread_name: String,
}

impl Default for DefaultThreadFactory {
    fn default() -> Self {
        Self {
            thread_name: "logforth-aws-writer".to_string(),
        }
    }
}

impl DefaultThreadFactory {
    /// Set the name prefix of writer threads; the destination name is appended.
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }
}

impl ThreadFactory for DefaultThreadFactory {
    fn start(&self, writer: LogWriter, on_failure: FailureHandler) -> Result<(), Error> {
        let name = match writer.statistics().destination_name() {
            Some(destination) => format!("{}-{destination}", self.thread_name),
            None => self.thread_name.clone(),
        };

        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_guarded(&writer, on_failure))
            .map(|_| ())
            .map_err(|err| {
                Error::new("failed to spawn writer thread")
                    .with_context("name", name)
                    .with_source(err)
            })
    }
}

/// Runs the writer on the calling thread.
///
/// For a synchronous writer this only initializes the destination. For an
/// asynchronous writer `start` returns once the writer has stopped.
#[derive(Debug, Default)]
pub struct InlineThreadFactory {}

impl ThreadFactory for InlineThreadFactory {
    fn start(&self, writer: LogWriter, on_failure: FailureHandler) -> Result<(), Error> {
        run_guarded(&writer, on_failure);
        Ok(())
    }
}

fn run_guarded(writer: &LogWriter, on_failure: FailureHandler) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| writer.run()));
    if let Err(payload) = result {
        let err = panic_to_error(payload);
        let message = "log writer failed";
        writer.statistics().increment_writer_failures();
        writer.statistics().set_last_error(message, Some(&err));
        writer.logger().error(message, Some(&err));
        on_failure(err);
    }
}

pub(crate) fn panic_to_error(payload: Box<dyn Any + Send>) -> Error {
    let message = match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    };
    Error::new("writer panicked").with_context("panic", message)
}
