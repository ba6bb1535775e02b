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

/// The error struct of the AWS appenders.
///
/// An error carries a message, an ordered list of key/value context, and the
/// underlying causes. Writers never return these to the thread that appends a
/// message; they end up in [`WriterStatistics`](crate::stats::WriterStatistics)
/// and the [`InternalLogger`](crate::InternalLogger).
pub struct Error {
    message: String,
    sources: Vec<anyhow::Error>,
    context: Vec<(&'static str, String)>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;

        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            write!(
                f,
                "{}",
                self.context
                    .iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )?;
            write!(f, " }}")?;
        }

        if !self.sources.is_empty() {
            write!(f, ", sources: [")?;
            for (i, source) in self.sources.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{source}")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // If alternate has been specified, we will print like Debug.
        if f.alternate() {
            let mut de = f.debug_struct("Error");
            de.field("message", &self.message);
            de.field("context", &self.context);
            de.field("sources", &self.sources);
            return de.finish();
        }

        write!(f, "{}", self.message)?;
        writeln!(f)?;

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "   {k}: {v}")?;
            }
        }
        if !self.sources.is_empty() {
            writeln!(f)?;
            writeln!(f, "Sources:")?;
            for source in self.sources.iter() {
                writeln!(f, "   {source:#}")?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.sources.first().map(|v| v.as_ref())
    }
}

impl Error {
    /// Create a new Error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sources: vec![],
            context: vec![],
        }
    }

    /// Add one more context in error.
    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Add one more source in error.
    pub fn with_source(mut self, src: impl Into<anyhow::Error>) -> Self {
        self.sources.push(src.into());
        self
    }

    /// Return the message of this error, without context or sources.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Return an iterator over all sources of this error.
    pub fn sources(&self) -> impl ExactSizeIterator<Item = &(dyn std::error::Error + 'static)> {
        self.sources.iter().map(|v| v.as_ref())
    }

    /// Render the full cause chain of every source, outermost first.
    pub fn causes(&self) -> Vec<String> {
        self.sources
            .iter()
            .flat_map(|source| source.chain().map(|cause| cause.to_string()))
            .collect()
    }
}

/// The kind of failure reported by an AWS service client.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ServiceErrorKind {
    /// The request was throttled; retrying later is expected to succeed.
    Throttled,
    /// The named resource does not exist.
    ResourceNotFound,
    /// The resource being created already exists.
    ResourceAlreadyExists,
    /// The resource exists but is not ready for this operation yet.
    ResourceInUse,
    /// CloudWatch Logs rejected the sequence token.
    InvalidSequenceToken,
    /// CloudWatch Logs has already accepted this batch.
    DataAlreadyAccepted,
    /// A request parameter was rejected.
    InvalidParameter,
    /// Any other failure.
    Other,
}

/// An error returned by one of the AWS client traits.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ServiceError {
    kind: ServiceErrorKind,
    message: String,
}

impl ServiceError {
    /// Create a new service error.
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shortcut for a [`ServiceErrorKind::Throttled`] error.
    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Throttled, message)
    }

    /// Shortcut for a [`ServiceErrorKind::ResourceNotFound`] error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::ResourceNotFound, message)
    }

    /// Shortcut for a [`ServiceErrorKind::Other`] error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Other, message)
    }

    /// The kind of this error.
    pub fn kind(&self) -> ServiceErrorKind {
        self.kind
    }

    /// The message reported by the service.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ServiceErrorKind::Throttled | ServiceErrorKind::ResourceInUse
        )
    }
}
