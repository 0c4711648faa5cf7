//! Error types for the request-lifetime harness.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Message surfaced on every abort-caused failure, on either side of the
/// response head.
pub const ABORT_MESSAGE: &str = "The application aborted the request.";

/// Where in the response the abort was observed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortStage {
    /// No header bytes were ever committed.
    BeforeHeaders,
    /// Headers were committed; the body was cut short.
    DuringBody,
}

/// The canonical abort failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{}", ABORT_MESSAGE)]
pub struct RequestAborted {
    stage: AbortStage,
    bytes_received: usize,
}

impl RequestAborted {
    pub(crate) fn new(stage: AbortStage) -> Self {
        Self {
            stage,
            bytes_received: 0,
        }
    }

    pub(crate) fn with_bytes_received(mut self, bytes_received: usize) -> Self {
        self.bytes_received = bytes_received;
        self
    }

    /// Stage at which the client observed the abort.
    #[inline]
    pub fn stage(&self) -> AbortStage {
        self.stage
    }

    /// Body bytes the client received before the abort. These bytes are
    /// intact; always `0` for [`AbortStage::BeforeHeaders`].
    #[inline]
    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }
}

/// Main error type for all harness operations.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The application aborted before any response was promised.
    #[error(transparent)]
    Aborted(RequestAborted),

    /// The application aborted while the body was being delivered.
    #[error("Error while copying content to a stream.")]
    BodyRead(#[source] RequestAborted),

    /// Write or read attempted on a stream already cut by an abort.
    #[error("The response stream was closed by an abort")]
    StreamClosed,

    /// Use of a channel that already reached a non-abort terminal state.
    #[error("Channel misuse: {0}")]
    ChannelMisuse(&'static str),

    /// Response head changed after it was committed.
    #[error("Headers are read-only, response has already started")]
    HeadersSent,

    /// Response status was not a success code.
    #[error("Response status code does not indicate success: {0}")]
    Status(StatusCode),

    /// Malformed request (URI, header name or value).
    #[error("Invalid request: {0}")]
    Http(#[from] http::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error while loading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Driver-side wait exceeded its bound.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl HarnessError {
    /// Innermost abort failure, if this error was caused by one.
    pub fn request_aborted(&self) -> Option<&RequestAborted> {
        match self {
            HarnessError::Aborted(inner) | HarnessError::BodyRead(inner) => Some(inner),
            _ => None,
        }
    }

    /// Whether this error was caused by an application abort.
    #[inline]
    pub fn is_abort(&self) -> bool {
        self.request_aborted().is_some()
    }

    /// Message of the innermost cause, walking the `source` chain.
    pub fn root_message(&self) -> String {
        let mut current: &dyn std::error::Error = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current.to_string()
    }
}

/// Result type alias using HarnessError.
pub type Result<T> = std::result::Result<T, HarnessError>;
