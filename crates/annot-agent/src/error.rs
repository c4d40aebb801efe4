//! Error types for annot-agent

use std::fmt;

use thiserror::Error;

/// Result type alias using annot-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Which side of an exchange a handler was asked to process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => f.write_str("request"),
            Direction::Response => f.write_str("response"),
        }
    }
}

/// Errors that end a conversation
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the API layer, surfaced after the queue gave up
    #[error(transparent)]
    Ai(#[from] annot_ai::Error),

    /// The response does not have the shape this engine works with
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A tool call came back without a result in the context
    #[error(
        "Tool call results not found (ID '{0}'). Is a tool handler configured among the response handlers?"
    )]
    MissingToolResult(String),

    /// A handler was placed in a chain it does not support
    #[error("{handler} cannot be used for {direction} handling")]
    UnsupportedDirection { handler: String, direction: Direction },

    /// A handler rejected the request or response
    #[error("{handler}: {message}")]
    Handler { handler: String, message: String },

    /// No constructor registered for a handler type
    #[error("Unknown handler type: {0}")]
    UnknownHandler(String),

    /// Configuration rejected during validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The queue worker is gone
    #[error("Queue '{0}' is closed")]
    QueueClosed(String),

    /// A queued operation panicked
    #[error("Operation panicked in queue '{0}'")]
    QueuePanicked(String),

    /// The entity lookup collaborator failed
    #[error("Entity lookup failed: {0}")]
    Lookup(String),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Writing results failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a handler error
    pub fn handler(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            handler: handler.into(),
            message: message.into(),
        }
    }

    /// Create an unsupported-direction error
    pub fn unsupported(handler: impl Into<String>, direction: Direction) -> Self {
        Self::UnsupportedDirection {
            handler: handler.into(),
            direction,
        }
    }

    /// Check if this error indicates a misconfigured handler chain
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Error::MissingToolResult(_)
                | Error::UnsupportedDirection { .. }
                | Error::UnknownHandler(_)
                | Error::InvalidConfig(_)
        )
    }
}

impl<E> From<crate::queue::QueueError<E>> for Error
where
    E: Into<Error>,
{
    fn from(error: crate::queue::QueueError<E>) -> Self {
        match error {
            crate::queue::QueueError::Closed(name) => Error::QueueClosed(name),
            crate::queue::QueueError::Panicked(name) => Error::QueuePanicked(name),
            crate::queue::QueueError::Operation(e) => e.into(),
        }
    }
}
