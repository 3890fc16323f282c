//! Error types for the chat relay.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable and reportable failure within the relay. Errors that end a
//! client connection map onto a WebSocket close code through
//! [`Error::close_code`].
//!
//! ## Error Cases
//! - `MalformedFrame`: An inbound frame was not valid JSON, missed a field, or
//!   was not a text frame.
//! - `Generation`: The generation engine reported a failure.
//! - `GenerationTimeout`: The generation engine did not answer in time.
//! - `ChannelError`: An internal communication failure between tasks.
//! - `QueueFull`: The inbound queue rejected a message under the `reject`
//!   backpressure policy.
//! - `ServiceShutdown`: A message arrived while the relay was shutting down.

use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// WebSocket close code sent when the relay is going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// WebSocket close code sent on an unexpected server-side failure.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Unified error type for the chat relay.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The inbound frame could not be decoded into a chat message.
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// The generation engine failed to produce a response.
    #[error("Generation failed: {0}")]
    Generation(#[from] EngineError),

    /// The generation engine exceeded the configured deadline.
    #[error("Generation timed out after {after:?}")]
    GenerationTimeout { after: Duration },

    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The inbound queue is at capacity and the policy rejects new work.
    #[error("Inbound queue is full")]
    QueueFull,

    /// The relay is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Returns the close code used when this error terminates a connection.
    pub const fn close_code(&self) -> u16 {
        match self {
            Error::ServiceShutdown => CLOSE_GOING_AWAY,
            _ => CLOSE_INTERNAL_ERROR,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MalformedFrame {
            reason: err.to_string(),
        }
    }
}

/// Failure reported by a [`GenerationEngine`].
///
/// [`GenerationEngine`]: crate::engine::GenerationEngine
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum EngineError {
    /// The completion program could not be started or talked to.
    #[error("failed to run `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    /// The engine ran but reported an error.
    #[error("{reason}")]
    Failed { reason: String },

    /// The engine produced output that is not usable text.
    #[error("invalid output: {reason}")]
    InvalidOutput { reason: String },

    /// The engine panicked while generating.
    #[error("engine panicked")]
    Panicked,
}
