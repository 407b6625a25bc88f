//! Error types for the engine bridge.

use std::sync::Arc;

use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur while talking to the engine host.
///
/// `Clone` so a terminal error can be remembered and resurfaced (a failed
/// query result reports the same error on every later poll); the one
/// non-clonable source is shared behind an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// Invalid or contradictory open/coercion options.
    ///
    /// Detected locally at open time, or at decode time when an active
    /// coercion has no supported source/target pair.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Host/bridge desynchronization: unmatched correlation id or a
    /// malformed message. Fatal for the channel that observed it.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The engine reported a SQL/execution failure. Propagated verbatim to
    /// the caller of the specific request; other in-flight requests are
    /// unaffected.
    #[error("engine error: {message} (code: {code})")]
    Engine {
        /// Error code reported by the engine host.
        code: String,
        /// Human-readable error message.
        message: String,
    },

    /// Operation attempted on a closed connection or a database that is not
    /// open (or opened twice).
    #[error("invalid state: {0}")]
    State(String),

    /// Virtual file operation failure, including `drop_files` while a query
    /// is still in flight.
    #[error("resource error: {0}")]
    Resource(String),

    /// The request was cancelled before the host finished it.
    #[error("query cancelled")]
    Cancelled,

    /// The transport to the engine host is gone.
    #[error("engine host channel closed")]
    ChannelClosed,

    /// Failed to decode a columnar result buffer.
    #[error("failed to decode record batch: {0}")]
    Decode(#[source] Arc<arrow::error::ArrowError>),

    /// A typed column accessor did not match the decoded column type.
    #[error("column type mismatch: {0}")]
    TypeMismatch(String),
}

impl BridgeError {
    /// Create an engine error from a host error descriptor.
    pub fn engine(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Engine {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a state error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    /// Create a protocol violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Check if this error means the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error indicates the host is unreachable.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::ChannelClosed)
    }
}

impl From<arrow::error::ArrowError> for BridgeError {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::Decode(Arc::new(err))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for BridgeError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}
