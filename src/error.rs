//! Error types for wzrpc.

use thiserror::Error;

/// Main error type for transport, pool and registration failures.
///
/// Failures that happen while dispatching a single request on the server are
/// not represented here: they travel back to the caller inside the response
/// envelope and surface on the client side as [`Error::Remote`].
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer closed the stream before a full message arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The message framing was violated.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A pool was configured with a capacity of zero.
    #[error("invalid capacity")]
    InvalidCapacity,

    /// A pool was built without a connection factory.
    #[error("invalid factory")]
    InvalidFactory,

    /// The pool has been closed.
    #[error("pool has closed")]
    PoolClosed,

    /// The call did not complete in time. The connection is now unusable.
    #[error("call timeout")]
    CallTimeout,

    /// The server answered with a non-empty `err`.
    #[error("{0}")]
    Remote(String),

    /// The service type has no usable bare name.
    #[error("invalid service name: {0:?}")]
    InvalidServiceName(String),

    /// None of the candidate methods of a service qualified.
    #[error("no exported method on service {0}")]
    NoExportedMethod(String),

    /// A spawned call task failed before producing a result.
    #[error("call task failed: {0}")]
    TaskFailed(String),
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
