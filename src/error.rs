//! Error types for the public API and the wire codec.

use thiserror::Error;

/// Errors surfaced through the [`Node`](crate::Node) handle.
#[derive(Debug, Error)]
pub enum NodeError {
    /// START was issued while the node was already running.
    #[error("node already started")]
    AlreadyStarted,

    /// The inbox or discovery socket could not be bound.
    #[error("failed to bind {what}: {source}")]
    Bind {
        what: String,
        #[source]
        source: std::io::Error,
    },

    /// The node task has terminated; the handle is dead.
    #[error("node task terminated")]
    Terminated,
}

/// Errors produced while decoding beacons or ZRE frames.
///
/// A decode failure drops the offending frame only; it never tears down
/// the connection it arrived on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame truncated")]
    Truncated,

    #[error("bad frame signature")]
    BadSignature,

    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("unknown message id {0}")]
    UnknownId(u8),

    #[error("invalid utf-8 in string field")]
    Utf8,

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),
}
