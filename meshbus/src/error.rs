//! Bus error types.

use std::io;
use thiserror::Error;

/// Errors surfaced by the bus.
///
/// Callers of the command API only ever observe [`MeshError::TimedOut`] and
/// [`MeshError::Cancelled`]; everything else is either a startup failure or
/// absorbed internally and logged.
#[derive(Error, Debug)]
pub enum MeshError {
    /// The operation's deadline fired before all replies arrived.
    #[error("operation timed out")]
    TimedOut,

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A request topic has no registered handler. Server-side only: the
    /// caller observes a default-decoded reply, not this error.
    #[error("no handler registered for topic {0:#018x}")]
    NoHandler(u64),

    /// Payload or beacon (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Invalid or unusable configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// An internal queue outlived its consumer.
    #[error("channel closed")]
    ChannelClosed,
}

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, MeshError>;

impl MeshError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<meshbus_wire::WireError> for MeshError {
    fn from(err: meshbus_wire::WireError) -> Self {
        match err {
            meshbus_wire::WireError::Io(io) => Self::Transport(io),
            meshbus_wire::WireError::SocketClosed => Self::ChannelClosed,
            meshbus_wire::WireError::NoPortAvailable { .. } => Self::Config(err.to_string()),
            other => Self::Transport(io::Error::new(io::ErrorKind::InvalidData, other)),
        }
    }
}
