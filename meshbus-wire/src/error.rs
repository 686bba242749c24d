use std::io;
use thiserror::Error;

/// Errors raised by the wire layer.
#[derive(Error, Debug)]
pub enum WireError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Frame header carries reserved flag bits
    #[error("protocol violation: reserved bits set")]
    ReservedBits,

    /// Frame body exceeds the configured maximum
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Malformed traffic that is not attributable to a single frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The socket handle outlived its connection
    #[error("socket closed")]
    SocketClosed,

    /// No port in the probed range could be bound
    #[error("no bindable port in range starting at {base} (span {span})")]
    NoPortAvailable { base: u16, span: u16 },
}

/// Result type alias for wire operations
pub type Result<T> = std::result::Result<T, WireError>;

impl WireError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True when the error indicates the peer connection is gone.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Io(_) | Self::SocketClosed)
    }
}
