use std::io;

use emubus_proto::WireError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("socket error: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("transport is not listening")]
    NotListening,

    #[error("no peer connection")]
    NotConnected,

    #[error("already attached to a peer")]
    AlreadyAttached,

    #[error("operation would block")]
    WouldBlock,

    /// The peer closed the connection cleanly (zero-byte read).
    #[error("peer disconnected")]
    Disconnected,

    /// A short read or write mid-message; the stream is no longer framed.
    #[error("connection reset mid-message")]
    ConnectionReset,

    #[error("ancillary descriptor data was truncated")]
    TruncatedAncillary,

    #[error("message carries {got} descriptors, limit is {max}")]
    TooManyFds { got: usize, max: usize },

    #[error("body buffer is {got} bytes, header declares {expected}")]
    BodyLengthMismatch { expected: usize, got: usize },

    #[error("version negotiation failed: {0}")]
    Negotiation(WireError),

    #[error("peer opened with command {command:#x} instead of a version exchange")]
    UnexpectedNegotiationCommand { command: u16 },
}
