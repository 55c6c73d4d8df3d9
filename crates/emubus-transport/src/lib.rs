//! Unix-socket transport for the emubus device-emulation protocol.
//!
//! Frames [`emubus_proto`] messages over a `SOCK_STREAM` Unix socket,
//! carrying file descriptors as `SCM_RIGHTS` ancillary data alongside the
//! header. The accepting side binds, attaches one peer at a time (version
//! negotiation included), serves commands, and can detach and re-attach
//! without rebinding.
//!
//! Framing is strict: a short read or write mid-message means the stream can
//! no longer be trusted and the peer is dropped.

mod error;
mod session;
mod sock;

pub use error::{Result, TransportError};
pub use session::Transport;

pub use emubus_proto::{Envelope, HeaderFlags, Limits, MessageKind, Opcode, Version, WireError};
