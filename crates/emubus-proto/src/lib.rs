//! Wire envelope codec for the emubus device-emulation transport.
//!
//! This crate is the pure framing layer: it builds and parses the fixed
//! message header, validates reply correlation, and knows nothing about
//! sockets or file descriptors. The transport crate owns all I/O.
//!
//! Wire format (all fields native-endian, transmitted as raw bytes):
//!
//! ```text
//! 0               2               4               8               12
//! +---------------+---------------+---------------+---------------+
//! | msg_id (u16)  | command (u16) | msg_size (u32)| flags (u32)   |
//! +---------------+---------------+---------------+---------------+
//! | error (u32)   |  header (16 bytes), then msg_size - 16 body bytes
//! +---------------+
//! ```
//!
//! `msg_size` always includes the header. Bits 0..=3 of `flags` carry the
//! message type (0 = command, 1 = reply); bit 5 is the error flag, in which
//! case `error` holds a non-zero error code.

use bitflags::bitflags;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WireError>;

/// Size of the fixed wire header in bytes.
pub const HEADER_LEN: usize = 16;

/// Default ceiling on a whole message (header + body) enforced on decode.
pub const DEFAULT_MAX_MSG_SIZE: usize = 64 * 1024;

/// Default ceiling on ancillary file descriptors accepted per message.
pub const DEFAULT_MAX_MSG_FDS: usize = 16;

/// Protocol version offered and required by this implementation.
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

const TYPE_MASK: u32 = 0xF;
const TYPE_COMMAND: u32 = 0;
const TYPE_REPLY: u32 = 1;

/// Error code carried on an error reply whose peer supplied a zero or
/// negative code.
pub const GENERIC_ERROR_CODE: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_msg_size: usize,
    pub max_msg_fds: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            max_msg_fds: DEFAULT_MAX_MSG_FDS,
        }
    }
}

bitflags! {
    /// Header flag bits outside the 4-bit type field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        const NO_REPLY = 1 << 4;
        const ERROR = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Command,
    Reply,
}

/// Known command opcodes.
///
/// The framer itself never rejects an unknown opcode; interpretation belongs
/// to the dispatch layer, so [`Envelope::command`] stays a raw `u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Version = 1,
    AttachMemory = 2,
    DetachMemory = 3,
    DeviceInfo = 4,
    RegionInfo = 5,
    RegionRead = 6,
    RegionWrite = 7,
    DmaRead = 8,
    DmaWrite = 9,
    DirtyLog = 10,
    Reset = 11,
}

impl Opcode {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => Opcode::Version,
            2 => Opcode::AttachMemory,
            3 => Opcode::DetachMemory,
            4 => Opcode::DeviceInfo,
            5 => Opcode::RegionInfo,
            6 => Opcode::RegionRead,
            7 => Opcode::RegionWrite,
            8 => Opcode::DmaRead,
            9 => Opcode::DmaWrite,
            10 => Opcode::DirtyLog,
            11 => Opcode::Reset,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("header too short: {len} < {HEADER_LEN}")]
    HeaderTooShort { len: usize },

    #[error("msg_size {size} smaller than header")]
    SizeBelowHeader { size: u32 },

    #[error("msg_size {size} exceeds limit {max}")]
    SizeExceedsLimit { size: u32, max: usize },

    #[error("body of {len} bytes exceeds limit {max}")]
    BodyTooLarge { len: usize, max: usize },

    #[error("unknown message type {raw:#x}")]
    UnknownType { raw: u32 },

    #[error("expected a {expected:?} message, got {got:?}")]
    WrongType {
        expected: MessageKind,
        got: MessageKind,
    },

    #[error("reply msg_id {got:#x} does not match outstanding request {expected:#x}")]
    MessageIdMismatch { expected: u16, got: u16 },

    #[error("peer replied with error code {code}")]
    PeerError { code: u32 },

    #[error("version payload must be 4 bytes, got {len}")]
    VersionPayloadWrongLen { len: usize },

    #[error("peer speaks protocol major {theirs}, need {ours}")]
    VersionMajorMismatch { ours: u16, theirs: u16 },
}

/// The decoded fixed header of one message.
///
/// Constructed fresh per message, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub msg_id: u16,
    pub command: u16,
    pub msg_size: u32,
    pub flags_raw: u32,
    pub error: u32,
}

impl Envelope {
    /// Length of the body following this header.
    pub fn body_len(&self) -> usize {
        (self.msg_size as usize).saturating_sub(HEADER_LEN)
    }

    pub fn kind(&self) -> Result<MessageKind> {
        match self.flags_raw & TYPE_MASK {
            TYPE_COMMAND => Ok(MessageKind::Command),
            TYPE_REPLY => Ok(MessageKind::Reply),
            raw => Err(WireError::UnknownType { raw }),
        }
    }

    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags_raw)
    }

    pub fn is_error_reply(&self) -> bool {
        self.flags().contains(HeaderFlags::ERROR)
    }

    /// Parse a header from raw bytes without semantic validation.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::HeaderTooShort { len: buf.len() });
        }
        Ok(Self {
            msg_id: u16::from_ne_bytes([buf[0], buf[1]]),
            command: u16::from_ne_bytes([buf[2], buf[3]]),
            msg_size: u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]),
            flags_raw: u32::from_ne_bytes([buf[8], buf[9], buf[10], buf[11]]),
            error: u32::from_ne_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.msg_id.to_ne_bytes());
        out[2..4].copy_from_slice(&self.command.to_ne_bytes());
        out[4..8].copy_from_slice(&self.msg_size.to_ne_bytes());
        out[8..12].copy_from_slice(&self.flags_raw.to_ne_bytes());
        out[12..16].copy_from_slice(&self.error.to_ne_bytes());
        out
    }

    fn check_size(&self, limits: &Limits) -> Result<()> {
        if (self.msg_size as usize) < HEADER_LEN {
            return Err(WireError::SizeBelowHeader {
                size: self.msg_size,
            });
        }
        if self.msg_size as usize > limits.max_msg_size {
            return Err(WireError::SizeExceedsLimit {
                size: self.msg_size,
                max: limits.max_msg_size,
            });
        }
        Ok(())
    }
}

/// Encode the header for an outgoing message.
///
/// `body_len` is the total length of all body segments that will follow the
/// header; `msg_size` is computed from it. For a reply, a non-zero
/// `error_code` sets the error flag; a negative or zero code on an error
/// reply is normalized to [`GENERIC_ERROR_CODE`].
pub fn encode_header(
    msg_id: u16,
    command: u16,
    kind: MessageKind,
    error_code: i32,
    body_len: usize,
    limits: &Limits,
) -> Result<[u8; HEADER_LEN]> {
    let total = HEADER_LEN + body_len;
    if total > limits.max_msg_size {
        return Err(WireError::BodyTooLarge {
            len: body_len,
            max: limits.max_msg_size - HEADER_LEN,
        });
    }

    let mut flags_raw = match kind {
        MessageKind::Command => TYPE_COMMAND,
        MessageKind::Reply => TYPE_REPLY,
    };
    let mut error = 0u32;
    if kind == MessageKind::Reply && error_code != 0 {
        flags_raw |= HeaderFlags::ERROR.bits();
        error = if error_code > 0 {
            error_code as u32
        } else {
            GENERIC_ERROR_CODE
        };
    }

    Ok(Envelope {
        msg_id,
        command,
        msg_size: total as u32,
        flags_raw,
        error,
    }
    .to_bytes())
}

/// Decode and validate the header of an incoming command.
///
/// The `msg_id` is captured by the caller for the eventual reply.
pub fn decode_command_header(buf: &[u8], limits: &Limits) -> Result<Envelope> {
    let env = Envelope::parse(buf)?;
    match env.kind()? {
        MessageKind::Command => {}
        got => {
            return Err(WireError::WrongType {
                expected: MessageKind::Command,
                got,
            })
        }
    }
    env.check_size(limits)?;
    Ok(env)
}

/// Decode and validate the header of a reply to the outstanding request
/// identified by `expected_msg_id`.
///
/// An error reply surfaces as [`WireError::PeerError`]; a zero error code on
/// an error reply is normalized to [`GENERIC_ERROR_CODE`].
pub fn decode_reply_header(buf: &[u8], expected_msg_id: u16, limits: &Limits) -> Result<Envelope> {
    let env = Envelope::parse(buf)?;
    if env.msg_id != expected_msg_id {
        return Err(WireError::MessageIdMismatch {
            expected: expected_msg_id,
            got: env.msg_id,
        });
    }
    match env.kind()? {
        MessageKind::Reply => {}
        got => {
            return Err(WireError::WrongType {
                expected: MessageKind::Reply,
                got,
            })
        }
    }
    if env.is_error_reply() {
        let code = if env.error == 0 {
            GENERIC_ERROR_CODE
        } else {
            env.error
        };
        return Err(WireError::PeerError { code });
    }
    env.check_size(limits)?;
    Ok(env)
}

/// Protocol version payload exchanged during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub fn current() -> Self {
        Self {
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let mut out = [0u8; 4];
        out[0..2].copy_from_slice(&self.major.to_ne_bytes());
        out[2..4].copy_from_slice(&self.minor.to_ne_bytes());
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() != 4 {
            return Err(WireError::VersionPayloadWrongLen { len: buf.len() });
        }
        Ok(Self {
            major: u16::from_ne_bytes([buf[0], buf[1]]),
            minor: u16::from_ne_bytes([buf[2], buf[3]]),
        })
    }

    /// Check that the peer's version is compatible with ours.
    pub fn check(&self) -> Result<()> {
        if self.major != VERSION_MAJOR {
            return Err(WireError::VersionMajorMismatch {
                ours: VERSION_MAJOR,
                theirs: self.major,
            });
        }
        Ok(())
    }
}
