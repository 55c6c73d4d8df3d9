//! Low-level framed send/receive over a connected Unix stream socket.
//!
//! These helpers are the only place that touches `sendmsg`/`recvmsg`. Short
//! reads and writes are never retried; they surface as
//! [`TransportError::ConnectionReset`], and a clean zero-byte read as
//! [`TransportError::Disconnected`].

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{
    recv, recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};

use emubus_proto::{self as proto, Limits, MessageKind, HEADER_LEN};

use crate::error::{Result, TransportError};

/// Hard cap on descriptors per message, used to size the control buffer.
/// `Limits::max_msg_fds` may only lower the accepted count.
pub(crate) const SCM_MAX_FDS: usize = 16;

/// Send one message: header, body segments, and optionally a single
/// out-of-band descriptor block.
pub(crate) fn send_message(
    fd: RawFd,
    msg_id: u16,
    command: u16,
    kind: MessageKind,
    error_code: i32,
    segments: &[&[u8]],
    fds: &[RawFd],
    limits: &Limits,
) -> Result<()> {
    if fds.len() > limits.max_msg_fds.min(SCM_MAX_FDS) {
        return Err(TransportError::TooManyFds {
            got: fds.len(),
            max: limits.max_msg_fds.min(SCM_MAX_FDS),
        });
    }

    let body_len: usize = segments.iter().map(|s| s.len()).sum();
    let hdr = proto::encode_header(msg_id, command, kind, error_code, body_len, limits)?;

    // The header is always the first segment of the outgoing buffer.
    let mut iov = Vec::with_capacity(1 + segments.len());
    iov.push(IoSlice::new(&hdr));
    for seg in segments {
        iov.push(IoSlice::new(seg));
    }

    let cmsgs = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(fds)]
    };

    let sent = match sendmsg::<UnixAddr>(fd, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
        Ok(n) => n,
        // A failed write on a closed peer is the same as a short write.
        Err(Errno::EPIPE) => return Err(TransportError::ConnectionReset),
        Err(e) => return Err(e.into()),
    };
    if sent < HEADER_LEN + body_len {
        return Err(TransportError::ConnectionReset);
    }
    Ok(())
}

/// Receive exactly one fixed-size header, consuming any ancillary
/// descriptors atomically with it.
///
/// With `dont_wait`, returns [`TransportError::WouldBlock`] if no message is
/// pending; the body read that follows is always blocking.
pub(crate) fn recv_header(
    fd: RawFd,
    dont_wait: bool,
    limits: &Limits,
) -> Result<([u8; HEADER_LEN], Vec<OwnedFd>)> {
    let mut buf = [0u8; HEADER_LEN];
    let mut cmsg_buf = cmsg_space!([RawFd; SCM_MAX_FDS]);

    let fds = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut flags = MsgFlags::MSG_WAITALL;
        if dont_wait {
            flags |= MsgFlags::MSG_DONTWAIT;
        }

        let msg = match recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut cmsg_buf), flags) {
            Ok(msg) => msg,
            Err(Errno::EAGAIN) => return Err(TransportError::WouldBlock),
            Err(e) => return Err(e.into()),
        };

        if msg.bytes == 0 {
            return Err(TransportError::Disconnected);
        }
        if msg.flags.intersects(MsgFlags::MSG_CTRUNC | MsgFlags::MSG_TRUNC) {
            return Err(TransportError::TruncatedAncillary);
        }
        if msg.bytes < HEADER_LEN {
            return Err(TransportError::ConnectionReset);
        }

        let mut fds = Vec::new();
        for cmsg in msg.cmsgs().map_err(|_| TransportError::TruncatedAncillary)? {
            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                for raw_fd in raw {
                    // Safety: the kernel installed these descriptors for us;
                    // we take ownership exactly once.
                    fds.push(unsafe { OwnedFd::from_raw_fd(raw_fd) });
                }
            }
        }
        fds
    };

    if fds.len() > limits.max_msg_fds {
        // Dropping the OwnedFds closes the excess descriptors.
        return Err(TransportError::TooManyFds {
            got: fds.len(),
            max: limits.max_msg_fds,
        });
    }

    Ok((buf, fds))
}

/// Fully-satisfying blocking read of a message body into `buf`.
pub(crate) fn recv_body(fd: RawFd, buf: &mut [u8]) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let n = recv(fd, buf, MsgFlags::MSG_WAITALL)?;
    if n == 0 {
        return Err(TransportError::Disconnected);
    }
    if n < buf.len() {
        tracing::warn!("short body read: expected {}, got {n}", buf.len());
        return Err(TransportError::ConnectionReset);
    }
    Ok(())
}
