//! Connection lifecycle for one emulated-device endpoint.
//!
//! A [`Transport`] moves through listen, attach (accept + version
//! negotiation), serve, detach, and finish. Only one peer may be attached at
//! a time; a failed negotiation closes the connection but keeps the listener
//! so the peer can retry.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use emubus_proto::{
    decode_command_header, decode_reply_header, Envelope, HeaderFlags, Limits, MessageKind,
    Opcode, Version,
};

use crate::error::{Result, TransportError};
use crate::sock;

pub struct Transport {
    path: PathBuf,
    limits: Limits,
    listener: Option<UnixListener>,
    conn: Option<UnixStream>,
    next_msg_id: u16,
}

impl Transport {
    /// Bind a listening endpoint at `path`, replacing any stale socket file.
    pub fn bind<P: AsRef<Path>>(path: P, limits: Limits) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!("removed stale socket at {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&path)?;
        tracing::debug!("listening on {}", path.display());
        Ok(Self {
            path,
            limits,
            listener: Some(listener),
            conn: None,
            next_msg_id: 0,
        })
    }

    /// Connect to a listening endpoint at `path` and negotiate the protocol
    /// version as the initiating side.
    pub fn connect<P: AsRef<Path>>(path: P, limits: Limits) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&path)?;
        let mut t = Self {
            path,
            limits,
            listener: None,
            conn: Some(stream),
            next_msg_id: 0,
        };
        let (_env, body, _fds) = t.call(
            Opcode::Version as u16,
            &[&Version::current().to_bytes()],
            &[],
        )?;
        let theirs = Version::parse(&body).map_err(TransportError::Negotiation)?;
        theirs.check().map_err(TransportError::Negotiation)?;
        tracing::debug!(
            "negotiated protocol {}.{} with {}",
            theirs.major,
            theirs.minor,
            t.path.display()
        );
        Ok(t)
    }

    /// The descriptor to poll for readability: the attached connection, or
    /// the listener while awaiting a peer.
    pub fn poll_fd(&self) -> Result<RawFd> {
        if let Some(conn) = &self.conn {
            return Ok(conn.as_raw_fd());
        }
        self.listener
            .as_ref()
            .map(|l| l.as_raw_fd())
            .ok_or(TransportError::NotListening)
    }

    pub fn is_attached(&self) -> bool {
        self.conn.is_some()
    }

    /// Switch the listener between blocking and nonblocking accepts. In
    /// nonblocking mode, [`Transport::attach`] returns
    /// [`TransportError::WouldBlock`] when no peer is waiting.
    pub fn set_nonblocking_accept(&mut self, nonblocking: bool) -> Result<()> {
        let listener = self.listener.as_ref().ok_or(TransportError::NotListening)?;
        listener.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Accept one peer connection and run version negotiation on it.
    ///
    /// Refused while a peer is already attached. A negotiation failure drops
    /// the fresh connection and leaves the listener intact.
    pub fn attach(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Err(TransportError::AlreadyAttached);
        }
        let listener = self.listener.as_ref().ok_or(TransportError::NotListening)?;
        let (stream, _addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(TransportError::WouldBlock)
            }
            Err(e) => return Err(e.into()),
        };
        // Negotiation below is a blocking exchange even when accepts are not.
        stream.set_nonblocking(false)?;
        self.conn = Some(stream);

        if let Err(e) = self.negotiate() {
            tracing::warn!("version negotiation failed: {e}");
            self.conn = None;
            return Err(e);
        }
        Ok(())
    }

    /// Accepting-side half of negotiation: the peer's first message must be
    /// a version command, which we answer with our own version.
    fn negotiate(&mut self) -> Result<()> {
        let (env, _fds) = self.request_header(false)?;
        if env.command != Opcode::Version as u16 {
            self.reply_error(&env, libc_einval())?;
            return Err(TransportError::UnexpectedNegotiationCommand {
                command: env.command,
            });
        }
        let body = self.recv_body_alloc(&env)?;
        let theirs = match Version::parse(&body).and_then(|v| v.check().map(|()| v)) {
            Ok(v) => v,
            Err(e) => {
                self.reply_error(&env, libc_einval())?;
                return Err(TransportError::Negotiation(e));
            }
        };
        self.reply(&env, 0, &[&Version::current().to_bytes()], &[])?;
        tracing::debug!("peer attached, protocol {}.{}", theirs.major, theirs.minor);
        Ok(())
    }

    /// Receive the header (and any ancillary descriptors) of the peer's next
    /// command.
    ///
    /// With `dont_wait`, returns [`TransportError::WouldBlock`] when no
    /// message is pending. A disconnect or framing loss detaches the peer.
    pub fn request_header(&mut self, dont_wait: bool) -> Result<(Envelope, Vec<OwnedFd>)> {
        let fd = self.conn_fd()?;
        let (buf, fds) = match sock::recv_header(fd, dont_wait, &self.limits) {
            Ok(got) => got,
            Err(e @ (TransportError::Disconnected | TransportError::ConnectionReset)) => {
                self.conn = None;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let env = decode_command_header(&buf, &self.limits)?;
        Ok((env, fds))
    }

    /// Read the body announced by `env` into `buf`, which must be exactly
    /// `env.body_len()` bytes.
    pub fn recv_body(&mut self, env: &Envelope, buf: &mut [u8]) -> Result<()> {
        if buf.len() != env.body_len() {
            return Err(TransportError::BodyLengthMismatch {
                expected: env.body_len(),
                got: buf.len(),
            });
        }
        let fd = self.conn_fd()?;
        match sock::recv_body(fd, buf) {
            Ok(()) => Ok(()),
            Err(e @ (TransportError::Disconnected | TransportError::ConnectionReset)) => {
                self.conn = None;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Read the body announced by `env` into a fresh buffer.
    pub fn recv_body_alloc(&mut self, env: &Envelope) -> Result<Vec<u8>> {
        let mut body = vec![0u8; env.body_len()];
        self.recv_body(env, &mut body)?;
        Ok(body)
    }

    /// Send a reply correlated to the command in `env`.
    ///
    /// A non-zero `error_code` produces an error reply; its body segments
    /// are still transmitted.
    pub fn reply(
        &mut self,
        env: &Envelope,
        error_code: i32,
        segments: &[&[u8]],
        fds: &[RawFd],
    ) -> Result<()> {
        let fd = self.conn_fd()?;
        match sock::send_message(
            fd,
            env.msg_id,
            env.command,
            MessageKind::Reply,
            error_code,
            segments,
            fds,
            &self.limits,
        ) {
            Ok(()) => Ok(()),
            Err(e @ TransportError::ConnectionReset) => {
                self.conn = None;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn reply_error(&mut self, env: &Envelope, error_code: i32) -> Result<()> {
        self.reply(env, error_code, &[], &[])
    }

    /// Send a command and block for its reply.
    ///
    /// The reply is matched to the request by message id; a mismatch or an
    /// error reply surfaces as a wire error.
    pub fn call(
        &mut self,
        command: u16,
        segments: &[&[u8]],
        fds: &[RawFd],
    ) -> Result<(Envelope, Vec<u8>, Vec<OwnedFd>)> {
        let msg_id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);

        let fd = self.conn_fd()?;
        match sock::send_message(
            fd,
            msg_id,
            command,
            MessageKind::Command,
            0,
            segments,
            fds,
            &self.limits,
        ) {
            Ok(()) => {}
            Err(e @ TransportError::ConnectionReset) => {
                self.conn = None;
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        let (buf, reply_fds) = match sock::recv_header(fd, false, &self.limits) {
            Ok(got) => got,
            Err(e @ (TransportError::Disconnected | TransportError::ConnectionReset)) => {
                self.conn = None;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let env = decode_reply_header(&buf, msg_id, &self.limits)?;
        let body = self.recv_body_alloc(&env)?;
        Ok((env, body, reply_fds))
    }

    /// Receive and answer exactly one command.
    ///
    /// `handler` gets the envelope, body, and descriptors and returns either
    /// the reply body or an error code for an error reply. Commands flagged
    /// no-reply are handled without answering.
    pub fn serve_one<F>(&mut self, dont_wait: bool, handler: F) -> Result<Envelope>
    where
        F: FnOnce(&Envelope, Vec<u8>, Vec<OwnedFd>) -> std::result::Result<Vec<u8>, i32>,
    {
        let (env, fds) = self.request_header(dont_wait)?;
        let body = self.recv_body_alloc(&env)?;
        let wants_reply = !env.flags().contains(HeaderFlags::NO_REPLY);

        match handler(&env, body, fds) {
            Ok(reply_body) if wants_reply => self.reply(&env, 0, &[&reply_body], &[])?,
            Err(code) if wants_reply => {
                tracing::debug!(
                    "command {:#x} (msg_id {:#x}) failed with code {code}",
                    env.command,
                    env.msg_id
                );
                self.reply_error(&env, code)?;
            }
            _ => {}
        }
        Ok(env)
    }

    /// Drop the attached peer, keeping the listener for a future attach.
    pub fn detach(&mut self) {
        if self.conn.take().is_some() {
            tracing::debug!("peer detached");
        }
    }

    /// Tear down the endpoint entirely: connection, listener, and the socket
    /// file on disk.
    pub fn fini(&mut self) {
        self.detach();
        if self.listener.take().is_some() {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("failed to unlink {}: {e}", self.path.display());
                }
            }
        }
    }

    fn conn_fd(&self) -> Result<RawFd> {
        self.conn
            .as_ref()
            .map(|c| c.as_raw_fd())
            .ok_or(TransportError::NotConnected)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.fini();
    }
}

fn libc_einval() -> i32 {
    nix::errno::Errno::EINVAL as i32
}
