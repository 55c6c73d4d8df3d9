use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;

use emubus_proto::{
    encode_header, Envelope, Limits, MessageKind, Opcode, Version, WireError, HEADER_LEN,
};
use emubus_transport::{Transport, TransportError};

fn socket_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("emubus.sock")
}

/// Client side of the version exchange, byte by byte, for tests that need to
/// feed the accepting side raw traffic afterwards.
fn raw_handshake(stream: &mut UnixStream) {
    let hdr = encode_header(
        0,
        Opcode::Version as u16,
        MessageKind::Command,
        0,
        4,
        &Limits::default(),
    )
    .unwrap();
    stream.write_all(&hdr).unwrap();
    stream.write_all(&Version::current().to_bytes()).unwrap();

    let mut reply = [0u8; HEADER_LEN + 4];
    stream.read_exact(&mut reply).unwrap();
    let env = Envelope::parse(&reply[..HEADER_LEN]).unwrap();
    assert!(!env.is_error_reply());
    Version::parse(&reply[HEADER_LEN..]).unwrap().check().unwrap();
}

fn attach_pair(path: &Path) -> (Transport, Transport) {
    let mut server = Transport::bind(path, Limits::default()).unwrap();
    let client_path = path.to_path_buf();
    let client = thread::spawn(move || Transport::connect(client_path, Limits::default()).unwrap());
    server.attach().unwrap();
    (server, client.join().unwrap())
}

#[test]
fn attach_negotiates_and_serves_an_echo() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut client) = attach_pair(&socket_path(&dir));
    assert!(server.is_attached());

    let handle = thread::spawn(move || {
        let env = server
            .serve_one(false, |env, body, fds| {
                assert_eq!(env.command, Opcode::DmaWrite as u16);
                assert!(fds.is_empty());
                Ok(body)
            })
            .unwrap();
        assert_eq!(env.command, Opcode::DmaWrite as u16);
        server
    });

    let (env, body, fds) = client.call(Opcode::DmaWrite as u16, &[b"ping"], &[]).unwrap();
    assert_eq!(env.body_len(), 4);
    assert_eq!(body, b"ping");
    assert!(fds.is_empty());
    handle.join().unwrap();
}

#[test]
fn multi_segment_bodies_arrive_contiguous() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut client) = attach_pair(&socket_path(&dir));

    let handle = thread::spawn(move || {
        server.serve_one(false, |_env, body, _fds| Ok(body)).unwrap();
    });

    let (_env, body, _fds) = client
        .call(Opcode::RegionWrite as u16, &[b"head", b"er", b"body"], &[])
        .unwrap();
    assert_eq!(body, b"headerbody");
    handle.join().unwrap();
}

#[test]
fn handler_errors_become_error_replies() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut client) = attach_pair(&socket_path(&dir));

    let handle = thread::spawn(move || {
        server.serve_one(false, |_env, _body, _fds| Err(5)).unwrap();
    });

    let err = client.call(Opcode::Reset as u16, &[], &[]).unwrap_err();
    assert!(matches!(
        err,
        TransportError::Wire(WireError::PeerError { code: 5 })
    ));
    handle.join().unwrap();
}

#[test]
fn descriptors_cross_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut client) = attach_pair(&socket_path(&dir));

    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"shared page").unwrap();

    let handle = thread::spawn(move || {
        server
            .serve_one(false, |env, _body, mut fds| {
                assert_eq!(env.command, Opcode::AttachMemory as u16);
                assert_eq!(fds.len(), 1);
                // The received descriptor aliases the sender's file.
                let mut f = File::from(fds.remove(0));
                f.seek(SeekFrom::Start(0)).map_err(|_| 5)?;
                let mut contents = Vec::new();
                f.read_to_end(&mut contents).map_err(|_| 5)?;
                Ok(contents)
            })
            .unwrap();
    });

    let (_env, body, _fds) = client
        .call(Opcode::AttachMemory as u16, &[], &[file.as_raw_fd()])
        .unwrap();
    assert_eq!(body, b"shared page");
    handle.join().unwrap();
}

#[test]
fn second_attach_is_refused_while_peer_present() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, _client) = attach_pair(&socket_path(&dir));

    assert!(matches!(
        server.attach(),
        Err(TransportError::AlreadyAttached)
    ));
}

#[test]
fn clean_disconnect_detaches_and_allows_reattach() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let (mut server, client) = attach_pair(&path);

    drop(client);
    assert!(matches!(
        server.request_header(false),
        Err(TransportError::Disconnected)
    ));
    assert!(!server.is_attached());

    // The listener survived; a new peer can attach.
    let client_path = path.clone();
    let client = thread::spawn(move || Transport::connect(client_path, Limits::default()).unwrap());
    server.attach().unwrap();
    client.join().unwrap();
}

#[test]
fn truncated_body_is_a_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let mut server = Transport::bind(&path, Limits::default()).unwrap();

    let raw_path = path.clone();
    let raw = thread::spawn(move || {
        let mut stream = UnixStream::connect(raw_path).unwrap();
        raw_handshake(&mut stream);

        // Announce 32 body bytes but deliver only 10, then hang up.
        let hdr = encode_header(
            1,
            Opcode::RegionWrite as u16,
            MessageKind::Command,
            0,
            32,
            &Limits::default(),
        )
        .unwrap();
        stream.write_all(&hdr).unwrap();
        stream.write_all(&[0u8; 10]).unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();
        stream
    });

    server.attach().unwrap();
    let (env, _fds) = server.request_header(false).unwrap();
    assert_eq!(env.body_len(), 32);
    assert!(matches!(
        server.recv_body_alloc(&env),
        Err(TransportError::ConnectionReset)
    ));
    assert!(!server.is_attached());
    drop(raw.join().unwrap());
}

#[test]
fn oversized_message_is_rejected_at_the_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let limits = Limits {
        max_msg_size: 256,
        max_msg_fds: 4,
    };
    let mut server = Transport::bind(&path, limits).unwrap();

    let raw_path = path.clone();
    let raw = thread::spawn(move || {
        let mut stream = UnixStream::connect(raw_path).unwrap();
        raw_handshake(&mut stream);

        let mut env = Envelope::parse(
            &encode_header(1, Opcode::DmaRead as u16, MessageKind::Command, 0, 0, &limits)
                .unwrap(),
        )
        .unwrap();
        env.msg_size = 0x10000;
        stream.write_all(&env.to_bytes()).unwrap();
        stream
    });

    server.attach().unwrap();
    assert!(matches!(
        server.request_header(false),
        Err(TransportError::Wire(WireError::SizeExceedsLimit { .. }))
    ));
    drop(raw.join().unwrap());
}

#[test]
fn incompatible_version_fails_attach_but_keeps_listening() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let mut server = Transport::bind(&path, Limits::default()).unwrap();

    let raw_path = path.clone();
    let raw = thread::spawn(move || {
        let mut stream = UnixStream::connect(raw_path).unwrap();
        let offered = Version {
            major: emubus_proto::VERSION_MAJOR + 1,
            minor: 0,
        };
        let hdr = encode_header(
            0,
            Opcode::Version as u16,
            MessageKind::Command,
            0,
            4,
            &Limits::default(),
        )
        .unwrap();
        stream.write_all(&hdr).unwrap();
        stream.write_all(&offered.to_bytes()).unwrap();

        // The refusal is an error reply, then the connection closes.
        let mut reply = [0u8; HEADER_LEN];
        stream.read_exact(&mut reply).unwrap();
        assert!(Envelope::parse(&reply).unwrap().is_error_reply());
    });

    assert!(matches!(
        server.attach(),
        Err(TransportError::Negotiation(
            WireError::VersionMajorMismatch { .. }
        ))
    ));
    assert!(!server.is_attached());
    raw.join().unwrap();

    // A well-behaved peer can still get in.
    let client_path = path.clone();
    let client = thread::spawn(move || Transport::connect(client_path, Limits::default()).unwrap());
    server.attach().unwrap();
    client.join().unwrap();
}

#[test]
fn nonblocking_poll_reports_would_block_then_readiness() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut client) = attach_pair(&socket_path(&dir));
    assert!(server.poll_fd().is_ok());

    assert!(matches!(
        server.request_header(true),
        Err(TransportError::WouldBlock)
    ));

    let handle = thread::spawn(move || {
        server.serve_one(false, |_env, body, _fds| Ok(body)).unwrap();
    });
    let (_env, body, _fds) = client.call(Opcode::DeviceInfo as u16, &[b"q"], &[]).unwrap();
    assert_eq!(body, b"q");
    handle.join().unwrap();
}

#[test]
fn nonblocking_attach_reports_would_block() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let mut server = Transport::bind(&path, Limits::default()).unwrap();
    server.set_nonblocking_accept(true).unwrap();
    assert!(matches!(server.attach(), Err(TransportError::WouldBlock)));

    let client_path = path.clone();
    let client = thread::spawn(move || Transport::connect(client_path, Limits::default()).unwrap());
    loop {
        match server.attach() {
            Ok(()) => break,
            Err(TransportError::WouldBlock) => thread::yield_now(),
            Err(e) => panic!("attach failed: {e}"),
        }
    }
    assert!(server.is_attached());
    client.join().unwrap();
}

#[test]
fn fini_removes_the_socket_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let mut server = Transport::bind(&path, Limits::default()).unwrap();
    assert!(path.exists());

    server.fini();
    assert!(!path.exists());
    assert!(matches!(server.poll_fd(), Err(TransportError::NotListening)));
}

#[test]
fn bind_replaces_a_stale_socket_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    {
        let _stale = Transport::bind(&path, Limits::default()).unwrap();
        // Dropped without fini would still unlink; simulate a leftover file
        // instead.
    }
    std::fs::write(&path, b"").unwrap();
    let server = Transport::bind(&path, Limits::default()).unwrap();
    drop(server);
}
