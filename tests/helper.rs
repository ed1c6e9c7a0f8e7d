//! Integration tests for the helper protocol: a real serve loop on one
//! end of the channel, the host session on the other.

use std::io::Read;
use std::os::fd::AsFd;
use std::thread;
use std::time::Duration;

use nestbox::error::ProtocolError;
use nestbox::helper::{serve, Body, Channel, Frame, HelperSession, SessionState, PROTOCOL_VERSION};

fn spawn_helper(chan: Channel) -> thread::JoinHandle<Result<(), ProtocolError>> {
    thread::spawn(move || serve::run(&chan, &[]))
}

#[test]
fn test_session_lifecycle_against_real_helper() {
    let (host, helper) = Channel::pair().expect("channel pair");
    let server = spawn_helper(helper);

    let mut session = HelperSession::new(host);
    assert_eq!(session.state(), SessionState::Connecting);

    session
        .handshake(Duration::from_secs(2))
        .expect("handshake");
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.helper_pid(), Some(std::process::id()));

    let status = session
        .query_status(Duration::from_secs(2))
        .expect("status");
    assert_eq!(status.pid, std::process::id());
    assert_eq!(status.children, 0);

    let output = session
        .run_command(
            &[
                "sh".to_string(),
                "-c".to_string(),
                "printf sandboxed".to_string(),
            ],
            true,
            Duration::from_secs(5),
        )
        .expect("run command")
        .expect("output captured");
    assert_eq!(output.stdout, "sandboxed");
    assert_eq!(output.exit_code, 0);

    session
        .request_shutdown(Duration::from_secs(2))
        .expect("shutdown");
    assert_eq!(session.state(), SessionState::Closing);
    session.confirm_exited();
    assert_eq!(session.state(), SessionState::Closed);

    server.join().expect("join").expect("serve result");
}

#[test]
fn test_dynamic_descriptor_grant() {
    // The dynamic-grant path: a descriptor chosen host-side reaches the
    // sandbox without any standing filesystem grant.
    let (host, helper) = Channel::pair().expect("channel pair");
    let server = spawn_helper(helper);

    let mut session = HelperSession::new(host);
    session
        .handshake(Duration::from_secs(2))
        .expect("handshake");

    let (read_end, write_end) = nix::unistd::pipe().expect("pipe");
    session
        .pass_fd(
            write_end.as_fd(),
            "saved-download",
            Some(std::path::Path::new("/home/user/Downloads/file.bin")),
            Duration::from_secs(2),
        )
        .expect("pass fd");
    assert_eq!(session.state(), SessionState::Ready);

    // The helper holds the write end now; closing ours must not close
    // the granted copy, so the pipe stays open until shutdown.
    drop(write_end);
    let mut reader = std::fs::File::from(read_end);

    session
        .request_shutdown(Duration::from_secs(2))
        .expect("shutdown");
    server.join().expect("join").expect("serve result");

    // Helper exited, the granted descriptor is released, EOF arrives.
    let mut sink = Vec::new();
    reader.read_to_end(&mut sink).expect("read to end");
}

#[test]
fn test_unanswered_request_times_out_and_closes() {
    // A bare channel peer that handshakes and then goes silent.
    let (host, helper) = Channel::pair().expect("channel pair");
    let silent = thread::spawn(move || {
        helper
            .send(
                &Frame {
                    id: 0,
                    body: Body::Hello {
                        protocol: PROTOCOL_VERSION,
                        pid: 1,
                    },
                },
                None,
            )
            .expect("hello");
        // Swallow the request, answer nothing.
        let _ = helper.recv_timeout(Duration::from_secs(2));
    });

    let mut session = HelperSession::new(host);
    session
        .handshake(Duration::from_secs(2))
        .expect("handshake");

    let (read_end, _write_end) = nix::unistd::pipe().expect("pipe");
    let result = session.pass_fd(
        read_end.as_fd(),
        "ignored",
        None,
        Duration::from_millis(100),
    );
    match result {
        Err(ProtocolError::HelperTimeout { waited_ms }) => assert_eq!(waited_ms, 100),
        other => panic!("expected HelperTimeout, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Closed);

    silent.join().expect("silent peer");
}

#[test]
fn test_desynchronized_response_forces_closing() {
    let (host, helper) = Channel::pair().expect("channel pair");
    let rogue = thread::spawn(move || {
        helper
            .send(
                &Frame {
                    id: 0,
                    body: Body::Hello {
                        protocol: PROTOCOL_VERSION,
                        pid: 1,
                    },
                },
                None,
            )
            .expect("hello");
        let (request, _) = helper
            .recv_timeout(Duration::from_secs(2))
            .expect("recv")
            .expect("request");
        helper
            .send(
                &Frame {
                    id: request.id.wrapping_add(99),
                    body: Body::Ok,
                },
                None,
            )
            .expect("bad response");
    });

    let mut session = HelperSession::new(host);
    session
        .handshake(Duration::from_secs(2))
        .expect("handshake");

    let result = session.query_status(Duration::from_secs(2));
    assert!(matches!(result, Err(ProtocolError::ProtocolDesync { .. })));
    assert_eq!(session.state(), SessionState::Closing);

    rogue.join().expect("rogue peer");
}

#[test]
fn test_non_pipelined_discipline() {
    let (host, helper) = Channel::pair().expect("channel pair");
    let peer = thread::spawn(move || {
        helper
            .send(
                &Frame {
                    id: 0,
                    body: Body::Hello {
                        protocol: PROTOCOL_VERSION,
                        pid: 1,
                    },
                },
                None,
            )
            .expect("hello");
        let _ = helper.recv_timeout(Duration::from_secs(2));
    });

    let mut session = HelperSession::new(host);
    session
        .handshake(Duration::from_secs(2))
        .expect("handshake");

    session
        .send_request(Body::QueryStatus, None)
        .expect("first request accepted");
    let second = session.send_request(Body::QueryStatus, None);
    assert!(matches!(second, Err(ProtocolError::RequestAlreadyPending)));

    peer.join().expect("peer");
}

#[test]
fn test_version_mismatch_refused() {
    let (host, helper) = Channel::pair().expect("channel pair");
    let peer = thread::spawn(move || {
        helper
            .send(
                &Frame {
                    id: 0,
                    body: Body::Hello {
                        protocol: PROTOCOL_VERSION + 1,
                        pid: 1,
                    },
                },
                None,
            )
            .expect("hello from the future");
    });

    let mut session = HelperSession::new(host);
    let result = session.handshake(Duration::from_secs(2));
    assert!(matches!(result, Err(ProtocolError::Malformed { .. })));
    assert_eq!(session.state(), SessionState::Closed);

    peer.join().expect("peer");
}

#[test]
fn test_helper_survives_unanswerable_command() {
    // A failed request degrades that request, not the session or the
    // sandboxed application.
    let (host, helper) = Channel::pair().expect("channel pair");
    let server = spawn_helper(helper);

    let mut session = HelperSession::new(host);
    session
        .handshake(Duration::from_secs(2))
        .expect("handshake");

    let result = session.run_command(
        &["/does/not/exist".to_string()],
        true,
        Duration::from_secs(2),
    );
    assert!(matches!(result, Err(ProtocolError::Rejected { .. })));
    assert_eq!(session.state(), SessionState::Ready);

    // The session keeps working afterwards.
    let status = session
        .query_status(Duration::from_secs(2))
        .expect("status after rejection");
    assert_eq!(status.pid, std::process::id());

    session
        .request_shutdown(Duration::from_secs(2))
        .expect("shutdown");
    server.join().expect("join").expect("serve result");
}
