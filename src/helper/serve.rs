//! The in-sandbox helper serve loop.
//!
//! This is the far end of the protocol in [`super`]: a minimal process
//! that runs as the sandbox's init-like parent, launches the
//! application, answers host requests and reaps whatever dies inside.
//! The `nestbox-helper` binary is a thin wrapper around [`run`]; tests
//! drive the same loop over an in-process socketpair.
//!
//! The helper deliberately has no host-side knowledge: its only contact
//! with the outside is the inherited channel descriptor.

use std::os::fd::OwnedFd;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::ProtocolError;
use crate::helper::wire::{Body, Channel, Frame, PROTOCOL_VERSION};

/// How long the serve loop waits for a frame before housekeeping.
const TICK: Duration = Duration::from_millis(500);

/// How long children get to honor SIGTERM before SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// A descriptor granted by the host, kept open for the application.
#[derive(Debug)]
struct ReceivedFd {
    /// What the host said the descriptor is for; kept for diagnostics.
    #[allow(dead_code)]
    purpose: String,
    _fd: OwnedFd,
}

/// Runs the helper until shutdown or end-of-stream.
///
/// Sends the startup handshake, launches `startup_argv` (if any), then
/// serves requests. Children are reaped on every tick; on shutdown all
/// remaining children get SIGTERM, then SIGKILL after a grace period.
pub fn run(chan: &Channel, startup_argv: &[String]) -> Result<(), ProtocolError> {
    let start = Instant::now();
    let mut children: Vec<Child> = Vec::new();
    let mut received: Vec<ReceivedFd> = Vec::new();

    chan.send(
        &Frame {
            id: 0,
            body: Body::Hello {
                protocol: PROTOCOL_VERSION,
                pid: std::process::id(),
            },
        },
        None,
    )?;
    debug!("Handshake sent");

    if !startup_argv.is_empty() {
        match spawn(startup_argv, false) {
            Ok((child, _)) => {
                if let Some(child) = child {
                    children.push(child);
                }
            }
            Err(message) => warn!(%message, "Startup command failed"),
        }
    }

    loop {
        reap(&mut children);

        let (frame, fd) = match chan.recv_timeout(TICK) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("Channel closed, helper exiting");
                break;
            }
            Err(ProtocolError::HelperTimeout { .. }) => continue,
            Err(ProtocolError::ChannelClosed) => break,
            Err(e) => return Err(e),
        };

        let mut shutting_down = false;
        let response = match frame.body {
            Body::PassFd { purpose, path_hint } => {
                trace!(%purpose, ?path_hint, "Descriptor grant received");
                match fd {
                    Some(fd) => {
                        received.push(ReceivedFd { purpose, _fd: fd });
                        Body::Ok
                    }
                    None => Body::Failure {
                        message: "pass-fd frame carried no descriptor".to_string(),
                    },
                }
            }
            Body::QueryStatus => Body::Status {
                pid: std::process::id(),
                children: live_children(&mut children),
                uptime_secs: start.elapsed().as_secs(),
            },
            Body::RunCommand { argv, wait } => match spawn(&argv, wait) {
                Ok((child, output)) => {
                    if let Some(child) = child {
                        children.push(child);
                    }
                    match output {
                        Some((stdout, exit_code)) => Body::Output { stdout, exit_code },
                        None => Body::Ok,
                    }
                }
                Err(message) => Body::Failure { message },
            },
            Body::Shutdown => {
                shutting_down = true;
                Body::Ok
            }
            other => Body::Failure {
                message: format!("unexpected message kind: {other:?}"),
            },
        };

        chan.send(
            &Frame {
                id: frame.id,
                body: response,
            },
            None,
        )?;

        if shutting_down {
            debug!("Shutdown acknowledged, terminating children");
            terminate(&mut children);
            break;
        }
    }

    terminate(&mut children);
    Ok(())
}

/// Spawns a command; captures output when `wait` is set.
fn spawn(argv: &[String], wait: bool) -> Result<(Option<Child>, Option<(String, i32)>), String> {
    let Some((program, args)) = argv.split_first() else {
        return Err("empty command".to_string());
    };

    let mut command = Command::new(program);
    command.args(args);

    if wait {
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        let output = command
            .output()
            .map_err(|e| format!("failed to run {program}: {e}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let exit_code = output.status.code().unwrap_or(-1);
        Ok((None, Some((stdout, exit_code))))
    } else {
        let child = command
            .spawn()
            .map_err(|e| format!("failed to spawn {program}: {e}"))?;
        trace!(pid = child.id(), %program, "Child spawned");
        Ok((Some(child), None))
    }
}

/// Drops children that have exited.
fn reap(children: &mut Vec<Child>) {
    children.retain_mut(|child| match child.try_wait() {
        Ok(Some(status)) => {
            trace!(pid = child.id(), ?status, "Reaped child");
            false
        }
        Ok(None) => true,
        Err(_) => false,
    });
}

fn live_children(children: &mut Vec<Child>) -> u32 {
    reap(children);
    children.len() as u32
}

/// SIGTERM to every child, SIGKILL after the grace period, reap all.
fn terminate(children: &mut Vec<Child>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    for child in children.iter() {
        let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
    }

    let deadline = Instant::now() + TERM_GRACE;
    while !children.is_empty() && Instant::now() < deadline {
        reap(children);
        if children.is_empty() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    for child in children.iter_mut() {
        warn!(pid = child.id(), "Child ignored SIGTERM, killing");
        let _ = child.kill();
        let _ = child.wait();
    }
    children.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::HelperSession;
    use std::thread;

    fn serve_in_thread(chan: Channel) -> thread::JoinHandle<Result<(), ProtocolError>> {
        thread::spawn(move || run(&chan, &[]))
    }

    #[test]
    fn test_serve_handshake_and_status() {
        let (host, helper) = Channel::pair().expect("channel pair");
        let server = serve_in_thread(helper);

        let mut session = HelperSession::new(host);
        session
            .handshake(Duration::from_secs(2))
            .expect("handshake");
        let status = session
            .query_status(Duration::from_secs(2))
            .expect("status");
        assert_eq!(status.children, 0);

        session
            .request_shutdown(Duration::from_secs(2))
            .expect("shutdown");
        server.join().expect("join").expect("serve result");
    }

    #[test]
    fn test_serve_runs_commands() {
        let (host, helper) = Channel::pair().expect("channel pair");
        let server = serve_in_thread(helper);

        let mut session = HelperSession::new(host);
        session
            .handshake(Duration::from_secs(2))
            .expect("handshake");

        let result = session
            .run_command(
                &["sh".to_string(), "-c".to_string(), "echo inside".to_string()],
                true,
                Duration::from_secs(5),
            )
            .expect("run command")
            .expect("waited command returns output");
        assert_eq!(result.stdout.trim(), "inside");
        assert_eq!(result.exit_code, 0);

        let missing = session.run_command(
            &["/nonexistent/program".to_string()],
            true,
            Duration::from_secs(5),
        );
        assert!(matches!(missing, Err(ProtocolError::Rejected { .. })));

        session
            .request_shutdown(Duration::from_secs(2))
            .expect("shutdown");
        server.join().expect("join").expect("serve result");
    }

    #[test]
    fn test_serve_accepts_descriptor() {
        let (host, helper) = Channel::pair().expect("channel pair");
        let server = serve_in_thread(helper);

        let mut session = HelperSession::new(host);
        session
            .handshake(Duration::from_secs(2))
            .expect("handshake");

        let (read_end, _write_end) = nix::unistd::pipe().expect("pipe");
        session
            .pass_fd(
                std::os::fd::AsFd::as_fd(&read_end),
                "picked-document",
                Some(std::path::Path::new("/home/user/doc.pdf")),
                Duration::from_secs(2),
            )
            .expect("pass fd");

        session
            .request_shutdown(Duration::from_secs(2))
            .expect("shutdown");
        server.join().expect("join").expect("serve result");
    }

    #[test]
    fn test_serve_exits_on_host_drop() {
        let (host, helper) = Channel::pair().expect("channel pair");
        let server = serve_in_thread(helper);
        drop(host);
        server.join().expect("join").expect("serve result");
    }
}
