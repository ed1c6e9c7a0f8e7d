//! Host side of the helper protocol.
//!
//! A [`HelperSession`] supervises the message exchange with the helper
//! process inside a running sandbox. The protocol is deliberately
//! non-pipelined — at most one request may be outstanding — so ordering
//! stays trivially auditable. That discipline is modeled as an explicit
//! state machine rather than call-order convention: overlapping requests
//! are rejected deterministically instead of racing.
//!
//! ```text
//! Connecting → Ready → (per request: AwaitingAck) → Ready → Closing → Closed
//! ```
//!
//! Faults degrade the dynamic-grant feature, never the application: a
//! helper timeout or protocol desync closes the session, but the
//! sandboxed process keeps running until the caller explicitly asks for
//! termination.

pub mod serve;
mod wire;

pub use wire::{Body, Channel, Frame, MAX_FRAME_BYTES, PROTOCOL_VERSION};

use std::fmt;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, instrument, trace, warn};

use crate::error::ProtocolError;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the helper's startup handshake.
    Connecting,
    /// Idle; a request may be sent.
    Ready,
    /// A request is in flight and unacknowledged.
    AwaitingAck,
    /// The channel is going down; no more requests.
    Closing,
    /// Channel released; the sandboxed process is confirmed gone or the
    /// session was abandoned.
    Closed,
}

impl SessionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::AwaitingAck => "awaiting-ack",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Helper status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperStatus {
    /// Helper pid inside the sandbox's pid namespace.
    pub pid: u32,
    /// Live child processes under the helper.
    pub children: u32,
    /// Seconds since the helper started.
    pub uptime_secs: u64,
}

/// Captured output of a command executed through the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub exit_code: i32,
}

/// One session per running sandbox.
#[derive(Debug)]
pub struct HelperSession {
    chan: Channel,
    state: SessionState,
    next_id: u64,
    outstanding: Option<u64>,
    helper_pid: Option<u32>,
}

impl HelperSession {
    /// Wraps the host end of the channel; the session starts in
    /// `Connecting` until the helper's handshake arrives.
    #[must_use]
    pub fn new(chan: Channel) -> Self {
        Self {
            chan,
            state: SessionState::Connecting,
            next_id: 1,
            outstanding: None,
            helper_pid: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Helper pid reported in the handshake, once connected.
    #[must_use]
    pub fn helper_pid(&self) -> Option<u32> {
        self.helper_pid
    }

    /// Waits for the helper's startup handshake.
    ///
    /// # Errors
    ///
    /// `HelperTimeout` if nothing arrives in time (the session closes);
    /// `Malformed` if the first message is not a compatible `Hello`.
    #[instrument(skip(self))]
    pub fn handshake(&mut self, timeout: Duration) -> Result<(), ProtocolError> {
        if self.state != SessionState::Connecting {
            return Err(ProtocolError::NotReady {
                state: self.state.as_str(),
            });
        }

        match self.chan.recv_timeout(timeout) {
            Ok(Some((frame, _))) => match frame.body {
                Body::Hello { protocol, pid } => {
                    if protocol != PROTOCOL_VERSION {
                        warn!(protocol, expected = PROTOCOL_VERSION, "Helper protocol mismatch");
                        self.close();
                        return Err(ProtocolError::Malformed {
                            reason: format!(
                                "helper speaks protocol {protocol}, host speaks {PROTOCOL_VERSION}"
                            ),
                        });
                    }
                    self.helper_pid = Some(pid);
                    self.state = SessionState::Ready;
                    debug!(pid, "Helper handshake complete");
                    Ok(())
                }
                other => {
                    self.close();
                    Err(ProtocolError::Malformed {
                        reason: format!("expected hello, got {other:?}"),
                    })
                }
            },
            Ok(None) => {
                self.state = SessionState::Closed;
                Err(ProtocolError::ChannelClosed)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Sends one request, transitioning to `AwaitingAck`.
    ///
    /// Exposed separately from [`Self::await_response`] so the
    /// one-outstanding-request discipline is enforced by state, not by
    /// caller convention.
    pub fn send_request(
        &mut self,
        body: Body,
        fd: Option<BorrowedFd<'_>>,
    ) -> Result<u64, ProtocolError> {
        match self.state {
            SessionState::Ready => {}
            SessionState::AwaitingAck => return Err(ProtocolError::RequestAlreadyPending),
            SessionState::Connecting => {
                return Err(ProtocolError::NotReady {
                    state: self.state.as_str(),
                })
            }
            SessionState::Closing | SessionState::Closed => {
                return Err(ProtocolError::ChannelClosed)
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        let frame = Frame { id, body };

        if let Err(e) = self.chan.send(&frame, fd) {
            self.close();
            return Err(e);
        }

        self.state = SessionState::AwaitingAck;
        self.outstanding = Some(id);
        trace!(id, "Request sent");
        Ok(id)
    }

    /// Awaits the response for the outstanding request.
    ///
    /// # Errors
    ///
    /// * `HelperTimeout` — nothing arrived in time; the session closes
    ///   (the sandboxed application is not killed for this).
    /// * `ProtocolDesync` — the response id does not match; the session
    ///   is forced to `Closing`.
    /// * `Rejected` — the helper answered with a failure message.
    pub fn await_response(&mut self, timeout: Duration) -> Result<Body, ProtocolError> {
        let Some(expected) = self.outstanding else {
            return Err(ProtocolError::NotReady {
                state: self.state.as_str(),
            });
        };

        match self.chan.recv_timeout(timeout) {
            Ok(Some((frame, _))) => {
                if frame.id != expected {
                    warn!(
                        expected,
                        got = frame.id,
                        "Response id mismatch, forcing session down"
                    );
                    self.outstanding = None;
                    self.state = SessionState::Closing;
                    self.chan.shutdown();
                    return Err(ProtocolError::ProtocolDesync {
                        expected,
                        got: frame.id,
                    });
                }
                self.outstanding = None;
                self.state = SessionState::Ready;
                match frame.body {
                    Body::Failure { message } => Err(ProtocolError::Rejected { message }),
                    body => Ok(body),
                }
            }
            Ok(None) => {
                self.outstanding = None;
                self.state = SessionState::Closed;
                Err(ProtocolError::ChannelClosed)
            }
            Err(e) => {
                // Timeout or transport fault: the session is done, only
                // the dynamic-grant feature degrades.
                self.outstanding = None;
                self.close();
                Err(e)
            }
        }
    }

    /// Passes a descriptor into the running sandbox.
    ///
    /// This is how an application receives access to a file picked on
    /// the host after launch, without any standing filesystem grant.
    #[instrument(skip(self, fd))]
    pub fn pass_fd(
        &mut self,
        fd: BorrowedFd<'_>,
        purpose: &str,
        path_hint: Option<&Path>,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        self.send_request(
            Body::PassFd {
                purpose: purpose.to_string(),
                path_hint: path_hint.map(|p| p.to_string_lossy().into_owned()),
            },
            Some(fd),
        )?;
        match self.await_response(timeout)? {
            Body::Ok => Ok(()),
            other => Err(ProtocolError::Malformed {
                reason: format!("expected ok, got {other:?}"),
            }),
        }
    }

    /// Queries the helper's runtime status.
    pub fn query_status(&mut self, timeout: Duration) -> Result<HelperStatus, ProtocolError> {
        self.send_request(Body::QueryStatus, None)?;
        match self.await_response(timeout)? {
            Body::Status {
                pid,
                children,
                uptime_secs,
            } => Ok(HelperStatus {
                pid,
                children,
                uptime_secs,
            }),
            other => Err(ProtocolError::Malformed {
                reason: format!("expected status, got {other:?}"),
            }),
        }
    }

    /// Runs a command inside the sandbox; captures output when `wait`.
    pub fn run_command(
        &mut self,
        argv: &[String],
        wait: bool,
        timeout: Duration,
    ) -> Result<Option<CommandResult>, ProtocolError> {
        self.send_request(
            Body::RunCommand {
                argv: argv.to_vec(),
                wait,
            },
            None,
        )?;
        match self.await_response(timeout)? {
            Body::Ok => Ok(None),
            Body::Output { stdout, exit_code } => Ok(Some(CommandResult { stdout, exit_code })),
            other => Err(ProtocolError::Malformed {
                reason: format!("expected ok or output, got {other:?}"),
            }),
        }
    }

    /// Asks the helper to shut the sandbox down cleanly.
    ///
    /// On acknowledgment the session moves to `Closing`; call
    /// [`Self::confirm_exited`] once the sandboxed process is reaped.
    #[instrument(skip(self))]
    pub fn request_shutdown(&mut self, timeout: Duration) -> Result<(), ProtocolError> {
        self.send_request(Body::Shutdown, None)?;
        match self.await_response(timeout)? {
            Body::Ok => {
                self.state = SessionState::Closing;
                debug!("Shutdown acknowledged");
                Ok(())
            }
            other => Err(ProtocolError::Malformed {
                reason: format!("expected ok, got {other:?}"),
            }),
        }
    }

    /// Marks the sandboxed process as reaped; releases the channel.
    pub fn confirm_exited(&mut self) {
        if self.state != SessionState::Closed {
            self.chan.shutdown();
            self.state = SessionState::Closed;
        }
    }

    /// Closes the session immediately.
    pub fn close(&mut self) {
        self.chan.shutdown();
        self.state = SessionState::Closed;
        self.outstanding = None;
    }
}
