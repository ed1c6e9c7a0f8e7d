//! Wire format of the helper channel.
//!
//! Messages are length-prefixed JSON frames over a `SOCK_SEQPACKET`
//! socketpair: a 4-byte big-endian payload length followed by the
//! payload. The seqpacket transport delivers one frame per `recvmsg`,
//! and the in-band prefix is verified against the received size so the
//! format stays self-describing and backward compatible within a major
//! protocol version.
//!
//! `PassFd` frames carry the descriptor out-of-band via `SCM_RIGHTS`
//! ancillary data, alongside the in-band purpose/path-hint record. The
//! channel descriptor itself is inherited through the containment
//! primitive at launch — the sandbox has no view of host-side naming, so
//! nothing is ever re-established by name.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    recvmsg, sendmsg, shutdown, socketpair, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, Shutdown, SockFlag, SockType,
};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::ProtocolError;

/// Protocol major version, sent in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame, prefix included.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// One framed message: request/response identifier plus tagged body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Request identifier; responses echo the identifier of the request
    /// they answer.
    pub id: u64,
    #[serde(flatten)]
    pub body: Body,
}

/// Message kinds, tagged in-band.
///
/// Host → helper: `PassFd`, `QueryStatus`, `RunCommand`, `Shutdown`.
/// Helper → host: `Hello` (handshake), `Ok`, `Status`, `Output`,
/// `Failure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Body {
    /// Helper startup handshake: its execution environment is live.
    Hello { protocol: u32, pid: u32 },
    /// Grant a descriptor to the running sandbox. The descriptor rides
    /// in the frame's ancillary data.
    PassFd {
        purpose: String,
        path_hint: Option<String>,
    },
    /// Ask the helper for its runtime status.
    QueryStatus,
    /// Execute a command inside the sandbox.
    RunCommand { argv: Vec<String>, wait: bool },
    /// Ask the helper to shut the sandbox down cleanly.
    Shutdown,
    /// Generic success acknowledgment.
    Ok,
    /// Status response.
    Status {
        pid: u32,
        children: u32,
        uptime_secs: u64,
    },
    /// Captured output of a waited-for command.
    Output { stdout: String, exit_code: i32 },
    /// The helper could not honor the request.
    Failure { message: String },
}

/// One end of the helper channel.
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
}

impl Channel {
    /// Creates a connected channel pair (host end, helper end).
    pub fn pair() -> Result<(Channel, Channel), ProtocolError> {
        let (host, helper) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|errno| ProtocolError::Io {
            context: "socketpair failed".to_string(),
            source: std::io::Error::from(errno),
        })?;
        Ok((Channel { fd: host }, Channel { fd: helper }))
    }

    /// Wraps an inherited descriptor (the helper side of the pair).
    #[must_use]
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Consumes the channel, returning the descriptor for inheritance.
    #[must_use]
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Sends one frame, optionally with a descriptor in ancillary data.
    pub fn send(&self, frame: &Frame, fd: Option<BorrowedFd<'_>>) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(frame).map_err(|e| ProtocolError::Malformed {
            reason: format!("failed to encode frame: {e}"),
        })?;
        if payload.len() + 4 > MAX_FRAME_BYTES {
            return Err(ProtocolError::Malformed {
                reason: format!("frame of {} bytes exceeds the maximum", payload.len() + 4),
            });
        }

        let mut buffer = Vec::with_capacity(payload.len() + 4);
        buffer.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buffer.extend_from_slice(&payload);

        let iov = [IoSlice::new(&buffer)];
        let raw_fds: [RawFd; 1];
        let cmsgs: Vec<ControlMessage<'_>> = match fd {
            Some(fd) => {
                raw_fds = [fd.as_raw_fd()];
                vec![ControlMessage::ScmRights(&raw_fds)]
            }
            None => Vec::new(),
        };

        sendmsg::<()>(
            self.fd.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::MSG_NOSIGNAL,
            None,
        )
        .map_err(|errno| match errno {
            nix::errno::Errno::EPIPE | nix::errno::Errno::ECONNRESET => {
                ProtocolError::ChannelClosed
            }
            other => ProtocolError::Io {
                context: "sendmsg failed".to_string(),
                source: std::io::Error::from(other),
            },
        })?;

        trace!(id = frame.id, with_fd = fd.is_some(), "Frame sent");
        Ok(())
    }

    /// Receives one frame within the timeout.
    ///
    /// Returns `Ok(None)` on end-of-stream and
    /// `Err(ProtocolError::HelperTimeout)` when nothing arrived in time.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<(Frame, Option<OwnedFd>)>, ProtocolError> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProtocolError::HelperTimeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }

            let millis = remaining.as_millis().min(u128::from(u16::MAX)) as u16;
            let mut poll_fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
            let ready = poll(&mut poll_fds, PollTimeout::from(millis)).map_err(|errno| {
                ProtocolError::Io {
                    context: "poll failed".to_string(),
                    source: std::io::Error::from(errno),
                }
            })?;
            if ready > 0 {
                break;
            }
        }

        let mut buffer = vec![0u8; MAX_FRAME_BYTES];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
        let mut iov = [IoSliceMut::new(&mut buffer)];

        let (bytes, passed_fd) = {
            let msg = recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )
            .map_err(|errno| match errno {
                nix::errno::Errno::ECONNRESET => ProtocolError::ChannelClosed,
                other => ProtocolError::Io {
                    context: "recvmsg failed".to_string(),
                    source: std::io::Error::from(other),
                },
            })?;

            let mut passed_fd = None;
            if let Ok(cmsgs) = msg.cmsgs() {
                for cmsg in cmsgs {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        for raw in fds {
                            // SAFETY: the kernel just handed us this
                            // descriptor; we are its first owner.
                            passed_fd = Some(unsafe {
                                <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(raw)
                            });
                        }
                    }
                }
            }
            (msg.bytes, passed_fd)
        };

        if bytes == 0 {
            trace!("Channel reached end-of-stream");
            return Ok(None);
        }

        let frame = decode_frame(&buffer[..bytes])?;
        trace!(id = frame.id, with_fd = passed_fd.is_some(), "Frame received");
        Ok(Some((frame, passed_fd)))
    }

    /// Closes both directions without dropping the descriptor.
    pub fn shutdown(&self) {
        let _ = shutdown(self.fd.as_raw_fd(), Shutdown::Both);
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn decode_frame(datagram: &[u8]) -> Result<Frame, ProtocolError> {
    if datagram.len() < 4 {
        return Err(ProtocolError::Malformed {
            reason: format!("frame of {} bytes is shorter than the prefix", datagram.len()),
        });
    }
    let declared = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]) as usize;
    let payload = &datagram[4..];
    if declared != payload.len() {
        return Err(ProtocolError::Malformed {
            reason: format!(
                "length prefix says {declared} bytes but frame carries {}",
                payload.len()
            ),
        });
    }
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed {
        reason: format!("undecodable payload: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_frame_round_trip() {
        let (host, helper) = Channel::pair().expect("channel pair");

        let frame = Frame {
            id: 42,
            body: Body::RunCommand {
                argv: vec!["echo".into(), "hi".into()],
                wait: true,
            },
        };
        host.send(&frame, None).expect("send");

        let (received, fd) = helper
            .recv_timeout(Duration::from_secs(1))
            .expect("recv")
            .expect("frame present");
        assert_eq!(received, frame);
        assert!(fd.is_none());
    }

    #[test]
    fn test_fd_passing() {
        let (host, helper) = Channel::pair().expect("channel pair");
        let (read_end, write_end) = nix::unistd::pipe().expect("pipe");
        let mut read_end = std::fs::File::from(read_end);

        let frame = Frame {
            id: 1,
            body: Body::PassFd {
                purpose: "document".into(),
                path_hint: Some("/home/user/notes.txt".into()),
            },
        };
        host.send(&frame, Some(write_end.as_fd()))
            .expect("send with fd");
        drop(write_end);

        let (_, passed) = helper
            .recv_timeout(Duration::from_secs(1))
            .expect("recv")
            .expect("frame present");
        let passed = passed.expect("descriptor must arrive");

        // The received descriptor is the pipe's write end.
        let mut writer = std::fs::File::from(passed);
        writer.write_all(b"through the wall").expect("write");
        drop(writer);

        let mut contents = String::new();
        read_end.read_to_string(&mut contents).expect("read");
        assert_eq!(contents, "through the wall");
    }

    #[test]
    fn test_recv_timeout() {
        let (host, _helper) = Channel::pair().expect("channel pair");
        let result = host.recv_timeout(Duration::from_millis(50));
        assert!(matches!(
            result,
            Err(ProtocolError::HelperTimeout { .. })
        ));
    }

    #[test]
    fn test_eof_on_peer_drop() {
        let (host, helper) = Channel::pair().expect("channel pair");
        drop(helper);
        let result = host.recv_timeout(Duration::from_secs(1)).expect("recv");
        assert!(result.is_none(), "peer drop must read as end-of-stream");
    }

    #[test]
    fn test_malformed_prefix_rejected() {
        let err = decode_frame(&[0, 0, 0, 99, b'{', b'}']).expect_err("bad prefix");
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_kind_tags_are_stable() {
        // Wire compatibility: the helper inside the sandbox may be an
        // older or newer build than the host.
        let json = serde_json::to_string(&Frame {
            id: 7,
            body: Body::QueryStatus,
        })
        .expect("encode");
        assert!(json.contains("\"kind\":\"query-status\""));

        let json = serde_json::to_string(&Frame {
            id: 8,
            body: Body::PassFd {
                purpose: "download".into(),
                path_hint: None,
            },
        })
        .expect("encode");
        assert!(json.contains("\"kind\":\"pass-fd\""));
    }
}
