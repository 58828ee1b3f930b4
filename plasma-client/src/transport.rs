// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under the MIT license found in the
// LICENSE file in the root directory of this source tree.

//! Capability interface over a single request/reply round trip to a Plasma
//! socket (store or manager), with ancillary `SCM_RIGHTS` descriptor receipt
//! abstracted behind a trait so tests can substitute an in-process double
//! for the real socket.

use crate::errors::TransportError;
use crate::protocol::{self, Frame, MessageType, DEFAULT_MAX_FRAME_LEN};
use std::io::Write;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;
use tracing::debug;

/// A reply frame plus an optional file descriptor received via ancillary
/// data, when the reply hands the client a new mapping.
pub struct Reply {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
    pub fd: Option<OwnedFd>,
}

/// One full request/reply round trip on a store-like socket. Calls are
/// strictly paired — the trait has no pipelining — matching the protocol's
/// one-outstanding-call-at-a-time framing. `send_request`/`recv_reply` are
/// split (rather than a single `call`) because `Get` sends one request and
/// reads back one reply frame per requested object, each with its own
/// optional descriptor.
pub trait StoreTransport {
    fn send_request(&mut self, msg_type: MessageType, payload: &[u8]) -> Result<(), TransportError>;
    fn recv_reply(&mut self) -> Result<Reply, TransportError>;

    fn call(&mut self, msg_type: MessageType, payload: &[u8]) -> Result<Reply, TransportError> {
        self.send_request(msg_type, payload)?;
        self.recv_reply()
    }

    /// Bounds how long the next `recv_reply` may block, as a safety net
    /// against a store that never replies to a blocking `Get`/`Wait`
    /// within the timeout it was asked to honor. `timeout_ms < 0` means
    /// block indefinitely. Transports with no notion of a read deadline
    /// (e.g. an in-process test double) can leave this a no-op.
    fn set_timeout(&mut self, _timeout_ms: i64) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A real Unix-domain-socket transport, framing messages per the wire codec
/// and receiving ancillary descriptors with raw `libc::recvmsg`.
pub struct UnixSocketTransport {
    stream: UnixStream,
    max_frame_len: u64,
}

impl UnixSocketTransport {
    /// Connects with bounded linear backoff: 1s after the first failure, 2s
    /// after the second, and so on, giving up once `num_retries` attempts
    /// have been made. Mirrors the accept-retry idiom used for inbound
    /// connections, applied here to an outbound connect.
    pub fn connect(socket_path: &str, num_retries: u32) -> Result<Self, TransportError> {
        let mut attempt = 0u32;
        loop {
            match UnixStream::connect(socket_path) {
                Ok(stream) => return Ok(UnixSocketTransport::new(stream)),
                Err(err) => {
                    attempt += 1;
                    debug!(attempt, %socket_path, "failed to connect to plasma socket: {}", err);
                    if attempt > num_retries {
                        return Err(TransportError::Io(err));
                    }
                    std::thread::sleep(Duration::from_secs(attempt.min(4) as u64));
                }
            }
        }
    }

    pub fn new(stream: UnixStream) -> Self {
        UnixSocketTransport {
            stream,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn set_max_frame_len(&mut self, max_frame_len: u64) {
        self.max_frame_len = max_frame_len;
    }
}

impl StoreTransport for UnixSocketTransport {
    fn send_request(&mut self, msg_type: MessageType, payload: &[u8]) -> Result<(), TransportError> {
        protocol::write_frame(&mut self.stream, msg_type, payload).map_err(TransportError::Io)
    }

    fn recv_reply(&mut self) -> Result<Reply, TransportError> {
        let (frame, fd) = recv_frame_with_fd(&self.stream, self.max_frame_len)?;
        let Frame { msg_type, payload } = frame;
        Ok(Reply {
            msg_type,
            payload,
            fd,
        })
    }

    /// A margin is added on top of `timeout_ms` (rather than passing it
    /// through verbatim) since the store is allowed to take until exactly
    /// the deadline to reply; a socket read timeout equal to the deadline
    /// could race a reply that is about to arrive.
    fn set_timeout(&mut self, timeout_ms: i64) -> Result<(), TransportError> {
        let dur = if timeout_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(timeout_ms as u64) + Duration::from_secs(5))
        };
        self.stream.set_read_timeout(dur).map_err(TransportError::Io)
    }
}

/// Half-duplex server-to-client stream of seal/delete notification frames,
/// independent of the request/reply socket. Reads exactly one frame per
/// call; the caller drives its own receive loop.
pub struct NotificationChannel {
    stream: UnixStream,
}

impl NotificationChannel {
    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        NotificationChannel {
            stream: UnixStream::from(fd),
        }
    }

    /// Reads exactly one `{object_id, data_size, metadata_size}` frame,
    /// blocking until the store writes it. `data_size == -1` signals a
    /// deletion.
    pub fn recv_notification(&mut self) -> Result<crate::notification::Notification, TransportError> {
        crate::notification::read_notification(&mut self.stream)
    }
}

/// Receives one framed message, pulling any `SCM_RIGHTS`-passed descriptor
/// out of the ancillary data alongside the header and payload.
fn recv_frame_with_fd(
    stream: &UnixStream,
    max_len: u64,
) -> Result<(Frame, Option<OwnedFd>), TransportError> {
    let header = recvmsg_with_fd(stream.as_raw_fd(), protocol::HEADER_LEN)?;
    let (header_bytes, mut fd) = header;
    if header_bytes.len() < protocol::HEADER_LEN {
        return Err(TransportError::ShortRead {
            expected: protocol::HEADER_LEN,
            actual: header_bytes.len(),
        });
    }
    let mut cursor = std::io::Cursor::new(&header_bytes);
    let raw_type = protocol::read_u32_le(&mut cursor).map_err(TransportError::Io)?;
    let msg_type = MessageType::from_u32(raw_type)?;
    let len = protocol::read_u64_le(&mut cursor).map_err(TransportError::Io)?;
    if len > max_len {
        return Err(TransportError::LengthExceedsCap(len, max_len));
    }

    let mut payload = Vec::with_capacity(len as usize);
    while (payload.len() as u64) < len {
        let remaining = (len - payload.len() as u64) as usize;
        let (chunk, chunk_fd) = recvmsg_with_fd(stream.as_raw_fd(), remaining)?;
        if chunk.is_empty() {
            return Err(TransportError::ShortRead {
                expected: len as usize,
                actual: payload.len(),
            });
        }
        payload.extend_from_slice(&chunk);
        if chunk_fd.is_some() {
            fd = chunk_fd;
        }
    }

    Ok((Frame { msg_type, payload }, fd))
}

/// Receives up to `max_bytes` from a Unix stream socket using `recvmsg`,
/// capturing a file descriptor passed via `SCM_RIGHTS` ancillary data if
/// the store sent one alongside this chunk.
fn recvmsg_with_fd(
    sock_fd: RawFd,
    max_bytes: usize,
) -> Result<(Vec<u8>, Option<OwnedFd>), TransportError> {
    let mut data_buf = vec![0u8; max_bytes];
    let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as _) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data_buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: data_buf.len(),
    };
    let mut msg = libc::msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_buf.len() as _,
        msg_flags: 0,
    };

    let n = unsafe { libc::recvmsg(sock_fd, &mut msg, 0) };
    if n < 0 {
        return Err(TransportError::Io(std::io::Error::last_os_error()));
    }
    data_buf.truncate(n as usize);

    let mut fd = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let raw: libc::c_int = std::ptr::read_unaligned(data as *const libc::c_int);
                fd = Some(OwnedFd::from_raw_fd(raw));
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((data_buf, fd))
}

/// Sends a single file descriptor alongside `payload` via `SCM_RIGHTS`; not
/// used by the client today (the store never expects a descriptor from the
/// client side) but kept as the symmetric half of the capability interface
/// for manager-side transfer plumbing built on top of this crate.
#[allow(dead_code)]
pub(crate) fn sendmsg_with_fd(stream: &mut UnixStream, payload: &[u8], fd: RawFd) -> std::io::Result<()> {
    let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as _) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let msg = libc::msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_buf.len() as _,
        msg_flags: 0,
    };

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<libc::c_int>() as _) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::c_int, fd);
    }

    let n = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    stream.flush()
}

#[cfg(not(unix))]
compile_error!("plasma-client requires a Unix platform for SCM_RIGHTS descriptor passing");

pub fn platform_supports_fd_passing() -> bool {
    // Ancillary-data fd passing is a Unix-domain-socket feature; this crate
    // only builds on Unix (see the compile_error! above), so it is always
    // available here. The function exists so Connect has a single place to
    // fail cleanly if that assumption is ever relaxed.
    true
}

pub(crate) fn warn_if_fd_unsupported() -> Result<(), TransportError> {
    if !platform_supports_fd_passing() {
        return Err(TransportError::FdPassingUnavailable);
    }
    Ok(())
}
