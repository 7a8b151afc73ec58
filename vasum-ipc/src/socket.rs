//! Socket transport (§4.3, C3): length-prefixed framed reads/writes on an
//! `AF_UNIX` stream socket, plus the `SCM_RIGHTS` fd-passing helpers the
//! codec (C4) and terminal multiplexer (C11) build on.
//!
//! Grounded on the teacher's `notify_socket.rs` (the chdir-around-bind
//! workaround for the 108-byte `sun_path` limit, reused here for the
//! control socket path) and `tty.rs`'s `sendmsg`/`ScmRights` ancillary-fd
//! idiom, generalized from "exactly one fd" to `send_fd`/`receive_fd`
//! helpers any caller can use per message.
//!
//! All I/O paths treat `EINTR` as retryable and `EAGAIN`/`EWOULDBLOCK` as
//! "re-arm via poll", exactly as §4.3 specifies.

use std::convert::TryInto;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{
    self, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType,
    UnixAddr,
};
use nix::sys::uio::IoVec;
use nix::unistd::{self, chdir, getcwd};

use crate::error::{Error, Result};

/// One frame on the wire (§3.3).
#[derive(Debug, Clone)]
pub struct Frame {
    pub method_id: u32,
    pub message_id: [u8; 16],
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub const FLAG_EXPECTS_REPLY: u8 = 0b01;
    pub const FLAG_ERROR: u8 = 0b10;
    /// High bit of `method_id` marks a signal (§3.3).
    pub const SIGNAL_BIT: u32 = 0x8000_0000;

    pub fn is_reply(&self) -> bool {
        self.method_id == 0
    }

    pub fn is_signal(&self) -> bool {
        self.method_id & Self::SIGNAL_BIT != 0
    }

    fn header_bytes(&self) -> [u8; 4 + 16 + 1 + 4] {
        let mut buf = [0u8; 25];
        buf[0..4].copy_from_slice(&self.method_id.to_be_bytes());
        buf[4..20].copy_from_slice(&self.message_id);
        buf[20] = self.flags;
        buf[21..25].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf
    }
}

/// A connected or listening `AF_UNIX` stream socket.
pub struct Socket {
    fd: RawFd,
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Socket {
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Dials `path`. Uses the teacher's chdir-around-connect workaround
    /// (`notify_socket.rs`) so paths beyond `sun_path`'s 108-byte limit
    /// still work.
    pub fn connect(path: &Path) -> Result<Self> {
        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )?;
        with_short_cwd(path, |name| {
            let addr = UnixAddr::new(name)?;
            match socket::connect(fd, &socket::SockAddr::Unix(addr)) {
                Ok(()) => Ok(()),
                Err(nix::Error::Sys(Errno::EINPROGRESS)) => Ok(()),
                Err(e) => Err(Error::from(e)),
            }
        })?;
        Ok(Self { fd })
    }

    /// Binds and listens at `path` (host default `/run/vasum/host.sock`,
    /// zone default `/run/vasum/zone.sock`, §6.1).
    pub fn listen(path: &Path, backlog: usize) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )?;
        with_short_cwd(path, |name| {
            let addr = UnixAddr::new(name)?;
            socket::bind(fd, &socket::SockAddr::Unix(addr)).map_err(Error::from)
        })?;
        socket::listen(fd, backlog)?;
        Ok(Self { fd })
    }

    /// Non-blocking accept: `Ok(None)` when nothing is pending yet.
    pub fn accept(&self) -> Result<Option<Self>> {
        match socket::accept4(self.fd, SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK) {
            Ok(fd) => Ok(Some(Self { fd })),
            Err(nix::Error::Sys(Errno::EAGAIN)) => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn wait_ready(&self, flags: PollFlags, deadline: Option<Instant>) -> Result<()> {
        loop {
            let timeout_ms = match deadline {
                None => -1,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::Timeout);
                    }
                    (d - now).as_millis() as i32
                }
            };
            let mut fds = [PollFd::new(self.fd, flags)];
            match poll(&mut fds, timeout_ms) {
                Ok(0) => return Err(Error::Timeout),
                Ok(_) => return Ok(()),
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    /// `write_all(buf, timeout)` (§4.3): re-enters the poll on
    /// `EAGAIN`/`EINTR`, fails with `timeout` past the deadline or
    /// `peer_disconnected` on `EPIPE`.
    pub fn write_all(&self, buf: &[u8], deadline: Option<Instant>) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            match unistd::write(self.fd, &buf[written..]) {
                Ok(n) => written += n,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(nix::Error::Sys(Errno::EAGAIN)) => self.wait_ready(PollFlags::POLLOUT, deadline)?,
                Err(nix::Error::Sys(Errno::EPIPE)) => return Err(Error::PeerDisconnected),
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(())
    }

    /// `read_all(buf, timeout)`. Reads exactly `buf.len()` bytes or fails;
    /// a zero-length read before the buffer fills means the peer closed.
    pub fn read_all(&self, buf: &mut [u8], deadline: Option<Instant>) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match unistd::read(self.fd, &mut buf[filled..]) {
                Ok(0) => return Err(Error::PeerDisconnected),
                Ok(n) => filled += n,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(nix::Error::Sys(Errno::EAGAIN)) => self.wait_ready(PollFlags::POLLIN, deadline)?,
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(())
    }

    /// Sends exactly one fd via an ancillary message carrying a single
    /// byte of payload (§4.3), matching `tty.rs`'s `send_master`.
    pub fn send_fd(&self, fd: RawFd, deadline: Option<Instant>) -> Result<()> {
        let payload = [0u8];
        let iov = [IoVec::from_slice(&payload)];
        let cmsg = [ControlMessage::ScmRights(&[fd])];
        loop {
            match socket::sendmsg(self.fd, &iov, &cmsg, MsgFlags::empty(), None) {
                Ok(_) => return Ok(()),
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(nix::Error::Sys(Errno::EAGAIN)) => self.wait_ready(PollFlags::POLLOUT, deadline)?,
                Err(nix::Error::Sys(Errno::EPIPE)) => return Err(Error::PeerDisconnected),
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    /// Receives exactly one fd sent by `send_fd`.
    pub fn receive_fd(&self, deadline: Option<Instant>) -> Result<RawFd> {
        let mut payload = [0u8; 1];
        let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
        loop {
            let mut iov = [IoVec::from_mut_slice(&mut payload)];
            match socket::recvmsg(self.fd, &mut iov, Some(&mut cmsg_space), MsgFlags::empty()) {
                Ok(msg) if msg.bytes == 0 => return Err(Error::PeerDisconnected),
                Ok(msg) => {
                    for cmsg in msg.cmsgs() {
                        if let ControlMessageOwned::ScmRights(fds) = cmsg {
                            if let Some(fd) = fds.into_iter().next() {
                                return Ok(fd);
                            }
                        }
                    }
                    return Err(Error::InvalidFrame("no fd in ancillary data".into()));
                }
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(nix::Error::Sys(Errno::EAGAIN)) => self.wait_ready(PollFlags::POLLIN, deadline)?,
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    /// Writes `frame`'s header and payload, then its ancillary fds in
    /// order, one `send_fd` per entry (§4.4: "paired in order").
    pub fn write_frame(&self, frame: &Frame, fds: &[RawFd], deadline: Option<Instant>) -> Result<()> {
        self.write_all(&frame.header_bytes(), deadline)?;
        self.write_all(&frame.payload, deadline)?;
        for fd in fds {
            self.send_fd(*fd, deadline)?;
        }
        Ok(())
    }

    /// Reads one frame's header and payload. Ancillary fds are not
    /// fetched here: the caller pulls exactly as many as the decoded
    /// payload type's `FileDescriptor` fields need, via `receive_fd`.
    pub fn read_frame(&self, deadline: Option<Instant>) -> Result<Frame> {
        let mut header = [0u8; 25];
        self.read_all(&mut header, deadline)?;
        let method_id = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let mut message_id = [0u8; 16];
        message_id.copy_from_slice(&header[4..20]);
        let flags = header[20];
        let payload_len = u32::from_be_bytes(header[21..25].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; payload_len];
        self.read_all(&mut payload, deadline)?;
        Ok(Frame { method_id, message_id, flags, payload })
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = unistd::close(self.fd);
    }
}

/// Runs `f` with the process chdir'd into `path`'s parent directory so a
/// bind/connect can use the short relative file name, avoiding
/// `sun_path`'s 108-byte ceiling (teacher's `notify_socket.rs`).
fn with_short_cwd<T>(path: &Path, f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let name = path.file_name().map(Path::new).unwrap_or(path);
    match parent {
        None => f(name),
        Some(dir) => {
            let cwd = getcwd()?;
            chdir(dir)?;
            let result = f(name);
            chdir(&cwd)?;
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Socket, Socket) {
        let (a, b) = socket::socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        )
        .unwrap();
        (Socket::from_raw_fd(a), Socket::from_raw_fd(b))
    }

    #[test]
    fn write_all_read_all_round_trip() {
        let (a, b) = pair();
        a.write_all(b"hello", None).unwrap();
        let mut buf = [0u8; 5];
        b.read_all(&mut buf, None).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_all_times_out() {
        let (_a, b) = pair();
        let mut buf = [0u8; 4];
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = b.read_all(&mut buf, Some(deadline)).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn closing_the_peer_is_observed_as_disconnect() {
        let (a, b) = pair();
        drop(a);
        let mut buf = [0u8; 1];
        let err = b.read_all(&mut buf, None).unwrap_err();
        assert!(matches!(err, Error::PeerDisconnected));
    }

    #[test]
    fn frame_round_trips_over_a_socketpair() {
        let (a, b) = pair();
        let frame = Frame {
            method_id: 42,
            message_id: [7u8; 16],
            flags: Frame::FLAG_EXPECTS_REPLY,
            payload: b"payload bytes".to_vec(),
        };
        a.write_frame(&frame, &[], None).unwrap();
        let got = b.read_frame(None).unwrap();
        assert_eq!(got.method_id, 42);
        assert_eq!(got.payload, frame.payload);
        assert_eq!(got.flags, Frame::FLAG_EXPECTS_REPLY);
    }

    #[test]
    fn fd_travels_alongside_a_frame() {
        let (a, b) = pair();
        let frame = Frame { method_id: 1, message_id: [0u8; 16], flags: 0, payload: vec![] };
        let (r, w) = unistd::pipe().unwrap();
        a.write_frame(&frame, &[r], None).unwrap();
        let _ = b.read_frame(None).unwrap();
        let received = b.receive_fd(None).unwrap();
        assert!(received >= 0);
        let _ = unistd::close(r);
        let _ = unistd::close(w);
        let _ = unistd::close(received);
    }
}
