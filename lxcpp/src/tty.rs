//! Terminal multiplexer (§4.11, C11): N pty pairs allocated inside the zone,
//! master fds shipped to the host over the command channel, host-side
//! attach/detach console sessions.
//!
//! Grounded on the teacher's `src/tty.rs`: the same `nix::pty::openpty` +
//! `socket::sendmsg`/`ScmRights` ancillary-fd send, the same `setsid` +
//! `TIOCSCTTY` dance for the slave that becomes init's controlling
//! terminal. Generalized from the teacher's single console socket to
//! `terminal_count` independent pty pairs (§3.1), and extended with the
//! host-side registry and attach/detach session the teacher has no
//! equivalent for (its consoles are an external-tool concern, not the
//! runtime's).

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use nix::pty::{openpty, OpenptyResult};
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoVec;
use nix::unistd::{close, setsid};

use crate::error::{Error, Result};

/// One allocated pty pair, as seen from inside the zone before the master
/// is shipped off over the command channel.
pub struct PtyPair {
    pub master: RawFd,
    pub slave: RawFd,
}

/// §4.11: "For each i in [0, terminal_count): open a new pty master, grant
/// and unlock it, note the slave path." `openpty` already returns a
/// granted/unlocked pair on Linux, matching the teacher's single-pty use.
pub fn allocate(terminal_count: u32) -> Result<Vec<PtyPair>> {
    let mut pairs = Vec::with_capacity(terminal_count as usize);
    for _ in 0..terminal_count {
        let OpenptyResult { master, slave } =
            openpty(None, None).map_err(|e| Error::Kernel(-1, e.to_string()))?;
        pairs.push(PtyPair { master, slave });
    }
    Ok(pairs)
}

/// Makes `slave` the calling process's controlling terminal and duplicates
/// it onto stdin/stdout/stderr — run once, by init, for its own console
/// (the teacher's `setup_console`, restricted to the session/ctty part;
/// fd shipping is `send_master` below, called separately per pty).
pub fn make_controlling(slave: RawFd) -> Result<()> {
    setsid().map_err(|e| Error::Kernel(-1, e.to_string()))?;
    if unsafe { libc::ioctl(slave, libc::TIOCSCTTY) } < 0 {
        log::warn!("could not TIOCSCTTY on pty slave fd {}", slave);
    }
    for target in [0, 1, 2] {
        if target != slave {
            nix::unistd::dup2(slave, target).map_err(|e| Error::Kernel(-1, e.to_string()))?;
        }
    }
    Ok(())
}

/// §4.11: "Send every pty master fd back to the host over the command
/// channel (SCM_RIGHTS, one fd per message)." One byte of payload
/// identifies the terminal index, matching §4.3's ancillary-fd framing
/// convention (one fd, one byte of payload per message).
pub fn send_master(channel_fd: RawFd, index: u32, master: RawFd) -> Result<()> {
    let index_byte = [index as u8];
    let iov = [IoVec::from_slice(&index_byte)];
    let fds = [master];
    let cmsg = ControlMessage::ScmRights(&fds);
    socket::sendmsg(channel_fd, &iov, &[cmsg], MsgFlags::empty(), None)
        .map_err(|e| Error::Kernel(-1, e.to_string()))?;
    Ok(())
}

/// Host side of `send_master`: receives one index-tagged master fd.
pub fn receive_master(channel_fd: RawFd) -> Result<(u32, RawFd)> {
    let mut index_byte = [0u8; 1];
    let mut iov = [IoVec::from_mut_slice(&mut index_byte)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let msg = socket::recvmsg(channel_fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
        .map_err(|e| Error::Kernel(-1, e.to_string()))?;

    let mut master = None;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            master = fds.into_iter().next();
        }
    }
    let master = master.ok_or_else(|| Error::Kernel(-1, "no fd in ancillary data".into()))?;
    Ok((index_byte[0] as u32, master))
}

/// Host-side record of live console master fds and attached sessions,
/// keyed by `{container, index}` per §4.11.
#[derive(Default)]
pub struct ConsoleRegistry {
    masters: HashMap<(String, u32), RawFd>,
    attached: HashMap<(String, u32), bool>,
}

impl ConsoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, container: &str, index: u32, master: RawFd) {
        self.masters.insert((container.to_string(), index), master);
        self.attached.insert((container.to_string(), index), false);
    }

    /// `attach(index)`: "returns the master fd to a console client". Fails
    /// if a client is already attached to keep the copy loop single-owner.
    pub fn attach(&mut self, container: &str, index: u32) -> Result<RawFd> {
        let key = (container.to_string(), index);
        let master = *self
            .masters
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("console {} on {}", index, container)))?;
        if *self.attached.get(&key).unwrap_or(&false) {
            return Err(Error::Busy(format!("console {} on {} already attached", index, container)));
        }
        self.attached.insert(key, true);
        Ok(master)
    }

    /// `detach`: "closes the console client's end; the master stays live,
    /// preserving scrollback for re-attach."
    pub fn detach(&mut self, container: &str, index: u32) {
        self.attached.insert((container.to_string(), index), false);
    }

    /// Removes and closes every master belonging to `container`, called
    /// when the container transitions to STOPPED.
    pub fn remove_all(&mut self, container: &str) {
        let keys: Vec<(String, u32)> = self
            .masters
            .keys()
            .filter(|(c, _)| c == container)
            .cloned()
            .collect();
        for key in keys {
            if let Some(fd) = self.masters.remove(&key) {
                let _ = close(fd);
            }
            self.attached.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_single_pty_succeeds() {
        let pairs = allocate(1).unwrap();
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].master >= 0);
        let _ = close(pairs[0].master);
        let _ = close(pairs[0].slave);
    }

    #[test]
    fn master_fd_round_trips_over_a_socketpair() {
        let (a, b) = socket::socketpair(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            None,
            socket::SockFlag::empty(),
        )
        .unwrap();
        let pairs = allocate(1).unwrap();
        send_master(a, 3, pairs[0].master).unwrap();
        let (index, received) = receive_master(b).unwrap();
        assert_eq!(index, 3);
        assert!(received >= 0);
        let _ = close(a);
        let _ = close(b);
        let _ = close(pairs[0].master);
        let _ = close(pairs[0].slave);
        let _ = close(received);
    }

    #[test]
    fn registry_rejects_double_attach() {
        let mut reg = ConsoleRegistry::new();
        reg.record("zone-a", 0, 42);
        assert!(reg.attach("zone-a", 0).is_ok());
        assert!(reg.attach("zone-a", 0).is_err());
        reg.detach("zone-a", 0);
        assert!(reg.attach("zone-a", 0).is_ok());
    }
}
