//! Namespace creation, entry, and id-map handshake (§4.7, C7).
//!
//! `create_ns`/`enter_ns` follow the teacher's `src/namespaces.rs`
//! (`Namespaces` struct wrapping a `clone_flags` bitmask built from a list
//! of requested kinds, with `apply_setns`/`apply_unshare` driving a
//! `Syscall` impl); the uid/gid map handshake is new, grounded on the
//! teacher's `process/channel.rs` pipe-framing idiom.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::PathBuf;

use nix::fcntl::{self, OFlag};
use nix::sched::CloneFlags;
use nix::sys::stat::Mode;
use nix::unistd::{close, Pid};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::syscall::Syscall;

/// The namespace kinds lxcpp knows how to create or enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NsKind {
    User,
    Pid,
    Mount,
    Net,
    Uts,
    Ipc,
    Cgroup,
}

impl NsKind {
    fn clone_flag(self) -> CloneFlags {
        match self {
            NsKind::User => CloneFlags::CLONE_NEWUSER,
            NsKind::Pid => CloneFlags::CLONE_NEWPID,
            NsKind::Mount => CloneFlags::CLONE_NEWNS,
            NsKind::Net => CloneFlags::CLONE_NEWNET,
            NsKind::Uts => CloneFlags::CLONE_NEWUTS,
            NsKind::Ipc => CloneFlags::CLONE_NEWIPC,
            NsKind::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }

    fn proc_name(self) -> &'static str {
        match self {
            NsKind::User => "user",
            NsKind::Pid => "pid",
            NsKind::Mount => "mnt",
            NsKind::Net => "net",
            NsKind::Uts => "uts",
            NsKind::Ipc => "ipc",
            NsKind::Cgroup => "cgroup",
        }
    }
}

/// Builds a `CLONE_NEW*` bitmask from the requested kinds; mirrors the
/// teacher's `From<Vec<LinuxNamespace>> for Namespaces`.
pub fn clone_flags(kinds: &[NsKind]) -> CloneFlags {
    kinds.iter().fold(CloneFlags::empty(), |acc, k| acc | k.clone_flag())
}

/// Opens current `/proc/{pid}/ns/{kind}` for every requested kind and calls
/// `setns` on each — the teacher's `apply_setns`, generalized from a single
/// fixed namespace list to an arbitrary requested set.
pub fn enter_ns(syscall: &dyn Syscall, pid: Pid, kinds: &[NsKind]) -> Result<()> {
    for kind in kinds {
        let path = PathBuf::from(format!("/proc/{}/ns/{}", pid, kind.proc_name()));
        let fd: RawFd = fcntl::open(&path, OFlag::O_RDONLY, Mode::empty())?;
        let result = syscall.set_ns(fd, kind.clone_flag());
        close(fd)?;
        result?;
        if *kind == NsKind::User {
            // Entering a user namespace resets euid/egid to the mapped root.
            syscall.set_id(nix::unistd::Uid::from_raw(0), nix::unistd::Gid::from_raw(0))?;
        }
    }
    Ok(())
}

/// `unshare()` into the requested set of namespaces in the current process,
/// without forking — the teacher's `apply_unshare`.
pub fn unshare_ns(syscall: &dyn Syscall, kinds: &[NsKind]) -> Result<()> {
    syscall.unshare(clone_flags(kinds))
}

/// One line of `/proc/{pid}/{uid,gid}_map`: `inside_id outside_id length`.
#[derive(Debug, Clone, Copy)]
pub struct IdMapping {
    pub inside_id: u32,
    pub outside_id: u32,
    pub length: u32,
}

impl IdMapping {
    fn line(&self) -> String {
        format!("{} {} {}\n", self.inside_id, self.outside_id, self.length)
    }
}

/// Half of the synchronization pipe described in §4.7: the child end reads
/// a single byte before it may proceed past `CLONE_NEWUSER`; the parent
/// writes the maps and then the byte. Holds bare fds so it stays `Copy`:
/// a `clone(2)`'d child inherits the same fd table as its parent, so both
/// sides legitimately hold the same two numbers after the process split.
#[derive(Debug, Clone, Copy)]
pub struct IdMapAckPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl IdMapAckPipe {
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        Ok(Self { read_fd, write_fd })
    }

    /// Child side: block until the parent has written the maps.
    pub fn wait_for_maps_written(&self) -> Result<()> {
        close(self.write_fd)?;
        let mut buf = [0u8; 1];
        let mut file = unsafe { std::fs::File::from_raw_fd(self.read_fd) };
        file.read_exact(&mut buf)
            .map_err(|e| Error::HandshakeFailed {
                step: 2,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Parent side: write the maps into `/proc/{pid}/{uid,gid}_map`, then
    /// release the child.
    pub fn write_id_maps_and_ack(
        &self,
        pid: Pid,
        uid_mappings: &[IdMapping],
        gid_mappings: &[IdMapping],
    ) -> Result<()> {
        close(self.read_fd)?;
        write_id_maps(pid, uid_mappings, gid_mappings)?;
        let mut file = unsafe { std::fs::File::from_raw_fd(self.write_fd) };
        file.write_all(&[0u8])
            .map_err(|e| Error::HandshakeFailed {
                step: 2,
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Writes `/proc/{pid}/uid_map` and `/proc/{pid}/gid_map`. Per `user_namespaces(7)`,
/// `setgroups` must be disabled before `gid_map` can be written without
/// `CAP_SETGID` in the parent's user namespace.
pub fn write_id_maps(pid: Pid, uid_mappings: &[IdMapping], gid_mappings: &[IdMapping]) -> Result<()> {
    if !gid_mappings.is_empty() {
        let setgroups = PathBuf::from(format!("/proc/{}/setgroups", pid));
        if let Ok(mut f) = OpenOptions::new().write(true).open(&setgroups) {
            let _ = f.write_all(b"deny");
        }
    }
    write_map_file(pid, "uid_map", uid_mappings)?;
    write_map_file(pid, "gid_map", gid_mappings)?;
    Ok(())
}

fn write_map_file(pid: Pid, file_name: &str, mappings: &[IdMapping]) -> Result<()> {
    if mappings.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(format!("/proc/{}/{}", pid, file_name));
    let mut contents = String::new();
    for m in mappings {
        contents.push_str(&m.line());
    }
    let mut f = OpenOptions::new()
        .write(true)
        .open(&path)
        .map_err(|source| Error::Io(source))?;
    f.write_all(contents.as_bytes()).map_err(Error::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;

    #[test]
    fn clone_flags_combine_all_kinds() {
        let kinds = [
            NsKind::User,
            NsKind::Pid,
            NsKind::Mount,
            NsKind::Net,
            NsKind::Uts,
            NsKind::Ipc,
            NsKind::Cgroup,
        ];
        let flags = clone_flags(&kinds);
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWCGROUP));
    }

    #[test]
    fn unshare_ns_forwards_combined_flags() {
        let syscall = TestHelperSyscall::default();
        unshare_ns(&syscall, &[NsKind::Mount, NsKind::Uts]).unwrap();
        let calls = syscall.get_unshare_args();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains(CloneFlags::CLONE_NEWNS));
        assert!(calls[0].contains(CloneFlags::CLONE_NEWUTS));
    }

    #[test]
    fn id_mapping_formats_as_three_columns() {
        let m = IdMapping {
            inside_id: 0,
            outside_id: 100000,
            length: 65536,
        };
        assert_eq!(m.line(), "0 100000 65536\n");
    }
}
