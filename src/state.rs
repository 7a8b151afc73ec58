//! Persisted zone state under `${workPath}/state/` (§6.4).
//!
//! This is deliberately a thin, flat-file mirror of state the daemon
//! already holds in memory (`lxcpp::container::State`/`RuntimeHandles`):
//! `init.pid` and the one-word `state` file let an external tool (or a
//! human with `cat`) inspect a zone without going through the control
//! socket, the same way the teacher leaves `state.json` next to a
//! container's bundle for `runc state` to read back. `console.<i>.sock`
//! paths are handed out here but the sockets themselves are owned and
//! bound by the console multiplexer (`lxcpp::tty`).

use std::fs;
use std::io;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use lxcpp::container::ContainerState;

/// Paths into one zone's `${workPath}/state/` directory.
#[derive(Debug, Clone)]
pub struct ZoneStateDir {
    dir: PathBuf,
}

impl ZoneStateDir {
    pub fn new(work_path: &Path) -> Self {
        Self {
            dir: work_path.join("state"),
        }
    }

    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    pub fn init_pid_path(&self) -> PathBuf {
        self.dir.join("init.pid")
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join("state")
    }

    pub fn console_socket_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("console.{}.sock", index))
    }

    /// Marker the in-zone agent writes before exiting 0 on a requested
    /// reboot (§4.12 "Reboot"; original behavior, path fixed per
    /// `lxcpp::lifecycle::reboot_marker_path`, which the guard reads from
    /// and removes on the other end of the same path).
    pub fn reboot_marker_path(&self) -> PathBuf {
        self.dir.join("reboot")
    }

    pub fn write_init_pid(&self, pid: i32) -> io::Result<()> {
        self.ensure()?;
        fs::write(self.init_pid_path(), pid.to_string())
    }

    pub fn read_init_pid(&self) -> io::Result<i32> {
        let raw = fs::read_to_string(self.init_pid_path())?;
        raw.trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn write_state(&self, state: ContainerState) -> io::Result<()> {
        self.ensure()?;
        fs::write(self.state_path(), state_word(state))
    }

    pub fn read_state(&self) -> io::Result<Option<ContainerState>> {
        match fs::read_to_string(self.state_path()) {
            Ok(raw) => Ok(parse_state_word(raw.trim())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Binds the Unix socket a console client connects to for console
    /// index `index`; the caller hands the listener off to the session
    /// loop that relays bytes to/from the matching pty master.
    pub fn bind_console_socket(&self, index: u32) -> io::Result<UnixListener> {
        self.ensure()?;
        let path = self.console_socket_path(index);
        let _ = fs::remove_file(&path);
        UnixListener::bind(path)
    }

    /// Removes the whole `state/` directory, including any stray console
    /// sockets left by a crashed session — called on `destroy_zone`.
    pub fn remove_all(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn state_word(state: ContainerState) -> &'static str {
    match state {
        ContainerState::Stopped => "STOPPED",
        ContainerState::Starting => "STARTING",
        ContainerState::Running => "RUNNING",
        ContainerState::Stopping => "STOPPING",
        ContainerState::Paused => "PAUSED",
    }
}

fn parse_state_word(word: &str) -> Option<ContainerState> {
    match word {
        "STOPPED" => Some(ContainerState::Stopped),
        "STARTING" => Some(ContainerState::Starting),
        "RUNNING" => Some(ContainerState::Running),
        "STOPPING" => Some(ContainerState::Stopping),
        "PAUSED" => Some(ContainerState::Paused),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_pid_round_trips_through_the_state_dir() {
        let work = tempdir().unwrap();
        let dir = ZoneStateDir::new(work.path());
        dir.write_init_pid(4242).unwrap();
        assert_eq!(dir.read_init_pid().unwrap(), 4242);
    }

    #[test]
    fn state_word_round_trips() {
        let work = tempdir().unwrap();
        let dir = ZoneStateDir::new(work.path());
        dir.write_state(ContainerState::Running).unwrap();
        assert_eq!(dir.read_state().unwrap(), Some(ContainerState::Running));
    }

    #[test]
    fn missing_state_file_reads_as_none() {
        let work = tempdir().unwrap();
        let dir = ZoneStateDir::new(work.path());
        assert_eq!(dir.read_state().unwrap(), None);
    }

    #[test]
    fn console_socket_path_is_namespaced_by_index() {
        let work = tempdir().unwrap();
        let dir = ZoneStateDir::new(work.path());
        assert_ne!(dir.console_socket_path(0), dir.console_socket_path(1));
    }

    #[test]
    fn remove_all_is_idempotent_on_a_missing_dir() {
        let work = tempdir().unwrap();
        let dir = ZoneStateDir::new(&work.path().join("never-created"));
        dir.remove_all().unwrap();
        dir.remove_all().unwrap();
    }
}
