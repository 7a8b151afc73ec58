//! The Container data model (§3.1) and its state machine (§4.12).
//!
//! Grounded on the teacher's `src/container/{state,container}.rs`: a
//! `serde`-backed `State` struct persisted as JSON plus a thin `Container`
//! wrapper exposing status-query helpers. Generalized from youki's
//! OCI-bundle-shaped state to vasum's own container model, and extended
//! with the runtime-only handles (`guard_pid`, `command_fd`, `init_sync_fd`)
//! that only exist while the container isn't STOPPED.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use cgroups::manager::CgroupConfig;

use crate::error::{Error, Result};
use crate::namespaces::NsKind;
use crate::network::InterfaceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContainerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Paused,
}

impl ContainerState {
    pub fn can_start(&self) -> bool {
        matches!(self, ContainerState::Stopped)
    }

    pub fn can_shutdown(&self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Paused)
    }

    pub fn can_destroy(&self) -> bool {
        !matches!(self, ContainerState::Stopped)
    }

    pub fn can_freeze(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    pub fn can_thaw(&self) -> bool {
        matches!(self, ContainerState::Paused)
    }
}

/// A single `(inside_id, outside_id, count)` mapping triple (§3.1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IdMapRange {
    pub inside_id: u32,
    pub outside_id: u32,
    pub count: u32,
}

/// A single ordered mount declaration applied after the root switch (§4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountDeclaration {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: u64,
    pub data: Option<String>,
    pub mode: u32,
}

/// Persisted, serializable snapshot of a container's configuration and
/// runtime state — the teacher's `State`, generalized to vasum's model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    pub hostname: String,
    pub root_path: PathBuf,
    pub work_path: PathBuf,
    pub init_argv: Vec<String>,
    pub uid_mappings: Vec<IdMapRange>,
    pub gid_mappings: Vec<IdMapRange>,
    pub namespaces: Vec<NsKind>,
    pub network_config: Vec<InterfaceConfig>,
    pub cgroup_config: CgroupConfig,
    pub mount_config: Vec<MountDeclaration>,
    pub link_provisions: Vec<crate::rootfs::LinkProvision>,
    pub file_provisions: Vec<crate::rootfs::FileProvision>,
    pub terminal_count: u32,
    pub status: ContainerState,
    pub init_pid: Option<i32>,
    #[serde(skip)]
    pub guard_pid: Option<Pid>,
    #[serde(skip)]
    pub command_fd: Option<RawFd>,
    #[serde(skip)]
    pub init_sync_fd: Option<RawFd>,
}

impl State {
    pub fn new(name: impl Into<String>, root_path: PathBuf, work_path: PathBuf, init_argv: Vec<String>) -> Self {
        let name = name.into();
        Self {
            hostname: name.clone(),
            name,
            root_path,
            work_path,
            init_argv,
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            namespaces: Vec::new(),
            network_config: Vec::new(),
            cgroup_config: CgroupConfig::default(),
            mount_config: Vec::new(),
            link_provisions: Vec::new(),
            file_provisions: Vec::new(),
            terminal_count: 1,
            status: ContainerState::Stopped,
            init_pid: None,
            guard_pid: None,
            command_fd: None,
            init_sync_fd: None,
        }
    }

    /// Bundles the mount/link/file declarations into the shape §4.10's
    /// `apply` expects.
    pub fn provisioning(&self) -> crate::rootfs::Provisioning {
        crate::rootfs::Provisioning {
            mounts: self.mount_config.clone(),
            links: self.link_provisions.clone(),
            files: self.file_provisions.clone(),
        }
    }

    fn state_file(work_path: &Path) -> PathBuf {
        work_path.join("state.json")
    }

    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.work_path).map_err(Error::Io)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::InvalidState(format!("serializing state: {}", e)))?;
        std::fs::write(Self::state_file(&self.work_path), json).map_err(Error::Io)
    }

    pub fn load(work_path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(Self::state_file(work_path)).map_err(Error::Io)?;
        serde_json::from_str(&raw).map_err(|e| Error::InvalidState(format!("parsing state: {}", e)))
    }

    /// Validates the invariants enumerated in §3.1, beyond what the type
    /// system already enforces.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || !self.name.is_ascii() {
            return Err(Error::InvalidArgument("container name must be a non-empty ASCII string".into()));
        }
        if self.init_argv.is_empty() {
            return Err(Error::InvalidArgument("init_argv must not be empty".into()));
        }
        if self.terminal_count == 0 && self.status != ContainerState::Stopped {
            return Err(Error::InvalidArgument("terminal_count must be >= 1 once running".into()));
        }
        validate_disjoint(&self.uid_mappings, "uid")?;
        validate_disjoint(&self.gid_mappings, "gid")?;
        if self.namespaces.contains(&NsKind::User) && self.uid_mappings.is_empty() {
            return Err(Error::InvalidArgument(
                "uid_mappings must not be empty when USER is in namespaces".into(),
            ));
        }
        if self.status != ContainerState::Stopped
            && (self.init_pid.is_none() || self.guard_pid.is_none() || self.command_fd.is_none())
        {
            return Err(Error::InvalidState(
                "non-stopped container must have init_pid, guard_pid, and command_fd".into(),
            ));
        }
        Ok(())
    }
}

fn validate_disjoint(mappings: &[IdMapRange], axis: &str) -> Result<()> {
    let mut ranges: Vec<(u32, u32)> = mappings
        .iter()
        .map(|m| (m.inside_id, m.inside_id + m.count))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        if pair[0].1 > pair[1].0 {
            return Err(Error::InvalidArgument(format!("{} mappings overlap on the inside axis", axis)));
        }
    }
    for m in mappings {
        if m.count == 0 {
            return Err(Error::InvalidArgument(format!("{} mapping count must be >= 1", axis)));
        }
    }
    Ok(())
}

/// Thin wrapper exposing the lifecycle-transition guards over `State`,
/// mirroring the teacher's `Container` struct around its `state: State`.
pub struct Container {
    pub state: State,
}

impl Container {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    pub fn status(&self) -> ContainerState {
        self.state.status
    }

    pub fn can_start(&self) -> bool {
        self.state.status.can_start()
    }

    pub fn can_shutdown(&self) -> bool {
        self.state.status.can_shutdown()
    }

    pub fn can_destroy(&self) -> bool {
        self.state.status.can_destroy()
    }

    pub fn can_freeze(&self) -> bool {
        self.state.status.can_freeze()
    }

    pub fn can_thaw(&self) -> bool {
        self.state.status.can_thaw()
    }

    pub fn set_status(&mut self, status: ContainerState) {
        self.state.status = status;
    }

    pub fn save(&self) -> Result<()> {
        self.state.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> State {
        State::new("zone-a", PathBuf::from("/var/lib/vasum/zone-a"), PathBuf::from("/run/vasum/zone-a"), vec!["/sbin/init".into()])
    }

    #[test]
    fn fresh_state_is_stopped_and_valid() {
        let state = sample();
        assert_eq!(state.status, ContainerState::Stopped);
        state.validate().unwrap();
    }

    #[test]
    fn empty_init_argv_is_rejected() {
        let mut state = sample();
        state.init_argv.clear();
        assert!(state.validate().is_err());
    }

    #[test]
    fn overlapping_uid_mappings_are_rejected() {
        let mut state = sample();
        state.uid_mappings.push(IdMapRange { inside_id: 0, outside_id: 100000, count: 10 });
        state.uid_mappings.push(IdMapRange { inside_id: 5, outside_id: 200000, count: 10 });
        assert!(state.validate().is_err());
    }

    #[test]
    fn user_namespace_without_uid_mappings_is_rejected() {
        let mut state = sample();
        state.namespaces.push(NsKind::User);
        assert!(state.validate().is_err());
        state.uid_mappings.push(IdMapRange { inside_id: 0, outside_id: 100000, count: 65536 });
        assert!(state.validate().is_ok());
    }

    #[test]
    fn running_without_runtime_handles_is_invalid() {
        let mut state = sample();
        state.status = ContainerState::Running;
        assert!(state.validate().is_err());
    }

    #[test]
    fn state_transitions_follow_the_guards() {
        let mut container = Container::new(sample());
        assert!(container.can_start());
        container.set_status(ContainerState::Running);
        assert!(!container.can_start());
        assert!(container.can_shutdown());
        assert!(container.can_freeze());
        container.set_status(ContainerState::Paused);
        assert!(container.can_thaw());
        assert!(!container.can_freeze());
    }
}
