use std::fs;
use std::path::PathBuf;

use nix::unistd::Pid;

use crate::common::{
    self, get_subsystem_mount_point, read_cgroup_file, write_cgroup_file_str, CGROUP_PROCS,
    CGROUP_TASKS,
};
use crate::subsystem::Subsystem;
use crate::{Error, Result};

/// A handle to a single cgroup directory, `{mount_point}/{name}` (§3.4).
///
/// `name` is created exactly once per container lifetime and removed
/// after init exits — callers are responsible for calling [`create`]
/// and [`destroy`] at those points; `CGroup` itself is a cheap,
/// clonable path handle, not an owning guard.
#[derive(Debug, Clone)]
pub struct CGroup {
    subsystem: Subsystem,
    mount_point: PathBuf,
    name: String,
}

impl CGroup {
    /// Look up `subsystem`'s mount point on this host and build a
    /// handle for `name` underneath it.
    pub fn new(subsystem: Subsystem, name: impl Into<String>) -> Result<Self> {
        let mount_point = get_subsystem_mount_point(&subsystem)?;
        Ok(Self {
            subsystem,
            mount_point,
            name: name.into(),
        })
    }

    /// Build a handle for an already-known mount point, e.g. one the
    /// caller just mounted at a configured path (§4.8).
    pub fn at_mount_point(subsystem: Subsystem, mount_point: PathBuf, name: impl Into<String>) -> Self {
        Self {
            subsystem,
            mount_point,
            name: name.into(),
        }
    }

    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    pub fn path(&self) -> PathBuf {
        self.mount_point.join(self.name.trim_start_matches('/'))
    }

    pub fn exists(&self) -> bool {
        self.path().is_dir()
    }

    pub fn create(&self) -> Result<()> {
        let path = self.path();
        fs::create_dir_all(&path).map_err(|source| Error::Io { path, source })
    }

    pub fn destroy(&self) -> Result<()> {
        let path = self.path();
        if !self.pids()?.is_empty() {
            return Err(Error::Busy(self.name.clone()));
        }
        fs::remove_dir(&path).map_err(|source| Error::Io { path, source })
    }

    fn param_path(&self, param: &str) -> PathBuf {
        self.path().join(format!("{}.{}", self.subsystem, param))
    }

    fn common_path(&self, param: &str) -> PathBuf {
        self.path().join(format!("cgroup.{}", param))
    }

    pub fn set(&self, param: &str, value: &str) -> Result<()> {
        write_cgroup_file_str(self.param_path(param), value)
    }

    pub fn get(&self, param: &str) -> Result<String> {
        read_cgroup_file(self.param_path(param))
    }

    pub fn set_common(&self, param: &str, value: &str) -> Result<()> {
        write_cgroup_file_str(self.common_path(param), value)
    }

    pub fn get_common(&self, param: &str) -> Result<String> {
        read_cgroup_file(self.common_path(param))
    }

    /// Attach an entire process group (writes `cgroup.procs`).
    pub fn assign_group(&self, pid: Pid) -> Result<()> {
        write_cgroup_file_str(self.path().join(CGROUP_PROCS), &pid.as_raw().to_string())
    }

    /// Attach a single task/thread (writes `tasks`).
    pub fn assign_pid(&self, pid: Pid) -> Result<()> {
        write_cgroup_file_str(self.path().join(CGROUP_TASKS), &pid.as_raw().to_string())
    }

    pub fn pids(&self) -> Result<Vec<Pid>> {
        common::get_all_pids(&self.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixture(sub: Subsystem) -> (tempfile::TempDir, CGroup) {
        let dir = tempdir().unwrap();
        let cg = CGroup::at_mount_point(sub, dir.path().to_path_buf(), "zone/A");
        cg.create().unwrap();
        (dir, cg)
    }

    #[test]
    fn set_then_get_param_round_trips() {
        let (_dir, cg) = fixture(Subsystem::Memory);
        fs::write(cg.path().join("memory.limit_in_bytes"), "0").unwrap();
        cg.set("limit_in_bytes", "262144").unwrap();
        assert_eq!(cg.get("limit_in_bytes").unwrap(), "262144");
    }

    #[test]
    fn set_common_writes_cgroup_dot_param() {
        let (_dir, cg) = fixture(Subsystem::Freezer);
        fs::write(cg.path().join("cgroup.procs"), "").unwrap();
        fs::write(cg.path().join("freezer.state"), "THAWED").unwrap();
        cg.set("state", "FROZEN").unwrap();
        assert_eq!(cg.get("state").unwrap(), "FROZEN");
    }

    #[test]
    fn destroy_fails_when_tasks_present() {
        let (_dir, cg) = fixture(Subsystem::Devices);
        fs::write(cg.path().join("cgroup.procs"), "1234\n").unwrap();
        let err = cg.destroy().unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
    }
}
