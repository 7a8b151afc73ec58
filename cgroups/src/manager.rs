//! Composite commands over a set of cgroups (§4.8 `MakeAll`/`AssignPidAll`).

use std::collections::HashMap;
use std::path::PathBuf;

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::cgroup::CGroup;
use crate::common::get_subsystem_mount_point;
use crate::subsystem::Subsystem;
use crate::Result;

/// One cgroup to create and populate, mirroring §3.4's descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CgroupSpec {
    pub subsystem: Subsystem,
    pub name: String,
    pub params: HashMap<String, String>,
    pub common: HashMap<String, String>,
}

/// A container's full cgroup configuration: which subsystems to mount
/// (if not already) and which cgroups to create under them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CgroupConfig {
    /// Subsystem -> path to mount it at, if it isn't mounted yet.
    pub subsystems: Vec<(Subsystem, PathBuf)>,
    pub cgroups: Vec<CgroupSpec>,
}

/// Mount any configured subsystem not already mounted, then create
/// every configured cgroup and write its params.
pub fn make_all(config: &CgroupConfig) -> Result<Vec<CGroup>> {
    for (subsystem, mount_path) in &config.subsystems {
        if get_subsystem_mount_point(subsystem).is_err() {
            mount_subsystem(*subsystem, mount_path)?;
        } else {
            log::warn!(
                "{} is already mounted elsewhere; skipping mount at {:?}",
                subsystem,
                mount_path
            );
        }
    }

    let mut created = Vec::with_capacity(config.cgroups.len());
    for spec in &config.cgroups {
        let cg = CGroup::new(spec.subsystem, spec.name.clone())?;
        cg.create()?;
        for (param, value) in &spec.common {
            cg.set_common(param, value)?;
        }
        for (param, value) in &spec.params {
            cg.set(param, value)?;
        }
        created.push(cg);
    }
    Ok(created)
}

/// Attach `pid` to every cgroup named in `config`.
pub fn assign_pid_all(config: &CgroupConfig, pid: Pid) -> Result<()> {
    for spec in &config.cgroups {
        let cg = CGroup::new(spec.subsystem, spec.name.clone())?;
        cg.assign_group(pid)?;
    }
    Ok(())
}

fn mount_subsystem(subsystem: Subsystem, mount_path: &std::path::Path) -> Result<()> {
    use nix::mount::{mount, MsFlags};
    std::fs::create_dir_all(mount_path).map_err(|source| crate::Error::Io {
        path: mount_path.to_path_buf(),
        source,
    })?;
    mount(
        Some("cgroup"),
        mount_path,
        Some("cgroup"),
        MsFlags::empty(),
        Some(subsystem.to_string().as_str()),
    )
    .map_err(|_| crate::Error::NotMounted(subsystem.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroup_config_default_is_empty() {
        let config = CgroupConfig::default();
        assert!(config.subsystems.is_empty());
        assert!(config.cgroups.is_empty());
    }
}
