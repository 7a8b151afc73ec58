//! CGroup hierarchy management (lxcpp component C8).
//!
//! A [`CGroup`] is a handle to `{subsystem, name}` rooted at whatever
//! mount point the subsystem is discovered at on this host (§3.4, §4.8
//! of the design). Subsystem discovery walks `/proc/mounts`,
//! `/proc/cgroups` and `/proc/{pid}/cgroup`, mirroring the teacher
//! youki cgroups crate's `get_subsystem_mount_point`/`Process::cgroups`
//! use, generalized away from its OCI `LinuxResources`-shaped
//! controller trait to the plain param-name read/write API §4.8
//! describes.

pub mod cgroup;
pub mod common;
pub mod devices;
pub mod manager;
pub mod subsystem;

pub use cgroup::CGroup;
pub use devices::{DeviceAccess, DeviceType, DeviceWhitelist, WhitelistEntry};
pub use manager::{assign_pid_all, make_all, CgroupConfig, CgroupSpec};
pub use subsystem::Subsystem;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cgroup {0} not found")]
    NotFound(String),
    #[error("cgroup {0} is busy")]
    Busy(String),
    #[error("subsystem {0} is not mounted")]
    NotMounted(String),
    #[error("invalid device spec: {0}")]
    InvalidDevice(String),
}

pub type Result<T> = std::result::Result<T, Error>;
