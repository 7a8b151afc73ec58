//! Path defaults and the container JSON config (§6.3).
//!
//! Grounded on the original source's `common/utils/environment.hpp`
//! (SPEC_FULL §B.6): a handful of environment-derived path defaults,
//! folded here into one `Paths` struct shared by the daemon and the CLI
//! instead of scattered `getenv` calls.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use lxcpp::container::{IdMapRange, MountDeclaration, State};
use lxcpp::namespaces::NsKind;
use lxcpp::network::InterfaceConfig;
use lxcpp::rootfs::{FileProvision, LinkProvision};

use cgroups::manager::CgroupConfig;

/// Daemon- and CLI-wide path defaults (§6.1, §6.2).
#[derive(Debug, Clone)]
pub struct Paths {
    pub control_socket: PathBuf,
    pub zone_config_dir: PathBuf,
    pub zone_root_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            control_socket: PathBuf::from("/run/vasum/host.sock"),
            zone_config_dir: PathBuf::from("/etc/vasum/zones"),
            zone_root_dir: PathBuf::from("/var/lib/vasum/zones"),
        }
    }
}

impl Paths {
    pub fn zone_config_path(&self, name: &str) -> PathBuf {
        self.zone_config_dir.join(format!("{}.conf", name))
    }

    pub fn zone_work_path(&self, name: &str) -> PathBuf {
        PathBuf::from("/run/vasum").join(name)
    }

    pub fn zone_agent_socket(&self, name: &str) -> PathBuf {
        self.zone_work_path(name).join("agent.sock")
    }
}

/// The container JSON config (§6.3): top-level keys `name`, `hostname`,
/// `rootPath`, `workPath`, `init`, `uidMap[]`, `gidMap[]`, `namespaces[]`,
/// `terminalCount`, `mounts[]`, `cgroups{subsystems[], cgroups[]}`,
/// `network{interfaces[]}`, `provisions[]`, `shutdownTimeoutMs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub name: String,
    pub hostname: String,
    #[serde(rename = "rootPath")]
    pub root_path: PathBuf,
    #[serde(rename = "workPath")]
    pub work_path: PathBuf,
    pub init: Vec<String>,
    #[serde(rename = "uidMap", default)]
    pub uid_map: Vec<IdMapRange>,
    #[serde(rename = "gidMap", default)]
    pub gid_map: Vec<IdMapRange>,
    #[serde(default)]
    pub namespaces: Vec<NsKind>,
    #[serde(rename = "terminalCount", default = "default_terminal_count")]
    pub terminal_count: u32,
    #[serde(default)]
    pub mounts: Vec<MountDeclaration>,
    #[serde(default)]
    pub cgroups: CgroupsConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub provisions: Provisions,
    #[serde(rename = "shutdownTimeoutMs", default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_terminal_count() -> u32 {
    1
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CgroupsConfig {
    #[serde(default)]
    pub subsystems: Vec<String>,
    #[serde(default)]
    pub cgroups: CgroupConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provisions {
    #[serde(default)]
    pub links: Vec<LinkProvision>,
    #[serde(default)]
    pub files: Vec<FileProvision>,
}

impl ContainerConfig {
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Builds the lxcpp-level `State` this config describes, with status
    /// `Stopped` (§3.1 — a fresh container always starts there).
    pub fn to_state(&self) -> State {
        let mut state = State::new(self.name.clone(), self.root_path.clone(), self.work_path.clone(), self.init.clone());
        state.hostname = self.hostname.clone();
        state.uid_mappings = self.uid_map.clone();
        state.gid_mappings = self.gid_map.clone();
        state.namespaces = self.namespaces.clone();
        state.terminal_count = self.terminal_count;
        state.mount_config = self.mounts.clone();
        state.network_config = self.network.interfaces.clone();
        state.cgroup_config = self.cgroups.cgroups.clone();
        state.link_provisions = self.provisions.links.clone();
        state.file_provisions = self.provisions.files.clone();
        state
    }
}
