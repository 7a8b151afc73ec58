//! Discovery and raw file IO helpers shared by [`crate::cgroup::CGroup`].
//!
//! Grounded on the teacher's `cgroups/src/common.rs`
//! (`write_cgroup_file_str`, `CGROUP_PROCS`, mount-point discovery via
//! `procfs::process::Process`), trimmed of the OCI `CgroupManager`
//! trait and its v1/v2 split — vasum only ever addresses a subsystem by
//! its discovered mount point, never through a manager abstraction.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use nix::unistd::Pid;
use procfs::process::Process;

use crate::subsystem::Subsystem;
use crate::{Error, Result};

pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const CGROUP_TASKS: &str = "tasks";

fn io_err(path: &Path, source: std::io::Error) -> Error {
    Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn write_cgroup_file_str<P: AsRef<Path>>(path: P, data: &str) -> Result<()> {
    let path = path.as_ref();
    fs::OpenOptions::new()
        .create(false)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| io_err(path, e))?
        .write_all(data.as_bytes())
        .map_err(|e| io_err(path, e))
}

pub fn write_cgroup_file<P: AsRef<Path>, T: ToString>(path: P, data: T) -> Result<()> {
    write_cgroup_file_str(path, &data.to_string())
}

pub fn read_cgroup_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path)
        .map_err(|e| io_err(path, e))
        .map(|s| s.trim_end().to_string())
}

/// Find the host mount point of `subsystem` by reading `/proc/mounts`.
pub fn get_subsystem_mount_point(subsystem: &Subsystem) -> Result<PathBuf> {
    let mounts = Process::myself()
        .map_err(|_| Error::NotMounted(subsystem.to_string()))?
        .mountinfo()
        .map_err(|_| Error::NotMounted(subsystem.to_string()))?;

    let name = subsystem.to_string();
    mounts
        .into_iter()
        .find(|m| m.fs_type == "cgroup" && m.super_options.contains_key(&name))
        .map(|m| m.mount_point)
        .ok_or_else(|| Error::NotMounted(name))
}

/// Enumerate controllers the running kernel knows about, via
/// `/proc/cgroups`.
pub fn list_available_subsystems() -> Result<Vec<Subsystem>> {
    let file = File::open("/proc/cgroups").map_err(|e| io_err(Path::new("/proc/cgroups"), e))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines().skip(1).flatten() {
        if let Some(name) = line.split_whitespace().next() {
            if let Ok(s) = name.parse::<Subsystem>() {
                out.push(s);
            }
        }
    }
    Ok(out)
}

/// List the cgroups a process currently belongs to, via
/// `/proc/{pid}/cgroup`.
pub fn process_cgroups(pid: Pid) -> Result<Vec<(Subsystem, String)>> {
    let path = PathBuf::from(format!("/proc/{}/cgroup", pid.as_raw()));
    let file = File::open(&path).map_err(|e| io_err(&path, e))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines().flatten() {
        let mut parts = line.splitn(3, ':');
        let _hierarchy_id = parts.next();
        let controllers = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or_default();
        for c in controllers.split(',') {
            if let Ok(s) = c.parse::<Subsystem>() {
                out.push((s, path.to_string()));
            }
        }
    }
    Ok(out)
}

pub fn get_all_pids(cgroup_root: &Path) -> Result<Vec<Pid>> {
    let mut result = Vec::new();
    walk_dir(cgroup_root, &mut |p| {
        let procs = p.join(CGROUP_PROCS);
        if procs.exists() {
            let file = File::open(&procs).map_err(|e| io_err(&procs, e))?;
            for line in BufReader::new(file).lines().flatten() {
                if let Ok(raw) = line.parse::<i32>() {
                    result.push(Pid::from_raw(raw));
                }
            }
        }
        Ok(())
    })?;
    Ok(result)
}

fn walk_dir<F>(path: &Path, f: &mut F) -> Result<()>
where
    F: FnMut(&Path) -> Result<()>,
{
    f(path)?;
    let entries = fs::read_dir(path).map_err(|e| io_err(path, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(path, e))?;
        let child = entry.path();
        if child.is_dir() {
            walk_dir(&child, f)?;
        }
    }
    Ok(())
}

pub(crate) trait PathBufExt {
    fn join_safely(&self, p: &Path) -> Result<PathBuf>;
}

impl PathBufExt for PathBuf {
    fn join_safely(&self, p: &Path) -> Result<PathBuf> {
        if !p.is_absolute() && !p.as_os_str().is_empty() {
            return Err(Error::InvalidDevice(format!(
                "cannot join {:?}, not an absolute path",
                p
            )));
        }
        Ok(PathBuf::from(format!("{}{}", self.display(), p.display())))
    }
}
