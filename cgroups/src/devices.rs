//! Typed whitelist wrapper over the `devices` subsystem (§4.8).
//!
//! Grounded on the teacher's `cgroups/src/v1/devices.rs`, which already
//! writes `devices.allow`/`devices.deny` lines in this exact format;
//! generalized here from the OCI `LinuxDeviceCgroup` type to vasum's own
//! `allow/deny(type, major|any, minor|any, perms)` surface and adding
//! `list()`, which the teacher never implemented (it is write-only).

use std::collections::BTreeSet;
use std::fmt::{self, Display};

use crate::cgroup::CGroup;
use crate::common::{read_cgroup_file, write_cgroup_file_str};
use crate::subsystem::Subsystem;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    All,
    Block,
    Char,
}

impl Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            DeviceType::All => 'a',
            DeviceType::Block => 'b',
            DeviceType::Char => 'c',
        };
        write!(f, "{}", c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceAccess {
    Read,
    Write,
    Mknod,
}

impl Display for DeviceAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            DeviceAccess::Read => 'r',
            DeviceAccess::Write => 'w',
            DeviceAccess::Mknod => 'm',
        };
        write!(f, "{}", c)
    }
}

/// A single parsed line of `devices.list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistEntry {
    pub typ: DeviceType,
    pub major: Option<u64>,
    pub minor: Option<u64>,
    pub access: BTreeSet<DeviceAccess>,
}

fn format_major_minor(major: Option<u64>, minor: Option<u64>) -> String {
    let fmt_one = |v: Option<u64>| v.map(|v| v.to_string()).unwrap_or_else(|| "*".to_string());
    format!("{}:{}", fmt_one(major), fmt_one(minor))
}

fn format_access(perms: &BTreeSet<DeviceAccess>) -> String {
    let mut order = [DeviceAccess::Read, DeviceAccess::Write, DeviceAccess::Mknod]
        .into_iter()
        .filter(|p| perms.contains(p));
    let mut s = String::new();
    for p in &mut order {
        s.push_str(&p.to_string());
    }
    s
}

pub struct DeviceWhitelist {
    cgroup: CGroup,
}

impl DeviceWhitelist {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            cgroup: CGroup::new(Subsystem::Devices, name)?,
        })
    }

    pub fn from_cgroup(cgroup: CGroup) -> Self {
        Self { cgroup }
    }

    fn write(&self, file: &str, typ: DeviceType, major: Option<u64>, minor: Option<u64>, perms: &BTreeSet<DeviceAccess>) -> Result<()> {
        let line = format!(
            "{} {} {}",
            typ,
            format_major_minor(major, minor),
            format_access(perms)
        );
        write_cgroup_file_str(self.cgroup.path().join(file), &line)
    }

    pub fn allow(&self, typ: DeviceType, major: Option<u64>, minor: Option<u64>, perms: &BTreeSet<DeviceAccess>) -> Result<()> {
        self.write("devices.allow", typ, major, minor, perms)
    }

    pub fn deny(&self, typ: DeviceType, major: Option<u64>, minor: Option<u64>, perms: &BTreeSet<DeviceAccess>) -> Result<()> {
        self.write("devices.deny", typ, major, minor, perms)
    }

    /// Parse `devices.list` into its whitelist entries.
    pub fn list(&self) -> Result<Vec<WhitelistEntry>> {
        let raw = read_cgroup_file(self.cgroup.path().join("devices.list"))?;
        raw.lines().map(parse_entry).collect()
    }
}

fn parse_entry(line: &str) -> Result<WhitelistEntry> {
    let mut parts = line.split_whitespace();
    let typ = match parts.next() {
        Some("a") => DeviceType::All,
        Some("b") => DeviceType::Block,
        Some("c") => DeviceType::Char,
        other => return Err(Error::InvalidDevice(format!("bad type in {:?}: {:?}", line, other))),
    };
    let majmin = parts
        .next()
        .ok_or_else(|| Error::InvalidDevice(format!("missing major:minor in {:?}", line)))?;
    let (major_s, minor_s) = majmin
        .split_once(':')
        .ok_or_else(|| Error::InvalidDevice(format!("bad major:minor in {:?}", line)))?;
    let major = (major_s != "*")
        .then(|| major_s.parse().map_err(|_| Error::InvalidDevice(line.to_string())))
        .transpose()?;
    let minor = (minor_s != "*")
        .then(|| minor_s.parse().map_err(|_| Error::InvalidDevice(line.to_string())))
        .transpose()?;
    let access_s = parts.next().unwrap_or("");
    let mut access = BTreeSet::new();
    for c in access_s.chars() {
        access.insert(match c {
            'r' => DeviceAccess::Read,
            'w' => DeviceAccess::Write,
            'm' => DeviceAccess::Mknod,
            other => return Err(Error::InvalidDevice(format!("bad perm {:?} in {:?}", other, line))),
        });
    }
    Ok(WhitelistEntry { typ, major, minor, access })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wildcard_entry() {
        let entry = parse_entry("a *:* rwm").unwrap();
        assert_eq!(entry.typ, DeviceType::All);
        assert_eq!(entry.major, None);
        assert_eq!(entry.minor, None);
        assert_eq!(entry.access.len(), 3);
    }

    #[test]
    fn parses_concrete_major_minor() {
        let entry = parse_entry("c 5:1 rw").unwrap();
        assert_eq!(entry.major, Some(5));
        assert_eq!(entry.minor, Some(1));
        assert!(!entry.access.contains(&DeviceAccess::Mknod));
    }

    #[test]
    fn format_access_is_rwm_ordered() {
        let mut set = BTreeSet::new();
        set.insert(DeviceAccess::Mknod);
        set.insert(DeviceAccess::Read);
        assert_eq!(format_access(&set), "rm");
    }
}
