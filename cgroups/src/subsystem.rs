use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kernel-known cgroup v1 controllers (§4.8's `/proc/cgroups` enumeration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subsystem {
    Cpu,
    Cpuacct,
    Cpuset,
    Memory,
    Devices,
    Freezer,
    Pids,
    Blkio,
    NetCls,
    NetPrio,
    PerfEvent,
    HugeTlb,
}

pub const ALL_SUBSYSTEMS: &[Subsystem] = &[
    Subsystem::Cpu,
    Subsystem::Cpuacct,
    Subsystem::Cpuset,
    Subsystem::Memory,
    Subsystem::Devices,
    Subsystem::Freezer,
    Subsystem::Pids,
    Subsystem::Blkio,
    Subsystem::NetCls,
    Subsystem::NetPrio,
    Subsystem::PerfEvent,
    Subsystem::HugeTlb,
];

impl Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Subsystem::Cpu => "cpu",
            Subsystem::Cpuacct => "cpuacct",
            Subsystem::Cpuset => "cpuset",
            Subsystem::Memory => "memory",
            Subsystem::Devices => "devices",
            Subsystem::Freezer => "freezer",
            Subsystem::Pids => "pids",
            Subsystem::Blkio => "blkio",
            Subsystem::NetCls => "net_cls",
            Subsystem::NetPrio => "net_prio",
            Subsystem::PerfEvent => "perf_event",
            Subsystem::HugeTlb => "hugetlb",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Subsystem {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "cpu" => Subsystem::Cpu,
            "cpuacct" => Subsystem::Cpuacct,
            "cpuset" => Subsystem::Cpuset,
            "memory" => Subsystem::Memory,
            "devices" => Subsystem::Devices,
            "freezer" => Subsystem::Freezer,
            "pids" => Subsystem::Pids,
            "blkio" => Subsystem::Blkio,
            "net_cls" => Subsystem::NetCls,
            "net_prio" => Subsystem::NetPrio,
            "perf_event" => Subsystem::PerfEvent,
            "hugetlb" => Subsystem::HugeTlb,
            other => return Err(crate::Error::NotMounted(other.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_subsystem_name() {
        for s in ALL_SUBSYSTEMS {
            let parsed: Subsystem = s.to_string().parse().unwrap();
            assert_eq!(parsed, *s);
        }
    }
}
