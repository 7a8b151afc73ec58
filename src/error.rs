//! Daemon-level error kinds layered over `lxcpp::Error` and
//! `vasum_ipc::Error` (§7's Runtime/Lifecycle/Transport/Protocol kinds
//! live in those crates already). This crate adds only the zone-registry
//! kinds the daemon itself raises before ever reaching lxcpp.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such zone: {0}")]
    NoSuchZone(String),
    #[error("zone already exists: {0}")]
    ZoneExists(String),
    #[error("zone is locked: {0}")]
    ZoneLocked(String),
    #[error(transparent)]
    Container(#[from] lxcpp::Error),
    #[error(transparent)]
    Ipc(#[from] vasum_ipc::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
