//! Host API method/signal ids and their argument/reply shapes (§6.1).
//!
//! The wire-level Processor (C5) only knows raw `(Vec<u8>, Vec<RawFd>)`
//! payloads; the host API's calls don't pass ancillary fds (console
//! access goes through the per-zone `console.<i>.sock` of §6.4, not the
//! control channel), so rather than hand-writing a `Visitable` impl field
//! by field for two dozen call shapes, each one is a `serde`-derived
//! struct piggybacking on the codec's `String` leaf as JSON — the same
//! `serde_json` the teacher already uses for OCI bundle and state I/O,
//! just carried over the IPC channel instead of a file.

use serde::{Deserialize, Serialize};
use vasum_ipc::{Reader, Result as CodecResult, Visitable, Writer};

use lxcpp::container::ContainerState;
use lxcpp::network::{InetAddr, InterfaceKind};

/// Implements `Visitable` for a JSON-serializable type by round-tripping
/// it through the codec's `String` leaf.
macro_rules! json_visitable {
    ($ty:ty) => {
        impl Visitable for $ty {
            fn encode(&self, w: &mut Writer) -> CodecResult<()> {
                let json = serde_json::to_string(self)
                    .map_err(|e| vasum_ipc::Error::SerializationError(e.to_string()))?;
                json.encode(w)
            }
            fn decode(r: &mut Reader) -> CodecResult<Self> {
                let json = String::decode(r)?;
                serde_json::from_str(&json).map_err(|e| vasum_ipc::Error::SerializationError(e.to_string()))
            }
        }
    };
}

pub mod method_id {
    pub const CREATE_ZONE: u32 = 1000;
    pub const DESTROY_ZONE: u32 = 1001;
    pub const START_ZONE: u32 = 1002;
    pub const SHUTDOWN_ZONE: u32 = 1003;
    pub const LOCK_ZONE: u32 = 1004;
    pub const UNLOCK_ZONE: u32 = 1005;
    pub const SET_FOREGROUND: u32 = 1006;
    pub const GET_FOREGROUND: u32 = 1007;
    pub const LIST_ZONES: u32 = 1008;
    pub const GET_ZONE_INFO: u32 = 1009;
    pub const ATTACH: u32 = 1010;
    pub const GRANT_DEVICE: u32 = 1011;
    pub const REVOKE_DEVICE: u32 = 1012;
    pub const CREATE_NETDEV: u32 = 1013;
    pub const DESTROY_NETDEV: u32 = 1014;
    pub const LIST_NETDEVS: u32 = 1015;
    pub const GET_IP_ADDR: u32 = 1016;
    pub const SET_IP_ADDR: u32 = 1017;
    pub const DECLARE_FILE: u32 = 1018;
    pub const DECLARE_LINK: u32 = 1019;
}

pub mod signal_id {
    pub const ZONE_STATE_CHANGED: u32 = 1;
    pub const ZONE_EVENT: u32 = 2;
}

/// The in-zone agent's own method table, on the zone socket (§6.1's
/// `/run/vasum/zone.sock`) — a disjoint id space from `method_id` since
/// it's a different socket's protocol, not a sub-range of the host API.
pub mod zone_method_id {
    pub const REQUEST_REBOOT: u32 = 1;
    pub const PING: u32 = 2;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateZoneArgs {
    pub name: String,
    pub template: String,
}
json_visitable!(CreateZoneArgs);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyZoneArgs {
    pub name: String,
    pub force: bool,
}
json_visitable!(DestroyZoneArgs);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameArg {
    pub name: String,
}
json_visitable!(NameArg);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownZoneArgs {
    pub name: String,
    pub force: bool,
}
json_visitable!(ShutdownZoneArgs);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneInfo {
    pub name: String,
    pub state: ContainerState,
    pub init_pid: Option<i32>,
}
json_visitable!(ZoneInfo);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneList {
    pub zones: Vec<ZoneInfo>,
}
json_visitable!(ZoneList);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachArgs {
    pub name: String,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub uid: u32,
    pub gid: u32,
}
json_visitable!(AttachArgs);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachReply {
    pub pid: i32,
}
json_visitable!(AttachReply);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantDeviceArgs {
    pub name: String,
    pub path: String,
    pub flags: String,
}
json_visitable!(GrantDeviceArgs);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeDeviceArgs {
    pub name: String,
    pub path: String,
}
json_visitable!(RevokeDeviceArgs);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNetdevArgs {
    pub name: String,
    pub iface: String,
    pub kind: InterfaceKind,
    pub target: Option<String>,
}
json_visitable!(CreateNetdevArgs);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyNetdevArgs {
    pub name: String,
    pub iface: String,
}
json_visitable!(DestroyNetdevArgs);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetdevList {
    pub interfaces: Vec<String>,
}
json_visitable!(NetdevList);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetIpAddrArgs {
    pub name: String,
    pub iface: String,
    pub family: u8,
}
json_visitable!(GetIpAddrArgs);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAddrList {
    pub addresses: Vec<InetAddr>,
}
json_visitable!(IpAddrList);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetIpAddrArgs {
    pub name: String,
    pub iface: String,
    pub family: u8,
    pub addr: std::net::IpAddr,
    pub prefix: u8,
}
json_visitable!(SetIpAddrArgs);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclareFileArgs {
    pub name: String,
    pub kind: String,
    pub path: String,
    pub flags: String,
    pub mode: u32,
}
json_visitable!(DeclareFileArgs);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclareLinkArgs {
    pub name: String,
    pub source: String,
    pub target: String,
}
json_visitable!(DeclareLinkArgs);

/// `zone_state_changed(name, state)` (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneStateChanged {
    pub name: String,
    pub state: ContainerState,
}
json_visitable!(ZoneStateChanged);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneEventKind {
    Created,
    Destroyed,
    Switched,
}

/// `zone_event(name, event)` (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneEvent {
    pub name: String,
    pub event: ZoneEventKind,
}
json_visitable!(ZoneEvent);
