//! Netlink-based network interface management (§4.9, C9) and the §3.5/3.6
//! interface and address data model.
//!
//! The teacher has no equivalent (its namespace model only ever enters
//! existing namespaces, it never creates network interfaces), so this is
//! modeled on `examples/orbstack-swift-nio/vinit`'s `startup.rs`: the same
//! `rtnetlink::new_connection()` + `handle.link()/address()/route()` +
//! `.execute().await` idiom, the same habit of spawning the connection
//! future and aborting it once the conversation is done. The netns-scoped
//! acquisition wraps that idiom in a `setns` switch around each
//! conversation, restored on every exit path via a `scopeguard` guard,
//! mirroring `namespaces.rs`'s own `/proc/{pid}/ns/{kind}` + `setns` style.

use std::future::Future;
use std::net::IpAddr;
use std::os::unix::io::RawFd;

use futures::TryStreamExt;
use nix::fcntl::{self, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, Pid};
use rtnetlink::Handle;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// §3.5 `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceKind {
    Veth,
    Bridge,
    Macvlan,
}

/// §3.5 `mode`, MACVLAN only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacvlanMode {
    Private,
    Vepa,
    Bridge,
    Passthru,
}

/// §3.6: tagged union of address families, with prefix and flags.
/// Equality is family + bits + prefix, per §3.6 — `flags` is excluded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InetAddr {
    pub address: IpAddr,
    pub prefix: u8,
    pub flags: u32,
}

impl PartialEq for InetAddr {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.prefix == other.prefix
    }
}
impl Eq for InetAddr {}

/// One `(dst, src?, metric, table)` route entry, §3.5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub destination: Option<IpAddr>,
    pub destination_prefix: u8,
    pub gateway: Option<IpAddr>,
    pub source: Option<IpAddr>,
    pub metric: Option<u32>,
    pub table: RouteTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteTable {
    Unspec,
    Compat,
    Default,
    Main,
    Local,
    User(u32),
}

/// Declared interface, as it appears in `network_config` (§3.1, §3.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    pub kind: InterfaceKind,
    /// VETH: host-side endpoint name. MACVLAN: master interface.
    pub peer: Option<String>,
    pub mac: Option<String>,
    pub mtu: Option<u32>,
    pub txqlen: Option<u32>,
    pub addresses: Vec<InetAddr>,
    pub routes: Vec<RouteConfig>,
    pub mode: Option<MacvlanMode>,
}

/// MAC/MTU/TxQueueLen/flags bundle for `set_attrs`/`get_attrs`.
#[derive(Debug, Clone, Default)]
pub struct InterfaceAttrs {
    pub mac: Option<[u8; 6]>,
    pub mtu: Option<u32>,
    pub txqlen: Option<u32>,
    pub up: Option<bool>,
}

/// Restores the calling thread's original network namespace when dropped.
/// A no-op guard is used for `owning_pid == 0` (host namespace, §4.9).
enum NetnsGuard {
    None,
    Restore(RawFd),
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let NetnsGuard::Restore(fd) = *self {
            let _ = setns(fd, CloneFlags::CLONE_NEWNET);
            let _ = close(fd);
        }
    }
}

/// A netlink-managed interface handle, scoped to the network namespace of
/// `owning_pid` (§4.9: "all operations run inside the network namespace
/// identified by owning_pid (pid 0 = host)").
pub struct NetworkInterface {
    name: String,
    owning_pid: Pid,
}

impl NetworkInterface {
    pub fn new(name: impl Into<String>, owning_pid: Pid) -> Self {
        Self {
            name: name.into(),
            owning_pid,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opens the current thread's netns, switches into `owning_pid`'s, and
    /// returns a guard that switches back on drop — including on the error
    /// path, since `?` inside a scoped call runs destructors on unwind.
    fn enter_netns(&self) -> Result<NetnsGuard> {
        if self.owning_pid.as_raw() == 0 {
            return Ok(NetnsGuard::None);
        }
        let original: RawFd = fcntl::open("/proc/self/ns/net", OFlag::O_RDONLY, Mode::empty())?;
        let target: RawFd = fcntl::open(
            format!("/proc/{}/ns/net", self.owning_pid).as_str(),
            OFlag::O_RDONLY,
            Mode::empty(),
        )?;
        let result = setns(target, CloneFlags::CLONE_NEWNET);
        let _ = close(target);
        if let Err(e) = result {
            let _ = close(original);
            return Err(e.into());
        }
        Ok(NetnsGuard::Restore(original))
    }

    /// Runs one netlink conversation inside the interface's netns, on a
    /// current-thread tokio runtime built and torn down for this call only
    /// (§A: "scoped to the call", not a wholesale async rewrite).
    fn scoped_netlink<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _ns_guard = self.enter_netns()?;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Io)?;
        rt.block_on(async move {
            let (conn, handle, _) = rtnetlink::new_connection().map_err(Error::Io)?;
            let conn_task = tokio::spawn(conn);
            let result = f(handle).await;
            conn_task.abort();
            result
        })
    }

    async fn link_index(handle: &Handle, name: &str) -> Result<u32> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .map_err(|e| Error::Kernel(-1, e.to_string()))?
            .ok_or_else(|| Error::NotFound(format!("interface {}", name)))?;
        Ok(link.header.index)
    }

    /// RTM_NEWLINK (§4.9).
    pub fn create(&self, kind: InterfaceKind, peer: Option<&str>, mode: Option<MacvlanMode>) -> Result<()> {
        let name = self.name.clone();
        let peer = peer.map(|p| p.to_string());
        self.scoped_netlink(move |handle| async move {
            let req = handle.link().add();
            match kind {
                InterfaceKind::Veth => {
                    let peer = peer.ok_or_else(|| {
                        Error::InvalidArgument("VETH interface requires a peer name".into())
                    })?;
                    req.veth(name, peer)
                        .execute()
                        .await
                        .map_err(|e| Error::Kernel(-1, e.to_string()))?;
                }
                InterfaceKind::Bridge => {
                    req.bridge(name)
                        .execute()
                        .await
                        .map_err(|e| Error::Kernel(-1, e.to_string()))?;
                }
                InterfaceKind::Macvlan => {
                    let master = peer.ok_or_else(|| {
                        Error::InvalidArgument("MACVLAN interface requires a master name".into())
                    })?;
                    let master_index = Self::link_index(&handle, &master).await?;
                    let mode_val = macvlan_mode_value(mode.unwrap_or(MacvlanMode::Bridge));
                    req.macvlan(name, master_index, mode_val)
                        .execute()
                        .await
                        .map_err(|e| Error::Kernel(-1, e.to_string()))?;
                }
            }
            Ok(())
        })
    }

    /// RTM_DELLINK (§4.9).
    pub fn destroy(&self) -> Result<()> {
        let name = self.name.clone();
        self.scoped_netlink(move |handle| async move {
            let index = Self::link_index(&handle, &name).await?;
            handle
                .link()
                .del(index)
                .execute()
                .await
                .map_err(|e| Error::Kernel(-1, e.to_string()))
        })
    }

    /// Sets `IFLA_NET_NS_PID` (§4.9).
    pub fn move_to(&self, pid: Pid) -> Result<()> {
        let name = self.name.clone();
        self.scoped_netlink(move |handle| async move {
            let index = Self::link_index(&handle, &name).await?;
            handle
                .link()
                .set(index)
                .setns_by_pid(pid.as_raw() as u32)
                .execute()
                .await
                .map_err(|e| Error::Kernel(-1, e.to_string()))
        })
    }

    /// Renames from `old_name` to `self.name`. §4.9 requires the interface
    /// be down first; the kernel enforces this and returns `EBUSY`
    /// otherwise, surfaced as `Error::Busy`.
    pub fn rename_from(&self, old_name: &str) -> Result<()> {
        let old_name = old_name.to_string();
        let new_name = self.name.clone();
        self.scoped_netlink(move |handle| async move {
            let index = Self::link_index(&handle, &old_name).await?;
            handle
                .link()
                .set(index)
                .name(new_name)
                .execute()
                .await
                .map_err(|e| Error::Kernel(-1, e.to_string()))
        })
    }

    pub fn add_to_bridge(&self, bridge: &str) -> Result<()> {
        let name = self.name.clone();
        let bridge = bridge.to_string();
        self.scoped_netlink(move |handle| async move {
            let index = Self::link_index(&handle, &name).await?;
            let master_index = Self::link_index(&handle, &bridge).await?;
            handle
                .link()
                .set(index)
                .controller(master_index)
                .execute()
                .await
                .map_err(|e| Error::Kernel(-1, e.to_string()))
        })
    }

    pub fn del_from_bridge(&self) -> Result<()> {
        let name = self.name.clone();
        self.scoped_netlink(move |handle| async move {
            let index = Self::link_index(&handle, &name).await?;
            handle
                .link()
                .set(index)
                .nocontroller()
                .execute()
                .await
                .map_err(|e| Error::Kernel(-1, e.to_string()))
        })
    }

    pub fn set_attrs(&self, attrs: InterfaceAttrs) -> Result<()> {
        let name = self.name.clone();
        self.scoped_netlink(move |handle| async move {
            let index = Self::link_index(&handle, &name).await?;
            let mut req = handle.link().set(index);
            if let Some(mac) = attrs.mac {
                req = req.address(mac.to_vec());
            }
            if let Some(mtu) = attrs.mtu {
                req = req.mtu(mtu);
            }
            if let Some(txqlen) = attrs.txqlen {
                req = req.txqueuelen(txqlen);
            }
            match attrs.up {
                Some(true) => req = req.up(),
                Some(false) => req = req.down(),
                None => {}
            }
            req.execute()
                .await
                .map_err(|e| Error::Kernel(-1, e.to_string()))
        })
    }

    pub fn get_attrs(&self) -> Result<InterfaceAttrs> {
        let name = self.name.clone();
        self.scoped_netlink(move |handle| async move {
            let mut links = handle.link().get().match_name(name.clone()).execute();
            let link = links
                .try_next()
                .await
                .map_err(|e| Error::Kernel(-1, e.to_string()))?
                .ok_or_else(|| Error::NotFound(format!("interface {}", name)))?;
            Ok(link_to_attrs(&link))
        })
    }

    pub fn up(&self) -> Result<()> {
        self.set_attrs(InterfaceAttrs {
            up: Some(true),
            ..Default::default()
        })
    }

    pub fn down(&self) -> Result<()> {
        self.set_attrs(InterfaceAttrs {
            up: Some(false),
            ..Default::default()
        })
    }

    /// RTM_NEWADDR (§4.9).
    pub fn add_inet_addr(&self, addr: &InetAddr) -> Result<()> {
        let name = self.name.clone();
        let addr = *addr;
        self.scoped_netlink(move |handle| async move {
            let index = Self::link_index(&handle, &name).await?;
            handle
                .address()
                .add(index, addr.address, addr.prefix)
                .execute()
                .await
                .map_err(|e| Error::Kernel(-1, e.to_string()))
        })
    }

    /// RTM_DELADDR (§4.9).
    pub fn del_inet_addr(&self, addr: &InetAddr) -> Result<()> {
        let name = self.name.clone();
        let addr = *addr;
        self.scoped_netlink(move |handle| async move {
            let index = Self::link_index(&handle, &name).await?;
            let mut addrs = handle.address().get().set_link_index_filter(index).execute();
            while let Some(msg) = addrs
                .try_next()
                .await
                .map_err(|e| Error::Kernel(-1, e.to_string()))?
            {
                if address_matches(&msg, &addr) {
                    handle
                        .address()
                        .del(msg)
                        .execute()
                        .await
                        .map_err(|e| Error::Kernel(-1, e.to_string()))?;
                    return Ok(());
                }
            }
            Err(Error::NotFound(format!("address {:?} on {}", addr.address, name)))
        })
    }

    /// RTM_GETADDR (§4.9).
    pub fn inet_addresses(&self) -> Result<Vec<InetAddr>> {
        let name = self.name.clone();
        self.scoped_netlink(move |handle| async move {
            let index = Self::link_index(&handle, &name).await?;
            let mut addrs = handle.address().get().set_link_index_filter(index).execute();
            let mut out = Vec::new();
            while let Some(msg) = addrs
                .try_next()
                .await
                .map_err(|e| Error::Kernel(-1, e.to_string()))?
            {
                if let Some(addr) = address_from_message(&msg) {
                    out.push(addr);
                }
            }
            Ok(out)
        })
    }

    pub fn add_route(&self, route: &RouteConfig) -> Result<()> {
        let name = self.name.clone();
        let route = route.clone();
        self.scoped_netlink(move |handle| async move {
            let index = Self::link_index(&handle, &name).await?;
            let mut req = handle.route().add().output_interface(index);
            if let Some(dst) = route.destination {
                req = req.destination_prefix(dst, route.destination_prefix);
            }
            if let Some(gw) = route.gateway {
                req = req.gateway(gw);
            }
            req.execute()
                .await
                .map_err(|e| Error::Kernel(-1, e.to_string()))
        })
    }

    pub fn del_route(&self, route: &RouteConfig) -> Result<()> {
        // rtnetlink's delete requires the exact route message; fetch the
        // matching one from `routes(table)` and delete it by handle.
        let table = route.table;
        let matches: Vec<RouteConfig> = self
            .routes(table)?
            .into_iter()
            .filter(|r| r.destination == route.destination && r.gateway == route.gateway)
            .collect();
        if matches.is_empty() {
            return Err(Error::NotFound("matching route".into()));
        }
        let name = self.name.clone();
        let route = route.clone();
        self.scoped_netlink(move |handle| async move {
            let _ = Self::link_index(&handle, &name).await?;
            let mut routes = handle.route().get(rtnetlink::IpVersion::V4).execute();
            while let Some(msg) = routes
                .try_next()
                .await
                .map_err(|e| Error::Kernel(-1, e.to_string()))?
            {
                if route_matches(&msg, &route) {
                    handle
                        .route()
                        .del(msg)
                        .execute()
                        .await
                        .map_err(|e| Error::Kernel(-1, e.to_string()))?;
                    return Ok(());
                }
            }
            Err(Error::NotFound("matching route".into()))
        })
    }

    pub fn routes(&self, table: RouteTable) -> Result<Vec<RouteConfig>> {
        let name = self.name.clone();
        self.scoped_netlink(move |handle| async move {
            let index = Self::link_index(&handle, &name).await?;
            let mut out = Vec::new();
            for version in [rtnetlink::IpVersion::V4, rtnetlink::IpVersion::V6] {
                let mut routes = handle.route().get(version).execute();
                while let Some(msg) = routes
                    .try_next()
                    .await
                    .map_err(|e| Error::Kernel(-1, e.to_string()))?
                {
                    if let Some(route) = route_from_message(&msg, index, table) {
                        out.push(route);
                    }
                }
            }
            Ok(out)
        })
    }
}

fn macvlan_mode_value(mode: MacvlanMode) -> u32 {
    // Matches Linux's `MACVLAN_MODE_*` constants (if_link.h).
    match mode {
        MacvlanMode::Private => 1,
        MacvlanMode::Vepa => 2,
        MacvlanMode::Bridge => 4,
        MacvlanMode::Passthru => 8,
    }
}

fn link_to_attrs(link: &netlink_packet_route::LinkMessage) -> InterfaceAttrs {
    use netlink_packet_route::link::nlas::Nla;
    let mut attrs = InterfaceAttrs::default();
    for nla in &link.nlas {
        match nla {
            Nla::Mtu(mtu) => attrs.mtu = Some(*mtu),
            Nla::TxQueueLen(q) => attrs.txqlen = Some(*q),
            Nla::Address(mac) if mac.len() == 6 => {
                let mut buf = [0u8; 6];
                buf.copy_from_slice(mac);
                attrs.mac = Some(buf);
            }
            _ => {}
        }
    }
    attrs.up = Some(link.header.flags & libc::IFF_UP as u32 != 0);
    attrs
}

fn address_matches(msg: &netlink_packet_route::AddressMessage, want: &InetAddr) -> bool {
    address_from_message(msg).map(|a| a == *want).unwrap_or(false)
}

fn address_from_message(msg: &netlink_packet_route::AddressMessage) -> Option<InetAddr> {
    use netlink_packet_route::address::nlas::Nla;
    for nla in &msg.nlas {
        if let Nla::Address(bytes) = nla {
            let address = bytes_to_ip(bytes)?;
            return Some(InetAddr {
                address,
                prefix: msg.header.prefix_len,
                flags: msg.header.flags as u32,
            });
        }
    }
    None
}

fn bytes_to_ip(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(bytes);
            Some(IpAddr::from(buf))
        }
        16 => {
            let mut buf = [0u8; 16];
            buf.copy_from_slice(bytes);
            Some(IpAddr::from(buf))
        }
        _ => None,
    }
}

fn route_matches(msg: &netlink_packet_route::RouteMessage, want: &RouteConfig) -> bool {
    route_from_message(msg, msg.header.index, want.table)
        .map(|r| r.destination == want.destination && r.gateway == want.gateway)
        .unwrap_or(false)
}

fn route_from_message(
    msg: &netlink_packet_route::RouteMessage,
    link_index: u32,
    table: RouteTable,
) -> Option<RouteConfig> {
    use netlink_packet_route::route::nlas::Nla;
    let mut destination = None;
    let mut gateway = None;
    let mut source = None;
    let mut out_index = None;
    for nla in &msg.nlas {
        match nla {
            Nla::Destination(bytes) => destination = bytes_to_ip(bytes),
            Nla::Gateway(bytes) => gateway = bytes_to_ip(bytes),
            Nla::PrefSource(bytes) => source = bytes_to_ip(bytes),
            Nla::Oif(idx) => out_index = Some(*idx),
            _ => {}
        }
    }
    if out_index != Some(link_index) {
        return None;
    }
    if route_table_from_raw(msg.header.table) != table {
        return None;
    }
    Some(RouteConfig {
        destination,
        destination_prefix: msg.header.destination_prefix_length,
        gateway,
        source,
        metric: None,
        table,
    })
}

fn route_table_from_raw(raw: u8) -> RouteTable {
    match raw {
        0 => RouteTable::Unspec,
        252 => RouteTable::Compat,
        253 => RouteTable::Default,
        254 => RouteTable::Main,
        255 => RouteTable::Local,
        other => RouteTable::User(other as u32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inet_addr_equality_ignores_flags() {
        let a = InetAddr {
            address: "10.0.0.2".parse().unwrap(),
            prefix: 24,
            flags: 0,
        };
        let b = InetAddr {
            address: "10.0.0.2".parse().unwrap(),
            prefix: 24,
            flags: 0x80,
        };
        assert_eq!(a, b);
    }

    #[test]
    fn inet_addr_differs_on_prefix() {
        let a = InetAddr {
            address: "10.0.0.2".parse().unwrap(),
            prefix: 24,
            flags: 0,
        };
        let b = InetAddr {
            address: "10.0.0.2".parse().unwrap(),
            prefix: 16,
            flags: 0,
        };
        assert_ne!(a, b);
    }

    #[test]
    fn route_table_raw_round_trips_well_known_values() {
        assert_eq!(route_table_from_raw(254), RouteTable::Main);
        assert_eq!(route_table_from_raw(255), RouteTable::Local);
        assert_eq!(route_table_from_raw(64), RouteTable::User(64));
    }

    #[test]
    fn host_owning_pid_uses_a_noop_netns_guard() {
        let iface = NetworkInterface::new("eth0", Pid::from_raw(0));
        assert!(matches!(iface.enter_netns().unwrap(), NetnsGuard::None));
    }
}
