//! Linux implementation of the host network collaborator.
//!
//! - advertisements: one raw [`CarpSocket`] per (interface, family), opened
//!   on multicast join, with a reader task feeding the dispatcher
//! - routes: virtual addresses are added to and removed from the
//!   interface with `ip address`
//! - announcements: `arping -U` for IPv4; IPv6 relies on the unsolicited
//!   neighbour advertisement the kernel sends for a new address
//!
//! Commands run on spawned tasks so the dispatcher never waits on them.

use crate::socket::CarpSocket;
use carp::{Backing, CarpHandle, Family, Network, ReceivedAdvertisement, select_backing};
use ipnet::IpNet;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One address configured on a host interface
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddress {
    pub interface: String,
    pub network: IpNet,
}

/// Interfaces and addresses of the host at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSnapshot {
    /// Interface name to "running" flag
    pub links: HashMap<String, bool>,
    pub addresses: HashSet<HostAddress>,
}

impl HostSnapshot {
    /// Read the host table with getifaddrs(3).
    pub fn capture() -> io::Result<Self> {
        let mut snapshot = Self::default();

        for ifaddr in getifaddrs().map_err(io::Error::from)? {
            let running = ifaddr.flags.contains(InterfaceFlags::IFF_UP)
                && ifaddr.flags.contains(InterfaceFlags::IFF_RUNNING);
            snapshot
                .links
                .insert(ifaddr.interface_name.clone(), running);

            let (Some(address), Some(netmask)) = (ifaddr.address, ifaddr.netmask) else {
                continue;
            };
            let network = if let (Some(a), Some(m)) =
                (address.as_sockaddr_in(), netmask.as_sockaddr_in())
            {
                IpNet::with_netmask(IpAddr::V4(a.ip()), IpAddr::V4(m.ip())).ok()
            } else if let (Some(a), Some(m)) =
                (address.as_sockaddr_in6(), netmask.as_sockaddr_in6())
            {
                IpNet::with_netmask(IpAddr::V6(a.ip()), IpAddr::V6(m.ip())).ok()
            } else {
                None
            };

            // Non-contiguous netmasks are skipped along with non-IP families.
            if let Some(network) = network {
                snapshot.addresses.insert(HostAddress {
                    interface: ifaddr.interface_name,
                    network,
                });
            }
        }
        Ok(snapshot)
    }
}

struct Membership {
    socket: Arc<CarpSocket>,
    reader: JoinHandle<()>,
}

/// Host network backed by raw sockets and the `ip` tool.
pub struct SystemNetwork {
    handle: CarpHandle,
    sockets: Mutex<HashMap<(String, Family), Membership>>,
    /// Virtual addresses currently installed on an interface
    installed: Mutex<HashSet<IpAddr>>,
    /// Virtual addresses that are also real host addresses; never touched
    owned: Mutex<HashSet<IpAddr>>,
}

impl SystemNetwork {
    pub fn new(handle: CarpHandle) -> Self {
        Self {
            handle,
            sockets: Mutex::new(HashMap::new()),
            installed: Mutex::new(HashSet::new()),
            owned: Mutex::new(HashSet::new()),
        }
    }

    /// True if `address` was installed by us as a virtual address.
    pub fn is_virtual(&self, address: &IpAddr) -> bool {
        lock(&self.installed).contains(address)
    }

    /// Host addresses able to back virtual addresses
    fn backing_table(&self) -> Vec<HostAddress> {
        match HostSnapshot::capture() {
            Ok(snapshot) => snapshot
                .addresses
                .into_iter()
                .filter(|a| !self.is_virtual(&a.network.addr()))
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to read interface addresses");
                Vec::new()
            }
        }
    }

    fn spawn_reader(&self, socket: Arc<CarpSocket>) -> JoinHandle<()> {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            loop {
                match socket.recv().await {
                    Ok(datagram) => {
                        let packet = ReceivedAdvertisement {
                            interface: socket.interface().to_string(),
                            source: datagram.source,
                            ttl: datagram.ttl,
                            payload: datagram.payload,
                        };
                        if handle.deliver(packet).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        debug!(interface = socket.interface(), error = %e, "malformed datagram");
                    }
                    Err(e) => {
                        warn!(interface = socket.interface(), error = %e, "CARP socket read failed");
                        break;
                    }
                }
            }
        })
    }
}

impl Drop for SystemNetwork {
    fn drop(&mut self) {
        for (_, membership) in lock(&self.sockets).drain() {
            membership.reader.abort();
        }
    }
}

impl Network for SystemNetwork {
    fn transmit(
        &self,
        interface: &str,
        source: IpAddr,
        group: IpAddr,
        _ttl: u8,
        payload: &[u8],
    ) -> io::Result<()> {
        let key = (interface.to_string(), Family::of(&group));
        let socket = lock(&self.sockets)
            .get(&key)
            .map(|m| m.socket.clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no CARP socket"))?;
        socket.send(payload, source)
    }

    fn join_multicast(&self, interface: &str, family: Family) -> io::Result<()> {
        let key = (interface.to_string(), family);
        let mut sockets = lock(&self.sockets);
        if sockets.contains_key(&key) {
            return Ok(());
        }

        let socket = Arc::new(CarpSocket::open(interface, family)?);
        let reader = self.spawn_reader(socket.clone());
        sockets.insert(key, Membership { socket, reader });
        info!(interface, %family, "joined CARP group");
        Ok(())
    }

    fn leave_multicast(&self, interface: &str, family: Family) {
        if let Some(membership) = lock(&self.sockets).remove(&(interface.to_string(), family)) {
            membership.reader.abort();
            info!(interface, %family, "left CARP group");
        }
    }

    fn install_route(&self, address: IpAddr, interface: &str) {
        if lock(&self.owned).contains(&address) {
            return;
        }
        lock(&self.installed).insert(address);
        spawn_ip(["address", "add"], address, interface);
    }

    fn withdraw_route(&self, address: IpAddr, interface: &str) {
        if !lock(&self.installed).remove(&address) {
            return;
        }
        spawn_ip(["address", "del"], address, interface);
    }

    fn announce(&self, interface: &str, address: IpAddr) {
        let IpAddr::V4(v4) = address else {
            return;
        };
        let args = vec![
            "-U".to_string(),
            "-c".to_string(),
            "1".to_string(),
            "-I".to_string(),
            interface.to_string(),
            v4.to_string(),
        ];
        spawn_command("arping", args);
    }

    fn find_best_backing_address(
        &self,
        candidate: IpAddr,
        preferred: Option<&str>,
    ) -> Option<Backing> {
        let table = self.backing_table();
        let backing = select_backing(
            candidate,
            preferred,
            table
                .iter()
                .map(|a| (a.interface.as_str(), a.network)),
        );

        let mut owned = lock(&self.owned);
        if backing.as_ref().is_some_and(|b| b.owner) {
            owned.insert(candidate);
        } else {
            owned.remove(&candidate);
        }
        backing
    }

    fn link_up(&self, interface: &str) -> bool {
        match HostSnapshot::capture() {
            Ok(snapshot) => snapshot.links.get(interface).copied().unwrap_or(false),
            Err(e) => {
                warn!(interface, error = %e, "failed to read link state");
                true
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Host route for a virtual address, e.g. `10.0.0.1/32`
fn host_prefix(address: IpAddr) -> String {
    match address {
        IpAddr::V4(_) => format!("{address}/32"),
        IpAddr::V6(_) => format!("{address}/128"),
    }
}

fn spawn_ip(verb: [&str; 2], address: IpAddr, interface: &str) {
    let mut args: Vec<String> = verb.iter().map(|s| s.to_string()).collect();
    args.push(host_prefix(address));
    args.push("dev".to_string());
    args.push(interface.to_string());
    if address.is_ipv6() && verb[1] == "add" {
        args.push("nodad".to_string());
    }
    spawn_command("ip", args);
}

fn spawn_command(program: &'static str, args: Vec<String>) {
    tokio::spawn(async move {
        match Command::new(program).args(&args).output().await {
            Ok(output) if output.status.success() => {
                debug!(program, ?args, "command succeeded");
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(
                    program,
                    ?args,
                    status = %output.status,
                    stderr = %stderr.trim(),
                    "command failed"
                );
            }
            Err(e) => warn!(program, ?args, error = %e, "failed to run command"),
        }
    });
}
