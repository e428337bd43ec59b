//! Host network collaborator.
//!
//! The protocol engine never touches sockets, routes or neighbour caches
//! itself. Everything host-facing goes through [`Network`], which the
//! daemon implements for Linux and the tests implement in memory.
//!
//! Calls are made from inside the dispatcher and must not block for long:
//! implementations either finish quickly or hand the work off.

use crate::types::Family;
use ipnet::IpNet;
use std::io;
use std::net::IpAddr;

/// A real interface address able to carry a virtual address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backing {
    pub interface: String,
    pub address: IpAddr,
    /// The real address is numerically the virtual address itself
    pub owner: bool,
}

pub trait Network: Send + Sync {
    /// Send an encoded advertisement to `group` on `interface`.
    fn transmit(
        &self,
        interface: &str,
        source: IpAddr,
        group: IpAddr,
        ttl: u8,
        payload: &[u8],
    ) -> io::Result<()>;

    fn join_multicast(&self, interface: &str, family: Family) -> io::Result<()>;

    fn leave_multicast(&self, interface: &str, family: Family);

    fn install_route(&self, address: IpAddr, interface: &str);

    fn withdraw_route(&self, address: IpAddr, interface: &str);

    /// Gratuitous ARP or unsolicited neighbour advertisement
    fn announce(&self, interface: &str, address: IpAddr);

    /// Best real address for `candidate`: exact match first, then an
    /// address on `preferred`, then the most specific subnet match.
    fn find_best_backing_address(&self, candidate: IpAddr, preferred: Option<&str>)
    -> Option<Backing>;

    /// Current link state of `interface`
    fn link_up(&self, _interface: &str) -> bool {
        true
    }
}

/// Pick the best backing among `(interface, address/prefix)` entries.
///
/// Shared by the daemon's host table and the in-memory test networks.
pub fn select_backing<'a, I>(candidate: IpAddr, preferred: Option<&str>, table: I) -> Option<Backing>
where
    I: IntoIterator<Item = (&'a str, IpNet)>,
{
    let mut best: Option<(u32, Backing)> = None;

    for (interface, network) in table {
        let address = network.addr();
        let owner = address == candidate;
        if !owner && !network.contains(&candidate) {
            continue;
        }

        // exact match > preferred interface > longest prefix
        let rank = (u32::from(owner) << 16)
            | (u32::from(preferred == Some(interface)) << 8)
            | u32::from(network.prefix_len());

        if best.as_ref().is_none_or(|(r, _)| rank > *r) {
            best = Some((
                rank,
                Backing {
                    interface: interface.to_string(),
                    address,
                    owner,
                },
            ));
        }
    }

    best.map(|(_, backing)| backing)
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory network recording every call.

    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum NetEvent {
        Transmit {
            interface: String,
            source: IpAddr,
            group: IpAddr,
            payload: Vec<u8>,
        },
        Join(String, Family),
        Leave(String, Family),
        Install(IpAddr, String),
        Withdraw(IpAddr, String),
        Announce(String, IpAddr),
    }

    #[derive(Debug, Default)]
    pub struct RecordingNetwork {
        pub events: Mutex<Vec<NetEvent>>,
        pub table: Mutex<Vec<(String, IpNet)>>,
        pub fail_transmit: AtomicBool,
        pub fail_join: AtomicBool,
        /// Interfaces reported as link down
        pub down: Mutex<Vec<String>>,
    }

    impl RecordingNetwork {
        /// `network` is an interface address with its prefix, e.g. `10.0.0.2/24`
        pub fn with_address(interface: &str, network: &str) -> Self {
            let net = Self::default();
            net.add_address(interface, network);
            net
        }

        pub fn add_address(&self, interface: &str, network: &str) {
            self.table
                .lock()
                .unwrap()
                .push((interface.to_string(), network.parse().unwrap()));
        }

        pub fn remove_address(&self, address: &str) {
            let address: IpAddr = address.parse().unwrap();
            self.table.lock().unwrap().retain(|(_, n)| n.addr() != address);
        }

        pub fn set_link_down(&self, interface: &str) {
            self.down.lock().unwrap().push(interface.to_string());
        }

        pub fn set_fail_transmit(&self, fail: bool) {
            self.fail_transmit.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_join(&self, fail: bool) {
            self.fail_join.store(fail, Ordering::SeqCst);
        }

        pub fn take(&self) -> Vec<NetEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        pub fn transmits(&self) -> Vec<Vec<u8>> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    NetEvent::Transmit { payload, .. } => Some(payload.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn count(&self, pred: impl Fn(&NetEvent) -> bool) -> usize {
            self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
        }

        fn record(&self, event: NetEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Network for RecordingNetwork {
        fn transmit(
            &self,
            interface: &str,
            source: IpAddr,
            group: IpAddr,
            _ttl: u8,
            payload: &[u8],
        ) -> io::Result<()> {
            if self.fail_transmit.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::NetworkDown, "link down"));
            }
            self.record(NetEvent::Transmit {
                interface: interface.to_string(),
                source,
                group,
                payload: payload.to_vec(),
            });
            Ok(())
        }

        fn join_multicast(&self, interface: &str, family: Family) -> io::Result<()> {
            if self.fail_join.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "no CAP_NET_RAW"));
            }
            self.record(NetEvent::Join(interface.to_string(), family));
            Ok(())
        }

        fn leave_multicast(&self, interface: &str, family: Family) {
            self.record(NetEvent::Leave(interface.to_string(), family));
        }

        fn install_route(&self, address: IpAddr, interface: &str) {
            self.record(NetEvent::Install(address, interface.to_string()));
        }

        fn withdraw_route(&self, address: IpAddr, interface: &str) {
            self.record(NetEvent::Withdraw(address, interface.to_string()));
        }

        fn announce(&self, interface: &str, address: IpAddr) {
            self.record(NetEvent::Announce(interface.to_string(), address));
        }

        fn find_best_backing_address(
            &self,
            candidate: IpAddr,
            preferred: Option<&str>,
        ) -> Option<Backing> {
            let table = self.table.lock().unwrap();
            select_backing(
                candidate,
                preferred,
                table.iter().map(|(i, n)| (i.as_str(), *n)),
            )
        }

        fn link_up(&self, interface: &str) -> bool {
            !self.down.lock().unwrap().iter().any(|i| i == interface)
        }
    }
}
