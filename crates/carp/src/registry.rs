//! Router registry and interface binding.
//!
//! Routers and backing interfaces live in two arenas. A router refers to
//! its interface only by [`InterfaceId`]; the interface entry keeps the set
//! of routers bound to it, so address and link events can find them and
//! received advertisements can be demultiplexed by (interface, vhid).

use crate::error::{CarpError, CarpResult};
use crate::net::{Backing, Network};
use crate::packet::Advertisement;
use crate::router::{CarpRequest, RouterEnv, RouterSnapshot, VirtualRouter};
use crate::suppress::SuppressionCounter;
use crate::timer::{TimerKind, Timers};
use crate::types::{CARP_TTL, CarpOptions, CarpState, CarpStats, Family, InterfaceId, RouterId};
use crate::vaddr::BackingAddress;
use ipnet::IpNet;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An advertisement as handed over by the packet I/O layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedAdvertisement {
    /// Interface the packet arrived on
    pub interface: String,
    pub source: IpAddr,
    /// TTL / hop limit, when the transport reports it
    pub ttl: Option<u8>,
    /// CARP header and anything after it
    pub payload: Vec<u8>,
}

/// Changes of real interfaces and their addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceEvent {
    /// `network` is the new address with its prefix length
    AddressAdded {
        interface: String,
        network: IpNet,
    },
    AddressRemoved {
        interface: String,
        address: IpAddr,
    },
    AddressChanged {
        interface: String,
        old: IpAddr,
        network: IpNet,
    },
    LinkChanged {
        interface: String,
        up: bool,
    },
    Detached {
        interface: String,
    },
}

/// One virtual address as reported to administrators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressBinding {
    pub address: IpAddr,
    pub backing: Option<IpAddr>,
    pub interface: Option<String>,
    pub owner: bool,
}

#[derive(Debug)]
struct InterfaceEntry {
    name: String,
    up: bool,
    routers: BTreeSet<RouterId>,
}

/// Why an incoming advertisement was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dropped {
    BadIf,
    BadTtl,
    BadLen,
    BadSum,
    BadVer,
    BadVhid,
    BadAuth,
}

impl Dropped {
    fn count(self, stats: &mut CarpStats) {
        let counter = match self {
            Dropped::BadIf => &mut stats.badif,
            Dropped::BadTtl => &mut stats.badttl,
            Dropped::BadLen => &mut stats.badlen,
            Dropped::BadSum => &mut stats.badsum,
            Dropped::BadVer => &mut stats.badver,
            Dropped::BadVhid => &mut stats.badvhid,
            Dropped::BadAuth => &mut stats.badauth,
        };
        *counter += 1;
    }

    fn from_decode(err: &CarpError) -> Self {
        match err {
            CarpError::ChecksumMismatch => Dropped::BadSum,
            CarpError::UnsupportedVersion(_) => Dropped::BadVer,
            _ => Dropped::BadLen,
        }
    }
}

/// All routers of one dispatcher plus their interface bindings.
pub struct RouterRegistry<T: Timers> {
    routers: BTreeMap<RouterId, VirtualRouter>,
    interfaces: BTreeMap<InterfaceId, InterfaceEntry>,
    next_router: u32,
    next_interface: u32,
    net: Arc<dyn Network>,
    timers: T,
    suppression: SuppressionCounter,
    options: CarpOptions,
    stats: CarpStats,
}

impl<T: Timers> RouterRegistry<T> {
    pub fn new(net: Arc<dyn Network>, timers: T, suppression: SuppressionCounter) -> Self {
        Self {
            routers: BTreeMap::new(),
            interfaces: BTreeMap::new(),
            next_router: 0,
            next_interface: 0,
            net,
            timers,
            suppression,
            options: CarpOptions::default(),
            stats: CarpStats::default(),
        }
    }

    pub fn router(&self, id: RouterId) -> Option<&VirtualRouter> {
        self.routers.get(&id)
    }

    pub fn router_ids(&self) -> Vec<RouterId> {
        self.routers.keys().copied().collect()
    }

    pub fn stats(&self) -> &CarpStats {
        &self.stats
    }

    pub fn options(&self) -> CarpOptions {
        self.options
    }

    pub fn set_options(&mut self, options: CarpOptions) {
        self.options = options;
    }

    pub fn suppression(&self) -> &SuppressionCounter {
        &self.suppression
    }

    pub(crate) fn timers_mut(&mut self) -> &mut T {
        &mut self.timers
    }

    pub fn create_router(&mut self) -> RouterId {
        let id = RouterId(self.next_router);
        self.next_router += 1;
        self.routers.insert(id, VirtualRouter::new(id));
        info!(router = %id, "router created");
        id
    }

    /// Force INIT, release every binding and forget the router.
    pub fn destroy_router(&mut self, id: RouterId) -> CarpResult<()> {
        self.detach_router(id, false)?;
        let removed = self.routers.remove(&id);
        debug_assert!(removed.is_some(), "router destroyed twice");
        info!(router = %id, "router destroyed");
        Ok(())
    }

    pub fn snapshot(&self, id: RouterId, with_key: bool) -> CarpResult<RouterSnapshot> {
        self.routers
            .get(&id)
            .map(|r| r.snapshot(with_key))
            .ok_or(CarpError::UnknownRouter(id))
    }

    pub fn configure(&mut self, id: RouterId, request: &CarpRequest) -> CarpResult<RouterSnapshot> {
        let siblings = self.sibling_vhids(id)?;
        self.with_router(id, |router, env| router.configure(env, request, &siblings))??;
        self.snapshot(id, false)
    }

    pub fn set_admin_state(&mut self, id: RouterId, up: bool) -> CarpResult<()> {
        self.with_router(id, |router, env| router.set_admin_state(env, up))
    }

    /// Add a virtual address. The address is kept even when no backing
    /// is found; it activates once a matching interface address appears.
    pub fn add_address(&mut self, id: RouterId, address: IpAddr) -> CarpResult<()> {
        let router = self
            .routers
            .get_mut(&id)
            .ok_or(CarpError::UnknownRouter(id))?;
        router.set_admin_flag(true);
        if !router.addresses_mut().insert(address) {
            return Ok(());
        }

        match self.configure_address(id, address) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(router = %id, %address, error = %e, "virtual address left inactive");
                self.with_router(id, |router, env| {
                    router.prepare();
                    router.restart(env);
                })?;
                Err(e)
            }
        }
    }

    pub fn remove_address(&mut self, id: RouterId, address: IpAddr) -> CarpResult<()> {
        let router = self.routers.get(&id).ok_or(CarpError::UnknownRouter(id))?;
        if !router.addresses().contains(&address) {
            return Err(CarpError::UnknownAddress(address));
        }

        self.deactivate(id, address)?;
        if let Some(router) = self.routers.get_mut(&id) {
            router.addresses_mut().remove(&address);
        }
        Ok(())
    }

    /// Replace `from` with `to`; with `from == to` only re-evaluates the backing.
    pub fn change_address(&mut self, id: RouterId, from: IpAddr, to: IpAddr) -> CarpResult<()> {
        if from == to {
            let router = self.routers.get(&id).ok_or(CarpError::UnknownRouter(id))?;
            if !router.addresses().contains(&from) {
                return Err(CarpError::UnknownAddress(from));
            }
            return self.configure_address(id, to);
        }
        self.remove_address(id, from)?;
        self.add_address(id, to)
    }

    pub fn addresses(&self, id: RouterId) -> CarpResult<Vec<AddressBinding>> {
        let router = self.routers.get(&id).ok_or(CarpError::UnknownRouter(id))?;
        Ok(router
            .addresses()
            .iter()
            .map(|v| AddressBinding {
                address: v.address,
                backing: v.backing.map(|b| b.address),
                interface: v
                    .backing
                    .and_then(|b| self.interfaces.get(&b.interface))
                    .map(|e| e.name.clone()),
                owner: v.owner,
            })
            .collect())
    }

    pub fn parent_interface(&self, id: RouterId) -> CarpResult<Option<String>> {
        let router = self.routers.get(&id).ok_or(CarpError::UnknownRouter(id))?;
        Ok(router
            .interface()
            .and_then(|i| self.interfaces.get(&i))
            .map(|e| e.name.clone()))
    }

    /// True if we are MASTER for `address` on `interface`.
    pub fn master_for(&self, interface: &str, address: IpAddr) -> bool {
        let Some(iface) = self.lookup_interface(interface) else {
            return false;
        };
        self.interfaces[&iface].routers.iter().any(|id| {
            self.routers.get(id).is_some_and(|r| {
                r.admin_up()
                    && r.state() == CarpState::Master
                    && r.addresses().get(&address).is_some_and(|v| v.is_active())
            })
        })
    }

    pub fn on_timer(&mut self, id: RouterId, kind: TimerKind) {
        let result = self.with_router(id, |router, env| match kind {
            TimerKind::Advertisement => router.on_advertisement_timeout(env),
            TimerKind::MasterDown => router.on_master_down_timeout(env),
        });
        if result.is_err() {
            debug!(router = %id, ?kind, "timer for unknown router");
        }
    }

    /// Validate, demultiplex and apply a received advertisement.
    pub fn receive(&mut self, packet: &ReceivedAdvertisement) {
        if let Err(reason) = self.input(packet) {
            reason.count(&mut self.stats);
            if self.options.log_bad_packets {
                debug!(
                    interface = %packet.interface,
                    source = %packet.source,
                    ?reason,
                    "advertisement dropped"
                );
            }
        }
    }

    fn input(&mut self, packet: &ReceivedAdvertisement) -> Result<(), Dropped> {
        self.stats.count_input(Family::of(&packet.source));
        if !self.options.allow {
            return Ok(());
        }

        let iface = self
            .lookup_interface(&packet.interface)
            .filter(|i| !self.interfaces[i].routers.is_empty())
            .ok_or(Dropped::BadIf)?;

        if packet.ttl.is_some_and(|ttl| ttl != CARP_TTL) {
            return Err(Dropped::BadTtl);
        }

        let ad = Advertisement::decode(&packet.payload).map_err(|e| Dropped::from_decode(&e))?;

        let id = self.interfaces[&iface]
            .routers
            .iter()
            .copied()
            .find(|id| {
                self.routers
                    .get(id)
                    .is_some_and(|r| r.admin_up() && r.vhid() == ad.vhid)
            })
            .ok_or(Dropped::BadVhid)?;

        self.with_router(id, |router, env| router.on_advertisement(env, &ad))
            .map_err(|_| Dropped::BadVhid)?
            .map_err(|_| Dropped::BadAuth)
    }

    pub fn handle_event(&mut self, event: InterfaceEvent) {
        match event {
            InterfaceEvent::AddressAdded { interface, network } => {
                self.link_addresses(&interface, network)
            }
            InterfaceEvent::AddressRemoved { interface, address } => {
                self.unlink_addresses(&interface, address)
            }
            InterfaceEvent::AddressChanged {
                interface,
                old,
                network,
            } => {
                self.unlink_addresses(&interface, old);
                self.link_addresses(&interface, network);
            }
            InterfaceEvent::LinkChanged { interface, up } => self.link_changed(&interface, up),
            InterfaceEvent::Detached { interface } => self.interface_detached(&interface),
        }
    }

    /// Stop every router and release everything they hold.
    pub fn shutdown(&mut self) {
        for id in self.router_ids() {
            if let Err(e) = self.destroy_router(id) {
                warn!(router = %id, error = %e, "failed to release router");
            }
        }
    }

    /// Activate inactive addresses covered by a new interface address.
    fn link_addresses(&mut self, interface: &str, network: IpNet) {
        let iface = self.lookup_interface(interface);
        for id in self.router_ids() {
            let Some(router) = self.routers.get(&id) else {
                continue;
            };
            if router.interface().is_some() && router.interface() != iface {
                continue;
            }
            let candidates: Vec<IpAddr> = router
                .addresses()
                .inactive()
                .into_iter()
                .filter(|v| network.contains(v))
                .collect();
            for vaddr in candidates {
                if let Err(e) = self.configure_address(id, vaddr) {
                    debug!(router = %id, address = %vaddr, error = %e, "address not linked");
                }
            }
        }
    }

    /// Deactivate addresses backed by a removed interface address, then
    /// look for new backings.
    fn unlink_addresses(&mut self, interface: &str, address: IpAddr) {
        let Some(iface) = self.lookup_interface(interface) else {
            return;
        };
        let bound: Vec<RouterId> = self.interfaces[&iface].routers.iter().copied().collect();
        for id in bound {
            let backed = self
                .routers
                .get(&id)
                .map(|r| r.addresses().backed_by(&address))
                .unwrap_or_default();
            for vaddr in backed {
                if let Err(e) = self.deactivate(id, vaddr) {
                    warn!(router = %id, address = %vaddr, error = %e, "failed to deactivate address");
                }
            }
            self.update_addresses(id);
        }
    }

    fn update_addresses(&mut self, id: RouterId) {
        let inactive = self
            .routers
            .get(&id)
            .map(|r| r.addresses().inactive())
            .unwrap_or_default();
        for vaddr in inactive {
            if let Err(e) = self.configure_address(id, vaddr) {
                debug!(router = %id, address = %vaddr, error = %e, "no backing for address");
            }
        }
    }

    fn link_changed(&mut self, interface: &str, up: bool) {
        let Some(iface) = self.lookup_interface(interface) else {
            return;
        };
        let Some(entry) = self.interfaces.get_mut(&iface) else {
            return;
        };
        if entry.up == up {
            return;
        }
        entry.up = up;
        info!(interface, up, "link state changed");

        let bound: Vec<RouterId> = entry.routers.iter().copied().collect();
        for id in bound {
            if let Err(e) = self.with_router(id, |router, env| router.set_link_state(env, up)) {
                debug!(router = %id, error = %e, "link change for unknown router");
            }
        }
    }

    fn interface_detached(&mut self, interface: &str) {
        let Some(iface) = self.lookup_interface(interface) else {
            return;
        };
        info!(interface, "interface detached");
        let bound: Vec<RouterId> = self.interfaces[&iface].routers.iter().copied().collect();
        for id in bound {
            if let Err(e) = self.detach_router(id, true) {
                warn!(router = %id, error = %e, "failed to detach router");
            }
        }
        self.interfaces.remove(&iface);
    }

    /// Stop the router and deactivate all of its addresses.
    fn detach_router(&mut self, id: RouterId, hard: bool) -> CarpResult<()> {
        self.with_router(id, |router, env| router.stop(env, hard))?;
        let active: Vec<IpAddr> = self
            .routers
            .get(&id)
            .map(|r| r.addresses().active().map(|v| v.address).collect())
            .unwrap_or_default();
        for address in active {
            self.deactivate(id, address)?;
        }
        Ok(())
    }

    /// Find a backing for `address` and activate it.
    fn configure_address(&mut self, id: RouterId, address: IpAddr) -> CarpResult<()> {
        self.deactivate(id, address)?;

        let bound = self.parent_interface(id)?;
        let backing = self
            .net
            .find_best_backing_address(address, bound.as_deref())
            .ok_or(CarpError::NoBackingAddress(address))?;

        if let Some(bound) = bound {
            if bound != backing.interface {
                return Err(CarpError::InterfaceConflict {
                    address,
                    bound,
                    found: backing.interface,
                });
            }
        }

        self.activate(id, address, backing)
    }

    fn activate(&mut self, id: RouterId, address: IpAddr, backing: Backing) -> CarpResult<()> {
        let router = self.routers.get(&id).ok_or(CarpError::UnknownRouter(id))?;

        if router.interface().is_none() && router.vhid() > 0 {
            let taken = self
                .lookup_interface(&backing.interface)
                .and_then(|i| self.interfaces.get(&i))
                .is_some_and(|entry| {
                    entry.routers.iter().any(|other| {
                        *other != id
                            && self.routers.get(other).map(|r| r.vhid()) == Some(router.vhid())
                    })
                });
            if taken {
                return Err(CarpError::DuplicateVhid(router.vhid()));
            }
        }

        let family = Family::of(&address);
        if router.addresses().active_count_family(family) == 0 {
            self.net
                .join_multicast(&backing.interface, family)
                .map_err(|e| CarpError::MulticastFailure(e.to_string()))?;
        }

        let iface = self.intern_interface(&backing.interface);
        if let Some(router) = self.routers.get_mut(&id) {
            router.bind(iface);
        }
        if let Some(entry) = self.interfaces.get_mut(&iface) {
            entry.routers.insert(id);
        }

        let backing_address = BackingAddress {
            interface: iface,
            address: backing.address,
        };
        self.with_router(id, |router, env| {
            router.activate_address(env, address, backing_address, backing.owner)
        })
    }

    fn deactivate(&mut self, id: RouterId, address: IpAddr) -> CarpResult<()> {
        let Some(result) = self.with_router(id, |router, env| router.deactivate_address(env, address))?
        else {
            return Ok(());
        };

        let iface = self.routers.get(&id).and_then(|r| r.interface());
        let name = iface
            .and_then(|i| self.interfaces.get(&i))
            .map(|e| e.name.clone());

        if result.family_empty {
            if let Some(name) = &name {
                self.net.leave_multicast(name, result.family);
            }
        }

        if result.last {
            if let Some(router) = self.routers.get_mut(&id) {
                router.unbind();
            }
            if let Some(entry) = iface.and_then(|i| self.interfaces.get_mut(&i)) {
                entry.routers.remove(&id);
            }
            debug!(router = %id, interface = ?name, "router unbound");
        }
        Ok(())
    }

    /// vhids of the other routers on the router's interface, ascending.
    fn sibling_vhids(&self, id: RouterId) -> CarpResult<Vec<u8>> {
        let router = self.routers.get(&id).ok_or(CarpError::UnknownRouter(id))?;
        let Some(iface) = router.interface() else {
            return Ok(Vec::new());
        };
        let mut vhids: Vec<u8> = self
            .interfaces
            .get(&iface)
            .map(|e| {
                e.routers
                    .iter()
                    .filter(|other| **other != id)
                    .filter_map(|other| self.routers.get(other).map(|r| r.vhid()))
                    .collect()
            })
            .unwrap_or_default();
        vhids.sort_unstable();
        Ok(vhids)
    }

    fn lookup_interface(&self, name: &str) -> Option<InterfaceId> {
        self.interfaces
            .iter()
            .find(|(_, e)| e.name == name)
            .map(|(id, _)| *id)
    }

    /// Entry for `name`, created with the collaborator's link state.
    fn intern_interface(&mut self, name: &str) -> InterfaceId {
        if let Some(id) = self.lookup_interface(name) {
            return id;
        }
        let id = InterfaceId(self.next_interface);
        self.next_interface += 1;
        self.interfaces.insert(
            id,
            InterfaceEntry {
                name: name.to_string(),
                up: self.net.link_up(name),
                routers: BTreeSet::new(),
            },
        );
        id
    }

    /// Run `f` on a router with an environment built from the registry.
    /// Re-advertises every MASTER if `f` took the suppression counter off zero.
    fn with_router<R>(
        &mut self,
        id: RouterId,
        f: impl FnOnce(&mut VirtualRouter, &mut RouterEnv<'_>) -> R,
    ) -> CarpResult<R> {
        let (result, readvertise) = self.run_on(id, f)?;
        if readvertise {
            info!("preemption suppressed, re-advertising all masters");
            for other in self.router_ids() {
                if let Err(e) = self.run_on(other, |router, env| router.readvertise(env)) {
                    debug!(router = %other, error = %e, "re-advertisement skipped");
                }
            }
        }
        Ok(result)
    }

    fn run_on<R>(
        &mut self,
        id: RouterId,
        f: impl FnOnce(&mut VirtualRouter, &mut RouterEnv<'_>) -> R,
    ) -> CarpResult<(R, bool)> {
        let Self {
            routers,
            interfaces,
            net,
            timers,
            suppression,
            options,
            stats,
            ..
        } = self;

        let router = routers.get_mut(&id).ok_or(CarpError::UnknownRouter(id))?;
        let entry = router.interface().and_then(|i| interfaces.get(&i));

        let mut env = RouterEnv {
            net: &**net,
            timers,
            suppression,
            options,
            stats,
            interface: entry.map(|e| e.name.as_str()),
            link_up: entry.is_none_or(|e| e.up),
            readvertise_all: false,
        };
        let result = f(router, &mut env);
        Ok((result, env.readvertise_all))
    }
}
