//! Virtual addresses owned by a router.

use crate::types::{Family, InterfaceId};
use std::net::IpAddr;

/// Real interface address a virtual address is layered on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingAddress {
    pub interface: InterfaceId,
    pub address: IpAddr,
}

/// A virtual address and its binding state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualAddress {
    pub address: IpAddr,

    /// Present while the address is active
    pub backing: Option<BackingAddress>,

    /// The backing address is this very address
    pub owner: bool,

    /// A route for the address is currently installed
    pub routed: bool,
}

impl VirtualAddress {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            backing: None,
            owner: false,
            routed: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.backing.is_some()
    }

    pub fn family(&self) -> Family {
        Family::of(&self.address)
    }
}

/// Virtual addresses kept in ascending order, IPv4 before IPv6.
#[derive(Debug, Clone, Default)]
pub struct VirtualAddressSet {
    entries: Vec<VirtualAddress>,
}

impl VirtualAddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an inactive address. Returns false if already present.
    pub fn insert(&mut self, address: IpAddr) -> bool {
        match self.entries.binary_search_by(|v| v.address.cmp(&address)) {
            Ok(_) => false,
            Err(pos) => {
                self.entries.insert(pos, VirtualAddress::new(address));
                true
            }
        }
    }

    pub fn remove(&mut self, address: &IpAddr) -> Option<VirtualAddress> {
        let pos = self.position(address)?;
        Some(self.entries.remove(pos))
    }

    pub fn get(&self, address: &IpAddr) -> Option<&VirtualAddress> {
        self.position(address).map(|pos| &self.entries[pos])
    }

    pub fn get_mut(&mut self, address: &IpAddr) -> Option<&mut VirtualAddress> {
        self.position(address).map(move |pos| &mut self.entries[pos])
    }

    pub fn contains(&self, address: &IpAddr) -> bool {
        self.position(address).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualAddress> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut VirtualAddress> {
        self.entries.iter_mut()
    }

    /// Active addresses in ascending order
    pub fn active(&self) -> impl Iterator<Item = &VirtualAddress> {
        self.entries.iter().filter(|v| v.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub fn active_count_family(&self, family: Family) -> usize {
        self.active().filter(|v| v.family() == family).count()
    }

    /// Active addresses backed by the given real address
    pub fn backed_by(&self, backing: &IpAddr) -> Vec<IpAddr> {
        self.active()
            .filter(|v| v.backing.map(|b| b.address) == Some(*backing))
            .map(|v| v.address)
            .collect()
    }

    pub fn inactive(&self) -> Vec<IpAddr> {
        self.entries
            .iter()
            .filter(|v| !v.is_active())
            .map(|v| v.address)
            .collect()
    }

    pub fn has_owner(&self) -> bool {
        self.active().any(|v| v.owner)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, address: &IpAddr) -> Option<usize> {
        self.entries
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut set = VirtualAddressSet::new();
        assert!(set.insert(ip("2001:db8::1")));
        assert!(set.insert(ip("10.0.0.20")));
        assert!(set.insert(ip("10.0.0.3")));
        assert!(!set.insert(ip("10.0.0.3")));

        let order: Vec<_> = set.iter().map(|v| v.address).collect();
        assert_eq!(order, vec![ip("10.0.0.3"), ip("10.0.0.20"), ip("2001:db8::1")]);
    }

    #[test]
    fn test_active_accounting() {
        let mut set = VirtualAddressSet::new();
        set.insert(ip("10.0.0.100"));
        set.insert(ip("2001:db8::100"));
        assert_eq!(set.active_count(), 0);

        set.get_mut(&ip("10.0.0.100")).unwrap().backing = Some(BackingAddress {
            interface: InterfaceId(0),
            address: ip("10.0.0.1"),
        });

        assert_eq!(set.active_count(), 1);
        assert_eq!(set.active_count_family(Family::Inet), 1);
        assert_eq!(set.active_count_family(Family::Inet6), 0);
        assert_eq!(set.backed_by(&ip("10.0.0.1")), vec![ip("10.0.0.100")]);
        assert_eq!(set.inactive(), vec![ip("2001:db8::100")]);
    }

    #[test]
    fn test_remove() {
        let mut set = VirtualAddressSet::new();
        set.insert(ip("10.0.0.100"));
        assert!(set.remove(&ip("10.0.0.100")).is_some());
        assert!(set.remove(&ip("10.0.0.100")).is_none());
        assert!(set.is_empty());
    }
}
