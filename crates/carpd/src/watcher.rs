//! Host interface watcher.
//!
//! Polls the interface table and turns every difference into an
//! [`InterfaceEvent`] for the dispatcher. Addresses installed by the
//! daemon itself are ignored.

use crate::system::{HostAddress, HostSnapshot, SystemNetwork};
use carp::{CarpHandle, InterfaceEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Events turning `prev` into `next`: detaches, link changes, removed
/// addresses, then added addresses.
pub fn diff(
    prev: &HostSnapshot,
    next: &HostSnapshot,
    is_virtual: impl Fn(&HostAddress) -> bool,
) -> Vec<InterfaceEvent> {
    let mut events = Vec::new();

    let mut gone: Vec<&String> = prev
        .links
        .keys()
        .filter(|name| !next.links.contains_key(*name))
        .collect();
    gone.sort();
    for name in gone {
        events.push(InterfaceEvent::Detached {
            interface: name.clone(),
        });
    }

    let mut links: Vec<(&String, &bool)> = next.links.iter().collect();
    links.sort();
    for (name, up) in links {
        if prev.links.get(name).is_some_and(|was| was != up) {
            events.push(InterfaceEvent::LinkChanged {
                interface: name.clone(),
                up: *up,
            });
        }
    }

    let mut removed: Vec<&HostAddress> = prev
        .addresses
        .difference(&next.addresses)
        .filter(|a| next.links.contains_key(&a.interface) && !is_virtual(a))
        .collect();
    removed.sort_by_key(|a| (a.interface.clone(), a.network.addr()));
    for a in removed {
        events.push(InterfaceEvent::AddressRemoved {
            interface: a.interface.clone(),
            address: a.network.addr(),
        });
    }

    let mut added: Vec<&HostAddress> = next
        .addresses
        .difference(&prev.addresses)
        .filter(|a| !is_virtual(a))
        .collect();
    added.sort_by_key(|a| (a.interface.clone(), a.network.addr()));
    for a in added {
        events.push(InterfaceEvent::AddressAdded {
            interface: a.interface.clone(),
            network: a.network,
        });
    }

    events
}

/// Polls the host table and forwards changes to the dispatcher.
pub struct AddressWatcher {
    handle: CarpHandle,
    net: Arc<SystemNetwork>,
    poll_interval: Duration,
    last: HostSnapshot,
}

impl AddressWatcher {
    pub fn new(
        handle: CarpHandle,
        net: Arc<SystemNetwork>,
        poll_interval: Duration,
    ) -> common::Result<Self> {
        Ok(Self {
            handle,
            net,
            poll_interval,
            last: HostSnapshot::capture().map_err(common::Error::interface)?,
        })
    }

    /// Run until the dispatcher goes away.
    pub async fn run(mut self) -> common::Result<()> {
        info!(interval = ?self.poll_interval, "address watcher started");
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let next = match HostSnapshot::capture() {
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "failed to read interface table");
                    continue;
                }
            };

            let events = diff(&self.last, &next, |a| self.net.is_virtual(&a.network.addr()));
            self.last = next;

            for event in events {
                debug!(?event, "host change");
                if self.handle.interface_event(event).is_err() {
                    info!("dispatcher gone, address watcher stopping");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn addr(interface: &str, network: &str) -> HostAddress {
        HostAddress {
            interface: interface.to_string(),
            network: network.parse().unwrap(),
        }
    }

    fn snapshot(links: &[(&str, bool)], addresses: &[HostAddress]) -> HostSnapshot {
        HostSnapshot {
            links: links.iter().map(|(n, up)| (n.to_string(), *up)).collect(),
            addresses: addresses.iter().cloned().collect(),
        }
    }

    #[test]
    fn test_no_change() {
        let s = snapshot(&[("eth0", true)], &[addr("eth0", "10.0.0.2/24")]);
        assert!(diff(&s, &s.clone(), |_| false).is_empty());
    }

    #[test]
    fn test_address_added_and_removed() {
        let prev = snapshot(&[("eth0", true)], &[addr("eth0", "10.0.0.2/24")]);
        let next = snapshot(&[("eth0", true)], &[addr("eth0", "10.0.0.3/24")]);

        let events = diff(&prev, &next, |_| false);
        assert_eq!(
            events,
            vec![
                InterfaceEvent::AddressRemoved {
                    interface: "eth0".to_string(),
                    address: "10.0.0.2".parse::<IpAddr>().unwrap(),
                },
                InterfaceEvent::AddressAdded {
                    interface: "eth0".to_string(),
                    network: "10.0.0.3/24".parse().unwrap(),
                },
            ]
        );
    }

    #[test]
    fn test_link_change() {
        let prev = snapshot(&[("eth0", true), ("eth1", true)], &[]);
        let next = snapshot(&[("eth0", false), ("eth1", true)], &[]);

        assert_eq!(
            diff(&prev, &next, |_| false),
            vec![InterfaceEvent::LinkChanged {
                interface: "eth0".to_string(),
                up: false,
            }]
        );
    }

    #[test]
    fn test_detach_suppresses_address_removals() {
        let prev = snapshot(&[("eth0", true)], &[addr("eth0", "10.0.0.2/24")]);
        let next = snapshot(&[], &[]);

        assert_eq!(
            diff(&prev, &next, |_| false),
            vec![InterfaceEvent::Detached {
                interface: "eth0".to_string(),
            }]
        );
    }

    #[test]
    fn test_virtual_addresses_ignored() {
        let prev = snapshot(&[("eth0", true)], &[addr("eth0", "10.0.0.2/24")]);
        let next = snapshot(
            &[("eth0", true)],
            &[addr("eth0", "10.0.0.2/24"), addr("eth0", "10.0.0.100/32")],
        );

        let vip: IpAddr = "10.0.0.100".parse().unwrap();
        assert!(diff(&prev, &next, |a| a.network.addr() == vip).is_empty());
        assert_eq!(diff(&prev, &next, |_| false).len(), 1);
    }
}
