//! Common Address Redundancy Protocol (CARP) version 2
//!
//! Protocol engine for CARP: a group of hosts shares a set of virtual IP
//! addresses, one of them (the MASTER) answers for the addresses and
//! advertises periodically, the others (BACKUPs) take over when the
//! advertisements stop.
//!
//! # Features
//!
//! - IPv4 and IPv6 virtual addresses in one group
//! - HMAC-SHA1 authenticated advertisements with a 64-bit counter
//! - Election by advertisement interval (base + skew/256 seconds)
//! - Optional preemption and a process-wide suppression counter
//! - Departure advertisements on administrative shutdown
//! - Single-task event dispatch with cancellable timers
//!
//! Host access (packet transmission, multicast membership, routes and
//! gratuitous announcements) is abstracted behind [`Network`].
//!
//! # Example
//!
//! ```no_run
//! use carp::{CarpOptions, CarpRequest, Dispatcher, Interval, Network};
//! use std::sync::Arc;
//!
//! # async fn example(net: Arc<dyn Network>) -> Result<(), Box<dyn std::error::Error>> {
//! let (handle, inbox) = carp::channel();
//! tokio::spawn(Dispatcher::new(inbox, net, CarpOptions::default()).run());
//!
//! let router = handle.create_router().await?;
//! handle
//!     .set_config(
//!         router,
//!         CarpRequest {
//!             vhid: Some(1),
//!             timing: Some(Interval::new(1, 100)),
//!             key: Some(carp::Authenticator::key_from_passphrase("secret")),
//!             ..Default::default()
//!         },
//!     )
//!     .await?;
//! handle.add_address(router, "192.168.1.1".parse()?).await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod dispatch;
mod error;
mod net;
mod packet;
mod registry;
mod router;
mod suppress;
mod timer;
mod types;
mod vaddr;

pub use auth::{Authenticator, CarpKey};
pub use dispatch::{CarpHandle, Dispatcher, Inbox, channel, channel_shared};
pub use error::{CarpError, CarpResult};
pub use net::{Backing, Network, select_backing};
pub use packet::{Advertisement, CARP_HEADER_LEN, internet_checksum};
pub use registry::{AddressBinding, InterfaceEvent, ReceivedAdvertisement, RouterRegistry};
pub use router::{CarpRequest, RouterEnv, RouterSnapshot, VirtualRouter};
pub use suppress::SuppressionCounter;
pub use timer::{TaskTimers, TimerKind, Timers};
pub use types::*;
pub use vaddr::{BackingAddress, VirtualAddress, VirtualAddressSet};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_types() {
        let options = CarpOptions::default();
        assert!(options.allow);
        assert!(!options.preempt);

        assert_eq!(CarpState::Init.to_string(), "INIT");
        assert_eq!(RouterId(3).to_string(), "carp3");
    }
}
