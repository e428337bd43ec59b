//! carpd - CARP daemon for Linux
//!
//! Runs the CARP protocol engine against the host:
//!
//! - **Config**: YAML router definitions and global options
//! - **SystemNetwork**: raw CARP sockets, `ip address` and `arping`
//! - **AddressWatcher**: polls the interface table and reports changes
//!
//! Requires CAP_NET_RAW and CAP_NET_ADMIN.

pub mod config;
pub mod socket;
pub mod system;
pub mod watcher;

pub use config::{Config, ConfigError, RouterSettings};
pub use socket::CarpSocket;
pub use system::{HostAddress, HostSnapshot, SystemNetwork};
pub use watcher::AddressWatcher;
