//! CARP data types and constants.
//!
//! Protocol constants follow the CARP version 2 wire format (IP protocol 112).

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// CARP protocol version carried in every advertisement
pub const CARP_VERSION: u8 = 2;

/// The only defined CARP message type
pub const CARP_ADVERTISEMENT: u8 = 1;

/// CARP IP protocol number
pub const CARP_PROTOCOL: u8 = 112;

/// CARP multicast group for IPv4
pub const CARP_MULTICAST_ADDR_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 18);

/// CARP multicast group for IPv6
pub const CARP_MULTICAST_ADDR_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x12);

/// TTL / hop limit required on both sides of the wire
pub const CARP_TTL: u8 = 255;

/// Length of the shared secret and of the SHA1 digest
pub const CARP_KEY_LEN: usize = 20;

/// Authentication header length in 32-bit words
pub const CARP_AUTHLEN: u8 = 7;

/// Default advertisement base interval (seconds)
pub const CARP_DEFAULT_ADVBASE: u8 = 1;

/// Largest accepted advertisement skew
pub const CARP_MAX_ADVSKEW: u8 = 254;

/// Skew a router advertises with while preemption is suppressed
pub const CARP_SUPPRESSED_ADVSKEW: u8 = 240;

/// Base and skew of the departure advertisement sent by a stepping-down master
pub const CARP_BOW_OUT: u8 = 255;

/// Consecutive transmit failures before a router suppresses preemption
pub const CARP_SENDAD_MAX_ERRORS: u32 = 3;

/// Consecutive successes needed to lift a send-error suppression
pub const CARP_SENDAD_MIN_SUCCESS: u32 = 3;

/// Master-down window in units of the effective interval
pub const CARP_MASTER_DOWN_MULTIPLIER: u32 = 3;

/// CARP state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarpState {
    /// Not participating: no interface, no addresses or administratively down
    Init,
    /// Watching the master and waiting for it to disappear
    Backup,
    /// Owning the virtual addresses and advertising
    Master,
}

impl std::fmt::Display for CarpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CarpState::Init => write!(f, "INIT"),
            CarpState::Backup => write!(f, "BACKUP"),
            CarpState::Master => write!(f, "MASTER"),
        }
    }
}

/// Address family of a virtual address or multicast membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Family {
    Inet,
    Inet6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::Inet,
            IpAddr::V6(_) => Family::Inet6,
        }
    }

    /// Multicast group advertisements of this family are sent to
    pub fn group(self) -> IpAddr {
        match self {
            Family::Inet => IpAddr::V4(CARP_MULTICAST_ADDR_V4),
            Family::Inet6 => IpAddr::V6(CARP_MULTICAST_ADDR_V6),
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::Inet => write!(f, "inet"),
            Family::Inet6 => write!(f, "inet6"),
        }
    }
}

/// Advertisement interval expressed as base seconds plus skew/256 seconds.
///
/// Field order makes the derived ordering compare base first, then skew,
/// which is the same as comparing the effective intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub base: u8,
    pub skew: u8,
}

impl Interval {
    pub const fn new(base: u8, skew: u8) -> Self {
        Self { base, skew }
    }

    /// Interval in 1/256 second units
    pub fn ticks(&self) -> u32 {
        u32::from(self.base) * 256 + u32::from(self.skew)
    }

    /// Effective advertisement interval
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.base))
            + Duration::from_micros(u64::from(self.skew) * 1_000_000 / 256)
    }

    /// Time a backup waits without hearing the master before taking over
    pub fn master_down(&self) -> Duration {
        self.as_duration() * CARP_MASTER_DOWN_MULTIPLIER
    }

    /// True if a master advertising at `self` is slower than three of the
    /// local base intervals plus the local skew. Only the base is tripled.
    pub fn exceeds_master_down(&self, local: &Interval) -> bool {
        self.ticks()
            > CARP_MASTER_DOWN_MULTIPLIER * 256 * u32::from(local.base) + u32::from(local.skew)
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}/256s", self.base, self.skew)
    }
}

/// Handle of a virtual router inside a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouterId(pub u32);

impl std::fmt::Display for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "carp{}", self.0)
    }
}

/// Handle of a backing interface inside a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId(pub u32);

/// Global protocol switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarpOptions {
    /// Accept incoming advertisements at all
    pub allow: bool,

    /// Take over from slower masters and go straight to MASTER on start
    pub preempt: bool,

    /// Log dropped advertisements at debug level
    pub log_bad_packets: bool,
}

impl Default for CarpOptions {
    fn default() -> Self {
        Self {
            allow: true,
            preempt: false,
            log_bad_packets: true,
        }
    }
}

/// CARP statistics, shared by every router in a registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarpStats {
    /// IPv4 advertisements received
    pub ipackets: u64,

    /// IPv6 advertisements received
    pub ipackets6: u64,

    /// Received on an interface without CARP routers
    pub badif: u64,

    /// TTL / hop limit other than 255
    pub badttl: u64,

    /// Too short, wrong type or wrong auth length
    pub badlen: u64,

    /// Checksum mismatch
    pub badsum: u64,

    /// Protocol version other than 2
    pub badver: u64,

    /// No running router with this vhid on the interface
    pub badvhid: u64,

    /// HMAC verification failed
    pub badauth: u64,

    /// IPv4 advertisements sent
    pub opackets: u64,

    /// IPv6 advertisements sent
    pub opackets6: u64,

    /// Advertisements that could not be transmitted
    pub oerrors: u64,
}

impl CarpStats {
    pub(crate) fn count_input(&mut self, family: Family) {
        match family {
            Family::Inet => self.ipackets += 1,
            Family::Inet6 => self.ipackets6 += 1,
        }
    }

    pub(crate) fn count_output(&mut self, family: Family) {
        match family {
            Family::Inet => self.opackets += 1,
            Family::Inet6 => self.opackets6 += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_ordering_matches_duration() {
        let fast = Interval::new(1, 0);
        let skewed = Interval::new(1, 100);
        let slow = Interval::new(2, 0);

        assert!(fast < skewed);
        assert!(skewed < slow);
        assert!(fast.as_duration() < skewed.as_duration());
        assert!(skewed.as_duration() < slow.as_duration());
    }

    #[test]
    fn test_interval_durations() {
        let interval = Interval::new(1, 128);
        assert_eq!(interval.as_duration(), Duration::from_millis(1500));
        assert_eq!(interval.master_down(), Duration::from_millis(4500));
        assert_eq!(interval.ticks(), 384);
    }

    #[test]
    fn test_exceeds_master_down() {
        let local = Interval::new(1, 0);
        assert!(!Interval::new(3, 0).exceeds_master_down(&local));
        assert!(Interval::new(3, 1).exceeds_master_down(&local));
        assert!(Interval::new(10, 0).exceeds_master_down(&local));

        let skewed = Interval::new(1, 100);
        assert!(!Interval::new(3, 100).exceeds_master_down(&skewed));
        assert!(Interval::new(3, 101).exceeds_master_down(&skewed));
        assert!(Interval::new(4, 0).exceeds_master_down(&skewed));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CarpState::Init.to_string(), "INIT");
        assert_eq!(CarpState::Backup.to_string(), "BACKUP");
        assert_eq!(CarpState::Master.to_string(), "MASTER");
    }

    #[test]
    fn test_family_groups() {
        assert_eq!(Family::Inet.group(), "224.0.0.18".parse::<IpAddr>().unwrap());
        assert_eq!(Family::Inet6.group(), "ff02::12".parse::<IpAddr>().unwrap());
        assert_eq!(Family::of(&"10.0.0.1".parse().unwrap()), Family::Inet);
    }

    #[test]
    fn test_default_options() {
        let options = CarpOptions::default();
        assert!(options.allow);
        assert!(!options.preempt);
    }
}
