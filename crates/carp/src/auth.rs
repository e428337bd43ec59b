//! HMAC-SHA1 authentication of advertisements.
//!
//! The MAC covers the protocol version, message type, vhid, every active
//! virtual address (IPv4 ascending, then IPv6 ascending) and finally the
//! 64-bit counter. Everything but the counter is fixed for a given
//! configuration, so the keyed state over those fields is computed once in
//! [`Authenticator::prepare`] and cloned for every generate/verify.

use crate::types::{CARP_ADVERTISEMENT, CARP_KEY_LEN, CARP_VERSION};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::net::IpAddr;

type HmacSha1 = Hmac<Sha1>;

/// Shared secret of a virtual router
pub type CarpKey = [u8; CARP_KEY_LEN];

/// Per-router authentication state: key, counter and prepared MAC
#[derive(Clone)]
pub struct Authenticator {
    key: CarpKey,
    counter: u64,
    reseed: bool,
    prepared: HmacSha1,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("counter", &self.counter)
            .field("reseed", &self.reseed)
            .finish_non_exhaustive()
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new([0u8; CARP_KEY_LEN])
    }
}

impl Authenticator {
    pub fn new(key: CarpKey) -> Self {
        Self {
            key,
            counter: 0,
            reseed: true,
            prepared: keyed(&key),
        }
    }

    /// Derive a key from a passphrase: zero padded or truncated to 20 bytes.
    pub fn key_from_passphrase(passphrase: &str) -> CarpKey {
        let mut key = [0u8; CARP_KEY_LEN];
        let bytes = passphrase.as_bytes();
        let len = bytes.len().min(CARP_KEY_LEN);
        key[..len].copy_from_slice(&bytes[..len]);
        key
    }

    pub fn key(&self) -> &CarpKey {
        &self.key
    }

    /// Replace the key. The caller must [`prepare`](Self::prepare) afterwards.
    pub fn set_key(&mut self, key: CarpKey) {
        self.key = key;
    }

    /// Last counter sent or accepted
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Recompute the keyed state over the static fields.
    ///
    /// `addresses` must yield the active virtual addresses in ascending
    /// order, IPv4 before IPv6 (the natural `IpAddr` ordering).
    pub fn prepare<I>(&mut self, vhid: u8, addresses: I)
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let mut mac = keyed(&self.key);
        mac.update(&[CARP_VERSION, CARP_ADVERTISEMENT, vhid]);
        for addr in addresses {
            match addr {
                IpAddr::V4(v4) => mac.update(&v4.octets()),
                IpAddr::V6(v6) => mac.update(&v6.octets()),
            }
        }
        self.prepared = mac;
    }

    /// Advance the counter and compute the MAC for it.
    ///
    /// The first counter after creation (or after a reset) is random;
    /// later ones increment.
    pub fn generate(&mut self) -> (u64, CarpKey) {
        if self.reseed {
            self.counter = rand::random::<u64>();
            self.reseed = false;
        } else {
            self.counter = self.counter.wrapping_add(1);
        }
        (self.counter, self.compute(self.counter))
    }

    /// Check a received counter/MAC pair against the prepared state.
    pub fn verify(&self, counter: u64, mac: &[u8]) -> bool {
        let mut hmac = self.prepared.clone();
        hmac.update(&counter.to_be_bytes());
        hmac.verify_slice(mac).is_ok()
    }

    /// Adopt the counter of an authenticated peer advertisement.
    ///
    /// No replay window is enforced.
    pub fn accept_counter(&mut self, counter: u64) {
        self.reseed = false;
        self.counter = counter;
    }

    /// Force a fresh random counter on the next generate.
    pub fn reset_counter(&mut self) {
        self.reseed = true;
        self.counter = 0;
    }

    fn compute(&self, counter: u64) -> CarpKey {
        let mut hmac = self.prepared.clone();
        hmac.update(&counter.to_be_bytes());
        let mut out = [0u8; CARP_KEY_LEN];
        out.copy_from_slice(&hmac.finalize().into_bytes());
        out
    }
}

fn keyed(key: &CarpKey) -> HmacSha1 {
    HmacSha1::new_from_slice(key).expect("HMAC can take key of any size")
}
