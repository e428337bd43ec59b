//! CARP advertisement format and parsing.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version| Type  |     VHID      |    AdvSkew    |    Auth Len   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Reserved   |    AdvBase    |          Checksum             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Counter (1)                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Counter (2)                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +                  SHA-1 HMAC (20 octets)                       +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The checksum covers the CARP header only; there is no pseudo-header.

use crate::error::{CarpError, CarpResult};
use crate::types::{CARP_ADVERTISEMENT, CARP_AUTHLEN, CARP_KEY_LEN, CARP_VERSION, Interval};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of an encoded advertisement
pub const CARP_HEADER_LEN: usize = 36;

/// Offset of the checksum field
const CHECKSUM_OFFSET: usize = 6;

/// A decoded CARP advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub version: u8,
    pub kind: u8,
    pub vhid: u8,
    pub advskew: u8,
    pub authlen: u8,
    pub advbase: u8,
    pub checksum: u16,
    pub counter: u64,
    pub mac: [u8; CARP_KEY_LEN],
}

impl Advertisement {
    /// Create an advertisement ready to be encoded
    pub fn new(vhid: u8, advbase: u8, advskew: u8, counter: u64, mac: [u8; CARP_KEY_LEN]) -> Self {
        Self {
            version: CARP_VERSION,
            kind: CARP_ADVERTISEMENT,
            vhid,
            advskew,
            authlen: CARP_AUTHLEN,
            advbase,
            checksum: 0,
            counter,
            mac,
        }
    }

    /// Interval the sender claims to advertise at
    pub fn interval(&self) -> Interval {
        Interval::new(self.advbase, self.advskew)
    }

    /// Serialize to wire format with a freshly computed checksum
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CARP_HEADER_LEN);

        buf.put_u8((self.version << 4) | (self.kind & 0x0F));
        buf.put_u8(self.vhid);
        buf.put_u8(self.advskew);
        buf.put_u8(self.authlen);
        buf.put_u8(0);
        buf.put_u8(self.advbase);
        buf.put_u16(0);
        buf.put_u32((self.counter >> 32) as u32);
        buf.put_u32(self.counter as u32);
        buf.put_slice(&self.mac);

        let checksum = internet_checksum(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());

        buf.freeze()
    }

    /// Parse an advertisement. Never touches router state.
    pub fn decode(data: &[u8]) -> CarpResult<Self> {
        if data.len() < CARP_HEADER_LEN {
            return Err(CarpError::MalformedAdvertisement("packet too short"));
        }
        let data = &data[..CARP_HEADER_LEN];

        if internet_checksum(data) != 0 {
            return Err(CarpError::ChecksumMismatch);
        }

        let mut buf = data;
        let version_type = buf.get_u8();
        let version = version_type >> 4;
        let kind = version_type & 0x0F;

        if version != CARP_VERSION {
            return Err(CarpError::UnsupportedVersion(version));
        }
        if kind != CARP_ADVERTISEMENT {
            return Err(CarpError::MalformedAdvertisement("unknown message type"));
        }

        let vhid = buf.get_u8();
        let advskew = buf.get_u8();
        let authlen = buf.get_u8();
        let _pad = buf.get_u8();
        let advbase = buf.get_u8();
        let checksum = buf.get_u16();
        let counter = (u64::from(buf.get_u32()) << 32) | u64::from(buf.get_u32());
        let mut mac = [0u8; CARP_KEY_LEN];
        buf.copy_to_slice(&mut mac);

        Ok(Self {
            version,
            kind,
            vhid,
            advskew,
            authlen,
            advbase,
            checksum,
            counter,
            mac,
        })
    }
}

/// RFC 1071 internet checksum. Summing a buffer that already carries a
/// valid checksum yields zero.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Advertisement {
        Advertisement::new(7, 1, 100, 0x0102_0304_0506_0708, [0xAB; CARP_KEY_LEN])
    }

    #[test]
    fn test_encode_layout() {
        let bytes = sample().encode();

        assert_eq!(bytes.len(), CARP_HEADER_LEN);
        assert_eq!(bytes[0], 0x21);
        assert_eq!(bytes[1], 7);
        assert_eq!(bytes[2], 100);
        assert_eq!(bytes[3], CARP_AUTHLEN);
        assert_eq!(bytes[4], 0);
        assert_eq!(bytes[5], 1);
        assert_eq!(&bytes[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[16..], &[0xAB; CARP_KEY_LEN]);
    }

    #[test]
    fn test_encode_decode() {
        let ad = sample();
        let parsed = Advertisement::decode(&ad.encode()).unwrap();

        assert_eq!(parsed.vhid, ad.vhid);
        assert_eq!(parsed.advbase, ad.advbase);
        assert_eq!(parsed.advskew, ad.advskew);
        assert_eq!(parsed.counter, ad.counter);
        assert_eq!(parsed.mac, ad.mac);
        assert_eq!(parsed.interval(), Interval::new(1, 100));
    }

    #[test]
    fn test_decode_short_packet() {
        let bytes = sample().encode();
        assert_eq!(
            Advertisement::decode(&bytes[..20]),
            Err(CarpError::MalformedAdvertisement("packet too short"))
        );
    }

    #[test]
    fn test_decode_bad_checksum() {
        let mut bytes = sample().encode().to_vec();
        bytes[2] ^= 0x01;
        assert_eq!(Advertisement::decode(&bytes), Err(CarpError::ChecksumMismatch));
    }

    #[test]
    fn test_decode_wrong_version() {
        let mut ad = sample();
        ad.version = 3;
        assert_eq!(
            Advertisement::decode(&ad.encode()),
            Err(CarpError::UnsupportedVersion(3))
        );
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut bytes = sample().encode().to_vec();
        bytes.extend_from_slice(&[0xFF; 8]);
        assert!(Advertisement::decode(&bytes).is_ok());
    }

    #[test]
    fn test_checksum_odd_length() {
        // 0x0100 + 0x0200 = 0x0300, complement 0xFCFF
        assert_eq!(internet_checksum(&[1, 0, 2]), 0xFCFF);
    }
}
