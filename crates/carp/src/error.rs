//! Error types for the CARP protocol engine.

use crate::types::RouterId;
use std::net::IpAddr;
use thiserror::Error;

/// Errors produced by the protocol engine and its administrative surface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CarpError {
    #[error("vhid {0} is already in use on this interface")]
    DuplicateVhid(u8),

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("malformed advertisement: {0}")]
    MalformedAdvertisement(&'static str),

    #[error("unsupported CARP version {0}")]
    UnsupportedVersion(u8),

    #[error("advertisement checksum mismatch")]
    ChecksumMismatch,

    #[error("advertisement failed authentication")]
    AuthenticationFailure,

    #[error("no interface address covers {0}")]
    NoBackingAddress(IpAddr),

    #[error("{address} is backed by {found}, router is bound to {bound}")]
    InterfaceConflict {
        address: IpAddr,
        bound: String,
        found: String,
    },

    #[error("failed to transmit advertisement: {0}")]
    TransmitFailure(String),

    #[error("failed to join multicast group: {0}")]
    MulticastFailure(String),

    #[error("unknown router {0}")]
    UnknownRouter(RouterId),

    #[error("{0} is not configured on this router")]
    UnknownAddress(IpAddr),

    #[error("dispatcher is not running")]
    DispatcherClosed,
}

/// A specialized Result type for CARP operations.
pub type CarpResult<T> = std::result::Result<T, CarpError>;

impl From<CarpError> for common::Error {
    fn from(err: CarpError) -> Self {
        common::Error::carp(err)
    }
}
