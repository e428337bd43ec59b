//! Common error types for CARP components.

use std::fmt;

/// A specialized Result type for CARP daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for CARP daemon operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("CARP error: {0}")]
    Carp(String),

    #[error("Interface error: {0}")]
    Interface(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new CARP protocol error.
    pub fn carp(msg: impl fmt::Display) -> Self {
        Error::Carp(msg.to_string())
    }

    /// Create a new interface error.
    pub fn interface(msg: impl fmt::Display) -> Self {
        Error::Interface(msg.to_string())
    }
}
