//! Common utilities and types shared across CARP components.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
