//! Utility modules for configuration, error handling and the wire codec.

pub mod config;
pub mod errors;
pub(crate) mod wire;

pub use config::*;
pub use errors::*;
