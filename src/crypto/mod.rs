//! Cryptographic identity primitives.
//!
//! The identity key pair signs a ratchet's key exchange; verification is
//! done against the public key embedded in the exchange itself.

pub mod identity;

pub use identity::*;
