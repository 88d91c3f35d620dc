//! Ratchet session layer.
//!
//! The [`Ratchet`] is the end-to-end encryption state a contact owns. It
//! produces and consumes [`SignedKeyExchange`] material and serializes itself
//! as an opaque blob for the persistence codec.

pub mod ratchet;

pub use ratchet::*;
