//! Transport-side capabilities consumed by contacts.
//!
//! Spools carry application messages once a contact is established; the
//! rendezvous service carries PANDA payloads before that.

pub mod rendezvous;
pub mod spool;

pub use rendezvous::*;
pub use spool::*;
