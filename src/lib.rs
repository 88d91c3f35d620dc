//! # Mixnet Contacts
//!
//! Contact lifecycle for an anonymous mix network messenger: introducing two
//! peers, completing a forward-secure ratchet key exchange either directly or
//! through a PANDA rendezvous, and persisting the whole record, live ratchet
//! included, as a tamper-evident binary blob.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mixnet_contacts::{transport::MemorySpool, ContactBook};
//! use rand::rngs::OsRng;
//!
//! # fn main() -> mixnet_contacts::Result<()> {
//! let mut book = ContactBook::new();
//! let spool = MemorySpool::new("provider.example");
//! let bob = book.add_contact("bob", &spool, &mut OsRng)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`contact`]: contact records, exchange envelopes, persistence and the
//!   contact book
//! - [`panda`]: the PANDA exchange state and its background coordinator
//! - [`session`]: the double ratchet owned by each contact
//! - [`crypto`]: identity keys that sign key exchanges
//! - [`transport`]: spool and rendezvous capabilities
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod contact;
pub mod crypto;
pub mod panda;
pub mod session;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod test_support;

// Re-export commonly used types for convenience
pub use contact::{Contact, ContactBook, ContactStatus, ExchangeEnvelope, SharedContact};
pub use crypto::IdentityKeyPair;
pub use panda::{PandaExchange, PandaOutcome};
pub use session::{Ratchet, SignedKeyExchange};
pub use transport::{Rendezvous, SpoolReader, SpoolWriterRef};
pub use utils::{ContactsConfig, ContactsError, Result};

/// Upper bound on any decoded record, envelope or blob (1 MiB)
pub const MAX_RECORD_SIZE: u64 = 1024 * 1024;

/// Upper bound on a whole contact book file (256 MiB)
pub const MAX_BOOK_SIZE: u64 = 256 * MAX_RECORD_SIZE;

/// Default configuration values
pub mod defaults {
    /// Default delay between PANDA rendezvous polls in milliseconds
    pub const DEFAULT_PANDA_POLL_INTERVAL_MS: u64 = 5_000;

    /// Default number of PANDA polls before giving up
    pub const DEFAULT_PANDA_MAX_ATTEMPTS: u32 = 720;
}
