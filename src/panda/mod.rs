//! PANDA: key exchange through a rendezvous service keyed by a shared secret

pub mod coordinator;
pub mod exchange;

pub use coordinator::{resume_exchange, start_exchange, PandaOutcome, PandaShutdown};
pub use exchange::{PandaExchange, PandaStatus};
