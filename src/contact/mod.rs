//! Contacts, their exchange envelopes and persistence

pub mod book;
pub mod codec;
pub mod envelope;
pub mod record;

pub use book::ContactBook;
pub use codec::{marshal, unmarshal};
pub use envelope::ExchangeEnvelope;
pub use record::{validate_nickname, Contact, ContactStatus, SharedContact};
