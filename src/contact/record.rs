//! The contact record and its key exchange state machine.
//!
//! A contact starts `Pending` with a freshly generated ratchet and an outgoing
//! envelope ready to hand to the peer. Processing the peer's envelope moves it
//! to `Established`, which is final.

use super::envelope;
use crate::panda::PandaShutdown;
use crate::session::Ratchet;
use crate::transport::{SpoolReader, SpoolWriterRef};
use crate::utils::{ContactError, RatchetError, Result};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Maximum nickname length in characters
pub const MAX_NICKNAME_LENGTH: usize = 64;

/// A contact shared between its owner and a PANDA coordinator.
///
/// The write lock is the single-writer guard for the record's mutable state.
pub type SharedContact = Arc<RwLock<Contact>>;

/// Key exchange status of a contact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactStatus {
    /// Our envelope exists but the peer's has not been processed
    Pending,
    /// The ratchet session is ready for messaging
    Established,
}

impl fmt::Display for ContactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Established => write!(f, "established"),
        }
    }
}

/// A communications contact
#[derive(Debug)]
pub struct Contact {
    pub(super) id: u64,
    pub(super) nickname: String,
    pub(super) status: ContactStatus,
    /// Our serialized exchange envelope
    pub(super) outgoing_exchange: Vec<u8>,
    /// Serialized PANDA state, once a rendezvous exchange was attempted
    pub(super) panda_exchange: Option<Vec<u8>>,
    /// Failure description of the last PANDA attempt
    pub(super) panda_result: Option<String>,
    pub(super) ratchet: Ratchet,
    /// Writer for the peer's spool
    pub(super) send_channel: Option<SpoolWriterRef>,
    pub(super) panda_shutdown: PandaShutdown,
}

/// Check a nickname is usable as a display label
pub fn validate_nickname(nickname: &str) -> Result<()> {
    let reason = if nickname.trim().is_empty() {
        "nickname must not be empty"
    } else if nickname.chars().count() > MAX_NICKNAME_LENGTH {
        "nickname is too long"
    } else if nickname.chars().any(char::is_control) {
        "nickname contains control characters"
    } else {
        return Ok(());
    };

    Err(ContactError::InvalidNickname {
        reason: reason.to_string(),
    }
    .into())
}

impl Contact {
    /// Create a pending contact with a fresh ratchet and outgoing envelope
    ///
    /// # Arguments
    ///
    /// * `nickname` - Local display label
    /// * `id` - Identifier allocated by the owning collection
    /// * `spool` - The spool we read from; the peer gets a writer for it
    /// * `rng` - Randomness source for the ratchet
    ///
    /// # Errors
    ///
    /// Returns `RatchetError::Init` if the ratchet cannot be generated
    pub fn new<R: RngCore + CryptoRng>(
        nickname: impl Into<String>,
        id: u64,
        spool: &dyn SpoolReader,
        rng: &mut R,
    ) -> Result<Self> {
        let nickname = nickname.into();
        validate_nickname(&nickname)?;

        let ratchet = Ratchet::new(rng)?;
        let signed_key_exchange = ratchet.create_key_exchange()?;
        let spool_writer = spool.writer_ref();
        let outgoing_exchange = envelope::build(&spool_writer, &signed_key_exchange)?;

        log::info!("Created pending contact {} ({})", id, nickname);
        Ok(Self {
            id,
            nickname,
            status: ContactStatus::Pending,
            outgoing_exchange,
            panda_exchange: None,
            panda_result: None,
            ratchet,
            send_channel: None,
            panda_shutdown: PandaShutdown::new(),
        })
    }

    /// Wrap this contact for sharing with a PANDA coordinator
    pub fn into_shared(self) -> SharedContact {
        Arc::new(RwLock::new(self))
    }

    /// Process the peer's envelope and establish the session
    ///
    /// The contact is unchanged on any error.
    ///
    /// # Errors
    ///
    /// * `ContactError::AlreadyEstablished` if the contact is established
    /// * `RatchetError::ReplayOrStale` if the envelope was already consumed
    /// * `CodecError::Decoding` if the envelope is malformed
    /// * ratchet errors such as a bad signature
    pub fn complete_exchange(&mut self, peer_envelope: &[u8]) -> Result<()> {
        if self.status == ContactStatus::Established {
            let replayed = envelope::parse(peer_envelope)
                .map(|e| self.ratchet.is_peer_exchange(e.signed_key_exchange()))
                .unwrap_or(false);
            if replayed {
                return Err(RatchetError::ReplayOrStale {
                    reason: "peer key exchange was already processed".to_string(),
                }
                .into());
            }
            return Err(ContactError::AlreadyEstablished {
                nickname: self.nickname.clone(),
            }
            .into());
        }

        let (spool_writer, signed_key_exchange) = envelope::parse(peer_envelope)?.into_parts();
        self.ratchet.process_key_exchange(&signed_key_exchange)?;

        self.send_channel = Some(spool_writer);
        self.status = ContactStatus::Established;
        log::info!("Contact {} ({}) established", self.id, self.nickname);
        Ok(())
    }

    /// Local identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Display label
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Key exchange status
    pub fn status(&self) -> ContactStatus {
        self.status
    }

    /// True until the peer's envelope has been processed
    pub fn is_pending(&self) -> bool {
        self.status == ContactStatus::Pending
    }

    /// Our serialized envelope, to be handed to the peer
    pub fn outgoing_exchange(&self) -> &[u8] {
        &self.outgoing_exchange
    }

    /// Serialized PANDA state, if a rendezvous exchange was attempted
    pub fn panda_exchange(&self) -> Option<&[u8]> {
        self.panda_exchange.as_deref()
    }

    /// Why the last PANDA attempt failed, if it did
    pub fn panda_result(&self) -> Option<&str> {
        self.panda_result.as_deref()
    }

    /// Writer for the peer's spool, once established
    pub fn send_channel(&self) -> Option<&SpoolWriterRef> {
        self.send_channel.as_ref()
    }

    /// The contact's ratchet
    pub fn ratchet(&self) -> &Ratchet {
        &self.ratchet
    }

    /// Encrypt an application message for this contact
    ///
    /// # Errors
    ///
    /// Returns `ContactError::NotEstablished` while pending
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.require_established()?;
        self.ratchet.encrypt(plaintext)
    }

    /// Decrypt an application message from this contact
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.require_established()?;
        self.ratchet.decrypt(ciphertext)
    }

    /// Ask a running PANDA exchange to stop at its next suspension point
    pub fn cancel_panda(&self) {
        if self.panda_shutdown.signal() {
            log::info!("Cancelling PANDA exchange for {}", self.nickname);
        }
    }

    pub(crate) fn set_nickname(&mut self, nickname: String) {
        self.nickname = nickname;
    }

    pub(crate) fn set_panda_exchange(&mut self, blob: Vec<u8>) {
        self.panda_exchange = Some(blob);
    }

    pub(crate) fn set_panda_result(&mut self, result: String) {
        self.panda_result = Some(result);
    }

    pub(crate) fn clear_panda_result(&mut self) {
        self.panda_result = None;
    }

    /// Stop any previous PANDA task and hand out a fresh cancellation receiver
    pub(crate) fn reset_panda_shutdown(&mut self) -> watch::Receiver<bool> {
        self.panda_shutdown.signal();
        self.panda_shutdown = PandaShutdown::new();
        self.panda_shutdown.subscribe()
    }

    fn require_established(&self) -> Result<()> {
        if self.status != ContactStatus::Established {
            return Err(ContactError::NotEstablished {
                nickname: self.nickname.clone(),
            }
            .into());
        }
        Ok(())
    }
}
