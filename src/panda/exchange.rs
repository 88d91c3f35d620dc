//! Persistent state of one PANDA exchange.
//!
//! Both parties derive the same rendezvous tag and pairing key from their
//! shared secret, post their exchange envelope sealed under the pairing key,
//! and accept the first payload that opens to an envelope other than their
//! own. Postings are deterministic for a given secret and envelope, so a
//! restarted exchange re-posts the same bytes. The secret is stretched
//! with HKDF only; this is not the SPAKE2 based PANDA of the wider network
//! and offers no protection against offline guessing of weak secrets.

use crate::transport::RendezvousTag;
use crate::utils::{wire, PandaError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

const KDF_SALT: &[u8] = b"MixnetContacts-PANDA";
const TAG_INFO: &[u8] = b"MixnetContacts-PANDA-Tag";
const PAIRING_KEY_INFO: &[u8] = b"MixnetContacts-PANDA-PairingKey";
const NONCE_INFO: &[u8] = b"MixnetContacts-PANDA-Nonce";
const NONCE_SIZE: usize = 12;

/// Where an exchange stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PandaStatus {
    /// Posting and polling
    InProgress,
    /// Peer envelope retrieved and processed
    Completed,
    /// Terminated abnormally; never resumed
    Failed,
}

/// State of a PANDA exchange, persisted in the contact record
#[derive(Clone, Serialize, Deserialize)]
pub struct PandaExchange {
    tag: RendezvousTag,
    pairing_key: [u8; 32],
    #[serde(with = "serde_bytes")]
    envelope: Vec<u8>,
    #[serde(with = "serde_bytes")]
    posting: Vec<u8>,
    #[serde(with = "serde_bytes")]
    peer_envelope: Option<Vec<u8>>,
    status: PandaStatus,
}

impl fmt::Debug for PandaExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PandaExchange")
            .field("tag", &hex::encode(self.tag))
            .field("pairing_key", &"[REDACTED]")
            .field("posting_len", &self.posting.len())
            .field("status", &self.status)
            .finish()
    }
}

impl PandaExchange {
    /// Derive fresh exchange state for `envelope` from `shared_secret`
    ///
    /// # Errors
    ///
    /// Returns `PandaError::EmptySecret` for an empty secret
    pub fn new(shared_secret: &[u8], envelope: &[u8]) -> Result<Self> {
        if shared_secret.is_empty() {
            return Err(PandaError::EmptySecret.into());
        }

        let (tag, pairing_key) = derive_keys(shared_secret)?;
        let posting = seal(&pairing_key, &tag, envelope)?;

        Ok(Self {
            tag,
            pairing_key,
            envelope: envelope.to_vec(),
            posting,
            peer_envelope: None,
            status: PandaStatus::InProgress,
        })
    }

    /// Rendezvous tag both parties post under
    pub fn tag(&self) -> &RendezvousTag {
        &self.tag
    }

    /// Our sealed envelope as posted to the rendezvous
    pub fn posting(&self) -> &[u8] {
        &self.posting
    }

    /// The peer's envelope, once retrieved
    pub fn peer_envelope(&self) -> Option<&[u8]> {
        self.peer_envelope.as_deref()
    }

    /// Current status
    pub fn status(&self) -> PandaStatus {
        self.status
    }

    /// Find the peer's envelope among the payloads stored under our tag
    ///
    /// Returns `Ok(None)` while only our own postings are present. A payload
    /// that opens to our own envelope is ours, even if an earlier attempt
    /// sealed it under a different nonce.
    ///
    /// # Errors
    ///
    /// Returns `PandaError::AuthenticationFailed` if a foreign payload is
    /// present but none opens under the pairing key
    pub fn open_peer_payload(&self, payloads: &[Vec<u8>]) -> Result<Option<Vec<u8>>> {
        let mut unopened = 0usize;
        for payload in payloads.iter().filter(|p| p.as_slice() != self.posting.as_slice()) {
            match open(&self.pairing_key, &self.tag, payload) {
                Some(envelope) if envelope == self.envelope => continue,
                Some(envelope) => return Ok(Some(envelope)),
                None => unopened += 1,
            }
        }

        if unopened > 0 {
            return Err(PandaError::AuthenticationFailed.into());
        }
        Ok(None)
    }

    pub(crate) fn mark_completed(&mut self, peer_envelope: Vec<u8>) {
        self.peer_envelope = Some(peer_envelope);
        self.status = PandaStatus::Completed;
    }

    pub(crate) fn mark_failed(&mut self) {
        self.status = PandaStatus::Failed;
    }

    /// Serialize for storage in the contact record
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        wire::encode("PANDA exchange", self)
    }

    /// Restore from [`PandaExchange::to_bytes`] output
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        wire::decode("PANDA exchange", bytes)
    }
}

fn derive_keys(shared_secret: &[u8]) -> Result<(RendezvousTag, [u8; 32])> {
    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), shared_secret);
    let mut tag = [0u8; 32];
    let mut pairing_key = [0u8; 32];
    hk.expand(TAG_INFO, &mut tag)
        .and_then(|_| hk.expand(PAIRING_KEY_INFO, &mut pairing_key))
        .map_err(|_| PandaError::Protocol {
            reason: "key derivation failed".to_string(),
        })?;
    Ok((tag, pairing_key))
}

/// Seal `envelope` under a nonce derived from the key and the envelope
///
/// The same envelope always yields the same posting; distinct envelopes get
/// distinct nonces.
fn seal(key: &[u8; 32], tag: &RendezvousTag, envelope: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    Hkdf::<Sha256>::new(Some(envelope), key)
        .expand(NONCE_INFO, &mut nonce)
        .map_err(|_| PandaError::Protocol {
            reason: "nonce derivation failed".to_string(),
        })?;
    seal_with_nonce(key, tag, &nonce, envelope)
}

fn seal_with_nonce(
    key: &[u8; 32],
    tag: &RendezvousTag,
    nonce: &[u8; NONCE_SIZE],
    envelope: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from(*nonce);
    let mut sealed = cipher
        .encrypt(&nonce, Payload { msg: envelope, aad: tag })
        .map_err(|_| PandaError::Protocol {
            reason: "sealing envelope failed".to_string(),
        })?;

    let mut posting = nonce.to_vec();
    posting.append(&mut sealed);
    Ok(posting)
}

fn open(key: &[u8; 32], tag: &RendezvousTag, posting: &[u8]) -> Option<Vec<u8>> {
    if posting.len() < NONCE_SIZE {
        return None;
    }
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(
            Nonce::from_slice(&posting[..NONCE_SIZE]),
            Payload {
                msg: &posting[NONCE_SIZE..],
                aad: tag,
            },
        )
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ContactsError;

    #[test]
    fn test_same_secret_same_tag() {
        let a = PandaExchange::new(b"correct horse", b"alice envelope").unwrap();
        let b = PandaExchange::new(b"correct horse", b"bob envelope").unwrap();
        let c = PandaExchange::new(b"battery staple", b"carol envelope").unwrap();

        assert_eq!(a.tag(), b.tag());
        assert_ne!(a.tag(), c.tag());
        assert_ne!(a.posting(), b.posting());
    }

    #[test]
    fn test_peer_payload_opens() {
        let a = PandaExchange::new(b"secret", b"alice envelope").unwrap();
        let b = PandaExchange::new(b"secret", b"bob envelope").unwrap();
        let payloads = vec![a.posting().to_vec(), b.posting().to_vec()];

        assert_eq!(a.open_peer_payload(&payloads).unwrap(), Some(b"bob envelope".to_vec()));
        assert_eq!(b.open_peer_payload(&payloads).unwrap(), Some(b"alice envelope".to_vec()));
    }

    #[test]
    fn test_own_posting_is_skipped() {
        let a = PandaExchange::new(b"secret", b"alice envelope").unwrap();
        assert_eq!(a.open_peer_payload(&[a.posting().to_vec()]).unwrap(), None);
        assert_eq!(a.open_peer_payload(&[]).unwrap(), None);
    }

    #[test]
    fn test_restarted_exchange_posts_same_bytes() {
        let first = PandaExchange::new(b"secret", b"alice envelope").unwrap();
        let again = PandaExchange::new(b"secret", b"alice envelope").unwrap();
        assert_eq!(first.posting(), again.posting());
    }

    #[test]
    fn test_earlier_own_posting_is_not_the_peer() {
        let a = PandaExchange::new(b"secret", b"alice envelope").unwrap();
        let b = PandaExchange::new(b"secret", b"bob envelope").unwrap();
        let earlier =
            seal_with_nonce(&a.pairing_key, a.tag(), &[7u8; NONCE_SIZE], b"alice envelope").unwrap();
        assert_ne!(earlier.as_slice(), a.posting());

        let only_ours = vec![earlier.clone(), a.posting().to_vec()];
        assert_eq!(a.open_peer_payload(&only_ours).unwrap(), None);

        let with_peer = vec![earlier, a.posting().to_vec(), b.posting().to_vec()];
        assert_eq!(
            a.open_peer_payload(&with_peer).unwrap(),
            Some(b"bob envelope".to_vec())
        );
    }

    #[test]
    fn test_foreign_payload_fails_authentication() {
        let a = PandaExchange::new(b"secret", b"alice envelope").unwrap();
        let payloads = vec![a.posting().to_vec(), b"forged".to_vec(), vec![0u8; 64]];

        let err = a.open_peer_payload(&payloads).unwrap_err();
        assert!(matches!(err, ContactsError::Panda(PandaError::AuthenticationFailed)));
    }

    #[test]
    fn test_empty_secret_rejected() {
        let err = PandaExchange::new(b"", b"envelope").unwrap_err();
        assert!(matches!(err, ContactsError::Panda(PandaError::EmptySecret)));
    }

    #[test]
    fn test_state_survives_serialization() {
        let mut a = PandaExchange::new(b"secret", b"alice envelope").unwrap();
        let b = PandaExchange::new(b"secret", b"bob envelope").unwrap();

        let restored = PandaExchange::from_bytes(&a.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.status(), PandaStatus::InProgress);
        assert_eq!(restored.posting(), a.posting());
        assert_eq!(
            restored.open_peer_payload(&[b.posting().to_vec()]).unwrap(),
            Some(b"bob envelope".to_vec())
        );

        a.mark_failed();
        let failed = PandaExchange::from_bytes(&a.to_bytes().unwrap()).unwrap();
        assert_eq!(failed.status(), PandaStatus::Failed);
    }

    #[test]
    fn test_debug_redacts_key() {
        let a = PandaExchange::new(b"secret", b"envelope").unwrap();
        let debug = format!("{a:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains(&hex::encode(a.pairing_key)));
    }
}
