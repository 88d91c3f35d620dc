//! Double Ratchet with a signed, symmetric key exchange.
//!
//! A fresh [`Ratchet`] holds an identity key and two X25519 key pairs: one for
//! the handshake Diffie-Hellman and one that seeds the DH ratchet. Both peers
//! publish a [`SignedKeyExchange`] and each processes the other's; there is no
//! initiator. The side whose handshake public key sorts lower takes the
//! "Alice" role and performs the first DH ratchet step on its first send, so
//! either side can encrypt as soon as its exchange has been processed.

use crate::crypto::{verify_signature, IdentityKeyPair};
use crate::utils::{wire, RatchetError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use x25519_dalek::{PublicKey, StaticSecret};

/// Size of symmetric encryption keys
const KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size
const NONCE_SIZE: usize = 12;

/// HKDF info for the handshake output
const HANDSHAKE_INFO: &[u8] = b"MixnetContacts-Handshake";

/// HKDF info for root key derivation
const ROOT_KEY_INFO: &[u8] = b"MixnetContacts-RootKey";

/// HKDF info for chain key derivation
const CHAIN_KEY_INFO: &[u8] = b"MixnetContacts-ChainKey";

/// Maximum number of message keys skipped in one chain
const MAX_SKIP: u32 = 1000;

/// Maximum number of skipped message keys held at once
const MAX_STORED_SKIPPED_KEYS: usize = 2000;

/// Prefix identifying a serialized ratchet
const RATCHET_MAGIC: &[u8; 4] = b"MXRT";

/// Serialized ratchet format version
const RATCHET_FORMAT_VERSION: u8 = 1;

type Key = [u8; KEY_SIZE];

/// Signed key exchange material published to the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKeyExchange {
    /// Canonical encoding of the key exchange
    #[serde(with = "serde_bytes")]
    pub signed: Vec<u8>,
    /// Ed25519 signature over `signed`
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl SignedKeyExchange {
    /// True when either part is missing
    pub fn is_empty(&self) -> bool {
        self.signed.is_empty() || self.signature.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct KeyExchange {
    identity_public: [u8; 32],
    dh: [u8; 32],
    dh1: [u8; 32],
}

/// Encrypted message with ratchet header
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RatchetMessage {
    dh_public: [u8; 32],
    previous_chain_length: u32,
    message_number: u32,
    #[serde(with = "serde_bytes")]
    ciphertext: Vec<u8>,
}

impl RatchetMessage {
    fn associated_data(&self) -> Vec<u8> {
        let mut ad = Vec::with_capacity(40);
        ad.extend_from_slice(&self.dh_public);
        ad.extend_from_slice(&self.previous_chain_length.to_le_bytes());
        ad.extend_from_slice(&self.message_number.to_le_bytes());
        ad
    }
}

/// Double Ratchet state owned by exactly one contact
#[derive(Clone)]
pub struct Ratchet {
    identity: IdentityKeyPair,
    /// Handshake key, consumed by [`Ratchet::process_key_exchange`]
    kx_private0: Option<StaticSecret>,
    /// Initial ratchet key, moved into `dh_private` on exchange
    kx_private1: Option<StaticSecret>,
    their_identity: Option<[u8; 32]>,
    root_key: Key,
    sending_chain_key: Option<Key>,
    receiving_chain_key: Option<Key>,
    dh_private: Option<StaticSecret>,
    remote_dh_public: Option<[u8; 32]>,
    sending_message_number: u32,
    receiving_message_number: u32,
    previous_sending_chain_length: u32,
    /// Set when the next send must start a new DH ratchet step
    ratchet_pending: bool,
    skipped_message_keys: HashMap<([u8; 32], u32), Key>,
}

impl std::fmt::Debug for Ratchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ratchet")
            .field("identity", &self.identity)
            .field("established", &self.is_established())
            .field("root_key", &"[REDACTED]")
            .field("sending_message_number", &self.sending_message_number)
            .field("receiving_message_number", &self.receiving_message_number)
            .field("skipped_keys", &self.skipped_message_keys.len())
            .finish()
    }
}

/// Ratchet statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RatchetStats {
    /// Messages sent in the current sending chain
    pub messages_sent: u32,
    /// Messages received in the current receiving chain
    pub messages_received: u32,
    /// Number of skipped message keys stored
    pub skipped_keys_count: usize,
}

#[derive(Serialize, Deserialize)]
struct SerializedRatchet {
    identity_secret: Key,
    kx_private0: Option<Key>,
    kx_private1: Option<Key>,
    their_identity: Option<[u8; 32]>,
    root_key: Key,
    sending_chain_key: Option<Key>,
    receiving_chain_key: Option<Key>,
    dh_private: Option<Key>,
    remote_dh_public: Option<[u8; 32]>,
    sending_message_number: u32,
    receiving_message_number: u32,
    previous_sending_chain_length: u32,
    ratchet_pending: bool,
    skipped_message_keys: Vec<([u8; 32], u32, Key)>,
}

impl Ratchet {
    /// Generate a new ratchet that has not yet exchanged keys
    ///
    /// # Errors
    ///
    /// Returns `RatchetError::Init` if the randomness source fails
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self> {
        let identity = IdentityKeyPair::generate(rng)?;
        let kx_private0 = random_secret(rng).map_err(init_failure)?;
        let kx_private1 = random_secret(rng).map_err(init_failure)?;

        Ok(Self {
            identity,
            kx_private0: Some(kx_private0),
            kx_private1: Some(kx_private1),
            their_identity: None,
            root_key: [0u8; KEY_SIZE],
            sending_chain_key: None,
            receiving_chain_key: None,
            dh_private: None,
            remote_dh_public: None,
            sending_message_number: 0,
            receiving_message_number: 0,
            previous_sending_chain_length: 0,
            ratchet_pending: false,
            skipped_message_keys: HashMap::new(),
        })
    }

    /// True once a peer's key exchange has been processed
    pub fn is_established(&self) -> bool {
        self.kx_private0.is_none() && self.dh_private.is_some()
    }

    /// This ratchet's identity public key
    pub fn identity_public(&self) -> [u8; 32] {
        self.identity.public_key_bytes()
    }

    /// The peer's identity public key, known once established
    pub fn peer_identity(&self) -> Option<[u8; 32]> {
        self.their_identity
    }

    /// True if `exchange` is a validly signed exchange from the peer this
    /// ratchet is already established with
    pub fn is_peer_exchange(&self, exchange: &SignedKeyExchange) -> bool {
        let Some(peer) = self.their_identity else {
            return false;
        };
        match wire::decode::<KeyExchange>("key exchange", &exchange.signed) {
            Ok(theirs) => {
                theirs.identity_public == peer
                    && verify_signature(&peer, &exchange.signed, &exchange.signature).is_ok()
            }
            Err(_) => false,
        }
    }

    /// Create the signed key exchange for this ratchet
    ///
    /// The result is deterministic, so it can be recreated for resending.
    pub fn create_key_exchange(&self) -> Result<SignedKeyExchange> {
        let (Some(kx0), Some(kx1)) = (&self.kx_private0, &self.kx_private1) else {
            return Err(RatchetError::InvalidState {
                state: "key exchange already completed".to_string(),
            }
            .into());
        };

        let exchange = KeyExchange {
            identity_public: self.identity.public_key_bytes(),
            dh: PublicKey::from(kx0).to_bytes(),
            dh1: PublicKey::from(kx1).to_bytes(),
        };
        let signed = wire::encode("key exchange", &exchange)?;
        let signature = self.identity.sign(&signed).to_vec();

        Ok(SignedKeyExchange { signed, signature })
    }

    /// Process the peer's signed key exchange and derive the session keys
    ///
    /// The ratchet is left untouched on any error.
    ///
    /// # Errors
    ///
    /// * `RatchetError::ReplayOrStale` if an exchange was already processed,
    ///   or the exchange is our own reflected back
    /// * `RatchetError::SignatureVerification` if the signature is invalid
    /// * `CodecError::Decoding` if the exchange is malformed
    pub fn process_key_exchange(&mut self, exchange: &SignedKeyExchange) -> Result<()> {
        let (Some(kx0), Some(kx1)) = (&self.kx_private0, &self.kx_private1) else {
            return Err(RatchetError::ReplayOrStale {
                reason: "ratchet has already processed a key exchange".to_string(),
            }
            .into());
        };

        let theirs: KeyExchange = wire::decode("key exchange", &exchange.signed)?;
        verify_signature(&theirs.identity_public, &exchange.signed, &exchange.signature)?;

        let our_dh = PublicKey::from(kx0).to_bytes();
        if theirs.dh == our_dh || theirs.identity_public == self.identity.public_key_bytes() {
            return Err(RatchetError::ReplayOrStale {
                reason: "received our own key exchange".to_string(),
            }
            .into());
        }

        let shared = kx0.diffie_hellman(&PublicKey::from(theirs.dh));
        if !shared.was_contributory() {
            return Err(RatchetError::KeyDerivation {
                reason: "non-contributory handshake key".to_string(),
            }
            .into());
        }

        let mut okm = [0u8; KEY_SIZE * 2];
        Hkdf::<Sha256>::new(None, shared.as_bytes())
            .expand(HANDSHAKE_INFO, &mut okm)
            .map_err(|_| RatchetError::KeyDerivation {
                reason: "handshake key derivation failed".to_string(),
            })?;
        let (root_key, chain_key) = split_keys(&okm);

        let am_alice = our_dh < theirs.dh;
        self.dh_private = Some(kx1.clone());
        self.kx_private0 = None;
        self.kx_private1 = None;
        self.their_identity = Some(theirs.identity_public);
        self.root_key = root_key;
        self.remote_dh_public = Some(theirs.dh1);
        if am_alice {
            self.receiving_chain_key = Some(chain_key);
            self.ratchet_pending = true;
        } else {
            self.sending_chain_key = Some(chain_key);
            self.ratchet_pending = false;
        }

        log::debug!(
            "Ratchet established with peer {} (alice: {})",
            hex::encode(&theirs.identity_public[..8]),
            am_alice
        );
        Ok(())
    }

    /// Encrypt a message for the peer
    ///
    /// # Errors
    ///
    /// Returns `RatchetError::InvalidState` before the key exchange completes
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.encrypt_with_rng(plaintext, &mut OsRng)
    }

    /// Encrypt a message, drawing ratchet keys and nonces from `rng`
    ///
    /// The ratchet is left untouched if encryption fails, including when the
    /// randomness source does.
    pub fn encrypt_with_rng<R: RngCore + CryptoRng>(
        &mut self,
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>> {
        let mut staged = self.clone();
        let message = staged.encrypt_staged(plaintext, rng)?;
        *self = staged;
        Ok(message)
    }

    /// Decrypt a message from the peer
    ///
    /// The ratchet is left untouched if decryption fails.
    pub fn decrypt(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let mut staged = self.clone();
        let plaintext = staged.decrypt_staged(message)?;
        *self = staged;
        Ok(plaintext)
    }

    fn encrypt_staged<R: RngCore + CryptoRng>(
        &mut self,
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>> {
        let remote = self.remote_dh_public.ok_or_else(|| RatchetError::InvalidState {
            state: "key exchange not completed".to_string(),
        })?;

        if self.ratchet_pending {
            let new_private = random_secret(rng).map_err(|e| RatchetError::Encryption {
                reason: format!("randomness source failed: {e}"),
            })?;
            let (root_key, chain_key) =
                kdf_rk(&self.root_key, &new_private, &PublicKey::from(remote))?;
            self.root_key = root_key;
            self.sending_chain_key = Some(chain_key);
            self.previous_sending_chain_length = self.sending_message_number;
            self.sending_message_number = 0;
            self.dh_private = Some(new_private);
            self.ratchet_pending = false;
        }

        let (Some(chain_key), Some(dh_private)) = (self.sending_chain_key, &self.dh_private) else {
            return Err(RatchetError::InvalidState {
                state: "no sending chain available".to_string(),
            }
            .into());
        };

        let (next_chain_key, message_key) = kdf_ck(&chain_key)?;
        let mut message = RatchetMessage {
            dh_public: PublicKey::from(dh_private).to_bytes(),
            previous_chain_length: self.previous_sending_chain_length,
            message_number: self.sending_message_number,
            ciphertext: Vec::new(),
        };
        message.ciphertext = seal(&message_key, &message.associated_data(), plaintext, rng)?;

        self.sending_chain_key = Some(next_chain_key);
        self.sending_message_number += 1;

        wire::encode("ratchet message", &message)
    }

    fn decrypt_staged(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        if !self.is_established() {
            return Err(RatchetError::InvalidState {
                state: "key exchange not completed".to_string(),
            }
            .into());
        }

        let message: RatchetMessage = wire::decode("ratchet message", bytes)?;
        let ad = message.associated_data();

        if let Some(message_key) = self
            .skipped_message_keys
            .remove(&(message.dh_public, message.message_number))
        {
            return open(&message_key, &ad, &message.ciphertext);
        }

        if self.remote_dh_public != Some(message.dh_public) {
            self.skip_message_keys(message.previous_chain_length)?;
            self.dh_ratchet_receive(message.dh_public)?;
        }

        if message.message_number < self.receiving_message_number {
            return Err(RatchetError::Decryption {
                reason: "duplicate or expired message".to_string(),
            }
            .into());
        }
        self.skip_message_keys(message.message_number)?;

        let chain_key = self.receiving_chain_key.ok_or_else(|| RatchetError::InvalidState {
            state: "no receiving chain available".to_string(),
        })?;
        let (next_chain_key, message_key) = kdf_ck(&chain_key)?;
        let plaintext = open(&message_key, &ad, &message.ciphertext)?;

        self.receiving_chain_key = Some(next_chain_key);
        self.receiving_message_number = message.message_number + 1;
        Ok(plaintext)
    }

    /// Take the receiving DH ratchet step for a new remote public key
    fn dh_ratchet_receive(&mut self, remote_dh_public: [u8; 32]) -> Result<()> {
        let dh_private = self.dh_private.as_ref().ok_or_else(|| RatchetError::InvalidState {
            state: "no DH key pair".to_string(),
        })?;
        let (root_key, chain_key) =
            kdf_rk(&self.root_key, dh_private, &PublicKey::from(remote_dh_public))?;

        self.root_key = root_key;
        self.receiving_chain_key = Some(chain_key);
        self.remote_dh_public = Some(remote_dh_public);
        self.receiving_message_number = 0;
        self.ratchet_pending = true;
        Ok(())
    }

    /// Store message keys of the current receiving chain up to `until`
    fn skip_message_keys(&mut self, until: u32) -> Result<()> {
        let (Some(mut chain_key), Some(remote)) = (self.receiving_chain_key, self.remote_dh_public)
        else {
            return Ok(());
        };
        if until <= self.receiving_message_number {
            return Ok(());
        }

        let skip = until - self.receiving_message_number;
        if skip > MAX_SKIP
            || self.skipped_message_keys.len() + skip as usize > MAX_STORED_SKIPPED_KEYS
        {
            return Err(RatchetError::MessageOrdering {
                expected: self.receiving_message_number,
                actual: until,
            }
            .into());
        }

        for n in self.receiving_message_number..until {
            let (next_chain_key, message_key) = kdf_ck(&chain_key)?;
            self.skipped_message_keys.insert((remote, n), message_key);
            chain_key = next_chain_key;
        }
        self.receiving_chain_key = Some(chain_key);
        self.receiving_message_number = until;
        Ok(())
    }

    /// Get ratchet statistics
    pub fn stats(&self) -> RatchetStats {
        RatchetStats {
            messages_sent: self.sending_message_number,
            messages_received: self.receiving_message_number,
            skipped_keys_count: self.skipped_message_keys.len(),
        }
    }

    /// Serialize the complete ratchet state
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut skipped: Vec<_> = self
            .skipped_message_keys
            .iter()
            .map(|((dh, n), key)| (*dh, *n, *key))
            .collect();
        skipped.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let serialized = SerializedRatchet {
            identity_secret: self.identity.secret_key_bytes(),
            kx_private0: self.kx_private0.as_ref().map(StaticSecret::to_bytes),
            kx_private1: self.kx_private1.as_ref().map(StaticSecret::to_bytes),
            their_identity: self.their_identity,
            root_key: self.root_key,
            sending_chain_key: self.sending_chain_key,
            receiving_chain_key: self.receiving_chain_key,
            dh_private: self.dh_private.as_ref().map(StaticSecret::to_bytes),
            remote_dh_public: self.remote_dh_public,
            sending_message_number: self.sending_message_number,
            receiving_message_number: self.receiving_message_number,
            previous_sending_chain_length: self.previous_sending_chain_length,
            ratchet_pending: self.ratchet_pending,
            skipped_message_keys: skipped,
        };

        let body = wire::encode("ratchet", &serialized)?;
        let mut blob = Vec::with_capacity(RATCHET_MAGIC.len() + 1 + body.len());
        blob.extend_from_slice(RATCHET_MAGIC);
        blob.push(RATCHET_FORMAT_VERSION);
        blob.extend_from_slice(&body);
        Ok(blob)
    }

    /// Restore a ratchet from [`Ratchet::marshal`] output
    ///
    /// # Errors
    ///
    /// Returns `RatchetError::Restore` for foreign, corrupt, truncated or
    /// internally inconsistent state
    pub fn unmarshal(blob: &[u8]) -> Result<Self> {
        let restore_error = |reason: String| RatchetError::Restore { reason };

        let header_len = RATCHET_MAGIC.len() + 1;
        if blob.len() < header_len || &blob[..RATCHET_MAGIC.len()] != RATCHET_MAGIC {
            return Err(restore_error("not a serialized ratchet".to_string()).into());
        }
        if blob[RATCHET_MAGIC.len()] != RATCHET_FORMAT_VERSION {
            return Err(restore_error(format!(
                "unsupported ratchet format version {}",
                blob[RATCHET_MAGIC.len()]
            ))
            .into());
        }

        let s: SerializedRatchet =
            wire::decode("ratchet", &blob[header_len..]).map_err(|e| restore_error(e.to_string()))?;

        let pending = s.kx_private0.is_some()
            && s.kx_private1.is_some()
            && s.dh_private.is_none()
            && s.remote_dh_public.is_none()
            && s.sending_chain_key.is_none()
            && s.receiving_chain_key.is_none();
        let established = s.kx_private0.is_none()
            && s.kx_private1.is_none()
            && s.dh_private.is_some()
            && s.remote_dh_public.is_some()
            && s.their_identity.is_some()
            && (s.sending_chain_key.is_some() || s.receiving_chain_key.is_some());
        if !(pending || established) {
            return Err(restore_error("inconsistent ratchet state".to_string()).into());
        }
        if s.skipped_message_keys.len() > MAX_STORED_SKIPPED_KEYS {
            return Err(restore_error("too many skipped message keys".to_string()).into());
        }

        Ok(Self {
            identity: IdentityKeyPair::from_secret_bytes(s.identity_secret),
            kx_private0: s.kx_private0.map(StaticSecret::from),
            kx_private1: s.kx_private1.map(StaticSecret::from),
            their_identity: s.their_identity,
            root_key: s.root_key,
            sending_chain_key: s.sending_chain_key,
            receiving_chain_key: s.receiving_chain_key,
            dh_private: s.dh_private.map(StaticSecret::from),
            remote_dh_public: s.remote_dh_public,
            sending_message_number: s.sending_message_number,
            receiving_message_number: s.receiving_message_number,
            previous_sending_chain_length: s.previous_sending_chain_length,
            ratchet_pending: s.ratchet_pending,
            skipped_message_keys: s
                .skipped_message_keys
                .into_iter()
                .map(|(dh, n, key)| ((dh, n), key))
                .collect(),
        })
    }
}

fn init_failure(e: rand_core::Error) -> RatchetError {
    RatchetError::Init {
        reason: format!("randomness source failed: {e}"),
    }
}

fn random_secret<R: RngCore + CryptoRng>(
    rng: &mut R,
) -> std::result::Result<StaticSecret, rand_core::Error> {
    let mut bytes = [0u8; KEY_SIZE];
    rng.try_fill_bytes(&mut bytes)?;
    Ok(StaticSecret::from(bytes))
}

fn split_keys(okm: &[u8; KEY_SIZE * 2]) -> (Key, Key) {
    let mut first = [0u8; KEY_SIZE];
    let mut second = [0u8; KEY_SIZE];
    first.copy_from_slice(&okm[..KEY_SIZE]);
    second.copy_from_slice(&okm[KEY_SIZE..]);
    (first, second)
}

/// Root key and chain key derivation from DH output
fn kdf_rk(root_key: &Key, dh_private: &StaticSecret, dh_public: &PublicKey) -> Result<(Key, Key)> {
    let dh_output = dh_private.diffie_hellman(dh_public);
    let mut okm = [0u8; KEY_SIZE * 2];
    Hkdf::<Sha256>::new(Some(root_key.as_slice()), dh_output.as_bytes())
        .expand(ROOT_KEY_INFO, &mut okm)
        .map_err(|_| RatchetError::KeyDerivation {
            reason: "root and chain key derivation failed".to_string(),
        })?;
    Ok(split_keys(&okm))
}

/// Chain key derivation, returns (next chain key, message key)
fn kdf_ck(chain_key: &Key) -> Result<(Key, Key)> {
    let mut okm = [0u8; KEY_SIZE * 2];
    Hkdf::<Sha256>::new(None, chain_key)
        .expand(CHAIN_KEY_INFO, &mut okm)
        .map_err(|_| RatchetError::KeyDerivation {
            reason: "chain key derivation failed".to_string(),
        })?;
    Ok(split_keys(&okm))
}

fn seal<R: RngCore + CryptoRng>(
    message_key: &Key,
    ad: &[u8],
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(message_key.into());
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rng.try_fill_bytes(&mut nonce_bytes)
        .map_err(|e| RatchetError::Encryption {
            reason: format!("randomness source failed: {e}"),
        })?;
    let nonce = Nonce::from(nonce_bytes);

    let mut ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad: ad })
        .map_err(|_| RatchetError::Encryption {
            reason: "message encryption failed".to_string(),
        })?;

    let mut result = nonce.to_vec();
    result.append(&mut ciphertext);
    Ok(result)
}

fn open(message_key: &Key, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < NONCE_SIZE {
        return Err(RatchetError::Decryption {
            reason: "ciphertext too short".to_string(),
        }
        .into());
    }

    let cipher = ChaCha20Poly1305::new(message_key.into());
    let nonce = Nonce::from_slice(&ciphertext[..NONCE_SIZE]);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &ciphertext[NONCE_SIZE..],
                aad: ad,
            },
        )
        .map_err(|_| {
            RatchetError::Decryption {
                reason: "message authentication failed".to_string(),
            }
            .into()
        })
}
