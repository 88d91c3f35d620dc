//! Ed25519 identity keys used to sign ratchet key exchanges.
//!
//! Every ratchet carries its own identity key pair. The public half travels
//! inside the signed key exchange so the peer can check that the exchange was
//! not altered on its way through an untrusted rendezvous point.

use crate::utils::{RatchetError, Result};
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand_core::{CryptoRng, RngCore};

/// Ed25519 key pair for signing key exchanges
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("signing_key", &"[REDACTED]")
            .field("verifying_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish()
    }
}

impl IdentityKeyPair {
    /// Generate a new identity key pair from the given randomness source
    ///
    /// # Errors
    ///
    /// Returns `RatchetError::Init` if the randomness source fails
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self> {
        let mut seed = [0u8; SECRET_KEY_LENGTH];
        rng.try_fill_bytes(&mut seed)
            .map_err(|e| RatchetError::Init {
                reason: format!("randomness source failed: {e}"),
            })?;
        Ok(Self::from_secret_bytes(seed))
    }

    /// Rebuild an identity key pair from its secret bytes
    pub fn from_secret_bytes(secret_bytes: [u8; SECRET_KEY_LENGTH]) -> Self {
        let signing_key = SigningKey::from_bytes(&secret_bytes);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Get the public key as bytes
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Get the secret key as bytes
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Sign a message with this identity
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Verify `signature` over `message` against a raw Ed25519 public key
///
/// # Errors
///
/// Returns `RatchetError::SignatureVerification` for a malformed key, a
/// malformed signature or a signature that does not verify
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let public_key: &[u8; PUBLIC_KEY_LENGTH] = public_key
        .try_into()
        .map_err(|_| RatchetError::SignatureVerification)?;
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| RatchetError::SignatureVerification)?;

    let signature: &[u8; SIGNATURE_LENGTH] = signature
        .try_into()
        .map_err(|_| RatchetError::SignatureVerification)?;
    let sig = Signature::from_bytes(signature);

    verifying_key
        .verify(message, &sig)
        .map_err(|_| RatchetError::SignatureVerification.into())
}
