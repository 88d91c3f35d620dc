//! Exchange envelope codec.
//!
//! The envelope is what a party hands to a peer, out of band or through a
//! PANDA rendezvous, to start a ratchet session: the writer reference for its
//! own spool and its signed key exchange. Envelopes arriving from a peer are
//! untrusted input.

use crate::session::SignedKeyExchange;
use crate::transport::SpoolWriterRef;
use crate::utils::{wire, CodecError, Result};
use serde::{Deserialize, Serialize};

/// Writer reference plus signed key exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeEnvelope {
    spool_writer: SpoolWriterRef,
    signed_key_exchange: SignedKeyExchange,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    spool_writer: &'a SpoolWriterRef,
    signed_key_exchange: &'a SignedKeyExchange,
}

impl ExchangeEnvelope {
    /// Writer reference for the sender's spool
    pub fn spool_writer(&self) -> &SpoolWriterRef {
        &self.spool_writer
    }

    /// The sender's signed key exchange
    pub fn signed_key_exchange(&self) -> &SignedKeyExchange {
        &self.signed_key_exchange
    }

    /// Split into its parts
    pub fn into_parts(self) -> (SpoolWriterRef, SignedKeyExchange) {
        (self.spool_writer, self.signed_key_exchange)
    }
}

/// Encode an envelope in its canonical binary form
///
/// # Errors
///
/// Returns `CodecError::Encoding` if either part is empty or serialization fails
pub fn build(spool_writer: &SpoolWriterRef, signed_key_exchange: &SignedKeyExchange) -> Result<Vec<u8>> {
    if spool_writer.is_empty() {
        return Err(CodecError::encoding("envelope", "empty spool writer reference").into());
    }
    if signed_key_exchange.is_empty() {
        return Err(CodecError::encoding("envelope", "empty signed key exchange").into());
    }

    wire::encode(
        "envelope",
        &EnvelopeRef {
            spool_writer,
            signed_key_exchange,
        },
    )
}

/// Decode and validate an envelope
///
/// # Errors
///
/// Returns `CodecError::Decoding` for malformed, truncated or oversized input
/// and for envelopes with an empty part
pub fn parse(bytes: &[u8]) -> Result<ExchangeEnvelope> {
    let envelope: ExchangeEnvelope = wire::decode("envelope", bytes)?;

    if envelope.spool_writer.is_empty() {
        return Err(CodecError::decoding("envelope", "missing spool writer reference").into());
    }
    if envelope.signed_key_exchange.is_empty() {
        return Err(CodecError::decoding("envelope", "missing signed key exchange").into());
    }
    Ok(envelope)
}
