//! Spool (mailbox) capabilities.
//!
//! A spool reader can mint a [`SpoolWriterRef`] that lets a peer enqueue
//! messages for it. The reference is opaque to this crate: it is carried in
//! envelopes and contact records byte for byte and never interpreted.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a spool identifier minted by [`MemorySpool`]
pub const SPOOL_ID_SIZE: usize = 12;

/// Reference granting write access to someone's spool
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpoolWriterRef {
    #[serde(with = "serde_bytes")]
    spool_id: Vec<u8>,
    receiver: String,
    provider: String,
}

impl SpoolWriterRef {
    /// Create a writer reference
    pub fn new(spool_id: Vec<u8>, receiver: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            spool_id,
            receiver: receiver.into(),
            provider: provider.into(),
        }
    }

    /// Spool identifier on the provider
    pub fn spool_id(&self) -> &[u8] {
        &self.spool_id
    }

    /// Service name of the spool on the provider
    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    /// Provider hosting the spool
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// A reference without a spool id or provider addresses nothing
    pub fn is_empty(&self) -> bool {
        self.spool_id.is_empty() || self.provider.is_empty()
    }
}

impl fmt::Display for SpoolWriterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{}",
            hex::encode(&self.spool_id),
            self.receiver,
            self.provider
        )
    }
}

/// The spool this party reads from
pub trait SpoolReader: Send + Sync {
    /// Mint a reference a peer can use to write to this spool
    fn writer_ref(&self) -> SpoolWriterRef;
}

/// A locally minted spool, used by the CLI and in tests
#[derive(Debug, Clone)]
pub struct MemorySpool {
    writer: SpoolWriterRef,
}

impl MemorySpool {
    /// Create a spool with a random identifier on `provider`
    pub fn new(provider: impl Into<String>) -> Self {
        let mut spool_id = vec![0u8; SPOOL_ID_SIZE];
        OsRng.fill_bytes(&mut spool_id);
        Self {
            writer: SpoolWriterRef::new(spool_id, "spool", provider),
        }
    }
}

impl SpoolReader for MemorySpool {
    fn writer_ref(&self) -> SpoolWriterRef {
        self.writer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_spools_are_distinct() {
        let a = MemorySpool::new("provider-a");
        let b = MemorySpool::new("provider-a");
        assert_ne!(a.writer_ref(), b.writer_ref());
        assert_eq!(a.writer_ref(), a.writer_ref());
        assert!(!a.writer_ref().is_empty());
    }

    #[test]
    fn test_empty_reference() {
        assert!(SpoolWriterRef::new(Vec::new(), "spool", "provider").is_empty());
        assert!(SpoolWriterRef::new(vec![1], "spool", "").is_empty());
    }

    #[test]
    fn test_display() {
        let writer = SpoolWriterRef::new(vec![0xab, 0xcd], "spool", "provider");
        assert_eq!(writer.to_string(), "abcd@spool/provider");
    }
}
