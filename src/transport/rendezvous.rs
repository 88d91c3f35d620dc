//! Rendezvous service used by the PANDA exchange.
//!
//! The service is an untrusted store of opaque payloads indexed by a 32-byte
//! tag. Both parties post under the same tag and poll for what the other
//! posted; authenticity is established by the payloads, not the service.

use crate::utils::{PandaError, Result};
use futures::future::{BoxFuture, FutureExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Rendezvous tag
pub type RendezvousTag = [u8; 32];

/// Maximum number of payloads kept under one tag
pub const MAX_PAYLOADS_PER_TAG: usize = 8;

/// An asynchronous rendezvous service
pub trait Rendezvous: Send + Sync {
    /// Store `payload` under `tag`
    fn post<'a>(&'a self, tag: &'a RendezvousTag, payload: Vec<u8>) -> BoxFuture<'a, Result<()>>;

    /// Fetch every payload currently stored under `tag`
    fn poll<'a>(&'a self, tag: &'a RendezvousTag) -> BoxFuture<'a, Result<Vec<Vec<u8>>>>;
}

/// In-process rendezvous service
#[derive(Debug, Clone, Default)]
pub struct MemoryRendezvous {
    slots: Arc<Mutex<HashMap<RendezvousTag, Vec<Vec<u8>>>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryRendezvous {
    /// Create an empty rendezvous service
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request fail until set back to `false`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PandaError::Rendezvous {
                reason: "rendezvous service unreachable".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl Rendezvous for MemoryRendezvous {
    fn post<'a>(&'a self, tag: &'a RendezvousTag, payload: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        async move {
            self.check_online()?;
            let mut slots = self.slots.lock().await;
            let slot = slots.entry(*tag).or_default();
            if slot.contains(&payload) {
                return Ok(());
            }
            if slot.len() >= MAX_PAYLOADS_PER_TAG {
                return Err(PandaError::Rendezvous {
                    reason: "rendezvous slot is full".to_string(),
                }
                .into());
            }
            slot.push(payload);
            Ok(())
        }
        .boxed()
    }

    fn poll<'a>(&'a self, tag: &'a RendezvousTag) -> BoxFuture<'a, Result<Vec<Vec<u8>>>> {
        async move {
            self.check_online()?;
            let slots = self.slots.lock().await;
            Ok(slots.get(tag).cloned().unwrap_or_default())
        }
        .boxed()
    }
}

/// Rendezvous service backed by a directory shared between processes
///
/// Each tag is a subdirectory; each payload a file named after its hash.
#[derive(Debug, Clone)]
pub struct DirectoryRendezvous {
    root: PathBuf,
}

impl DirectoryRendezvous {
    /// Use `root` as the shared directory; it is created on first post
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The shared directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn slot_dir(&self, tag: &RendezvousTag) -> PathBuf {
        self.root.join(hex::encode(tag))
    }
}

fn io_error(err: std::io::Error) -> crate::utils::ContactsError {
    PandaError::Rendezvous {
        reason: err.to_string(),
    }
    .into()
}

impl Rendezvous for DirectoryRendezvous {
    fn post<'a>(&'a self, tag: &'a RendezvousTag, payload: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        async move {
            let dir = self.slot_dir(tag);
            tokio::fs::create_dir_all(&dir).await.map_err(io_error)?;

            let name = hex::encode(&Sha256::digest(&payload)[..16]);
            let path = dir.join(format!("{name}.bin"));
            if tokio::fs::try_exists(&path).await.map_err(io_error)? {
                return Ok(());
            }

            let mut stored = 0usize;
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(io_error)?;
            while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
                if entry.path().extension().is_some_and(|ext| ext == "bin") {
                    stored += 1;
                }
            }
            if stored >= MAX_PAYLOADS_PER_TAG {
                return Err(PandaError::Rendezvous {
                    reason: "rendezvous slot is full".to_string(),
                }
                .into());
            }

            let tmp = dir.join(format!("{name}.tmp"));
            tokio::fs::write(&tmp, &payload).await.map_err(io_error)?;
            tokio::fs::rename(&tmp, &path).await.map_err(io_error)?;
            log::debug!("Posted {} bytes to {}", payload.len(), dir.display());
            Ok(())
        }
        .boxed()
    }

    fn poll<'a>(&'a self, tag: &'a RendezvousTag) -> BoxFuture<'a, Result<Vec<Vec<u8>>>> {
        async move {
            let dir = self.slot_dir(tag);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(io_error(e)),
            };

            let mut paths = Vec::new();
            while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "bin") {
                    paths.push(path);
                }
            }
            paths.sort();

            let mut payloads = Vec::with_capacity(paths.len());
            for path in paths {
                payloads.push(tokio::fs::read(&path).await.map_err(io_error)?);
            }
            Ok(payloads)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_and_poll() {
        let rendezvous = MemoryRendezvous::new();
        let tag = [7u8; 32];

        assert!(rendezvous.poll(&tag).await.unwrap().is_empty());
        rendezvous.post(&tag, b"one".to_vec()).await.unwrap();
        rendezvous.post(&tag, b"one".to_vec()).await.unwrap();
        rendezvous.post(&tag, b"two".to_vec()).await.unwrap();

        let payloads = rendezvous.poll(&tag).await.unwrap();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(rendezvous.poll(&[8u8; 32]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_service_errors() {
        let rendezvous = MemoryRendezvous::new();
        rendezvous.set_offline(true);
        assert!(rendezvous.poll(&[0u8; 32]).await.is_err());
        assert!(rendezvous.post(&[0u8; 32], vec![1]).await.is_err());

        rendezvous.set_offline(false);
        assert!(rendezvous.poll(&[0u8; 32]).await.is_ok());
    }

    #[tokio::test]
    async fn test_slot_capacity() {
        let rendezvous = MemoryRendezvous::new();
        let tag = [1u8; 32];
        for i in 0..MAX_PAYLOADS_PER_TAG {
            rendezvous.post(&tag, vec![i as u8]).await.unwrap();
        }
        assert!(rendezvous.post(&tag, vec![0xff]).await.is_err());
    }

    #[tokio::test]
    async fn test_directory_rendezvous_is_shared() {
        let dir = tempfile::tempdir().unwrap();
        let alice = DirectoryRendezvous::new(dir.path().join("meet"));
        let bob = DirectoryRendezvous::new(dir.path().join("meet"));
        let tag = [3u8; 32];

        assert!(bob.poll(&tag).await.unwrap().is_empty());
        alice.post(&tag, b"from alice".to_vec()).await.unwrap();
        alice.post(&tag, b"from alice".to_vec()).await.unwrap();
        bob.post(&tag, b"from bob".to_vec()).await.unwrap();

        let mut seen = alice.poll(&tag).await.unwrap();
        seen.sort();
        assert_eq!(seen, vec![b"from alice".to_vec(), b"from bob".to_vec()]);
    }

    #[tokio::test]
    async fn test_directory_slot_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let rendezvous = DirectoryRendezvous::new(dir.path());
        let tag = [4u8; 32];
        for i in 0..MAX_PAYLOADS_PER_TAG {
            rendezvous.post(&tag, vec![i as u8]).await.unwrap();
        }
        assert!(rendezvous.post(&tag, vec![0xff]).await.is_err());
    }
}
