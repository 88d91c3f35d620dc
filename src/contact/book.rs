//! The owning collection of contacts.
//!
//! The book allocates contact ids from a counter that only grows, so an id is
//! never reused even after its contact is removed, and it keeps nicknames
//! unique. The whole book persists to a single file.

use super::codec;
use super::record::{validate_nickname, Contact, SharedContact};
use crate::transport::SpoolReader;
use crate::utils::{wire, CodecError, ContactError, Result};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Serialize, Deserialize)]
struct SerializedBook {
    next_id: u64,
    contacts: Vec<serde_bytes::ByteBuf>,
}

/// Contacts keyed by id, with a nickname index
#[derive(Debug)]
pub struct ContactBook {
    next_id: u64,
    contacts: BTreeMap<u64, SharedContact>,
    nicknames: HashMap<String, u64>,
}

impl Default for ContactBook {
    fn default() -> Self {
        Self::new()
    }
}

impl ContactBook {
    /// Create an empty book
    pub fn new() -> Self {
        Self {
            next_id: 1,
            contacts: BTreeMap::new(),
            nicknames: HashMap::new(),
        }
    }

    /// Create a pending contact under a fresh id
    ///
    /// # Errors
    ///
    /// * `ContactError::DuplicateNickname` if the nickname is taken
    /// * `ContactError::InvalidNickname` for unusable nicknames
    /// * `ContactError::IdsExhausted` once every id has been handed out
    /// * ratchet initialization errors
    pub fn add_contact<R: RngCore + CryptoRng>(
        &mut self,
        nickname: &str,
        spool: &dyn SpoolReader,
        rng: &mut R,
    ) -> Result<SharedContact> {
        validate_nickname(nickname)?;
        if self.nicknames.contains_key(nickname) {
            return Err(ContactError::DuplicateNickname {
                nickname: nickname.to_string(),
            }
            .into());
        }

        let id = self.next_id;
        let next_id = id.checked_add(1).ok_or(ContactError::IdsExhausted)?;
        let contact = Contact::new(nickname, id, spool, rng)?.into_shared();
        self.next_id = next_id;
        self.contacts.insert(id, contact.clone());
        self.nicknames.insert(nickname.to_string(), id);
        Ok(contact)
    }

    /// Look up a contact by id
    pub fn get(&self, id: u64) -> Option<SharedContact> {
        self.contacts.get(&id).cloned()
    }

    /// Look up a contact by nickname
    pub fn get_by_nickname(&self, nickname: &str) -> Option<SharedContact> {
        self.nicknames.get(nickname).and_then(|id| self.get(*id))
    }

    /// Look up a contact by nickname, failing if absent
    pub fn require(&self, nickname: &str) -> Result<SharedContact> {
        self.get_by_nickname(nickname).ok_or_else(|| {
            ContactError::NotFound {
                key: nickname.to_string(),
            }
            .into()
        })
    }

    /// Change a contact's nickname
    pub async fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        validate_nickname(new)?;
        let contact = self.require(old)?;
        if old == new {
            return Ok(());
        }
        if self.nicknames.contains_key(new) {
            return Err(ContactError::DuplicateNickname {
                nickname: new.to_string(),
            }
            .into());
        }

        let id = {
            let mut guard = contact.write().await;
            guard.set_nickname(new.to_string());
            guard.id()
        };
        self.nicknames.remove(old);
        self.nicknames.insert(new.to_string(), id);
        log::info!("Renamed contact {} from {} to {}", id, old, new);
        Ok(())
    }

    /// Remove a contact, cancelling its PANDA exchange if one is running
    pub async fn remove(&mut self, nickname: &str) -> Result<SharedContact> {
        let contact = self.require(nickname)?;
        let id = {
            let guard = contact.read().await;
            guard.cancel_panda();
            guard.id()
        };
        self.contacts.remove(&id);
        self.nicknames.remove(nickname);
        log::info!("Removed contact {} ({})", id, nickname);
        Ok(contact)
    }

    /// Contacts in id order
    pub fn list(&self) -> impl Iterator<Item = &SharedContact> {
        self.contacts.values()
    }

    /// Sorted nicknames
    pub fn nicknames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nicknames.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of contacts
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// True if the book holds no contacts
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Id the next contact will receive
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Serialize the book and every contact in it
    pub async fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut contacts = Vec::with_capacity(self.contacts.len());
        for contact in self.contacts.values() {
            let guard = contact.read().await;
            contacts.push(serde_bytes::ByteBuf::from(codec::marshal(&guard)?));
        }
        wire::encode_bounded(
            "contact book",
            &SerializedBook {
                next_id: self.next_id,
                contacts,
            },
            crate::MAX_BOOK_SIZE,
        )
    }

    /// Rebuild a book from [`ContactBook::to_bytes`] output
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let serialized: SerializedBook =
            wire::decode_bounded("contact book", bytes, crate::MAX_BOOK_SIZE)?;
        if serialized.next_id == 0 {
            return Err(CodecError::decoding("contact book", "id counter is zero").into());
        }
        let mut book = Self {
            next_id: serialized.next_id,
            contacts: BTreeMap::new(),
            nicknames: HashMap::new(),
        };

        for record in serialized.contacts {
            let contact = codec::unmarshal(&record)?;
            let (id, nickname) = (contact.id(), contact.nickname().to_string());
            if id == 0 || id >= book.next_id {
                return Err(CodecError::decoding("contact book", format!("contact id {id} out of range")).into());
            }
            if book.contacts.contains_key(&id) || book.nicknames.contains_key(&nickname) {
                return Err(CodecError::decoding("contact book", format!("duplicate contact {id} ({nickname})")).into());
            }
            book.nicknames.insert(nickname, id);
            book.contacts.insert(id, contact.into_shared());
        }
        Ok(book)
    }

    /// Write the book to `path`, replacing it atomically
    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes().await?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        log::debug!("Saved {} contacts to {:?}", self.len(), path);
        Ok(())
    }

    /// Read a book from `path`, or start an empty one if it does not exist
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No contact book at {:?}, starting empty", path);
            return Ok(Self::new());
        }
        let bytes = tokio::fs::read(path).await?;
        let book = Self::from_bytes(&bytes)?;
        log::debug!("Loaded {} contacts from {:?}", book.len(), path);
        Ok(book)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemorySpool;
    use crate::utils::ContactsError;
    use rand::rngs::OsRng;
    use tempfile::tempdir;

    fn spool() -> MemorySpool {
        MemorySpool::new("provider")
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let mut book = ContactBook::new();
        let a = book.add_contact("alice", &spool(), &mut OsRng).unwrap();
        let b = book.add_contact("bob", &spool(), &mut OsRng).unwrap();
        assert_eq!(a.read().await.id(), 1);
        assert_eq!(b.read().await.id(), 2);

        book.remove("bob").await.unwrap();
        let c = book.add_contact("carol", &spool(), &mut OsRng).unwrap();
        assert_eq!(c.read().await.id(), 3);
        assert_eq!(book.len(), 2);
    }

    #[tokio::test]
    async fn test_nicknames_are_unique() {
        let mut book = ContactBook::new();
        book.add_contact("alice", &spool(), &mut OsRng).unwrap();
        book.add_contact("bob", &spool(), &mut OsRng).unwrap();

        let err = book.add_contact("alice", &spool(), &mut OsRng).unwrap_err();
        assert!(matches!(
            err,
            ContactsError::Contact(ContactError::DuplicateNickname { .. })
        ));
        assert!(book.rename("bob", "alice").await.is_err());
        assert_eq!(book.next_id(), 3);
    }

    #[tokio::test]
    async fn test_rename_updates_index() {
        let mut book = ContactBook::new();
        let contact = book.add_contact("alice", &spool(), &mut OsRng).unwrap();

        book.rename("alice", "alice2").await.unwrap();
        assert!(book.get_by_nickname("alice").is_none());
        assert!(book.get_by_nickname("alice2").is_some());
        assert_eq!(contact.read().await.nickname(), "alice2");
        assert_eq!(book.nicknames(), vec!["alice2".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_contact() {
        let mut book = ContactBook::new();
        let err = book.remove("nobody").await.unwrap_err();
        assert!(matches!(err, ContactsError::Contact(ContactError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("contacts.bin");

        let mut book = ContactBook::new();
        book.add_contact("alice", &spool(), &mut OsRng).unwrap();
        book.add_contact("bob", &spool(), &mut OsRng).unwrap();
        book.remove("alice").await.unwrap();
        book.save(&path).await.unwrap();

        let loaded = ContactBook::load(&path).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.next_id(), 3);
        let bob = loaded.get_by_nickname("bob").unwrap();
        assert_eq!(bob.read().await.id(), 2);
        assert!(loaded.get(2).is_some());
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let book = ContactBook::load(&dir.path().join("absent.bin")).await.unwrap();
        assert!(book.is_empty());
        assert_eq!(book.next_id(), 1);
    }

    /// Copies of one pending contact under distinct ids and nicknames
    fn bulk_book(count: u64) -> ContactBook {
        let template = Contact::new("template", 1, &spool(), &mut OsRng).unwrap();
        let mut book = ContactBook::new();
        for id in 1..=count {
            let nickname = format!("contact-{id:05}");
            let contact = Contact {
                id,
                nickname: nickname.clone(),
                status: template.status,
                outgoing_exchange: template.outgoing_exchange.clone(),
                panda_exchange: None,
                panda_result: None,
                ratchet: template.ratchet.clone(),
                send_channel: None,
                panda_shutdown: Default::default(),
            };
            book.contacts.insert(id, contact.into_shared());
            book.nicknames.insert(nickname, id);
        }
        book.next_id = count + 1;
        book
    }

    #[tokio::test]
    async fn test_book_larger_than_one_record() {
        let book = bulk_book(6000);
        let bytes = book.to_bytes().await.unwrap();
        assert!(bytes.len() as u64 > crate::MAX_RECORD_SIZE);

        let loaded = ContactBook::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.len(), 6000);
        assert_eq!(loaded.next_id(), 6001);
        let last = loaded.get_by_nickname("contact-06000").unwrap();
        assert_eq!(last.read().await.id(), 6000);
    }

    #[tokio::test]
    async fn test_id_counter_never_wraps() {
        let mut book = ContactBook::new();
        book.next_id = u64::MAX;
        let err = book.add_contact("alice", &spool(), &mut OsRng).unwrap_err();
        assert!(matches!(err, ContactsError::Contact(ContactError::IdsExhausted)));
        assert!(book.is_empty());
        assert_eq!(book.next_id(), u64::MAX);

        book.next_id = u64::MAX - 1;
        let last = book.add_contact("alice", &spool(), &mut OsRng).unwrap();
        assert_eq!(last.read().await.id(), u64::MAX - 1);
        assert!(book.add_contact("bob", &spool(), &mut OsRng).is_err());

        let reloaded = ContactBook::from_bytes(&book.to_bytes().await.unwrap()).unwrap();
        assert_eq!(reloaded.next_id(), u64::MAX);
    }

    #[test]
    fn test_zero_id_counter_rejected() {
        let bytes = wire::encode(
            "contact book",
            &SerializedBook {
                next_id: 0,
                contacts: Vec::new(),
            },
        )
        .unwrap();
        let err = ContactBook::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, ContactsError::Codec(CodecError::Decoding { .. })));
    }

    #[tokio::test]
    async fn test_truncated_book_rejected() {
        let mut book = ContactBook::new();
        book.add_contact("alice", &spool(), &mut OsRng).unwrap();
        let bytes = book.to_bytes().await.unwrap();

        assert!(ContactBook::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
