//! Persistence codec for contact records.

use super::envelope;
use super::record::{validate_nickname, Contact, ContactStatus};
use crate::panda::PandaShutdown;
use crate::session::Ratchet;
use crate::transport::SpoolWriterRef;
use crate::utils::{wire, CodecError, Result};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct SerializedContact {
    id: u64,
    nickname: String,
    status: ContactStatus,
    #[serde(with = "serde_bytes")]
    outgoing_exchange: Vec<u8>,
    #[serde(with = "serde_bytes")]
    panda_exchange: Option<Vec<u8>>,
    panda_result: Option<String>,
    #[serde(with = "serde_bytes")]
    ratchet: Vec<u8>,
    send_channel: Option<SpoolWriterRef>,
}

/// Serialize a contact, ratchet included
///
/// The cancellation handle of a running PANDA exchange is not persisted.
pub fn marshal(contact: &Contact) -> Result<Vec<u8>> {
    let serialized = SerializedContact {
        id: contact.id,
        nickname: contact.nickname.clone(),
        status: contact.status,
        outgoing_exchange: contact.outgoing_exchange.clone(),
        panda_exchange: contact.panda_exchange.clone(),
        panda_result: contact.panda_result.clone(),
        ratchet: contact.ratchet.marshal()?,
        send_channel: contact.send_channel.clone(),
    };
    wire::encode("contact", &serialized)
}

/// Rebuild a contact from [`marshal`] output
///
/// # Errors
///
/// * `CodecError::Decoding` for truncated, malformed or inconsistent records
/// * `RatchetError::Restore` if the embedded ratchet cannot be restored
pub fn unmarshal(bytes: &[u8]) -> Result<Contact> {
    let s: SerializedContact = wire::decode("contact", bytes)?;

    validate_nickname(&s.nickname)
        .map_err(|e| CodecError::decoding("contact", e))?;
    envelope::parse(&s.outgoing_exchange)
        .map_err(|e| CodecError::decoding("contact", format!("outgoing exchange: {e}")))?;

    let ratchet = Ratchet::unmarshal(&s.ratchet)?;

    let consistent = match s.status {
        ContactStatus::Pending => !ratchet.is_established() && s.send_channel.is_none(),
        ContactStatus::Established => ratchet.is_established() && s.send_channel.is_some(),
    };
    if !consistent {
        return Err(CodecError::decoding(
            "contact",
            format!("{} record with mismatched ratchet or channel", s.status),
        )
        .into());
    }

    Ok(Contact {
        id: s.id,
        nickname: s.nickname,
        status: s.status,
        outgoing_exchange: s.outgoing_exchange,
        panda_exchange: s.panda_exchange,
        panda_result: s.panda_result,
        ratchet,
        send_channel: s.send_channel,
        panda_shutdown: PandaShutdown::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemorySpool;
    use crate::utils::{ContactsError, RatchetError};
    use rand::rngs::OsRng;

    fn pair() -> (Contact, Contact) {
        let a = Contact::new("bob", 1, &MemorySpool::new("p1"), &mut OsRng).unwrap();
        let b = Contact::new("alice", 7, &MemorySpool::new("p2"), &mut OsRng).unwrap();
        (a, b)
    }

    #[test]
    fn test_pending_contact_round_trip() {
        let (mut a, _) = pair();
        a.set_panda_result("rendezvous timed out".to_string());

        let restored = unmarshal(&marshal(&a).unwrap()).unwrap();
        assert_eq!(restored.id(), 1);
        assert_eq!(restored.nickname(), "bob");
        assert!(restored.is_pending());
        assert_eq!(restored.outgoing_exchange(), a.outgoing_exchange());
        assert_eq!(restored.panda_result(), Some("rendezvous timed out"));
        assert_eq!(restored.ratchet().marshal().unwrap(), a.ratchet().marshal().unwrap());
    }

    #[test]
    fn test_restored_pending_contact_completes() {
        let (a, mut b) = pair();
        let mut restored = unmarshal(&marshal(&a).unwrap()).unwrap();

        restored.complete_exchange(b.outgoing_exchange()).unwrap();
        b.complete_exchange(a.outgoing_exchange()).unwrap();

        let ciphertext = b.encrypt(b"after restart").unwrap();
        assert_eq!(restored.decrypt(&ciphertext).unwrap(), b"after restart");
    }

    #[test]
    fn test_established_contact_keeps_session() {
        let (mut a, mut b) = pair();
        a.complete_exchange(b.outgoing_exchange()).unwrap();
        b.complete_exchange(a.outgoing_exchange()).unwrap();
        let first = a.encrypt(b"one").unwrap();
        b.decrypt(&first).unwrap();

        let mut restored = unmarshal(&marshal(&b).unwrap()).unwrap();
        assert_eq!(restored.status(), ContactStatus::Established);
        assert_eq!(restored.send_channel(), b.send_channel());

        let reply = restored.encrypt(b"two").unwrap();
        assert_eq!(a.decrypt(&reply).unwrap(), b"two");
    }

    #[test]
    fn test_truncated_records_rejected() {
        let (a, _) = pair();
        let bytes = marshal(&a).unwrap();
        for len in [0, 1, 8, bytes.len() / 2, bytes.len() - 1] {
            assert!(unmarshal(&bytes[..len]).is_err(), "prefix of {len} bytes accepted");
        }
    }

    #[test]
    fn test_corrupt_ratchet_blob_is_restore_error() {
        let (a, _) = pair();
        let mut serialized: SerializedContact = wire::decode("contact", &marshal(&a).unwrap()).unwrap();
        serialized.ratchet.truncate(10);
        let bytes = wire::encode("contact", &serialized).unwrap();

        let err = unmarshal(&bytes).unwrap_err();
        assert!(matches!(err, ContactsError::Ratchet(RatchetError::Restore { .. })));
    }

    #[test]
    fn test_inconsistent_status_rejected() {
        let (a, _) = pair();
        let mut serialized: SerializedContact = wire::decode("contact", &marshal(&a).unwrap()).unwrap();
        serialized.status = ContactStatus::Established;
        let bytes = wire::encode("contact", &serialized).unwrap();

        let err = unmarshal(&bytes).unwrap_err();
        assert!(matches!(err, ContactsError::Codec(CodecError::Decoding { .. })));
    }

    #[test]
    fn test_missing_outgoing_exchange_rejected() {
        let (a, _) = pair();
        let mut serialized: SerializedContact = wire::decode("contact", &marshal(&a).unwrap()).unwrap();
        serialized.outgoing_exchange.clear();
        let bytes = wire::encode("contact", &serialized).unwrap();

        assert!(unmarshal(&bytes).is_err());
    }
}
