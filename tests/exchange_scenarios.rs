//! End-to-end contact scenarios across both parties

use mixnet_contacts::contact::{self, ContactBook};
use mixnet_contacts::panda::{self, PandaOutcome};
use mixnet_contacts::transport::{MemoryRendezvous, MemorySpool, Rendezvous};
use mixnet_contacts::utils::{ContactError, PandaConfig, RatchetError};
use mixnet_contacts::{Contact, ContactStatus, ContactsError};
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::Duration;

fn fast_panda(max_attempts: u32) -> PandaConfig {
    PandaConfig {
        poll_interval_ms: 10,
        max_attempts,
    }
}

#[test]
fn alice_and_bob_exchange_directly() {
    let alice_spool = MemorySpool::new("provider-a");
    let bob_spool = MemorySpool::new("provider-b");

    // Alice's record of Bob, and Bob's record of Alice
    let mut a = Contact::new("bob", 1, &alice_spool, &mut OsRng).unwrap();
    let mut b = Contact::new("alice", 1, &bob_spool, &mut OsRng).unwrap();

    a.complete_exchange(b.outgoing_exchange()).unwrap();
    b.complete_exchange(a.outgoing_exchange()).unwrap();
    assert_eq!(a.status(), ContactStatus::Established);
    assert_eq!(b.status(), ContactStatus::Established);

    let ciphertext = a.encrypt(b"hello bob").unwrap();
    assert_eq!(b.decrypt(&ciphertext).unwrap(), b"hello bob");

    let reply = b.encrypt(b"hello alice").unwrap();
    assert_eq!(a.decrypt(&reply).unwrap(), b"hello alice");
}

#[test]
fn established_contact_survives_persistence() {
    let mut a = Contact::new("bob", 4, &MemorySpool::new("pa"), &mut OsRng).unwrap();
    let mut b = Contact::new("alice", 9, &MemorySpool::new("pb"), &mut OsRng).unwrap();
    a.complete_exchange(b.outgoing_exchange()).unwrap();
    b.complete_exchange(a.outgoing_exchange()).unwrap();

    let mut restored = contact::unmarshal(&contact::marshal(&a).unwrap()).unwrap();
    assert_eq!(restored.id(), a.id());
    assert_eq!(restored.nickname(), a.nickname());
    assert_eq!(restored.status(), a.status());
    assert_eq!(restored.outgoing_exchange(), a.outgoing_exchange());
    assert_eq!(restored.send_channel(), a.send_channel());

    let ciphertext = restored.encrypt(b"after restart").unwrap();
    assert_eq!(b.decrypt(&ciphertext).unwrap(), b"after restart");
}

#[test]
fn truncated_record_is_rejected() {
    let a = Contact::new("bob", 1, &MemorySpool::new("p"), &mut OsRng).unwrap();
    let bytes = contact::marshal(&a).unwrap();
    assert!(contact::unmarshal(&bytes[..bytes.len() - 1]).is_err());
    assert!(contact::unmarshal(&[]).is_err());
}

#[test]
fn exchange_is_consumed_once() {
    let mut a = Contact::new("bob", 1, &MemorySpool::new("p"), &mut OsRng).unwrap();
    let b = Contact::new("alice", 1, &MemorySpool::new("p"), &mut OsRng).unwrap();

    a.complete_exchange(b.outgoing_exchange()).unwrap();
    let ratchet_before = a.ratchet().marshal().unwrap();

    let err = a.complete_exchange(b.outgoing_exchange()).unwrap_err();
    assert!(matches!(
        err,
        ContactsError::Ratchet(RatchetError::ReplayOrStale { .. })
    ));
    assert_eq!(a.status(), ContactStatus::Established);
    assert_eq!(a.ratchet().marshal().unwrap(), ratchet_before);

    let stranger = Contact::new("carol", 2, &MemorySpool::new("p"), &mut OsRng).unwrap();
    let err = a.complete_exchange(stranger.outgoing_exchange()).unwrap_err();
    assert!(matches!(
        err,
        ContactsError::Contact(ContactError::AlreadyEstablished { .. })
    ));
}

#[tokio::test]
async fn panda_with_matching_secrets_establishes() {
    let rendezvous: Arc<dyn Rendezvous> = Arc::new(MemoryRendezvous::new());
    let a = Contact::new("bob", 1, &MemorySpool::new("pa"), &mut OsRng).unwrap().into_shared();
    let b = Contact::new("alice", 1, &MemorySpool::new("pb"), &mut OsRng).unwrap().into_shared();

    let ha = panda::start_exchange(a.clone(), b"purple elephant", rendezvous.clone(), &fast_panda(100))
        .await
        .unwrap();
    let hb = panda::start_exchange(b.clone(), b"purple elephant", rendezvous, &fast_panda(100))
        .await
        .unwrap();

    assert_eq!(ha.await.unwrap(), PandaOutcome::Established);
    assert_eq!(hb.await.unwrap(), PandaOutcome::Established);

    let ciphertext = a.write().await.encrypt(b"met through panda").unwrap();
    assert_eq!(b.write().await.decrypt(&ciphertext).unwrap(), b"met through panda");
}

#[tokio::test]
async fn panda_with_mismatched_secrets_fails_on_both_sides() {
    let rendezvous: Arc<dyn Rendezvous> = Arc::new(MemoryRendezvous::new());
    let a = Contact::new("bob", 1, &MemorySpool::new("pa"), &mut OsRng).unwrap().into_shared();
    let b = Contact::new("alice", 1, &MemorySpool::new("pb"), &mut OsRng).unwrap().into_shared();

    let ha = panda::start_exchange(a.clone(), b"apple", rendezvous.clone(), &fast_panda(4))
        .await
        .unwrap();
    let hb = panda::start_exchange(b.clone(), b"orange", rendezvous, &fast_panda(4))
        .await
        .unwrap();
    ha.await.unwrap();
    hb.await.unwrap();

    for side in [a, b] {
        let side = side.read().await;
        assert_eq!(side.status(), ContactStatus::Pending);
        assert!(side.panda_result().is_some_and(|r| !r.is_empty()));
    }
}

#[tokio::test]
async fn cancelled_panda_changes_nothing() {
    let rendezvous: Arc<dyn Rendezvous> = Arc::new(MemoryRendezvous::new());
    let a = Contact::new("bob", 1, &MemorySpool::new("pa"), &mut OsRng).unwrap().into_shared();
    let slow = PandaConfig {
        poll_interval_ms: 60_000,
        max_attempts: 10,
    };

    let handle = panda::start_exchange(a.clone(), b"secret", rendezvous, &slow).await.unwrap();
    let before = contact::marshal(&*a.read().await).unwrap();
    a.read().await.cancel_panda();

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, PandaOutcome::Cancelled);
    assert_eq!(contact::marshal(&*a.read().await).unwrap(), before);
}

#[tokio::test]
async fn book_survives_restart_mid_exchange() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contacts.bin");

    let mut alice_book = ContactBook::new();
    let bob_record = alice_book.add_contact("bob", &MemorySpool::new("pa"), &mut OsRng).unwrap();
    let alice_envelope = bob_record.read().await.outgoing_exchange().to_vec();
    alice_book.save(&path).await.unwrap();

    let mut bob = Contact::new("alice", 1, &MemorySpool::new("pb"), &mut OsRng).unwrap();
    bob.complete_exchange(&alice_envelope).unwrap();

    let reloaded = ContactBook::load(&path).await.unwrap();
    let bob_record = reloaded.get_by_nickname("bob").unwrap();
    bob_record.write().await.complete_exchange(bob.outgoing_exchange()).unwrap();

    let ciphertext = bob.encrypt(b"hi alice").unwrap();
    assert_eq!(bob_record.write().await.decrypt(&ciphertext).unwrap(), b"hi alice");

    let err = reloaded.require("carol").unwrap_err();
    assert!(matches!(err, ContactsError::Contact(ContactError::NotFound { .. })));
}
