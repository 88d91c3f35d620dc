//! Background task driving a PANDA exchange for one contact.
//!
//! The task posts our sealed envelope under the shared tag, then polls until
//! the peer's posting shows up, the attempt budget runs out, or the contact's
//! cancellation signal fires. Cancellation is observed at every await point
//! and leaves the contact untouched.

use super::exchange::{PandaExchange, PandaStatus};
use crate::contact::{envelope, Contact, ContactStatus, SharedContact};
use crate::transport::Rendezvous;
use crate::utils::{ContactError, ContactsError, PandaConfig, PandaError, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Cancellation signal for a contact's PANDA task
#[derive(Debug)]
pub struct PandaShutdown {
    tx: watch::Sender<bool>,
}

impl Default for PandaShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl PandaShutdown {
    /// Create an unsignalled handle
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Receiver observed by a running task
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Signal cancellation; returns true if this call changed the state
    pub fn signal(&self) -> bool {
        !self.tx.send_replace(true)
    }

    /// True once cancellation was signalled
    pub fn is_signalled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// How a PANDA task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PandaOutcome {
    /// The peer's envelope was processed and the contact is established
    Established,
    /// The exchange terminated abnormally with this description
    Failed(String),
    /// The task was cancelled before finishing
    Cancelled,
}

/// Start a PANDA exchange for a pending contact
///
/// Any task previously started for the contact is cancelled. The returned
/// handle resolves once the exchange ends.
///
/// # Errors
///
/// * `ContactError::AlreadyEstablished` if the contact is established
/// * `PandaError::EmptySecret` for an empty shared secret
pub async fn start_exchange(
    contact: SharedContact,
    shared_secret: &[u8],
    rendezvous: Arc<dyn Rendezvous>,
    config: &PandaConfig,
) -> Result<JoinHandle<PandaOutcome>> {
    let (exchange, shutdown) = {
        let mut guard = contact.write().await;
        if guard.status() == ContactStatus::Established {
            return Err(ContactError::AlreadyEstablished {
                nickname: guard.nickname().to_string(),
            }
            .into());
        }

        let exchange = PandaExchange::new(shared_secret, guard.outgoing_exchange())?;
        guard.set_panda_exchange(exchange.to_bytes()?);
        guard.clear_panda_result();
        info!("Starting PANDA exchange for {}", guard.nickname());
        (exchange, guard.reset_panda_shutdown())
    };

    Ok(tokio::spawn(run_exchange(
        contact,
        exchange,
        rendezvous,
        config.clone(),
        shutdown,
    )))
}

/// Restart a PANDA exchange from the state stored in the contact
///
/// # Errors
///
/// Returns `PandaError::NotResumable` unless the contact is pending and holds
/// an exchange that is still in progress
pub async fn resume_exchange(
    contact: SharedContact,
    rendezvous: Arc<dyn Rendezvous>,
    config: &PandaConfig,
) -> Result<JoinHandle<PandaOutcome>> {
    let not_resumable = |reason: &str| -> ContactsError {
        PandaError::NotResumable {
            reason: reason.to_string(),
        }
        .into()
    };

    let (exchange, shutdown) = {
        let mut guard = contact.write().await;
        if guard.status() == ContactStatus::Established {
            return Err(not_resumable("contact is already established"));
        }
        let blob = guard
            .panda_exchange()
            .ok_or_else(|| not_resumable("no PANDA exchange was started"))?;
        let exchange = PandaExchange::from_bytes(blob)?;
        if exchange.status() != PandaStatus::InProgress || guard.panda_result().is_some() {
            return Err(not_resumable("the previous attempt failed"));
        }

        info!("Resuming PANDA exchange for {}", guard.nickname());
        (exchange, guard.reset_panda_shutdown())
    };

    Ok(tokio::spawn(run_exchange(
        contact,
        exchange,
        rendezvous,
        config.clone(),
        shutdown,
    )))
}

async fn run_exchange(
    contact: SharedContact,
    mut exchange: PandaExchange,
    rendezvous: Arc<dyn Rendezvous>,
    config: PandaConfig,
    mut shutdown: watch::Receiver<bool>,
) -> PandaOutcome {
    let result = drive(&exchange, rendezvous.as_ref(), &config, &mut shutdown).await;
    match result {
        Ok(Some(peer_envelope)) => finish(&contact, &mut exchange, peer_envelope).await,
        Ok(None) => {
            info!("PANDA exchange cancelled");
            PandaOutcome::Cancelled
        }
        Err(e) => record_failure(&contact, &mut exchange, &shutdown, &e).await,
    }
}

/// Post and poll until the peer's envelope arrives; `None` on cancellation
async fn drive(
    exchange: &PandaExchange,
    rendezvous: &dyn Rendezvous,
    config: &PandaConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<Vec<u8>>> {
    let mut posted = false;

    for attempt in 1..=config.max_attempts {
        if *shutdown.borrow() {
            return Ok(None);
        }

        let round = tokio::select! {
            biased;
            _ = shutdown.changed() => return Ok(None),
            result = poll_round(exchange, rendezvous, &mut posted) => result,
        };

        match round {
            Ok(Some(peer_envelope)) => {
                envelope::parse(&peer_envelope).map_err(|e| PandaError::Protocol {
                    reason: format!("peer sent an unusable envelope: {e}"),
                })?;
                debug!("PANDA peer envelope found on attempt {}", attempt);
                return Ok(Some(peer_envelope));
            }
            Ok(None) => debug!("PANDA attempt {}/{}: no peer yet", attempt, config.max_attempts),
            Err(ContactsError::Panda(PandaError::Rendezvous { reason })) => {
                warn!("PANDA attempt {}/{}: rendezvous error: {}", attempt, config.max_attempts, reason);
            }
            Err(e) => return Err(e),
        }

        if attempt < config.max_attempts {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(None),
                _ = tokio::time::sleep(config.poll_interval()) => {}
            }
        }
    }

    Err(PandaError::RetriesExhausted {
        attempts: config.max_attempts,
    }
    .into())
}

async fn poll_round(
    exchange: &PandaExchange,
    rendezvous: &dyn Rendezvous,
    posted: &mut bool,
) -> Result<Option<Vec<u8>>> {
    if !*posted {
        rendezvous.post(exchange.tag(), exchange.posting().to_vec()).await?;
        *posted = true;
    }
    let payloads = rendezvous.poll(exchange.tag()).await?;
    exchange.open_peer_payload(&payloads)
}

async fn finish(
    contact: &SharedContact,
    exchange: &mut PandaExchange,
    peer_envelope: Vec<u8>,
) -> PandaOutcome {
    let mut guard = contact.write().await;
    if !guard.is_pending() {
        let reason = ContactsError::from(ContactError::AlreadyEstablished {
            nickname: guard.nickname().to_string(),
        })
        .to_string();
        warn!("PANDA exchange for {} raced a direct exchange", guard.nickname());
        return PandaOutcome::Failed(reason);
    }

    match guard.complete_exchange(&peer_envelope) {
        Ok(()) => {
            exchange.mark_completed(peer_envelope);
            store_state(&mut guard, exchange.to_bytes());
            info!("PANDA exchange established {}", guard.nickname());
            PandaOutcome::Established
        }
        Err(e) => {
            let reason = e.to_string();
            exchange.mark_failed();
            store_state(&mut guard, exchange.to_bytes());
            guard.set_panda_result(reason.clone());
            warn!("PANDA exchange for {} failed: {}", guard.nickname(), reason);
            PandaOutcome::Failed(reason)
        }
    }
}

async fn record_failure(
    contact: &SharedContact,
    exchange: &mut PandaExchange,
    shutdown: &watch::Receiver<bool>,
    error: &ContactsError,
) -> PandaOutcome {
    let mut guard = contact.write().await;
    if *shutdown.borrow() || shutdown.has_changed().is_err() {
        info!("PANDA exchange for {} cancelled", guard.nickname());
        return PandaOutcome::Cancelled;
    }

    let reason = error.to_string();
    if !guard.is_pending() {
        warn!("PANDA exchange for established contact {} failed: {}", guard.nickname(), reason);
        return PandaOutcome::Failed(reason);
    }

    exchange.mark_failed();
    store_state(&mut guard, exchange.to_bytes());
    guard.set_panda_result(reason.clone());
    warn!("PANDA exchange for {} failed: {}", guard.nickname(), reason);
    PandaOutcome::Failed(reason)
}

/// Save encoded exchange state into the contact
///
/// If encoding failed, the stale blob is kept and a pending contact gets a
/// PANDA result so the stale state is never resumed.
fn store_state(contact: &mut Contact, encoded: Result<Vec<u8>>) {
    match encoded {
        Ok(blob) => contact.set_panda_exchange(blob),
        Err(e) => {
            warn!("Could not store PANDA state for {}: {}", contact.nickname(), e);
            if contact.is_pending() {
                contact.set_panda_result(format!("PANDA state could not be stored: {e}"));
            }
        }
    }
}
