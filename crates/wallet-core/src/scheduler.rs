//! Delayed broadcast.
//!
//! Finalized transactions wait in the store's pending ledger until their
//! due time. Every state change is persisted before the network is
//! touched, so a restart can always tell what happened:
//!
//! ```text
//! Scheduled --due/now--> Broadcasting --ok--> Broadcast
//!     |                       |
//!   cancel                  error --> Failed --now--> Broadcasting
//!     v                                  |
//! Cancelled <------------cancel----------+
//! ```
//!
//! An entry found in `Broadcasting` after a restart is checked against the
//! backend and resent only if the network has not seen it.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::backend::ChainBackend;
use crate::error::WalletError;
use crate::multisig::FinalizedTransaction;
use crate::privacy::CancelToken;
use crate::store::WalletStore;
use crate::types::{AccountId, PendingBroadcast, PendingState, PsbtState};

/// Longest the background loop sleeps without re-checking the ledger.
const MAX_IDLE_SECS: i64 = 60;

/// Source of unix time for due dates.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall-clock time that advances with the tokio clock, so paused-time
/// tests move it too.
pub struct SystemClock {
    base_unix: i64,
    base: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            base_unix: Utc::now().timestamp(),
            base: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        self.base_unix + self.base.elapsed().as_secs() as i64
    }
}

/// A clock moved by hand.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self(AtomicI64::new(start))
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Interrupted sends the network already had.
    pub confirmed: Vec<String>,
    /// Interrupted or due sends that were (re)submitted successfully.
    pub broadcast: Vec<String>,
    pub failed: Vec<String>,
}

pub struct BroadcastScheduler {
    store: Arc<WalletStore>,
    backend: Arc<dyn ChainBackend>,
    clock: Arc<dyn Clock>,
    wake: Notify,
}

impl BroadcastScheduler {
    pub fn new(
        store: Arc<WalletStore>,
        backend: Arc<dyn ChainBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            backend,
            clock,
            wake: Notify::new(),
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Queues `tx` for broadcast after `delay_secs`.
    ///
    /// Scheduling the same transaction twice returns the existing entry.
    pub fn schedule(
        &self,
        account_id: AccountId,
        tx: &FinalizedTransaction,
        delay_secs: u64,
    ) -> Result<PendingBroadcast, WalletError> {
        if let Ok(existing) = self.store.pending(&tx.id) {
            match existing.state {
                PendingState::Scheduled => return Ok(existing),
                PendingState::Broadcasting | PendingState::Broadcast => {
                    return Err(WalletError::AlreadyBroadcast(tx.id.clone()))
                }
                PendingState::Cancelled | PendingState::Failed => {}
            }
        }

        let entry = PendingBroadcast {
            id: tx.id.clone(),
            account_id,
            raw_tx: tx.raw_tx.clone(),
            txid: tx.txid.clone(),
            due_at: self.clock.now() + delay_secs as i64,
            state: PendingState::Scheduled,
            last_error: None,
        };
        self.store.put_pending(entry.clone());
        self.store.persist()?;
        self.wake.notify_one();
        tracing::info!(id = %entry.id, due_at = entry.due_at, "broadcast scheduled");
        Ok(entry)
    }

    /// Cancels a scheduled or failed broadcast and frees its inputs.
    ///
    /// Fails [`WalletError::AlreadyBroadcast`] once the transaction has
    /// been handed to the backend. A failed send may still have reached the
    /// network, so a failed entry is first checked against the backend and
    /// settled as broadcast if it was seen.
    pub async fn cancel(&self, id: &str) -> Result<PendingBroadcast, WalletError> {
        let current = self.store.pending(id)?;
        if current.state == PendingState::Failed && self.backend.transaction_seen(&current.txid).await? {
            self.complete(&current)?;
            tracing::warn!(%id, txid = %current.txid, "failed broadcast reached the network; not cancelling");
            return Err(WalletError::AlreadyBroadcast(id.to_string()));
        }

        let entry = self.store.update_pending(id, |entry| match entry.state {
            PendingState::Broadcasting | PendingState::Broadcast => {
                Err(WalletError::AlreadyBroadcast(id.to_string()))
            }
            PendingState::Scheduled | PendingState::Failed | PendingState::Cancelled => {
                entry.state = PendingState::Cancelled;
                Ok(entry.clone())
            }
        })?;

        self.store.release_reservations(entry.account_id, id)?;
        if self.store.find_transaction(id).is_some() {
            self.store.update_transaction(id, |record| {
                record.state = PsbtState::Discarded;
                Ok(())
            })?;
        }
        self.store.persist()?;
        tracing::info!(%id, "broadcast cancelled");
        Ok(entry)
    }

    /// Broadcasts a scheduled or failed entry without waiting.
    pub async fn broadcast_now(&self, id: &str) -> Result<String, WalletError> {
        let entry = self.claim(id)?;
        self.send(entry).await
    }

    /// Broadcasts every scheduled entry whose due time has passed. Failures
    /// are recorded on their entries; the successful txids are returned.
    pub async fn process_due(&self) -> Result<Vec<String>, WalletError> {
        let now = self.clock.now();
        let mut due: Vec<PendingBroadcast> = self
            .store
            .pending_entries()
            .into_iter()
            .filter(|e| e.state == PendingState::Scheduled && e.due_at <= now)
            .collect();
        due.sort_by_key(|e| e.due_at);

        let mut sent = Vec::new();
        for entry in due {
            let entry = match self.claim(&entry.id) {
                Ok(entry) => entry,
                // Cancelled or claimed since the scan.
                Err(_) => continue,
            };
            match self.send(entry).await {
                Ok(txid) => sent.push(txid),
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => {}
            }
        }
        Ok(sent)
    }

    /// Settles entries left in `Broadcasting` by an interrupted run, then
    /// processes whatever is due. Safe to run any number of times.
    pub async fn reconcile(&self) -> Result<ReconcileReport, WalletError> {
        let mut report = ReconcileReport::default();
        let interrupted: Vec<PendingBroadcast> = self
            .store
            .pending_entries()
            .into_iter()
            .filter(|e| e.state == PendingState::Broadcasting)
            .collect();

        for entry in interrupted {
            if self.backend.transaction_seen(&entry.txid).await? {
                self.complete(&entry)?;
                report.confirmed.push(entry.txid);
                continue;
            }
            let id = entry.id.clone();
            match self.send(entry).await {
                Ok(txid) => report.broadcast.push(txid),
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => report.failed.push(id),
            }
        }

        report.broadcast.extend(self.process_due().await?);
        if !report.confirmed.is_empty() || !report.broadcast.is_empty() || !report.failed.is_empty() {
            tracing::info!(
                confirmed = report.confirmed.len(),
                broadcast = report.broadcast.len(),
                failed = report.failed.len(),
                "reconciled pending broadcasts"
            );
        }
        Ok(report)
    }

    /// Earliest due time among scheduled entries.
    pub fn next_due(&self) -> Option<i64> {
        self.store
            .pending_entries()
            .iter()
            .filter(|e| e.state == PendingState::Scheduled)
            .map(|e| e.due_at)
            .min()
    }

    /// Broadcasts entries as they come due until `token` is cancelled.
    pub async fn run(&self, token: CancelToken) {
        loop {
            if let Err(e) = self.process_due().await {
                tracing::error!(error = %e, "broadcast loop stopped");
                return;
            }
            let wait = match self.next_due() {
                Some(due) => (due - self.clock.now()).clamp(0, MAX_IDLE_SECS),
                None => MAX_IDLE_SECS,
            };
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(wait as u64)) => {}
                _ = self.wake.notified() => {}
                _ = token.cancelled() => return,
            }
        }
    }

    /// Moves an entry to `Broadcasting` and persists that before any
    /// network call.
    fn claim(&self, id: &str) -> Result<PendingBroadcast, WalletError> {
        let entry = self.store.update_pending(id, |entry| match entry.state {
            PendingState::Scheduled | PendingState::Failed => {
                entry.state = PendingState::Broadcasting;
                Ok(entry.clone())
            }
            PendingState::Broadcasting | PendingState::Broadcast => {
                Err(WalletError::AlreadyBroadcast(id.to_string()))
            }
            PendingState::Cancelled => Err(WalletError::UnknownTransaction(format!(
                "{id} was cancelled"
            ))),
        })?;
        self.store.persist()?;
        Ok(entry)
    }

    async fn send(&self, entry: PendingBroadcast) -> Result<String, WalletError> {
        match self.backend.broadcast(&entry.raw_tx).await {
            Ok(txid) => {
                self.complete(&entry)?;
                tracing::info!(id = %entry.id, %txid, "transaction broadcast");
                Ok(txid)
            }
            Err(e) => {
                tracing::warn!(id = %entry.id, error = %e, "broadcast failed");
                self.store.update_pending(&entry.id, |pending| {
                    pending.state = PendingState::Failed;
                    pending.last_error = Some(e.to_string());
                    Ok(())
                })?;
                self.store.persist()?;
                Err(e)
            }
        }
    }

    fn complete(&self, entry: &PendingBroadcast) -> Result<(), WalletError> {
        self.store.update_pending(&entry.id, |pending| {
            pending.state = PendingState::Broadcast;
            pending.last_error = None;
            Ok(())
        })?;
        self.store.consume_reservations(entry.account_id, &entry.id)?;
        if self.store.find_transaction(&entry.id).is_some() {
            self.store.update_transaction(&entry.id, |record| {
                record.state = PsbtState::Broadcast;
                Ok(())
            })?;
        }
        self.store.persist()
    }
}
