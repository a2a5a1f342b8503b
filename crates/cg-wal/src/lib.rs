#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-wal** – Producer and consumer write-ahead log engine.
//!
//! Both WALs share one contract — `Write`, `Confirm`, `UpdateAttempt`,
//! `DeleteEntry`, `GetPending*`, `Stats`, `Close`, plus the durable-lease
//! operations that make the retry loop and recovery driver safe to run
//! concurrently across process restarts. The consumer side adds
//! `MarkFailed` and a `TransactionID`-carrying `Write`. Rather than one
//! type with an "am I a consumer" flag, the shared operations live on
//! [`WalCore`] and [`ProducerWal`]/[`ConsumerWal`] are thin, differently
//! shaped front ends over it — the same relationship the old
//! `toka_store_core::WalStorageBackend` blanket impl had to its underlying
//! `StorageBackend` + `WriteAheadLog` traits, generalized over the
//! `EntryStore` abstraction instead of a single concrete backend.
//!
//! Per-entry TTL is enforced here (not in `cg-store-core`): every operation
//! that needs "is this entry still fresh" compares `WalEntry::age` against
//! `WalConfig::ttl` directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use cg_store_core::{EntryStore, StoreError};
use cg_types::{WalEntry, WalEntryState};
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, BoxStream};
use uuid::Uuid;

/// Errors a WAL operation can return.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// The WAL has been closed; no further operations are accepted.
    #[error("wal is closed")]
    Closed,
    /// `Write` was called with an empty payload — Rust's type system rules
    /// out a null `event`, so an empty payload is this WAL's analogue of
    /// the original `NilEvent` error.
    #[error("event payload is empty")]
    NilEvent,
    /// An operation was called with a nil/empty entry id.
    #[error("entry id is empty")]
    EmptyId,
    /// No entry with the given id exists in any live state.
    #[error("entry not found")]
    NotFound,
    /// `Close` did not complete within its configured timeout.
    #[error("close timed out")]
    CloseTimeout,
    /// The durable lease on this entry is held by a different holder.
    #[error("lease held by another holder")]
    LeaseHeldByAnother,
    /// The underlying store reported an error.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// An on-disk entry failed to (de)serialize.
    #[error("entry (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Tunables for a single WAL instance.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// When `true`, `Write` flushes the store before returning.
    pub sync_writes: bool,
    /// How long a `pending:` entry may live before it is eligible for TTL
    /// expiry.
    pub ttl: ChronoDuration,
    /// Durable lease lifetime. MUST be strictly longer than expected
    /// processing time; production deployments should keep this at 30 s
    /// or more.
    pub lease_duration: ChronoDuration,
    /// Bound on how long `Close` will wait for a final flush.
    pub close_timeout: StdDuration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_writes: false,
            ttl: ChronoDuration::hours(24),
            lease_duration: ChronoDuration::seconds(30),
            close_timeout: StdDuration::from_secs(5),
        }
    }
}

/// Counts and storage footprint returned by `Stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalStats {
    /// Number of entries currently in the `pending:` prefix.
    pub pending_count: usize,
    /// Number of entries currently in the `confirmed:` prefix.
    pub confirmed_count: usize,
    /// Number of entries currently in the `failed:` prefix (always `0` for
    /// a producer WAL, which never writes that prefix).
    pub failed_count: usize,
    /// Approximate on-disk size of the backing store, in bytes.
    pub size_on_disk_bytes: u64,
}

fn pending_key(id: Uuid) -> String {
    format!("{}:{id}", WalEntryState::Pending.key_prefix())
}

fn confirmed_key(id: Uuid) -> String {
    format!("{}:{id}", WalEntryState::Confirmed.key_prefix())
}

fn failed_key(id: Uuid) -> String {
    format!("{}:{id}", WalEntryState::FailedPermanent.key_prefix())
}

/// Operations shared by [`ProducerWal`] and [`ConsumerWal`].
struct WalCore<S: EntryStore> {
    store: Arc<S>,
    config: WalConfig,
    closed: AtomicBool,
}

impl<S: EntryStore> WalCore<S> {
    fn new(store: Arc<S>, config: WalConfig) -> Self {
        Self {
            store,
            config,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), WalError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(WalError::Closed)
        } else {
            Ok(())
        }
    }

    async fn write_entry(&self, entry: WalEntry) -> Result<Uuid, WalError> {
        self.check_open()?;
        if entry.payload.is_empty() {
            return Err(WalError::NilEvent);
        }
        let id = entry.id;
        let bytes = serde_json::to_vec(&entry)?;
        self.store.put(&pending_key(id), bytes).await?;
        if self.config.sync_writes {
            self.store.flush().await?;
        }
        tracing::debug!(entry_id = %id, "wal entry written");
        Ok(id)
    }

    async fn confirm(&self, entry_id: Uuid) -> Result<(), WalError> {
        self.check_open()?;
        let pending = pending_key(entry_id);
        let confirmed = confirmed_key(entry_id);
        let now = Utc::now();

        let result = self.store.transaction(Box::new(move |txn| {
            let Some(bytes) = txn.get(&pending)? else {
                return Err(StoreError::NotFound(pending.clone()));
            };
            let mut entry: WalEntry = serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            entry.confirmed = true;
            entry.confirmed_at = Some(now);
            entry.lease_expiry = None;
            entry.lease_holder = None;
            let bytes =
                serde_json::to_vec(&entry).map_err(|e| StoreError::Backend(e.to_string()))?;
            txn.remove(&pending)?;
            txn.insert(&confirmed, bytes)?;
            Ok(())
        }));

        match result {
            Ok(()) => {
                tracing::debug!(entry_id = %entry_id, "wal entry confirmed");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Err(WalError::NotFound),
            Err(e) => Err(WalError::from(e)),
        }
    }

    async fn update_attempt(&self, entry_id: Uuid, err_str: String) -> Result<(), WalError> {
        self.check_open()?;
        let pending = pending_key(entry_id);
        let now = Utc::now();

        let result = self.store.transaction(Box::new(move |txn| {
            let Some(bytes) = txn.get(&pending)? else {
                return Err(StoreError::NotFound(pending.clone()));
            };
            let mut entry: WalEntry =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Backend(e.to_string()))?;
            entry.attempts += 1;
            entry.last_attempt_at = Some(now);
            entry.last_error = Some(err_str.clone());
            let bytes =
                serde_json::to_vec(&entry).map_err(|e| StoreError::Backend(e.to_string()))?;
            txn.insert(&pending, bytes)?;
            Ok(())
        }));

        match result {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound(_)) => Err(WalError::NotFound),
            Err(e) => Err(WalError::from(e)),
        }
    }

    async fn mark_failed(&self, entry_id: Uuid, reason: String) -> Result<(), WalError> {
        self.check_open()?;
        let pending = pending_key(entry_id);
        let failed = failed_key(entry_id);
        let now = Utc::now();

        let result = self.store.transaction(Box::new(move |txn| {
            let Some(bytes) = txn.get(&pending)? else {
                return Err(StoreError::NotFound(pending.clone()));
            };
            let mut entry: WalEntry =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Backend(e.to_string()))?;
            entry.failed_permanent = true;
            entry.failed_at = Some(now);
            entry.failure_reason = Some(reason.clone());
            entry.lease_expiry = None;
            entry.lease_holder = None;
            let bytes =
                serde_json::to_vec(&entry).map_err(|e| StoreError::Backend(e.to_string()))?;
            txn.remove(&pending)?;
            txn.insert(&failed, bytes)?;
            Ok(())
        }));

        match result {
            Ok(()) => {
                tracing::warn!(entry_id = %entry_id, "wal entry marked permanently failed");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Err(WalError::NotFound),
            Err(e) => Err(WalError::from(e)),
        }
    }

    async fn delete_entry(&self, entry_id: Uuid) -> Result<(), WalError> {
        self.check_open()?;
        // Idempotent across every prefix the entry could be living under.
        self.store.delete(&pending_key(entry_id)).await?;
        self.store.delete(&confirmed_key(entry_id)).await?;
        self.store.delete(&failed_key(entry_id)).await?;
        Ok(())
    }

    async fn get_pending(&self) -> Result<Vec<WalEntry>, WalError> {
        self.check_open()?;
        let prefix = format!("{}:", WalEntryState::Pending.key_prefix());
        let scanned = self.store.scan_prefix(&prefix).await?;
        scanned
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(WalError::from))
            .collect()
    }

    async fn stats(&self) -> Result<WalStats, WalError> {
        self.check_open()?;
        let pending_count = self
            .store
            .scan_prefix(&format!("{}:", WalEntryState::Pending.key_prefix()))
            .await?
            .len();
        let confirmed_count = self
            .store
            .scan_prefix(&format!("{}:", WalEntryState::Confirmed.key_prefix()))
            .await?
            .len();
        let failed_count = self
            .store
            .scan_prefix(&format!("{}:", WalEntryState::FailedPermanent.key_prefix()))
            .await?
            .len();
        Ok(WalStats {
            pending_count,
            confirmed_count,
            failed_count,
            size_on_disk_bytes: self.store.size_on_disk()?,
        })
    }

    async fn close(&self) -> Result<(), WalError> {
        self.closed.store(true, Ordering::SeqCst);
        match tokio::time::timeout(self.config.close_timeout, self.store.flush()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WalError::from(e)),
            Err(_) => Err(WalError::CloseTimeout),
        }
    }

    async fn try_claim_lease(&self, entry_id: Uuid, holder_id: &str) -> Result<bool, WalError> {
        self.check_open()?;
        let pending = pending_key(entry_id);
        let now = Utc::now();
        let lease_duration = self.config.lease_duration;
        let holder = holder_id.to_string();
        const NOT_CLAIMED: &str = "lease held by another holder";

        let result = self.store.transaction(Box::new(move |txn| {
            let Some(bytes) = txn.get(&pending)? else {
                return Err(StoreError::NotFound(pending.clone()));
            };
            let mut entry: WalEntry =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Backend(e.to_string()))?;

            let claimed = match entry.lease_expiry {
                None => true,
                Some(expiry) if now > expiry => true,
                Some(_) if entry.lease_holder.as_deref() == Some(holder.as_str()) => true,
                Some(_) => false,
            };

            if !claimed {
                return Err(StoreError::TransactionAborted(NOT_CLAIMED.into()));
            }

            entry.lease_expiry = Some(now + lease_duration);
            entry.lease_holder = Some(holder.clone());
            let bytes =
                serde_json::to_vec(&entry).map_err(|e| StoreError::Backend(e.to_string()))?;
            txn.insert(&pending, bytes)?;
            Ok(())
        }));

        match result {
            Ok(()) => Ok(true),
            Err(StoreError::TransactionAborted(ref msg)) if msg == NOT_CLAIMED => Ok(false),
            Err(StoreError::NotFound(_)) => Err(WalError::NotFound),
            Err(e) => Err(WalError::from(e)),
        }
    }

    async fn release_lease(&self, entry_id: Uuid) -> Result<(), WalError> {
        self.check_open()?;
        let pending = pending_key(entry_id);

        self.store.transaction(Box::new(move |txn| {
            let Some(bytes) = txn.get(&pending)? else {
                return Ok(()); // safe no-op if the entry is already gone
            };
            let mut entry: WalEntry =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Backend(e.to_string()))?;
            entry.lease_expiry = None;
            entry.lease_holder = None;
            let bytes =
                serde_json::to_vec(&entry).map_err(|e| StoreError::Backend(e.to_string()))?;
            txn.insert(&pending, bytes)?;
            Ok(())
        }))?;
        Ok(())
    }

    async fn extend_lease(&self, entry_id: Uuid, holder_id: &str) -> Result<(), WalError> {
        self.check_open()?;
        let pending = pending_key(entry_id);
        let now = Utc::now();
        let lease_duration = self.config.lease_duration;
        let holder = holder_id.to_string();
        const HELD_BY_ANOTHER: &str = "lease held by another holder";

        let result = self.store.transaction(Box::new(move |txn| {
            let Some(bytes) = txn.get(&pending)? else {
                return Err(StoreError::NotFound(pending.clone()));
            };
            let mut entry: WalEntry =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Backend(e.to_string()))?;

            if entry.lease_holder.is_some() && entry.lease_holder.as_deref() != Some(holder.as_str())
            {
                return Err(StoreError::TransactionAborted(HELD_BY_ANOTHER.into()));
            }

            entry.lease_expiry = Some(now + lease_duration);
            entry.lease_holder = Some(holder.clone());
            let bytes =
                serde_json::to_vec(&entry).map_err(|e| StoreError::Backend(e.to_string()))?;
            txn.insert(&pending, bytes)?;
            Ok(())
        }));

        match result {
            Ok(()) => Ok(()),
            Err(StoreError::TransactionAborted(ref msg)) if msg == HELD_BY_ANOTHER => {
                Err(WalError::LeaseHeldByAnother)
            }
            Err(StoreError::NotFound(_)) => Err(WalError::NotFound),
            Err(e) => Err(WalError::from(e)),
        }
    }
}

/// Producer-side WAL (C3): persists events before they are published to
/// the downstream bus.
pub struct ProducerWal<S: EntryStore> {
    core: WalCore<S>,
}

impl<S: EntryStore> ProducerWal<S> {
    /// Open a producer WAL over `store`.
    pub fn new(store: Arc<S>, config: WalConfig) -> Self {
        Self {
            core: WalCore::new(store, config),
        }
    }

    /// Persist `payload` as a fresh pending entry. Returns the entry's id.
    pub async fn write(&self, payload: Vec<u8>) -> Result<Uuid, WalError> {
        if payload.is_empty() {
            return Err(WalError::NilEvent);
        }
        let entry = WalEntry::new_pending(payload, Utc::now());
        self.core.write_entry(entry).await
    }

    /// Move `entry_id` to the `confirmed:` prefix.
    pub async fn confirm(&self, entry_id: Uuid) -> Result<(), WalError> {
        self.core.confirm(entry_id).await
    }

    /// Record a failed publish attempt against `entry_id`.
    pub async fn update_attempt(&self, entry_id: Uuid, err_str: String) -> Result<(), WalError> {
        self.core.update_attempt(entry_id, err_str).await
    }

    /// Idempotently delete `entry_id` regardless of its current state.
    pub async fn delete_entry(&self, entry_id: Uuid) -> Result<(), WalError> {
        self.core.delete_entry(entry_id).await
    }

    /// Snapshot of every currently pending entry.
    pub async fn get_pending(&self) -> Result<Vec<WalEntry>, WalError> {
        self.core.get_pending().await
    }

    /// A stream view over the same snapshot [`Self::get_pending`] returns.
    pub async fn get_pending_stream(&self) -> Result<BoxStream<'static, WalEntry>, WalError> {
        Ok(Box::pin(stream::iter(self.core.get_pending().await?)))
    }

    /// Entry counts and on-disk footprint.
    pub async fn stats(&self) -> Result<WalStats, WalError> {
        self.core.stats().await
    }

    /// Bounded graceful close.
    pub async fn close(&self) -> Result<(), WalError> {
        self.core.close().await
    }

    /// Attempt to claim the durable lease on `entry_id` for `holder_id`.
    pub async fn try_claim_lease(&self, entry_id: Uuid, holder_id: &str) -> Result<bool, WalError> {
        self.core.try_claim_lease(entry_id, holder_id).await
    }

    /// Release the durable lease on `entry_id`.
    pub async fn release_lease(&self, entry_id: Uuid) -> Result<(), WalError> {
        self.core.release_lease(entry_id).await
    }

    /// Extend the durable lease on `entry_id`, held by `holder_id`.
    pub async fn extend_lease(&self, entry_id: Uuid, holder_id: &str) -> Result<(), WalError> {
        self.core.extend_lease(entry_id, holder_id).await
    }

    /// The configured TTL, exposed so workers can evaluate expiry.
    pub fn ttl(&self) -> ChronoDuration {
        self.core.config.ttl
    }
}

/// Consumer-side WAL (C4): persists bus messages before they are
/// committed to the analytical store, carrying the store's idempotency
/// token.
pub struct ConsumerWal<S: EntryStore> {
    core: WalCore<S>,
}

impl<S: EntryStore> ConsumerWal<S> {
    /// Open a consumer WAL over `store`.
    pub fn new(store: Arc<S>, config: WalConfig) -> Self {
        Self {
            core: WalCore::new(store, config),
        }
    }

    /// Persist `payload` as a fresh pending entry carrying bus/idempotency
    /// metadata.
    pub async fn write(
        &self,
        payload: Vec<u8>,
        transaction_id: String,
        subject: Option<String>,
        message_id: Option<String>,
    ) -> Result<Uuid, WalError> {
        if payload.is_empty() {
            return Err(WalError::NilEvent);
        }
        let entry =
            WalEntry::new_consumer_pending(payload, transaction_id, subject, message_id, Utc::now());
        self.core.write_entry(entry).await
    }

    /// Move `entry_id` to the `confirmed:` prefix.
    pub async fn confirm(&self, entry_id: Uuid) -> Result<(), WalError> {
        self.core.confirm(entry_id).await
    }

    /// Record a failed commit attempt against `entry_id`.
    pub async fn update_attempt(&self, entry_id: Uuid, err_str: String) -> Result<(), WalError> {
        self.core.update_attempt(entry_id, err_str).await
    }

    /// Move `entry_id` to the `failed:` prefix, consumer-only terminal
    /// state.
    pub async fn mark_failed(&self, entry_id: Uuid, reason: String) -> Result<(), WalError> {
        self.core.mark_failed(entry_id, reason).await
    }

    /// Idempotently delete `entry_id` regardless of its current state.
    pub async fn delete_entry(&self, entry_id: Uuid) -> Result<(), WalError> {
        self.core.delete_entry(entry_id).await
    }

    /// Snapshot of every currently pending entry.
    pub async fn get_pending(&self) -> Result<Vec<WalEntry>, WalError> {
        self.core.get_pending().await
    }

    /// A stream view over the same snapshot [`Self::get_pending`] returns.
    pub async fn get_pending_stream(&self) -> Result<BoxStream<'static, WalEntry>, WalError> {
        Ok(Box::pin(stream::iter(self.core.get_pending().await?)))
    }

    /// Entry counts and on-disk footprint.
    pub async fn stats(&self) -> Result<WalStats, WalError> {
        self.core.stats().await
    }

    /// Bounded graceful close.
    pub async fn close(&self) -> Result<(), WalError> {
        self.core.close().await
    }

    /// Attempt to claim the durable lease on `entry_id` for `holder_id`.
    pub async fn try_claim_lease(&self, entry_id: Uuid, holder_id: &str) -> Result<bool, WalError> {
        self.core.try_claim_lease(entry_id, holder_id).await
    }

    /// Release the durable lease on `entry_id`.
    pub async fn release_lease(&self, entry_id: Uuid) -> Result<(), WalError> {
        self.core.release_lease(entry_id).await
    }

    /// Extend the durable lease on `entry_id`, held by `holder_id`.
    pub async fn extend_lease(&self, entry_id: Uuid, holder_id: &str) -> Result<(), WalError> {
        self.core.extend_lease(entry_id, holder_id).await
    }

    /// The configured TTL, exposed so workers can evaluate expiry.
    pub fn ttl(&self) -> ChronoDuration {
        self.core.config.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_store_memory::MemoryStore;

    fn wal() -> ProducerWal<MemoryStore> {
        ProducerWal::new(Arc::new(MemoryStore::new()), WalConfig::default())
    }

    #[tokio::test]
    async fn write_then_confirm_round_trips() {
        let wal = wal();
        let id = wal.write(b"payload".to_vec()).await.unwrap();

        let pending = wal.get_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);

        wal.confirm(id).await.unwrap();
        assert!(wal.get_pending().await.unwrap().is_empty());

        let stats = wal.stats().await.unwrap();
        assert_eq!(stats.confirmed_count, 1);
        assert_eq!(stats.pending_count, 0);
    }

    #[tokio::test]
    async fn confirm_on_missing_entry_is_not_found() {
        let wal = wal();
        let missing = Uuid::new_v4();
        assert!(matches!(wal.confirm(missing).await, Err(WalError::NotFound)));
    }

    #[tokio::test]
    async fn write_rejects_empty_payload() {
        let wal = wal();
        assert!(matches!(wal.write(vec![]).await, Err(WalError::NilEvent)));
    }

    #[tokio::test]
    async fn update_attempt_increments_attempts_and_records_error() {
        let wal = wal();
        let id = wal.write(b"payload".to_vec()).await.unwrap();
        wal.update_attempt(id, "boom".into()).await.unwrap();

        let pending = wal.get_pending().await.unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn delete_entry_is_idempotent_across_states() {
        let wal = wal();
        let id = wal.write(b"payload".to_vec()).await.unwrap();
        wal.delete_entry(id).await.unwrap();
        wal.delete_entry(id).await.unwrap();
        assert!(wal.get_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry_or_release() {
        let wal = wal();
        let id = wal.write(b"payload".to_vec()).await.unwrap();

        assert!(wal.try_claim_lease(id, "worker-a").await.unwrap());
        assert!(!wal.try_claim_lease(id, "worker-b").await.unwrap());
        // Reentrant claim by the same holder succeeds.
        assert!(wal.try_claim_lease(id, "worker-a").await.unwrap());

        wal.release_lease(id).await.unwrap();
        assert!(wal.try_claim_lease(id, "worker-b").await.unwrap());
    }

    #[tokio::test]
    async fn extend_lease_fails_for_a_different_holder() {
        let wal = wal();
        let id = wal.write(b"payload".to_vec()).await.unwrap();
        wal.try_claim_lease(id, "worker-a").await.unwrap();

        assert!(matches!(
            wal.extend_lease(id, "worker-b").await,
            Err(WalError::LeaseHeldByAnother)
        ));
        assert!(wal.extend_lease(id, "worker-a").await.is_ok());
    }

    #[tokio::test]
    async fn release_lease_on_missing_entry_is_a_no_op() {
        let wal = wal();
        assert!(wal.release_lease(Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn closed_wal_rejects_further_operations() {
        let wal = wal();
        wal.close().await.unwrap();
        assert!(matches!(wal.write(b"x".to_vec()).await, Err(WalError::Closed)));
    }

    #[tokio::test]
    async fn consumer_wal_marks_failed_entries() {
        let wal = ConsumerWal::new(Arc::new(MemoryStore::new()), WalConfig::default());
        let id = wal
            .write(b"payload".to_vec(), "plex:abc:0".into(), None, None)
            .await
            .unwrap();

        wal.mark_failed(id, "max_retries_exceeded".into()).await.unwrap();
        assert!(wal.get_pending().await.unwrap().is_empty());

        let stats = wal.stats().await.unwrap();
        assert_eq!(stats.failed_count, 1);
    }
}
