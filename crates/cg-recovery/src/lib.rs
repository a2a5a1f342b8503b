#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-recovery** – Startup recovery driver.
//!
//! Runs once, typically at process start, over every currently pending
//! entry — claiming the lease, then applying the producer- or consumer-WAL
//! recovery algorithm rather than the retry loop's backoff-gated
//! readiness check: recovery always attempts, since the only reason these
//! entries are still pending is that no worker has been running to retry
//! them. Reuses [`cg_retry::RetryTarget`] for the shared lease/state
//! operations, so a recovery driver and a retry loop can run against the
//! very same WAL handle without duplicating that seam.

use async_trait::async_trait;
use cg_retry::{RetryTarget, RetrySink};
use cg_types::WalEntry;
use cg_wal::WalError;
use chrono::Utc;
use uuid::Uuid;

/// Callback surface the consumer-side recovery driver needs from the
/// analytical store: idempotency check, failed-event bookkeeping, and the
/// actual commit.
#[async_trait]
pub trait ConsumerRecoveryCallback: Send + Sync {
    /// True if `transaction_id` has already been committed to the store.
    async fn transaction_id_exists(&self, transaction_id: &str) -> Result<bool, String>;
    /// Record a permanently-failed entry for audit purposes.
    async fn insert_failed_event(&self, entry: &WalEntry, reason: &str) -> Result<(), String>;
    /// Commit `payload` under `transaction_id`.
    async fn insert_event(&self, payload: &[u8], transaction_id: &str) -> Result<(), String>;
}

/// Outcome counts from one recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryCounters {
    /// Entries whose lease could not be claimed.
    pub skipped: u64,
    /// Entries deleted/marked-failed for exceeding TTL.
    pub expired: u64,
    /// Entries deleted/marked-failed for exceeding `max_retries`.
    pub max_retried: u64,
    /// Entries successfully confirmed this pass.
    pub recovered: u64,
    /// Entries whose attempt failed and were left pending for a future
    /// retry/recovery pass.
    pub failed: u64,
    /// C-WAL only: entries the store had already committed under a
    /// concurrent operator's transaction id.
    pub already_committed: u64,
}

fn holder_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Producer-side recovery (`RecoverPending`): attempt to (re-)publish
/// every pending entry.
pub async fn recover_pending<T, K>(
    target: &T,
    publisher: &K,
    max_retries: u32,
    holder_prefix: &str,
) -> RecoveryCounters
where
    T: RetryTarget,
    K: RetrySink,
{
    let mut counters = RecoveryCounters::default();

    let pending = match target.get_pending().await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(error = %e, "recovery: failed to load pending snapshot");
            return counters;
        }
    };

    let now = Utc::now();
    for entry in pending {
        let holder = holder_id(holder_prefix);
        match target.try_claim_lease(entry.id, &holder).await {
            Ok(true) => {}
            Ok(false) => {
                counters.skipped += 1;
                continue;
            }
            Err(e) => {
                tracing::warn!(entry_id = %entry.id, error = %e, "recovery: lease claim failed");
                counters.skipped += 1;
                continue;
            }
        }

        if entry.age(now) > target.ttl() {
            if let Err(e) = target.delete_entry(entry.id).await {
                tracing::warn!(entry_id = %entry.id, error = %e, "recovery: failed to delete expired entry");
            }
            counters.expired += 1;
            continue;
        }

        if entry.attempts >= max_retries {
            if let Err(e) = target.delete_entry(entry.id).await {
                tracing::warn!(entry_id = %entry.id, error = %e, "recovery: failed to delete max-retried entry");
            }
            counters.max_retried += 1;
            continue;
        }

        match publisher.attempt(&entry).await {
            Ok(()) => match target.confirm(entry.id).await {
                Ok(()) | Err(WalError::NotFound) => counters.recovered += 1,
                Err(e) => {
                    tracing::warn!(entry_id = %entry.id, error = %e, "recovery: confirm failed");
                }
            },
            Err(err_str) => {
                if let Err(e) = target.update_attempt(entry.id, err_str).await {
                    tracing::warn!(entry_id = %entry.id, error = %e, "recovery: update_attempt failed");
                }
                counters.failed += 1;
            }
        }
    }

    counters
}

/// Consumer-side recovery (`RecoverOnStartup`): reconcile every pending
/// entry against the analytical store's committed transaction ids before
/// deciding whether to commit, fail, or retry it later.
pub async fn recover_on_startup<T, C>(
    target: &T,
    callback: &C,
    max_retries: u32,
    holder_prefix: &str,
) -> RecoveryCounters
where
    T: RetryTarget,
    C: ConsumerRecoveryCallback,
{
    let mut counters = RecoveryCounters::default();

    let pending = match target.get_pending().await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(error = %e, "recovery: failed to load pending snapshot");
            return counters;
        }
    };

    let now = Utc::now();
    for entry in pending {
        let holder = holder_id(holder_prefix);
        match target.try_claim_lease(entry.id, &holder).await {
            Ok(true) => {}
            Ok(false) => {
                counters.skipped += 1;
                continue;
            }
            Err(e) => {
                tracing::warn!(entry_id = %entry.id, error = %e, "recovery: lease claim failed");
                counters.skipped += 1;
                continue;
            }
        }

        let transaction_id = entry.transaction_id.clone().unwrap_or_default();

        let already_committed = match callback.transaction_id_exists(&transaction_id).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(entry_id = %entry.id, error = %e, "recovery: transaction_id_exists check failed");
                counters.failed += 1;
                continue;
            }
        };

        if already_committed {
            match target.confirm(entry.id).await {
                Ok(()) | Err(WalError::NotFound) => {}
                Err(e) => {
                    tracing::warn!(entry_id = %entry.id, error = %e, "recovery: confirm failed");
                }
            }
            counters.already_committed += 1;
            continue;
        }

        if entry.age(now) > target.ttl() {
            if let Err(e) = callback.insert_failed_event(&entry, "expired").await {
                tracing::warn!(entry_id = %entry.id, error = %e, "recovery: insert_failed_event failed");
            }
            if let Err(e) = target.terminal_fail(entry.id, "expired".to_string()).await {
                tracing::warn!(entry_id = %entry.id, error = %e, "recovery: mark_failed failed");
            }
            counters.expired += 1;
            continue;
        }

        if entry.attempts >= max_retries {
            if let Err(e) = callback
                .insert_failed_event(&entry, "max_retries_exceeded")
                .await
            {
                tracing::warn!(entry_id = %entry.id, error = %e, "recovery: insert_failed_event failed");
            }
            if let Err(e) = target
                .terminal_fail(entry.id, "max_retries_exceeded".to_string())
                .await
            {
                tracing::warn!(entry_id = %entry.id, error = %e, "recovery: mark_failed failed");
            }
            counters.max_retried += 1;
            continue;
        }

        match callback.insert_event(&entry.payload, &transaction_id).await {
            Ok(()) => match target.confirm(entry.id).await {
                Ok(()) | Err(WalError::NotFound) => counters.recovered += 1,
                Err(e) => {
                    tracing::warn!(entry_id = %entry.id, error = %e, "recovery: confirm failed");
                }
            },
            Err(err_str) => {
                if let Err(e) = target.update_attempt(entry.id, err_str).await {
                    tracing::warn!(entry_id = %entry.id, error = %e, "recovery: update_attempt failed");
                }
                counters.failed += 1;
            }
        }
    }

    counters
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_store_memory::MemoryStore;
    use cg_wal::{ConsumerWal, ProducerWal, WalConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct AlwaysSucceeds;

    #[async_trait]
    impl RetrySink for AlwaysSucceeds {
        async fn attempt(&self, _entry: &WalEntry) -> Result<(), String> {
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl RetrySink for AlwaysFails {
        async fn attempt(&self, _entry: &WalEntry) -> Result<(), String> {
            Err("boom".to_string())
        }
    }

    #[tokio::test]
    async fn producer_recovery_confirms_successfully_published_entries() {
        let wal = Arc::new(ProducerWal::new(
            Arc::new(MemoryStore::new()),
            WalConfig::default(),
        ));
        wal.write(b"payload".to_vec()).await.unwrap();

        let counters = recover_pending(wal.as_ref(), &AlwaysSucceeds, 10, "recovery").await;

        assert_eq!(counters.recovered, 1);
        assert!(wal.get_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn producer_recovery_leaves_failed_attempts_pending_for_later() {
        let wal = Arc::new(ProducerWal::new(
            Arc::new(MemoryStore::new()),
            WalConfig::default(),
        ));
        wal.write(b"payload".to_vec()).await.unwrap();

        let counters = recover_pending(wal.as_ref(), &AlwaysFails, 10, "recovery").await;

        assert_eq!(counters.failed, 1);
        assert_eq!(wal.get_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn producer_recovery_expires_entries_past_ttl() {
        let wal = Arc::new(ProducerWal::new(
            Arc::new(MemoryStore::new()),
            WalConfig {
                ttl: chrono::Duration::seconds(0),
                ..WalConfig::default()
            },
        ));
        wal.write(b"payload".to_vec()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let counters = recover_pending(wal.as_ref(), &AlwaysSucceeds, 10, "recovery").await;

        assert_eq!(counters.expired, 1);
        assert!(wal.get_pending().await.unwrap().is_empty());
    }

    struct FakeStore {
        committed: std::sync::Mutex<std::collections::HashSet<String>>,
        failed_events: AtomicUsize,
        inserts_fail: bool,
    }

    #[async_trait]
    impl ConsumerRecoveryCallback for FakeStore {
        async fn transaction_id_exists(&self, transaction_id: &str) -> Result<bool, String> {
            Ok(self.committed.lock().unwrap().contains(transaction_id))
        }
        async fn insert_failed_event(&self, _entry: &WalEntry, _reason: &str) -> Result<(), String> {
            self.failed_events.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        async fn insert_event(&self, _payload: &[u8], transaction_id: &str) -> Result<(), String> {
            if self.inserts_fail {
                return Err("db unavailable".to_string());
            }
            self.committed
                .lock()
                .unwrap()
                .insert(transaction_id.to_string());
            Ok(())
        }
    }

    fn fake_store(inserts_fail: bool) -> FakeStore {
        FakeStore {
            committed: std::sync::Mutex::new(Default::default()),
            failed_events: AtomicUsize::new(0),
            inserts_fail,
        }
    }

    #[tokio::test]
    async fn consumer_recovery_commits_a_fresh_entry() {
        let wal = Arc::new(ConsumerWal::new(
            Arc::new(MemoryStore::new()),
            WalConfig::default(),
        ));
        wal.write(b"payload".to_vec(), "txn-1".into(), None, None)
            .await
            .unwrap();

        let store = fake_store(false);
        let counters = recover_on_startup(wal.as_ref(), &store, 10, "recovery").await;

        assert_eq!(counters.recovered, 1);
        assert_eq!(counters.already_committed, 0);
        assert!(wal.get_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn consumer_recovery_treats_already_committed_as_its_own_bucket() {
        let wal = Arc::new(ConsumerWal::new(
            Arc::new(MemoryStore::new()),
            WalConfig::default(),
        ));
        wal.write(b"payload".to_vec(), "txn-2".into(), None, None)
            .await
            .unwrap();

        let store = fake_store(false);
        store.committed.lock().unwrap().insert("txn-2".to_string());

        let counters = recover_on_startup(wal.as_ref(), &store, 10, "recovery").await;

        assert_eq!(counters.already_committed, 1);
        assert_eq!(counters.recovered, 0);
        assert!(wal.get_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn consumer_recovery_marks_failed_past_max_retries_with_audit_record() {
        let wal = Arc::new(ConsumerWal::new(
            Arc::new(MemoryStore::new()),
            WalConfig::default(),
        ));
        let id = wal
            .write(b"payload".to_vec(), "txn-3".into(), None, None)
            .await
            .unwrap();
        for _ in 0..10 {
            wal.update_attempt(id, "failure".into()).await.unwrap();
        }

        let store = fake_store(false);
        let counters = recover_on_startup(wal.as_ref(), &store, 10, "recovery").await;

        assert_eq!(counters.max_retried, 1);
        assert_eq!(store.failed_events.load(Ordering::Relaxed), 1);
        assert_eq!(wal.stats().await.unwrap().failed_count, 1);
    }

    #[tokio::test]
    async fn consumer_recovery_leaves_failed_insert_pending() {
        let wal = Arc::new(ConsumerWal::new(
            Arc::new(MemoryStore::new()),
            WalConfig::default(),
        ));
        wal.write(b"payload".to_vec(), "txn-4".into(), None, None)
            .await
            .unwrap();

        let store = fake_store(true);
        let counters = recover_on_startup(wal.as_ref(), &store, 10, "recovery").await;

        assert_eq!(counters.failed, 1);
        assert_eq!(wal.get_pending().await.unwrap().len(), 1);
    }
}
