#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-compactor** – Background compactor.
//!
//! Per tick: delete every `confirmed:` entry in bounded-size transactions,
//! sweep `pending:` entries that have aged past their TTL, then run the
//! store's value-log GC repeatedly until it signals nothing more to
//! rewrite. `run_now` is exposed for test/administrative use and shares
//! the same execution lock as the ticker, so the two are never concurrent
//! — the same `tokio::sync::Mutex`-guarded run/stop shape `cg-retry` uses
//! for its own background loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use cg_store_core::{EntryStore, StoreError};
use cg_types::{WalEntry, WalEntryState};
use chrono::Utc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Tunables for a compactor instance.
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// How often the compactor ticks.
    pub compact_interval: StdDuration,
    /// TTL applied to `pending:` entries during the sweep.
    pub ttl: chrono::Duration,
    /// Maximum keys deleted per KV transaction (KV transaction-size limit).
    pub batch_size: usize,
    /// Safety bound on value-log GC iterations per tick, in case a backend
    /// never signals "no rewrite possible".
    pub max_gc_iterations: u32,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            compact_interval: StdDuration::from_secs(60),
            ttl: chrono::Duration::hours(24),
            batch_size: 100,
            max_gc_iterations: 1000,
        }
    }
}

/// Cumulative compactor outcome counters.
#[derive(Debug, Default)]
pub struct CompactorCounters {
    /// `confirmed:` entries deleted.
    pub confirmed_deleted: AtomicU64,
    /// `pending:` entries deleted for exceeding TTL.
    pub pending_expired_deleted: AtomicU64,
    /// `pending:` entries skipped because they failed to parse.
    pub pending_skipped_unparseable: AtomicU64,
    /// Total value-log GC rewrite iterations performed.
    pub gc_iterations: AtomicU64,
}

/// A snapshot of [`CompactorCounters`] at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactorCountersSnapshot {
    /// See [`CompactorCounters::confirmed_deleted`].
    pub confirmed_deleted: u64,
    /// See [`CompactorCounters::pending_expired_deleted`].
    pub pending_expired_deleted: u64,
    /// See [`CompactorCounters::pending_skipped_unparseable`].
    pub pending_skipped_unparseable: u64,
    /// See [`CompactorCounters::gc_iterations`].
    pub gc_iterations: u64,
}

impl CompactorCounters {
    fn snapshot(&self) -> CompactorCountersSnapshot {
        CompactorCountersSnapshot {
            confirmed_deleted: self.confirmed_deleted.load(Ordering::Relaxed),
            pending_expired_deleted: self.pending_expired_deleted.load(Ordering::Relaxed),
            pending_skipped_unparseable: self.pending_skipped_unparseable.load(Ordering::Relaxed),
            gc_iterations: self.gc_iterations.load(Ordering::Relaxed),
        }
    }
}

async fn delete_in_batches<S: EntryStore>(
    store: &S,
    keys: Vec<String>,
    batch_size: usize,
) -> Result<u64, StoreError> {
    let mut deleted = 0u64;
    for chunk in keys.chunks(batch_size.max(1)) {
        let owned: Vec<String> = chunk.to_vec();
        store.transaction(Box::new(move |txn| {
            for key in &owned {
                txn.remove(key)?;
            }
            Ok(())
        }))?;
        deleted += chunk.len() as u64;
    }
    Ok(deleted)
}

struct RunningHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Background compactor over a single [`EntryStore`]-backed WAL keyspace.
pub struct Compactor<S: EntryStore> {
    store: Arc<S>,
    config: CompactorConfig,
    counters: Arc<CompactorCounters>,
    run_lock: Mutex<()>,
    running: Mutex<Option<RunningHandle>>,
}

impl<S: EntryStore + 'static> Compactor<S> {
    /// Build a new, not-yet-started compactor.
    pub fn new(store: Arc<S>, config: CompactorConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            counters: Arc::new(CompactorCounters::default()),
            run_lock: Mutex::new(()),
            running: Mutex::new(None),
        })
    }

    /// Cumulative outcome counters.
    pub fn counters(&self) -> CompactorCountersSnapshot {
        self.counters.snapshot()
    }

    /// Idempotent: a second `start` while already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let this = Arc::clone(self);
        let join = tokio::spawn(async move { this.run(shutdown_rx).await });
        *running = Some(RunningHandle { shutdown_tx, join });
    }

    /// Idempotent: signals the worker to stop and blocks until it has
    /// fully exited.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(handle) = running.take() {
            let _ = handle.shutdown_tx.send(());
            let _ = handle.join.await;
        }
    }

    /// Run one compaction pass immediately. Safe to call concurrently with
    /// the background ticker and with arbitrary concurrent writers — the
    /// two share one execution lock, and deletions go through the store's
    /// own transactions.
    pub async fn run_now(&self) -> CompactorCountersSnapshot {
        let _guard = self.run_lock.lock().await;
        self.compact_once().await
    }

    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.compact_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let _guard = self.run_lock.lock().await;
                    self.compact_once().await;
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }
    }

    async fn compact_once(&self) -> CompactorCountersSnapshot {
        if let Err(e) = self.reclaim_confirmed().await {
            tracing::error!(error = %e, "compactor: failed to reclaim confirmed entries");
        }
        if let Err(e) = self.sweep_expired_pending().await {
            tracing::error!(error = %e, "compactor: failed to sweep expired pending entries");
        }
        self.run_value_log_gc().await;
        self.counters.snapshot()
    }

    async fn reclaim_confirmed(&self) -> Result<(), StoreError> {
        let prefix = format!("{}:", WalEntryState::Confirmed.key_prefix());
        let keys: Vec<String> = self
            .store
            .scan_prefix(&prefix)
            .await?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let deleted = delete_in_batches(self.store.as_ref(), keys, self.config.batch_size).await?;
        self.counters
            .confirmed_deleted
            .fetch_add(deleted, Ordering::Relaxed);
        Ok(())
    }

    async fn sweep_expired_pending(&self) -> Result<(), StoreError> {
        let prefix = format!("{}:", WalEntryState::Pending.key_prefix());
        let now = Utc::now();
        let scanned = self.store.scan_prefix(&prefix).await?;

        let mut expired_keys = Vec::new();
        for (key, bytes) in scanned {
            match serde_json::from_slice::<WalEntry>(&bytes) {
                Ok(entry) => {
                    if entry.age(now) > self.config.ttl {
                        expired_keys.push(key);
                    }
                }
                Err(_) => {
                    // Already corrupt and invisible under native TTL; skip.
                    self.counters
                        .pending_skipped_unparseable
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let deleted =
            delete_in_batches(self.store.as_ref(), expired_keys, self.config.batch_size).await?;
        self.counters
            .pending_expired_deleted
            .fetch_add(deleted, Ordering::Relaxed);
        Ok(())
    }

    async fn run_value_log_gc(&self) {
        for _ in 0..self.config.max_gc_iterations {
            match self.store.run_value_log_gc().await {
                Ok(true) => {
                    self.counters.gc_iterations.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "compactor: value-log gc failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_store_memory::MemoryStore;

    fn key(state: WalEntryState, id: uuid::Uuid) -> String {
        format!("{}:{id}", state.key_prefix())
    }

    async fn put_entry(store: &MemoryStore, state: WalEntryState, entry: &WalEntry) {
        let bytes = serde_json::to_vec(entry).unwrap();
        store.put(&key(state, entry.id), bytes).await.unwrap();
    }

    #[tokio::test]
    async fn confirmed_entries_are_reclaimed() {
        let store = Arc::new(MemoryStore::new());
        let entry = WalEntry::new_pending(b"payload".to_vec(), Utc::now());
        put_entry(&store, WalEntryState::Confirmed, &entry).await;

        let compactor = Compactor::new(store.clone(), CompactorConfig::default());
        let counters = compactor.run_now().await;

        assert_eq!(counters.confirmed_deleted, 1);
        assert_eq!(
            store
                .scan_prefix(&format!("{}:", WalEntryState::Confirmed.key_prefix()))
                .await
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn expired_pending_entries_are_deleted_fresh_ones_kept() {
        let store = Arc::new(MemoryStore::new());
        let stale = WalEntry::new_pending(b"stale".to_vec(), Utc::now() - chrono::Duration::hours(48));
        let fresh = WalEntry::new_pending(b"fresh".to_vec(), Utc::now());
        put_entry(&store, WalEntryState::Pending, &stale).await;
        put_entry(&store, WalEntryState::Pending, &fresh).await;

        let compactor = Compactor::new(
            store.clone(),
            CompactorConfig {
                ttl: chrono::Duration::hours(24),
                ..CompactorConfig::default()
            },
        );
        let counters = compactor.run_now().await;

        assert_eq!(counters.pending_expired_deleted, 1);
        let remaining = store
            .scan_prefix(&format!("{}:", WalEntryState::Pending.key_prefix()))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, key(WalEntryState::Pending, fresh.id));
    }

    #[tokio::test]
    async fn unparseable_pending_entries_are_skipped_not_deleted() {
        let store = Arc::new(MemoryStore::new());
        store
            .put("pending:garbage", b"not json".to_vec())
            .await
            .unwrap();

        let compactor = Compactor::new(store.clone(), CompactorConfig::default());
        let counters = compactor.run_now().await;

        assert_eq!(counters.pending_skipped_unparseable, 1);
        assert_eq!(counters.pending_expired_deleted, 0);
        assert_eq!(
            store.get("pending:garbage").await.unwrap(),
            Some(b"not json".to_vec())
        );
    }

    #[tokio::test]
    async fn batches_respect_the_configured_size() {
        let store = Arc::new(MemoryStore::new());
        for _ in 0..250 {
            let entry = WalEntry::new_pending(b"x".to_vec(), Utc::now());
            put_entry(&store, WalEntryState::Confirmed, &entry).await;
        }

        let compactor = Compactor::new(
            store.clone(),
            CompactorConfig {
                batch_size: 100,
                ..CompactorConfig::default()
            },
        );
        let counters = compactor.run_now().await;
        assert_eq!(counters.confirmed_deleted, 250);
    }

    #[tokio::test]
    async fn start_and_stop_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let compactor = Compactor::new(
            store,
            CompactorConfig {
                compact_interval: StdDuration::from_millis(10),
                ..CompactorConfig::default()
            },
        );
        compactor.start().await;
        compactor.start().await;
        compactor.stop().await;
        compactor.stop().await;
    }
}
