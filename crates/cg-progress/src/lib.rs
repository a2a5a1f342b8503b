#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-progress** – Resumable import progress tracker.
//!
//! A single key, `import:{source}:progress`, holds a JSON-serialized
//! [`ImportStats`]. `load` on a source with no stored checkpoint returns
//! an empty, "unset" `ImportStats` rather than an error — mirroring the
//! zero-`StartTime`-means-no-progress sentinel `ImportStats` already
//! carries. Two implementations share one trait: an in-memory map for
//! tests, and a KV-backed one for production, following the same
//! small-seam-plus-two-drivers shape as `cg-store-core`/`cg-store-memory`/
//! `cg-store-sled`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cg_store_core::{EntryStore, StoreError};
use cg_types::ImportStats;
use tokio::sync::Mutex;

/// Errors a [`ProgressTracker`] implementation can return.
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    /// The underlying store reported an error.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A stored checkpoint failed to deserialize.
    #[error("progress checkpoint (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

fn progress_key(source: &str) -> String {
    format!("import:{source}:progress")
}

/// Resumable checkpoint store for aggregator-DB imports.
#[async_trait]
pub trait ProgressTracker: Send + Sync {
    /// Load the checkpoint for `source`. Returns [`ImportStats::empty`]
    /// when no checkpoint has ever been saved (`is_unset()` is `true`).
    async fn load(&self, source: &str) -> Result<ImportStats, ProgressError>;

    /// Persist `stats` as the new checkpoint for its source, through a
    /// single atomic KV transaction.
    async fn save(&self, stats: &ImportStats) -> Result<(), ProgressError>;

    /// Idempotently clear the checkpoint for `source`.
    async fn clear(&self, source: &str) -> Result<(), ProgressError>;
}

/// In-memory [`ProgressTracker`], for tests and dry runs.
#[derive(Default)]
pub struct InMemoryProgressTracker {
    checkpoints: Mutex<HashMap<String, ImportStats>>,
}

impl InMemoryProgressTracker {
    /// A fresh, empty tracker.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressTracker for InMemoryProgressTracker {
    async fn load(&self, source: &str) -> Result<ImportStats, ProgressError> {
        let checkpoints = self.checkpoints.lock().await;
        Ok(checkpoints
            .get(source)
            .cloned()
            .unwrap_or_else(|| ImportStats::empty(source)))
    }

    async fn save(&self, stats: &ImportStats) -> Result<(), ProgressError> {
        let mut checkpoints = self.checkpoints.lock().await;
        checkpoints.insert(stats.source.clone(), stats.clone());
        Ok(())
    }

    async fn clear(&self, source: &str) -> Result<(), ProgressError> {
        let mut checkpoints = self.checkpoints.lock().await;
        checkpoints.remove(source);
        Ok(())
    }
}

/// KV-backed [`ProgressTracker`] for production use, over any
/// [`EntryStore`].
pub struct KvProgressTracker<S: EntryStore> {
    store: Arc<S>,
}

impl<S: EntryStore> KvProgressTracker<S> {
    /// Wrap `store` as a progress tracker.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: EntryStore> ProgressTracker for KvProgressTracker<S> {
    async fn load(&self, source: &str) -> Result<ImportStats, ProgressError> {
        match self.store.get(&progress_key(source)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(ImportStats::empty(source)),
        }
    }

    async fn save(&self, stats: &ImportStats) -> Result<(), ProgressError> {
        let key = progress_key(&stats.source);
        let bytes = serde_json::to_vec(stats)?;
        self.store
            .transaction(Box::new(move |txn| txn.insert(&key, bytes)))?;
        Ok(())
    }

    async fn clear(&self, source: &str) -> Result<(), ProgressError> {
        let key = progress_key(source);
        self.store
            .transaction(Box::new(move |txn| txn.remove(&key)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_store_memory::MemoryStore;

    fn sample_stats(source: &str) -> ImportStats {
        ImportStats {
            source: source.to_string(),
            last_processed_id: 42,
            start_time: chrono::Utc::now(),
            last_updated: chrono::Utc::now(),
            records_processed: 100,
            records_skipped: 3,
        }
    }

    async fn exercise_round_trip<T: ProgressTracker>(tracker: T) {
        assert!(tracker.load("plex").await.unwrap().is_unset());

        let stats = sample_stats("plex");
        tracker.save(&stats).await.unwrap();
        assert_eq!(tracker.load("plex").await.unwrap(), stats);

        tracker.clear("plex").await.unwrap();
        assert!(tracker.load("plex").await.unwrap().is_unset());
        // clear is idempotent
        tracker.clear("plex").await.unwrap();
    }

    #[tokio::test]
    async fn in_memory_tracker_round_trips() {
        exercise_round_trip(InMemoryProgressTracker::new()).await;
    }

    #[tokio::test]
    async fn kv_tracker_round_trips() {
        exercise_round_trip(KvProgressTracker::new(Arc::new(MemoryStore::new()))).await;
    }

    #[tokio::test]
    async fn separate_sources_do_not_interfere() {
        let tracker = InMemoryProgressTracker::new();
        tracker.save(&sample_stats("plex")).await.unwrap();
        tracker.save(&sample_stats("jellyfin")).await.unwrap();

        assert_eq!(tracker.load("plex").await.unwrap().source, "plex");
        assert_eq!(tracker.load("jellyfin").await.unwrap().source, "jellyfin");

        tracker.clear("plex").await.unwrap();
        assert!(tracker.load("plex").await.unwrap().is_unset());
        assert!(!tracker.load("jellyfin").await.unwrap().is_unset());
    }
}
