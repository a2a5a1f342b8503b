#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-store-memory** – In-memory [`EntryStore`] driver.
//!
//! A fast, non-persistent backend suitable for unit tests and local
//! development, grounded on the old `toka-store-memory` crate's
//! `Arc<RwLock<_>>`-over-collection shape. A `BTreeMap` replaces the
//! `HashMap` the original used, since `scan_prefix` needs key-ordered
//! iteration.

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use cg_store_core::{EntryStore, StoreError, StoreTransaction};

//─────────────────────────────
//  In-memory entry store
//─────────────────────────────

/// An in-memory, non-persistent [`EntryStore`].
///
/// All data is lost when the process terminates; there is no value log to
/// garbage-collect, so `run_value_log_gc` always returns `Ok(false)`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    // Transactions take an exclusive lock so `transaction` observes and
    // mutates a consistent snapshot even under concurrent `put`/`delete`.
    txn_lock: Mutex<()>,
}

impl MemoryStore {
    /// Creates a new, empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored. Useful in tests.
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    /// Whether the store currently holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single staged write, applied only if the whole transaction commits.
enum StagedOp {
    Insert(Vec<u8>),
    Remove,
}

/// Buffers writes in a local diff instead of touching the store directly,
/// so a closure that returns `Err` leaves no trace behind.
struct MemoryTransaction<'a> {
    data: &'a RwLock<BTreeMap<String, Vec<u8>>>,
    staged: Mutex<BTreeMap<String, StagedOp>>,
}

impl MemoryTransaction<'_> {
    fn apply(self) {
        let mut guard = self.data.write().unwrap();
        for (key, op) in self.staged.into_inner().unwrap() {
            match op {
                StagedOp::Insert(value) => {
                    guard.insert(key, value);
                }
                StagedOp::Remove => {
                    guard.remove(&key);
                }
            }
        }
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(op) = self.staged.lock().unwrap().get(key) {
            return Ok(match op {
                StagedOp::Insert(value) => Some(value.clone()),
                StagedOp::Remove => None,
            });
        }
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    fn insert(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.staged
            .lock()
            .unwrap()
            .insert(key.to_string(), StagedOp::Insert(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.staged
            .lock()
            .unwrap()
            .insert(key.to_string(), StagedOp::Remove);
        Ok(())
    }
}

#[async_trait]
impl EntryStore for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.data.write().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let guard = self.data.read().unwrap();
        Ok(guard
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn transaction(
        &self,
        f: Box<dyn FnOnce(&dyn StoreTransaction) -> Result<(), StoreError> + Send + '_>,
    ) -> Result<(), StoreError> {
        // Excludes other transactions from interleaving; the staged diff
        // inside `MemoryTransaction` is what gives an aborted closure
        // no-trace semantics.
        let _guard = self.txn_lock.lock().unwrap();
        let txn = MemoryTransaction {
            data: &self.data,
            staged: Mutex::new(BTreeMap::new()),
        };
        f(&txn)?;
        txn.apply();
        Ok(())
    }

    async fn run_value_log_gc(&self) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn size_on_disk(&self) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = MemoryStore::new();
        store.put("pending:a", b"hello".to_vec()).await.unwrap();
        assert_eq!(store.get("pending:a").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store.delete("missing").await.unwrap();
        store.put("k", b"v".to_vec()).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_prefix_returns_only_matching_keys_in_order() {
        let store = MemoryStore::new();
        store.put("pending:b", b"2".to_vec()).await.unwrap();
        store.put("pending:a", b"1".to_vec()).await.unwrap();
        store.put("confirmed:a", b"x".to_vec()).await.unwrap();

        let scanned = store.scan_prefix("pending:").await.unwrap();
        assert_eq!(
            scanned,
            vec![
                ("pending:a".to_string(), b"1".to_vec()),
                ("pending:b".to_string(), b"2".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn transaction_moves_a_key_atomically() {
        let store = MemoryStore::new();
        store.put("pending:a", b"payload".to_vec()).await.unwrap();

        store
            .transaction(Box::new(|txn| {
                let value = txn
                    .get("pending:a")?
                    .ok_or_else(|| StoreError::NotFound("pending:a".into()))?;
                txn.remove("pending:a")?;
                txn.insert("confirmed:a", value)?;
                Ok(())
            }))
            .unwrap();

        assert_eq!(store.get("pending:a").await.unwrap(), None);
        assert_eq!(store.get("confirmed:a").await.unwrap(), Some(b"payload".to_vec()));
    }

    #[tokio::test]
    async fn aborted_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        store.put("pending:a", b"payload".to_vec()).await.unwrap();

        let result = store.transaction(Box::new(|txn| {
            txn.remove("pending:a")?;
            Err(StoreError::TransactionAborted("simulated".into()))
        }));

        assert!(result.is_err());
        assert_eq!(store.get("pending:a").await.unwrap(), Some(b"payload".to_vec()));
    }
}