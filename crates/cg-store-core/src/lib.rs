#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-store-core** – Durable KV store abstraction.
//!
//! The embedded key-value engine itself is an external dependency; this
//! crate only defines the narrow seam the WAL engine needs from it —
//! single- and
//! multi-key ACID transactions, point reads/writes, and prefix-range
//! snapshot scans — mirroring the pack's convention of a small
//! `async_trait` abstraction in front of a storage backend (grounded on
//! the shape of `toka_store_core::StorageBackend`/`WriteAheadLog`, stripped
//! of everything specific to causal-hash event chains).
//!
//! Per-entry TTL (it attaches only to `pending:` keys) is not a
//! capability of the underlying engine; it is enforced above this
//! layer, by the retry loop, recovery driver and compactor comparing an
//! entry's `created_at` against a configured duration. This crate only
//! carries entries faithfully between those checks.

use async_trait::async_trait;

/// Errors surfaced by a [`EntryStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying engine reported an I/O or corruption error.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A transaction closure aborted itself (e.g. a precondition failed).
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// A key expected to exist for a transition was not found.
    #[error("key not found: {0}")]
    NotFound(String),
}

/// A single logical read/write seen from inside a [`EntryStore::transaction`]
/// closure. All operations performed through one `StoreTransaction` commit
/// or fail together — e.g. deleting a `pending:` key and inserting the
/// corresponding `confirmed:` key happen as one atomic unit.
pub trait StoreTransaction {
    /// Read `key`'s current value inside the transaction.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write `key` to `value` inside the transaction.
    fn insert(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove `key` inside the transaction, if present.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Durable key-value store abstraction the producer and consumer WALs are
/// built on top of.
///
/// Keys are opaque UTF-8 strings; the WAL engine encodes state into a key
/// prefix (`pending:`, `confirmed:`, `failed:`, `lease:`). Implementations
/// only need to be a faithful, crash-consistent KV store — they carry no
/// knowledge of WAL semantics.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Write `key` to `value`, overwriting any existing value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Read `key`'s current value, if present.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove `key`, if present. A no-op if `key` is already absent.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Snapshot-scan every key beginning with `prefix`, returned in key
    /// order. The scan sees a consistent point-in-time view: entries
    /// written after the scan begins may or may not be included, but the
    /// result never reflects a partial write.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Run `f` as a single atomic transaction against the store. If `f`
    /// returns `Err`, none of the reads/writes performed through the
    /// transaction take effect.
    fn transaction(
        &self,
        f: Box<dyn FnOnce(&dyn StoreTransaction) -> Result<(), StoreError> + Send + '_>,
    ) -> Result<(), StoreError>;

    /// Trigger value-log / stale-segment garbage collection, if the
    /// backend has one. Returns `true` if a rewrite happened. Backends
    /// without a value log (e.g. the in-memory store) always return
    /// `Ok(false)`.
    async fn run_value_log_gc(&self) -> Result<bool, StoreError>;

    /// Approximate on-disk size in bytes. Backends with no disk footprint
    /// return `0`.
    fn size_on_disk(&self) -> Result<u64, StoreError>;

    /// Flush any buffered writes to durable storage.
    async fn flush(&self) -> Result<(), StoreError>;
}

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{EntryStore, StoreError, StoreTransaction};
}
