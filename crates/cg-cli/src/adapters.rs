//! Bridges the two places in this binary that need the external message
//! bus / analytical store: the narrow, `anyhow`-based traits
//! [`cg_bus_core::Publisher`]/[`cg_bus_core::RecoveryCallback`] (defined
//! alongside the WAL layer as what it expects from those systems) and the
//! `String`-erroring [`cg_retry::RetrySink`] / [`cg_recovery::ConsumerRecoveryCallback`]
//! the retry loop and recovery driver actually drive. The two pairs exist
//! at different layers for a reason — `cg-bus-core`'s traits are the
//! stable collaborator contract; `cg-retry`/`cg-recovery`'s are the
//! internal worker seam — so this binary is where they're wired together
//! rather than collapsing one into the other.
//!
//! [`LoggingBus`] is the concrete collaborator itself. The real message
//! bus and analytical store are out of scope for this repository; this
//! logs what it would have published or committed so `serve` is runnable
//! end to end.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cg_types::WalEntry;

/// Stand-in external collaborator: logs publishes and commits instead of
/// talking to a real bus or store. Tracks transaction ids it has "seen"
/// so recovery's idempotency check has something real to answer against
/// within one process lifetime.
#[derive(Default)]
pub struct LoggingBus {
    committed: std::sync::Mutex<std::collections::HashSet<String>>,
    publishes: AtomicU64,
}

impl LoggingBus {
    fn record_publish(&self, entry: &WalEntry) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
        tracing::info!(entry_id = %entry.id, bytes = entry.payload.len(), "publishing entry to bus (logging stand-in)");
    }

    fn record_commit(&self, transaction_id: &str) {
        self.committed.lock().unwrap().insert(transaction_id.to_string());
        tracing::info!(%transaction_id, "committing event to analytical store (logging stand-in)");
    }
}

/// Adapts [`LoggingBus`] to [`cg_bus_core::Publisher`], the seam
/// `cg-recovery`'s producer-side pass is written against.
pub struct BusPublisherAdapter(pub std::sync::Arc<LoggingBus>);

#[async_trait]
impl cg_bus_core::Publisher for BusPublisherAdapter {
    async fn publish_entry(&self, entry: &WalEntry) -> anyhow::Result<()> {
        self.0.record_publish(entry);
        Ok(())
    }
}

/// Adapts the same [`BusPublisherAdapter`] shape to [`cg_retry::RetrySink`],
/// the `String`-erroring seam the retry loop actually drives.
#[async_trait]
impl cg_retry::RetrySink for BusPublisherAdapter {
    async fn attempt(&self, entry: &WalEntry) -> Result<(), String> {
        use cg_bus_core::Publisher;
        self.publish_entry(entry).await.map_err(|e| e.to_string())
    }
}

/// Adapts [`LoggingBus`] to [`cg_bus_core::RecoveryCallback`].
pub struct BusRecoveryAdapter(pub std::sync::Arc<LoggingBus>);

#[async_trait]
impl cg_bus_core::RecoveryCallback for BusRecoveryAdapter {
    async fn transaction_id_exists(&self, transaction_id: &str) -> anyhow::Result<bool> {
        Ok(self.0.committed.lock().unwrap().contains(transaction_id))
    }

    async fn insert_event(&self, _payload: &[u8], transaction_id: &str) -> anyhow::Result<()> {
        self.0.record_commit(transaction_id);
        Ok(())
    }

    async fn insert_failed_event(&self, entry: &WalEntry, reason: &str) -> anyhow::Result<()> {
        tracing::warn!(entry_id = %entry.id, %reason, "recording terminally failed entry (logging stand-in)");
        Ok(())
    }
}

#[async_trait]
impl cg_recovery::ConsumerRecoveryCallback for BusRecoveryAdapter {
    async fn transaction_id_exists(&self, transaction_id: &str) -> Result<bool, String> {
        cg_bus_core::RecoveryCallback::transaction_id_exists(self, transaction_id)
            .await
            .map_err(|e| e.to_string())
    }

    async fn insert_failed_event(&self, entry: &WalEntry, reason: &str) -> Result<(), String> {
        cg_bus_core::RecoveryCallback::insert_failed_event(self, entry, reason)
            .await
            .map_err(|e| e.to_string())
    }

    async fn insert_event(&self, payload: &[u8], transaction_id: &str) -> Result<(), String> {
        cg_bus_core::RecoveryCallback::insert_event(self, payload, transaction_id)
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl cg_retry::RetrySink for BusRecoveryAdapter {
    async fn attempt(&self, entry: &WalEntry) -> Result<(), String> {
        let transaction_id = entry.transaction_id.clone().unwrap_or_default();
        cg_bus_core::RecoveryCallback::insert_event(self, &entry.payload, &transaction_id)
            .await
            .map_err(|e| e.to_string())
    }

    async fn on_terminal_failure(&self, entry: &WalEntry, reason: &str) -> Result<(), String> {
        cg_bus_core::RecoveryCallback::insert_failed_event(self, entry, reason)
            .await
            .map_err(|e| e.to_string())
    }
}
