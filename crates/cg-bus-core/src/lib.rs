#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-bus-core** – External collaborator traits consumed by the WAL
//! layer, plus a lightweight in-memory event bus used for ingress
//! live-push fan-out and for tests.
//!
//! The message bus itself and the analytical store are external systems;
//! this crate only defines the narrow capability traits the WAL engine
//! needs from them, mirroring the pack's convention of small `async_trait`
//! seams (e.g. `toka_store_core::StorageBackend`) rather than open trait
//! hierarchies.

use std::sync::Arc;

use async_trait::async_trait;
use cg_types::WalEntry;
use tokio::sync::broadcast;

//─────────────────────────────
//  Publisher (consumed by P-WAL retry/recovery)
//─────────────────────────────

/// Sink the producer WAL publishes confirmed-durable entries through.
///
/// Implementations MUST be retry-safe: the retry loop and the recovery
/// driver may resubmit the same entry after a crash or a transient
/// failure, so `publish_entry` must tolerate being called more than once
/// for the same payload.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `entry`'s payload to the downstream bus.
    async fn publish_entry(&self, entry: &WalEntry) -> anyhow::Result<()>;
}

//─────────────────────────────
//  Recovery callback (consumed by C-WAL recovery)
//─────────────────────────────

/// Collaborator the consumer WAL's recovery driver and retry loop use to
/// reach the analytical store.
#[async_trait]
pub trait RecoveryCallback: Send + Sync {
    /// Whether `transaction_id` has already been successfully inserted.
    async fn transaction_id_exists(&self, transaction_id: &str) -> anyhow::Result<bool>;

    /// Insert `payload` under `transaction_id`. MUST be idempotent on
    /// `transaction_id` (insert-or-ignore semantics).
    async fn insert_event(&self, payload: &[u8], transaction_id: &str) -> anyhow::Result<()>;

    /// Record a terminally failed entry in the failed-events graveyard.
    async fn insert_failed_event(&self, entry: &WalEntry, reason: &str) -> anyhow::Result<()>;
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by bus-facing operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The downstream bus rejected or could not accept the publish.
    #[error("publish failed: {0}")]
    PublishFailed(String),
}

//─────────────────────────────
//  In-memory live event bus (ingress fan-out, live push)
//─────────────────────────────

/// Default ring-buffer capacity for the in-memory live event bus.
const DEFAULT_BROADCAST_SIZE: usize = 1024;

/// Lightweight publish/subscribe channel used to fan live-push ingress
/// events (webhooks, WebSocket frames) out to whatever is driving
/// ingestion into the producer WAL. Carries no persistence or I/O
/// concerns of its own.
#[derive(Clone)]
pub struct LiveEventBus<T: Clone + Send + Sync + 'static> {
    tx: Arc<broadcast::Sender<T>>,
}

impl<T: Clone + Send + Sync + 'static> Default for LiveEventBus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_SIZE)
    }
}

impl<T: Clone + Send + Sync + 'static> LiveEventBus<T> {
    /// Create a new bus with the given ring-buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a value to all current subscribers. Slow or absent
    /// subscribers do not block the publisher; they may miss values if
    /// the ring buffer overflows.
    pub fn publish(&self, value: T) {
        let _ = self.tx.send(value);
    }

    /// Subscribe to future published values.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_types::PlaybackEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingPublisher {
        calls: Mutex<Vec<uuid::Uuid>>,
        fail_next: AtomicUsize,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish_entry(&self, entry: &WalEntry) -> anyhow::Result<()> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("simulated transient failure");
            }
            self.calls.lock().unwrap().push(entry.id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn publisher_is_retry_safe() {
        let publisher = RecordingPublisher {
            calls: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(1),
        };
        let entry = WalEntry::new_pending(vec![1, 2, 3], chrono::Utc::now());

        assert!(publisher.publish_entry(&entry).await.is_err());
        assert!(publisher.publish_entry(&entry).await.is_ok());
        assert_eq!(publisher.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn live_bus_fans_out_to_subscribers() {
        let bus: LiveEventBus<PlaybackEvent> = LiveEventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let event = PlaybackEvent {
            event_id: uuid::Uuid::new_v4(),
            source: "plex".into(),
            server_id: "srv1".into(),
            user_id: "user1".into(),
            session_key: "sess1".into(),
            media_type: "movie".into(),
            title: "Arrival".into(),
            started_at: chrono::Utc::now(),
            ip_address: "10.0.0.1".into(),
            correlation_key: None,
            grandparent_title: None,
            parent_title: None,
            season_number: None,
            episode_number: None,
            video_resolution: None,
            video_codec: None,
            audio_codec: None,
            bitrate: None,
            transcode_decision: None,
            machine_id: None,
            player: None,
            platform: None,
            stopped_at: None,
        };

        bus.publish(event.clone());
        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }
}
