#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-retry** – Background retry loop.
//!
//! One loop per WAL. Each tick takes a pending snapshot, and for every
//! entry: claims the durable lease, expires or terminally fails entries
//! past their limits, checks backoff readiness, then attempts the sink
//! operation under a timeout. Grounded on the task-handle-plus-shutdown-
//! signal lifecycle used by `toka-agent-runtime`'s `AgentProcessManager`
//! (`start_agent`/`stop_agent`: spawn onto a `JoinHandle`, signal
//! cancellation, then await the handle with a bound) — generalized from
//! one-shot agent tasks to a recurring ticker, and from `.abort()` to a
//! cooperative shutdown signal so a tick in flight finishes cleanly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use cg_types::WalEntry;
use cg_wal::WalError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// The subset of producer/consumer WAL operations the retry loop drives.
/// Implemented once per WAL flavor so the loop itself stays agnostic to
/// which kind it is driving (`terminal_fail` is `DeleteEntry` on the
/// producer side, `MarkFailed` on the consumer side).
#[async_trait]
pub trait RetryTarget: Send + Sync {
    /// Snapshot of every pending entry.
    async fn get_pending(&self) -> Result<Vec<WalEntry>, WalError>;
    /// Attempt to claim the durable lease on `entry_id`.
    async fn try_claim_lease(&self, entry_id: Uuid, holder_id: &str) -> Result<bool, WalError>;
    /// Release the durable lease on `entry_id` early (not-yet-ready entries).
    async fn release_lease(&self, entry_id: Uuid) -> Result<(), WalError>;
    /// Delete `entry_id` outright (TTL expiry).
    async fn delete_entry(&self, entry_id: Uuid) -> Result<(), WalError>;
    /// Record a failed attempt against `entry_id`.
    async fn update_attempt(&self, entry_id: Uuid, err_str: String) -> Result<(), WalError>;
    /// Move `entry_id` to its terminal success state.
    async fn confirm(&self, entry_id: Uuid) -> Result<(), WalError>;
    /// Move `entry_id` to its terminal failure state (`MaxRetried`).
    async fn terminal_fail(&self, entry_id: Uuid, reason: String) -> Result<(), WalError>;
    /// The entry TTL this WAL was configured with.
    fn ttl(&self) -> ChronoDuration;
}

/// The operation the retry loop attempts per ready entry: publish a
/// producer entry to the bus, or commit a consumer entry to the
/// analytical store.
#[async_trait]
pub trait RetrySink: Send + Sync {
    /// Attempt delivery of `entry`. `Err` carries a human-readable reason
    /// recorded via `UpdateAttempt`.
    async fn attempt(&self, entry: &WalEntry) -> Result<(), String>;

    /// Called immediately before `terminal_fail` when an entry exceeds
    /// `max_retries`, so a consumer sink can record it in its own
    /// failed-events graveyard before the WAL marks it failed. A no-op by
    /// default; the producer side (whose `terminal_fail` just deletes the
    /// entry) has nothing to record here.
    async fn on_terminal_failure(&self, _entry: &WalEntry, _reason: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Exponential backoff with a saturating ceiling:
/// `min(max_backoff, base * 2^attempts)`, with `attempts > 50` going
/// straight to `max_backoff` to sidestep the power computation entirely.
pub fn backoff(attempts: u32, base: ChronoDuration, max_backoff: ChronoDuration) -> ChronoDuration {
    if attempts > 50 {
        return max_backoff;
    }
    let multiplier = 2i64.saturating_pow(attempts);
    let millis = base.num_milliseconds().saturating_mul(multiplier);
    ChronoDuration::milliseconds(millis.min(max_backoff.num_milliseconds()))
}

/// Tunables for a retry loop instance.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// How often the loop ticks.
    pub retry_interval: StdDuration,
    /// Base backoff unit.
    pub base_backoff: ChronoDuration,
    /// Backoff ceiling.
    pub max_backoff: ChronoDuration,
    /// Attempts at or beyond which an entry is terminally failed.
    pub max_retries: u32,
    /// Bound on a single sink attempt.
    pub attempt_timeout: StdDuration,
    /// Prefix used to build this loop's per-claim holder ids.
    pub holder_id_prefix: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_interval: StdDuration::from_secs(5),
            base_backoff: ChronoDuration::seconds(1),
            max_backoff: ChronoDuration::minutes(5),
            max_retries: 10,
            attempt_timeout: StdDuration::from_secs(10),
            holder_id_prefix: "retry".to_string(),
        }
    }
}

/// Per-tick outcome counts, accumulated across the lifetime of the loop.
#[derive(Debug, Default)]
pub struct RetryCounters {
    /// Entries skipped because their lease was held elsewhere or they
    /// were not yet ready for another attempt.
    pub skipped: AtomicU64,
    /// Entries deleted for exceeding their TTL.
    pub expired: AtomicU64,
    /// Entries terminally failed for exceeding `max_retries`.
    pub max_retried: AtomicU64,
    /// Entries successfully confirmed this attempt.
    pub confirmed: AtomicU64,
    /// Entries whose attempt failed and were rescheduled.
    pub failed: AtomicU64,
}

/// A snapshot of [`RetryCounters`] at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryCountersSnapshot {
    /// See [`RetryCounters::skipped`].
    pub skipped: u64,
    /// See [`RetryCounters::expired`].
    pub expired: u64,
    /// See [`RetryCounters::max_retried`].
    pub max_retried: u64,
    /// See [`RetryCounters::confirmed`].
    pub confirmed: u64,
    /// See [`RetryCounters::failed`].
    pub failed: u64,
}

impl RetryCounters {
    fn snapshot(&self) -> RetryCountersSnapshot {
        RetryCountersSnapshot {
            skipped: self.skipped.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            max_retried: self.max_retried.load(Ordering::Relaxed),
            confirmed: self.confirmed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

struct RunningHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// A single retry loop bound to one [`RetryTarget`]/[`RetrySink`] pair.
///
/// `Start`/`Stop` share one `tokio::sync::Mutex` over the running handle:
/// `Stop` holds that lock across the final `JoinHandle` await, so a `Start`
/// racing a `Stop` naturally waits for the in-flight stop to finish before
/// re-arming.
pub struct RetryLoop<T, K> {
    target: Arc<T>,
    sink: Arc<K>,
    config: RetryConfig,
    counters: Arc<RetryCounters>,
    running: Mutex<Option<RunningHandle>>,
}

impl<T, K> RetryLoop<T, K>
where
    T: RetryTarget + 'static,
    K: RetrySink + 'static,
{
    /// Build a new, not-yet-started retry loop.
    pub fn new(target: Arc<T>, sink: Arc<K>, config: RetryConfig) -> Arc<Self> {
        Arc::new(Self {
            target,
            sink,
            config,
            counters: Arc::new(RetryCounters::default()),
            running: Mutex::new(None),
        })
    }

    /// Cumulative outcome counters.
    pub fn counters(&self) -> RetryCountersSnapshot {
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
    /// fully exited. A no-op if the loop is not running.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(handle) = running.take() {
            let _ = handle.shutdown_tx.send(());
            let _ = handle.join.await;
        }
    }

    /// Run exactly one tick's worth of work immediately, bypassing the
    /// ticker. Exposed for test and administrative use (mirrors the
    /// compactor's `RunNow`).
    pub async fn run_now(&self) {
        self.tick().await;
    }

    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.retry_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }
    }

    async fn tick(&self) {
        let pending = match self.target.get_pending().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "retry loop: failed to load pending snapshot");
                return;
            }
        };

        let now = Utc::now();
        for entry in pending {
            self.process_entry(entry, now).await;
        }
    }

    async fn process_entry(&self, entry: WalEntry, now: DateTime<Utc>) {
        let holder_id = format!("{}-{}", self.config.holder_id_prefix, Uuid::new_v4());

        match self.target.try_claim_lease(entry.id, &holder_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                tracing::warn!(entry_id = %entry.id, error = %e, "retry loop: lease claim failed");
                return;
            }
        }

        if entry.age(now) > self.target.ttl() {
            if let Err(e) = self.target.delete_entry(entry.id).await {
                tracing::warn!(entry_id = %entry.id, error = %e, "retry loop: failed to delete expired entry");
            }
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if entry.attempts >= self.config.max_retries {
            if let Err(e) = self
                .sink
                .on_terminal_failure(&entry, "max_retries_exceeded")
                .await
            {
                tracing::warn!(entry_id = %entry.id, error = %e, "retry loop: on_terminal_failure callback failed");
            }
            if let Err(e) = self
                .target
                .terminal_fail(entry.id, "max_retries_exceeded".to_string())
                .await
            {
                tracing::warn!(entry_id = %entry.id, error = %e, "retry loop: failed to terminally fail entry");
            }
            self.counters.max_retried.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let ready = match entry.last_attempt_at {
            None => true,
            Some(last) => now - last >= backoff(entry.attempts, self.config.base_backoff, self.config.max_backoff),
        };
        if !ready {
            if let Err(e) = self.target.release_lease(entry.id).await {
                tracing::warn!(entry_id = %entry.id, error = %e, "retry loop: failed to release lease early");
            }
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let attempt = tokio::time::timeout(self.config.attempt_timeout, self.sink.attempt(&entry)).await;
        match attempt {
            Ok(Ok(())) => match self.target.confirm(entry.id).await {
                Ok(()) | Err(WalError::NotFound) => {
                    self.counters.confirmed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(entry_id = %entry.id, error = %e, "retry loop: confirm failed");
                }
            },
            Ok(Err(err_str)) => {
                if let Err(e) = self.target.update_attempt(entry.id, err_str).await {
                    tracing::warn!(entry_id = %entry.id, error = %e, "retry loop: update_attempt failed");
                }
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                if let Err(e) = self
                    .target
                    .update_attempt(entry.id, "sink attempt timed out".to_string())
                    .await
                {
                    tracing::warn!(entry_id = %entry.id, error = %e, "retry loop: update_attempt failed");
                }
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Blanket [`RetryTarget`] over any store-backed producer WAL: `terminal_fail`
/// is an outright delete, since the producer side has no `failed:` state.
#[async_trait]
impl<S: cg_store_core::EntryStore> RetryTarget for cg_wal::ProducerWal<S> {
    async fn get_pending(&self) -> Result<Vec<WalEntry>, WalError> {
        cg_wal::ProducerWal::get_pending(self).await
    }
    async fn try_claim_lease(&self, entry_id: Uuid, holder_id: &str) -> Result<bool, WalError> {
        cg_wal::ProducerWal::try_claim_lease(self, entry_id, holder_id).await
    }
    async fn release_lease(&self, entry_id: Uuid) -> Result<(), WalError> {
        cg_wal::ProducerWal::release_lease(self, entry_id).await
    }
    async fn delete_entry(&self, entry_id: Uuid) -> Result<(), WalError> {
        cg_wal::ProducerWal::delete_entry(self, entry_id).await
    }
    async fn update_attempt(&self, entry_id: Uuid, err_str: String) -> Result<(), WalError> {
        cg_wal::ProducerWal::update_attempt(self, entry_id, err_str).await
    }
    async fn confirm(&self, entry_id: Uuid) -> Result<(), WalError> {
        cg_wal::ProducerWal::confirm(self, entry_id).await
    }
    async fn terminal_fail(&self, entry_id: Uuid, _reason: String) -> Result<(), WalError> {
        cg_wal::ProducerWal::delete_entry(self, entry_id).await
    }
    fn ttl(&self) -> ChronoDuration {
        cg_wal::ProducerWal::ttl(self)
    }
}

/// Blanket [`RetryTarget`] over any store-backed consumer WAL: `terminal_fail`
/// moves the entry to `failed:` via `MarkFailed`.
#[async_trait]
impl<S: cg_store_core::EntryStore> RetryTarget for cg_wal::ConsumerWal<S> {
    async fn get_pending(&self) -> Result<Vec<WalEntry>, WalError> {
        cg_wal::ConsumerWal::get_pending(self).await
    }
    async fn try_claim_lease(&self, entry_id: Uuid, holder_id: &str) -> Result<bool, WalError> {
        cg_wal::ConsumerWal::try_claim_lease(self, entry_id, holder_id).await
    }
    async fn release_lease(&self, entry_id: Uuid) -> Result<(), WalError> {
        cg_wal::ConsumerWal::release_lease(self, entry_id).await
    }
    async fn delete_entry(&self, entry_id: Uuid) -> Result<(), WalError> {
        cg_wal::ConsumerWal::delete_entry(self, entry_id).await
    }
    async fn update_attempt(&self, entry_id: Uuid, err_str: String) -> Result<(), WalError> {
        cg_wal::ConsumerWal::update_attempt(self, entry_id, err_str).await
    }
    async fn confirm(&self, entry_id: Uuid) -> Result<(), WalError> {
        cg_wal::ConsumerWal::confirm(self, entry_id).await
    }
    async fn terminal_fail(&self, entry_id: Uuid, reason: String) -> Result<(), WalError> {
        cg_wal::ConsumerWal::mark_failed(self, entry_id, reason).await
    }
    fn ttl(&self) -> ChronoDuration {
        cg_wal::ConsumerWal::ttl(self)
    }
}
