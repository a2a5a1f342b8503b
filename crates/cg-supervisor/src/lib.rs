#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-supervisor** – hierarchical process supervisor.
//!
//! A three-layer tree — a root ("cartographus") owning a data layer (WAL
//! retry loop, compactor), a messaging layer (bus I/O, sync managers,
//! WebSocket hub, consumer driver), and an API layer (HTTP server) — with
//! each layer itself a [`Supervisor`] carrying its own exponentially
//! decaying failure counter. A restart storm in one layer backs off and
//! pauses only that layer; siblings keep running. A [`Supervisor`] is
//! itself a [`Service`], so the root nests the three layers the same way
//! each layer nests its own services.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome a supervised service's [`Service::serve`] call resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Clean stop; do not restart.
    Stopped,
    /// Clean stop; propagate upward and shut down the owning supervisor
    /// (and, transitively, every other service it supervises).
    TerminateSupervisorTree,
}

/// A long-running component a [`Supervisor`] owns and restarts on
/// failure.
#[async_trait]
pub trait Service: Send + Sync {
    /// A human-readable name, used in logs and shutdown reporting.
    fn name(&self) -> &str;

    /// Run until `cancel` fires or this instance fails.
    ///
    /// `cancel` firing and then `serve` returning `Ok(_)` is always a
    /// graceful stop, never counted as a failure, regardless of which
    /// [`ServiceOutcome`] is returned. Returning `Err` while `cancel` has
    /// not fired is a failure and triggers a restart, subject to the
    /// owning supervisor's failure decay and backoff.
    async fn serve(&self, cancel: CancellationToken) -> anyhow::Result<ServiceOutcome>;
}

/// Errors a [`Supervisor`] operation can return.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// No service is registered under that token.
    #[error("no service registered for this token")]
    UnknownService,
    /// The service panicked while being removed or shut down.
    #[error("service {0} panicked during shutdown: {1}")]
    Panicked(String, String),
    /// The service did not stop within its shutdown timeout and was
    /// forcibly aborted.
    #[error("service {0} did not stop within its shutdown timeout")]
    ShutdownTimedOut(String),
}

/// Identifies a service registered with a [`Supervisor`], for later
/// targeted removal via [`Supervisor::remove_and_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceToken(Uuid);

/// Tuning for one supervisor layer.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Normalized failure count at which restarts start pausing for
    /// [`SupervisorConfig::failure_backoff`] before each attempt.
    pub failure_threshold: f64,
    /// Half-life the layer's failure counter decays toward zero at.
    pub failure_decay: Duration,
    /// Pause applied before a restart once the threshold is crossed.
    pub failure_backoff: Duration,
    /// Bound on how long a service is given to stop during shutdown
    /// before it's forcibly aborted.
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5.0,
            failure_decay: Duration::from_secs(30),
            failure_backoff: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// An exponentially decaying failure count, shared by every service in
/// one supervisor layer. A failure raises it by 1; it decays toward zero
/// with the configured half-life between events, so an isolated blip
/// forgives itself while a sustained storm keeps crossing the threshold.
struct FailureCounter {
    state: Mutex<(f64, Instant)>,
    half_life: Duration,
}

impl FailureCounter {
    fn new(half_life: Duration) -> Self {
        Self {
            state: Mutex::new((0.0, Instant::now())),
            half_life,
        }
    }

    fn decay(value: f64, elapsed: Duration, half_life: Duration) -> f64 {
        if half_life.is_zero() {
            return value;
        }
        let exponent = elapsed.as_secs_f64() / half_life.as_secs_f64();
        value * 0.5f64.powf(exponent)
    }

    async fn record_failure(&self) -> f64 {
        let mut state = self.state.lock().await;
        let decayed = Self::decay(state.0, state.1.elapsed(), self.half_life);
        let updated = decayed + 1.0;
        *state = (updated, Instant::now());
        updated
    }

    async fn current(&self) -> f64 {
        let state = self.state.lock().await;
        Self::decay(state.0, state.1.elapsed(), self.half_life)
    }
}

struct ChildHandle {
    name: String,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// One layer of the supervisor tree: a bounded-restart, failure-isolated
/// owner of a set of [`Service`]s.
///
/// A `Supervisor` is itself a [`Service`] (its `serve` runs until
/// cancelled, or until a child signals [`ServiceOutcome::TerminateSupervisorTree`]),
/// so the root layer supervises the data/messaging/API layers exactly the
/// way each layer supervises its own services.
pub struct Supervisor {
    name: String,
    config: SupervisorConfig,
    failures: Arc<FailureCounter>,
    children: Arc<DashMap<ServiceToken, ChildHandle>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Create a new, empty supervisor layer.
    pub fn new(name: impl Into<String>, config: SupervisorConfig) -> Self {
        Self {
            failures: Arc::new(FailureCounter::new(config.failure_decay)),
            children: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            name: name.into(),
            config,
        }
    }

    /// This layer's name (`"cartographus"`, `"data"`, `"messaging"`,
    /// `"api"`, ...).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The layer's current, decayed failure count.
    pub async fn failure_count(&self) -> f64 {
        self.failures.current().await
    }

    /// How many services are currently registered (running or mid-restart).
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Register `service` and start supervising it: run it, and if it
    /// fails, restart it subject to this layer's failure decay/backoff,
    /// until it stops cleanly, is removed, or this layer shuts down.
    pub fn add_service(&self, service: Arc<dyn Service>) -> ServiceToken {
        let token = ServiceToken(Uuid::new_v4());
        let child_cancel = self.shutdown.child_token();
        let task_cancel = child_cancel.clone();
        let failures = self.failures.clone();
        let config = self.config.clone();
        let layer_shutdown = self.shutdown.clone();
        let name = service.name().to_string();

        let handle = tokio::spawn(async move {
            run_supervised(service, task_cancel, failures, config, layer_shutdown).await;
        });

        self.children.insert(
            token,
            ChildHandle {
                name,
                handle,
                cancel: child_cancel,
            },
        );
        token
    }

    /// Cancel and wait for one specific service to stop, up to `timeout`.
    /// On timeout the service's task is forcibly aborted and
    /// [`SupervisorError::ShutdownTimedOut`] is returned; the service is
    /// removed from this layer either way.
    pub async fn remove_and_wait(
        &self,
        token: ServiceToken,
        timeout: Duration,
    ) -> Result<(), SupervisorError> {
        let Some((_, child)) = self.children.remove(&token) else {
            return Err(SupervisorError::UnknownService);
        };
        child.cancel.cancel();
        let abort_handle = child.handle.abort_handle();

        match tokio::time::timeout(timeout, child.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_error)) if join_error.is_cancelled() => Ok(()),
            Ok(Err(join_error)) => Err(SupervisorError::Panicked(child.name, join_error.to_string())),
            Err(_) => {
                abort_handle.abort();
                Err(SupervisorError::ShutdownTimedOut(child.name))
            }
        }
    }

    /// Shut down every currently-registered service, each bounded by this
    /// layer's configured [`SupervisorConfig::shutdown_timeout`]. Returns
    /// the names of any services that had to be forcibly aborted.
    /// Idempotent: calling it again with nothing left to stop is a no-op.
    pub async fn shutdown(&self) -> Vec<String> {
        self.shutdown.cancel();
        let tokens: Vec<ServiceToken> = self.children.iter().map(|entry| *entry.key()).collect();

        let mut unstopped = Vec::new();
        for token in tokens {
            match self
                .remove_and_wait(token, self.config.shutdown_timeout)
                .await
            {
                Ok(()) => {}
                Err(SupervisorError::ShutdownTimedOut(name)) => unstopped.push(name),
                Err(SupervisorError::Panicked(name, reason)) => {
                    tracing::warn!(service = %name, reason = %reason, "service panicked during shutdown");
                }
                Err(SupervisorError::UnknownService) => unreachable!("token just read from children"),
            }
        }
        unstopped
    }
}

async fn run_supervised(
    service: Arc<dyn Service>,
    cancel: CancellationToken,
    failures: Arc<FailureCounter>,
    config: SupervisorConfig,
    layer_shutdown: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        match service.serve(cancel.clone()).await {
            Ok(ServiceOutcome::Stopped) => {
                tracing::debug!(service = service.name(), "service stopped cleanly");
                return;
            }
            Ok(ServiceOutcome::TerminateSupervisorTree) => {
                tracing::warn!(service = service.name(), "service requested supervisor tree termination");
                layer_shutdown.cancel();
                return;
            }
            Err(error) => {
                if cancel.is_cancelled() {
                    return;
                }
                tracing::warn!(service = service.name(), error = %error, "service failed, scheduling restart");
                let count = failures.record_failure().await;
                if count >= config.failure_threshold {
                    tracing::warn!(
                        service = service.name(),
                        failures = count,
                        "failure threshold crossed, backing off before restart"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(config.failure_backoff) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Service for Supervisor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn serve(&self, cancel: CancellationToken) -> anyhow::Result<ServiceOutcome> {
        tokio::select! {
            _ = cancel.cancelled() => {
                self.shutdown().await;
                Ok(ServiceOutcome::Stopped)
            }
            _ = self.shutdown.cancelled() => {
                self.shutdown().await;
                Ok(ServiceOutcome::TerminateSupervisorTree)
            }
        }
    }
}

/// The three-layer tree: a root supervisor (`"cartographus"`) owning
/// independently-configured data, messaging, and API layers.
pub struct SupervisorTree {
    /// The top-level supervisor; its `serve` call is the whole tree's
    /// run loop.
    pub root: Arc<Supervisor>,
    /// WAL retry loop, compactor.
    pub data: Arc<Supervisor>,
    /// Bus I/O, sync managers, WebSocket hub, consumer driver.
    pub messaging: Arc<Supervisor>,
    /// HTTP server.
    pub api: Arc<Supervisor>,
}

impl SupervisorTree {
    /// Build the tree. Every layer shares the same [`SupervisorConfig`];
    /// construct layers individually via [`Supervisor::new`] and nest
    /// them by hand if layers need different tuning.
    pub fn new(config: SupervisorConfig) -> Self {
        let root = Arc::new(Supervisor::new("cartographus", config.clone()));
        let data = Arc::new(Supervisor::new("data", config.clone()));
        let messaging = Arc::new(Supervisor::new("messaging", config.clone()));
        let api = Arc::new(Supervisor::new("api", config));

        root.add_service(data.clone());
        root.add_service(messaging.clone());
        root.add_service(api.clone());

        Self {
            root,
            data,
            messaging,
            api,
        }
    }

    /// Run the whole tree until `cancel` fires or a layer propagates
    /// [`ServiceOutcome::TerminateSupervisorTree`] all the way to the
    /// root.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<ServiceOutcome> {
        self.root.serve(cancel).await
    }
}
