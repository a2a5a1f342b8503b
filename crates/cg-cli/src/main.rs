#![forbid(unsafe_code)]

//! **cartographus** – the binary that assembles every in-scope component
//! into a running process.
//!
//! The message bus and analytical store are external collaborators;
//! [`adapters::LoggingBus`] stands in for both here so `serve` is runnable
//! end to end, logging each publish/commit it would otherwise perform
//! against the real systems.

mod adapters;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use adapters::{BusPublisherAdapter, BusRecoveryAdapter};
use anyhow::{Context, Result};
use cg_api::{ApiService, ApiState};
use cg_compactor::Compactor;
use cg_config::AppConfig;
use cg_metrics::PrometheusMetricsSink;
use cg_progress::{KvProgressTracker, ProgressTracker};
use cg_retry::RetryLoop;
use cg_store_sled::SledStore;
use cg_store_sqlite::SqliteBatchReader;
use cg_supervisor::{Service, ServiceOutcome, SupervisorTree};
use cg_wal::{ConsumerWal, ProducerWal};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "cartographus")]
#[command(about = "Durable event pipeline between a media-server message bus and an analytical store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the long-lived pipeline: recovery, retry loops, compactor, and
    /// the HTTP surface, under a three-layer supervisor tree.
    Serve,
    /// Run the database-import ingress flow to completion against an
    /// aggregator's embedded activity database.
    Import {
        /// Logical ingress source name (e.g. `tautulli-import`).
        #[arg(long)]
        source: String,
        /// Path to the aggregator's SQLite database file.
        #[arg(long)]
        db_path: PathBuf,
        /// Validate and normalize without writing to the producer WAL or
        /// advancing progress.
        #[arg(long)]
        dry_run: bool,
        /// Rows read per batch.
        #[arg(long, default_value_t = 500)]
        batch_size: i64,
    },
    /// Print the resumable-import progress for a source.
    Stats {
        /// Logical ingress source name.
        #[arg(long)]
        source: String,
    },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => serve().await,
        Commands::Import { source, db_path, dry_run, batch_size } => {
            import(source, db_path, dry_run, batch_size).await
        }
        Commands::Stats { source } => stats(source).await,
    }
}

async fn serve() -> Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;
    tracing::info!(?config.environment, "starting cartographus");

    let producer_store = Arc::new(
        SledStore::open(&config.producer_wal.path)
            .with_context(|| format!("failed to open producer WAL store at {:?}", config.producer_wal.path))?,
    );
    let consumer_store = Arc::new(
        SledStore::open(&config.consumer_wal.path)
            .with_context(|| format!("failed to open consumer WAL store at {:?}", config.consumer_wal.path))?,
    );

    let producer_wal = Arc::new(ProducerWal::new(Arc::clone(&producer_store), config.producer_wal.to_wal_config()));
    let consumer_wal = Arc::new(ConsumerWal::new(consumer_store, config.consumer_wal.to_wal_config()));

    let bus = Arc::new(adapters::LoggingBus::default());

    let recovery_counters = cg_recovery::recover_pending(
        producer_wal.as_ref(),
        &BusPublisherAdapter(Arc::clone(&bus)),
        config.producer_wal.max_retries,
        "producer-recovery",
    )
    .await;
    tracing::info!(?recovery_counters, "producer WAL recovery complete");

    let consumer_recovery_counters = cg_recovery::recover_on_startup(
        consumer_wal.as_ref(),
        &BusRecoveryAdapter(Arc::clone(&bus)),
        config.consumer_wal.max_retries,
        "consumer-recovery",
    )
    .await;
    tracing::info!(recovery_counters = ?consumer_recovery_counters, "consumer WAL recovery complete");

    let producer_retry = RetryLoop::new(
        Arc::clone(&producer_wal),
        Arc::new(BusPublisherAdapter(Arc::clone(&bus))),
        config.producer_wal.to_retry_config("producer-retry"),
    );
    let consumer_retry = RetryLoop::new(
        Arc::clone(&consumer_wal),
        Arc::new(BusRecoveryAdapter(Arc::clone(&bus))),
        config.consumer_wal.to_retry_config("consumer-retry"),
    );
    let compactor = Compactor::new(Arc::clone(&producer_store), config.producer_wal.to_compactor_config());

    let metrics = Arc::new(PrometheusMetricsSink::new());
    let api_state = ApiState::new(Arc::clone(&metrics), vec![]);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    let tree = SupervisorTree::new(config.supervisor.to_supervisor_config());
    tree.data.add_service(Arc::new(RetryLoopService::new("producer-retry-loop", producer_retry)));
    tree.data.add_service(Arc::new(RetryLoopService::new("consumer-retry-loop", consumer_retry)));
    tree.data.add_service(Arc::new(CompactorService::new("producer-compactor", compactor)));
    tree.api.add_service(Arc::new(ApiService::new(addr, api_state)));

    let cancel = CancellationToken::new();
    let shutdown_signal = {
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        }
    };

    tokio::select! {
        _ = shutdown_signal => {}
        outcome = tree.root.serve(cancel.clone()) => {
            if let Err(error) = outcome {
                tracing::error!(%error, "supervisor tree exited with an error");
            }
        }
    }

    Ok(())
}

async fn import(source: String, db_path: PathBuf, dry_run: bool, batch_size: i64) -> Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;

    let reader = SqliteBatchReader::attach(&db_path)
        .await
        .with_context(|| format!("failed to attach aggregator database at {db_path:?}"))?;
    let wal_store = Arc::new(
        SledStore::open(&config.producer_wal.path)
            .with_context(|| format!("failed to open producer WAL store at {:?}", config.producer_wal.path))?,
    );
    let sink = ProducerWal::new(wal_store, config.producer_wal.to_wal_config());
    let progress_store = Arc::new(
        SledStore::open(&config.producer_wal.path.join("progress"))
            .context("failed to open progress tracker store")?,
    );
    let progress = KvProgressTracker::new(progress_store);

    let importer_config = cg_ingress::ImporterConfig {
        source: source.clone(),
        batch_size,
        configured_resume_id: 0,
        dry_run,
    };
    let importer = cg_ingress::Importer::new(reader, sink, progress, importer_config);
    let stats = importer.run_to_completion().await.context("import failed")?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn stats(source: String) -> Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;
    let progress_store = Arc::new(
        SledStore::open(&config.producer_wal.path.join("progress"))
            .context("failed to open progress tracker store")?,
    );
    let progress = KvProgressTracker::new(progress_store);
    let stats = progress.load(&source).await.context("failed to load progress")?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Wraps a [`RetryLoop`] in the `Service` contract the supervisor tree
/// expects: start on entry, block until cancelled, stop on the way out.
struct RetryLoopService<T, K> {
    name: String,
    inner: Arc<RetryLoop<T, K>>,
}

impl<T, K> RetryLoopService<T, K> {
    fn new(name: &str, inner: Arc<RetryLoop<T, K>>) -> Self {
        Self { name: name.to_string(), inner }
    }
}

#[async_trait::async_trait]
impl<T, K> Service for RetryLoopService<T, K>
where
    T: cg_retry::RetryTarget + 'static,
    K: cg_retry::RetrySink + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn serve(&self, cancel: CancellationToken) -> anyhow::Result<ServiceOutcome> {
        self.inner.start().await;
        cancel.cancelled().await;
        self.inner.stop().await;
        Ok(ServiceOutcome::Stopped)
    }
}

/// Wraps a [`Compactor`] in the same start/wait/stop `Service` shape.
struct CompactorService<S: cg_store_core::EntryStore> {
    name: String,
    inner: Arc<Compactor<S>>,
}

impl<S: cg_store_core::EntryStore> CompactorService<S> {
    fn new(name: &str, inner: Arc<Compactor<S>>) -> Self {
        Self { name: name.to_string(), inner }
    }
}

#[async_trait::async_trait]
impl<S: cg_store_core::EntryStore + 'static> Service for CompactorService<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn serve(&self, cancel: CancellationToken) -> anyhow::Result<ServiceOutcome> {
        self.inner.start().await;
        cancel.cancelled().await;
        self.inner.stop().await;
        Ok(ServiceOutcome::Stopped)
    }
}

