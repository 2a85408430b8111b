//! pxidx server
//!
//! Applies a perpetual-exchange block stream to the indexer store, one
//! atomic transaction per block, and fans committed changes out to a
//! notification webhook.

mod config;
mod server;
mod shutdown;
mod state;

use anyhow::Context;
use clap::Parser;
use config::runtime::{LoadedConfig, SourceKind};
use config::{ConfigLoader, get_database_url};
use kanau::processor::Processor;
use pxidx_core::caches::DerivedStateCaches;
use pxidx_core::entities::schema::{GetSchemaVersion, REQUIRED_SCHEMA_VERSION};
use pxidx_core::events::committed_block_channel;
use pxidx_core::processors::{
    BlockProcessor, BlockSource, HttpBlockSource, IngestionRunner, JsonLinesSource, LogSink,
    NotificationPublisher, NotificationSink, NotifierHandle, Sequencer, WebhookSink,
};
use pxidx_core::store::{BlockStore, MemoryStore, PgStore};
use server::{build_router, run_server};
use shutdown::spawn_signal_handler;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// pxidx - perpetual-exchange indexer ingestion engine
#[derive(Parser, Debug)]
#[command(name = "pxidx-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./pxidx-config.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long, env = "PXIDX_JSON_LOGS", default_value = "false")]
    json_logs: bool,

    /// Apply blocks against an in-memory store instead of Postgres
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    init_tracing(args.json_logs);

    tracing::info!("Starting pxidx-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ConfigLoader::new(&args.config, args.listen)
        .load()
        .map_err(|e| {
            tracing::error!("Failed to load configuration: {}", e);
            e
        })?;
    tracing::info!("Configuration loaded from {:?}", args.config);

    let shutdown_tx = Arc::new(watch::Sender::new(false));
    spawn_signal_handler(shutdown_tx.clone());

    let (store, db_pool) = open_store(&config, args.dry_run).await?;

    // Derived-state caches are rebuilt before the sequencer resumes
    let caches = DerivedStateCaches::new();
    let (block_tx, block_rx) = committed_block_channel();
    let processor = BlockProcessor::new(store.clone(), caches.clone())
        .with_notifier(NotifierHandle::new(block_tx));
    processor
        .refresh_caches()
        .await
        .context("failed to rebuild derived-state caches")?;

    let source: Box<dyn BlockSource> = match &config.source.kind {
        SourceKind::Http(url) => Box::new(HttpBlockSource::new(url.clone())),
        SourceKind::Stdin => Box::new(JsonLinesSource::stdin()),
    };
    let sequencer = Sequencer::resume(
        source,
        store.as_ref(),
        config.ingest.start_height,
        config.source.poll_interval,
    )
    .await
    .context("failed to resume block stream")?;

    // Spawn the notification publisher
    let sink: Arc<dyn NotificationSink> = match &config.notifier.webhook_url {
        Some(url) => {
            tracing::info!("Delivering notifications to {}", url);
            Arc::new(WebhookSink::new(url.clone(), config.notifier.secret.clone()))
        }
        None => {
            tracing::info!("No webhook configured, notifications are only logged");
            Arc::new(LogSink)
        }
    };
    let publisher = NotificationPublisher::new(
        sink,
        block_rx,
        shutdown_tx.subscribe(),
        config.notifier.max_attempts,
    );
    let publisher_handle = tokio::spawn(publisher.run());

    let runner = IngestionRunner::new(
        sequencer,
        processor,
        config.ingest.retry,
        shutdown_tx.subscribe(),
    );

    // Spawn the status server
    let router = build_router(AppState::new(runner.status(), caches.reader()));
    tracing::info!("Starting HTTP server on {}", config.listen);
    let server_handle = tokio::spawn(run_server(router, config.listen, shutdown_tx.subscribe()));

    let result = runner.run().await;

    // Ingestion is over; stop everything else
    shutdown_tx.send_replace(true);
    if let Err(e) = publisher_handle.await {
        tracing::error!("Notification publisher task failed: {}", e);
    }
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("HTTP server failed: {}", e),
        Err(e) => tracing::error!("HTTP server task failed: {}", e),
    }

    if let Some(db_pool) = db_pool {
        tracing::info!("Closing database connections...");
        db_pool.close().await;
    }
    tracing::info!("Server shutdown complete");

    result.map(|_| ()).map_err(Into::into)
}

/// Connect to Postgres and check the schema contract, or open an in-memory
/// store for a dry run.
async fn open_store(
    config: &LoadedConfig,
    dry_run: bool,
) -> anyhow::Result<(Arc<dyn BlockStore>, Option<PgPool>)> {
    if dry_run {
        tracing::warn!("Dry run: blocks are applied to an in-memory store and discarded on exit");
        return Ok((Arc::new(MemoryStore::new()), None));
    }

    // Get database URL from environment
    let database_url = get_database_url().map_err(|e| {
        tracing::error!("DATABASE_URL environment variable not set");
        e
    })?;

    // Create database connection pool
    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    let store = PgStore::new(db_pool.clone());
    let version = store.processor().process(GetSchemaVersion).await?;
    if version != Some(REQUIRED_SCHEMA_VERSION) {
        anyhow::bail!(
            "store schema version {:?} does not match required version {}",
            version,
            REQUIRED_SCHEMA_VERSION
        );
    }
    tracing::info!("Store schema version {} confirmed", REQUIRED_SCHEMA_VERSION);

    Ok((Arc::new(store), Some(db_pool)))
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(json_logs: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
