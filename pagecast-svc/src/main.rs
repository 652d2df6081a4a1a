//! pagecast-svc - document narration service
//!
//! Accepts paginated documents, streams extraction progress back to the
//! uploader, and narrates each page in the background through a durable job
//! queue. Book progress is derived from page state and exposed for polling.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pagecast_common::config::{
    load_toml_config_or_default, LoggingConfig, RootFolderInitializer, RootFolderResolver,
    DEFAULT_PORT,
};
use pagecast_common::events::EventBus;
use pagecast_common::{Clock, SystemClock};
use pagecast_svc::config::ServiceSettings;
use pagecast_svc::queue::{WorkerPool, WorkerPoolConfig};
use pagecast_svc::services::{DocumentExtractor, FsAudioStore, HttpNarrator};
use pagecast_svc::AppState;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// EventBus buffer before lagging subscribers drop events
const EVENT_BUS_CAPACITY: usize = 256;

/// Command-line arguments for pagecast-svc
#[derive(Parser, Debug)]
#[command(name = "pagecast-svc")]
#[command(about = "Document narration service")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "PAGECAST_PORT")]
    port: Option<u16>,

    /// Root folder holding the database and stored audio
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_toml_config_or_default(args.config.as_deref());

    init_tracing(&config.logging)?;

    info!("Starting pagecast-svc (document narration)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Root folder: CLI → ENV → TOML → default
    let root_folder = RootFolderResolver::new()
        .with_cli_arg(args.root_folder)
        .with_toml(&config)
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;
    info!("Root folder: {}", initializer.root_folder().display());

    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = pagecast_svc::db::init_database_pool(&db_path)
        .await
        .context("Failed to open database")?;

    let settings = ServiceSettings::load(&db_pool)
        .await
        .context("Failed to load runtime settings")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);

    let state = AppState::new(
        db_pool,
        event_bus,
        clock,
        settings.clone(),
        Arc::new(DocumentExtractor::new()),
    );

    let narrator = HttpNarrator::new(&config.narration).context("Failed to build narration client")?;
    let store = FsAudioStore::new(initializer.audio_dir());
    let worker = Arc::new(state.narration_worker(Arc::new(narrator), Arc::new(store)));

    let cancel = CancellationToken::new();
    let pool = WorkerPool::spawn(
        WorkerPoolConfig {
            worker_count: settings.worker_count,
            visibility_timeout: settings.visibility_timeout,
            poll_interval: settings.queue_poll_interval,
        },
        Arc::clone(&state.queue),
        worker,
        Arc::clone(&state.last_error),
        cancel.child_token(),
    );
    let sweep = Arc::clone(&state.sweep).spawn_periodic(settings.sweep_interval, cancel.child_token());

    let app = pagecast_svc::build_router(state);

    let port = args.port.or(config.port).unwrap_or(DEFAULT_PORT);
    let bind_address = config.bind_address.as_deref().unwrap_or("127.0.0.1");
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", bind_address, port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Stopping background work");
    cancel.cancel();
    pool.shutdown().await;
    if let Err(e) = sweep.await {
        warn!("Recovery sweep task ended abnormally: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Registry with an EnvFilter, stderr output, and optionally a log file
///
/// `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let level = logging.level.trim();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "pagecast_svc={0},pagecast_common={0},tower_http={0}",
            level
        ))
    });

    let file_layer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
