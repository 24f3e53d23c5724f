// src/main.rs - plotter queue host entry point
use clap::Parser;
use plotq_rs::device::DeviceController;
use plotq_rs::file_manager::FileManager;
use plotq_rs::host::{PlotterHost, VERSION};
use plotq_rs::queue::QueueManager;
use plotq_rs::store::SqliteJobStore;
use plotq_rs::web::{create_router, AppStateInner};
use plotq_rs::worker::DispatchWorker;
use plotq_shared::config::{load_config, Config};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

const DEFAULT_CONFIG: &str = "plotq.toml";

#[derive(Parser, Debug)]
#[command(name = "plotq-host", version, about = "Queue and plot SVG jobs on a pen plotter")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn read_config(cli: &Cli) -> Result<Config, BoxError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None if PathBuf::from(DEFAULT_CONFIG).exists() => load_config(DEFAULT_CONFIG)?,
        None => Config::default(),
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let config = read_config(&cli)?;

    let level = tracing::Level::from_str(&config.service.log_level).unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("Starting {}", config.service.name);
    tracing::info!("Version: {}", VERSION);
    tracing::info!("Uploads: {}", config.storage.uploads_dir.display());
    tracing::info!("Database: {}", config.storage.database_path.display());

    let files = FileManager::new(&config.storage.uploads_dir);
    files.ensure_dir().await.map_err(|e| {
        tracing::error!("Failed to create uploads directory: {}", e);
        Box::new(e) as BoxError
    })?;
    let store = SqliteJobStore::open(&config.storage.database_path).map_err(|e| {
        tracing::error!("Failed to open job database: {}", e);
        Box::new(e) as BoxError
    })?;

    let queue = QueueManager::new(Arc::new(store), files);
    let device = DeviceController::from_config(&config.device);
    let host = Arc::new(PlotterHost::new(queue, device));

    let recovered = host.recover_orphans(config.queue.orphan_policy).await?;
    if recovered > 0 {
        tracing::warn!("Settled {} job(s) interrupted by the previous run", recovered);
    }

    let connection = host.check_connection().await;
    if !connection.connected {
        tracing::warn!("{} not connected; jobs stay queued until it responds", config.device.model);
    }

    let mut worker = DispatchWorker::new(host.clone(), config.queue.poll_interval());
    worker.start();

    let state = Arc::new(AppStateInner::from_config(host, &config));
    let cleanup = state
        .rate_limiter
        .as_ref()
        .map(|limiter| limiter.spawn_cleanup(limiter.window));
    let app = create_router(state, &config.api.prefix);

    let listener = tokio::net::TcpListener::bind(&config.api.bind).await.map_err(|e| {
        tracing::error!("Failed to bind {}: {}", config.api.bind, e);
        Box::new(e) as BoxError
    })?;
    tracing::info!("API listening on {}", config.api.bind);

    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            tracing::info!("Shutdown signal received");
        })
        .await;

    worker.stop().await;
    if let Some(cleanup) = cleanup {
        cleanup.abort();
    }
    tracing::info!("Shutting down {}", config.service.name);
    served?;
    Ok(())
}
