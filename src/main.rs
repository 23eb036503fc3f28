use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use wakegate_engine::{Collaborators, EngineConfig, FsBlobStore, LogAlertSink, LogPublisher, ProtocolEngine};
use wakegate_server::ServerConfig;
use wakegate_settings::{load_settings_from_path, WakegateSettings};
use wakegate_store::Database;
use wakegate_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// Ingestion server for intermittently connected camera devices.
#[derive(Debug, Parser)]
#[command(name = "wakegate", version)]
struct Args {
    /// Settings file (JSON). Missing means compiled defaults.
    #[arg(short, long, default_value = "wakegate.json")]
    config: PathBuf,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
}

fn telemetry_config(settings: &WakegateSettings) -> TelemetryConfig {
    let t = &settings.telemetry;
    TelemetryConfig {
        log_level: parse_level(&t.log_level).unwrap_or(tracing::Level::INFO),
        module_levels: Vec::new(),
        log_db_path: t.log_db_path.as_ref().map(PathBuf::from),
        metrics_enabled: t.metrics_enabled,
        metrics_db_path: t.metrics_db_path.as_ref().map(PathBuf::from),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = load_settings_from_path(&args.config)
        .with_context(|| format!("loading settings from {}", args.config.display()))?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }

    let telemetry = init_telemetry(telemetry_config(&settings)).context("initializing telemetry")?;
    tracing::info!(config = %args.config.display(), "starting wakegate");

    let db_path = PathBuf::from(&settings.storage.database_path);
    let db = Database::open(&db_path).context("opening database")?;

    let collaborators = Collaborators {
        blobs: Arc::new(FsBlobStore::new(&settings.storage.blob_root)),
        publisher: Arc::new(LogPublisher),
        alerts: Arc::new(LogAlertSink),
    };
    let mut engine = ProtocolEngine::new(db, EngineConfig::from_settings(&settings), collaborators);
    let metrics = settings.telemetry.metrics_enabled.then(|| telemetry.metrics());
    if let Some(recorder) = &metrics {
        engine = engine.with_metrics(Arc::clone(recorder));
    }

    let handle = wakegate_server::start(ServerConfig::from_settings(&settings), Arc::new(engine), metrics)
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port(), "wakegate ready");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
