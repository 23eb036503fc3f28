mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{HistogramSummary, MetricType, MetricsQuery, MetricsRecorder, MetricsSnapshot};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("telemetry database: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("telemetry io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default level. RUST_LOG takes precedence when set.
    pub log_level: Level,
    /// Per-target overrides, e.g. ("wakegate_store", DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// WARN+ events are persisted here when set.
    pub log_db_path: Option<PathBuf>,
    pub metrics_enabled: bool,
    /// Snapshot database. Metrics stay in memory when unset.
    pub metrics_db_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_db_path: None,
            metrics_enabled: true,
            metrics_db_path: None,
        }
    }
}

impl TelemetryConfig {
    fn filter_directives(&self) -> String {
        let mut directives = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            directives.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
        }
        directives
    }
}

/// Handles to the installed sinks. Keep alive for the process lifetime.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.metrics.clone()
    }

    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Parse a level name as written in settings ("info", "WARN", ...).
pub fn parse_level(raw: &str) -> Option<Level> {
    raw.trim().parse().ok()
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_filter(env_filter);

    let log_sink = config
        .log_db_path
        .as_deref()
        .map(SqliteLogSink::open)
        .transpose()?
        .map(Arc::new);
    let sqlite_layer = log_sink.clone().map(SqliteLogLayer::new);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init();

    let metrics = match (&config.metrics_db_path, config.metrics_enabled) {
        (Some(path), true) => MetricsRecorder::open(path)?,
        _ => MetricsRecorder::in_memory()?,
    };

    Ok(TelemetryGuard {
        log_sink,
        metrics: Arc::new(metrics),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_includes_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("wakegate_engine".into(), Level::DEBUG)],
            ..Default::default()
        };
        assert_eq!(config.filter_directives(), "warn,wakegate_engine=debug");
    }

    #[test]
    fn parse_level_is_case_insensitive() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn init_without_paths_uses_memory_metrics() {
        let guard = init_telemetry(TelemetryConfig::default()).unwrap();
        assert!(guard.logs().is_none());
        guard.metrics().counter_inc("boot", &[], 1);
        assert_eq!(guard.metrics().counter_get("boot", &[]), 1);
    }
}
