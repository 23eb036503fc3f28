use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use wakegate_engine::{spawn_maintenance, DeviceRouter, MetricsSchedule, ProtocolEngine};
use wakegate_settings::WakegateSettings;
use wakegate_telemetry::MetricsRecorder;

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
    pub sweep_interval: Duration,
    /// Metric snapshot cadence; `None` disables snapshots.
    pub metrics_snapshot: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&WakegateSettings::default())
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &WakegateSettings) -> Self {
        let telemetry = &settings.telemetry;
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            request_timeout: Duration::from_secs(settings.server.request_timeout_secs.max(1)),
            sweep_interval: Duration::from_secs(settings.protocol.sweep_interval_secs.max(1)),
            metrics_snapshot: telemetry
                .metrics_enabled
                .then(|| Duration::from_secs(telemetry.metrics_snapshot_secs.max(1))),
        }
    }
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<DeviceRouter>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(router: Arc<DeviceRouter>) -> Self {
        Self {
            router,
            started_at: Instant::now(),
        }
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/ingest", post(handlers::ingest))
        .route("/devices/{mac}", get(handlers::get_device))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/sessions/{id}/snapshots", get(handlers::list_snapshots))
        .route(
            "/sessions/{id}/snapshots/{round}",
            get(handlers::get_snapshot).post(handlers::generate_snapshot),
        )
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
        .layer(TraceLayer::new_for_http())
}

/// Bind, serve, and start the maintenance task. Returns a handle to shut
/// everything down.
pub async fn start(
    config: ServerConfig,
    engine: Arc<ProtocolEngine>,
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<ServerHandle, std::io::Error> {
    let cancel = CancellationToken::new();
    let router = Arc::new(DeviceRouter::new(Arc::clone(&engine), cancel.child_token()));

    let schedule = match (metrics, config.metrics_snapshot) {
        (Some(recorder), Some(every)) => Some(MetricsSchedule { recorder, every }),
        _ => None,
    };
    let maintenance = spawn_maintenance(engine, config.sweep_interval, cancel.child_token(), schedule);

    let app = build_router(AppState::new(Arc::clone(&router)), config.request_timeout);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "wakegate server started");

    let token = cancel.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        cancel,
        router,
        server,
        maintenance,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    cancel: CancellationToken,
    router: Arc<DeviceRouter>,
    server: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting requests, drain device workers, stop maintenance.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task join failed");
        }
        self.router.shutdown().await;
        if let Err(e) = self.maintenance.await {
            tracing::warn!(error = %e, "maintenance task join failed");
        }
        tracing::info!("wakegate server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use wakegate_core::ids::SiteId;
    use wakegate_engine::{Collaborators, EngineConfig, LogAlertSink, LogPublisher, MemoryBlobStore};
    use wakegate_store::sites::{SiteRepo, SiteRow};
    use wakegate_store::Database;

    fn engine() -> Arc<ProtocolEngine> {
        let db = Database::in_memory().unwrap();
        SiteRepo::new(db.clone())
            .upsert(&SiteRow {
                id: SiteId::from_raw("site_1"),
                name: "Yard".into(),
                tenant_id: "acme".into(),
                timezone: "UTC".into(),
                wake_schedule: Some("0 * * * *".into()),
            })
            .unwrap();
        Arc::new(ProtocolEngine::new(
            db,
            EngineConfig::default(),
            Collaborators {
                blobs: Arc::new(MemoryBlobStore::new()),
                publisher: Arc::new(LogPublisher),
                alerts: Arc::new(LogAlertSink),
            },
        ))
    }

    fn app(engine: Arc<ProtocolEngine>) -> Router {
        let router = Arc::new(DeviceRouter::new(engine, CancellationToken::new()));
        build_router(AppState::new(router), Duration::from_secs(5))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let resp = app(engine()).oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["activeWorkers"], 0);
    }

    #[tokio::test]
    async fn presence_is_answered_with_a_command() {
        let resp = app(engine())
            .oneshot(post_json(
                "/ingest",
                json!({
                    "topic": "device/AA11/status",
                    "payload": {"device_id": "esp-1", "status": "alive", "pendingImg": 0},
                    "receivedAt": "2026-03-02T10:00:00Z"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["topic"], "device/AA11/cmd");
        // Unmapped devices are sent back to sleep.
        assert!(json["payload"]["next_wake"].is_string());
    }

    #[tokio::test]
    async fn unknown_topic_is_rejected() {
        let resp = app(engine())
            .oneshot(post_json("/ingest", json!({"topic": "weather/today", "payload": {}})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["kind"], "malformed");
    }

    #[tokio::test]
    async fn stray_chunk_gets_no_command() {
        let resp = app(engine())
            .oneshot(post_json(
                "/ingest",
                json!({
                    "topic": "device/AA11/chunk",
                    "payload": {"image_name": "a.jpg", "chunk_id": 0, "payload": [255, 216, 255]}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn device_lookup() {
        let engine = engine();
        let missing = app(Arc::clone(&engine)).oneshot(get("/devices/AA11")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        engine.devices().get_or_provision("AA11", Utc::now()).unwrap();
        let found = app(engine).oneshot(get("/devices/AA11")).await.unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        assert_eq!(body_json(found).await["mac"], "AA11");
    }

    #[tokio::test]
    async fn snapshot_generate_then_read() {
        let engine = engine();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let session = engine
            .sessions()
            .get_or_create(&SiteId::from_raw("site_1"), date, Utc::now())
            .unwrap();
        let base = format!("/sessions/{}/snapshots", session.id);

        let before = app(Arc::clone(&engine)).oneshot(get(&format!("{base}/3"))).await.unwrap();
        assert_eq!(before.status(), StatusCode::NOT_FOUND);

        let start = Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap();
        let window = json!({
            "windowStart": start.to_rfc3339(),
            "windowEnd": (start + chrono::Duration::hours(1)).to_rfc3339(),
        });
        let created = app(Arc::clone(&engine))
            .oneshot(post_json(&format!("{base}/3"), window))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        assert_eq!(body_json(created).await["roundIndex"], 3);

        let read = app(Arc::clone(&engine)).oneshot(get(&format!("{base}/3"))).await.unwrap();
        assert_eq!(read.status(), StatusCode::OK);
        let json = body_json(read).await;
        assert_eq!(json["sessionId"], session.id.as_str());

        let list = app(engine).oneshot(get(&base)).await.unwrap();
        assert_eq!(body_json(list).await.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn empty_snapshot_window_is_bad_request() {
        let engine = engine();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let session = engine
            .sessions()
            .get_or_create(&SiteId::from_raw("site_1"), date, Utc::now())
            .unwrap();
        let at = "2026-03-02T03:00:00Z";
        let resp = app(engine)
            .oneshot(post_json(
                &format!("/sessions/{}/snapshots/0", session.id),
                json!({"windowStart": at, "windowEnd": at}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let resp = app(engine()).oneshot(get("/sessions/sess_missing")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_and_shutdown() {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        };
        let handle = start(config, engine(), None).await.unwrap();
        assert_ne!(handle.port(), 0);
        handle.shutdown().await;
    }
}
