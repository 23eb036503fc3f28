//! Periodic background work: sweeping, retry expiry, session locking and
//! metric snapshots.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wakegate_telemetry::MetricsRecorder;

use crate::error::Result;
use crate::protocol::ProtocolEngine;
use crate::sweeper::{RetryDecision, SweepReport};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaintenanceReport {
    pub swept: SweepReport,
    pub requeued_retries: usize,
    pub exhausted_retries: usize,
    pub locked_sessions: usize,
}

/// One maintenance pass.
pub async fn run_maintenance(engine: &ProtocolEngine, now: DateTime<Utc>) -> Result<MaintenanceReport> {
    let swept = engine.sweep_stale_transfers(now).await?;
    let decisions = engine.expire_retries(now).await?;
    let locked = engine.sessions().lock_expired_sessions(now)?;

    let report = MaintenanceReport {
        swept,
        requeued_retries: decisions
            .iter()
            .filter(|d| matches!(d, RetryDecision::Queued(_)))
            .count(),
        exhausted_retries: decisions
            .iter()
            .filter(|d| matches!(d, RetryDecision::Exhausted { .. }))
            .count(),
        locked_sessions: locked.len(),
    };
    if report.locked_sessions > 0 || report.exhausted_retries > 0 {
        info!(
            locked_sessions = report.locked_sessions,
            requeued_retries = report.requeued_retries,
            exhausted_retries = report.exhausted_retries,
            "maintenance pass"
        );
    }
    Ok(report)
}

/// Metric snapshot schedule for the maintenance task.
pub struct MetricsSchedule {
    pub recorder: Arc<MetricsRecorder>,
    pub every: Duration,
}

/// Run maintenance every `interval` until `cancel` fires.
pub fn spawn_maintenance(
    engine: Arc<ProtocolEngine>,
    interval: Duration,
    cancel: CancellationToken,
    metrics: Option<MetricsSchedule>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let snapshot_every = metrics.as_ref().map_or(Duration::from_secs(3600), |m| m.every);
        let mut snapshot = tokio::time::interval(snapshot_every);
        snapshot.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("maintenance task stopping");
                    break;
                }
                _ = sweep.tick() => {
                    if let Err(e) = run_maintenance(&engine, Utc::now()).await {
                        warn!(kind = e.kind(), error = %e, "maintenance pass failed");
                    }
                }
                _ = snapshot.tick(), if metrics.is_some() => {
                    if let Some(m) = &metrics {
                        match m.recorder.snapshot(Utc::now()) {
                            Ok(rows) => debug!(rows, "metrics snapshot written"),
                            Err(e) => warn!(error = %e, "metrics snapshot failed"),
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::LogAlertSink;
    use crate::blob::MemoryBlobStore;
    use crate::config::EngineConfig;
    use crate::protocol::Collaborators;
    use crate::publish::LogPublisher;
    use wakegate_store::Database;

    fn engine() -> Arc<ProtocolEngine> {
        Arc::new(ProtocolEngine::new(
            Database::in_memory().unwrap(),
            EngineConfig::default(),
            Collaborators {
                blobs: Arc::new(MemoryBlobStore::new()),
                publisher: Arc::new(LogPublisher),
                alerts: Arc::new(LogAlertSink),
            },
        ))
    }

    #[tokio::test]
    async fn empty_pass_reports_nothing() {
        let report = run_maintenance(&engine(), Utc::now()).await.unwrap();
        assert_eq!(report, MaintenanceReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn task_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let metrics = MetricsSchedule {
            recorder: Arc::new(MetricsRecorder::in_memory().unwrap()),
            every: Duration::from_secs(10),
        };
        let handle = spawn_maintenance(engine(), Duration::from_secs(1), cancel.clone(), Some(metrics));
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
