//! Stale transfer sweeping and the retry queue.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use wakegate_core::ids::{BufferId, WakeCycleId};
use wakegate_core::state::{BufferStatus, WakeState};
use wakegate_core::{ProtocolError, RetryStatus};
use wakegate_store::retries::{NewRetry, RetryRow};
use wakegate_store::wake_cycles::WakeCycleRow;
use wakegate_store::StoreError;

use crate::alerts::Alert;
use crate::error::{EngineError, Result};
use crate::protocol::ProtocolEngine;

/// What one sweep closed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SweepReport {
    pub wakes: Vec<WakeCycleId>,
    pub buffers: Vec<BufferId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.wakes.is_empty() && self.buffers.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RetryDecision {
    Queued(RetryRow),
    /// A pending retry for the wake already exists.
    AlreadyPending(RetryRow),
    Exhausted { attempts: u32 },
}

impl ProtocolEngine {
    /// Close expired buffers and stale in-flight wakes.
    ///
    /// Safe to run concurrently with message handling: every close is a
    /// compare-and-swap on the stored state, and a lost race is skipped.
    #[instrument(skip(self))]
    pub async fn sweep_stale_transfers(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for buffer in self.reassembler.expired(now)? {
            if !self
                .reassembler
                .close(&buffer.id, BufferStatus::Timeout, Some("buffer expired"), now)?
            {
                continue;
            }
            debug!(buffer_id = %buffer.id, image_name = %buffer.image_name, "expired buffer closed");
            report.buffers.push(buffer.id.clone());

            let Some(wake_id) = &buffer.wake_id else { continue };
            let wake = self.wakes.get(wake_id)?;
            if wake.state == WakeState::CollectingChunks && self.fail_stale(&wake, WakeState::Failed, now).await? {
                report.wakes.push(wake.id.clone());
            }
        }

        for wake in self.wakes.list_stale(now - self.config.stale_after)? {
            if wake.state == WakeState::CollectingChunks && self.has_live_buffer(&wake, now)? {
                continue;
            }
            if self.sweep_wake(&wake, now).await? {
                report.wakes.push(wake.id.clone());
            }
        }

        if !report.is_empty() {
            info!(wakes = report.wakes.len(), buffers = report.buffers.len(), "stale transfers swept");
        }
        Ok(report)
    }

    fn has_live_buffer(&self, wake: &WakeCycleRow, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .reassembler
            .for_wake(&wake.id)?
            .iter()
            .any(|b| b.status == BufferStatus::Receiving && b.expires_at > now))
    }

    /// Close one stale wake: its receiving buffers time out, a wake that was
    /// collecting chunks fails, earlier states time out.
    pub(crate) async fn sweep_wake(&self, wake: &WakeCycleRow, now: DateTime<Utc>) -> Result<bool> {
        for buffer in self.reassembler.for_wake(&wake.id)? {
            if buffer.status == BufferStatus::Receiving {
                self.reassembler
                    .close(&buffer.id, BufferStatus::Timeout, Some("wake went stale"), now)?;
            }
        }
        let to = if wake.state == WakeState::CollectingChunks {
            WakeState::Failed
        } else {
            WakeState::Timeout
        };
        self.fail_stale(wake, to, now).await
    }

    async fn fail_stale(&self, wake: &WakeCycleRow, to: WakeState, now: DateTime<Utc>) -> Result<bool> {
        let device = self.devices.get(&wake.device_id)?;
        let idle_secs = (now - wake.updated_at).num_seconds();
        match self
            .close_failed_cycle(&device, wake, ProtocolError::StaleTransfer { idle_secs }, to, now)
            .await
        {
            Ok(_) => Ok(true),
            Err(EngineError::Store(StoreError::Conflict(detail))) => {
                debug!(wake_id = %wake.id, %detail, "wake moved on before sweep");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Queue a retry for a failed wake at the device's next scheduled wake.
    #[instrument(skip(self), fields(wake_id = %wake_id))]
    pub async fn queue_retry(&self, wake_id: &WakeCycleId, now: DateTime<Utc>) -> Result<RetryDecision> {
        let wake = self.wakes.get(wake_id)?;
        if !wake.state.is_failure() {
            return Err(ProtocolError::InvalidTransition {
                from: wake.state,
                to: WakeState::CaptureRequested,
            }
            .into());
        }
        if let Some(pending) = self
            .retries
            .list_for_wake(wake_id)?
            .into_iter()
            .find(|r| r.status == RetryStatus::Pending)
        {
            return Ok(RetryDecision::AlreadyPending(pending));
        }

        let attempts = self.retries.count_for_wake(wake_id)?;
        let device = self.devices.get(&wake.device_id)?;
        if attempts >= self.config.max_retry_attempts {
            warn!(wake_id = %wake.id, attempts, "retry attempts exhausted");
            let detail = format!("wake {} gave up after {attempts} retries", wake.id);
            self.alerts
                .raise(Alert {
                    device_id: device.id.clone(),
                    wake_id: Some(wake.id.clone()),
                    kind: "retry_exhausted".to_string(),
                    detail: detail.clone(),
                    at: now,
                })
                .await;
            self.anomaly(Some(&device.id), &device.mac, "retry_exhausted", &detail, now)?;
            return Ok(RetryDecision::Exhausted { attempts });
        }

        let not_before = match device.next_wake_at {
            Some(next) if next > now => next,
            _ => self.resolve_next(&device, now)?.next_wake,
        };
        let (row, created) = self.retries.enqueue(
            &NewRetry {
                wake_id: wake.id.clone(),
                device_id: device.id.clone(),
                image_name: wake.image_name.clone(),
                attempt: attempts + 1,
                not_before,
                expires_at: not_before + self.config.retry_window,
            },
            now,
        )?;
        if !created {
            return Ok(RetryDecision::AlreadyPending(row));
        }
        info!(wake_id = %wake.id, attempt = row.attempt, not_before = %row.not_before, "retry queued");
        self.count("wakegate_retries_queued_total", &[]);
        Ok(RetryDecision::Queued(row))
    }

    /// Expire retries whose window passed and re-queue them while attempts
    /// remain.
    #[instrument(skip(self))]
    pub async fn expire_retries(&self, now: DateTime<Utc>) -> Result<Vec<RetryDecision>> {
        let mut decisions = Vec::new();
        for expired in self.retries.expire_due(now)? {
            let wake = self.wakes.get(&expired.wake_id)?;
            if !wake.state.is_failure() {
                continue;
            }
            debug!(wake_id = %wake.id, attempt = expired.attempt, "retry window missed");
            decisions.push(self.queue_retry(&wake.id, now).await?);
        }
        Ok(decisions)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::alerts::LogAlertSink;
    use crate::blob::MemoryBlobStore;
    use crate::config::EngineConfig;
    use crate::protocol::Collaborators;
    use crate::publish::LogPublisher;
    use wakegate_core::telemetry::TelemetryReading;
    use wakegate_core::wire::{ChunkMessage, InboundMessage, MetadataMessage, PresenceMessage};
    use wakegate_store::devices::DeviceRepo;
    use wakegate_store::Database;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn engine(config: EngineConfig) -> ProtocolEngine {
        let db = Database::in_memory().unwrap();
        ProtocolEngine::new(
            db,
            config,
            Collaborators {
                blobs: Arc::new(MemoryBlobStore::new()),
                publisher: Arc::new(LogPublisher),
                alerts: Arc::new(LogAlertSink),
            },
        )
    }

    async fn start_transfer(engine: &ProtocolEngine, now: DateTime<Utc>) -> WakeCycleId {
        let devices: &DeviceRepo = engine.devices();
        let dev = devices.get_or_provision("M1", now).unwrap();
        engine
            .sites
            .upsert(&wakegate_store::sites::SiteRow {
                id: wakegate_core::ids::SiteId::from_raw("site_1"),
                name: "Yard".into(),
                tenant_id: "acme".into(),
                timezone: "UTC".into(),
                wake_schedule: Some("0 * * * *".into()),
            })
            .unwrap();
        devices
            .assign_site(&dev.id, Some(&wakegate_core::ids::SiteId::from_raw("site_1")), None)
            .unwrap();
        engine
            .handle(
                InboundMessage::Presence(PresenceMessage {
                    mac: "M1".into(),
                    device_id: None,
                    status: "alive".into(),
                    pending_images: 1,
                    error_code: None,
                    telemetry: TelemetryReading::default(),
                }),
                now,
            )
            .await
            .unwrap();
        engine
            .handle(
                InboundMessage::Metadata(MetadataMessage {
                    mac: "M1".into(),
                    image_name: "img_1.jpg".into(),
                    image_size: None,
                    max_chunk_size: Some(4),
                    total_chunks: 3,
                    captured_at: Some(now),
                    error_code: 0,
                    telemetry: TelemetryReading::default(),
                }),
                now,
            )
            .await
            .unwrap();
        engine
            .handle(
                InboundMessage::Chunk(ChunkMessage {
                    mac: "M1".into(),
                    image_name: "img_1.jpg".into(),
                    index: 0,
                    bytes: vec![0xFF, 0xD8, 0x00, 0x01],
                }),
                now,
            )
            .await
            .unwrap();
        devices.find_by_mac("M1").unwrap().unwrap().current_wake_id.unwrap()
    }

    #[tokio::test]
    async fn sweep_ignores_fresh_transfers() {
        let engine = engine(EngineConfig::default());
        let t0 = utc("2024-06-01T10:00:00Z");
        start_transfer(&engine, t0).await;
        let report = engine.sweep_stale_transfers(t0 + Duration::seconds(30)).await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn sweep_fails_stalled_transfer_and_queues_retry() {
        let engine = engine(EngineConfig::default());
        let t0 = utc("2024-06-01T10:00:00Z");
        let wake_id = start_transfer(&engine, t0).await;

        let report = engine.sweep_stale_transfers(t0 + Duration::minutes(10)).await.unwrap();
        assert_eq!(report.wakes, vec![wake_id.clone()]);
        assert_eq!(report.buffers.len(), 1);

        let wake = engine.wakes().get(&wake_id).unwrap();
        assert_eq!(wake.state, WakeState::Failed);
        let buffers = engine.reassembler.for_wake(&wake_id).unwrap();
        assert_eq!(buffers[0].status, BufferStatus::Timeout);

        let retries = engine.retries.list_for_wake(&wake_id).unwrap();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].image_name.as_deref(), Some("img_1.jpg"));
        assert_eq!(retries[0].not_before, utc("2024-06-01T11:00:00Z"));

        // Second sweep finds nothing left to close.
        let again = engine.sweep_stale_transfers(t0 + Duration::minutes(20)).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn queue_retry_is_idempotent_and_bounded() {
        let config = EngineConfig {
            max_retry_attempts: 2,
            ..EngineConfig::default()
        };
        let engine = engine(config);
        let t0 = utc("2024-06-01T10:00:00Z");
        let wake_id = start_transfer(&engine, t0).await;
        engine.sweep_stale_transfers(t0 + Duration::minutes(10)).await.unwrap();

        let again = engine.queue_retry(&wake_id, t0 + Duration::minutes(11)).await.unwrap();
        assert!(matches!(again, RetryDecision::AlreadyPending(_)));

        // Let the first window lapse: one re-queue, then exhaustion.
        let decisions = engine.expire_retries(utc("2024-06-01T11:30:00Z")).await.unwrap();
        assert!(matches!(decisions.as_slice(), [RetryDecision::Queued(r)] if r.attempt == 2));
        let decisions = engine.expire_retries(utc("2024-06-01T13:00:00Z")).await.unwrap();
        assert!(matches!(decisions.as_slice(), [RetryDecision::Exhausted { attempts: 2 }]));

        let rows = engine.retries.list_for_wake(&wake_id).unwrap();
        assert!(rows.iter().all(|r| r.status == RetryStatus::Expired));
    }

    #[tokio::test]
    async fn queue_retry_rejects_live_wake() {
        let engine = engine(EngineConfig::default());
        let t0 = utc("2024-06-01T10:00:00Z");
        let wake_id = start_transfer(&engine, t0).await;
        let err = engine.queue_retry(&wake_id, t0).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
    }
}
