//! The per-device wake protocol.
//!
//! Every inbound message is handled against persisted state only: the device
//! record, its current wake cycle and any open chunk buffer. Nothing waits on
//! the device; each transition is written before the reply command is issued,
//! and the next message (or the sweeper) drives the cycle forward.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use wakegate_core::commands::{Command, OutboundCommand};
use wakegate_core::ids::{DeviceId, WakeCycleId};
use wakegate_core::state::{BufferStatus, WakeState};
use wakegate_core::wire::{ChunkMessage, InboundMessage, MetadataMessage, PresenceMessage};
use wakegate_core::{ProtocolError, WakeResolution, WakeScheduler};
use wakegate_store::anomalies::{AnomalyRepo, AnomalyRow};
use wakegate_store::commands::CommandRepo;
use wakegate_store::devices::{DeviceRepo, DeviceRow};
use wakegate_store::retries::RetryRepo;
use wakegate_store::sites::SiteRepo;
use wakegate_store::wake_cycles::{NewWakeCycle, WakeCycleRepo, WakeCycleRow};
use wakegate_store::Database;
use wakegate_telemetry::MetricsRecorder;

use crate::alerts::{Alert, AlertSink};
use crate::blob::{BlobKey, BlobStore};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::publish::CommandPublisher;
use crate::reassembler::{BufferHandle, ChunkReassembler};
use crate::sessions::SessionManager;
use crate::snapshot::SnapshotAggregator;

/// External collaborators the engine hands work to.
#[derive(Clone)]
pub struct Collaborators {
    pub blobs: Arc<dyn BlobStore>,
    pub publisher: Arc<dyn CommandPublisher>,
    pub alerts: Arc<dyn AlertSink>,
}

pub struct ProtocolEngine {
    pub(crate) config: EngineConfig,
    pub(crate) scheduler: WakeScheduler,
    pub(crate) devices: DeviceRepo,
    pub(crate) sites: SiteRepo,
    pub(crate) wakes: WakeCycleRepo,
    pub(crate) retries: RetryRepo,
    pub(crate) commands: CommandRepo,
    pub(crate) anomalies: AnomalyRepo,
    pub(crate) reassembler: ChunkReassembler,
    pub(crate) sessions: SessionManager,
    pub(crate) snapshots: SnapshotAggregator,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) publisher: Arc<dyn CommandPublisher>,
    pub(crate) alerts: Arc<dyn AlertSink>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ProtocolEngine {
    pub fn new(db: Database, config: EngineConfig, collaborators: Collaborators) -> Self {
        let scheduler = WakeScheduler::new(config.default_cadence);
        Self {
            sessions: SessionManager::new(db.clone(), scheduler.clone(), config.snapshot.overage_tolerance),
            snapshots: SnapshotAggregator::new(db.clone(), scheduler.clone(), config.snapshot.clone()),
            reassembler: ChunkReassembler::new(db.clone(), config.buffer_ttl),
            devices: DeviceRepo::new(db.clone()),
            sites: SiteRepo::new(db.clone()),
            wakes: WakeCycleRepo::new(db.clone()),
            retries: RetryRepo::new(db.clone()),
            commands: CommandRepo::new(db.clone()),
            anomalies: AnomalyRepo::new(db),
            scheduler,
            config,
            blobs: collaborators.blobs,
            publisher: collaborators.publisher,
            alerts: collaborators.alerts,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn snapshots(&self) -> &SnapshotAggregator {
        &self.snapshots
    }

    pub fn devices(&self) -> &DeviceRepo {
        &self.devices
    }

    pub fn wakes(&self) -> &WakeCycleRepo {
        &self.wakes
    }

    /// Handle one inbound message and return the command issued for it, if
    /// the message changed any state.
    #[instrument(skip(self, message), fields(mac = %message.mac(), kind = message.kind()))]
    pub async fn handle(&self, message: InboundMessage, now: DateTime<Utc>) -> Result<Option<OutboundCommand>> {
        self.count("wakegate_inbound_total", &[("kind", message.kind())]);
        let result = match message {
            InboundMessage::Presence(p) => self.on_presence(p, now).await.map(Some),
            InboundMessage::Metadata(m) => self.on_metadata(m, now).await,
            InboundMessage::Chunk(c) => self.on_chunk(c, now).await,
        };
        if let Err(e) = &result {
            self.count("wakegate_errors_total", &[("kind", e.kind())]);
        }
        result
    }

    // ── presence ────────────────────────────────────────────────────────

    async fn on_presence(&self, p: PresenceMessage, now: DateTime<Utc>) -> Result<OutboundCommand> {
        let device = self.devices.get_or_provision(&p.mac, now)?;
        let current = self.in_flight(&device)?;

        if let Some(code) = p.reported_error() {
            if current.is_some() || device.is_mapped() {
                return self.fail_reported_wake(&device, current, &p, code, now).await;
            }
        }

        if let Some(current) = current {
            if now - current.updated_at < self.config.stale_after {
                // Same wake announced again: no second cycle, repeat the capture request.
                info!(wake_id = %current.id, state = %current.state, "duplicate presence");
                let resend = if current.retry_count > 0 { current.image_name.clone() } else { None };
                return self.issue(&device, Some(&current.id), Command::CaptureImage { resend }, now).await;
            }
            self.sweep_wake(&current, now).await?;
        }

        // Closing a cycle above may have moved next_wake_at.
        let device = self.devices.get(&device.id)?;
        if !device.is_mapped() {
            return self.sleep_only(&device, &p, now).await;
        }
        if let Some(command) = self.dispatch_retry(&device, &p, now).await? {
            return Ok(command);
        }
        self.begin_capture(&device, &p, now).await
    }

    /// The device announced a failure of its own. The wake it belongs to (a
    /// fresh one when none is in flight) fails with that code and the device
    /// goes back to sleep; no capture is requested.
    async fn fail_reported_wake(
        &self,
        device: &DeviceRow,
        current: Option<WakeCycleRow>,
        p: &PresenceMessage,
        code: i64,
        now: DateTime<Utc>,
    ) -> Result<OutboundCommand> {
        let wake = match current {
            Some(wake) => wake,
            None => self.create_wake(device, p, now)?,
        };
        let next_wake = self
            .close_failed_cycle(device, &wake, ProtocolError::DeviceReported(code), WakeState::Failed, now)
            .await?;
        self.issue(device, Some(&wake.id), Command::Sleep { next_wake, image_name: None }, now)
            .await
    }

    async fn sleep_only(&self, device: &DeviceRow, p: &PresenceMessage, now: DateTime<Utc>) -> Result<OutboundCommand> {
        let wake = self.create_wake(device, p, now)?;
        let reason = ProtocolError::UnmappedDevice { mac: device.mac.clone() };
        debug!(device_id = %device.id, %reason, "sleep only");
        let wake = self.advance(&wake, WakeState::SleepOnly, Some(reason.kind()), now)?;
        let next_wake = self.scheduler.resolve_default(now).next_wake;
        self.devices.record_wake_times(&device.id, wake.created_at, next_wake)?;
        self.issue(device, Some(&wake.id), Command::Sleep { next_wake, image_name: None }, now)
            .await
    }

    async fn dispatch_retry(
        &self,
        device: &DeviceRow,
        p: &PresenceMessage,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboundCommand>> {
        let Some(retry) = self.retries.due_for_device(&device.id, now, self.config.retry_window)? else {
            return Ok(None);
        };
        let target = self.wakes.get(&retry.wake_id)?;
        if !target.state.can_reset_for_retry() {
            debug!(wake_id = %target.id, state = %target.state, "retry target moved on, dropping retry");
            self.retries.mark_dispatched(&retry.id, now)?;
            return Ok(None);
        }

        let wake = self.wakes.reset_for_retry(&target.id, now)?;
        self.wakes.record_telemetry(&wake.id, &p.telemetry, None, now)?;
        self.devices.set_current_wake(&device.id, &wake.id, wake.state, now)?;
        self.retries.mark_dispatched(&retry.id, now)?;
        info!(
            device_id = %device.id,
            wake_id = %wake.id,
            attempt = retry.attempt,
            image_name = retry.image_name.as_deref().unwrap_or(""),
            "dispatching queued retry"
        );
        self.count("wakegate_retries_dispatched_total", &[]);

        let command = Command::CaptureImage { resend: retry.image_name };
        self.issue(device, Some(&wake.id), command, now).await.map(Some)
    }

    /// Mapped devices always get a capture request. Whether that yields a
    /// fresh image or a buffered one is the firmware's call.
    async fn begin_capture(&self, device: &DeviceRow, p: &PresenceMessage, now: DateTime<Utc>) -> Result<OutboundCommand> {
        let wake = self.create_wake(device, p, now)?;
        let wake = self.advance(&wake, WakeState::AckSent, None, now)?;
        let wake = self.advance(&wake, WakeState::CaptureRequested, None, now)?;
        debug!(wake_id = %wake.id, pending_images = p.pending_images, "capture requested");
        self.issue(device, Some(&wake.id), Command::capture(), now).await
    }

    fn create_wake(&self, device: &DeviceRow, p: &PresenceMessage, now: DateTime<Utc>) -> Result<WakeCycleRow> {
        let wake = self.wakes.create(
            &NewWakeCycle {
                device_id: device.id.clone(),
                site_id: device.site_id.clone(),
                captured_at: now,
                pending_images: p.pending_images,
                telemetry: p.telemetry.clone(),
            },
            WakeState::HelloReceived,
            now,
        )?;
        self.devices.set_current_wake(&device.id, &wake.id, wake.state, now)?;
        self.count("wakegate_wakes_total", &[]);
        Ok(wake)
    }

    // ── metadata ────────────────────────────────────────────────────────

    async fn on_metadata(&self, m: MetadataMessage, now: DateTime<Utc>) -> Result<Option<OutboundCommand>> {
        let Some(device) = self.devices.find_by_mac(&m.mac)? else {
            self.anomaly(None, &m.mac, "metadata_unknown_device", &format!("image {}", m.image_name), now)?;
            return Ok(None);
        };
        let Some(wake) = self
            .in_flight(&device)?
            .filter(|w| {
                matches!(
                    w.state,
                    WakeState::CaptureRequested | WakeState::MetadataReceived | WakeState::CollectingChunks
                )
            })
        else {
            self.anomaly(
                Some(&device.id),
                &device.mac,
                "metadata_without_wake",
                &format!("image {} arrived with no capture in flight", m.image_name),
                now,
            )?;
            return Ok(None);
        };

        self.wakes.record_telemetry(&wake.id, &m.telemetry, m.captured_at, now)?;
        if !m.image_name.is_empty() {
            // Kept even on a device error so a retry can ask for this image.
            self.wakes.record_image(&wake.id, &m.image_name, m.image_size, now)?;
        }

        if m.error_code != 0 {
            let err = ProtocolError::DeviceReported(m.error_code);
            let next_wake = self.close_failed_cycle(&device, &wake, err, WakeState::Failed, now).await?;
            return self
                .issue(&device, Some(&wake.id), Command::Sleep { next_wake, image_name: None }, now)
                .await
                .map(Some);
        }

        let wake = if wake.state == WakeState::CaptureRequested {
            self.advance(&wake, WakeState::MetadataReceived, None, now)?
        } else {
            wake
        };

        if m.total_chunks == 0 {
            for open in self.reassembler.for_wake(&wake.id)? {
                if open.status == BufferStatus::Receiving {
                    self.reassembler
                        .close(&open.id, BufferStatus::Failed, Some("superseded by telemetry-only metadata"), now)?;
                }
            }
            let wake = self.advance(&wake, WakeState::Complete, Some("telemetry_only"), now)?;
            let next_wake = self.complete_cycle(&device, &wake, now).await?;
            return self
                .issue(&device, Some(&wake.id), Command::Sleep { next_wake, image_name: None }, now)
                .await
                .map(Some);
        }

        let others: Vec<String> = self
            .reassembler
            .open_images(&device.id)?
            .into_iter()
            .filter(|name| name != &m.image_name)
            .collect();
        if !others.is_empty() {
            self.anomaly(
                Some(&device.id),
                &device.mac,
                "cross_image_interleave",
                &format!("{} started while {} still open", m.image_name, others.join(", ")),
                now,
            )?;
        }

        let handle = self.reassembler.begin_or_resume(
            &device.id,
            &wake.id,
            &m.image_name,
            m.total_chunks,
            m.image_size,
            now,
        )?;
        let wake = if wake.state == WakeState::MetadataReceived {
            self.advance(&wake, WakeState::CollectingChunks, None, now)?
        } else {
            wake
        };

        let missing = self.reassembler.missing(&handle)?;
        if missing.is_empty() {
            // Every chunk landed before the device lost power.
            return self.finalize_transfer(&device, &wake, &handle, now).await.map(Some);
        }
        let received = handle.total.saturating_sub(missing.len() as u32);
        let command = Command::ChunkAck {
            image_name: handle.image_name.clone(),
            received,
            total: handle.total,
            missing_chunks: missing,
        };
        self.issue(&device, Some(&wake.id), command, now).await.map(Some)
    }

    // ── chunks ──────────────────────────────────────────────────────────

    async fn on_chunk(&self, c: ChunkMessage, now: DateTime<Utc>) -> Result<Option<OutboundCommand>> {
        let Some(device) = self.devices.find_by_mac(&c.mac)? else {
            self.anomaly(None, &c.mac, "chunk_unknown_device", &format!("{} #{}", c.image_name, c.index), now)?;
            return Ok(None);
        };
        let Some(handle) = self.reassembler.find_open(&device.id, &c.image_name)? else {
            if self.already_stored(&device, &c.image_name)? {
                debug!(image_name = %c.image_name, index = c.index, "chunk after completion ignored");
            } else {
                self.anomaly(
                    Some(&device.id),
                    &device.mac,
                    "chunk_without_buffer",
                    &format!("{} #{}", c.image_name, c.index),
                    now,
                )?;
            }
            return Ok(None);
        };

        let wake_id = handle
            .wake_id
            .clone()
            .or_else(|| device.current_wake_id.clone())
            .ok_or_else(|| EngineError::Internal(format!("buffer {} has no wake cycle", handle.id)))?;
        let wake = self.wakes.get(&wake_id)?;
        if wake.state != WakeState::CollectingChunks {
            self.anomaly(
                Some(&device.id),
                &device.mac,
                "chunk_for_inactive_wake",
                &format!("{} #{} while wake is {}", c.image_name, c.index, wake.state),
                now,
            )?;
            return Ok(None);
        }

        let accepted = match self.reassembler.accept_chunk(&handle, c.index, &c.bytes, now) {
            Ok(accepted) => accepted,
            Err(EngineError::Protocol(e @ ProtocolError::ChunkOutOfRange { .. })) => {
                self.anomaly(Some(&device.id), &device.mac, e.kind(), &e.to_string(), now)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.count("wakegate_chunks_total", &[("new", if accepted.accepted { "true" } else { "false" })]);

        if accepted.is_complete() {
            return self.finalize_transfer(&device, &wake, &handle, now).await.map(Some);
        }
        if !accepted.accepted {
            return Ok(None);
        }
        let command = Command::ChunkAck {
            image_name: handle.image_name.clone(),
            received: accepted.received,
            total: accepted.total,
            missing_chunks: self.reassembler.gaps(&handle)?,
        };
        self.issue(&device, Some(&wake.id), command, now).await.map(Some)
    }

    fn already_stored(&self, device: &DeviceRow, image_name: &str) -> Result<bool> {
        let Some(id) = &device.current_wake_id else {
            return Ok(false);
        };
        let wake = self.wakes.get(id)?;
        Ok(wake.state == WakeState::Complete && wake.image_name.as_deref() == Some(image_name))
    }

    async fn finalize_transfer(
        &self,
        device: &DeviceRow,
        wake: &WakeCycleRow,
        handle: &BufferHandle,
        now: DateTime<Utc>,
    ) -> Result<OutboundCommand> {
        let finalized = self.reassembler.finalize(handle)?;
        if let Some(reason) = finalized.invalid_reason {
            self.reassembler.close(&handle.id, BufferStatus::Failed, Some(&reason), now)?;
            let err = ProtocolError::IntegrityCheckFailed {
                image_name: handle.image_name.clone(),
                reason,
            };
            let next_wake = self.close_failed_cycle(device, wake, err, WakeState::Failed, now).await?;
            return self
                .issue(device, Some(&wake.id), Command::Sleep { next_wake, image_name: None }, now)
                .await;
        }

        let key = BlobKey {
            tenant_id: self.config.tenant_id.clone(),
            site_id: wake.site_id.as_ref().map(|s| s.to_string()),
            device_id: device.id.to_string(),
            image_name: handle.image_name.clone(),
        };
        // The buffer stays open on failure so a resent chunk retries the upload.
        let path = self.blobs.put(&key, &finalized.bytes).await?;
        self.wakes.set_image_key(&wake.id, &path)?;
        self.reassembler.close(&handle.id, BufferStatus::Complete, None, now)?;
        let wake = self.advance(wake, WakeState::Complete, None, now)?;
        info!(
            wake_id = %wake.id,
            device_id = %device.id,
            image_name = %handle.image_name,
            bytes = finalized.bytes.len(),
            key = %path,
            "image stored"
        );
        self.count("wakegate_images_total", &[]);

        let next_wake = self.complete_cycle(device, &wake, now).await?;
        let command = Command::Sleep {
            next_wake,
            image_name: Some(handle.image_name.clone()),
        };
        self.issue(device, Some(&wake.id), command, now).await
    }

    // ── shared steps ────────────────────────────────────────────────────

    /// The device's current wake cycle when it is still in progress.
    pub(crate) fn in_flight(&self, device: &DeviceRow) -> Result<Option<WakeCycleRow>> {
        let Some(id) = &device.current_wake_id else {
            return Ok(None);
        };
        let wake = self.wakes.get(id)?;
        Ok((!wake.state.is_terminal()).then_some(wake))
    }

    /// Validated transition, mirrored onto the device record.
    pub(crate) fn advance(
        &self,
        wake: &WakeCycleRow,
        to: WakeState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WakeCycleRow> {
        if !wake.state.can_transition_to(to) {
            return Err(ProtocolError::InvalidTransition { from: wake.state, to }.into());
        }
        let next = self.wakes.transition(&wake.id, wake.state, to, reason, now)?;
        self.devices.set_current_wake(&wake.device_id, &wake.id, to, now)?;
        Ok(next)
    }

    pub(crate) fn resolve_next(&self, device: &DeviceRow, now: DateTime<Utc>) -> Result<WakeResolution> {
        let resolution = match &device.site_id {
            Some(site_id) => {
                let site = self.sites.get(site_id)?;
                self.scheduler.resolve(
                    now,
                    device.wake_schedule.as_deref(),
                    site.wake_schedule.as_deref(),
                    &site.timezone,
                )
            }
            None => self.scheduler.resolve_default(now),
        };
        if let Some(reason) = &resolution.fallback_reason {
            let err = ProtocolError::ScheduleUnresolvable(reason.clone());
            debug!(device_id = %device.id, kind = err.kind(), %err, source = ?resolution.source, "schedule fallback");
        }
        Ok(resolution)
    }

    /// Bookkeeping for a cycle that just reached a terminal state: next wake,
    /// device wake times, session outcome. Returns the next wake.
    pub(crate) async fn complete_cycle(
        &self,
        device: &DeviceRow,
        wake: &WakeCycleRow,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let resolution = self.resolve_next(device, now)?;
        self.devices
            .record_wake_times(&device.id, wake.created_at, resolution.next_wake)?;
        if let Err(e) = self.sessions.record_wake_outcome(wake, now) {
            warn!(wake_id = %wake.id, device_id = %device.id, error = %e, "session outcome not recorded");
            self.anomaly(
                Some(&device.id),
                &device.mac,
                "session_outcome_failed",
                &format!("wake {}: {e}", wake.id),
                now,
            )?;
        }
        Ok(resolution.next_wake)
    }

    /// Fail (or time out) a cycle, alert, finish its bookkeeping and queue a
    /// retry when the failure class allows one. Returns the next wake.
    pub(crate) async fn close_failed_cycle(
        &self,
        device: &DeviceRow,
        wake: &WakeCycleRow,
        err: ProtocolError,
        to: WakeState,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let code = match &err {
            ProtocolError::DeviceReported(code) => Some(*code),
            _ => None,
        };
        let failed = self.advance(wake, to, Some(err.kind()), now)?;
        self.wakes.record_failure(&failed.id, &err.to_string(), code)?;
        warn!(
            wake_id = %failed.id,
            device_id = %device.id,
            state = %to,
            kind = err.kind(),
            error = %err,
            "wake cycle failed"
        );
        self.count("wakegate_wake_failures_total", &[("kind", err.kind())]);
        self.alerts
            .raise(Alert {
                device_id: device.id.clone(),
                wake_id: Some(failed.id.clone()),
                kind: err.kind().to_string(),
                detail: err.to_string(),
                at: now,
            })
            .await;

        let next_wake = self.complete_cycle(device, &failed, now).await?;
        if err.is_retryable() {
            self.queue_retry(&failed.id, now).await?;
        }
        Ok(next_wake)
    }

    /// Encode, record, mirror onto the wake and publish.
    pub(crate) async fn issue(
        &self,
        device: &DeviceRow,
        wake_id: Option<&WakeCycleId>,
        command: Command,
        now: DateTime<Utc>,
    ) -> Result<OutboundCommand> {
        let out = command.encode(&device.mac);
        self.commands.record(&device.id, wake_id, command.kind(), &out, now)?;
        if let Some(id) = wake_id {
            self.wakes.set_last_command(id, &out)?;
        }
        if let Err(e) = self.publisher.publish(&out).await {
            warn!(device_id = %device.id, topic = %out.topic, error = %e, "command publish failed");
        }
        self.count("wakegate_commands_total", &[("kind", command.kind())]);
        Ok(out)
    }

    pub(crate) fn anomaly(
        &self,
        device_id: Option<&DeviceId>,
        mac: &str,
        kind: &str,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        warn!(
            mac,
            device_id = device_id.map_or("", |d| d.as_str()),
            kind,
            detail,
            "protocol anomaly"
        );
        self.anomalies.record(&AnomalyRow {
            device_id: device_id.cloned(),
            mac: mac.to_string(),
            kind: kind.to_string(),
            detail: detail.to_string(),
            at: now,
        })?;
        self.count("wakegate_anomalies_total", &[("kind", kind)]);
        Ok(())
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsRecorder>> {
        self.metrics.as_ref()
    }

    pub(crate) fn count(&self, name: &str, labels: &[(&str, &str)]) {
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(name, labels, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::LogAlertSink;
    use crate::blob::MemoryBlobStore;
    use crate::publish::LogPublisher;
    use serde_json::json;
    use wakegate_core::ids::SiteId;
    use wakegate_core::telemetry::TelemetryReading;
    use wakegate_store::sites::SiteRow;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn engine() -> (ProtocolEngine, Database) {
        let db = Database::in_memory().unwrap();
        let engine = ProtocolEngine::new(
            db.clone(),
            EngineConfig::default(),
            Collaborators {
                blobs: Arc::new(MemoryBlobStore::new()),
                publisher: Arc::new(LogPublisher),
                alerts: Arc::new(LogAlertSink),
            },
        );
        (engine, db)
    }

    fn presence(mac: &str) -> InboundMessage {
        InboundMessage::Presence(PresenceMessage {
            mac: mac.into(),
            device_id: None,
            status: "alive".into(),
            pending_images: 0,
            error_code: None,
            telemetry: TelemetryReading::default(),
        })
    }

    fn map_device(db: &Database, mac: &str) {
        let site = SiteId::from_raw("site_1");
        SiteRepo::new(db.clone())
            .upsert(&SiteRow {
                id: site.clone(),
                name: "Yard".into(),
                tenant_id: "acme".into(),
                timezone: "UTC".into(),
                wake_schedule: Some("0 * * * *".into()),
            })
            .unwrap();
        let devices = DeviceRepo::new(db.clone());
        let dev = devices.get_or_provision(mac, Utc::now()).unwrap();
        devices.assign_site(&dev.id, Some(&site), None).unwrap();
    }

    #[tokio::test]
    async fn duplicate_presence_does_not_create_second_wake() {
        let (engine, db) = engine();
        map_device(&db, "M1");
        let now = utc("2024-06-01T10:00:00Z");
        let first = engine.handle(presence("M1"), now).await.unwrap().unwrap();
        let again = engine
            .handle(presence("M1"), now + chrono::Duration::seconds(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.payload, json!({"capture_image": true}));
        assert_eq!(again, first);
        let device = engine.devices.find_by_mac("M1").unwrap().unwrap();
        assert_eq!(engine.wakes.count_for_device(&device.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_in_flight_wake_is_timed_out_on_next_presence() {
        let (engine, db) = engine();
        map_device(&db, "M1");
        let t0 = utc("2024-06-01T10:00:00Z");
        engine.handle(presence("M1"), t0).await.unwrap();
        let device = engine.devices.find_by_mac("M1").unwrap().unwrap();
        let first_wake = device.current_wake_id.clone().unwrap();

        let later = t0 + chrono::Duration::minutes(30);
        let cmd = engine.handle(presence("M1"), later).await.unwrap().unwrap();
        assert_eq!(cmd.payload, json!({"capture_image": true}));
        assert_eq!(engine.wakes.get(&first_wake).unwrap().state, WakeState::Timeout);
        assert_eq!(engine.wakes.count_for_device(&device.id).unwrap(), 2);
    }

    #[tokio::test]
    async fn metadata_without_capture_is_anomaly() {
        let (engine, db) = engine();
        let out = engine
            .handle(
                InboundMessage::Metadata(MetadataMessage {
                    mac: "GHOST".into(),
                    image_name: "a.jpg".into(),
                    image_size: None,
                    max_chunk_size: None,
                    total_chunks: 2,
                    captured_at: None,
                    error_code: 0,
                    telemetry: TelemetryReading::default(),
                }),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(AnomalyRepo::new(db).list_for_mac("GHOST").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn telemetry_only_metadata_completes() {
        let (engine, db) = engine();
        map_device(&db, "M1");
        let now = utc("2024-06-01T10:00:00Z");
        engine.handle(presence("M1"), now).await.unwrap();
        let out = engine
            .handle(
                InboundMessage::Metadata(MetadataMessage {
                    mac: "M1".into(),
                    image_name: String::new(),
                    image_size: None,
                    max_chunk_size: None,
                    total_chunks: 0,
                    captured_at: None,
                    error_code: 0,
                    telemetry: TelemetryReading {
                        temperature_c: Some(21.5),
                        ..Default::default()
                    },
                }),
                now,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.topic, "device/M1/cmd");
        assert_eq!(out.payload, json!({"next_wake": "2024-06-01T11:00:00Z"}));
        let device = engine.devices.find_by_mac("M1").unwrap().unwrap();
        let wake = engine.wakes.get(&device.current_wake_id.unwrap()).unwrap();
        assert_eq!(wake.state, WakeState::Complete);
        assert_eq!(wake.telemetry.temperature_c, Some(21.5));
        assert_eq!(device.next_wake_at, Some(utc("2024-06-01T11:00:00Z")));
    }

    #[tokio::test]
    async fn device_error_in_metadata_fails_and_queues_retry() {
        let (engine, db) = engine();
        map_device(&db, "M1");
        let now = utc("2024-06-01T10:00:00Z");
        engine.handle(presence("M1"), now).await.unwrap();
        let out = engine
            .handle(
                InboundMessage::Metadata(MetadataMessage {
                    mac: "M1".into(),
                    image_name: "a.jpg".into(),
                    image_size: None,
                    max_chunk_size: None,
                    total_chunks: 4,
                    captured_at: None,
                    error_code: 3,
                    telemetry: TelemetryReading::default(),
                }),
                now,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.payload, json!({"next_wake": "2024-06-01T11:00:00Z"}));
        let device = engine.devices.find_by_mac("M1").unwrap().unwrap();
        let wake = engine.wakes.get(&device.current_wake_id.unwrap()).unwrap();
        assert_eq!(wake.state, WakeState::Failed);
        assert_eq!(wake.error_code, Some(3));
        let retries = engine.retries.list_for_wake(&wake.id).unwrap();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].not_before, utc("2024-06-01T11:00:00Z"));
    }

    fn error_presence(mac: &str, code: i64) -> InboundMessage {
        InboundMessage::Presence(PresenceMessage {
            mac: mac.into(),
            device_id: None,
            status: "error".into(),
            pending_images: 0,
            error_code: Some(code),
            telemetry: TelemetryReading::default(),
        })
    }

    #[tokio::test]
    async fn presence_error_code_fails_a_fresh_wake() {
        let (engine, db) = engine();
        map_device(&db, "M8");
        let now = utc("2024-06-01T10:00:00Z");
        let out = engine.handle(error_presence("M8", 42), now).await.unwrap().unwrap();
        assert_eq!(out.payload, json!({"next_wake": "2024-06-01T11:00:00Z"}));

        let device = engine.devices.find_by_mac("M8").unwrap().unwrap();
        assert_eq!(engine.wakes.count_for_device(&device.id).unwrap(), 1);
        let wake = engine.wakes.get(&device.current_wake_id.unwrap()).unwrap();
        assert_eq!(wake.state, WakeState::Failed);
        assert_eq!(wake.error_code, Some(42));
        assert_eq!(engine.retries.list_for_wake(&wake.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn presence_error_during_a_wake_sleeps_instead_of_capturing() {
        let (engine, db) = engine();
        map_device(&db, "M8");
        let now = utc("2024-06-01T10:00:00Z");
        engine.handle(presence("M8"), now).await.unwrap();
        let first = engine.devices.find_by_mac("M8").unwrap().unwrap().current_wake_id.unwrap();

        let out = engine
            .handle(error_presence("M8", 7), now + chrono::Duration::seconds(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.payload, json!({"next_wake": "2024-06-01T11:00:00Z"}));

        let device = engine.devices.find_by_mac("M8").unwrap().unwrap();
        assert_eq!(engine.wakes.count_for_device(&device.id).unwrap(), 1);
        assert_eq!(device.current_wake_id, Some(first.clone()));
        let wake = engine.wakes.get(&first).unwrap();
        assert_eq!(wake.state, WakeState::Failed);
        assert_eq!(wake.error_code, Some(7));
    }

    #[tokio::test]
    async fn unmapped_presence_error_still_sleeps_only() {
        let (engine, _db) = engine();
        let now = utc("2024-06-01T10:00:00Z");
        let out = engine.handle(error_presence("NEW", 5), now).await.unwrap().unwrap();
        assert!(out.payload.get("next_wake").is_some());
        let device = engine.devices.find_by_mac("NEW").unwrap().unwrap();
        let wake = engine.wakes.get(&device.current_wake_id.unwrap()).unwrap();
        assert_eq!(wake.state, WakeState::SleepOnly);
    }

    #[tokio::test]
    async fn lost_session_outcome_is_recorded_as_anomaly() {
        let (engine, db) = engine();
        map_device(&db, "M1");
        db.with_conn(|c| Ok(c.execute_batch("DROP TABLE session_outcomes")?))
            .unwrap();
        let now = utc("2024-06-01T10:00:00Z");
        engine.handle(presence("M1"), now).await.unwrap();
        let out = engine
            .handle(
                InboundMessage::Metadata(MetadataMessage {
                    mac: "M1".into(),
                    image_name: String::new(),
                    image_size: None,
                    max_chunk_size: None,
                    total_chunks: 0,
                    captured_at: None,
                    error_code: 0,
                    telemetry: TelemetryReading::default(),
                }),
                now,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.payload, json!({"next_wake": "2024-06-01T11:00:00Z"}));
        let anomalies = AnomalyRepo::new(db.clone());
        assert_eq!(anomalies.count_by_kind("session_outcome_failed").unwrap(), 1);
        let logged = anomalies.list_for_mac("M1").unwrap();
        assert!(logged[0].detail.contains("wake_"));
    }
}
