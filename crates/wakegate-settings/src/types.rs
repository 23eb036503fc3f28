//! Settings sections. Every struct is `#[serde(default)]` so a file only
//! needs to name the keys it changes.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WakegateSettings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub protocol: ProtocolSettings,
    pub snapshot: SnapshotSettings,
    pub telemetry: TelemetrySettings,
}

impl WakegateSettings {
    /// Reject values that parse but cannot drive the engine.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 7] = [
            (self.server.port == 0, "server.port must be > 0"),
            (
                self.protocol.default_cadence_minutes == 0,
                "protocol.defaultCadenceMinutes must be > 0",
            ),
            (
                self.protocol.stale_transfer_secs == 0,
                "protocol.staleTransferSecs must be > 0",
            ),
            (
                self.protocol.sweep_interval_secs == 0,
                "protocol.sweepIntervalSecs must be > 0",
            ),
            (
                self.protocol.worker_queue_depth == 0,
                "protocol.workerQueueDepth must be > 0",
            ),
            (
                self.snapshot.connectivity_window == 0,
                "snapshot.connectivityWindow must be > 0",
            ),
            (self.storage.database_path.is_empty(), "storage.databasePath must be set"),
        ];
        match checks.iter().find(|(bad, _)| *bad) {
            Some((_, msg)) => Err(SettingsError::InvalidValue((*msg).to_string())),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8088,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub database_path: String,
    /// Root directory of the filesystem blob store for finalized images.
    pub blob_root: String,
    /// First segment of every blob key.
    pub tenant_id: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: "data/wakegate.db".to_string(),
            blob_root: "data/blobs".to_string(),
            tenant_id: "default".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolSettings {
    /// In-flight wakes and buffers idle this long are swept.
    pub stale_transfer_secs: u64,
    /// Expiry extension applied to a chunk buffer on every accepted chunk.
    pub buffer_ttl_secs: u64,
    pub default_cadence_minutes: u32,
    pub max_retry_attempts: u32,
    /// How long after the target wake a queued retry stays valid. Also the
    /// early-presence grace before it.
    pub retry_window_secs: u64,
    pub sweep_interval_secs: u64,
    /// Per-device workers retire after this much silence.
    pub worker_idle_secs: u64,
    pub worker_queue_depth: usize,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            stale_transfer_secs: 120,
            buffer_ttl_secs: 120,
            default_cadence_minutes: 60,
            max_retry_attempts: 3,
            retry_window_secs: 900,
            sweep_interval_secs: 30,
            worker_idle_secs: 300,
            worker_queue_depth: 64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotSettings {
    /// Readings older than this are reported unknown instead of carried forward.
    pub max_carry_forward_secs: u64,
    /// Number of trailing expected wakes the connectivity signal inspects.
    pub connectivity_window: u32,
    /// Activity within this distance of an expected wake fulfils it.
    pub activity_tolerance_secs: u64,
    /// A completed wake further than this from every free slot is overage.
    pub overage_tolerance_secs: u64,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            max_carry_forward_secs: 6 * 3600,
            connectivity_window: 6,
            activity_tolerance_secs: 900,
            overage_tolerance_secs: 600,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    pub log_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_db_path: Option<String>,
    pub metrics_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_db_path: Option<String>,
    pub metrics_snapshot_secs: u64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_db_path: Some("data/logs.db".to_string()),
            metrics_enabled: true,
            metrics_db_path: Some("data/metrics.db".to_string()),
            metrics_snapshot_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = WakegateSettings::default();
        assert_eq!(s.protocol.stale_transfer_secs, 120);
        assert_eq!(s.protocol.default_cadence_minutes, 60);
        assert_eq!(s.protocol.max_retry_attempts, 3);
        assert_eq!(s.snapshot.max_carry_forward_secs, 21_600);
        assert_eq!(s.snapshot.connectivity_window, 6);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(WakegateSettings::default()).unwrap();
        assert_eq!(json["protocol"]["staleTransferSecs"], 120);
        assert_eq!(json["snapshot"]["activityToleranceSecs"], 900);
        assert_eq!(json["storage"]["tenantId"], "default");
    }

    #[test]
    fn partial_section_keeps_defaults() {
        let s: WakegateSettings =
            serde_json::from_str(r#"{"protocol": {"maxRetryAttempts": 5}}"#).unwrap();
        assert_eq!(s.protocol.max_retry_attempts, 5);
        assert_eq!(s.protocol.retry_window_secs, 900);
        assert_eq!(s.server.port, 8088);
    }

    #[test]
    fn validate_rejects_zero_cadence() {
        let mut s = WakegateSettings::default();
        s.protocol.default_cadence_minutes = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("defaultCadenceMinutes"));
    }
}
