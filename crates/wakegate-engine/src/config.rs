use chrono::Duration;
use wakegate_settings::WakegateSettings;

/// Engine tunables, converted once from settings into chrono durations.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub tenant_id: String,
    pub stale_after: Duration,
    pub buffer_ttl: Duration,
    pub default_cadence: Duration,
    pub max_retry_attempts: u32,
    pub retry_window: Duration,
    pub worker_idle: std::time::Duration,
    pub worker_queue_depth: usize,
    pub snapshot: SnapshotConfig,
}

#[derive(Clone, Debug)]
pub struct SnapshotConfig {
    pub max_carry_forward: Duration,
    pub connectivity_window: usize,
    pub activity_tolerance: Duration,
    pub overage_tolerance: Duration,
}

fn secs(v: u64) -> Duration {
    Duration::seconds(i64::try_from(v).unwrap_or(i64::MAX / 1000))
}

impl EngineConfig {
    pub fn from_settings(settings: &WakegateSettings) -> Self {
        let p = &settings.protocol;
        let s = &settings.snapshot;
        Self {
            tenant_id: settings.storage.tenant_id.clone(),
            stale_after: secs(p.stale_transfer_secs),
            buffer_ttl: secs(p.buffer_ttl_secs),
            default_cadence: Duration::minutes(i64::from(p.default_cadence_minutes)),
            max_retry_attempts: p.max_retry_attempts,
            retry_window: secs(p.retry_window_secs),
            worker_idle: std::time::Duration::from_secs(p.worker_idle_secs),
            worker_queue_depth: p.worker_queue_depth.max(1),
            snapshot: SnapshotConfig {
                max_carry_forward: secs(s.max_carry_forward_secs),
                connectivity_window: s.connectivity_window as usize,
                activity_tolerance: secs(s.activity_tolerance_secs),
                overage_tolerance: secs(s.overage_tolerance_secs),
            },
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&WakegateSettings::default())
    }
}
