//! Outbound alerting for protocol failures that need a human.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use wakegate_core::ids::{DeviceId, WakeCycleId};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub device_id: DeviceId,
    pub wake_id: Option<WakeCycleId>,
    pub kind: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: Alert);
}

/// Default sink: alerts become WARN events, which the SQLite log layer keeps.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise(&self, alert: Alert) {
        warn!(
            device_id = %alert.device_id,
            wake_id = alert.wake_id.as_ref().map_or("", |w| w.as_str()),
            kind = %alert.kind,
            detail = %alert.detail,
            "protocol alert"
        );
    }
}
