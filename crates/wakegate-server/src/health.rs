//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    pub uptime_secs: u64,
    /// Device workers currently holding a queue.
    pub active_workers: usize,
}

pub fn health_check(start_time: Instant, active_workers: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        active_workers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 0);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_counts_from_start() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, 3);
        assert!(resp.uptime_secs >= 59);
        assert_eq!(resp.active_workers, 3);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(health_check(Instant::now(), 1)).unwrap();
        assert_eq!(json["activeWorkers"], 1);
        assert!(json.get("uptimeSecs").is_some());
    }
}
