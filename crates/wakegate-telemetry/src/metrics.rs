use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::TelemetryError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

/// A persisted metric value.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub metric_type: MetricType,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
}

enum Slot {
    Counter(AtomicU64),
    /// f64 bits.
    Gauge(AtomicU64),
    Histogram(Mutex<Vec<f64>>),
}

impl Slot {
    fn new(kind: MetricType) -> Self {
        match kind {
            MetricType::Counter => Self::Counter(AtomicU64::new(0)),
            MetricType::Gauge => Self::Gauge(AtomicU64::new(0f64.to_bits())),
            MetricType::Histogram => Self::Histogram(Mutex::new(Vec::new())),
        }
    }

    fn kind(&self) -> MetricType {
        match self {
            Self::Counter(_) => MetricType::Counter,
            Self::Gauge(_) => MetricType::Gauge,
            Self::Histogram(_) => MetricType::Histogram,
        }
    }

    /// Value written to a snapshot row; histograms report their p50.
    fn value(&self) -> f64 {
        match self {
            Self::Counter(c) => c.load(Ordering::Relaxed) as f64,
            Self::Gauge(g) => f64::from_bits(g.load(Ordering::Relaxed)),
            Self::Histogram(h) => summarize(&h.lock()).p50,
        }
    }
}

fn summarize(observations: &[f64]) -> HistogramSummary {
    if observations.is_empty() {
        return HistogramSummary::default();
    }
    let mut sorted = observations.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let at = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
    HistogramSummary {
        count: n as u64,
        sum: sorted.iter().sum(),
        min: sorted[0],
        max: sorted[n - 1],
        p50: at(0.5),
        p95: at(0.95),
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> =
            labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: serde_json::Map<String, serde_json::Value> = self
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::to_string(&map).ok()
    }
}

/// In-process counters, gauges and histograms with periodic SQLite snapshots.
pub struct MetricsRecorder {
    slots: RwLock<HashMap<MetricKey, Slot>>,
    db: Mutex<Connection>,
}

impl MetricsRecorder {
    pub fn open(db_path: &Path) -> Result<Self, TelemetryError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, TelemetryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, TelemetryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metrics_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT,
                 metric_type TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);",
        )?;
        Ok(Self {
            slots: RwLock::new(HashMap::new()),
            db: Mutex::new(conn),
        })
    }

    fn with_slot(&self, kind: MetricType, name: &str, labels: &[(&str, &str)], f: impl FnOnce(&Slot)) {
        let key = MetricKey::new(name, labels);
        {
            let slots = self.slots.read();
            if let Some(slot) = slots.get(&key) {
                if slot.kind() == kind {
                    f(slot);
                }
                return;
            }
        }
        let mut slots = self.slots.write();
        let slot = slots.entry(key).or_insert_with(|| Slot::new(kind));
        if slot.kind() == kind {
            f(slot);
        }
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.with_slot(MetricType::Counter, name, labels, |slot| {
            if let Slot::Counter(c) = slot {
                c.fetch_add(n, Ordering::Relaxed);
            }
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.with_slot(MetricType::Gauge, name, labels, |slot| {
            if let Slot::Gauge(g) = slot {
                g.store(value.to_bits(), Ordering::Relaxed);
            }
        });
    }

    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        self.with_slot(MetricType::Gauge, name, labels, |slot| {
            if let Slot::Gauge(g) = slot {
                let _ = g.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                    Some((f64::from_bits(bits) + delta).to_bits())
                });
            }
        });
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.with_slot(MetricType::Histogram, name, labels, |slot| {
            if let Slot::Histogram(h) = slot {
                h.lock().push(value);
            }
        });
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        match self.slots.read().get(&MetricKey::new(name, labels)) {
            Some(Slot::Counter(c)) => c.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        match self.slots.read().get(&MetricKey::new(name, labels)) {
            Some(Slot::Gauge(g)) => f64::from_bits(g.load(Ordering::Relaxed)),
            _ => 0.0,
        }
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        match self.slots.read().get(&MetricKey::new(name, labels)) {
            Some(Slot::Histogram(h)) => summarize(&h.lock()),
            _ => HistogramSummary::default(),
        }
    }

    /// Persist one row per metric. Returns the number of rows written.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Result<usize, TelemetryError> {
        let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let rows: Vec<(String, f64, Option<String>, MetricType)> = self
            .slots
            .read()
            .iter()
            .map(|(key, slot)| (key.name.clone(), slot.value(), key.labels_json(), slot.kind()))
            .collect();

        let mut db = self.db.lock();
        let tx = db.transaction()?;
        for (name, value, labels, kind) in &rows {
            tx.execute(
                "INSERT INTO metrics_snapshots (timestamp, name, value, labels, metric_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![timestamp, name, value, labels, kind.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Newest first.
    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, TelemetryError> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT timestamp, name, value, labels, metric_type FROM metrics_snapshots
             WHERE (?1 IS NULL OR name = ?1) AND (?2 IS NULL OR timestamp >= ?2)
             ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![q.name, q.since, q.limit.unwrap_or(100)],
            |row| {
                let kind: String = row.get(4)?;
                Ok(MetricsSnapshot {
                    timestamp: row.get(0)?,
                    name: row.get(1)?,
                    value: row.get(2)?,
                    labels: row.get(3)?,
                    metric_type: match kind.as_str() {
                        "gauge" => MetricType::Gauge,
                        "histogram" => MetricType::Histogram,
                        _ => MetricType::Counter,
                    },
                })
            },
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Drop snapshot rows older than `before`.
    pub fn prune(&self, before: DateTime<Utc>) -> Result<usize, TelemetryError> {
        let db = self.db.lock();
        Ok(db.execute(
            "DELETE FROM metrics_snapshots WHERE timestamp < ?1",
            [before.to_rfc3339_opts(SecondsFormat::Millis, true)],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[test]
    fn counters_are_keyed_by_sorted_labels() {
        let m = MetricsRecorder::in_memory().unwrap();
        m.counter_inc("wake.outcome", &[("outcome", "completed"), ("site", "s1")], 1);
        m.counter_inc("wake.outcome", &[("site", "s1"), ("outcome", "completed")], 2);
        m.counter_inc("wake.outcome", &[("outcome", "failed"), ("site", "s1")], 1);
        assert_eq!(m.counter_get("wake.outcome", &[("outcome", "completed"), ("site", "s1")]), 3);
        assert_eq!(m.counter_get("wake.outcome", &[("outcome", "overage"), ("site", "s1")]), 0);
    }

    #[test]
    fn gauges_move_both_ways() {
        let m = MetricsRecorder::in_memory().unwrap();
        m.gauge_set("router.workers", &[], 4.0);
        m.gauge_add("router.workers", &[], 1.0);
        m.gauge_add("router.workers", &[], -2.5);
        assert_eq!(m.gauge_get("router.workers", &[]), 2.5);
    }

    #[test]
    fn histogram_summary_percentiles() {
        let m = MetricsRecorder::in_memory().unwrap();
        for v in 1..=20 {
            m.histogram_observe("transfer.duration_ms", &[], f64::from(v));
        }
        let s = m.histogram_summary("transfer.duration_ms", &[]);
        assert_eq!(s.count, 20);
        assert_eq!(s.sum, 210.0);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 20.0);
        assert_eq!(s.p50, 11.0);
        assert_eq!(s.p95, 20.0);
        assert_eq!(m.histogram_summary("missing", &[]), HistogramSummary::default());
    }

    #[test]
    fn kind_mismatch_is_ignored() {
        let m = MetricsRecorder::in_memory().unwrap();
        m.counter_inc("x", &[], 1);
        m.gauge_set("x", &[], 9.0);
        assert_eq!(m.counter_get("x", &[]), 1);
        assert_eq!(m.gauge_get("x", &[]), 0.0);
    }

    #[test]
    fn snapshot_query_prune() {
        let m = MetricsRecorder::in_memory().unwrap();
        m.counter_inc("chunks.accepted", &[("device", "d1")], 42);
        m.gauge_set("sessions.open", &[], 3.0);
        let then = Utc::now() - Duration::days(2);
        assert_eq!(m.snapshot(then).unwrap(), 2);
        assert_eq!(m.snapshot(Utc::now()).unwrap(), 2);

        let rows = m
            .query(&MetricsQuery {
                name: Some("chunks.accepted".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value, 42.0);
        assert_eq!(rows[0].metric_type, MetricType::Counter);
        assert!(rows[0].labels.as_deref().unwrap().contains("d1"));

        assert_eq!(m.prune(Utc::now() - Duration::days(1)).unwrap(), 2);
        assert_eq!(m.query(&MetricsQuery::default()).unwrap().len(), 2);
    }

    #[test]
    fn concurrent_increments() {
        let m = Arc::new(MetricsRecorder::in_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        m.counter_inc("messages.ingested", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.counter_get("messages.ingested", &[]), 4000);
    }
}
