use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::TelemetryError;

/// A persisted WARN/ERROR event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub device_id: Option<String>,
    pub wake_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    /// Substring match on the event target.
    pub target: Option<String>,
    pub device_id: Option<String>,
    pub wake_id: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<u32>,
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

const LOG_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        device_id TEXT,
        wake_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level, timestamp);
    CREATE INDEX IF NOT EXISTS idx_logs_device ON logs(device_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_logs_wake ON logs(wake_id);";

impl SqliteLogSink {
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
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        // A failing log write must never take the caller down with it.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, device_id, wake_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.device_id,
                record.wake_id,
            ],
        );
    }

    /// Newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, TelemetryError> {
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, device_id, wake_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();
        let mut push = |clause: &str, value: String| {
            params.push(value);
            sql.push_str(&clause.replace('?', &format!("?{}", params.len())));
        };
        if let Some(level) = &q.level {
            push(" AND level = ?", level.to_uppercase());
        }
        if let Some(target) = &q.target {
            push(" AND target LIKE ?", format!("%{target}%"));
        }
        if let Some(device_id) = &q.device_id {
            push(" AND device_id = ?", device_id.clone());
        }
        if let Some(wake_id) = &q.wake_id {
            push(" AND wake_id = ?", wake_id.clone());
        }
        if let Some(since) = &q.since {
            push(" AND timestamp >= ?", since.clone());
        }
        if let Some(until) = &q.until {
            push(" AND timestamp < ?", until.clone());
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                device_id: row.get(6)?,
                wake_id: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn count(&self) -> Result<i64, TelemetryError> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?)
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    device_id: Option<String>,
    wake_id: Option<String>,
}

/// tracing layer persisting WARN and ERROR events. `device_id` and `wake_id`
/// are lifted into their own columns, from the event or any enclosing span.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    correlation: Correlation,
}

/// Correlation ids carried on a span, stored in its extensions.
#[derive(Clone, Default)]
struct Correlation {
    device_id: Option<String>,
    wake_id: Option<String>,
}

impl Correlation {
    fn is_complete(&self) -> bool {
        self.device_id.is_some() && self.wake_id.is_some()
    }

    fn fill_from(&mut self, other: &Correlation) {
        if self.device_id.is_none() {
            self.device_id.clone_from(&other.device_id);
        }
        if self.wake_id.is_none() {
            self.wake_id.clone_from(&other.wake_id);
        }
    }
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "device_id" => self.correlation.device_id = Some(value),
            "wake_id" => self.correlation.wake_id = Some(value),
            name => {
                self.fields.insert(name.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, format!("{value:?}").trim_matches('"').to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields.insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if !visitor.correlation.is_complete() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    if let Some(found) = span.extensions().get::<Correlation>() {
                        visitor.correlation.fill_from(found);
                    }
                    if visitor.correlation.is_complete() {
                        break;
                    }
                }
            }
        }

        let fields = (!visitor.fields.is_empty())
            .then(|| serde_json::to_string(&visitor.fields).ok())
            .flatten();

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            device_id: visitor.correlation.device_id,
            wake_id: visitor.correlation.wake_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.correlation.device_id.is_none() && visitor.correlation.wake_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.correlation);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        if let Some(span) = ctx.span(id) {
            let mut extensions = span.extensions_mut();
            match extensions.get_mut::<Correlation>() {
                Some(existing) => {
                    if visitor.correlation.device_id.is_some() {
                        existing.device_id = visitor.correlation.device_id;
                    }
                    if visitor.correlation.wake_id.is_some() {
                        existing.wake_id = visitor.correlation.wake_id;
                    }
                }
                None => {
                    if visitor.correlation.device_id.is_some() || visitor.correlation.wake_id.is_some() {
                        extensions.insert(visitor.correlation);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn with_layer(f: impl FnOnce()) -> Arc<SqliteLogSink> {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, f);
        sink
    }

    #[test]
    fn info_is_not_persisted() {
        let sink = with_layer(|| {
            tracing::info!("routine");
            tracing::warn!("odd");
            tracing::error!("broken");
        });
        assert_eq!(sink.count().unwrap(), 2);
    }

    #[test]
    fn event_fields_lift_into_columns() {
        let sink = with_layer(|| {
            tracing::warn!(device_id = "dev_1", wake_id = "wake_9", chunk = 7u64, "chunk out of range");
        });
        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_id.as_deref(), Some("dev_1"));
        assert_eq!(rows[0].wake_id.as_deref(), Some("wake_9"));
        assert_eq!(rows[0].message, "chunk out of range");
        let fields: serde_json::Value = serde_json::from_str(rows[0].fields.as_deref().unwrap()).unwrap();
        assert_eq!(fields["chunk"], 7);
    }

    #[test]
    fn span_fields_propagate_to_events() {
        let sink = with_layer(|| {
            let outer = tracing::warn_span!("device", device_id = "dev_2");
            let _o = outer.enter();
            let inner = tracing::warn_span!("wake", wake_id = tracing::field::Empty);
            inner.record("wake_id", "wake_3");
            let _i = inner.enter();
            tracing::error!("finalize failed");
        });
        let rows = sink
            .query(&LogQuery {
                device_id: Some("dev_2".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].wake_id.as_deref(), Some("wake_3"));
    }

    #[test]
    fn query_filters_combine() {
        let sink = with_layer(|| {
            tracing::warn!(target: "wakegate_engine::protocol", device_id = "a", "one");
            tracing::error!(target: "wakegate_engine::protocol", device_id = "a", "two");
            tracing::error!(target: "wakegate_store", device_id = "b", "three");
        });
        let errors = sink
            .query(&LogQuery {
                level: Some("error".into()),
                target: Some("engine".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "two");

        let limited = sink
            .query(&LogQuery {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited[0].message, "three");

        let none = sink
            .query(&LogQuery {
                since: Some("2999-01-01T00:00:00.000Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn file_backed_sink_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("wakegate-logs-{}", uuid::Uuid::now_v7()));
        let sink = SqliteLogSink::open(&dir.join("nested/logs.db")).unwrap();
        assert_eq!(sink.count().unwrap(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
