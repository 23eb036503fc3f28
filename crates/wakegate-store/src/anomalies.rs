//! Protocol anomalies: messages that were accepted but looked wrong.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use wakegate_core::ids::DeviceId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRow {
    pub device_id: Option<DeviceId>,
    pub mac: String,
    pub kind: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

pub struct AnomalyRepo {
    db: Database,
}

impl AnomalyRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, anomaly), fields(mac = %anomaly.mac, kind = %anomaly.kind))]
    pub fn record(&self, anomaly: &AnomalyRow) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO anomalies (device_id, mac, kind, detail, at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    anomaly.device_id.as_ref().map(DeviceId::as_str),
                    anomaly.mac,
                    anomaly.kind,
                    anomaly.detail,
                    row_helpers::ts(anomaly.at),
                ],
            )?;
            Ok(())
        })
    }

    /// Anomalies for a MAC, oldest first.
    #[instrument(skip(self))]
    pub fn list_for_mac(&self, mac: &str) -> Result<Vec<AnomalyRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, mac, kind, detail, at FROM anomalies WHERE mac = ?1 ORDER BY id",
            )?;
            let mut rows = stmt.query([mac])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                const T: &str = "anomalies";
                out.push(AnomalyRow {
                    device_id: row_helpers::get_opt::<String>(row, 0, T, "device_id")?.map(DeviceId::from_raw),
                    mac: row_helpers::get(row, 1, T, "mac")?,
                    kind: row_helpers::get(row, 2, T, "kind")?,
                    detail: row_helpers::get(row, 3, T, "detail")?,
                    at: row_helpers::get_ts(row, 4, T, "at")?,
                });
            }
            Ok(out)
        })
    }

    #[instrument(skip(self))]
    pub fn count_by_kind(&self, kind: &str) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM anomalies WHERE kind = ?1", [kind], |row| row.get(0))?)
        })
    }
}
