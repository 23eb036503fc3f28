//! Image scores written by the external scorer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use wakegate_core::ids::{DeviceId, WakeCycleId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageScoreRow {
    pub device_id: DeviceId,
    pub wake_id: Option<WakeCycleId>,
    pub captured_at: DateTime<Utc>,
    pub score: f64,
}

pub struct ImageScoreRepo {
    db: Database,
}

impl ImageScoreRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, score), fields(device_id = %score.device_id))]
    pub fn insert(&self, score: &ImageScoreRow) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO image_scores (device_id, wake_id, captured_at, score, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    score.device_id.as_str(),
                    score.wake_id.as_ref().map(WakeCycleId::as_str),
                    row_helpers::ts(score.captured_at),
                    score.score,
                    row_helpers::ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    /// Scores of one device captured in `[start, end)`, oldest first.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub fn list_between(
        &self,
        device_id: &DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ImageScoreRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, wake_id, captured_at, score FROM image_scores
                 WHERE device_id = ?1 AND captured_at >= ?2 AND captured_at < ?3
                 ORDER BY captured_at",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                device_id.as_str(),
                row_helpers::ts(start),
                row_helpers::ts(end)
            ])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_score(row)?);
            }
            Ok(out)
        })
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    pub fn latest_before(
        &self,
        device_id: &DeviceId,
        before: DateTime<Utc>,
    ) -> Result<Option<ImageScoreRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, wake_id, captured_at, score FROM image_scores
                 WHERE device_id = ?1 AND captured_at < ?2
                 ORDER BY captured_at DESC LIMIT 1",
            )?;
            let mut rows = stmt.query(rusqlite::params![device_id.as_str(), row_helpers::ts(before)])?;
            rows.next()?.map(row_to_score).transpose()
        })
    }
}

fn row_to_score(row: &rusqlite::Row<'_>) -> Result<ImageScoreRow, StoreError> {
    Ok(ImageScoreRow {
        device_id: DeviceId::from_raw(row_helpers::get::<String>(row, 0, "image_scores", "device_id")?),
        wake_id: row_helpers::get_opt::<String>(row, 1, "image_scores", "wake_id")?.map(WakeCycleId::from_raw),
        captured_at: row_helpers::get_ts(row, 2, "image_scores", "captured_at")?,
        score: row_helpers::get(row, 3, "image_scores", "score")?,
    })
}
