use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use wakegate_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One persisted snapshot round. `site_state` is the aggregated document the
/// engine produced; this layer treats it as opaque JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRow {
    pub session_id: SessionId,
    pub round_index: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub site_state: serde_json::Value,
    pub generated_at: DateTime<Utc>,
}

pub struct SnapshotRepo {
    db: Database,
}

impl SnapshotRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or overwrite the record for (session, round_index).
    #[instrument(skip(self, snapshot), fields(session_id = %snapshot.session_id, round = snapshot.round_index))]
    pub fn upsert(&self, snapshot: &SnapshotRow) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO snapshots (session_id, round_index, window_start, window_end, site_state, generated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_id, round_index) DO UPDATE SET
                    window_start = excluded.window_start,
                    window_end = excluded.window_end,
                    site_state = excluded.site_state,
                    generated_at = excluded.generated_at",
                rusqlite::params![
                    snapshot.session_id.as_str(),
                    snapshot.round_index,
                    row_helpers::ts(snapshot.window_start),
                    row_helpers::ts(snapshot.window_end),
                    serde_json::to_string(&snapshot.site_state)?,
                    row_helpers::ts(snapshot.generated_at),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn get(&self, session_id: &SessionId, round_index: u32) -> Result<Option<SnapshotRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, round_index, window_start, window_end, site_state, generated_at
                 FROM snapshots WHERE session_id = ?1 AND round_index = ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), round_index])?;
            rows.next()?.map(row_to_snapshot).transpose()
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<SnapshotRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, round_index, window_start, window_end, site_state, generated_at
                 FROM snapshots WHERE session_id = ?1 ORDER BY round_index",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_snapshot(row)?);
            }
            Ok(out)
        })
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> Result<SnapshotRow, StoreError> {
    let state: String = row_helpers::get(row, 4, "snapshots", "site_state")?;
    Ok(SnapshotRow {
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "snapshots", "session_id")?),
        round_index: row_helpers::get(row, 1, "snapshots", "round_index")?,
        window_start: row_helpers::get_ts(row, 2, "snapshots", "window_start")?,
        window_end: row_helpers::get_ts(row, 3, "snapshots", "window_end")?,
        site_state: row_helpers::parse_json(&state, "snapshots", "site_state")?,
        generated_at: row_helpers::get_ts(row, 5, "snapshots", "generated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{NewSession, SessionRepo};
    use crate::sites::{SiteRepo, SiteRow};
    use chrono::Duration;
    use serde_json::json;
    use wakegate_core::ids::SiteId;

    fn setup() -> (SnapshotRepo, SessionId) {
        let db = Database::in_memory().unwrap();
        let site = SiteId::from_raw("site-1");
        SiteRepo::new(db.clone())
            .upsert(&SiteRow {
                id: site.clone(),
                name: "Site".into(),
                tenant_id: "t".into(),
                timezone: "UTC".into(),
                wake_schedule: None,
            })
            .unwrap();
        let now = Utc::now();
        let (session, _) = SessionRepo::new(db.clone())
            .get_or_create(
                &NewSession {
                    site_id: site,
                    local_date: now.date_naive(),
                    timezone: "UTC".into(),
                    day_start_utc: now,
                    day_end_utc: now + Duration::days(1),
                    expected_wake_count: 24,
                    schedule_fingerprint: "fp".into(),
                },
                now,
            )
            .unwrap();
        (SnapshotRepo::new(db), session.id)
    }

    fn snapshot(session: &SessionId, round: u32, state: serde_json::Value) -> SnapshotRow {
        let start = Utc::now();
        SnapshotRow {
            session_id: session.clone(),
            round_index: round,
            window_start: start,
            window_end: start + Duration::hours(1),
            site_state: state,
            generated_at: start,
        }
    }

    #[test]
    fn upsert_overwrites_same_round() {
        let (repo, session) = setup();
        repo.upsert(&snapshot(&session, 0, json!({"v": 1}))).unwrap();
        repo.upsert(&snapshot(&session, 0, json!({"v": 2}))).unwrap();
        let all = repo.list(&session).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].site_state, json!({"v": 2}));
    }

    #[test]
    fn rounds_are_independent() {
        let (repo, session) = setup();
        repo.upsert(&snapshot(&session, 0, json!({}))).unwrap();
        repo.upsert(&snapshot(&session, 1, json!({}))).unwrap();
        assert_eq!(repo.list(&session).unwrap().len(), 2);
        assert!(repo.get(&session, 1).unwrap().is_some());
        assert!(repo.get(&session, 7).unwrap().is_none());
    }
}
