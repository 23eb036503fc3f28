//! Site-day sessions and their outcome counters.
//!
//! Counters only move inside [`SessionRepo::record_outcome`], which applies
//! the per-wake outcome row and the counter delta in one transaction. A wake
//! has at most one outcome row, so counts can never exceed the number of
//! recorded wakes.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use wakegate_core::ids::{DeviceId, SessionId, SiteId, WakeCycleId};
use wakegate_core::state::{SessionStatus, WakeOutcome};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub id: SessionId,
    pub site_id: SiteId,
    pub local_date: NaiveDate,
    pub timezone: String,
    pub day_start_utc: DateTime<Utc>,
    pub day_end_utc: DateTime<Utc>,
    pub expected_wake_count: u32,
    pub expected_approximate: bool,
    pub schedule_fingerprint: String,
    pub completed_count: u32,
    pub failed_count: u32,
    pub overage_count: u32,
    pub status: SessionStatus,
    pub locked_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct NewSession {
    pub site_id: SiteId,
    pub local_date: NaiveDate,
    pub timezone: String,
    pub day_start_utc: DateTime<Utc>,
    pub day_end_utc: DateTime<Utc>,
    pub expected_wake_count: u32,
    pub schedule_fingerprint: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRow {
    pub wake_id: WakeCycleId,
    pub session_id: SessionId,
    pub device_id: DeviceId,
    pub outcome: WakeOutcome,
    pub slot_at: Option<DateTime<Utc>>,
}

/// What `record_outcome` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeChange {
    Recorded,
    Unchanged,
    Replaced { previous: WakeOutcome },
}

pub struct SessionRepo {
    db: Database,
}

const SESSION_COLUMNS: &str = "id, site_id, local_date, timezone, day_start_utc, day_end_utc,
     expected_wake_count, expected_approximate, schedule_fingerprint,
     completed_count, failed_count, overage_count, status, locked_at";

fn counter_column(outcome: WakeOutcome) -> &'static str {
    match outcome {
        WakeOutcome::Completed => "completed_count",
        WakeOutcome::Failed => "failed_count",
        WakeOutcome::Overage => "overage_count",
    }
}

fn select_one(conn: &Connection, id: &SessionId) -> Result<SessionRow, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_session(row),
        None => Err(StoreError::NotFound(format!("session {id}"))),
    }
}

fn select_by_day(
    conn: &Connection,
    site_id: &SiteId,
    local_date: NaiveDate,
) -> Result<Option<SessionRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE site_id = ?1 AND local_date = ?2"
    ))?;
    let mut rows = stmt.query(rusqlite::params![site_id.as_str(), local_date.to_string()])?;
    rows.next()?.map(row_to_session).transpose()
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Idempotent on (site, local_date). The flag is true when this call
    /// created the row.
    #[instrument(skip(self, new), fields(site_id = %new.site_id, local_date = %new.local_date))]
    pub fn get_or_create(&self, new: &NewSession, now: DateTime<Utc>) -> Result<(SessionRow, bool), StoreError> {
        let now_s = row_helpers::ts(now);
        self.db.with_tx(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO sessions
                    (id, site_id, local_date, timezone, day_start_utc, day_end_utc, expected_wake_count,
                     schedule_fingerprint, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'in_progress', ?9, ?9)",
                rusqlite::params![
                    SessionId::new().as_str(),
                    new.site_id.as_str(),
                    new.local_date.to_string(),
                    new.timezone,
                    row_helpers::ts(new.day_start_utc),
                    row_helpers::ts(new.day_end_utc),
                    new.expected_wake_count,
                    new.schedule_fingerprint,
                    now_s,
                ],
            )?;
            let row = select_by_day(conn, &new.site_id, new.local_date)?
                .ok_or_else(|| StoreError::NotFound(format!("session {} {}", new.site_id, new.local_date)))?;
            if inserted == 1 {
                info!(session_id = %row.id, expected = row.expected_wake_count, "session created");
            }
            Ok((row, inserted == 1))
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| select_one(conn, id))
    }

    #[instrument(skip(self), fields(site_id = %site_id))]
    pub fn find(&self, site_id: &SiteId, local_date: NaiveDate) -> Result<Option<SessionRow>, StoreError> {
        self.db.with_conn(|conn| select_by_day(conn, site_id, local_date))
    }

    #[instrument(skip(self), fields(site_id = %site_id))]
    pub fn list_for_site(&self, site_id: &SiteId) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE site_id = ?1 ORDER BY local_date"
            ))?;
            let mut rows = stmt.query([site_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_session(row)?);
            }
            Ok(out)
        })
    }

    /// Mark the expected count as approximate (schedule changed mid-day).
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn flag_approximate(&self, id: &SessionId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET expected_approximate = 1, updated_at = ?1
                 WHERE id = ?2 AND expected_approximate = 0",
                rusqlite::params![row_helpers::ts(now), id.as_str()],
            )?;
            Ok(changed == 1)
        })
    }

    /// Apply one wake's outcome. Re-recording the same outcome is a no-op; a
    /// different outcome for the same wake (a retry that later succeeded)
    /// moves the count between columns. Locked sessions refuse with `Conflict`.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self), fields(session_id = %session_id, wake_id = %wake_id, outcome = %outcome))]
    pub fn record_outcome(
        &self,
        session_id: &SessionId,
        wake_id: &WakeCycleId,
        device_id: &DeviceId,
        outcome: WakeOutcome,
        slot_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<OutcomeChange, StoreError> {
        let now_s = row_helpers::ts(now);
        self.db.with_tx(|conn| {
            let session = select_one(conn, session_id)?;
            if session.status == SessionStatus::Locked {
                return Err(StoreError::Conflict(format!("session {session_id} is locked")));
            }

            let existing: Option<(String, String)> = conn
                .query_row(
                    "SELECT session_id, outcome FROM session_outcomes WHERE wake_id = ?1",
                    [wake_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            let change = match existing {
                Some((owner, _)) if owner != session_id.as_str() => {
                    return Err(StoreError::Conflict(format!(
                        "wake {wake_id} already counted in session {owner}"
                    )));
                }
                Some((_, prev)) => {
                    let previous: WakeOutcome =
                        row_helpers::parse_enum(&prev, "session_outcomes", "outcome")?;
                    if previous == outcome {
                        return Ok(OutcomeChange::Unchanged);
                    }
                    conn.execute(
                        "UPDATE session_outcomes SET outcome = ?1, slot_at = ?2, recorded_at = ?3 WHERE wake_id = ?4",
                        rusqlite::params![
                            outcome.as_str(),
                            row_helpers::ts_opt(slot_at),
                            now_s,
                            wake_id.as_str()
                        ],
                    )?;
                    conn.execute(
                        &format!(
                            "UPDATE sessions SET {col} = {col} - 1 WHERE id = ?1 AND {col} > 0",
                            col = counter_column(previous)
                        ),
                        [session_id.as_str()],
                    )?;
                    OutcomeChange::Replaced { previous }
                }
                None => {
                    conn.execute(
                        "INSERT INTO session_outcomes (wake_id, session_id, device_id, outcome, slot_at, recorded_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        rusqlite::params![
                            wake_id.as_str(),
                            session_id.as_str(),
                            device_id.as_str(),
                            outcome.as_str(),
                            row_helpers::ts_opt(slot_at),
                            now_s
                        ],
                    )?;
                    OutcomeChange::Recorded
                }
            };

            conn.execute(
                &format!(
                    "UPDATE sessions SET {col} = {col} + 1, updated_at = ?1 WHERE id = ?2",
                    col = counter_column(outcome)
                ),
                rusqlite::params![now_s, session_id.as_str()],
            )?;
            Ok(change)
        })
    }

    /// Expected slots already matched by completed wakes of a device.
    #[instrument(skip(self), fields(session_id = %session_id, device_id = %device_id))]
    pub fn claimed_slots(
        &self,
        session_id: &SessionId,
        device_id: &DeviceId,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT slot_at FROM session_outcomes
                 WHERE session_id = ?1 AND device_id = ?2 AND slot_at IS NOT NULL ORDER BY slot_at",
            )?;
            let mut rows = stmt.query([session_id.as_str(), device_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_helpers::get_ts(row, 0, "session_outcomes", "slot_at")?);
            }
            Ok(out)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn outcomes(&self, session_id: &SessionId) -> Result<Vec<OutcomeRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT wake_id, session_id, device_id, outcome, slot_at FROM session_outcomes
                 WHERE session_id = ?1 ORDER BY recorded_at",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                const T: &str = "session_outcomes";
                let outcome: String = row_helpers::get(row, 3, T, "outcome")?;
                out.push(OutcomeRow {
                    wake_id: WakeCycleId::from_raw(row_helpers::get::<String>(row, 0, T, "wake_id")?),
                    session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, T, "session_id")?),
                    device_id: DeviceId::from_raw(row_helpers::get::<String>(row, 2, T, "device_id")?),
                    outcome: row_helpers::parse_enum(&outcome, T, "outcome")?,
                    slot_at: row_helpers::get_ts_opt(row, 4, T, "slot_at")?,
                });
            }
            Ok(out)
        })
    }

    /// Lock every in-progress session whose local day has ended.
    #[instrument(skip(self))]
    pub fn lock_expired(&self, now: DateTime<Utc>) -> Result<Vec<SessionRow>, StoreError> {
        let now_s = row_helpers::ts(now);
        self.db.with_tx(|conn| {
            let ids: Vec<String> = conn
                .prepare("SELECT id FROM sessions WHERE status = 'in_progress' AND day_end_utc <= ?1")?
                .query_map([&now_s], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            let mut locked = Vec::with_capacity(ids.len());
            for id in ids {
                conn.execute(
                    "UPDATE sessions SET status = 'locked', locked_at = ?1, updated_at = ?1
                     WHERE id = ?2 AND status = 'in_progress'",
                    rusqlite::params![now_s, id],
                )?;
                locked.push(select_one(conn, &SessionId::from_raw(id))?);
            }
            Ok(locked)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    const T: &str = "sessions";
    let local_date: String = row_helpers::get(row, 2, T, "local_date")?;
    let status: String = row_helpers::get(row, 12, T, "status")?;
    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        site_id: SiteId::from_raw(row_helpers::get::<String>(row, 1, T, "site_id")?),
        local_date: local_date.parse().map_err(|e| StoreError::CorruptRow {
            table: T,
            column: "local_date",
            detail: format!("{local_date:?}: {e}"),
        })?,
        timezone: row_helpers::get(row, 3, T, "timezone")?,
        day_start_utc: row_helpers::get_ts(row, 4, T, "day_start_utc")?,
        day_end_utc: row_helpers::get_ts(row, 5, T, "day_end_utc")?,
        expected_wake_count: row_helpers::get(row, 6, T, "expected_wake_count")?,
        expected_approximate: row_helpers::get(row, 7, T, "expected_approximate")?,
        schedule_fingerprint: row_helpers::get(row, 8, T, "schedule_fingerprint")?,
        completed_count: row_helpers::get(row, 9, T, "completed_count")?,
        failed_count: row_helpers::get(row, 10, T, "failed_count")?,
        overage_count: row_helpers::get(row, 11, T, "overage_count")?,
        status: row_helpers::parse_enum(&status, T, "status")?,
        locked_at: row_helpers::get_ts_opt(row, 13, T, "locked_at")?,
    })
}
