//! Wake cycle records and their transition journal.
//!
//! State changes go through [`WakeCycleRepo::transition`], a compare-and-swap
//! on the current state, and every change appends a `wake_transitions` row in
//! the same transaction. Validity of a transition is decided by the caller;
//! this layer only guarantees it is applied against the state the caller saw.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use wakegate_core::commands::OutboundCommand;
use wakegate_core::ids::{DeviceId, SessionId, SiteId, WakeCycleId};
use wakegate_core::state::WakeState;
use wakegate_core::telemetry::TelemetryReading;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WakeCycleRow {
    pub id: WakeCycleId,
    pub device_id: DeviceId,
    pub site_id: Option<SiteId>,
    pub session_id: Option<SessionId>,
    pub state: WakeState,
    pub captured_at: DateTime<Utc>,
    pub pending_images: u32,
    pub telemetry: TelemetryReading,
    pub image_name: Option<String>,
    pub image_size: Option<u64>,
    pub image_key: Option<String>,
    pub is_overage: bool,
    pub retry_count: u32,
    pub error_code: Option<i64>,
    pub failure_reason: Option<String>,
    pub last_command: Option<OutboundCommand>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct NewWakeCycle {
    pub device_id: DeviceId,
    pub site_id: Option<SiteId>,
    pub captured_at: DateTime<Utc>,
    pub pending_images: u32,
    pub telemetry: TelemetryReading,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionRow {
    pub from: Option<WakeState>,
    pub to: WakeState,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct WakeCycleRepo {
    db: Database,
}

const WAKE_COLUMNS: &str = "id, device_id, site_id, session_id, protocol_state, captured_at,
     pending_images, telemetry, image_name, image_size, image_key, is_overage, retry_count,
     error_code, failure_reason, last_command, created_at, updated_at, completed_at";

fn journal(
    conn: &Connection,
    id: &WakeCycleId,
    from: Option<WakeState>,
    to: WakeState,
    reason: Option<&str>,
    at: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO wake_transitions (wake_id, from_state, to_state, reason, at) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![id.as_str(), from.map(|s| s.as_str()), to.as_str(), reason, at],
    )?;
    Ok(())
}

fn select_one(conn: &Connection, id: &WakeCycleId) -> Result<WakeCycleRow, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {WAKE_COLUMNS} FROM wake_cycles WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_wake(row),
        None => Err(StoreError::NotFound(format!("wake cycle {id}"))),
    }
}

fn select_many(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<WakeCycleRow>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_wake(row)?);
    }
    Ok(out)
}

impl WakeCycleRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a wake cycle in `initial` state and journal its creation.
    #[instrument(skip(self, new), fields(device_id = %new.device_id, state = %initial))]
    pub fn create(
        &self,
        new: &NewWakeCycle,
        initial: WakeState,
        now: DateTime<Utc>,
    ) -> Result<WakeCycleRow, StoreError> {
        let id = WakeCycleId::new();
        let now_s = row_helpers::ts(now);
        self.db.with_tx(|conn| {
            conn.execute(
                "INSERT INTO wake_cycles (id, device_id, site_id, protocol_state, captured_at, pending_images,
                                          telemetry, created_at, updated_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9)",
                rusqlite::params![
                    id.as_str(),
                    new.device_id.as_str(),
                    new.site_id.as_ref().map(SiteId::as_str),
                    initial.as_str(),
                    row_helpers::ts(new.captured_at),
                    new.pending_images,
                    serde_json::to_string(&new.telemetry)?,
                    now_s,
                    initial.is_terminal().then_some(&now_s),
                ],
            )?;
            journal(conn, &id, None, initial, Some("created"), &now_s)?;
            select_one(conn, &id)
        })
    }

    #[instrument(skip(self), fields(wake_id = %id))]
    pub fn get(&self, id: &WakeCycleId) -> Result<WakeCycleRow, StoreError> {
        self.db.with_conn(|conn| select_one(conn, id))
    }

    /// Move `id` from `from` to `to`. Fails with `Conflict` when the stored
    /// state is no longer `from`.
    #[instrument(skip(self), fields(wake_id = %id))]
    pub fn transition(
        &self,
        id: &WakeCycleId,
        from: WakeState,
        to: WakeState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WakeCycleRow, StoreError> {
        let now_s = row_helpers::ts(now);
        self.db.with_tx(|conn| {
            let changed = conn.execute(
                "UPDATE wake_cycles SET protocol_state = ?1, updated_at = ?2,
                        completed_at = CASE WHEN ?3 THEN ?2 ELSE completed_at END
                 WHERE id = ?4 AND protocol_state = ?5",
                rusqlite::params![to.as_str(), now_s, to.is_terminal(), id.as_str(), from.as_str()],
            )?;
            if changed == 0 {
                let current = select_one(conn, id)?;
                return Err(StoreError::Conflict(format!(
                    "wake cycle {id} is {} not {from}",
                    current.state
                )));
            }
            journal(conn, id, Some(from), to, reason, &now_s)?;
            debug!(from = %from, to = %to, "wake transition");
            select_one(conn, id)
        })
    }

    /// Explicit retry reset: a failed or timed-out wake goes back to
    /// `capture_requested` with its retry counter bumped.
    #[instrument(skip(self), fields(wake_id = %id))]
    pub fn reset_for_retry(&self, id: &WakeCycleId, now: DateTime<Utc>) -> Result<WakeCycleRow, StoreError> {
        let now_s = row_helpers::ts(now);
        self.db.with_tx(|conn| {
            let current = select_one(conn, id)?;
            if !current.state.can_reset_for_retry() {
                return Err(StoreError::Conflict(format!(
                    "wake cycle {id} in state {} cannot be reset",
                    current.state
                )));
            }
            conn.execute(
                "UPDATE wake_cycles SET protocol_state = ?1, retry_count = retry_count + 1,
                        error_code = NULL, failure_reason = NULL, completed_at = NULL, updated_at = ?2
                 WHERE id = ?3 AND protocol_state = ?4",
                rusqlite::params![
                    WakeState::CaptureRequested.as_str(),
                    now_s,
                    id.as_str(),
                    current.state.as_str()
                ],
            )?;
            journal(
                conn,
                id,
                Some(current.state),
                WakeState::CaptureRequested,
                Some("retry_reset"),
                &now_s,
            )?;
            select_one(conn, id)
        })
    }

    #[instrument(skip(self), fields(wake_id = %id))]
    pub fn assign_session(&self, id: &WakeCycleId, session_id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE wake_cycles SET session_id = ?1 WHERE id = ?2",
                rusqlite::params![session_id.as_str(), id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Merge new readings into the stored telemetry; optionally move
    /// `captured_at` to the device-reported capture time.
    #[instrument(skip(self, reading), fields(wake_id = %id))]
    pub fn record_telemetry(
        &self,
        id: &WakeCycleId,
        reading: &TelemetryReading,
        captured_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db.with_tx(|conn| {
            let mut current = select_one(conn, id)?.telemetry;
            current.merge(reading);
            conn.execute(
                "UPDATE wake_cycles SET telemetry = ?1, captured_at = COALESCE(?2, captured_at), updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![
                    serde_json::to_string(&current)?,
                    row_helpers::ts_opt(captured_at),
                    row_helpers::ts(now),
                    id.as_str()
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(wake_id = %id))]
    pub fn record_image(
        &self,
        id: &WakeCycleId,
        image_name: &str,
        image_size: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE wake_cycles SET image_name = ?1, image_size = COALESCE(?2, image_size), updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![
                    image_name,
                    image_size.map(|s| s as i64),
                    row_helpers::ts(now),
                    id.as_str()
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(wake_id = %id))]
    pub fn set_image_key(&self, id: &WakeCycleId, key: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE wake_cycles SET image_key = ?1 WHERE id = ?2",
                rusqlite::params![key, id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(wake_id = %id))]
    pub fn record_failure(
        &self,
        id: &WakeCycleId,
        reason: &str,
        error_code: Option<i64>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE wake_cycles SET failure_reason = ?1, error_code = COALESCE(?2, error_code) WHERE id = ?3",
                rusqlite::params![reason, error_code, id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(wake_id = %id))]
    pub fn set_overage(&self, id: &WakeCycleId, is_overage: bool) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE wake_cycles SET is_overage = ?1 WHERE id = ?2",
                rusqlite::params![is_overage, id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self, command), fields(wake_id = %id))]
    pub fn set_last_command(&self, id: &WakeCycleId, command: &OutboundCommand) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE wake_cycles SET last_command = ?1 WHERE id = ?2",
                rusqlite::params![serde_json::to_string(command)?, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Non-terminal wake cycles whose last update is older than `updated_before`.
    #[instrument(skip(self))]
    pub fn list_stale(&self, updated_before: DateTime<Utc>) -> Result<Vec<WakeCycleRow>, StoreError> {
        let states = WakeState::NON_TERMINAL
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let cutoff = row_helpers::ts(updated_before);
        self.db.with_conn(|conn| {
            select_many(
                conn,
                &format!(
                    "SELECT {WAKE_COLUMNS} FROM wake_cycles
                     WHERE protocol_state IN ({states}) AND updated_at < ?1
                     ORDER BY updated_at"
                ),
                &[&cutoff],
            )
        })
    }

    /// Wake cycles of one device taken at `site_id`, captured in `[start, end)`.
    /// Wakes from before a remap stay with the site they were taken at.
    #[instrument(skip(self), fields(device_id = %device_id, site_id = %site_id))]
    pub fn list_for_device_between(
        &self,
        device_id: &DeviceId,
        site_id: &SiteId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WakeCycleRow>, StoreError> {
        let (start, end) = (row_helpers::ts(start), row_helpers::ts(end));
        self.db.with_conn(|conn| {
            select_many(
                conn,
                &format!(
                    "SELECT {WAKE_COLUMNS} FROM wake_cycles
                     WHERE device_id = ?1 AND site_id = ?2 AND captured_at >= ?3 AND captured_at < ?4
                     ORDER BY captured_at"
                ),
                &[&device_id.as_str(), &site_id.as_str(), &start, &end],
            )
        })
    }

    /// Devices with at least one wake at `site_id` captured in `[start, end)`.
    #[instrument(skip(self), fields(site_id = %site_id))]
    pub fn device_ids_at_site_between(
        &self,
        site_id: &SiteId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DeviceId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT device_id FROM wake_cycles
                 WHERE site_id = ?1 AND captured_at >= ?2 AND captured_at < ?3
                 ORDER BY device_id",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                site_id.as_str(),
                row_helpers::ts(start),
                row_helpers::ts(end)
            ])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(DeviceId::from_raw(row_helpers::get::<String>(
                    row,
                    0,
                    "wake_cycles",
                    "device_id",
                )?));
            }
            Ok(out)
        })
    }

    /// Most recent wake of a device at `site_id`, captured before `before`,
    /// that carried telemetry.
    #[instrument(skip(self), fields(device_id = %device_id, site_id = %site_id))]
    pub fn latest_with_telemetry_before(
        &self,
        device_id: &DeviceId,
        site_id: &SiteId,
        before: DateTime<Utc>,
    ) -> Result<Option<WakeCycleRow>, StoreError> {
        let before = row_helpers::ts(before);
        self.db.with_conn(|conn| {
            let found = select_many(
                conn,
                &format!(
                    "SELECT {WAKE_COLUMNS} FROM wake_cycles
                     WHERE device_id = ?1 AND site_id = ?2 AND captured_at < ?3 AND telemetry != '{{}}'
                     ORDER BY captured_at DESC LIMIT 1"
                ),
                &[&device_id.as_str(), &site_id.as_str(), &before],
            )?;
            Ok(found.into_iter().next())
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_for_session(&self, session_id: &SessionId) -> Result<Vec<WakeCycleRow>, StoreError> {
        self.db.with_conn(|conn| {
            select_many(
                conn,
                &format!("SELECT {WAKE_COLUMNS} FROM wake_cycles WHERE session_id = ?1 ORDER BY captured_at"),
                &[&session_id.as_str()],
            )
        })
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    pub fn count_for_device(&self, device_id: &DeviceId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM wake_cycles WHERE device_id = ?1",
                [device_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    #[instrument(skip(self), fields(wake_id = %id))]
    pub fn transitions(&self, id: &WakeCycleId) -> Result<Vec<TransitionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT from_state, to_state, reason, at FROM wake_transitions WHERE wake_id = ?1 ORDER BY id",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let from: Option<String> = row_helpers::get_opt(row, 0, "wake_transitions", "from_state")?;
                let to: String = row_helpers::get(row, 1, "wake_transitions", "to_state")?;
                out.push(TransitionRow {
                    from: from
                        .map(|s| row_helpers::parse_enum(&s, "wake_transitions", "from_state"))
                        .transpose()?,
                    to: row_helpers::parse_enum(&to, "wake_transitions", "to_state")?,
                    reason: row_helpers::get_opt(row, 2, "wake_transitions", "reason")?,
                    at: row_helpers::get_ts(row, 3, "wake_transitions", "at")?,
                });
            }
            Ok(out)
        })
    }
}

fn row_to_wake(row: &rusqlite::Row<'_>) -> Result<WakeCycleRow, StoreError> {
    const T: &str = "wake_cycles";
    let state: String = row_helpers::get(row, 4, T, "protocol_state")?;
    let telemetry: String = row_helpers::get(row, 7, T, "telemetry")?;
    let last_command: Option<String> = row_helpers::get_opt(row, 15, T, "last_command")?;
    Ok(WakeCycleRow {
        id: WakeCycleId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        device_id: DeviceId::from_raw(row_helpers::get::<String>(row, 1, T, "device_id")?),
        site_id: row_helpers::get_opt::<String>(row, 2, T, "site_id")?.map(SiteId::from_raw),
        session_id: row_helpers::get_opt::<String>(row, 3, T, "session_id")?.map(SessionId::from_raw),
        state: row_helpers::parse_enum(&state, T, "protocol_state")?,
        captured_at: row_helpers::get_ts(row, 5, T, "captured_at")?,
        pending_images: row_helpers::get(row, 6, T, "pending_images")?,
        telemetry: row_helpers::parse_json(&telemetry, T, "telemetry")?,
        image_name: row_helpers::get_opt(row, 8, T, "image_name")?,
        image_size: row_helpers::get_opt::<i64>(row, 9, T, "image_size")?.map(|s| s as u64),
        image_key: row_helpers::get_opt(row, 10, T, "image_key")?,
        is_overage: row_helpers::get(row, 11, T, "is_overage")?,
        retry_count: row_helpers::get(row, 12, T, "retry_count")?,
        error_code: row_helpers::get_opt(row, 13, T, "error_code")?,
        failure_reason: row_helpers::get_opt(row, 14, T, "failure_reason")?,
        last_command: last_command
            .map(|raw| row_helpers::parse_json(&raw, T, "last_command"))
            .transpose()?,
        created_at: row_helpers::get_ts(row, 16, T, "created_at")?,
        updated_at: row_helpers::get_ts(row, 17, T, "updated_at")?,
        completed_at: row_helpers::get_ts_opt(row, 18, T, "completed_at")?,
    })
}
