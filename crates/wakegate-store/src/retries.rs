//! Queued retry commands.
//!
//! A retry waits for the device's next scheduled wake: it is dispatched on the
//! first presence inside `[not_before - early_grace, expires_at)` and expires
//! unused otherwise. At most one retry per wake is pending at a time.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use wakegate_core::ids::{DeviceId, RetryId, WakeCycleId};
use wakegate_core::state::RetryStatus;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryRow {
    pub id: RetryId,
    pub wake_id: WakeCycleId,
    pub device_id: DeviceId,
    pub image_name: Option<String>,
    pub attempt: u32,
    pub not_before: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: RetryStatus,
}

#[derive(Clone, Debug)]
pub struct NewRetry {
    pub wake_id: WakeCycleId,
    pub device_id: DeviceId,
    pub image_name: Option<String>,
    pub attempt: u32,
    pub not_before: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct RetryRepo {
    db: Database,
}

const RETRY_COLUMNS: &str = "id, wake_id, device_id, image_name, attempt, not_before, expires_at, status";

fn collect(conn: &Connection, sql: &str, params: &[&dyn rusqlite::types::ToSql]) -> Result<Vec<RetryRow>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_retry(row)?);
    }
    Ok(out)
}

impl RetryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Queue a retry. If one is already pending for the wake, that one is
    /// returned unchanged with `false`.
    #[instrument(skip(self, new), fields(wake_id = %new.wake_id, attempt = new.attempt))]
    pub fn enqueue(&self, new: &NewRetry, now: DateTime<Utc>) -> Result<(RetryRow, bool), StoreError> {
        let now_s = row_helpers::ts(now);
        self.db.with_tx(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO retries
                    (id, wake_id, device_id, image_name, attempt, not_before, expires_at, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)",
                rusqlite::params![
                    RetryId::new().as_str(),
                    new.wake_id.as_str(),
                    new.device_id.as_str(),
                    new.image_name,
                    new.attempt,
                    row_helpers::ts(new.not_before),
                    row_helpers::ts(new.expires_at),
                    now_s,
                ],
            )?;
            let row = collect(
                conn,
                &format!("SELECT {RETRY_COLUMNS} FROM retries WHERE wake_id = ?1 AND status = 'pending'"),
                &[&new.wake_id.as_str()],
            )?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("pending retry for {}", new.wake_id)))?;
            Ok((row, inserted == 1))
        })
    }

    /// Number of retries ever queued for a wake.
    #[instrument(skip(self), fields(wake_id = %wake_id))]
    pub fn count_for_wake(&self, wake_id: &WakeCycleId) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM retries WHERE wake_id = ?1",
                [wake_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// Oldest pending retry of a device that may be dispatched at `now`.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub fn due_for_device(
        &self,
        device_id: &DeviceId,
        now: DateTime<Utc>,
        early_grace: chrono::Duration,
    ) -> Result<Option<RetryRow>, StoreError> {
        let ready = row_helpers::ts(now + early_grace);
        let now_s = row_helpers::ts(now);
        self.db.with_conn(|conn| {
            Ok(collect(
                conn,
                &format!(
                    "SELECT {RETRY_COLUMNS} FROM retries
                     WHERE device_id = ?1 AND status = 'pending' AND not_before <= ?2 AND expires_at > ?3
                     ORDER BY not_before LIMIT 1"
                ),
                &[&device_id.as_str(), &ready, &now_s],
            )?
            .into_iter()
            .next())
        })
    }

    #[instrument(skip(self), fields(wake_id = %wake_id))]
    pub fn list_for_wake(&self, wake_id: &WakeCycleId) -> Result<Vec<RetryRow>, StoreError> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                &format!("SELECT {RETRY_COLUMNS} FROM retries WHERE wake_id = ?1 ORDER BY attempt"),
                &[&wake_id.as_str()],
            )
        })
    }

    /// Pending → dispatched. False when it was no longer pending.
    #[instrument(skip(self), fields(retry_id = %id))]
    pub fn mark_dispatched(&self, id: &RetryId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE retries SET status = 'dispatched', updated_at = ?1 WHERE id = ?2 AND status = 'pending'",
                rusqlite::params![row_helpers::ts(now), id.as_str()],
            )?;
            Ok(changed == 1)
        })
    }

    /// Expire every pending retry whose window has closed.
    #[instrument(skip(self))]
    pub fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<RetryRow>, StoreError> {
        let now_s = row_helpers::ts(now);
        self.db.with_tx(|conn| {
            let due = collect(
                conn,
                &format!("SELECT {RETRY_COLUMNS} FROM retries WHERE status = 'pending' AND expires_at <= ?1"),
                &[&now_s],
            )?;
            conn.execute(
                "UPDATE retries SET status = 'expired', updated_at = ?1 WHERE status = 'pending' AND expires_at <= ?1",
                [&now_s],
            )?;
            Ok(due
                .into_iter()
                .map(|r| RetryRow {
                    status: RetryStatus::Expired,
                    ..r
                })
                .collect())
        })
    }
}

fn row_to_retry(row: &rusqlite::Row<'_>) -> Result<RetryRow, StoreError> {
    const T: &str = "retries";
    let status: String = row_helpers::get(row, 7, T, "status")?;
    Ok(RetryRow {
        id: RetryId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        wake_id: WakeCycleId::from_raw(row_helpers::get::<String>(row, 1, T, "wake_id")?),
        device_id: DeviceId::from_raw(row_helpers::get::<String>(row, 2, T, "device_id")?),
        image_name: row_helpers::get_opt(row, 3, T, "image_name")?,
        attempt: row_helpers::get(row, 4, T, "attempt")?,
        not_before: row_helpers::get_ts(row, 5, T, "not_before")?,
        expires_at: row_helpers::get_ts(row, 6, T, "expires_at")?,
        status: row_helpers::parse_enum(&status, T, "status")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceRepo;
    use crate::wake_cycles::{NewWakeCycle, WakeCycleRepo};
    use chrono::Duration;
    use wakegate_core::state::WakeState;

    fn setup() -> (RetryRepo, DeviceId, WakeCycleId) {
        let db = Database::in_memory().unwrap();
        let dev = DeviceRepo::new(db.clone()).get_or_provision("M1", Utc::now()).unwrap().id;
        let now = Utc::now();
        let wake = WakeCycleRepo::new(db.clone())
            .create(
                &NewWakeCycle {
                    device_id: dev.clone(),
                    site_id: None,
                    captured_at: now,
                    pending_images: 1,
                    telemetry: Default::default(),
                },
                WakeState::Failed,
                now,
            )
            .unwrap()
            .id;
        (RetryRepo::new(db), dev, wake)
    }

    fn new_retry(dev: &DeviceId, wake: &WakeCycleId, not_before: DateTime<Utc>) -> NewRetry {
        NewRetry {
            wake_id: wake.clone(),
            device_id: dev.clone(),
            image_name: Some("img.jpg".into()),
            attempt: 1,
            not_before,
            expires_at: not_before + Duration::minutes(15),
        }
    }

    #[test]
    fn enqueue_dedups_pending() {
        let (repo, dev, wake) = setup();
        let at = Utc::now() + Duration::hours(1);
        let (a, created_a) = repo.enqueue(&new_retry(&dev, &wake, at), Utc::now()).unwrap();
        let (b, created_b) = repo.enqueue(&new_retry(&dev, &wake, at), Utc::now()).unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.id, b.id);
        assert_eq!(repo.count_for_wake(&wake).unwrap(), 1);
    }

    #[test]
    fn due_only_inside_window() {
        let (repo, dev, wake) = setup();
        let now = Utc::now();
        let at = now + Duration::hours(1);
        repo.enqueue(&new_retry(&dev, &wake, at), now).unwrap();
        let grace = Duration::minutes(15);

        assert!(repo.due_for_device(&dev, now, grace).unwrap().is_none());
        assert!(repo
            .due_for_device(&dev, at - Duration::minutes(5), grace)
            .unwrap()
            .is_some());
        assert!(repo
            .due_for_device(&dev, at + Duration::minutes(20), grace)
            .unwrap()
            .is_none());
    }

    #[test]
    fn dispatch_then_requeue() {
        let (repo, dev, wake) = setup();
        let now = Utc::now();
        let (r, _) = repo.enqueue(&new_retry(&dev, &wake, now), now).unwrap();
        assert!(repo.mark_dispatched(&r.id, now).unwrap());
        assert!(!repo.mark_dispatched(&r.id, now).unwrap());
        let (second, created) = repo.enqueue(&new_retry(&dev, &wake, now), now).unwrap();
        assert!(created);
        assert_ne!(second.id, r.id);
        assert_eq!(repo.count_for_wake(&wake).unwrap(), 2);
    }

    #[test]
    fn expire_due_marks_expired() {
        let (repo, dev, wake) = setup();
        let past = Utc::now() - Duration::hours(2);
        repo.enqueue(&new_retry(&dev, &wake, past), past).unwrap();
        let expired = repo.expire_due(Utc::now()).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, RetryStatus::Expired);
        assert!(repo.expire_due(Utc::now()).unwrap().is_empty());
        assert_eq!(repo.list_for_wake(&wake).unwrap()[0].status, RetryStatus::Expired);
    }
}
