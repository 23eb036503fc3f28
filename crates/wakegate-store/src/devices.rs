use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use wakegate_core::ids::{DeviceId, SiteId, WakeCycleId};
use wakegate_core::state::WakeState;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceRow {
    pub id: DeviceId,
    pub mac: String,
    pub site_id: Option<SiteId>,
    pub wake_schedule: Option<String>,
    pub protocol_state: Option<WakeState>,
    pub current_wake_id: Option<WakeCycleId>,
    pub last_wake_at: Option<DateTime<Utc>>,
    pub next_wake_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeviceRow {
    pub fn is_mapped(&self) -> bool {
        self.site_id.is_some()
    }
}

pub struct DeviceRepo {
    db: Database,
}

const DEVICE_COLUMNS: &str = "id, mac, site_id, wake_schedule, protocol_state, current_wake_id,
     last_wake_at, next_wake_at, last_seen_at, created_at";

impl DeviceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Return the device for `mac`, creating an unmapped record on first contact.
    #[instrument(skip(self))]
    pub fn get_or_provision(&self, mac: &str, now: DateTime<Utc>) -> Result<DeviceRow, StoreError> {
        self.db.with_conn(|conn| {
            let now = row_helpers::ts(now);
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO devices (id, mac, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![DeviceId::new().as_str(), mac, now],
            )?;
            if inserted == 1 {
                info!(mac, "device auto-provisioned");
            }
            let mut stmt = conn.prepare(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE mac = ?1"))?;
            let mut rows = stmt.query([mac])?;
            match rows.next()? {
                Some(row) => row_to_device(row),
                None => Err(StoreError::NotFound(format!("device {mac}"))),
            }
        })
    }

    #[instrument(skip(self), fields(device_id = %id))]
    pub fn get(&self, id: &DeviceId) -> Result<DeviceRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_device(row),
                None => Err(StoreError::NotFound(format!("device {id}"))),
            }
        })
    }

    #[instrument(skip(self))]
    pub fn find_by_mac(&self, mac: &str) -> Result<Option<DeviceRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE mac = ?1"))?;
            let mut rows = stmt.query([mac])?;
            rows.next()?.map(row_to_device).transpose()
        })
    }

    #[instrument(skip(self), fields(site_id = %site_id))]
    pub fn list_by_site(&self, site_id: &SiteId) -> Result<Vec<DeviceRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DEVICE_COLUMNS} FROM devices WHERE site_id = ?1 ORDER BY mac"
            ))?;
            let mut rows = stmt.query([site_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_device(row)?);
            }
            Ok(out)
        })
    }

    /// Written by the mapping workflow outside this service.
    #[instrument(skip(self), fields(device_id = %id))]
    pub fn assign_site(
        &self,
        id: &DeviceId,
        site_id: Option<&SiteId>,
        wake_schedule: Option<&str>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE devices SET site_id = ?1, wake_schedule = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![
                    site_id.map(SiteId::as_str),
                    wake_schedule,
                    row_helpers::ts(Utc::now()),
                    id.as_str()
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("device {id}")));
            }
            Ok(())
        })
    }

    /// Mirror the current wake cycle and its state onto the device record.
    #[instrument(skip(self), fields(device_id = %id))]
    pub fn set_current_wake(
        &self,
        id: &DeviceId,
        wake_id: &WakeCycleId,
        state: WakeState,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = row_helpers::ts(now);
            conn.execute(
                "UPDATE devices SET current_wake_id = ?1, protocol_state = ?2, last_seen_at = ?3, updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![wake_id.as_str(), state.as_str(), now, id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(device_id = %id))]
    pub fn record_wake_times(
        &self,
        id: &DeviceId,
        last_wake_at: DateTime<Utc>,
        next_wake_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE devices SET last_wake_at = ?1, next_wake_at = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![
                    row_helpers::ts(last_wake_at),
                    row_helpers::ts(next_wake_at),
                    row_helpers::ts(Utc::now()),
                    id.as_str()
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(device_id = %id))]
    pub fn touch(&self, id: &DeviceId, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = row_helpers::ts(now);
            conn.execute(
                "UPDATE devices SET last_seen_at = ?1, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }
}

fn row_to_device(row: &rusqlite::Row<'_>) -> Result<DeviceRow, StoreError> {
    let state: Option<String> = row_helpers::get_opt(row, 4, "devices", "protocol_state")?;
    Ok(DeviceRow {
        id: DeviceId::from_raw(row_helpers::get::<String>(row, 0, "devices", "id")?),
        mac: row_helpers::get(row, 1, "devices", "mac")?,
        site_id: row_helpers::get_opt::<String>(row, 2, "devices", "site_id")?.map(SiteId::from_raw),
        wake_schedule: row_helpers::get_opt(row, 3, "devices", "wake_schedule")?,
        protocol_state: state
            .map(|s| row_helpers::parse_enum(&s, "devices", "protocol_state"))
            .transpose()?,
        current_wake_id: row_helpers::get_opt::<String>(row, 5, "devices", "current_wake_id")?
            .map(WakeCycleId::from_raw),
        last_wake_at: row_helpers::get_ts_opt(row, 6, "devices", "last_wake_at")?,
        next_wake_at: row_helpers::get_ts_opt(row, 7, "devices", "next_wake_at")?,
        last_seen_at: row_helpers::get_ts_opt(row, 8, "devices", "last_seen_at")?,
        created_at: row_helpers::get_ts(row, 9, "devices", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sites::{SiteRepo, SiteRow};

    fn setup() -> (Database, DeviceRepo) {
        let db = Database::in_memory().unwrap();
        SiteRepo::new(db.clone())
            .upsert(&SiteRow {
                id: SiteId::from_raw("site-1"),
                name: "Site".into(),
                tenant_id: "t".into(),
                timezone: "UTC".into(),
                wake_schedule: None,
            })
            .unwrap();
        (db.clone(), DeviceRepo::new(db))
    }

    #[test]
    fn provisioning_is_idempotent() {
        let (_, repo) = setup();
        let now = Utc::now();
        let a = repo.get_or_provision("AA:BB:CC", now).unwrap();
        let b = repo.get_or_provision("AA:BB:CC", now).unwrap();
        assert_eq!(a.id, b.id);
        assert!(!a.is_mapped());
        assert!(a.id.as_str().starts_with("dev_"));
    }

    #[test]
    fn assign_site_maps_device() {
        let (_, repo) = setup();
        let dev = repo.get_or_provision("M1", Utc::now()).unwrap();
        repo.assign_site(&dev.id, Some(&SiteId::from_raw("site-1")), Some("*/15 * * * *"))
            .unwrap();
        let fetched = repo.get(&dev.id).unwrap();
        assert!(fetched.is_mapped());
        assert_eq!(fetched.wake_schedule.as_deref(), Some("*/15 * * * *"));
        assert_eq!(repo.list_by_site(&SiteId::from_raw("site-1")).unwrap().len(), 1);
    }

    #[test]
    fn wake_bookkeeping() {
        let (_, repo) = setup();
        let now = Utc::now();
        let dev = repo.get_or_provision("M1", now).unwrap();
        let wake = WakeCycleId::new();
        repo.set_current_wake(&dev.id, &wake, WakeState::CaptureRequested, now)
            .unwrap();
        let next = now + chrono::Duration::hours(1);
        repo.record_wake_times(&dev.id, now, next).unwrap();

        let fetched = repo.find_by_mac("M1").unwrap().unwrap();
        assert_eq!(fetched.current_wake_id, Some(wake));
        assert_eq!(fetched.protocol_state, Some(WakeState::CaptureRequested));
        assert_eq!(
            fetched.next_wake_at.map(row_helpers::ts),
            Some(row_helpers::ts(next))
        );
    }

    #[test]
    fn unknown_mac_is_none() {
        let (_, repo) = setup();
        assert!(repo.find_by_mac("nope").unwrap().is_none());
    }
}
