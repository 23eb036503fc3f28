//! Sites are owned by the administrative side. The engine only reads them;
//! `upsert` exists for provisioning tools and tests.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use wakegate_core::ids::SiteId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SiteRow {
    pub id: SiteId,
    pub name: String,
    pub tenant_id: String,
    pub timezone: String,
    pub wake_schedule: Option<String>,
}

pub struct SiteRepo {
    db: Database,
}

const SITE_COLUMNS: &str = "id, name, tenant_id, timezone, wake_schedule";

impl SiteRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, site), fields(site_id = %site.id))]
    pub fn upsert(&self, site: &SiteRow) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sites (id, name, tenant_id, timezone, wake_schedule, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    tenant_id = excluded.tenant_id,
                    timezone = excluded.timezone,
                    wake_schedule = excluded.wake_schedule",
                rusqlite::params![
                    site.id.as_str(),
                    site.name,
                    site.tenant_id,
                    site.timezone,
                    site.wake_schedule,
                    row_helpers::ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(site_id = %id))]
    pub fn get(&self, id: &SiteId) -> Result<SiteRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_site(row),
                None => Err(StoreError::NotFound(format!("site {id}"))),
            }
        })
    }

    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<SiteRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {SITE_COLUMNS} FROM sites ORDER BY id"))?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_site(row)?);
            }
            Ok(out)
        })
    }
}

fn row_to_site(row: &rusqlite::Row<'_>) -> Result<SiteRow, StoreError> {
    Ok(SiteRow {
        id: SiteId::from_raw(row_helpers::get::<String>(row, 0, "sites", "id")?),
        name: row_helpers::get(row, 1, "sites", "name")?,
        tenant_id: row_helpers::get(row, 2, "sites", "tenant_id")?,
        timezone: row_helpers::get(row, 3, "sites", "timezone")?,
        wake_schedule: row_helpers::get_opt(row, 4, "sites", "wake_schedule")?,
    })
}
