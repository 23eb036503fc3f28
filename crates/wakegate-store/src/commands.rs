//! Outbox of every command issued to a device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use wakegate_core::commands::OutboundCommand;
use wakegate_core::ids::{CommandId, DeviceId, WakeCycleId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRow {
    pub id: CommandId,
    pub device_id: DeviceId,
    pub wake_id: Option<WakeCycleId>,
    pub kind: String,
    pub command: OutboundCommand,
    pub issued_at: DateTime<Utc>,
}

pub struct CommandRepo {
    db: Database,
}

impl CommandRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, command), fields(device_id = %device_id, kind))]
    pub fn record(
        &self,
        device_id: &DeviceId,
        wake_id: Option<&WakeCycleId>,
        kind: &str,
        command: &OutboundCommand,
        now: DateTime<Utc>,
    ) -> Result<CommandId, StoreError> {
        let id = CommandId::new();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO commands (id, device_id, wake_id, kind, topic, payload, issued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    device_id.as_str(),
                    wake_id.map(WakeCycleId::as_str),
                    kind,
                    command.topic,
                    serde_json::to_string(&command.payload)?,
                    row_helpers::ts(now),
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Most recent commands for a device, newest first.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub fn list_for_device(&self, device_id: &DeviceId, limit: u32) -> Result<Vec<CommandRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, device_id, wake_id, kind, topic, payload, issued_at FROM commands
                 WHERE device_id = ?1 ORDER BY issued_at DESC, id DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![device_id.as_str(), limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                const T: &str = "commands";
                let payload: String = row_helpers::get(row, 5, T, "payload")?;
                out.push(CommandRow {
                    id: CommandId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
                    device_id: DeviceId::from_raw(row_helpers::get::<String>(row, 1, T, "device_id")?),
                    wake_id: row_helpers::get_opt::<String>(row, 2, T, "wake_id")?.map(WakeCycleId::from_raw),
                    kind: row_helpers::get(row, 3, T, "kind")?,
                    command: OutboundCommand {
                        topic: row_helpers::get(row, 4, T, "topic")?,
                        payload: row_helpers::parse_json(&payload, T, "payload")?,
                    },
                    issued_at: row_helpers::get_ts(row, 6, T, "issued_at")?,
                });
            }
            Ok(out)
        })
    }
}
