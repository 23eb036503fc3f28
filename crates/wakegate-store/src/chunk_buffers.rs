//! Durable chunk reassembly storage.
//!
//! A partial unique index keeps at most one `receiving` buffer per
//! (device, image_name), so `begin_or_resume` is a plain insert-or-ignore
//! followed by a lookup. Parts are keyed by (buffer, index); re-inserting an
//! index is ignored and does not move `received_count`.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use wakegate_core::ids::{BufferId, DeviceId, WakeCycleId};
use wakegate_core::state::BufferStatus;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkBufferRow {
    pub id: BufferId,
    pub device_id: DeviceId,
    pub wake_id: Option<WakeCycleId>,
    pub image_name: String,
    pub total_chunks: u32,
    pub received_count: u32,
    pub image_size: Option<u64>,
    pub status: BufferStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ChunkBufferRow {
    pub fn is_complete(&self) -> bool {
        self.received_count == self.total_chunks
    }
}

/// Result of storing one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredChunk {
    /// False when the index was already present.
    pub newly_stored: bool,
    pub received: u32,
    pub total: u32,
}

pub struct ChunkBufferRepo {
    db: Database,
}

const BUFFER_COLUMNS: &str = "id, device_id, wake_id, image_name, total_chunks, received_count, image_size,
     status, failure_reason, created_at, updated_at, expires_at";

fn select_one(conn: &Connection, id: &BufferId) -> Result<ChunkBufferRow, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {BUFFER_COLUMNS} FROM chunk_buffers WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_buffer(row),
        None => Err(StoreError::NotFound(format!("chunk buffer {id}"))),
    }
}

fn select_open(
    conn: &Connection,
    device_id: &DeviceId,
    image_name: &str,
) -> Result<Option<ChunkBufferRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BUFFER_COLUMNS} FROM chunk_buffers
         WHERE device_id = ?1 AND image_name = ?2 AND status = 'receiving'"
    ))?;
    let mut rows = stmt.query([device_id.as_str(), image_name])?;
    rows.next()?.map(row_to_buffer).transpose()
}

impl ChunkBufferRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Return the open buffer for (device, image), creating it when absent.
    /// The flag is true when an existing buffer was resumed; a resumed buffer
    /// is re-attached to `wake_id` and its expiry pushed out.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub fn begin_or_resume(
        &self,
        device_id: &DeviceId,
        wake_id: &WakeCycleId,
        image_name: &str,
        total_chunks: u32,
        image_size: Option<u64>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(ChunkBufferRow, bool), StoreError> {
        let now_s = row_helpers::ts(now);
        let expires_s = row_helpers::ts(expires_at);
        self.db.with_tx(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO chunk_buffers
                    (id, device_id, wake_id, image_name, total_chunks, image_size, status, created_at, updated_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'receiving', ?7, ?7, ?8)",
                rusqlite::params![
                    BufferId::new().as_str(),
                    device_id.as_str(),
                    wake_id.as_str(),
                    image_name,
                    total_chunks,
                    image_size.map(|s| s as i64),
                    now_s,
                    expires_s,
                ],
            )?;
            let resumed = inserted == 0;
            if resumed {
                conn.execute(
                    "UPDATE chunk_buffers SET wake_id = ?1, expires_at = ?2, updated_at = ?3
                     WHERE device_id = ?4 AND image_name = ?5 AND status = 'receiving'",
                    rusqlite::params![wake_id.as_str(), expires_s, now_s, device_id.as_str(), image_name],
                )?;
            }
            let row = select_open(conn, device_id, image_name)?
                .ok_or_else(|| StoreError::NotFound(format!("open buffer for {image_name}")))?;
            debug!(buffer_id = %row.id, resumed, "chunk buffer ready");
            Ok((row, resumed))
        })
    }

    #[instrument(skip(self), fields(buffer_id = %id))]
    pub fn get(&self, id: &BufferId) -> Result<ChunkBufferRow, StoreError> {
        self.db.with_conn(|conn| select_one(conn, id))
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    pub fn find_open(
        &self,
        device_id: &DeviceId,
        image_name: &str,
    ) -> Result<Option<ChunkBufferRow>, StoreError> {
        self.db.with_conn(|conn| select_open(conn, device_id, image_name))
    }

    /// All receiving buffers of a device, oldest first.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub fn list_open_for_device(&self, device_id: &DeviceId) -> Result<Vec<ChunkBufferRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BUFFER_COLUMNS} FROM chunk_buffers
                 WHERE device_id = ?1 AND status = 'receiving' ORDER BY created_at"
            ))?;
            let mut rows = stmt.query([device_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_buffer(row)?);
            }
            Ok(out)
        })
    }

    /// Store chunk `index`. The caller checks the index range; this layer
    /// refuses out-of-range indices and closed buffers with `Conflict`.
    #[instrument(skip(self, bytes), fields(buffer_id = %id, len = bytes.len()))]
    pub fn store_chunk(
        &self,
        id: &BufferId,
        index: u32,
        bytes: &[u8],
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<StoredChunk, StoreError> {
        let now_s = row_helpers::ts(now);
        self.db.with_tx(|conn| {
            let buffer = select_one(conn, id)?;
            if buffer.status != BufferStatus::Receiving {
                return Err(StoreError::Conflict(format!("buffer {id} is {}", buffer.status)));
            }
            if index >= buffer.total_chunks {
                return Err(StoreError::Conflict(format!(
                    "chunk {index} outside buffer {id} of {}",
                    buffer.total_chunks
                )));
            }
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO chunk_parts (buffer_id, chunk_index, bytes, received_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), index, bytes, now_s],
            )?;
            let newly_stored = inserted == 1;
            let received = if newly_stored {
                conn.execute(
                    "UPDATE chunk_buffers SET received_count = received_count + 1, updated_at = ?1, expires_at = ?2
                     WHERE id = ?3",
                    rusqlite::params![now_s, row_helpers::ts(expires_at), id.as_str()],
                )?;
                buffer.received_count + 1
            } else {
                buffer.received_count
            };
            Ok(StoredChunk {
                newly_stored,
                received,
                total: buffer.total_chunks,
            })
        })
    }

    #[instrument(skip(self), fields(buffer_id = %id))]
    pub fn received_indices(&self, id: &BufferId) -> Result<Vec<u32>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT chunk_index FROM chunk_parts WHERE buffer_id = ?1 ORDER BY chunk_index")?;
            let indices = stmt
                .query_map([id.as_str()], |row| row.get::<_, u32>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(indices)
        })
    }

    /// Concatenate stored parts in index order.
    #[instrument(skip(self), fields(buffer_id = %id))]
    pub fn assemble(&self, id: &BufferId) -> Result<Vec<u8>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT bytes FROM chunk_parts WHERE buffer_id = ?1 ORDER BY chunk_index")?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let part: Vec<u8> = row_helpers::get(row, 0, "chunk_parts", "bytes")?;
                out.extend_from_slice(&part);
            }
            Ok(out)
        })
    }

    /// Close a receiving buffer. Returns false when it was already closed.
    #[instrument(skip(self), fields(buffer_id = %id, status = %status))]
    pub fn close(
        &self,
        id: &BufferId,
        status: BufferStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE chunk_buffers SET status = ?1, failure_reason = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = 'receiving'",
                rusqlite::params![status.as_str(), reason, row_helpers::ts(now), id.as_str()],
            )?;
            Ok(changed == 1)
        })
    }

    /// Drop stored bytes of a closed buffer; the buffer row stays as a record.
    #[instrument(skip(self), fields(buffer_id = %id))]
    pub fn purge_parts(&self, id: &BufferId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM chunk_parts WHERE buffer_id = ?1
                   AND EXISTS (SELECT 1 FROM chunk_buffers WHERE id = ?1 AND status != 'receiving')",
                [id.as_str()],
            )?)
        })
    }

    /// Receiving buffers whose expiry has passed.
    #[instrument(skip(self))]
    pub fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<ChunkBufferRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BUFFER_COLUMNS} FROM chunk_buffers
                 WHERE status = 'receiving' AND expires_at <= ?1 ORDER BY expires_at"
            ))?;
            let mut rows = stmt.query([row_helpers::ts(now)])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_buffer(row)?);
            }
            Ok(out)
        })
    }

    #[instrument(skip(self), fields(wake_id = %wake_id))]
    pub fn list_for_wake(&self, wake_id: &WakeCycleId) -> Result<Vec<ChunkBufferRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BUFFER_COLUMNS} FROM chunk_buffers WHERE wake_id = ?1 ORDER BY created_at"
            ))?;
            let mut rows = stmt.query([wake_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_buffer(row)?);
            }
            Ok(out)
        })
    }
}

fn row_to_buffer(row: &rusqlite::Row<'_>) -> Result<ChunkBufferRow, StoreError> {
    const T: &str = "chunk_buffers";
    let status: String = row_helpers::get(row, 7, T, "status")?;
    Ok(ChunkBufferRow {
        id: BufferId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        device_id: DeviceId::from_raw(row_helpers::get::<String>(row, 1, T, "device_id")?),
        wake_id: row_helpers::get_opt::<String>(row, 2, T, "wake_id")?.map(WakeCycleId::from_raw),
        image_name: row_helpers::get(row, 3, T, "image_name")?,
        total_chunks: row_helpers::get(row, 4, T, "total_chunks")?,
        received_count: row_helpers::get(row, 5, T, "received_count")?,
        image_size: row_helpers::get_opt::<i64>(row, 6, T, "image_size")?.map(|s| s as u64),
        status: row_helpers::parse_enum(&status, T, "status")?,
        failure_reason: row_helpers::get_opt(row, 8, T, "failure_reason")?,
        created_at: row_helpers::get_ts(row, 9, T, "created_at")?,
        updated_at: row_helpers::get_ts(row, 10, T, "updated_at")?,
        expires_at: row_helpers::get_ts(row, 11, T, "expires_at")?,
    })
}
