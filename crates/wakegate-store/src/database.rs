use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::schema;

/// How long a statement waits on a lock held by another process (the
/// telemetry sinks share the data directory).
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the wakegate database. Every repository clones it; all
/// access is serialized through one connection, which is what makes the
/// compare-and-swap updates in the repositories race-free.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open (creating parent directories and tables as needed).
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let version = migrate(&conn)?;
        info!(path = %path.display(), version, "store opened");
        Ok(Self::wrap(conn, path.to_owned()))
    }

    /// Fresh private database, used by tests and tooling.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self::wrap(conn, PathBuf::from(":memory:")))
    }

    fn wrap(conn: Connection, path: PathBuf) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        }
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` in one transaction; an `Err` rolls everything back.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn schema_version(&self) -> Result<Option<u32>, StoreError> {
        self.with_conn(stored_version)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn stored_version(conn: &Connection) -> Result<Option<u32>, StoreError> {
    Ok(conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?)
}

/// Apply pragmas and DDL, then stamp the schema version. A database written
/// by a newer build is refused rather than read with the wrong layout.
fn migrate(conn: &Connection) -> Result<u32, StoreError> {
    conn.execute_batch(schema::PRAGMAS)?;
    conn.execute_batch(schema::CREATE_TABLES)?;
    match stored_version(conn)? {
        None => {
            conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [schema::SCHEMA_VERSION])?;
            debug!(version = schema::SCHEMA_VERSION, "schema stamped");
            Ok(schema::SCHEMA_VERSION)
        }
        Some(v) if v > schema::SCHEMA_VERSION => Err(StoreError::Database(format!(
            "database schema v{v} is newer than supported v{}",
            schema::SCHEMA_VERSION
        ))),
        Some(v) => Ok(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_is_stamped() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.path(), Path::new(":memory:"));
        assert_eq!(db.schema_version().unwrap(), Some(schema::SCHEMA_VERSION));
    }

    #[test]
    fn every_table_exists() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let tables: Vec<String> = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?
                .query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?;

            for expected in [
                "sites",
                "devices",
                "wake_cycles",
                "wake_transitions",
                "chunk_buffers",
                "chunk_parts",
                "sessions",
                "session_outcomes",
                "snapshots",
                "image_scores",
                "retries",
                "commands",
                "anomalies",
            ] {
                assert!(tables.contains(&expected.to_string()), "missing {expected}");
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn failed_transaction_leaves_no_rows() {
        let db = Database::in_memory().unwrap();
        let result: Result<(), StoreError> = db.with_tx(|conn| {
            conn.execute(
                "INSERT INTO sites (id, name, tenant_id, created_at) VALUES ('s1', 'n', 't', 'now')",
                [],
            )?;
            Err(StoreError::Conflict("abort".into()))
        });
        assert!(result.is_err());
        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM sites", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn reopening_a_file_keeps_one_version_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("wakegate.db");
        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();
        let rows: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wakegate.db");
        let db = Database::open(&path).unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE schema_version SET version = ?1", [schema::SCHEMA_VERSION + 1])?;
            Ok(())
        })
        .unwrap();
        drop(db);
        assert!(Database::open(&path).is_err());
    }
}
