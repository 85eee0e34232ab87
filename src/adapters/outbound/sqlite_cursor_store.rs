//! SQLite Cursor Store
//!
//! Implements CursorStore in a small SQLite file next to the replicas, so a
//! feed resumes where it stopped after a restart.

use crate::domain::entities::ReplicationCursor;
use crate::domain::ports::CursorStore;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

/// File name of the cursor database inside the replica directory.
pub const CURSOR_FILE: &str = ".ha-cursors";

/// SQLite-backed cursor store.
pub struct SqliteCursorStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCursorStore {
    /// Open (or create) the cursor database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cursors (
                database TEXT NOT NULL,
                durable TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (database, durable)
            )",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the cursor database inside a replica directory.
    pub fn in_dir(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open(dir.as_ref().join(CURSOR_FILE))
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    async fn load(&self, database: &str, durable: &str) -> Result<Option<ReplicationCursor>> {
        let conn = self.conn.clone();
        let database = database.to_string();
        let durable = durable.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<ReplicationCursor>> {
            let conn = conn.lock();
            let row = conn
                .query_row(
                    "SELECT sequence, updated_at FROM cursors WHERE database = ?1 AND durable = ?2",
                    params![database, durable],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;

            Ok(row.map(|(sequence, updated_at)| ReplicationCursor {
                database,
                durable,
                sequence: sequence.max(0) as u64,
                updated_at_ms: updated_at.max(0) as u64,
            }))
        })
        .await?
    }

    async fn save(&self, cursor: &ReplicationCursor) -> Result<()> {
        let conn = self.conn.clone();
        let cursor = cursor.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            conn.lock().execute(
                "INSERT INTO cursors (database, durable, sequence, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (database, durable)
                 DO UPDATE SET sequence = excluded.sequence, updated_at = excluded.updated_at",
                params![
                    cursor.database,
                    cursor.durable,
                    cursor.sequence as i64,
                    cursor.updated_at_ms as i64
                ],
            )?;
            Ok(())
        })
        .await?
    }
}
