//! SQLite Replica Store
//!
//! Implements ReplicaStore over a local SQLite file in WAL mode. A single
//! writer connection applies change batches; every read handle owns its own
//! read-only connection and runs each query inside a read transaction.

use crate::domain::entities::{now_ms, ChangeBatch, ReplicaSnapshot};
use crate::domain::ports::{ReadHandle, ReplicaStore};
use crate::domain::value_objects::{Params, QueryResult, Value};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Magic header of every SQLite database file.
pub const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";

/// Smallest file accepted as a replica.
pub const MIN_REPLICA_SIZE: u64 = 100;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const CREATE_STATS_SQL: &str =
    "CREATE TABLE IF NOT EXISTS ha_stats (received_seq INTEGER NOT NULL, updated_at INTEGER NOT NULL)";

const READ_STATS_SQL: &str =
    "SELECT received_seq, updated_at FROM ha_stats ORDER BY updated_at DESC LIMIT 1";

/// Whether `path` looks like a SQLite database usable as a replica.
pub fn is_replica_file(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() || metadata.len() < MIN_REPLICA_SIZE {
        return false;
    }

    let mut header = [0u8; 16];
    std::fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut header))
        .map(|_| header == SQLITE_HEADER)
        .unwrap_or(false)
}

/// Whether `image` looks like a SQLite database file.
pub fn is_replica_image(image: &[u8]) -> bool {
    image.len() as u64 >= MIN_REPLICA_SIZE && image.starts_with(SQLITE_HEADER)
}

/// SQLite-backed replica of one database.
pub struct SqliteReplicaStore {
    database: String,
    path: PathBuf,
    writer: Arc<Mutex<Connection>>,
    snapshot: Arc<RwLock<ReplicaSnapshot>>,
    /// Bumped every time a full image replaces the file
    generation: Arc<AtomicU64>,
}

impl SqliteReplicaStore {
    /// Open the replica at `path`, named after its file name.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let database = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidReplicaImage(format!("bad path {}", path.display())))?
            .to_string();
        Self::open_as(database, path)
    }

    /// Open the replica at `path` under an explicit database name.
    pub fn open_as(database: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let database = database.into();
        let path = path.as_ref().to_path_buf();
        let conn = open_writer(&path)?;
        let snapshot = read_snapshot(&conn)?;

        tracing::info!(
            "opened replica {} at sequence {} ({})",
            database,
            snapshot.sequence,
            path.display()
        );

        Ok(Self {
            database,
            path,
            writer: Arc::new(Mutex::new(conn)),
            snapshot: Arc::new(RwLock::new(snapshot)),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn apply_blocking(
        writer: &Mutex<Connection>,
        snapshot: &RwLock<ReplicaSnapshot>,
        batch: &ChangeBatch,
    ) -> Result<u64> {
        let mut conn = writer.lock();
        let current = snapshot.read().sequence;

        if batch.end_seq <= current {
            tracing::debug!(
                "skipping batch {}..{} for {}: already at {}",
                batch.base_seq,
                batch.end_seq,
                batch.database,
                current
            );
            return Ok(current);
        }
        if batch.base_seq != current {
            return Err(Error::SequenceGap {
                expected: current,
                found: batch.base_seq,
            });
        }

        let tx = conn.transaction()?;
        for statement in &batch.statements {
            tx.execute_batch(statement)?;
        }
        tx.execute("DELETE FROM ha_stats", [])?;
        tx.execute(
            "INSERT INTO ha_stats (received_seq, updated_at) VALUES (?1, ?2)",
            params![batch.end_seq as i64, now_ms() as i64],
        )?;
        tx.commit()?;

        *snapshot.write() = ReplicaSnapshot {
            sequence: batch.end_seq,
            applied_at: Some(SystemTime::now()),
        };
        Ok(batch.end_seq)
    }

    fn install_blocking(
        writer: &Mutex<Connection>,
        snapshot: &RwLock<ReplicaSnapshot>,
        generation: &AtomicU64,
        path: &Path,
        image: &[u8],
    ) -> Result<u64> {
        let mut conn = writer.lock();

        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;

        let staging = sibling(path, "install");
        std::fs::write(&staging, image)?;

        if let Err(e) = replace_database(&mut conn, path, &staging) {
            let _ = std::fs::remove_file(&staging);
            return Err(e);
        }
        let installed = read_snapshot(&conn)?;
        let sequence = installed.sequence;
        generation.fetch_add(1, Ordering::SeqCst);

        *snapshot.write() = ReplicaSnapshot {
            sequence,
            applied_at: Some(SystemTime::now()),
        };
        Ok(sequence)
    }
}

#[async_trait]
impl ReplicaStore for SqliteReplicaStore {
    fn database(&self) -> &str {
        &self.database
    }

    async fn apply(&self, batch: &ChangeBatch) -> Result<u64> {
        if !batch.verify() {
            return Err(Error::CorruptBatch {
                base: batch.base_seq,
                end: batch.end_seq,
            });
        }

        let writer = self.writer.clone();
        let snapshot = self.snapshot.clone();
        let batch = batch.clone();
        tokio::task::spawn_blocking(move || Self::apply_blocking(&writer, &snapshot, &batch))
            .await?
    }

    fn current_sequence(&self) -> u64 {
        self.snapshot.read().sequence
    }

    fn snapshot(&self) -> ReplicaSnapshot {
        *self.snapshot.read()
    }

    async fn open_read_handle(&self) -> Result<Box<dyn ReadHandle>> {
        let path = self.path.clone();
        let generation = self.generation.load(Ordering::SeqCst);
        let conn = tokio::task::spawn_blocking(move || open_reader(&path)).await??;

        Ok(Box::new(SqliteReadHandle {
            path: self.path.clone(),
            conn: Arc::new(Mutex::new(conn)),
            store_generation: self.generation.clone(),
            opened_generation: generation,
            last_seen: 0,
        }))
    }

    async fn install(&self, image: Bytes) -> Result<u64> {
        if !is_replica_image(&image) {
            return Err(Error::InvalidReplicaImage(format!(
                "{} bytes without a SQLite header",
                image.len()
            )));
        }

        let writer = self.writer.clone();
        let snapshot = self.snapshot.clone();
        let generation = self.generation.clone();
        let path = self.path.clone();
        let sequence = tokio::task::spawn_blocking(move || {
            Self::install_blocking(&writer, &snapshot, &generation, &path, &image)
        })
        .await??;

        tracing::info!(
            "installed replica image for {} at sequence {}",
            self.database,
            sequence
        );
        Ok(sequence)
    }
}

/// Read-only view of a replica file.
///
/// Reopens its connection after the store installs a new image.
pub struct SqliteReadHandle {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    store_generation: Arc<AtomicU64>,
    opened_generation: u64,
    last_seen: u64,
}

#[async_trait]
impl ReadHandle for SqliteReadHandle {
    async fn query(&mut self, sql: &str, params: &Params) -> Result<QueryResult> {
        let generation = self.store_generation.load(Ordering::SeqCst);
        let reopen = (generation != self.opened_generation).then(|| self.path.clone());

        let conn = self.conn.clone();
        let sql = sql.to_string();
        let params = params.clone();
        let (sequence, result) = tokio::task::spawn_blocking(move || -> Result<(u64, QueryResult)> {
            let mut conn = conn.lock();
            if let Some(path) = reopen {
                *conn = open_reader(&path)?;
            }
            query_in_transaction(&mut conn, &sql, &params)
        })
        .await??;
        self.opened_generation = generation;

        if sequence < self.last_seen {
            return Err(Error::ReplicaRegressed {
                seen: self.last_seen,
                found: sequence,
            });
        }
        self.last_seen = sequence;
        Ok(result)
    }

    fn observed_sequence(&self) -> u64 {
        self.last_seen
    }
}

fn open_writer(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(CREATE_STATS_SQL)?;
    Ok(conn)
}

/// Move `staging` over `path` with the writer closed.
///
/// The writer is reopened on `path` whether or not the move succeeded.
fn replace_database(conn: &mut Connection, path: &Path, staging: &Path) -> Result<()> {
    // Close the old writer before its WAL files go away
    *conn = Connection::open_in_memory()?;

    let moved = ["wal", "shm"]
        .iter()
        .try_for_each(|suffix| match std::fs::remove_file(sibling(path, suffix)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        })
        .and_then(|()| std::fs::rename(staging, path));

    *conn = open_writer(path)?;
    Ok(moved?)
}

fn open_reader(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push("-");
    name.push(suffix);
    PathBuf::from(name)
}

/// Embedded sequence and apply time; a file without `ha_stats` is at 0.
fn read_snapshot(conn: &Connection) -> Result<ReplicaSnapshot> {
    let row = conn
        .query_row(READ_STATS_SQL, [], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })
        .optional();

    match row {
        Ok(Some((sequence, updated_at))) => Ok(ReplicaSnapshot {
            sequence: sequence.max(0) as u64,
            applied_at: Some(UNIX_EPOCH + Duration::from_millis(updated_at.max(0) as u64)),
        }),
        Ok(None) => Ok(ReplicaSnapshot::default()),
        Err(e) if is_missing_table(&e) => Ok(ReplicaSnapshot::default()),
        Err(e) => Err(e.into()),
    }
}

fn is_missing_table(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("no such table"))
}

/// Read the embedded sequence and run `sql` in the same read transaction.
fn query_in_transaction(
    conn: &mut Connection,
    sql: &str,
    params: &Params,
) -> Result<(u64, QueryResult)> {
    let tx = conn.transaction()?;
    let sequence = read_snapshot(&tx)?.sequence;
    let result = run_query(&tx, sql, params)?;
    tx.commit()?;
    Ok((sequence, result))
}

/// Run a statement and collect its rows.
pub(crate) fn run_query(conn: &Connection, sql: &str, params: &Params) -> Result<QueryResult> {
    let mut stmt = conn.prepare(sql)?;
    for (index, value) in params.iter() {
        stmt.raw_bind_parameter(index, value)?;
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = Vec::new();
    let mut cursor = stmt.raw_query();
    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(Value::from_sqlite(row.get_ref(i)?));
        }
        rows.push(values);
    }

    Ok(QueryResult {
        columns,
        rows,
        rows_affected: 0,
    })
}
