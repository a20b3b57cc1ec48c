use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode};
use tracing::warn;

use crate::errors::StoreError;

/// Maximum attempts for a durable write, including the first.
pub const WRITE_ATTEMPTS: u32 = 5;
const WRITE_BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Async-safe handle to a workflow database.
///
/// Wraps `WorkflowDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<WorkflowDb>>,
}

impl DbHandle {
    pub fn new(db: WorkflowDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&WorkflowDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Run a write, retrying busy/locked/IO failures with exponential backoff.
    ///
    /// The closure is re-run from scratch on every attempt, so it must be a
    /// single statement or its own transaction. When attempts run out the
    /// last error is returned as `WriteExhausted`; it is never swallowed.
    pub async fn write<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: Fn(&WorkflowDb) -> Result<R, StoreError> + Send + Sync + 'static,
        R: Send + 'static,
    {
        let f = Arc::new(f);
        let mut attempt = 1;
        loop {
            let op = f.clone();
            match self.call(move |db| op(db)).await {
                Ok(value) => return Ok(value),
                Err(StoreError::Sqlite(err)) if is_transient(&err) => {
                    if attempt >= WRITE_ATTEMPTS {
                        return Err(StoreError::WriteExhausted {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    let delay = WRITE_BACKOFF_BASE * 2u32.pow(attempt - 1);
                    warn!(attempt, ?delay, error = %err, "Durable write failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, WorkflowDb>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy)
            | Some(ErrorCode::DatabaseLocked)
            | Some(ErrorCode::SystemIoFailure)
            | Some(ErrorCode::DiskFull)
    )
}

pub struct WorkflowDb {
    conn: Connection,
}

impl WorkflowDb {
    /// Open (or create) a workflow database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an existing database without creating it.
    pub fn open_existing(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "state.db not found"),
            });
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.pragmas()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn pragmas(&self) -> Result<(), StoreError> {
        self.conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        // FULL makes every commit fsync before returning.
        self.conn.pragma_update(None, "synchronous", "FULL")?;
        self.conn.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    }

    fn init(&self) -> Result<(), StoreError> {
        self.pragmas()?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS workflows (
                workflow_id TEXT PRIMARY KEY,
                topic TEXT NOT NULL,
                config_hash TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                workflow_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                status TEXT NOT NULL,
                items_processed INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (workflow_id, phase)
            );

            CREATE TABLE IF NOT EXISTS items (
                workflow_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                item_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                seq INTEGER NOT NULL,
                enqueued_at TEXT NOT NULL,
                PRIMARY KEY (workflow_id, stage, item_id)
            );

            CREATE TABLE IF NOT EXISTS cost_units (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                tier TEXT NOT NULL,
                actor TEXT NOT NULL,
                item_id TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cost_units_workflow ON cost_units(workflow_id);
            ",
        )?;

        for phase in sysrev_common::Phase::ALL {
            if let Some(table) = phase.outcome_table() {
                self.conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        workflow_id TEXT NOT NULL,
                        stage TEXT NOT NULL,
                        item_id TEXT NOT NULL,
                        actor TEXT NOT NULL,
                        decision TEXT NOT NULL,
                        confidence REAL NOT NULL,
                        rationale TEXT NOT NULL DEFAULT '',
                        recorded_at TEXT NOT NULL,
                        PRIMARY KEY (workflow_id, stage, item_id, actor)
                    );"
                ))?;
            }
        }
        Ok(())
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_migrations_create_all_tables() {
        let db = WorkflowDb::open_in_memory().unwrap();
        for table in [
            "workflows",
            "checkpoints",
            "items",
            "cost_units",
            "outcomes_screening",
            "outcomes_extraction",
        ] {
            assert!(db.table_exists(table).unwrap(), "missing table {}", table);
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wf/state.db");
        WorkflowDb::open(&path).unwrap();
        let db = WorkflowDb::open(&path).unwrap();
        assert!(db.table_exists("checkpoints").unwrap());
    }

    #[test]
    fn test_open_existing_requires_file() {
        let dir = tempdir().unwrap();
        let result = WorkflowDb::open_existing(&dir.path().join("missing.db"));
        assert!(matches!(result, Err(StoreError::Io { .. })));
    }

    #[tokio::test]
    async fn test_write_does_not_retry_non_transient_errors() {
        let handle = DbHandle::new(WorkflowDb::open_in_memory().unwrap());
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), StoreError> = handle
            .write(move |db| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                db.conn().execute("INSERT INTO no_such_table VALUES (1)", [])?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_retries_busy_then_gives_up() {
        let handle = DbHandle::new(WorkflowDb::open_in_memory().unwrap());
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), StoreError> = handle
            .write(move |_db| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                    None,
                )))
            })
            .await;
        assert!(matches!(
            result,
            Err(StoreError::WriteExhausted { attempts: WRITE_ATTEMPTS, .. })
        ));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), WRITE_ATTEMPTS);
    }
}
