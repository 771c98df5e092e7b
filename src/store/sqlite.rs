//! SQLite backed store for deployments that want a transactional state file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::job::{JobId, JobRecord};
use crate::process;
use crate::retry::{retry_contended, Backoff};
use crate::store::{LoadSnapshot, StateStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    job_id     TEXT PRIMARY KEY,
    host       TEXT NOT NULL,
    pid        INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS jobs_host ON jobs (host);
";

/// How long SQLite itself waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_millis(50);

pub struct SqliteStateStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    backoff: Backoff,
}

impl SqliteStateStore {
    pub fn open(path: &Path, lock_timeout: Duration) -> Result<Self, DispatchError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| DispatchError::StoreIo {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).map_err(classify)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(classify)?;
        let store = Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            backoff: Backoff::new(lock_timeout),
        };
        store.with_conn(|conn| conn.execute_batch(SCHEMA).map_err(classify))?;
        Ok(store)
    }

    /// Runs `operation` on the connection, retrying while the database is busy.
    fn with_conn<T, F>(&self, mut operation: F) -> Result<T, DispatchError>
    where
        F: FnMut(&mut Connection) -> Result<T, DispatchError>,
    {
        retry_contended(&self.backoff, &self.path, || {
            let mut conn = self
                .conn
                .lock()
                .map_err(|_| DispatchError::StoreCorruption("connection mutex poisoned".into()))?;
            operation(&mut conn)
        })
    }
}

/// Busy and locked databases are transient; damaged files are corruption.
fn classify(err: rusqlite::Error) -> DispatchError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                DispatchError::StoreBusy(err.to_string())
            }
            ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                DispatchError::StoreCorruption(err.to_string())
            }
            _ => DispatchError::Sqlite(err),
        },
        _ => DispatchError::Sqlite(err),
    }
}

impl StateStore for SqliteStateStore {
    fn register(&self, record: &JobRecord) -> Result<(), DispatchError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (job_id, host, pid, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.job_id.to_string(),
                    record.host,
                    record.pid,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(classify)
        })?;
        debug!(job_id = %record.job_id, host = %record.host, "Registered job");
        Ok(())
    }

    fn deregister(&self, job_id: &JobId) -> Result<(), DispatchError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id.to_string()])
                .map_err(classify)
        })?;
        debug!(job_id = %job_id, "Deregistered job");
        Ok(())
    }

    fn snapshot(&self) -> Result<LoadSnapshot, DispatchError> {
        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(classify)?;
            let owners: Vec<(String, String, u32)> = {
                let mut stmt = tx
                    .prepare("SELECT job_id, host, pid FROM jobs")
                    .map_err(classify)?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                    .map_err(classify)?;
                rows.collect::<Result<_, _>>().map_err(classify)?
            };

            let mut snapshot = LoadSnapshot::default();
            for (job_id, host, pid) in owners {
                if process::is_alive(pid) {
                    snapshot.record(host);
                    continue;
                }
                warn!(job_id = %job_id, host = %host, pid, "Purging job record of a dead process");
                tx.execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])
                    .map_err(classify)?;
            }
            tx.commit().map_err(classify)?;
            Ok(snapshot)
        })
    }
}
