//! Lock-file backed store: one YAML record per job in a state directory.
//!
//! Registrations and sweeps run under the directory's lock file. Records are written to a
//! hidden temporary file and published with an atomic rename, so readers never observe a
//! partial record. Deregistration is a plain unlink and needs no lock.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::job::{JobId, JobRecord};
use crate::process;
use crate::retry::{retry_contended, Backoff};
use crate::store::{LoadSnapshot, StateStore};
use crate::sync::LockedFile;

const RECORD_EXTENSION: &str = "job";
const LOCK_FILE: &str = ".lock";

#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    lock_path: PathBuf,
    backoff: Backoff,
}

impl FileStateStore {
    pub fn open(dir: &Path, lock_timeout: Duration) -> Result<Self, DispatchError> {
        fs::create_dir_all(dir).map_err(|source| DispatchError::StoreIo {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            lock_path: dir.join(LOCK_FILE),
            backoff: Backoff::new(lock_timeout),
        })
    }

    fn record_path(&self, job_id: &JobId) -> PathBuf {
        self.dir.join(format!("{}.{}", job_id, RECORD_EXTENSION))
    }

    fn lock(&self) -> Result<LockedFile, DispatchError> {
        retry_contended(&self.backoff, &self.lock_path, || {
            LockedFile::try_acquire(&self.lock_path)
        })
    }

    fn io_error(path: &Path, source: std::io::Error) -> DispatchError {
        DispatchError::StoreIo {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Reads every published record. Must be called with the lock held.
    fn read_records(&self) -> Result<Vec<(PathBuf, JobRecord)>, DispatchError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| Self::io_error(&self.dir, e))?;
        let mut records = vec![];
        for entry in entries {
            let path = entry.map_err(|e| Self::io_error(&self.dir, e))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                // Deregistered while we were listing.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(Self::io_error(&path, err)),
            };
            let record: JobRecord = serde_yaml::from_str(&content).map_err(|err| {
                DispatchError::StoreCorruption(format!(
                    "unreadable job record {}: {}",
                    path.display(),
                    err
                ))
            })?;
            records.push((path, record));
        }
        Ok(records)
    }
}

impl StateStore for FileStateStore {
    fn register(&self, record: &JobRecord) -> Result<(), DispatchError> {
        let content = serde_yaml::to_string(record).map_err(|err| {
            DispatchError::StoreCorruption(format!("cannot serialize job record: {}", err))
        })?;
        let staging = self.dir.join(format!(".{}.tmp", record.job_id));
        let published = self.record_path(&record.job_id);

        let _lock = self.lock()?;
        fs::write(&staging, content).map_err(|e| Self::io_error(&staging, e))?;
        if let Err(err) = fs::rename(&staging, &published) {
            let _ = fs::remove_file(&staging);
            return Err(Self::io_error(&published, err));
        }
        debug!(job_id = %record.job_id, host = %record.host, "Registered job");
        Ok(())
    }

    fn deregister(&self, job_id: &JobId) -> Result<(), DispatchError> {
        let path = self.record_path(job_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(job_id = %job_id, "Deregistered job");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(&path, err)),
        }
    }

    fn snapshot(&self) -> Result<LoadSnapshot, DispatchError> {
        let _lock = self.lock()?;
        let mut snapshot = LoadSnapshot::default();
        for (path, record) in self.read_records()? {
            if process::is_alive(record.pid) {
                snapshot.record(record.host);
                continue;
            }
            warn!(
                job_id = %record.job_id,
                host = %record.host,
                pid = record.pid,
                "Purging job record of a dead process"
            );
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(Self::io_error(&path, err)),
            }
        }
        Ok(snapshot)
    }
}
