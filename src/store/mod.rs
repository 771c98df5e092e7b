//! Cross-process record of running jobs.
//!
//! Every invocation is its own process, so the only shared view of host load is what the
//! store holds. All atomicity lives in the backends; callers never lock anything themselves.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{StateBackend, StateConfig};
use crate::error::DispatchError;
use crate::host::HostEntry;
use crate::job::{JobId, JobRecord};
use crate::selector::weighted_load;

pub mod file;
pub mod sqlite;

pub use file::FileStateStore;
pub use sqlite::SqliteStateStore;

pub trait StateStore: Send + Sync {
    /// Atomically adds a job record. Concurrent registrations are never lost.
    fn register(&self, record: &JobRecord) -> Result<(), DispatchError>;

    /// Removes a job record. Removing an unknown id is not an error.
    fn deregister(&self, job_id: &JobId) -> Result<(), DispatchError>;

    /// Purges records of dead owners, then counts active jobs per host.
    fn snapshot(&self) -> Result<LoadSnapshot, DispatchError>;
}

impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    fn register(&self, record: &JobRecord) -> Result<(), DispatchError> {
        (**self).register(record)
    }

    fn deregister(&self, job_id: &JobId) -> Result<(), DispatchError> {
        (**self).deregister(job_id)
    }

    fn snapshot(&self) -> Result<LoadSnapshot, DispatchError> {
        (**self).snapshot()
    }
}

/// Point-in-time count of active jobs per host id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSnapshot {
    active: HashMap<String, usize>,
}

impl LoadSnapshot {
    pub fn active(&self, host: &str) -> usize {
        self.active.get(host).copied().unwrap_or(0)
    }

    pub fn weighted_load(&self, host: &HostEntry) -> usize {
        weighted_load(self.active(&host.name), host.weight)
    }

    pub fn total(&self) -> usize {
        self.active.values().sum()
    }

    pub fn record(&mut self, host: impl Into<String>) {
        *self.active.entry(host.into()).or_insert(0) += 1;
    }
}

impl<S: Into<String>> FromIterator<(S, usize)> for LoadSnapshot {
    fn from_iter<I: IntoIterator<Item = (S, usize)>>(iter: I) -> Self {
        Self {
            active: iter
                .into_iter()
                .map(|(host, count)| (host.into(), count))
                .collect(),
        }
    }
}

/// Opens the backend selected in the configuration.
pub fn open(config: &StateConfig) -> Result<Box<dyn StateStore>, DispatchError> {
    Ok(match config.backend {
        StateBackend::File => Box::new(FileStateStore::open(&config.path, config.lock_timeout)?),
        StateBackend::Sqlite => {
            Box::new(SqliteStateStore::open(&config.path, config.lock_timeout)?)
        }
    })
}
