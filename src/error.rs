use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to read configuration file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),
    #[error("Failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to install logging: {0}")]
    Logging(String),
    /// Transient conflict with another process. Retried by the backoff loop.
    #[error("State store is busy: {0}")]
    StoreBusy(String),
    #[error("State store {path} is still contended after {waited:?}")]
    StoreContention { path: PathBuf, waited: Duration },
    #[error("State store is corrupt: {0}")]
    StoreCorruption(String),
    #[error("State store I/O failed on {path}: {source}")]
    StoreIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("State store task failed: {0}")]
    StoreTask(#[from] tokio::task::JoinError),
    #[error("SQLite state store failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Failed to connect SSH session or execute SSH command: {0}")]
    Transport(#[from] openssh::Error),
    #[error("Failed to execute local command: {0}")]
    Spawn(#[source] io::Error),
    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
    #[error("Argument {0:?} is not valid UTF-8 and cannot be sent to a remote host")]
    Argument(OsString),
}

impl DispatchError {
    /// Whether the operation that produced this error may simply be retried.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::StoreBusy(_))
    }

    /// Process exit code used when this error ends the invocation.
    pub fn exit_code(&self) -> i32 {
        match self {
            // Same code an ssh client reports for its own failures.
            Self::Transport(_) => 255,
            Self::Spawn(_) => 127,
            _ => 1,
        }
    }
}
