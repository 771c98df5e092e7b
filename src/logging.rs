//! Diagnostics go to the log file only. Standard output and error belong to the wrapped
//! command, and callers parse them.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::DispatchError;

/// Overrides `logging.level` when set.
pub const LOG_ENV: &str = "RFFMPEG_LOG";

/// Installs the global subscriber. Does nothing when file logging is disabled.
pub fn init(config: &LoggingConfig) -> Result<(), DispatchError> {
    if !config.log_to_file {
        return Ok(());
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.logfile)
        .map_err(|source| DispatchError::LogFile {
            path: config.logfile.clone(),
            source,
        })?;
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .map_err(|err| DispatchError::Logging(err.to_string()))
}
