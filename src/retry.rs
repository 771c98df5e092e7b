//! Backoff for transient state store contention.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::DispatchError;

#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on a single delay.
    pub max_delay: Duration,
    /// Total time after which contention becomes an error.
    pub deadline: Duration,
}

impl Backoff {
    pub fn new(deadline: Duration) -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            deadline,
        }
    }

    /// Exponential delay for the given retry attempt (1-based).
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Runs `operation` until it stops reporting `StoreBusy` or the deadline passes. Sleeps on
/// the calling thread, so async callers run it under `spawn_blocking`.
///
/// Other errors are returned as-is on first occurrence.
pub fn retry_contended<T, F>(
    backoff: &Backoff,
    resource: &Path,
    mut operation: F,
) -> Result<T, DispatchError>
where
    F: FnMut() -> Result<T, DispatchError>,
{
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        match operation() {
            Err(err) if err.is_contention() => {
                let waited = started.elapsed();
                if waited >= backoff.deadline {
                    return Err(DispatchError::StoreContention {
                        path: resource.to_path_buf(),
                        waited,
                    });
                }
                attempt += 1;
                let delay = backoff.delay(attempt).min(backoff.deadline - waited);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    resource = %resource.display(),
                    reason = %err,
                    "State store contended, backing off"
                );
                std::thread::sleep(delay);
            }
            result => return result,
        }
    }
}
