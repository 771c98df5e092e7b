//! Job records tie one in-flight invocation to the host it runs on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique per invocation.
    pub job_id: JobId,
    /// Host id the job runs on (`localhost` for local runs).
    pub host: String,
    /// Process that owns the record. Records of dead owners are swept.
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// A fresh record owned by the current process.
    pub fn new(host: impl Into<String>) -> Self {
        Self::owned_by(host, std::process::id())
    }

    pub fn owned_by(host: impl Into<String>, pid: u32) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            host: host.into(),
            pid,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_is_owned_by_us() {
        let record = JobRecord::new("gpu1");
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.host, "gpu1");
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = JobRecord::new("gpu1");
        let b = JobRecord::new("gpu1");
        assert_ne!(a.job_id, b.job_id);
    }
}
