//! Bounded reachability checks for remote hosts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openssh::Stdio;
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::host::HostEntry;
use crate::session::SshTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Alive,
    Unreachable,
}

#[async_trait]
pub trait HealthProber: Send + Sync {
    /// Checks whether `host` can run the wrapped command right now. Never called for
    /// `localhost`.
    async fn probe(&self, host: &HostEntry) -> Probe;
}

/// Runs `<binary> -version` on the host, discarding its output.
///
/// Connection failures, non-zero exits and anything slower than the timeout all count as
/// unreachable.
pub struct SshProber {
    transport: Arc<SshTransport>,
    binary: String,
    timeout: Duration,
}

impl SshProber {
    pub fn new(transport: Arc<SshTransport>, binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport,
            binary: binary.into(),
            timeout,
        }
    }

    async fn version_query(&self, host: &HostEntry) -> Result<bool, DispatchError> {
        let session = self.transport.connect(host).await?;
        let status = session
            .command(self.binary.as_str())
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(err) = session.close().await {
            debug!(host = %host, error = %err, "Error while closing probe session");
        }
        Ok(status?.success())
    }
}

#[async_trait]
impl HealthProber for SshProber {
    async fn probe(&self, host: &HostEntry) -> Probe {
        match tokio::time::timeout(self.timeout, self.version_query(host)).await {
            Ok(Ok(true)) => {
                debug!(host = %host, "Host is alive");
                Probe::Alive
            }
            Ok(Ok(false)) => {
                warn!(host = %host, binary = %self.binary, "Version query failed on host");
                Probe::Unreachable
            }
            Ok(Err(err)) => {
                warn!(host = %host, error = %err, "Host is unreachable");
                Probe::Unreachable
            }
            Err(_) => {
                warn!(host = %host, timeout = ?self.timeout, "Host probe timed out");
                Probe::Unreachable
            }
        }
    }
}
