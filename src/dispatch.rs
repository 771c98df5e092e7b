//! One invocation, start to finish.
//!
//! ```text
//! Start ──(no remote hosts)──────────────────────────────┐
//!   │                                                     ▼
//!   └─> Selecting ──(exhausted / localhost)──────────> Local
//!         ▲    │                                          │
//!         │    └─(remote)─> Probing ──(alive)──> Executing
//!         └──────(unreachable: mark bad)──┘               │
//!                                          register ─ execute ─ deregister ─ exit
//! ```
//!
//! Every pass through `Selecting` either returns or excludes one more host, so the loop
//! ends after at most one probe per configured host.

use std::collections::HashSet;
use std::ffi::OsString;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::DispatchError;
use crate::host::{HostEntry, Target};
use crate::job::{JobId, JobRecord};
use crate::probe::{HealthProber, Probe};
use crate::selector::{select_host, Selection};
use crate::session::{Completion, Executor};
use crate::signal::Interrupt;
use crate::store::{LoadSnapshot, StateStore};

/// Per-invocation state. Never persisted and never visible to other invocations.
#[derive(Debug, Default)]
pub struct RunState {
    bad: HashSet<String>,
    fallback: bool,
}

impl RunState {
    pub fn mark_bad(&mut self, host: &HostEntry) {
        self.bad.insert(host.name.clone());
    }

    pub fn is_bad(&self, host: &str) -> bool {
        self.bad.contains(host)
    }

    pub fn bad_hosts(&self) -> &HashSet<String> {
        &self.bad
    }

    /// Whether local execution was chosen because no remote host was usable.
    pub fn fallback_engaged(&self) -> bool {
        self.fallback
    }
}

/// Holds a job registration and removes it when dropped, however execution ended.
pub struct JobGuard {
    store: Arc<dyn StateStore>,
    job_id: JobId,
}

impl JobGuard {
    pub fn register(store: Arc<dyn StateStore>, record: &JobRecord) -> Result<Self, DispatchError> {
        store.register(record)?;
        Ok(Self {
            store,
            job_id: record.job_id,
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if let Err(err) = self.store.deregister(&self.job_id) {
            error!(job_id = %self.job_id, error = %err, "Failed to deregister job");
        }
    }
}

pub struct Dispatcher {
    hosts: Vec<HostEntry>,
    store: Arc<dyn StateStore>,
    prober: Box<dyn HealthProber>,
    executor: Box<dyn Executor>,
    interrupts: Option<flume::Receiver<Interrupt>>,
}

impl Dispatcher {
    pub fn new(
        hosts: Vec<HostEntry>,
        store: Box<dyn StateStore>,
        prober: Box<dyn HealthProber>,
        executor: Box<dyn Executor>,
    ) -> Self {
        Self {
            hosts,
            store: Arc::from(store),
            prober,
            executor,
            interrupts: None,
        }
    }

    /// Ends the invocation without running anything when a termination request arrives
    /// before execution starts.
    pub fn with_interrupts(mut self, interrupts: flume::Receiver<Interrupt>) -> Self {
        self.interrupts = Some(interrupts);
        self
    }

    /// Runs the wrapped command once and reports how it ended.
    pub async fn dispatch(&self, args: &[OsString]) -> Result<Completion, DispatchError> {
        let mut state = RunState::default();
        let target = tokio::select! {
            biased;
            Some(interrupt) = self.next_interrupt() => {
                warn!(signal = interrupt.signal_number(), "Termination requested before execution");
                return Ok(Completion::Abandoned(interrupt));
            }
            target = self.choose_target(&mut state) => target?,
        };

        let record = JobRecord::new(target.host_id());
        let guard = {
            let store = Arc::clone(&self.store);
            let record = record.clone();
            tokio::task::spawn_blocking(move || JobGuard::register(store, &record)).await??
        };
        if let Some(interrupt) = self.pending_interrupt() {
            warn!(signal = interrupt.signal_number(), "Termination requested before execution");
            return Ok(Completion::Abandoned(interrupt));
        }
        info!(job_id = %guard.job_id(), host = %target, fallback = state.fallback_engaged(), "Executing");

        let completion = self.executor.execute(&target, args).await;
        drop(guard);

        match &completion {
            Ok(done) => info!(job_id = %record.job_id, exit_code = done.exit_code(), "Finished"),
            Err(err) => error!(job_id = %record.job_id, error = %err, "Execution failed"),
        }
        completion
    }

    /// Selects and probes until a usable target is found. Falls back to local execution
    /// rather than failing when no remote host is usable.
    pub async fn choose_target(&self, state: &mut RunState) -> Result<Target, DispatchError> {
        if self.hosts.iter().all(HostEntry::is_local) {
            info!("No remote hosts configured, running locally");
            return Ok(Target::Local);
        }

        loop {
            let snapshot = self.snapshot().await?;
            match select_host(&self.hosts, &snapshot, state.bad_hosts()) {
                Selection::Exhausted => {
                    warn!(
                        bad_hosts = ?state.bad_hosts(),
                        "No remote host available, falling back to local execution"
                    );
                    state.fallback = true;
                    return Ok(Target::Local);
                }
                Selection::Host(host) if host.is_local() => return Ok(Target::Local),
                Selection::Host(host) => match self.prober.probe(host).await {
                    Probe::Alive => return Ok(Target::Remote(host.clone())),
                    Probe::Unreachable => {
                        warn!(host = %host, "Marking host bad for this run");
                        state.mark_bad(host);
                    }
                },
            }
        }
    }

    /// Store access may wait out contention, so it runs off the async workers.
    async fn snapshot(&self) -> Result<LoadSnapshot, DispatchError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.snapshot()).await?
    }

    async fn next_interrupt(&self) -> Option<Interrupt> {
        match &self.interrupts {
            Some(interrupts) => interrupts.recv_async().await.ok(),
            None => None,
        }
    }

    fn pending_interrupt(&self) -> Option<Interrupt> {
        self.interrupts
            .as_ref()
            .and_then(|interrupts| interrupts.try_recv().ok())
    }
}
