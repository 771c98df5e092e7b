//! rffmpeg: Remote ffmpeg dispatcher.
//!
//! Each invocation picks the least loaded of the configured hosts, checks that it is
//! reachable, and runs the wrapped command there over SSH, falling back to the local
//! binary when no host is usable. Load is shared between invocations through a state store.

// Serde helper module.
mod serde;
// Configuration file and entry point arguments.
pub mod config;
// Hosts, targets and tools.
pub mod host;
// Job records.
pub mod job;
// Process liveness.
pub mod process;
// Lock files.
pub mod sync;
// Contention backoff.
pub mod retry;
// Cross-process job state.
pub mod store;
// Host selection.
pub mod selector;
// Host health probes.
pub mod probe;
// Standard input relay.
pub mod relay;
// Termination requests.
pub mod signal;
// Command execution.
pub mod session;
// Invocation state machine.
pub mod dispatch;
// Log file setup.
pub mod logging;
// Error handling.
pub mod error;

pub use config::{Config, Invocation};
pub use dispatch::{Dispatcher, JobGuard, RunState};
pub use error::DispatchError;
pub use host::{HostEntry, Target, Tool, LOCALHOST};
pub use job::{JobId, JobRecord};
pub use probe::{HealthProber, Probe, SshProber};
pub use selector::{select_host, weighted_load, Selection};
pub use session::{CommandExecutor, Completion, Executor, SshTransport, ToolCommand};
pub use signal::Interrupt;
pub use store::{LoadSnapshot, StateStore};
