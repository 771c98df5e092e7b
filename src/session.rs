//! Running the wrapped command, locally or over SSH.
//!
//! Standard output and error are inherited by the command, so whatever it writes reaches
//! our caller byte for byte. Standard input goes through the [`Relay`], which watches for
//! the quit token. While the relay runs, the command's exit is awaited concurrently; the
//! first to finish decides what happens to the other.

use std::ffi::OsString;
use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio as StdStdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openssh::{KnownHosts, Session as SshSession, SessionBuilder, Stdio};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CommandsConfig, RemoteConfig};
use crate::error::DispatchError;
use crate::host::{HostEntry, Target, Tool};
use crate::relay::{Relay, RelayEnd};
use crate::signal::Interrupt;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The command exited by itself.
    Exited(ExitStatus),
    /// A repeated termination request made us stop waiting for the command.
    Abandoned(Interrupt),
}

impl Completion {
    /// Exit code this process should report.
    pub fn exit_code(&self) -> i32 {
        match self {
            Completion::Exited(status) => status
                .code()
                .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
            Completion::Abandoned(interrupt) => 128 + interrupt.signal_number(),
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs the wrapped command on `target` with `args` passed through verbatim.
    async fn execute(&self, target: &Target, args: &[OsString]) -> Result<Completion, DispatchError>;
}

/// Opens SSH sessions with strict host key checking. The ssh client always runs in batch
/// mode, so nothing ever prompts.
#[derive(Debug, Clone)]
pub struct SshTransport {
    user: Option<String>,
    port: Option<u16>,
    identity_file: Option<PathBuf>,
    known_hosts_file: Option<PathBuf>,
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(remote: &RemoteConfig, connect_timeout: Duration) -> Self {
        Self {
            user: remote.user.clone(),
            port: remote.port,
            identity_file: remote.identity_file.clone(),
            known_hosts_file: remote.known_hosts_file.clone(),
            connect_timeout,
        }
    }

    fn builder(&self) -> SessionBuilder {
        let mut builder = SessionBuilder::default();
        builder
            .known_hosts_check(KnownHosts::Strict)
            .connect_timeout(self.connect_timeout);
        if let Some(user) = &self.user {
            builder.user(user.clone());
        }
        if let Some(port) = self.port {
            builder.port(port);
        }
        if let Some(identity_file) = &self.identity_file {
            builder.keyfile(identity_file);
        }
        if let Some(known_hosts_file) = &self.known_hosts_file {
            builder.user_known_hosts_file(known_hosts_file);
        }
        builder
    }

    pub async fn connect(&self, host: &HostEntry) -> Result<SshSession, DispatchError> {
        match self.builder().connect_mux(&host.name).await {
            Ok(session) => {
                debug!(host = %host, "Connected to host");
                Ok(session)
            }
            Err(err) => {
                warn!(host = %host, error = %err, "Failed to connect to host");
                Err(err.into())
            }
        }
    }
}

/// Remote and local command lines for one tool.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    remote: String,
    local: String,
    pre: Vec<String>,
}

impl ToolCommand {
    pub fn new(commands: &CommandsConfig, tool: Tool) -> Self {
        Self {
            remote: commands.remote_binary(tool).to_string(),
            local: commands.local_binary(tool).to_string(),
            pre: commands.pre.clone(),
        }
    }

    /// Program and leading arguments for a remote run.
    fn remote_argv(&self) -> (&str, Vec<&str>) {
        match self.pre.split_first() {
            Some((program, rest)) => {
                let mut leading: Vec<&str> = rest.iter().map(String::as_str).collect();
                leading.push(&self.remote);
                (program, leading)
            }
            None => (&self.remote, vec![]),
        }
    }
}

/// The production executor.
pub struct CommandExecutor {
    command: ToolCommand,
    transport: Arc<SshTransport>,
    quit_token: String,
    interrupts: flume::Receiver<Interrupt>,
}

impl CommandExecutor {
    pub fn new(
        command: ToolCommand,
        transport: Arc<SshTransport>,
        quit_token: impl Into<String>,
        interrupts: flume::Receiver<Interrupt>,
    ) -> Self {
        Self {
            command,
            transport,
            quit_token: quit_token.into(),
            interrupts,
        }
    }

    fn relay(&self, cancel: CancellationToken) -> Relay {
        Relay::new(self.quit_token.as_bytes(), self.interrupts.clone(), cancel)
    }

    /// Runs the local binary, relaying `input` to it.
    pub async fn run_local<R>(&self, input: R, args: &[OsString]) -> Result<Completion, DispatchError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        info!(program = %self.command.local, "Running command locally");
        let mut child = tokio::process::Command::new(&self.command.local)
            .args(args)
            .stdin(StdStdio::piped())
            .stdout(StdStdio::inherit())
            .stderr(StdStdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(DispatchError::Spawn)?;
        let stdin = child.stdin.take();
        let exit = async { child.wait().await.map_err(DispatchError::Spawn) };
        supervise(input, stdin, exit, self.relay(CancellationToken::new()), &self.interrupts).await
    }

    /// Runs the remote binary on `host`, relaying `input` to it.
    pub async fn run_remote<R>(
        &self,
        host: &HostEntry,
        input: R,
        args: &[OsString],
    ) -> Result<Completion, DispatchError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let args = args
            .iter()
            .map(|arg| arg.to_str().ok_or_else(|| DispatchError::Argument(arg.clone())))
            .collect::<Result<Vec<&str>, _>>()?;
        let session = self.transport.connect(host).await?;

        let (program, leading) = self.command.remote_argv();
        info!(host = %host, program, "Running command remotely");
        let completion = {
            let mut command = session.command(program);
            command
                .args(leading)
                .args(args)
                .stdin(Stdio::piped())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            let mut child = command.spawn().await?;
            let stdin = child.stdin().take();
            let exit = async move { child.wait().await.map_err(DispatchError::from) };
            supervise(input, stdin, exit, self.relay(CancellationToken::new()), &self.interrupts)
                .await
        };

        // After an abandon the session is dropped without waiting for a clean close.
        if let Ok(Completion::Exited(_)) = completion {
            if let Err(err) = session.close().await {
                debug!(host = %host, error = %err, "Error while closing session");
            }
        }
        completion
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, target: &Target, args: &[OsString]) -> Result<Completion, DispatchError> {
        match target {
            Target::Local => self.run_local(tokio::io::stdin(), args).await,
            Target::Remote(host) => self.run_remote(host, tokio::io::stdin(), args).await,
        }
    }
}

/// Relays input while waiting for `exit`.
///
/// If the command exits first, the relay is cancelled. If the relay ends first (end of input,
/// quit token, or a termination request turned into the token), waiting continues until
/// the command exits. Only a second termination request abandons the wait; the first one
/// is either forwarded as the quit token or, once input is closed, just noted.
pub(crate) async fn supervise<R, W, F>(
    input: R,
    stdin: Option<W>,
    exit: F,
    relay: Relay,
    interrupts: &flume::Receiver<Interrupt>,
) -> Result<Completion, DispatchError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = Result<ExitStatus, DispatchError>>,
{
    tokio::pin!(exit);
    let cancel = relay.cancel_token();
    let mut interrupted = false;

    if let Some(stdin) = stdin {
        let mut relay_task = tokio::spawn(relay.run(input, stdin));
        tokio::select! {
            status = &mut exit => {
                cancel.cancel();
                return status.map(Completion::Exited);
            }
            ended = &mut relay_task => match ended {
                Ok(Ok(end)) => {
                    debug!(?end, "Input relay finished");
                    interrupted = matches!(end, RelayEnd::Interrupted(_));
                }
                Ok(Err(err)) => warn!(error = %err, "Input relay failed"),
                Err(err) => warn!(error = %err, "Input relay task failed"),
            },
        }
    }

    let mut listening = true;
    loop {
        tokio::select! {
            status = &mut exit => return status.map(Completion::Exited),
            interrupt = interrupts.recv_async(), if listening => match interrupt {
                Ok(interrupt) if interrupted => {
                    warn!(
                        signal = interrupt.signal_number(),
                        "Repeated termination request, abandoning command"
                    );
                    return Ok(Completion::Abandoned(interrupt));
                }
                Ok(interrupt) => {
                    warn!(
                        signal = interrupt.signal_number(),
                        "Termination requested, waiting for command to exit"
                    );
                    interrupted = true;
                }
                Err(_) => listening = false,
            },
        }
    }
}
