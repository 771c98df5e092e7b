use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::error::DispatchError;

/// A termination request received by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// SIGINT
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl Interrupt {
    pub fn signal_number(self) -> i32 {
        match self {
            Interrupt::Interrupt => libc::SIGINT,
            Interrupt::Terminate => libc::SIGTERM,
        }
    }
}

/// Installs SIGINT and SIGTERM handlers and forwards every delivery into a channel.
///
/// Once installed the signals no longer terminate the process; the executor decides what
/// each one means for the running command. Must be called from within the runtime.
pub fn listen() -> Result<flume::Receiver<Interrupt>, DispatchError> {
    let mut sigterm = signal(SignalKind::terminate()).map_err(DispatchError::Signal)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(DispatchError::Signal)?;
    let (interrupt_tx, interrupt_rx) = flume::unbounded();

    tokio::spawn(async move {
        loop {
            let interrupt = tokio::select! {
                Some(()) = sigterm.recv() => Interrupt::Terminate,
                Some(()) = sigint.recv() => Interrupt::Interrupt,
                else => break,
            };
            info!(signal = interrupt.signal_number(), "Received termination request");
            if interrupt_tx.send(interrupt).is_err() {
                break;
            }
        }
    });

    Ok(interrupt_rx)
}
