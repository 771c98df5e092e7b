use std::sync::Arc;

use tracing::{error, info};

use rffmpeg::config::CONFIG_ENV;
use rffmpeg::{
    logging, signal, store, CommandExecutor, Config, DispatchError, Dispatcher, Invocation,
    SshProber, SshTransport, ToolCommand,
};

async fn run(invocation: Invocation) -> Result<i32, DispatchError> {
    let config = Config::load(&invocation.config_path)?;
    if let Err(err) = logging::init(&config.logging) {
        eprintln!("[rffmpeg] {}; continuing without a log file", err);
    }
    info!(
        pid = std::process::id(),
        tool = %invocation.tool,
        args = ?invocation.args,
        "Starting rffmpeg"
    );

    let interrupts = signal::listen()?;
    let store = store::open(&config.state)?;
    let transport = Arc::new(SshTransport::new(
        &config.remote,
        config.dispatch.probe_timeout,
    ));
    let prober = SshProber::new(
        Arc::clone(&transport),
        config.commands.remote_binary(invocation.tool),
        config.dispatch.probe_timeout,
    );
    let executor = CommandExecutor::new(
        ToolCommand::new(&config.commands, invocation.tool),
        transport,
        config.dispatch.quit_token.clone(),
        interrupts.clone(),
    );
    let dispatcher = Dispatcher::new(
        config.remote.hosts().cloned().collect(),
        store,
        Box::new(prober),
        Box::new(executor),
    )
    .with_interrupts(interrupts);

    let completion = dispatcher.dispatch(&invocation.args).await?;
    Ok(completion.exit_code())
}

#[tokio::main]
async fn main() {
    let invocation = Invocation::parse(std::env::args_os(), std::env::var_os(CONFIG_ENV))
        .unwrap_or_else(|err| err.exit());

    let code = match run(invocation).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "rffmpeg failed");
            // The command is no longer running, so this cannot interleave with its output.
            eprintln!("[rffmpeg] {}", err);
            err.exit_code()
        }
    };
    info!(exit_code = code, "Exiting");
    // Exit right away: a blocked read on standard input would otherwise hold up runtime
    // shutdown until the caller writes another line.
    std::process::exit(code);
}
