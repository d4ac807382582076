//! `uibridged`: keeps a control connection to the remote app and relays its
//! UI to subscribers.
//!
//! ```bash
//! uibridged start                           # foreground
//! uibridged start -d                        # detach, log to the state dir
//! uibridged start --config ./uibridge.toml
//! uibridged status
//! uibridged stop
//!
//! UIBRIDGE_PORTS=9222 RUST_LOG=bridged=debug uibridged start
//! ```
//!
//! SIGTERM and SIGINT shut the daemon down cleanly.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bridged::pidfile::{self, PidFile};
use bridged::server::SubscriberServer;
use bridged::{Bridge, BridgeConfig, Supervisor};

/// How long `stop` waits for the daemon to exit.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Mirrors a remote app's UI to WebSocket subscribers
#[derive(Parser, Debug)]
#[command(name = "uibridged", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge
    Start {
        /// Detach from the terminal
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file to use instead of the default location
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Ask a running bridge to shut down
    Stop,
    /// Report whether a bridge is running
    Status,
}

fn main() -> Result<ExitCode> {
    let command = Args::parse().command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });
    let pidfile = PidFile::in_state_dir();

    match command {
        Command::Start { daemon, config } => start(&pidfile, daemon, config),
        Command::Stop => stop(&pidfile),
        Command::Status => Ok(status(&pidfile)),
    }
}

fn start(pidfile: &PidFile, daemon: bool, config: Option<PathBuf>) -> Result<ExitCode> {
    if let Some(pid) = pidfile.live_pid() {
        eprintln!("uibridged already running as pid {pid}; run `uibridged stop` first");
        return Ok(ExitCode::FAILURE);
    }

    // Config errors must reach the terminal, so load before detaching
    let config = BridgeConfig::load(config.as_deref()).context("Failed to load config")?;
    if daemon {
        detach()?;
    }

    pidfile
        .claim()
        .with_context(|| format!("Failed to write {}", pidfile.path().display()))?;
    let result = run_daemon(config);
    pidfile.release();

    result.map(|()| ExitCode::SUCCESS)
}

fn stop(pidfile: &PidFile) -> Result<ExitCode> {
    let Some(pid) = pidfile.live_pid() else {
        println!("uibridged is not running");
        return Ok(ExitCode::SUCCESS);
    };

    println!("Stopping uibridged (pid {pid})");
    terminate(pid)?;

    let deadline = Instant::now() + STOP_GRACE;
    while Instant::now() < deadline {
        if !pidfile::process_alive(pid) {
            println!("Stopped");
            return Ok(ExitCode::SUCCESS);
        }
        thread::sleep(Duration::from_millis(100));
    }

    eprintln!("uibridged still running after {}s", STOP_GRACE.as_secs());
    Ok(ExitCode::FAILURE)
}

fn status(pidfile: &PidFile) -> ExitCode {
    let Some(pid) = pidfile.live_pid() else {
        println!("uibridged is not running");
        return ExitCode::FAILURE;
    };

    println!("uibridged running as pid {pid}");
    if let Ok(config) = BridgeConfig::load(None) {
        println!("subscribers: ws://{}", config.listen);
    }
    ExitCode::SUCCESS
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<()> {
    let pid = libc::pid_t::try_from(pid).context("pid out of range")?;
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        bail!(
            "Failed to signal pid {pid}: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> Result<()> {
    bail!("`uibridged stop` needs a Unix platform")
}

/// Forks into the background with output sent to the state dir log.
///
/// Must run before the tokio runtime starts.
fn detach() -> Result<()> {
    let dir = pidfile::state_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let log = File::create(dir.join("uibridged.log")).context("Failed to open log file")?;
    let err_log = log.try_clone().context("Failed to open log file")?;

    daemonize::Daemonize::new()
        .working_directory("/")
        .stdout(log)
        .stderr(err_log)
        .start()
        .context("Failed to daemonize")
}

#[tokio::main]
async fn run_daemon(config: BridgeConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("bridged=info".parse()?)
        .add_directive("bridge_core=info".parse()?)
        .add_directive("bridge_protocol=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        ports = ?config.ports,
        listen = %config.listen,
        "uibridged starting"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let listen = config.listen;
    let bridge = Bridge::new(config);
    let server = SubscriberServer::bind(listen, bridge.clone(), cancel.clone())
        .await
        .context("Failed to start subscriber server")?;
    let supervisor = Supervisor::new(bridge).context("Failed to start supervisor")?;

    let server_task = tokio::spawn(server.run());
    supervisor.run(cancel.clone()).await;

    // The supervisor only returns on shutdown; make sure the server follows
    cancel.cancel();
    if let Err(e) = server_task.await {
        error!(error = %e, "Server task failed");
    }

    info!("uibridged stopped");
    Ok(())
}

/// Cancels `cancel` on the first SIGTERM or SIGINT.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let received = {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut term), Ok(mut int)) => tokio::select! {
                _ = term.recv() => Ok("SIGTERM"),
                _ = int.recv() => Ok("SIGINT"),
            },
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    };

    #[cfg(not(unix))]
    let received = tokio::signal::ctrl_c().await.map(|()| "Ctrl+C");

    match received {
        Ok(name) => info!(signal = name, "Shutting down"),
        Err(e) => error!(error = %e, "Cannot listen for signals, shutting down"),
    }
    cancel.cancel();
}
