//! uibridge - viewer and controller for a running uibridged daemon
//!
//! # Usage
//!
//! ```bash
//! # Follow status and change notifications (reconnects automatically)
//! uibridge watch
//!
//! # Run an expression in the remote app
//! uibridge invoke "document.title"
//!
//! # Show the current snapshot
//! uibridge snapshot --full
//!
//! # List debug targets on the configured ports
//! uibridge targets
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use bridge_core::Snapshot;
use bridge_protocol::{BridgeMessage, ClientRequest, Notification};
use bridged::discovery::{select_target, Discoverer};
use bridged::supervisor::Backoff;
use bridged::BridgeConfig;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Initial reconnect delay for `watch`.
const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Maximum reconnect delay for `watch`.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Reconnect delay growth for `watch`.
const RETRY_MULTIPLIER: f64 = 2.0;

/// uibridge viewer - talks to a running uibridged
#[derive(Parser, Debug)]
#[command(name = "uibridge", version, about)]
struct Args {
    /// Daemon URL (defaults to the configured listen address)
    #[arg(short, long, global = true)]
    url: Option<String>,

    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print notifications as they arrive
    Watch,
    /// Run an expression in the remote app and print its value
    Invoke {
        expression: String,

        /// Seconds to wait for the result
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Print the current snapshot
    Snapshot {
        /// Print the whole snapshot as JSON instead of a summary
        #[arg(long)]
        full: bool,
    },
    /// List debug targets on every configured port
    Targets,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("uibridge=warn".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = BridgeConfig::load(args.config.as_deref()).context("Failed to load config")?;
    let url = args
        .url
        .clone()
        .unwrap_or_else(|| format!("ws://{}", config.listen));

    match args.command {
        Command::Watch => watch(&url).await,
        Command::Invoke {
            expression,
            timeout: secs,
        } => invoke(&url, &expression, Duration::from_secs(secs)).await,
        Command::Snapshot { full } => snapshot(&url, full).await,
        Command::Targets => targets(&config).await,
    }
}

// ============================================================================
// watch
// ============================================================================

/// Follows the daemon until Ctrl+C, reconnecting with exponential backoff.
async fn watch(url: &str) -> Result<()> {
    let cancel_token = CancellationToken::new();
    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c_token.cancel();
    });

    let mut backoff = Backoff::new(RETRY_INITIAL_DELAY, RETRY_MAX_DELAY, RETRY_MULTIPLIER);

    loop {
        match connect_async(url).await {
            Ok((socket, _)) => {
                info!(url, "Connected to daemon");
                backoff.reset();
                tokio::select! {
                    _ = cancel_token.cancelled() => return Ok(()),
                    result = follow(socket) => {
                        if let Err(e) = result {
                            warn!(error = %e, "Connection to daemon lost");
                        }
                    }
                }
            }
            Err(e) => debug!(url, error = %e, "Daemon not reachable"),
        }

        let delay = backoff.next_delay();
        eprintln!("Disconnected; retrying in {}s", delay.as_secs_f32());
        tokio::select! {
            _ = cancel_token.cancelled() => return Ok(()),
            _ = sleep(delay) => {}
        }
    }
}

/// Prints notifications until the socket closes.
async fn follow(mut socket: Socket) -> Result<()> {
    while let Some(frame) = socket.next().await {
        let Message::Text(text) = frame? else {
            continue;
        };

        match Notification::from_json(text.as_str()) {
            Ok(notification) => print_notification(&notification),
            Err(e) => warn!(error = %e, "Unreadable notification"),
        }
    }
    Ok(())
}

fn print_notification(notification: &Notification) {
    let ts = notification.timestamp.format("%H:%M:%S%.3f");
    match &notification.message {
        BridgeMessage::StatusUpdate {
            peer_reachable,
            connected,
        } => println!("{ts} status   peer={peer_reachable} connected={connected}"),
        BridgeMessage::SnapshotUpdate => println!("{ts} snapshot changed"),
        other => println!("{ts} {other:?}"),
    }
}

// ============================================================================
// One-shot requests
// ============================================================================

/// Sends one request and returns the first reply `matches` accepts.
async fn request<F>(url: &str, req: ClientRequest, wait: Duration, matches: F) -> Result<BridgeMessage>
where
    F: Fn(&BridgeMessage) -> bool,
{
    let (mut socket, _) = connect_async(url)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;

    socket
        .send(Message::Text(req.to_json()?.into()))
        .await
        .context("Failed to send request")?;

    let reply = timeout(wait, read_reply(&mut socket, &matches))
        .await
        .context("Timed out waiting for reply")??;

    let _ = socket.close(None).await;
    Ok(reply)
}

/// Reads notifications until one matches; daemon errors abort.
async fn read_reply<F>(socket: &mut Socket, matches: &F) -> Result<BridgeMessage>
where
    F: Fn(&BridgeMessage) -> bool,
{
    while let Some(frame) = socket.next().await {
        let Message::Text(text) = frame? else {
            continue;
        };
        let notification = Notification::from_json(text.as_str())?;
        if let BridgeMessage::Error { message } = &notification.message {
            bail!("Daemon rejected request: {message}");
        }
        if matches(&notification.message) {
            return Ok(notification.message);
        }
    }
    bail!("Daemon closed the connection")
}

async fn invoke(url: &str, expression: &str, wait: Duration) -> Result<()> {
    const REQUEST_ID: u64 = 1;

    let reply = request(url, ClientRequest::invoke(REQUEST_ID, expression), wait, |m| {
        matches!(m, BridgeMessage::ActionResult { request_id, .. } if *request_id == REQUEST_ID)
    })
    .await?;

    match reply {
        BridgeMessage::ActionResult {
            ok: true, value, ..
        } => {
            let value = value.unwrap_or(serde_json::Value::Null);
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        BridgeMessage::ActionResult { reason, .. } => {
            bail!("Action failed: {}", reason.unwrap_or_default())
        }
        other => bail!("Unexpected reply: {other:?}"),
    }
}

async fn snapshot(url: &str, full: bool) -> Result<()> {
    let reply = request(url, ClientRequest::FetchSnapshot, Duration::from_secs(10), |m| {
        matches!(m, BridgeMessage::Snapshot { .. })
    })
    .await?;

    let BridgeMessage::Snapshot { snapshot } = reply else {
        bail!("Unexpected reply");
    };

    match snapshot {
        None => println!("No snapshot captured yet."),
        Some(snapshot) if full => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        Some(snapshot) => print_summary(&snapshot),
    }
    Ok(())
}

fn print_summary(snapshot: &Snapshot) {
    println!("hash:        {}", snapshot.hash);
    println!("captured at: {}", snapshot.captured_at.to_rfc3339());
    println!("content:     {} bytes", snapshot.content.len());
    println!("style:       {} bytes", snapshot.style.len());
    if !snapshot.stats.is_null() {
        println!("stats:       {}", snapshot.stats);
    }
}

// ============================================================================
// targets
// ============================================================================

async fn targets(config: &BridgeConfig) -> Result<()> {
    let discoverer = Discoverer::new(
        config.host.clone(),
        config.discovery_timeout(),
        config.targets.clone(),
    )?;

    for entry in discoverer.list_targets(&config.ports).await {
        match entry.targets {
            Err(reason) => println!("{}:{}  unreachable ({reason})", config.host, entry.port),
            Ok(targets) => {
                let selected = select_target(&targets, &config.targets).map(|(tier, t)| (tier, &t.id));
                println!("{}:{}  {} targets", config.host, entry.port, targets.len());
                for target in &targets {
                    let mark = match selected {
                        Some((tier, id)) if *id == target.id => format!("* {tier}"),
                        _ => String::new(),
                    };
                    println!(
                        "  [{}] {:<32} {} {}",
                        target.target_type, target.title, target.url, mark
                    );
                }
            }
        }
    }
    Ok(())
}
