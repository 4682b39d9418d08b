//! Relay process
//!
//! Usage:
//!   modelgate-relay [--listen <port>] [--target <port>] [--config <path>]
//!
//!   --listen   Port to accept client traffic on (default 8317)
//!   --target   Port of the local backend engine (default 8318)
//!   --config   Gateway config file, re-read whenever it changes

use anyhow::{Context, Result};
use modelgate::proxy::{ProxyServer, RelaySettings, DEFAULT_BACKEND_PORT, DEFAULT_RELAY_PORT};
use modelgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, PartialEq)]
struct RelayArgs {
    listen: u16,
    target: u16,
    config: Option<PathBuf>,
}

fn parse_args(args: &[String]) -> Result<RelayArgs> {
    let mut parsed = RelayArgs {
        listen: DEFAULT_RELAY_PORT,
        target: DEFAULT_BACKEND_PORT,
        config: None,
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--listen" | "-l" => {
                let value = iter.next().context("--listen requires a port")?;
                parsed.listen = value.parse().with_context(|| format!("Invalid listen port: {}", value))?;
            }
            "--target" | "-t" => {
                let value = iter.next().context("--target requires a port")?;
                parsed.target = value.parse().with_context(|| format!("Invalid target port: {}", value))?;
            }
            "--config" | "-c" => {
                let value = iter.next().context("--config requires a path")?;
                parsed.config = Some(PathBuf::from(value));
            }
            other => anyhow::bail!("Unknown argument: {}", other),
        }
    }

    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("modelgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&args)?;

    info!(
        name = PKG_NAME,
        version = VERSION,
        listen = args.listen,
        target = args.target,
        gateway_config = ?args.config,
        "Starting relay"
    );

    let settings = RelaySettings {
        listen: SocketAddr::from(([127, 0, 0, 1], args.listen)),
        target_port: args.target,
        gateway_config: args.config,
        ..RelaySettings::default()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::bind(settings, shutdown_rx).await?;
    let server_handle = tokio::spawn(server.run());

    wait_for_signal().await?;
    info!("Relay shutting down");
    let _ = shutdown_tx.send(true);
    server_handle.await??;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
