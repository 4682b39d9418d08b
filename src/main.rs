use modelgate::auth::AuthCommand;
use modelgate::config::Config;
use modelgate::error::SupervisorError;
use modelgate::healthcheck::TcpPortProbe;
use modelgate::process::OsProcessLauncher;
use modelgate::supervisor::{Supervisor, SupervisorEvent, SupervisorSettings};
use modelgate::sync::ConfigSynchronizer;
use modelgate::{PKG_NAME, VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("modelgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("auth") => run_auth(&args[1..]).await,
        Some("help") | Some("--help") | Some("-h") => {
            print_help();
            Ok(())
        }
        Some("version") | Some("--version") | Some("-V") => {
            println!("{} {}", PKG_NAME, VERSION);
            Ok(())
        }
        Some(path) => run_daemon(PathBuf::from(path), true).await,
        None => run_daemon(PathBuf::from(DEFAULT_CONFIG_PATH), false).await,
    }
}

fn print_help() {
    println!(
        r#"{} {}

Usage:
  {} [config.toml]                     Run the control plane
  {} auth <provider> [email] [--config config.toml]
                                       Run one provider login

Providers: claude, codex, gemini, qwen (needs email), antigravity, copilot

Signals: SIGINT/SIGTERM stop, SIGHUP reloads the config and restarts"#,
        PKG_NAME, VERSION, PKG_NAME, PKG_NAME
    );
}

/// Load the config file. A missing default file means built-in defaults; an
/// explicitly named file must exist.
fn load_config(path: &Path, required: bool) -> anyhow::Result<Config> {
    if !required && !path.exists() {
        info!(path = %path.display(), "No configuration file, using defaults");
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }

    let config = Config::load(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

fn build_supervisor(config: &Config) -> Arc<Supervisor> {
    let sync = Arc::new(ConfigSynchronizer::new(
        config.paths.auth_dir(),
        config.paths.merged_config(),
        config.sync.key_file_prefix.clone(),
    ));
    Supervisor::new(
        SupervisorSettings::from_config(config),
        Arc::new(OsProcessLauncher),
        Arc::new(TcpPortProbe),
        sync,
    )
}

async fn run_daemon(config_path: PathBuf, required: bool) -> anyhow::Result<()> {
    let config = load_config(&config_path, required)?;
    print_startup_banner(&config);

    let supervisor = build_supervisor(&config);
    let events_handle = tokio::spawn(log_events(supervisor.subscribe()));

    let _watcher = match supervisor.watch_key_files(config.sync.debounce()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "Key file watcher unavailable, key changes need a restart");
            None
        }
    };

    let shutdown = CancellationToken::new();
    let start = supervisor.start(&shutdown);
    tokio::pin!(start);

    // Ctrl+C during the initial start cancels it
    let started = tokio::select! {
        result = &mut start => result,
        _ = tokio::signal::ctrl_c() => {
            shutdown.cancel();
            start.await
        }
    };
    match started {
        Ok(true) => info!("Control plane running"),
        Ok(false) => warn!("Initial start failed; send SIGHUP to retry"),
        Err(SupervisorError::Cancelled) => {
            info!("Start cancelled");
            events_handle.abort();
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    wait_for_shutdown(&supervisor, &config_path, required).await?;

    info!("Shutting down");
    supervisor.stop(&CancellationToken::new()).await?;
    events_handle.abort();
    info!("Shutdown complete");
    Ok(())
}

/// Block until SIGINT/SIGTERM, handling SIGHUP reloads in between
#[cfg(unix)]
async fn wait_for_shutdown(supervisor: &Supervisor, config_path: &Path, required: bool) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                reload(supervisor, config_path, required).await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_supervisor: &Supervisor, _config_path: &Path, _required: bool) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}

#[cfg(unix)]
async fn reload(supervisor: &Supervisor, config_path: &Path, required: bool) {
    let config = match load_config(config_path, required) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Reload failed, keeping current configuration");
            return;
        }
    };

    supervisor.update_settings(SupervisorSettings::from_config(&config));
    match supervisor.restart(&CancellationToken::new()).await {
        Ok(true) => info!("Configuration reloaded"),
        Ok(false) => error!("Restart after reload failed"),
        Err(e) => error!(error = %e, "Restart after reload aborted"),
    }
}

async fn log_events(mut events: broadcast::Receiver<SupervisorEvent>) {
    loop {
        match events.recv().await {
            Ok(SupervisorEvent::RunningChanged(running)) => info!(running, "Running state changed"),
            Ok(SupervisorEvent::ConfigChanged) => info!("Backend config regenerated"),
            Ok(SupervisorEvent::LogUpdated(lines)) => {
                if let Some(last) = lines.last() {
                    debug!(target: "modelgate::child", "{}", last.text);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Event listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_auth(args: &[String]) -> anyhow::Result<()> {
    let mut positional = Vec::new();
    let mut config_path = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                config_path = Some(PathBuf::from(value));
            }
            _ => positional.push(arg.as_str()),
        }
    }

    let provider = positional
        .first()
        .ok_or_else(|| anyhow::anyhow!("Usage: {} auth <provider> [email] [--config path]", PKG_NAME))?;
    let command = AuthCommand::parse(provider, positional.get(1).copied())?;

    let config = match config_path {
        Some(path) => load_config(&path, true)?,
        None => load_config(Path::new(DEFAULT_CONFIG_PATH), false)?,
    };
    let supervisor = build_supervisor(&config);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let session = supervisor.run_auth_command(command, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&session.result)?);
    if !session.result.ok {
        std::process::exit(1);
    }

    // Scheduled input and the hard timeout need the runtime alive
    if session.is_pending() {
        info!(
            timeout_secs = supervisor.settings().auth.hard_timeout.as_secs(),
            "Waiting for the browser login to finish"
        );
        session.finish().await;
    }
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting control plane");
    info!(
        relay_port = config.server.relay_port,
        backend_port = config.server.backend_port,
        "Ports"
    );
    info!(
        auth_dir = %config.paths.auth_dir().display(),
        base_config = %config.paths.base_config().display(),
        backend = %config.paths.backend_executable().display(),
        relay = %config.paths.relay_executable().display(),
        "Paths"
    );
    info!(
        health_check_interval_ms = config.supervisor.health_check_interval_ms,
        unhealthy_threshold = config.supervisor.unhealthy_threshold,
        port_wait_timeout_ms = config.supervisor.port_wait_timeout_ms,
        "Health check settings"
    );
    info!(
        gateway = config.gateway.to_gateway_config().is_active(),
        disabled_providers = ?config
            .providers
            .iter()
            .filter(|(_, enabled)| !**enabled)
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>(),
        "Providers"
    );
}
