//! Process supervisor
//!
//! Owns the relay and the backend engine as a pair. Start, stop and
//! health-triggered restarts are serialized by one async lifecycle lock, which
//! also owns the process handles. Health ticks only ever `try_lock` it, so a
//! tick that lands during a transition is skipped instead of queued.

use crate::auth::{run_auth, AuthCommand, AuthRequest, AuthSession, AuthSettings};
use crate::config::Config;
use crate::error::SupervisorError;
use crate::gateway::GatewayConfig;
use crate::healthcheck::{wait_for_port, HealthCheckConfig, HealthState, HealthTransition, PortProbe, PortWait};
use crate::logbuf::{LogEntry, LogRingBuffer};
use crate::process::{LaunchSpec, OutputSink, ProcessHandle, ProcessLauncher, ProcessRole};
use crate::sync::{ConfigSynchronizer, ConfigWatcher, ProviderEnablement};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lines carried by each `LogUpdated` event
const LOG_EVENT_TAIL: usize = 100;
/// Buffered events per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of the process pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Notifications for whoever hosts the supervisor
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    RunningChanged(bool),
    LogUpdated(Vec<LogEntry>),
    ConfigChanged,
}

/// What one health tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTick {
    /// Lifecycle lock held by a transition
    Skipped,
    NotRunning,
    Healthy,
    Recovered { after: u32 },
    Degraded { failures: u32 },
    /// Threshold reached; carries whether the restart succeeded
    Restarted { ok: bool },
}

/// Everything the supervisor needs, resolved from [`Config`]
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub backend_executable: PathBuf,
    pub relay_executable: PathBuf,
    pub base_config: PathBuf,
    pub gateway_config: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub relay_port: u16,
    pub backend_port: u16,
    pub health: HealthCheckConfig,
    pub stop_grace_period: Duration,
    pub log_capacity: usize,
    pub orphan_process_names: Vec<String>,
    pub providers: ProviderEnablement,
    pub gateway: GatewayConfig,
    pub auth: AuthSettings,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backend_executable: config.paths.backend_executable(),
            relay_executable: config.paths.relay_executable(),
            base_config: config.paths.base_config(),
            gateway_config: config.paths.gateway_config(),
            working_dir: config.paths.working_dir(),
            relay_port: config.server.relay_port,
            backend_port: config.server.backend_port,
            health: HealthCheckConfig {
                interval: config.supervisor.health_check_interval(),
                connect_timeout: config.supervisor.port_connect_timeout(),
                port_wait_timeout: config.supervisor.port_wait_timeout(),
                unhealthy_threshold: config.supervisor.unhealthy_threshold,
            },
            stop_grace_period: config.supervisor.stop_grace_period(),
            log_capacity: config.supervisor.log_capacity,
            orphan_process_names: config.orphan_process_names(),
            providers: config.provider_enablement(),
            gateway: config.gateway.to_gateway_config(),
            auth: AuthSettings::default(),
        }
    }
}

/// Handles guarded by the lifecycle lock
#[derive(Default)]
struct ProcessPair {
    relay: Option<ProcessHandle>,
    backend: Option<ProcessHandle>,
}

impl ProcessPair {
    fn is_empty(&self) -> bool {
        self.relay.is_none() && self.backend.is_none()
    }
}

pub struct Supervisor {
    self_ref: Weak<Supervisor>,
    settings: RwLock<SupervisorSettings>,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn PortProbe>,
    sync: Arc<ConfigSynchronizer>,
    lifecycle: tokio::sync::Mutex<ProcessPair>,
    state: Mutex<SupervisorState>,
    health: Mutex<HealthState>,
    health_loop: Mutex<Option<CancellationToken>>,
    /// Bumped on every teardown so exit watchers of old processes stay quiet
    generation: AtomicU64,
    logs: LogRingBuffer,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn PortProbe>,
        sync: Arc<ConfigSynchronizer>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            health: Mutex::new(HealthState::new(settings.health.unhealthy_threshold)),
            logs: LogRingBuffer::new(settings.log_capacity),
            settings: RwLock::new(settings),
            launcher,
            probe,
            sync,
            lifecycle: tokio::sync::Mutex::new(ProcessPair::default()),
            state: Mutex::new(SupervisorState::Stopped),
            health_loop: Mutex::new(None),
            generation: AtomicU64::new(0),
            events,
        })
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SupervisorState::Running
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> SupervisorSettings {
        self.settings.read().clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.health.lock().consecutive_failures()
    }

    /// Replace the settings. Running processes keep their old arguments until
    /// the next start.
    pub fn update_settings(&self, settings: SupervisorSettings) {
        *self.health.lock() = HealthState::new(settings.health.unhealthy_threshold);
        *self.settings.write() = settings;
    }

    /// Start both processes. `Ok(true)` when running (already or now),
    /// `Ok(false)` when any step failed, `Err(Cancelled)` when `cancel` fired.
    /// Every failure path tears down what was started.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<bool, SupervisorError> {
        let mut pair = tokio::select! {
            guard = self.lifecycle.lock() => guard,
            _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
        };
        self.start_locked(&mut pair, cancel).await
    }

    /// Stop both processes. Safe to call when already stopped.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        let mut pair = tokio::select! {
            guard = self.lifecycle.lock() => guard,
            _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
        };
        self.stop_locked(&mut pair).await;
        Ok(())
    }

    /// Stop then start under a single lock hold
    pub async fn restart(&self, cancel: &CancellationToken) -> Result<bool, SupervisorError> {
        let mut pair = tokio::select! {
            guard = self.lifecycle.lock() => guard,
            _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
        };
        self.log("Restarting");
        self.stop_locked(&mut pair).await;
        self.start_locked(&mut pair, cancel).await
    }

    /// Run one provider login through the backend executable. Cancelling
    /// `cancel` after this returns still kills a pending login.
    pub async fn run_auth_command(
        &self,
        command: AuthCommand,
        cancel: &CancellationToken,
    ) -> Result<AuthSession, SupervisorError> {
        let settings = self.settings();
        require_file("backend executable", &settings.backend_executable)?;
        require_file("base config", &settings.base_config)?;

        self.log(format!("Starting {} login", command.provider()));
        let result = run_auth(
            AuthRequest {
                backend: &settings.backend_executable,
                base_config: &settings.base_config,
                working_dir: settings.working_dir.as_ref(),
                command: &command,
                settings: &settings.auth,
            },
            self.output_sink(),
            cancel,
        )
        .await;

        match &result {
            Ok(session) if session.result.ok => {
                self.log(format!("{} login: {}", command.provider(), session.result.message))
            }
            Ok(session) => self.log(format!("{} login failed: {}", command.provider(), session.result.message)),
            Err(e) => self.log(format!("{} login aborted: {}", command.provider(), e)),
        }
        result
    }

    /// Regenerate the merged config after a key-file change. The backend
    /// picks it up on its next start.
    pub fn regenerate_config(&self) -> Result<PathBuf, SupervisorError> {
        let settings = self.settings();
        match self.sync.merged_config_path(&settings.base_config, &settings.providers) {
            Ok(path) => {
                self.log(format!("Config regenerated: {}", path.display()));
                let _ = self.events.send(SupervisorEvent::ConfigChanged);
                Ok(path)
            }
            Err(e) => {
                error!(error = %e, "Config regeneration failed");
                self.log(format!("Config regeneration failed: {}", e));
                Err(SupervisorError::ConfigIo(e.to_string()))
            }
        }
    }

    /// Watch the auth directory and regenerate on key-file changes
    pub fn watch_key_files(&self, debounce: Duration) -> anyhow::Result<ConfigWatcher> {
        let weak = self.self_ref.clone();
        ConfigWatcher::spawn(self.sync.auth_dir(), self.sync.key_prefix(), debounce, move || {
            if let Some(supervisor) = weak.upgrade() {
                let _ = supervisor.regenerate_config();
            }
        })
    }

    /// One health check. Runs from the background loop; public so callers can
    /// drive it directly.
    pub async fn health_tick(&self) -> HealthTick {
        let Ok(mut pair) = self.lifecycle.try_lock() else {
            debug!("Lifecycle transition in progress, skipping health tick");
            return HealthTick::Skipped;
        };
        if self.state() != SupervisorState::Running {
            return HealthTick::NotRunning;
        }

        let settings = self.settings();
        let healthy = self.check_pair(&pair, &settings).await;

        let transition = {
            let mut health = self.health.lock();
            if healthy {
                health.record_success()
            } else {
                health.record_failure()
            }
        };

        match transition {
            HealthTransition::Healthy => HealthTick::Healthy,
            HealthTransition::Recovered { after } => {
                self.log(format!("Health check recovered after {} failure(s)", after));
                HealthTick::Recovered { after }
            }
            HealthTransition::Degraded { failures } => {
                warn!(failures, threshold = settings.health.unhealthy_threshold, "Health check failed");
                self.log(format!(
                    "Health check failed ({}/{})",
                    failures, settings.health.unhealthy_threshold
                ));
                HealthTick::Degraded { failures }
            }
            HealthTransition::RestartRequired { failures } => {
                error!(failures, "Unhealthy, restarting processes");
                self.log(format!("Unhealthy after {} failed checks, restarting", failures));
                self.stop_locked(&mut pair).await;
                let ok = self
                    .start_locked(&mut pair, &CancellationToken::new())
                    .await
                    .unwrap_or(false);
                if !ok {
                    warn!("Restart failed, supervisor is idle until the next start or reload");
                    self.log("Restart failed; idle until the next start or reload");
                }
                HealthTick::Restarted { ok }
            }
        }
    }

    async fn check_pair(&self, pair: &ProcessPair, settings: &SupervisorSettings) -> bool {
        let timeout = settings.health.connect_timeout;
        let mut healthy = true;

        for (role, handle, port) in [
            (ProcessRole::Relay, &pair.relay, settings.relay_port),
            (ProcessRole::Backend, &pair.backend, settings.backend_port),
        ] {
            let alive = handle.as_ref().map(|h| !h.has_exited()).unwrap_or(false);
            if !alive {
                warn!(role = %role, "Process is not running");
                healthy = false;
                continue;
            }
            if !self.probe.is_open(port, timeout).await {
                warn!(role = %role, port, "Port is not accepting connections");
                healthy = false;
            }
        }
        healthy
    }

    async fn start_locked(&self, pair: &mut ProcessPair, cancel: &CancellationToken) -> Result<bool, SupervisorError> {
        if self.state() == SupervisorState::Running && !pair.is_empty() {
            return Ok(true);
        }

        self.set_state(SupervisorState::Starting);
        let settings = self.settings();
        self.health.lock().reset();

        match self.launch_pair(pair, &settings, cancel).await {
            Ok(()) => {
                self.set_state(SupervisorState::Running);
                self.spawn_health_loop(settings.health.interval);
                self.log(format!(
                    "Running (relay on {}, backend on {})",
                    settings.relay_port, settings.backend_port
                ));
                let _ = self.events.send(SupervisorEvent::RunningChanged(true));
                Ok(true)
            }
            Err(e) => {
                self.teardown(pair, settings.stop_grace_period).await;
                self.set_state(SupervisorState::Stopped);
                if e.is_cancelled() {
                    self.log("Start cancelled");
                    Err(e)
                } else {
                    error!(error = %e, "Start failed");
                    self.log(format!("Start failed: {}", e));
                    Ok(false)
                }
            }
        }
    }

    async fn launch_pair(
        &self,
        pair: &mut ProcessPair,
        settings: &SupervisorSettings,
        cancel: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        require_file("backend executable", &settings.backend_executable)?;
        require_file("relay executable", &settings.relay_executable)?;
        require_file("base config", &settings.base_config)?;

        tokio::select! {
            _ = self.launcher.cleanup_orphans(&settings.orphan_process_names) => {}
            _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
        }

        let backend_config = self.sync_config(settings);
        if let Err(e) = settings.gateway.write(&settings.gateway_config) {
            warn!(error = %e, path = %settings.gateway_config.display(), "Failed to write gateway config");
            self.log(format!("Gateway config write failed: {}", e));
        }

        let relay = LaunchSpec::new(ProcessRole::Relay, &settings.relay_executable)
            .arg("--listen")
            .arg(settings.relay_port.to_string())
            .arg("--target")
            .arg(settings.backend_port.to_string())
            .arg("--config")
            .arg(settings.gateway_config.display().to_string())
            .working_dir(settings.working_dir.clone());
        self.launch_and_wait(pair, &relay, settings.relay_port, settings, cancel).await?;

        let backend = LaunchSpec::new(ProcessRole::Backend, &settings.backend_executable)
            .arg("-config")
            .arg(backend_config.display().to_string())
            .working_dir(settings.working_dir.clone());
        self.launch_and_wait(pair, &backend, settings.backend_port, settings, cancel).await?;

        // The relay may have died while the backend port was coming up
        for handle in [&pair.relay, &pair.backend].into_iter().flatten() {
            if let Some(exit) = handle.exit_status() {
                return Err(SupervisorError::ExitedDuringStart {
                    role: handle.role().to_string(),
                    code: exit.code,
                });
            }
        }

        Ok(())
    }

    /// Merged config path for the backend. A failed regeneration falls back to
    /// the last merged file, then to the base config.
    fn sync_config(&self, settings: &SupervisorSettings) -> PathBuf {
        match self.sync.merged_config_path(&settings.base_config, &settings.providers) {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Config sync failed, keeping previous config");
                self.log(format!("Config sync failed: {}", e));
                let previous = self.sync.merged_path();
                if previous.is_file() {
                    previous.to_path_buf()
                } else {
                    settings.base_config.clone()
                }
            }
        }
    }

    async fn launch_and_wait(
        &self,
        pair: &mut ProcessPair,
        spec: &LaunchSpec,
        port: u16,
        settings: &SupervisorSettings,
        cancel: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        if cancel.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }

        let handle = self.launcher.launch(spec, self.output_sink())?;
        self.log(format!("Started {} (pid {:?})", spec.role, handle.pid()));
        self.watch_exit(&handle);
        match spec.role {
            ProcessRole::Relay => pair.relay = Some(handle),
            _ => pair.backend = Some(handle),
        }

        let wait = wait_for_port(
            self.probe.as_ref(),
            port,
            settings.health.port_wait_timeout,
            settings.health.connect_timeout,
            cancel,
        )
        .await;

        match wait {
            PortWait::Ready => {
                info!(role = %spec.role, port, "Process is accepting connections");
                Ok(())
            }
            PortWait::Cancelled => Err(SupervisorError::Cancelled),
            PortWait::TimedOut => Err(SupervisorError::PortTimeout {
                role: spec.role.to_string(),
                port,
                timeout_ms: settings.health.port_wait_timeout.as_millis() as u64,
            }),
        }
    }

    async fn stop_locked(&self, pair: &mut ProcessPair) {
        self.cancel_health_loop();

        let was = self.state();
        if was == SupervisorState::Stopped && pair.is_empty() {
            return;
        }

        self.set_state(SupervisorState::Stopping);
        let grace = self.settings.read().stop_grace_period;
        self.teardown(pair, grace).await;
        self.set_state(SupervisorState::Stopped);
        self.log("Stopped");

        if was != SupervisorState::Stopped {
            let _ = self.events.send(SupervisorEvent::RunningChanged(false));
        }
    }

    /// Terminate whatever is running, backend first
    async fn teardown(&self, pair: &mut ProcessPair, grace: Duration) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(mut backend) = pair.backend.take() {
            backend.terminate(grace).await;
        }
        if let Some(mut relay) = pair.relay.take() {
            relay.terminate(grace).await;
        }
    }

    /// An exit that nobody asked for pushes the failure counter to the
    /// threshold so the next tick restarts the pair
    fn watch_exit(&self, handle: &ProcessHandle) {
        let weak = self.self_ref.clone();
        let generation = self.generation.load(Ordering::SeqCst);
        let role = handle.role();
        let mut exit_rx = handle.exit_watch();

        tokio::spawn(async move {
            let exit = match exit_rx.wait_for(|exit| exit.is_some()).await {
                Ok(exit) => *exit,
                Err(_) => None,
            };
            let Some(supervisor) = weak.upgrade() else {
                return;
            };
            if supervisor.generation.load(Ordering::SeqCst) != generation {
                return;
            }

            let code = exit.and_then(|e| e.code);
            warn!(role = %role, code = ?code, "Process exited unexpectedly");
            supervisor.log(format!("{} exited unexpectedly (code {:?})", role, code));
            supervisor.health.lock().force_threshold();
        });
    }

    fn spawn_health_loop(&self, interval: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.health_loop.lock().replace(token.clone()) {
            previous.cancel();
        }

        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let Some(supervisor) = weak.upgrade() else {
                            break;
                        };
                        supervisor.health_tick().await;
                    }
                }
            }
            debug!("Health loop stopped");
        });
    }

    fn cancel_health_loop(&self) {
        if let Some(token) = self.health_loop.lock().take() {
            token.cancel();
        }
    }

    fn set_state(&self, state: SupervisorState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(from = ?*current, to = ?state, "Supervisor state change");
            *current = state;
        }
    }

    fn output_sink(&self) -> OutputSink {
        let weak = self.self_ref.clone();
        Arc::new(move |role: ProcessRole, line: String| {
            if let Some(supervisor) = weak.upgrade() {
                supervisor.append_log(format!("{} {}", role.log_prefix(), line));
            }
        })
    }

    /// Record a lifecycle line in tracing and the log buffer
    fn log(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{}", text);
        self.append_log(text);
    }

    fn append_log(&self, text: String) {
        self.logs.push(text);
        let _ = self
            .events
            .send(SupervisorEvent::LogUpdated(self.logs.tail(LOG_EVENT_TAIL)));
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel_health_loop();
    }
}

fn require_file(what: &'static str, path: &Path) -> Result<(), SupervisorError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(SupervisorError::PrerequisiteMissing {
            what,
            path: path.to_path_buf(),
        })
    }
}
