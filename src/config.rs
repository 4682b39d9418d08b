use crate::gateway::GatewayConfig;
use crate::sync::ProviderEnablement;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Control-plane configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// File locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Ports for the relay and the backend engine
    #[serde(default)]
    pub server: ServerConfig,

    /// Process lifecycle tuning
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Key-file watching
    #[serde(default)]
    pub sync: SyncConfig,

    /// Provider on/off switches; unlisted providers are enabled
    #[serde(default)]
    pub providers: BTreeMap<String, bool>,

    /// Cloud gateway toggle and key
    #[serde(default)]
    pub gateway: GatewaySection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Directory holding OAuth tokens, key files and generated configs
    #[serde(default = "default_auth_dir")]
    pub auth_dir: PathBuf,

    /// Base YAML config for the backend (default: `<auth_dir>/config.yaml`)
    pub base_config: Option<PathBuf>,

    /// Backend engine executable (default: `<auth_dir>/cli-proxy-api`)
    pub backend_executable: Option<PathBuf>,

    /// Relay executable (default: `modelgate-relay` next to this binary)
    pub relay_executable: Option<PathBuf>,

    /// Gateway config file (default: `<auth_dir>/gateway-config.json`)
    pub gateway_config: Option<PathBuf>,

    /// Merged backend config (default: `<auth_dir>/merged-config.yaml`)
    pub merged_config: Option<PathBuf>,

    /// Working directory for both children
    pub working_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            auth_dir: default_auth_dir(),
            base_config: None,
            backend_executable: None,
            relay_executable: None,
            gateway_config: None,
            merged_config: None,
            working_dir: None,
        }
    }
}

impl PathsConfig {
    pub fn auth_dir(&self) -> PathBuf {
        expand_home(&self.auth_dir)
    }

    pub fn base_config(&self) -> PathBuf {
        self.resolve(&self.base_config, "config.yaml")
    }

    pub fn backend_executable(&self) -> PathBuf {
        self.resolve(&self.backend_executable, "cli-proxy-api")
    }

    pub fn relay_executable(&self) -> PathBuf {
        if let Some(path) = &self.relay_executable {
            return expand_home(path);
        }
        let name = format!("modelgate-relay{}", std::env::consts::EXE_SUFFIX);
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
            .unwrap_or_else(|| PathBuf::from(name))
    }

    pub fn gateway_config(&self) -> PathBuf {
        self.resolve(&self.gateway_config, "gateway-config.json")
    }

    pub fn merged_config(&self) -> PathBuf {
        self.resolve(&self.merged_config, "merged-config.yaml")
    }

    pub fn working_dir(&self) -> Option<PathBuf> {
        self.working_dir.as_deref().map(expand_home)
    }

    fn resolve(&self, configured: &Option<PathBuf>, file_name: &str) -> PathBuf {
        match configured {
            Some(path) => expand_home(path),
            None => self.auth_dir().join(file_name),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port the relay listens on (default: 8317)
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,

    /// Port the backend engine listens on (default: 8318)
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            relay_port: default_relay_port(),
            backend_port: default_backend_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,

    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    #[serde(default = "default_port_wait_timeout")]
    pub port_wait_timeout_ms: u64,

    #[serde(default = "default_port_connect_timeout")]
    pub port_connect_timeout_ms: u64,

    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_ms: u64,

    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Process names to kill before starting (default: the two executables' file names)
    #[serde(default)]
    pub orphan_process_names: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval(),
            unhealthy_threshold: default_unhealthy_threshold(),
            port_wait_timeout_ms: default_port_wait_timeout(),
            port_connect_timeout_ms: default_port_connect_timeout(),
            stop_grace_period_ms: default_stop_grace_period(),
            log_capacity: default_log_capacity(),
            orphan_process_names: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn port_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.port_wait_timeout_ms)
    }

    pub fn port_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.port_connect_timeout_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Key files are `<prefix>-*.json` in the auth directory
    #[serde(default = "default_key_file_prefix")]
    pub key_file_prefix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
            key_file_prefix: default_key_file_prefix(),
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GatewaySection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub api_key: String,
}

impl GatewaySection {
    pub fn to_gateway_config(&self) -> GatewayConfig {
        GatewayConfig::new(self.enabled, self.api_key.clone())
    }
}

// Default value functions
fn default_auth_dir() -> PathBuf {
    dirs_next::home_dir()
        .map(|home| home.join(".cli-proxy-api"))
        .unwrap_or_else(|| PathBuf::from(".cli-proxy-api"))
}

fn default_relay_port() -> u16 {
    8317
}

fn default_backend_port() -> u16 {
    8318
}

fn default_health_check_interval() -> u64 {
    30_000 // 30 seconds between health ticks
}

fn default_unhealthy_threshold() -> u32 {
    3 // 3 consecutive failed ticks before a restart
}

fn default_port_wait_timeout() -> u64 {
    5000 // 5 seconds for a port to open after launch
}

fn default_port_connect_timeout() -> u64 {
    100 // 100ms per connect attempt
}

fn default_stop_grace_period() -> u64 {
    3000 // 3 seconds between SIGTERM and SIGKILL
}

fn default_log_capacity() -> usize {
    1000
}

fn default_debounce() -> u64 {
    500 // quiet window before regenerating the merged config
}

fn default_key_file_prefix() -> String {
    "zai".to_string()
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs_next::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.relay_port == 0 {
            errors.push("server.relay_port must be non-zero".to_string());
        }
        if self.server.backend_port == 0 {
            errors.push("server.backend_port must be non-zero".to_string());
        }
        if self.server.relay_port == self.server.backend_port {
            errors.push(format!(
                "server.relay_port and server.backend_port must differ (both {})",
                self.server.relay_port
            ));
        }
        if self.supervisor.unhealthy_threshold == 0 {
            errors.push("supervisor.unhealthy_threshold must be at least 1".to_string());
        }
        if self.supervisor.log_capacity == 0 {
            errors.push("supervisor.log_capacity must be at least 1".to_string());
        }
        if self.supervisor.port_connect_timeout_ms == 0 || self.supervisor.port_wait_timeout_ms == 0 {
            errors.push("supervisor port timeouts must be non-zero".to_string());
        }
        if self.supervisor.health_check_interval_ms == 0 {
            errors.push("supervisor.health_check_interval_ms must be non-zero".to_string());
        }

        let prefix = &self.sync.key_file_prefix;
        if prefix.is_empty() || prefix.contains(['/', '\\', '*']) {
            errors.push(format!("sync.key_file_prefix is invalid: {:?}", prefix));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn provider_enablement(&self) -> ProviderEnablement {
        ProviderEnablement::from_map(self.providers.clone())
    }

    /// Orphan names from config, or the executables' file names
    pub fn orphan_process_names(&self) -> Vec<String> {
        if !self.supervisor.orphan_process_names.is_empty() {
            return self.supervisor.orphan_process_names.clone();
        }
        [self.paths.backend_executable(), self.paths.relay_executable()]
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect()
    }
}
