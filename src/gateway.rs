//! Cloud gateway toggle and credential
//!
//! The control plane writes this file; the relay polls it. The relay never
//! talks to the supervisor directly, so the file is the only channel.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Gateway settings as persisted on disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(rename = "vercelEnabled", default)]
    pub enabled: bool,
    #[serde(rename = "vercelApiKey", default)]
    pub api_key: String,
}

impl GatewayConfig {
    pub fn new(enabled: bool, api_key: impl Into<String>) -> Self {
        Self {
            enabled,
            api_key: api_key.into(),
        }
    }

    /// Enabled and carrying a non-blank key
    pub fn is_active(&self) -> bool {
        self.enabled && !self.api_key.trim().is_empty()
    }

    /// Persist to `path` atomically (temp file in the same directory, then rename)
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &data)?;
        debug!(path = %path.display(), active = self.is_active(), "Gateway config written");
        Ok(())
    }

    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Write `data` to `path` via a sibling temp file so readers never see a torn file
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| anyhow::anyhow!("Failed to persist {}: {}", path.display(), e.error))?;
    Ok(())
}

#[derive(Debug, Default)]
struct CacheState {
    last_modified: Option<SystemTime>,
    cached: GatewayConfig,
}

/// Gateway config re-read only when the file's modification time changes
#[derive(Debug)]
pub struct GatewayConfigCache {
    path: Option<PathBuf>,
    state: Mutex<CacheState>,
}

impl GatewayConfigCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// A cache with no backing file; always inactive
    pub fn disabled() -> Self {
        Self {
            path: None,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current config. Any stat, read or parse failure keeps the last good value.
    pub fn load(&self) -> GatewayConfig {
        let mut state = self.state.lock();
        let Some(path) = self.path.as_deref() else {
            return state.cached.clone();
        };

        let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return state.cached.clone(),
        };

        if state.last_modified == Some(modified) {
            return state.cached.clone();
        }

        match GatewayConfig::read(path) {
            Ok(config) => {
                debug!(path = %path.display(), active = config.is_active(), "Gateway config reloaded");
                state.last_modified = Some(modified);
                state.cached = config;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable gateway config");
            }
        }
        state.cached.clone()
    }
}
