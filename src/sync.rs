//! Config synchronizer
//!
//! The backend engine reads one YAML file. That file is the user's base config
//! with a generated overlay appended: an exclusion block for OAuth providers the
//! user turned off, and an OpenAI-compatible provider block built from the API
//! key files found in the auth directory.
//!
//! The merge is plain text concatenation. The base document is never parsed.

use crate::gateway::write_atomic;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// OAuth providers the backend can be told to ignore
pub const OAUTH_PROVIDERS: &[&str] = &["antigravity", "claude", "codex", "gemini", "github-copilot", "qwen"];

/// Default key-file prefix (`zai-*.json`)
pub const DEFAULT_KEY_FILE_PREFIX: &str = "zai";
/// Default quiet window before a regeneration
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

const OVERLAY_MARKER: &str = "# --- generated by modelgate ---";
const COMPAT_BASE_URL: &str = "https://api.z.ai/api/coding/paas/v4";
const COMPAT_MODELS: &[(&str, &str)] = &[("glm-4.6", "glm-4.6")];

/// Per-provider on/off switches. Names compare case-insensitively and a
/// provider that was never mentioned counts as enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderEnablement {
    providers: BTreeMap<String, bool>,
}

impl ProviderEnablement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(providers: BTreeMap<String, bool>) -> Self {
        let mut enablement = Self::new();
        for (name, enabled) in providers {
            enablement.set(&name, enabled);
        }
        enablement
    }

    pub fn set(&mut self, provider: &str, enabled: bool) {
        self.providers.insert(provider.to_ascii_lowercase(), enabled);
    }

    pub fn is_enabled(&self, provider: &str) -> bool {
        self.providers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(provider))
            .map(|(_, enabled)| *enabled)
            .unwrap_or(true)
    }

    /// Known OAuth providers switched off, in alphabetical order
    pub fn disabled_oauth_providers(&self) -> Vec<&'static str> {
        let mut disabled: Vec<&'static str> = OAUTH_PROVIDERS
            .iter()
            .copied()
            .filter(|p| !self.is_enabled(p))
            .collect();
        disabled.sort_unstable();
        disabled
    }
}

/// One API key read from a key file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    pub api_key: String,
    pub file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct KeyFile {
    api_key: String,
}

/// Whether `path` names a `<prefix>-*.json` key file
pub fn is_key_file(path: &Path, prefix: &str) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.len() > prefix.len() + "-.json".len()
        && name.starts_with(prefix)
        && name[prefix.len()..].starts_with('-')
        && name.ends_with(".json")
}

/// Read every key file in `dir`, sorted by file name. Unreadable or malformed
/// files and blank keys are skipped.
pub fn scan_key_files(dir: &Path, prefix: &str) -> Vec<ApiKeyRecord> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Key directory not readable");
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_key_file(path, prefix))
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let mut records = Vec::with_capacity(files.len());
    for file in files {
        let parsed = std::fs::read(&file)
            .map_err(anyhow::Error::from)
            .and_then(|data| serde_json::from_slice::<KeyFile>(&data).map_err(anyhow::Error::from));

        match parsed {
            Ok(key) if !key.api_key.trim().is_empty() => records.push(ApiKeyRecord {
                api_key: key.api_key,
                file,
            }),
            Ok(_) => debug!(file = %file.display(), "Skipping key file with blank key"),
            Err(e) => warn!(file = %file.display(), error = %e, "Skipping malformed key file"),
        }
    }
    records
}

/// Escape a value for a double-quoted YAML scalar
pub fn escape_yaml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Overlay text appended to the base config. Empty when there is nothing to add.
pub fn build_overlay(excluded: &[&str], compat_name: &str, keys: &[ApiKeyRecord]) -> String {
    if excluded.is_empty() && keys.is_empty() {
        return String::new();
    }

    let mut overlay = format!("\n{}\n", OVERLAY_MARKER);

    if !excluded.is_empty() {
        overlay.push_str("oauth-excluded-models:\n");
        for provider in excluded {
            let _ = writeln!(overlay, "  {}:", provider);
            overlay.push_str("    - \"*\"\n");
        }
    }

    if !keys.is_empty() {
        overlay.push_str("openai-compatibility:\n");
        let _ = writeln!(overlay, "  - name: \"{}\"", escape_yaml(compat_name));
        let _ = writeln!(overlay, "    base-url: \"{}\"", COMPAT_BASE_URL);
        overlay.push_str("    api-key-entries:\n");
        for key in keys {
            let _ = writeln!(overlay, "      - api-key: \"{}\"", escape_yaml(&key.api_key));
        }
        overlay.push_str("    models:\n");
        for (name, alias) in COMPAT_MODELS {
            let _ = writeln!(overlay, "      - name: \"{}\"", name);
            let _ = writeln!(overlay, "        alias: \"{}\"", alias);
        }
    }

    overlay
}

/// Produces the config file handed to the backend engine
#[derive(Debug, Clone)]
pub struct ConfigSynchronizer {
    auth_dir: PathBuf,
    merged_path: PathBuf,
    key_prefix: String,
}

impl ConfigSynchronizer {
    pub fn new(auth_dir: impl Into<PathBuf>, merged_path: impl Into<PathBuf>, key_prefix: impl Into<String>) -> Self {
        Self {
            auth_dir: auth_dir.into(),
            merged_path: merged_path.into(),
            key_prefix: key_prefix.into(),
        }
    }

    pub fn auth_dir(&self) -> &Path {
        &self.auth_dir
    }

    pub fn merged_path(&self) -> &Path {
        &self.merged_path
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Path the backend should load. Returns `base` itself when no overlay is
    /// needed; otherwise writes base plus overlay to the merged path. On error
    /// the previous merged file is left as it was.
    pub fn merged_config_path(&self, base: &Path, enablement: &ProviderEnablement) -> anyhow::Result<PathBuf> {
        let excluded = enablement.disabled_oauth_providers();
        let keys = if enablement.is_enabled(&self.key_prefix) {
            scan_key_files(&self.auth_dir, &self.key_prefix)
        } else {
            Vec::new()
        };

        let overlay = build_overlay(&excluded, &self.key_prefix, &keys);
        if overlay.is_empty() {
            debug!(base = %base.display(), "No overlay needed, using base config");
            return Ok(base.to_path_buf());
        }

        let base_text = std::fs::read_to_string(base)
            .map_err(|e| anyhow::anyhow!("Failed to read base config {}: {}", base.display(), e))?;

        let mut merged = base_text;
        merged.push_str(&overlay);
        write_atomic(&self.merged_path, merged.as_bytes())?;

        info!(
            path = %self.merged_path.display(),
            excluded = excluded.len(),
            keys = keys.len(),
            "Merged config written"
        );
        Ok(self.merged_path.clone())
    }
}

/// Single-slot timer: every trigger cancels the pending run and schedules a
/// new one after the quiet window.
pub struct Debouncer {
    delay: Duration,
    action: Arc<dyn Fn() + Send + Sync>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration, action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            delay,
            action: Arc::new(action),
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Must be called from within a tokio runtime
    pub fn trigger(&self) {
        let mut slot = self.pending.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let action = Arc::clone(&self.action);
        let delay = self.delay;
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action();
        }));
    }

    pub fn cancel(&self) {
        if let Some(pending) = self.pending.lock().take() {
            pending.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Watches the auth directory for key-file changes and runs a debounced
/// callback. Dropping the watcher stops it.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    pub fn spawn(
        dir: &Path,
        prefix: &str,
        debounce: Duration,
        on_change: impl Fn() + Send + Sync + 'static,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => warn!(error = %e, "Key directory watch error"),
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        info!(dir = %dir.display(), prefix, debounce_ms = debounce.as_millis() as u64, "Key file watcher started");

        let prefix = prefix.to_string();
        let debouncer = Debouncer::new(debounce, on_change);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if is_relevant(&event, &prefix) {
                    debug!(paths = ?event.paths, kind = ?event.kind, "Key file changed");
                    debouncer.trigger();
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn is_relevant(event: &Event, prefix: &str) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    ) && event.paths.iter().any(|p| is_key_file(p, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn write_key(dir: &Path, name: &str, key: &str) {
        let body = serde_json::json!({ "api_key": key, "type": "zai" });
        std::fs::write(dir.join(name), serde_json::to_vec(&body).unwrap()).unwrap();
    }

    fn setup() -> (TempDir, PathBuf, ConfigSynchronizer) {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("config.yaml");
        std::fs::write(&base, "port: 8318\n").unwrap();
        let sync = ConfigSynchronizer::new(dir.path(), dir.path().join("merged-config.yaml"), "zai");
        (dir, base, sync)
    }

    #[test]
    fn test_enablement_defaults_and_case() {
        let mut enablement = ProviderEnablement::new();
        assert!(enablement.is_enabled("claude"));

        enablement.set("Gemini", false);
        assert!(!enablement.is_enabled("gemini"));
        assert!(!enablement.is_enabled("GEMINI"));
        assert_eq!(enablement.disabled_oauth_providers(), vec!["gemini"]);
    }

    #[test]
    fn test_disabled_providers_sorted() {
        let mut map = BTreeMap::new();
        map.insert("qwen".to_string(), false);
        map.insert("Claude".to_string(), false);
        map.insert("codex".to_string(), true);
        map.insert("antigravity".to_string(), false);
        let enablement = ProviderEnablement::from_map(map);
        assert_eq!(enablement.disabled_oauth_providers(), vec!["antigravity", "claude", "qwen"]);
    }

    #[test]
    fn test_is_key_file() {
        assert!(is_key_file(Path::new("/a/zai-main.json"), "zai"));
        assert!(!is_key_file(Path::new("/a/zai.json"), "zai"));
        assert!(!is_key_file(Path::new("/a/zai-.json"), "zai"));
        assert!(!is_key_file(Path::new("/a/zaiother-x.json"), "zai"));
        assert!(!is_key_file(Path::new("/a/zai-main.yaml"), "zai"));
        assert!(!is_key_file(Path::new("/a/claude-x.json"), "zai"));
    }

    #[test]
    fn test_escape_yaml() {
        assert_eq!(escape_yaml("plain"), "plain");
        assert_eq!(escape_yaml("a\"b"), "a\\\"b");
        assert_eq!(escape_yaml("a\\b"), "a\\\\b");
        assert_eq!(escape_yaml("a\nb\tc"), "a\\nb\\tc");
    }

    #[test]
    fn test_no_overlay_returns_base() {
        let (_dir, base, sync) = setup();
        let path = sync.merged_config_path(&base, &ProviderEnablement::new()).unwrap();
        assert_eq!(path, base);
        assert!(!sync.merged_path().exists());
    }

    #[test]
    fn test_exclusions_only() {
        let (_dir, base, sync) = setup();
        let mut enablement = ProviderEnablement::new();
        enablement.set("qwen", false);
        enablement.set("claude", false);

        let path = sync.merged_config_path(&base, &enablement).unwrap();
        assert_eq!(path, sync.merged_path());

        let merged = std::fs::read_to_string(&path).unwrap();
        assert!(merged.starts_with("port: 8318\n"));
        let claude = merged.find("  claude:").unwrap();
        let qwen = merged.find("  qwen:").unwrap();
        assert!(claude < qwen);
        assert!(merged.contains("oauth-excluded-models:\n  claude:\n    - \"*\"\n"));
        assert!(!merged.contains("openai-compatibility"));
    }

    #[test]
    fn test_keys_sorted_and_escaped() {
        let (dir, base, sync) = setup();
        write_key(dir.path(), "zai-b.json", "key\"two");
        write_key(dir.path(), "zai-a.json", "key-one");
        std::fs::write(dir.path().join("zai-broken.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("zai-nokey.json"), b"{\"other\": 1}").unwrap();

        let keys = scan_key_files(dir.path(), "zai");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].api_key, "key-one");
        assert_eq!(keys[1].api_key, "key\"two");

        let path = sync.merged_config_path(&base, &ProviderEnablement::new()).unwrap();
        let merged = std::fs::read_to_string(path).unwrap();
        let first = merged.find("- api-key: \"key-one\"").unwrap();
        let second = merged.find("- api-key: \"key\\\"two\"").unwrap();
        assert!(first < second);
        assert!(merged.contains("  - name: \"zai\"\n"));
        assert!(merged.contains(COMPAT_BASE_URL));
        assert!(merged.contains("      - name: \"glm-4.6\"\n        alias: \"glm-4.6\"\n"));
    }

    #[test]
    fn test_disabled_compat_provider_skips_keys() {
        let (dir, base, sync) = setup();
        write_key(dir.path(), "zai-a.json", "key-one");
        let mut enablement = ProviderEnablement::new();
        enablement.set("zai", false);

        let path = sync.merged_config_path(&base, &enablement).unwrap();
        assert_eq!(path, base);
    }

    #[test]
    fn test_failed_regeneration_keeps_previous_file() {
        let (dir, base, sync) = setup();
        write_key(dir.path(), "zai-a.json", "key-one");
        sync.merged_config_path(&base, &ProviderEnablement::new()).unwrap();
        let before = std::fs::read_to_string(sync.merged_path()).unwrap();

        std::fs::remove_file(&base).unwrap();
        assert!(sync.merged_config_path(&base, &ProviderEnablement::new()).is_err());

        let after = std::fs::read_to_string(sync.merged_path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_overlay_is_deterministic() {
        let keys = vec![ApiKeyRecord {
            api_key: "k".to_string(),
            file: PathBuf::from("zai-a.json"),
        }];
        let a = build_overlay(&["claude", "gemini"], "zai", &keys);
        let b = build_overlay(&["claude", "gemini"], "zai", &keys);
        assert_eq!(a, b);
        assert!(build_overlay(&[], "zai", &[]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_collapses_burst() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let debouncer = Debouncer::new(Duration::from_millis(500), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            debouncer.trigger();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(debouncer.is_pending());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_separate_windows() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let debouncer = Debouncer::new(Duration::from_millis(500), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(600)).await;
        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_cancel() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let debouncer = Debouncer::new(Duration::from_millis(500), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        debouncer.trigger();
        debouncer.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    fn counting_watcher(dir: &Path) -> (ConfigWatcher, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let watcher = ConfigWatcher::spawn(dir, "zai", Duration::from_millis(300), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        (watcher, count)
    }

    #[tokio::test]
    async fn test_watcher_collapses_key_file_burst() {
        let dir = TempDir::new().unwrap();
        let (_watcher, count) = counting_watcher(dir.path());
        tokio::time::sleep(Duration::from_millis(100)).await;

        write_key(dir.path(), "zai-a.json", "k1");
        write_key(dir.path(), "zai-b.json", "k2");
        std::fs::write(dir.path().join("other.json"), b"{}").unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watcher_ignores_other_files() {
        let dir = TempDir::new().unwrap();
        let (_watcher, count) = counting_watcher(dir.path());
        tokio::time::sleep(Duration::from_millis(100)).await;

        std::fs::write(dir.path().join("other.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("config.yaml"), b"port: 1\n").unwrap();
        std::fs::write(dir.path().join("zai-notes.txt"), b"x").unwrap();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
