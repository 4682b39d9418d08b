//! Provider login flows
//!
//! Each login runs the backend executable once with a provider flag. The
//! backend opens a browser and then waits for the OAuth callback, so the call
//! reports success as soon as the flow is visibly under way. The returned
//! session keeps the subprocess, its scheduled input and its hard timeout
//! alive until the caller awaits it.

use crate::error::SupervisorError;
use crate::process::{forward_lines, new_session, OutputSink, ProcessRole};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Output fragments that mean the browser step has started
pub const SUCCESS_MARKERS: &[&str] = &[
    "opening browser",
    "open the following url",
    "please visit",
    "browser opened",
    "waiting for authentication",
];

/// Phrase on the line that carries a device code
const DEVICE_CODE_PHRASE: &str = "enter the code";

/// A login to run through the backend executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthCommand {
    ClaudeLogin,
    CodexLogin,
    GeminiLogin,
    QwenLogin { email: String },
    AntigravityLogin,
    CopilotLogin,
}

impl AuthCommand {
    /// Parse a provider name as used on the command line
    pub fn parse(provider: &str, param: Option<&str>) -> anyhow::Result<Self> {
        match provider.to_ascii_lowercase().as_str() {
            "claude" => Ok(AuthCommand::ClaudeLogin),
            "codex" => Ok(AuthCommand::CodexLogin),
            "gemini" => Ok(AuthCommand::GeminiLogin),
            "qwen" => {
                let email = param
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("qwen login requires an email address"))?;
                Ok(AuthCommand::QwenLogin {
                    email: email.to_string(),
                })
            }
            "antigravity" => Ok(AuthCommand::AntigravityLogin),
            "copilot" | "github-copilot" => Ok(AuthCommand::CopilotLogin),
            other => anyhow::bail!("unknown auth provider: {}", other),
        }
    }

    /// Backend flag that selects the login flow
    pub fn flag(&self) -> &'static str {
        match self {
            AuthCommand::ClaudeLogin => "-claude-login",
            AuthCommand::CodexLogin => "-codex-login",
            AuthCommand::GeminiLogin => "-login",
            AuthCommand::QwenLogin { .. } => "-qwen-login",
            AuthCommand::AntigravityLogin => "-antigravity-login",
            AuthCommand::CopilotLogin => "-github-copilot-login",
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            AuthCommand::ClaudeLogin => "claude",
            AuthCommand::CodexLogin => "codex",
            AuthCommand::GeminiLogin => "gemini",
            AuthCommand::QwenLogin { .. } => "qwen",
            AuthCommand::AntigravityLogin => "antigravity",
            AuthCommand::CopilotLogin => "github-copilot",
        }
    }

    /// Text to type into the login prompt and when the prompt shows up
    pub fn scheduled_input(&self) -> Option<(Duration, String)> {
        match self {
            // Project selection prompt; blank accepts the default
            AuthCommand::GeminiLogin => Some((Duration::from_secs(3), "\n".to_string())),
            AuthCommand::CodexLogin => Some((Duration::from_secs(12), "\n".to_string())),
            AuthCommand::QwenLogin { email } => Some((Duration::from_secs(10), format!("{}\n", email))),
            _ => None,
        }
    }

    pub fn args(&self, base_config: &Path) -> Vec<String> {
        vec![
            self.flag().to_string(),
            "-config".to_string(),
            base_config.display().to_string(),
        ]
    }
}

/// Outcome reported to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthResult {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_code: Option<String>,
}

impl AuthResult {
    fn success(message: impl Into<String>, device_code: Option<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            device_code,
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            device_code: None,
        }
    }
}

/// Timing for a login subprocess
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// How long to watch for an early exit before answering
    pub early_exit_wait: Duration,
    /// Kill the subprocess if the browser flow is still open after this long
    pub hard_timeout: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            early_exit_wait: Duration::from_secs(2),
            hard_timeout: Duration::from_secs(300),
        }
    }
}

/// Whether captured output shows the browser step has begun
pub fn has_success_marker(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    SUCCESS_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Pull an `XXXX-XXXX` code off the line that asks the user to enter it
pub fn extract_device_code(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.to_ascii_lowercase().contains(DEVICE_CODE_PHRASE))
        .filter_map(|line| {
            line.split_whitespace()
                .map(|token| token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-'))
                .filter(|token| is_device_code(token))
                .last()
                .map(String::from)
        })
        .last()
}

fn is_device_code(token: &str) -> bool {
    let Some((left, right)) = token.split_once('-') else {
        return false;
    };
    left.len() == 4
        && right.len() == 4
        && left.chars().all(|c| c.is_ascii_alphanumeric())
        && right.chars().all(|c| c.is_ascii_alphanumeric())
}

/// A login that has answered its caller. The subprocess may still be
/// waiting on the browser, with scheduled input not yet written.
#[derive(Debug)]
pub struct AuthSession {
    pub result: AuthResult,
    pending: Option<JoinHandle<()>>,
}

impl AuthSession {
    fn finished(result: AuthResult) -> Self {
        Self { result, pending: None }
    }

    /// Whether the subprocess outlived the call
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Wait until the subprocess exits, is killed at the hard timeout, or the
    /// login's cancellation token fires
    pub async fn finish(self) {
        if let Some(pending) = self.pending {
            let _ = pending.await;
        }
    }
}

/// Everything needed to run one login
pub struct AuthRequest<'a> {
    pub backend: &'a Path,
    pub base_config: &'a Path,
    pub working_dir: Option<&'a PathBuf>,
    pub command: &'a AuthCommand,
    pub settings: &'a AuthSettings,
}

/// Run a login subprocess and report once the outcome is known
pub async fn run_auth(
    request: AuthRequest<'_>,
    output: OutputSink,
    cancel: &CancellationToken,
) -> Result<AuthSession, SupervisorError> {
    let command = request.command;
    info!(provider = command.provider(), flag = command.flag(), "Starting login flow");

    let mut cmd = Command::new(request.backend);
    cmd.args(command.args(request.base_config));
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    if let Some(dir) = request.working_dir {
        cmd.current_dir(dir);
    }
    new_session(&mut cmd);

    let mut child = cmd.spawn().map_err(|e| SupervisorError::ProcessLaunch {
        role: ProcessRole::Auth.to_string(),
        message: e.to_string(),
    })?;

    let captured = Arc::new(Mutex::new(String::new()));
    let line_seen = Arc::new(Notify::new());
    let sink: OutputSink = {
        let captured = Arc::clone(&captured);
        let line_seen = Arc::clone(&line_seen);
        Arc::new(move |role, line: String| {
            {
                let mut buf = captured.lock();
                buf.push_str(&line);
                buf.push('\n');
            }
            output(role, line);
            line_seen.notify_one();
        })
    };

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward_lines(stdout, ProcessRole::Auth, Arc::clone(&sink)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward_lines(stderr, ProcessRole::Auth, Arc::clone(&sink)));
    }

    let input_cancel = cancel.child_token();
    let feeder = child
        .stdin
        .take()
        .map(|stdin| tokio::spawn(feed_stdin(stdin, command.scheduled_input(), input_cancel.clone())));

    let is_copilot = matches!(command, AuthCommand::CopilotLogin);
    let deadline = tokio::time::sleep(request.settings.early_exit_wait);
    tokio::pin!(deadline);

    let exit = loop {
        tokio::select! {
            status = child.wait() => break Some(status),
            _ = line_seen.notified() => {
                let text = captured.lock().clone();
                if has_success_marker(&text) || (is_copilot && extract_device_code(&text).is_some()) {
                    break None;
                }
            }
            _ = &mut deadline => break None,
            _ = cancel.cancelled() => {
                kill_child(&mut child).await;
                input_cancel.cancel();
                info!(provider = command.provider(), "Login cancelled");
                return Err(SupervisorError::Cancelled);
            }
        }
    };

    let session = match exit {
        Some(status) => {
            // Let the readers drain what the process printed before exiting
            for reader in readers {
                let _ = tokio::time::timeout(Duration::from_millis(500), reader).await;
            }
            input_cancel.cancel();

            let text = captured.lock().clone();
            let device_code = extract_device_code(&text);
            let result = match status {
                Ok(status) if status.success() => AuthResult::success(
                    format!("{} login completed", command.provider()),
                    device_code,
                ),
                _ if has_success_marker(&text) => AuthResult::success(
                    format!("{} login started in browser", command.provider()),
                    device_code,
                ),
                Ok(status) => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        AuthResult::failure(format!("login exited with {}", status))
                    } else {
                        AuthResult::failure(trimmed.to_string())
                    }
                }
                Err(e) => AuthResult::failure(format!("failed to wait for login: {}", e)),
            };
            AuthSession::finished(result)
        }
        None => {
            let device_code = extract_device_code(&captured.lock());
            let message = match &device_code {
                Some(code) => format!("Enter code {} in the browser to finish {} login", code, command.provider()),
                None => format!("Complete the {} login in your browser", command.provider()),
            };

            let hard_timeout = request.settings.hard_timeout;
            let provider = command.provider();
            let pending = tokio::spawn(async move {
                finish_in_background(child, provider, hard_timeout, &input_cancel).await;
                input_cancel.cancel();
                if let Some(feeder) = feeder {
                    let _ = feeder.await;
                }
            });

            AuthSession {
                result: AuthResult::success(message, device_code),
                pending: Some(pending),
            }
        }
    };

    let result = &session.result;
    if result.ok {
        info!(provider = command.provider(), device_code = ?result.device_code, "Login flow started");
    } else {
        warn!(provider = command.provider(), message = %result.message, "Login failed");
    }
    Ok(session)
}

/// Hold stdin open and write the scheduled input when its delay elapses
async fn feed_stdin(mut stdin: ChildStdin, input: Option<(Duration, String)>, cancel: CancellationToken) {
    if let Some((delay, text)) = input {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                if let Err(e) = stdin.write_all(text.as_bytes()).await {
                    debug!(error = %e, "Failed to write login input");
                } else {
                    let _ = stdin.flush().await;
                    debug!(delay_ms = delay.as_millis() as u64, "Wrote scheduled login input");
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
    cancel.cancelled().await;
}

async fn finish_in_background(
    mut child: Child,
    provider: &'static str,
    hard_timeout: Duration,
    cancel: &CancellationToken,
) {
    tokio::select! {
        finished = tokio::time::timeout(hard_timeout, child.wait()) => match finished {
            Ok(Ok(status)) => info!(provider, %status, "Login subprocess finished"),
            Ok(Err(e)) => warn!(provider, error = %e, "Error waiting for login subprocess"),
            Err(_) => {
                warn!(provider, timeout_secs = hard_timeout.as_secs(), "Login timed out, killing subprocess");
                kill_child(&mut child).await;
            }
        },
        _ = cancel.cancelled() => {
            info!(provider, "Login cancelled, killing subprocess");
            kill_child(&mut child).await;
        }
    }
}

async fn kill_child(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            crate::process::signal_group(pid, crate::process::ProcessSignal::Kill);
        }
    }
    let _ = child.kill().await;
}
