//! Child process management
//!
//! Every supervised process runs in its own session so the whole tree can be
//! signalled at once. A background task owns the `Child`, publishes its exit
//! on a watch channel and applies signals requested through the handle.

use crate::error::SupervisorError;
use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to wait for a process to disappear after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Which of the two supervised processes this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Relay,
    Backend,
    Auth,
}

impl ProcessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::Relay => "relay",
            ProcessRole::Backend => "backend",
            ProcessRole::Auth => "auth",
        }
    }

    /// Prefix for lines copied into the log buffer
    pub fn log_prefix(&self) -> String {
        format!("[{}]", self.as_str())
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives each line a child writes to stdout or stderr
pub type OutputSink = Arc<dyn Fn(ProcessRole, String) + Send + Sync>;

/// What to run
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub role: ProcessRole,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(role: ProcessRole, program: impl Into<PathBuf>) -> Self {
        Self {
            role,
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was killed by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Signals a handle can ask its owner task to deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Terminate,
    Kill,
}

/// Handle to a running child
pub struct ProcessHandle {
    role: ProcessRole,
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    signal_tx: mpsc::UnboundedSender<ProcessSignal>,
}

/// The owner side of a [`ProcessHandle`]: publishes the exit and receives
/// signal requests
pub struct ProcessControl {
    pub exit_tx: watch::Sender<Option<ProcessExit>>,
    pub signal_rx: mpsc::UnboundedReceiver<ProcessSignal>,
}

impl ProcessHandle {
    pub fn new(role: ProcessRole, pid: Option<u32>) -> (Self, ProcessControl) {
        let (exit_tx, exit_rx) = watch::channel(None);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        (
            Self {
                role,
                pid,
                exit_rx,
                signal_tx,
            },
            ProcessControl { exit_tx, signal_rx },
        )
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// A receiver that resolves when the process ends
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// Wait for exit. Returns `None` on timeout.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Option<ProcessExit> {
        let waited = tokio::time::timeout(timeout, self.exit_rx.wait_for(|exit| exit.is_some())).await;
        match waited {
            Ok(Ok(exit)) => *exit,
            // Owner task gone without publishing; nothing left to wait for
            Ok(Err(_)) => Some(ProcessExit { code: None }),
            Err(_) => None,
        }
    }

    pub fn signal(&self, signal: ProcessSignal) {
        let _ = self.signal_tx.send(signal);
    }

    /// SIGTERM the process tree, then SIGKILL if it outlives `grace`
    pub async fn terminate(&mut self, grace: Duration) {
        if self.has_exited() {
            return;
        }

        info!(role = %self.role, pid = ?self.pid, "Sending SIGTERM to process group");
        self.signal(ProcessSignal::Terminate);

        match self.wait_timeout(grace).await {
            Some(exit) => {
                info!(role = %self.role, code = ?exit.code, "Process exited gracefully");
            }
            None => {
                warn!(
                    role = %self.role,
                    grace_period_ms = grace.as_millis() as u64,
                    "Grace period exceeded, sending SIGKILL"
                );
                self.signal(ProcessSignal::Kill);
                if self.wait_timeout(KILL_WAIT).await.is_none() {
                    warn!(role = %self.role, pid = ?self.pid, "Process did not exit after SIGKILL");
                }
            }
        }
    }
}

/// Starts supervised processes
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec, output: OutputSink) -> Result<ProcessHandle, SupervisorError>;

    /// Best-effort kill of leftovers from an earlier crashed session
    fn cleanup_orphans<'a>(&'a self, names: &'a [String]) -> BoxFuture<'a, ()>;
}

/// Launcher that spawns real OS processes
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessLauncher;

impl ProcessLauncher for OsProcessLauncher {
    fn launch(&self, spec: &LaunchSpec, output: OutputSink) -> Result<ProcessHandle, SupervisorError> {
        info!(role = %spec.role, program = %spec.program.display(), args = ?spec.args, "Starting process");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        new_session(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| SupervisorError::ProcessLaunch {
            role: spec.role.to_string(),
            message: e.to_string(),
        })?;

        let pid = child.id();
        info!(role = %spec.role, pid = ?pid, "Process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, spec.role, Arc::clone(&output));
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, spec.role, output);
        }

        let (handle, control) = ProcessHandle::new(spec.role, pid);
        tokio::spawn(own_child(child, spec.role, control));
        Ok(handle)
    }

    fn cleanup_orphans<'a>(&'a self, names: &'a [String]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for name in names {
                kill_by_name(name).await;
            }
        })
    }
}

/// Put the child in its own session so its descendants share one process group
pub fn new_session(cmd: &mut Command) {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

/// Copy each line of `reader` to `output`. The task ends at EOF.
pub fn forward_lines<R>(reader: R, role: ProcessRole, output: OutputSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => output(role, line),
                Ok(None) => break,
                Err(e) => {
                    debug!(role = %role, error = %e, "Output stream closed with error");
                    break;
                }
            }
        }
    })
}

/// Own `child` until it exits, delivering signals requested through the handle
async fn own_child(mut child: Child, role: ProcessRole, mut control: ProcessControl) {
    let pid = child.id();
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = control.signal_rx.recv() => deliver_signal(&mut child, pid, signal),
        }
    };

    let exit = match status {
        Ok(status) => ProcessExit { code: status.code() },
        Err(e) => {
            warn!(role = %role, error = %e, "Error waiting for process");
            ProcessExit { code: None }
        }
    };
    debug!(role = %role, pid = ?pid, code = ?exit.code, "Process exited");
    let _ = control.exit_tx.send(Some(exit));
}

fn deliver_signal(child: &mut Child, pid: Option<u32>, signal: ProcessSignal) {
    #[cfg(unix)]
    {
        let _ = child;
        if let Some(pid) = pid {
            signal_group(pid, signal);
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(pid) = pid {
            kill_tree(pid);
        }
        let _ = signal;
        let _ = child.start_kill();
    }
}

/// Signal the process group led by `pid`, falling back to the process itself
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: ProcessSignal) {
    let sig = match signal {
        ProcessSignal::Terminate => libc::SIGTERM,
        ProcessSignal::Kill => libc::SIGKILL,
    };
    let pid = pid as i32;
    unsafe {
        if libc::kill(-pid, sig) != 0 {
            libc::kill(pid, sig);
        }
    }
}

#[cfg(not(unix))]
fn kill_tree(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

/// Kill processes whose executable name is exactly `name`
async fn kill_by_name(name: &str) {
    #[cfg(unix)]
    let result = Command::new("pkill")
        .arg("-x")
        .arg(name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    #[cfg(not(unix))]
    let result = Command::new("taskkill")
        .args(["/F", "/T", "/IM", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match result {
        // pkill exits 1 when nothing matched
        Ok(status) if status.success() => info!(name, "Killed orphaned process"),
        Ok(_) => debug!(name, "No orphaned process found"),
        Err(e) => debug!(name, error = %e, "Orphan cleanup unavailable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn collecting_sink() -> (OutputSink, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&lines);
        let sink: OutputSink = Arc::new(move |role, line| {
            captured.lock().push(format!("{} {}", role.log_prefix(), line));
        });
        (sink, lines)
    }

    #[test]
    fn test_role_display() {
        assert_eq!(ProcessRole::Relay.to_string(), "relay");
        assert_eq!(ProcessRole::Backend.log_prefix(), "[backend]");
    }

    #[test]
    fn test_launch_spec_builder() {
        let spec = LaunchSpec::new(ProcessRole::Relay, "/bin/relay")
            .arg("--listen")
            .arg("8317")
            .working_dir(Some(PathBuf::from("/tmp")));
        assert_eq!(spec.args, vec!["--listen", "8317"]);
        assert_eq!(spec.working_dir, Some(PathBuf::from("/tmp")));
    }

    #[tokio::test]
    async fn test_handle_observes_exit() {
        let (mut handle, control) = ProcessHandle::new(ProcessRole::Backend, Some(42));
        assert!(!handle.has_exited());

        control.exit_tx.send(Some(ProcessExit { code: Some(3) })).unwrap();
        let exit = handle.wait_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_terminate_sends_term_then_kill() {
        let (mut handle, mut control) = ProcessHandle::new(ProcessRole::Relay, Some(7));

        let owner = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(signal) = control.signal_rx.recv().await {
                seen.push(signal);
                if signal == ProcessSignal::Kill {
                    let _ = control.exit_tx.send(Some(ProcessExit { code: None }));
                    break;
                }
            }
            seen
        });

        handle.terminate(Duration::from_millis(50)).await;
        assert!(handle.has_exited());
        assert_eq!(
            owner.await.unwrap(),
            vec![ProcessSignal::Terminate, ProcessSignal::Kill]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_os_launcher_captures_output_and_exit() {
        let (sink, lines) = collecting_sink();
        let spec = LaunchSpec::new(ProcessRole::Backend, "/bin/sh")
            .arg("-c")
            .arg("echo ready; echo oops 1>&2; exit 4");

        let mut handle = OsProcessLauncher.launch(&spec, sink).unwrap();
        let exit = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit.code, Some(4));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let lines = lines.lock().clone();
        assert!(lines.contains(&"[backend] ready".to_string()));
        assert!(lines.contains(&"[backend] oops".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_os_launcher_terminates_process_tree() {
        let (sink, _lines) = collecting_sink();
        let spec = LaunchSpec::new(ProcessRole::Relay, "/bin/sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30");

        let mut handle = OsProcessLauncher.launch(&spec, sink).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.has_exited());

        handle.terminate(Duration::from_secs(2)).await;
        assert!(handle.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_orphan_cleanup_ignores_name_in_arguments() {
        let dir = tempfile::TempDir::new().unwrap();
        let mention = dir.path().join("mg-orphan-name").join("notes.txt");
        let mut bystander = Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30; true")
            .arg(mention.display().to_string())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        OsProcessLauncher
            .cleanup_orphans(&["mg-orphan-name".to_string()])
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(bystander.try_wait().unwrap().is_none());
        let _ = bystander.kill().await;
    }

    #[tokio::test]
    async fn test_launch_missing_program_fails() {
        let (sink, _lines) = collecting_sink();
        let spec = LaunchSpec::new(ProcessRole::Backend, "/nonexistent/backend-binary");
        let result = OsProcessLauncher.launch(&spec, sink);
        assert!(matches!(result, Err(SupervisorError::ProcessLaunch { .. })));
    }
}
