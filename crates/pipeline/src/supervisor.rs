//! Child process supervision
//!
//! Every child is spawned as the leader of its own process group, so a
//! terminate signals the whole subtree the tool may have forked. Lifecycle
//! events (structured messages, exit) are forwarded by a monitor task and
//! awaited through [`ProcessEvents`].

use nightrun_common::{Error, KillError, Result, StageName};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long the monitor waits for buffered output after the child exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// Messages and events
// ============================================================================

/// Structured message a child reports over its stdout channel.
///
/// Sent as one JSON object per line, e.g. `{"type":"build-complete"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProcessMessage {
    /// A compile cycle finished
    BuildComplete,
    /// A server is accepting connections
    Ready,
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Lifecycle event of a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Message(ProcessMessage),
    Exit(ExitInfo),
}

/// Receiving end of a supervised process's lifecycle events.
///
/// The exit event is always the last one.
#[derive(Debug)]
pub struct ProcessEvents {
    stage: StageName,
    rx: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl ProcessEvents {
    pub fn new(stage: StageName, rx: mpsc::UnboundedReceiver<ProcessEvent>) -> Self {
        Self { stage, rx }
    }

    pub fn stage(&self) -> StageName {
        self.stage
    }

    /// Next event; `None` once the exit event has been consumed
    pub async fn next(&mut self) -> Option<ProcessEvent> {
        self.rx.recv().await
    }

    /// Skip messages until the process exits
    pub async fn wait_exit(&mut self) -> Option<ExitInfo> {
        while let Some(event) = self.next().await {
            if let ProcessEvent::Exit(info) = event {
                return Some(info);
            }
        }
        None
    }
}

// ============================================================================
// Command description
// ============================================================================

/// A stdout line pattern that stands in for a structured message
#[derive(Debug, Clone)]
pub struct LineMarker {
    pub pattern: Regex,
    pub message: ProcessMessage,
}

impl LineMarker {
    pub fn new(pattern: Regex, message: ProcessMessage) -> Self {
        Self { pattern, message }
    }
}

/// Where a child's output goes
#[derive(Debug, Clone, Default)]
pub enum IoMode {
    /// stdout/stderr are the terminal's
    #[default]
    Inherit,
    /// stdout is the message channel; non-message lines are logged and
    /// checked against the markers
    Messages { markers: Vec<LineMarker> },
}

/// Everything needed to spawn a child
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub io: IoMode,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            io: IoMode::Inherit,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn io(mut self, io: IoMode) -> Self {
        self.io = io;
        self
    }

    /// Command line for logging
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Handle owning one live OS child process
#[derive(Debug, Clone)]
pub struct SupervisedProcess {
    pid: u32,
    stage: StageName,
    alive: Arc<AtomicBool>,
}

impl SupervisedProcess {
    pub fn new(pid: u32, stage: StageName, alive: Arc<AtomicBool>) -> Self {
        Self { pid, stage, alive }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn stage(&self) -> StageName {
        self.stage
    }

    /// False once the child has been reaped
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Start and stop child processes
pub trait ProcessLauncher: Send + Sync {
    /// Spawn `spec` on behalf of `stage`
    fn launch(&self, stage: StageName, spec: &CommandSpec) -> Result<(SupervisedProcess, ProcessEvents)>;

    /// Ask the process and its subtree to stop.
    ///
    /// Returns once the signal is issued; the process may still be running.
    /// Escalation to [`ProcessLauncher::kill`] is up to the caller.
    fn terminate(&self, process: &SupervisedProcess) -> std::result::Result<(), KillError>;

    /// Force-kill the process and its subtree
    fn kill(&self, process: &SupervisedProcess) -> std::result::Result<(), KillError>;

    /// Whether any member of the process's subtree is left
    fn is_running(&self, process: &SupervisedProcess) -> bool;

    /// How long a terminated process gets before it is killed
    fn grace_period(&self) -> Duration;
}

// ============================================================================
// OS launcher
// ============================================================================

/// Launcher backed by real OS processes
#[derive(Debug, Clone)]
pub struct OsLauncher {
    grace_period: Duration,
}

impl OsLauncher {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }
}

impl Default for OsLauncher {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl ProcessLauncher for OsLauncher {
    fn launch(&self, stage: StageName, spec: &CommandSpec) -> Result<(SupervisedProcess, ProcessEvents)> {
        debug!(stage = %stage, "Spawning: {}", spec.display());

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .process_group(0);

        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        match spec.io {
            IoMode::Inherit => cmd.stdout(Stdio::inherit()),
            IoMode::Messages { .. } => cmd.stdout(Stdio::piped()),
        };

        let mut child = cmd.spawn().map_err(|source| Error::ProcessSpawn {
            program: spec.program.clone(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| Error::ProcessSpawn {
            program: spec.program.clone(),
            source: std::io::Error::other("exited before a pid was assigned"),
        })?;

        info!(stage = %stage, pid, "Started {}", spec.program);

        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));

        let reader = match (&spec.io, child.stdout.take()) {
            (IoMode::Messages { markers }, Some(stdout)) => Some(tokio::spawn(forward_output(
                stage,
                stdout,
                markers.clone(),
                tx.clone(),
            ))),
            _ => None,
        };

        let monitor_alive = alive.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    warn!(stage = %stage, pid, "Failed to wait on child: {}", e);
                    ExitInfo { code: None, signal: None }
                }
            };
            monitor_alive.store(false, Ordering::SeqCst);

            // Descendants may hold stdout open past the leader's exit
            if let Some(reader) = reader {
                let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
            }

            debug!(stage = %stage, pid, code = ?exit.code, signal = ?exit.signal, "Process exited");
            let _ = tx.send(ProcessEvent::Exit(exit));
        });

        Ok((
            SupervisedProcess::new(pid, stage, alive),
            ProcessEvents::new(stage, rx),
        ))
    }

    fn terminate(&self, process: &SupervisedProcess) -> std::result::Result<(), KillError> {
        let pgid = process_group(process);

        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => {}
            // Group already gone
            Err(Errno::ESRCH) => return Ok(()),
            Err(e) => {
                return Err(KillError {
                    pid: process.pid(),
                    reason: e.to_string(),
                })
            }
        }

        info!(stage = %process.stage(), pid = process.pid(), "Sent SIGTERM to process group");
        Ok(())
    }

    fn kill(&self, process: &SupervisedProcess) -> std::result::Result<(), KillError> {
        match killpg(process_group(process), Signal::SIGKILL) {
            Ok(()) => {
                warn!(stage = %process.stage(), pid = process.pid(), "Sent SIGKILL to process group");
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(KillError {
                pid: process.pid(),
                reason: e.to_string(),
            }),
        }
    }

    fn is_running(&self, process: &SupervisedProcess) -> bool {
        // Signal 0 probes whether any group member is left
        killpg(process_group(process), None).is_ok()
    }

    fn grace_period(&self) -> Duration {
        self.grace_period
    }
}

fn process_group(process: &SupervisedProcess) -> Pid {
    Pid::from_raw(process.pid() as i32)
}

/// Turn a child's stdout into messages, echoing everything else to the log
async fn forward_output(
    stage: StageName,
    stdout: ChildStdout,
    markers: Vec<LineMarker>,
    tx: mpsc::UnboundedSender<ProcessEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(stage = %stage, "Failed to read child output: {}", e);
                break;
            }
        };

        if let Some(message) = parse_line(&line, &markers) {
            debug!(stage = %stage, ?message, "Process message");
            if tx.send(ProcessEvent::Message(message)).is_err() {
                break;
            }
        }
    }
}

/// A JSON message line is consumed; any other line is logged and may still
/// match a marker
fn parse_line(line: &str, markers: &[LineMarker]) -> Option<ProcessMessage> {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        if let Ok(message) = serde_json::from_str::<ProcessMessage>(trimmed) {
            return Some(message);
        }
    }

    info!(target: "nightrun::child", "{}", line);

    markers
        .iter()
        .find(|marker| marker.pattern.is_match(line))
        .map(|marker| marker.message.clone())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    fn messages() -> IoMode {
        IoMode::Messages {
            markers: vec![LineMarker::new(
                Regex::new("Watching for file changes").unwrap(),
                ProcessMessage::BuildComplete,
            )],
        }
    }

    #[test]
    fn test_parse_line() {
        let markers = match messages() {
            IoMode::Messages { markers } => markers,
            IoMode::Inherit => unreachable!(),
        };

        assert_eq!(
            parse_line(r#"{"type":"build-complete"}"#, &markers),
            Some(ProcessMessage::BuildComplete)
        );
        assert_eq!(parse_line(r#"{"type":"ready"}"#, &markers), Some(ProcessMessage::Ready));
        assert_eq!(
            parse_line("12:00:01 - Found 0 errors. Watching for file changes.", &markers),
            Some(ProcessMessage::BuildComplete)
        );
        assert_eq!(parse_line("src/app.e2e.ts(3,1): error TS2304", &markers), None);
        assert_eq!(parse_line(r#"{"type":"unknown"}"#, &markers), None);
    }

    #[test]
    fn test_command_spec_display() {
        let spec = CommandSpec::new("tsc").args(["-p", "tsconfig.json"]).arg("--watch");
        assert_eq!(spec.display(), "tsc -p tsconfig.json --watch");
    }

    #[tokio::test]
    async fn test_exit_codes_are_reported() {
        let launcher = OsLauncher::default();

        let (_, mut events) = launcher.launch(StageName::Compile, &sh("exit 0")).unwrap();
        assert!(events.wait_exit().await.unwrap().success());

        let (_, mut events) = launcher.launch(StageName::Compile, &sh("exit 3")).unwrap();
        let exit = events.wait_exit().await.unwrap();
        assert!(!exit.success());
        assert_eq!(exit.code, Some(3));
    }

    #[tokio::test]
    async fn test_messages_arrive_before_exit() {
        let launcher = OsLauncher::default();
        let spec = sh(r#"echo '{"type":"build-complete"}'; echo 'Watching for file changes.'"#).io(messages());

        let (_, mut events) = launcher.launch(StageName::Compile, &spec).unwrap();

        assert_eq!(
            events.next().await,
            Some(ProcessEvent::Message(ProcessMessage::BuildComplete))
        );
        assert_eq!(
            events.next().await,
            Some(ProcessEvent::Message(ProcessMessage::BuildComplete))
        );
        assert!(matches!(events.next().await, Some(ProcessEvent::Exit(info)) if info.success()));
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let launcher = OsLauncher::default();
        let err = launcher
            .launch(StageName::Driver, &CommandSpec::new("/nonexistent/nightrun-driver"))
            .unwrap_err();
        assert!(matches!(err, Error::ProcessSpawn { .. }));
    }

    /// Zombies waiting for their reaper count as gone
    pub(crate) fn is_running(pid: i32) -> bool {
        let stat = std::path::PathBuf::from(format!("/proc/{}/stat", pid));
        if std::path::Path::new("/proc/self").exists() {
            return match std::fs::read_to_string(stat) {
                Ok(stat) => !stat.contains(") Z "),
                Err(_) => false,
            };
        }
        nix::sys::signal::kill(Pid::from_raw(pid), None).is_ok()
    }

    #[tokio::test]
    async fn test_terminate_kills_subtree() {
        let launcher = OsLauncher::new(Duration::from_millis(200));
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("grandchild.pid");

        // The grandchild writes its pid, then sleeps in the same process group
        let script = format!("sleep 30 & echo $! > {}; wait", pidfile.display());
        let (process, mut events) = launcher.launch(StageName::Driver, &sh(&script)).unwrap();

        let grandchild = read_pid(&pidfile).await;

        launcher.terminate(&process).unwrap();
        let exit = events.wait_exit().await.unwrap();
        assert!(!exit.success());
        assert!(!process.is_alive());

        assert!(
            exits_within(grandchild, Duration::from_secs(1)).await,
            "grandchild {} survived the subtree kill",
            grandchild
        );
    }

    /// Wait for a child script to write its pid
    pub(crate) async fn read_pid(pidfile: &std::path::Path) -> i32 {
        for _ in 0..100 {
            if let Ok(pid) = std::fs::read_to_string(pidfile) {
                if let Ok(pid) = pid.trim().parse::<i32>() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no pid written to {}", pidfile.display());
    }

    pub(crate) async fn exits_within(pid: i32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        !is_running(pid)
    }

    #[tokio::test]
    async fn test_kill_ignores_sigterm() {
        let launcher = OsLauncher::new(Duration::from_secs(30));
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("stubborn.pid");

        let script = format!("trap '' TERM; echo $$ > {}; sleep 30", pidfile.display());
        let (process, mut events) = launcher.launch(StageName::Driver, &sh(&script)).unwrap();
        read_pid(&pidfile).await;

        launcher.terminate(&process).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(launcher.is_running(&process));

        launcher.kill(&process).unwrap();
        let exit = events.wait_exit().await.unwrap();
        assert_eq!(exit.signal, Some(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_terminate_exited_process_is_ok() {
        let launcher = OsLauncher::default();
        let (process, mut events) = launcher.launch(StageName::Compile, &sh("exit 0")).unwrap();
        events.wait_exit().await.unwrap();
        // Give the kernel a moment to drop the group
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(launcher.terminate(&process).is_ok());
    }
}
