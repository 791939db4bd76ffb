//! Subprocess supervision for the agent CLI.
//!
//! The child runs in its own process group with piped stdio. Stdout is read
//! line by line and every JSON line is forwarded as soon as it arrives.
//! Cancellation (an explicit `cancel()` or dropping the handle) sends SIGTERM
//! to the whole group and escalates to SIGKILL when the grace period runs
//! out. The child is reaped on every path.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::SupervisorError;

/// Default time between SIGTERM and SIGKILL.
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// Stderr lines kept for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the stderr drain once the child is gone.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// What to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
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

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// Lifecycle of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    /// Exited with status zero.
    Completed,
    /// Exited nonzero, by signal, or the supervisor lost track of it.
    Failed,
    /// Terminated on request.
    Cancelled,
}

/// How the process ended.
#[derive(Debug)]
pub struct ProcessExit {
    pub status: ExitStatus,
    /// Termination was requested.
    pub cancelled: bool,
    /// SIGTERM was ignored and SIGKILL was needed.
    pub escalated: bool,
    /// Last lines the child wrote to stderr.
    pub stderr_tail: Vec<String>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, or the negated signal number when killed by a signal.
    pub fn code(&self) -> i32 {
        if let Some(code) = self.status.code() {
            return code;
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = self.status.signal() {
                return -signal;
            }
        }
        -1
    }
}

/// Starts and owns agent subprocesses.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    grace: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            grace: DEFAULT_TERMINATION_GRACE,
        }
    }

    /// Set the SIGTERM grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Spawn the process and start forwarding its stdout events.
    ///
    /// `events` is dropped once stdout reaches EOF or the process is
    /// terminated, so receivers see the stream close.
    pub fn start(
        &self,
        spec: CommandSpec,
        events: mpsc::Sender<Value>,
    ) -> Result<ProcessHandle, SupervisorError> {
        let (state_tx, state_rx) = watch::channel(ProcessState::NotStarted);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| SupervisorError::SpawnFailed {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        state_tx.send_replace(ProcessState::Running);
        tracing::debug!(program = %spec.program, ?pid, args = ?spec.args, "Spawned agent process");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::TaskFailed {
                reason: "stdout was not captured".to_string(),
            })?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    tracing::debug!("Failed to write prompt to stdin: {}", e);
                }
                // Dropping closes the pipe so the child sees EOF.
            });
        }

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, spec.program.clone())));

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(Supervised {
            child,
            stdout,
            stderr_task,
            events,
            cancel: cancel_rx,
            state: state_tx,
            grace: self.grace,
            program: spec.program,
        }));

        Ok(ProcessHandle {
            pid,
            state: state_rx,
            cancel: Some(cancel_tx),
            task,
        })
    }
}

/// Handle to a running process.
///
/// Dropping the handle without waiting cancels the process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    state: watch::Receiver<ProcessState>,
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<ProcessExit, SupervisorError>>,
}

impl ProcessHandle {
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Request termination. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Wait for the process to exit and be reaped.
    pub async fn wait(mut self) -> Result<ProcessExit, SupervisorError> {
        (&mut self.task)
            .await
            .map_err(task_failed)?
    }

    /// Wait for the process, terminating it if `signal` fires first.
    ///
    /// Returns only once the child has been reaped. A dropped sender is not
    /// a signal.
    pub async fn wait_or_cancel(
        mut self,
        mut signal: oneshot::Receiver<()>,
    ) -> Result<ProcessExit, SupervisorError> {
        let finished = tokio::select! {
            biased;
            result = &mut self.task => Some(result),
            Ok(()) = &mut signal => None,
        };
        match finished {
            Some(result) => result.map_err(task_failed)?,
            None => {
                self.cancel();
                self.wait().await
            }
        }
    }
}

fn task_failed(e: tokio::task::JoinError) -> SupervisorError {
    SupervisorError::TaskFailed {
        reason: e.to_string(),
    }
}

struct Supervised {
    child: Child,
    stdout: ChildStdout,
    stderr_task: Option<JoinHandle<Vec<String>>>,
    events: mpsc::Sender<Value>,
    cancel: oneshot::Receiver<()>,
    state: watch::Sender<ProcessState>,
    grace: Duration,
    program: String,
}

async fn supervise(job: Supervised) -> Result<ProcessExit, SupervisorError> {
    let Supervised {
        mut child,
        stdout,
        stderr_task,
        events,
        mut cancel,
        state,
        grace,
        program,
    } = job;

    let mut lines = BufReader::new(stdout).lines();
    let mut stdout_open = true;
    let mut cancelled = false;
    let mut forwarding = true;

    let outcome = loop {
        tokio::select! {
            biased;
            _ = &mut cancel => {
                cancelled = true;
                tracing::debug!(program = %program, "Cancelling agent process");
                break terminate(&mut child, grace, &program).await;
            }
            line = lines.next_line(), if stdout_open => match line {
                Ok(Some(line)) if forwarding => {
                    // A full channel must not hold off termination.
                    let sent = tokio::select! {
                        biased;
                        _ = &mut cancel => None,
                        sent = forward_line(&events, &line) => Some(sent),
                    };
                    match sent {
                        Some(sent) => forwarding = sent,
                        None => {
                            cancelled = true;
                            tracing::debug!(program = %program, "Cancelling agent process");
                            break terminate(&mut child, grace, &program).await;
                        }
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => stdout_open = false,
                Err(e) => {
                    tracing::warn!(program = %program, "Failed to read agent stdout: {}", e);
                    stdout_open = false;
                }
            },
            status = child.wait(), if !stdout_open => break status.map(|status| (status, false)),
        }
    };
    drop(lines);
    drop(events);

    let stderr_tail = match stderr_task {
        Some(mut task) => match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut task).await {
            Ok(Ok(tail)) => tail,
            Ok(Err(_)) => Vec::new(),
            Err(_) => {
                task.abort();
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    match outcome {
        Ok((status, escalated)) => {
            let next = if cancelled {
                ProcessState::Cancelled
            } else if status.success() {
                ProcessState::Completed
            } else {
                ProcessState::Failed
            };
            state.send_replace(next);
            tracing::debug!(
                program = %program,
                %status,
                cancelled,
                escalated,
                "Agent process exited"
            );
            Ok(ProcessExit {
                status,
                cancelled,
                escalated,
                stderr_tail,
            })
        }
        Err(e) => {
            state.send_replace(ProcessState::Failed);
            Err(SupervisorError::Io(e))
        }
    }
}

/// Forward one stdout line. Returns false once the receiver is gone.
async fn forward_line(events: &mpsc::Sender<Value>, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(value) => events.send(value).await.is_ok(),
        Err(e) => {
            tracing::debug!("Skipping non-JSON agent output ({}): {}", e, line);
            true
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, program: String) -> Vec<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(program = %program, "stderr: {}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

/// SIGTERM the group, then SIGKILL after `grace`. Always reaps.
async fn terminate(
    child: &mut Child,
    grace: Duration,
    program: &str,
) -> std::io::Result<(ExitStatus, bool)> {
    if let Some(status) = child.try_wait()? {
        return Ok((status, false));
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            signal_group(pid, libc::SIGTERM);
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return Ok((status?, false));
        }
        tracing::warn!(
            program,
            grace_ms = grace.as_millis() as u64,
            "Agent process ignored SIGTERM, sending SIGKILL"
        );
        if let Some(pid) = child.id() {
            signal_group(pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = (grace, program);

    if let Err(e) = child.start_kill() {
        tracing::debug!("start_kill failed: {}", e);
    }
    Ok((child.wait().await?, cfg!(unix)))
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // Never signal our own group.
    // SAFETY: getpgrp has no preconditions.
    if pgid == unsafe { libc::getpgrp() } {
        return;
    }
    // SAFETY: the child was spawned as leader of its own group.
    if unsafe { libc::killpg(pgid, signal) } == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, signal, "killpg failed: {}", err);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use serde_json::json;

    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    async fn next_event(rx: &mut mpsc::Receiver<Value>) -> Option<Value> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_streams_events_before_exit() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut handle = ProcessSupervisor::new()
            .start(sh(r#"echo '{"type":"turn.started"}'; exec sleep 30"#), tx)
            .unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event, Some(json!({"type": "turn.started"})));
        assert_eq!(handle.state(), ProcessState::Running);

        handle.cancel();
        let exit = handle.wait().await.unwrap();
        assert!(exit.cancelled);
        assert!(!exit.escalated);
        assert!(!exit.success());
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_ignored_sigterm_escalates_to_kill() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut handle = ProcessSupervisor::new()
            .with_grace(Duration::from_millis(200))
            .start(
                sh(r#"trap '' TERM; echo '{"type":"ready"}'; while true; do sleep 1; done"#),
                tx,
            )
            .unwrap();
        let mut state = handle.subscribe();

        assert!(next_event(&mut rx).await.is_some());
        let started = Instant::now();
        handle.cancel();
        let exit = handle.wait().await.unwrap();

        assert!(exit.cancelled);
        assert!(exit.escalated);
        assert_ne!(exit.code(), 0);
        assert_eq!(exit.code(), -libc::SIGKILL);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(*state.borrow_and_update(), ProcessState::Cancelled);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = ProcessSupervisor::new()
            .start(sh(r#"echo '{"n":1}'; echo 'not json'; echo boom >&2; exit 3"#), tx)
            .unwrap();
        let state = handle.subscribe();

        let exit = handle.wait().await.unwrap();
        assert_eq!(exit.code(), 3);
        assert!(!exit.cancelled);
        assert_eq!(exit.stderr_tail, vec!["boom".to_string()]);
        assert_eq!(*state.borrow(), ProcessState::Failed);

        assert_eq!(rx.recv().await, Some(json!({"n": 1})));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_prompt_goes_to_stdin() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = ProcessSupervisor::new()
            .start(
                sh(r#"printf '{"prompt":"%s"}\n' "$(cat)""#).stdin("fix the tests"),
                tx,
            )
            .unwrap();

        let exit = handle.wait().await.unwrap();
        assert!(exit.success());
        assert_eq!(rx.recv().await, Some(json!({"prompt": "fix the tests"})));
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = ProcessSupervisor::new()
            .start(
                sh(r#"printf '{"cwd":"%s"}\n' "$(pwd -P)""#).current_dir(dir.path()),
                tx,
            )
            .unwrap();
        handle.wait().await.unwrap();

        let event = rx.recv().await.unwrap();
        let cwd = PathBuf::from(event["cwd"].as_str().unwrap());
        assert_eq!(cwd, dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_wait_or_cancel_terminates_on_signal() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = ProcessSupervisor::new()
            .with_grace(Duration::from_millis(200))
            .start(
                sh(r#"trap '' TERM; echo '{"type":"ready"}'; while true; do sleep 1; done"#),
                tx,
            )
            .unwrap();
        let pid = handle.id().unwrap() as libc::pid_t;
        assert!(next_event(&mut rx).await.is_some());

        let (stop_tx, stop_rx) = oneshot::channel();
        let waiting = tokio::spawn(handle.wait_or_cancel(stop_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        stop_tx.send(()).unwrap();
        let exit = waiting.await.unwrap().unwrap();
        assert!(exit.cancelled);
        assert!(exit.escalated);
        // SAFETY: signal 0 only checks for existence.
        assert_ne!(unsafe { libc::kill(pid, 0) }, 0);
    }

    #[tokio::test]
    async fn test_wait_or_cancel_returns_natural_exit() {
        let (tx, _rx) = mpsc::channel(8);
        let handle = ProcessSupervisor::new().start(sh("exit 4"), tx).unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        drop(stop_tx);

        let exit = handle.wait_or_cancel(stop_rx).await.unwrap();
        assert_eq!(exit.code(), 4);
        assert!(!exit.cancelled);
    }

    #[tokio::test]
    async fn test_cancel_while_channel_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut handle = ProcessSupervisor::new()
            .start(
                sh(r#"while true; do echo '{"type":"tick"}'; sleep 0.01; done"#),
                tx,
            )
            .unwrap();
        assert!(next_event(&mut rx).await.is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("cancel blocked by a full channel")
            .unwrap();
        assert!(exit.cancelled);
        drop(rx);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (tx, _rx) = mpsc::channel(1);
        let err = ProcessSupervisor::new()
            .start(CommandSpec::new("/nonexistent/agent-binary"), tx)
            .unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_dropping_handle_reaps_child() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = ProcessSupervisor::new()
            .start(sh(r#"echo '{"up":true}'; exec sleep 30"#), tx)
            .unwrap();
        assert!(next_event(&mut rx).await.is_some());
        let pid = handle.id().unwrap() as libc::pid_t;
        drop(handle);

        // Stream closes once the child is gone.
        assert_eq!(next_event(&mut rx).await, None);
        let deadline = Instant::now() + Duration::from_secs(5);
        // SAFETY: signal 0 only checks for existence.
        while unsafe { libc::kill(pid, 0) } == 0 {
            assert!(Instant::now() < deadline, "child {pid} still alive");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
