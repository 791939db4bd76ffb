//! Agent CLI integration.
//!
//! - [`projector`] turns the agent's JSONL stream into bridge events
//! - [`supervisor`] owns the agent subprocess
//! - [`AgentRunner`] is the seam the bridge drives runs through

pub mod projector;
pub mod supervisor;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::SupervisorError;

pub use projector::{CODEX_ENGINE, Projected, project, project_line};
pub use supervisor::{
    CommandSpec, DEFAULT_TERMINATION_GRACE, ProcessExit, ProcessHandle, ProcessState,
    ProcessSupervisor,
};

/// One run request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub prompt: String,
    /// Session to continue, if any.
    pub resume: Option<String>,
}

impl RunRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            resume: None,
        }
    }

    pub fn with_resume(mut self, resume: Option<String>) -> Self {
        self.resume = resume;
        self
    }
}

/// How an agent run ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunExit {
    /// Exit code, or the negated signal number.
    pub code: i32,
    pub cancelled: bool,
    pub stderr_tail: Vec<String>,
}

impl RunExit {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failed(code: i32) -> Self {
        Self {
            code,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0 && !self.cancelled
    }
}

impl From<ProcessExit> for RunExit {
    fn from(exit: ProcessExit) -> Self {
        Self {
            code: exit.code(),
            cancelled: exit.cancelled,
            stderr_tail: exit.stderr_tail,
        }
    }
}

/// Runs one agent invocation, streaming raw JSON events into `events`.
///
/// When `cancel` fires the runner terminates the agent and resolves only
/// after it has exited, with [`RunExit::cancelled`] set. Dropping the future
/// also terminates the run.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Engine name shown in headers and carried by resume tokens.
    fn engine(&self) -> &str;

    /// Label for the synthetic action reporting a failed exit.
    fn command_label(&self) -> String {
        format!("{} exec", self.engine())
    }

    /// Directory the agent works in, used to shorten changed file paths.
    fn workspace(&self) -> Option<&Path> {
        None
    }

    async fn run(
        &self,
        request: &RunRequest,
        events: mpsc::Sender<Value>,
        cancel: oneshot::Receiver<()>,
    ) -> Result<RunExit, SupervisorError>;
}

/// Runs `codex exec --json` as a supervised subprocess.
#[derive(Debug, Clone)]
pub struct CodexRunner {
    command: String,
    workspace: Option<PathBuf>,
    extra_args: Vec<String>,
    supervisor: ProcessSupervisor,
}

impl CodexRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            workspace: None,
            extra_args: Vec::new(),
            supervisor: ProcessSupervisor::new(),
        }
    }

    /// Run the agent in this directory.
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    /// Extra arguments placed right after `exec --json`.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// `<cmd> exec --json <extra> [resume <id>] -`, prompt on stdin.
    pub fn command_spec(&self, request: &RunRequest) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.command)
            .args(["exec", "--json"])
            .args(self.extra_args.iter().cloned());
        if let Some(session) = &request.resume {
            spec = spec.args(["resume", session.as_str()]);
        }
        spec = spec.arg("-").stdin(request.prompt.clone());
        if let Some(workspace) = &self.workspace {
            spec = spec.current_dir(workspace);
        }
        spec
    }
}

#[async_trait]
impl AgentRunner for CodexRunner {
    fn engine(&self) -> &str {
        CODEX_ENGINE
    }

    fn command_label(&self) -> String {
        format!("{} exec", self.command)
    }

    fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    async fn run(
        &self,
        request: &RunRequest,
        events: mpsc::Sender<Value>,
        cancel: oneshot::Receiver<()>,
    ) -> Result<RunExit, SupervisorError> {
        let spec = self.command_spec(request);
        tracing::info!(
            resume = request.resume.as_deref().unwrap_or("new"),
            prompt_chars = request.prompt.chars().count(),
            "Starting codex run"
        );
        let handle = self.supervisor.start(spec, events)?;
        let exit = handle.wait_or_cancel(cancel).await?;
        if exit.cancelled {
            tracing::info!(code = exit.code(), escalated = exit.escalated, "codex run terminated");
        } else if !exit.success() {
            tracing::warn!(
                code = exit.code(),
                stderr = %exit.stderr_tail.join("\n"),
                "codex exited with failure"
            );
        }
        Ok(exit.into())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_command_line_for_new_session() {
        let runner = CodexRunner::new("codex")
            .with_extra_args(vec!["-c".into(), "notify=[]".into()])
            .with_workspace("/srv/repo");
        let spec = runner.command_spec(&RunRequest::new("hello"));

        assert_eq!(spec.program, "codex");
        assert_eq!(spec.args, vec!["exec", "--json", "-c", "notify=[]", "-"]);
        assert_eq!(spec.stdin.as_deref(), Some("hello"));
        assert_eq!(spec.cwd, Some(PathBuf::from("/srv/repo")));
    }

    #[test]
    fn test_command_line_for_resumed_session() {
        let runner = CodexRunner::new("codex");
        let request = RunRequest::new("continue")
            .with_resume(Some("0199a213-81c0-7800-8aa1-bbab2a035a53".into()));
        let spec = runner.command_spec(&request);

        assert_eq!(
            spec.args,
            vec![
                "exec",
                "--json",
                "resume",
                "0199a213-81c0-7800-8aa1-bbab2a035a53",
                "-"
            ]
        );
        assert_eq!(spec.cwd, None);
    }

    #[test]
    fn test_run_exit_success() {
        assert!(RunExit::success().is_success());
        assert!(!RunExit::failed(2).is_success());
        let cancelled = RunExit {
            cancelled: true,
            ..RunExit::default()
        };
        assert!(!cancelled.is_success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_codex_runner_streams_fake_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-codex");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "cat >/dev/null\n",
                "echo '{\"type\":\"thread.started\",",
                "\"thread_id\":\"0199a213-81c0-7800-8aa1-bbab2a035a53\"}'\n",
                "echo '{\"type\":\"turn.completed\"}'\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = CodexRunner::new(script.to_string_lossy()).with_workspace(dir.path());
        let (tx, mut rx) = mpsc::channel(8);
        let (_stop, stop_rx) = oneshot::channel();
        let exit = runner.run(&RunRequest::new("hi"), tx, stop_rx).await.unwrap();
        assert!(exit.is_success());

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event["type"].as_str().unwrap_or_default().to_string());
        }
        assert_eq!(kinds, vec!["thread.started", "turn.completed"]);
        assert_eq!(runner.workspace(), Some(dir.path()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_codex_runner_stops_on_cancel() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-codex");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat >/dev/null\necho '{\"type\":\"turn.started\"}'\nexec sleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = CodexRunner::new(script.to_string_lossy())
            .with_supervisor(ProcessSupervisor::new().with_grace(Duration::from_millis(200)));
        let (tx, mut rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = oneshot::channel();

        let request = RunRequest::new("hi");
        let run = runner.run(&request, tx, stop_rx);
        tokio::pin!(run);
        let first = tokio::select! {
            event = rx.recv() => event,
            _ = &mut run => None,
        };
        assert_eq!(first, Some(serde_json::json!({"type": "turn.started"})));

        stop_tx.send(()).unwrap();
        let exit = run.await.unwrap();
        assert!(exit.cancelled);
        assert!(!exit.is_success());
    }
}
