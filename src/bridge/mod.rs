//! Bridge orchestration.
//!
//! One incoming chat message becomes one agent run: a silent progress
//! message is posted, the run is admitted through the session serializer,
//! agent events are folded into the renderer and presented as debounced
//! edits, and the final answer replaces or follows the progress message.

mod cancel;
pub mod poller;
pub mod session;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

use crate::agent::{AgentRunner, Projected, RunExit, RunRequest, project};
use crate::channels::{IncomingMessage, PresenterOptions, ProgressPresenter, Transport};
use crate::error::{BridgeError, TransportError};
use crate::model::{Action, ActionEvent, ActionKind, ResumeToken};
use crate::render::{
    DEFAULT_MAX_ACTIONS, MarkupRenderer, PlainText, ProgressRenderer, TELEGRAM_MAX_LEN,
};
use crate::resume::{is_resume_line, resolve_resume_session};

pub use cancel::{RunGuard, RunKey, RunningTasks};
pub use poller::run_poller;
pub use session::{DEFAULT_MAX_CONCURRENCY, SessionPermit, SessionSerializer};

/// Raw events buffered between the runner and the bridge loop.
const EVENT_BUFFER: usize = 64;

/// Action id of the synthetic line reporting a failed exit.
const EXIT_ACTION_ID: &str = "process-exit";

/// Runtime knobs for the bridge.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// The only chat the bridge answers.
    pub chat_id: i64,
    pub final_notify: bool,
    pub progress_edit_every: Duration,
    pub max_concurrency: usize,
    pub max_actions: usize,
    pub message_limit: usize,
    pub show_title: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            chat_id: 0,
            final_notify: false,
            progress_edit_every: Duration::from_secs(1),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_actions: DEFAULT_MAX_ACTIONS,
            message_limit: TELEGRAM_MAX_LEN,
            show_title: false,
        }
    }
}

/// A prompt to run, addressed to a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub chat_id: i64,
    /// The user's message; progress replies to it.
    pub message_id: i64,
    pub prompt: String,
    /// Session to continue.
    pub resume: Option<String>,
}

impl IncomingRequest {
    pub fn new(chat_id: i64, message_id: i64, prompt: impl Into<String>) -> Self {
        Self {
            chat_id,
            message_id,
            prompt: prompt.into(),
            resume: None,
        }
    }

    pub fn with_resume(mut self, resume: impl Into<String>) -> Self {
        self.resume = Some(resume.into());
        self
    }

    /// Build a request, resolving the session from the text or its reply.
    ///
    /// Resume lines are stripped from the prompt unless nothing else is left.
    pub fn from_message(message: &IncomingMessage) -> Self {
        let stripped = message
            .text
            .lines()
            .filter(|line| !is_resume_line(line))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = match stripped.trim() {
            "" => message.text.clone(),
            prompt => prompt.to_string(),
        };
        Self {
            chat_id: message.chat_id,
            message_id: message.message_id,
            prompt,
            resume: resolve_resume_session(&message.text, message.reply_to_text.as_deref()),
        }
    }
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Done,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished run left behind.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub progress_message_id: i64,
    /// Message holding the final answer.
    pub final_message_id: i64,
    pub resume: Option<ResumeToken>,
    pub answer: String,
}

#[derive(Debug, Default)]
struct RunState {
    answer: Option<String>,
    failure: Option<String>,
    cancelled: bool,
}

impl RunState {
    fn status(&self) -> RunStatus {
        if self.cancelled {
            RunStatus::Cancelled
        } else if self.failure.is_some() {
            RunStatus::Error
        } else {
            RunStatus::Done
        }
    }
}

pub struct Bridge {
    transport: Arc<dyn Transport>,
    runner: Arc<dyn AgentRunner>,
    markup: Arc<dyn MarkupRenderer>,
    sessions: SessionSerializer,
    running: RunningTasks,
    settings: BridgeSettings,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("transport", &self.transport.name())
            .field("engine", &self.runner.engine())
            .field("running", &self.running.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Bridge {
    pub fn new(
        transport: Arc<dyn Transport>,
        runner: Arc<dyn AgentRunner>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            transport,
            runner,
            markup: Arc::new(PlainText),
            sessions: SessionSerializer::new(settings.max_concurrency),
            running: RunningTasks::new(),
            settings,
        }
    }

    pub fn with_markup(mut self, markup: Arc<dyn MarkupRenderer>) -> Self {
        self.markup = markup;
        self
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn engine(&self) -> &str {
        self.runner.engine()
    }

    /// Runs currently tracked for cancellation.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Cancel the run whose progress message is `message_id`.
    pub fn cancel(&self, chat_id: i64, message_id: i64) -> bool {
        self.running.cancel(RunKey {
            chat_id,
            message_id,
        })
    }

    /// Stop admitting runs and cancel everything in flight.
    pub fn shutdown(&self) -> usize {
        self.sessions.close();
        self.running.cancel_all()
    }

    /// Run one prompt end to end.
    pub async fn handle_message(
        &self,
        request: IncomingRequest,
    ) -> Result<RunOutcome, BridgeError> {
        let started_at = Instant::now();
        let mut renderer = ProgressRenderer::new(self.runner.engine())
            .with_max_actions(self.settings.max_actions)
            .with_show_title(self.settings.show_title)
            .with_base_dir(self.runner.workspace().map(Path::to_path_buf));
        let mut presenter = ProgressPresenter::new(
            Arc::clone(&self.transport),
            request.chat_id,
            PresenterOptions {
                reply_to: Some(request.message_id),
                limit: self.settings.message_limit,
                edit_every: self.settings.progress_edit_every,
                final_notify: self.settings.final_notify,
            },
        )
        .with_markup(Arc::clone(&self.markup));

        let progress_id = presenter
            .start(&renderer.render_progress(Duration::ZERO))
            .await?;
        let (_guard, mut cancel) = self.running.register(RunKey {
            chat_id: request.chat_id,
            message_id: progress_id,
        });
        tracing::info!(
            chat_id = request.chat_id,
            message_id = request.message_id,
            progress_id,
            resume = request.resume.as_deref().unwrap_or("new"),
            "Run accepted"
        );

        let state = self
            .drive(&request, &mut renderer, &mut presenter, &mut cancel, started_at)
            .await
            .inspect_err(|e| tracing::error!(progress_id, "Run aborted: {}", e))?;

        let status = state.status();
        let answer = state.answer.or(state.failure).unwrap_or_default();
        let parts = renderer.render_final(started_at.elapsed(), &answer, status.as_str());
        let final_message_id = presenter.finish(&parts).await?;

        tracing::info!(
            progress_id,
            final_message_id,
            %status,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            actions = renderer.action_count(),
            "Run finished"
        );

        Ok(RunOutcome {
            status,
            progress_message_id: progress_id,
            final_message_id,
            resume: renderer.resume_token().cloned(),
            answer,
        })
    }

    async fn drive(
        &self,
        request: &IncomingRequest,
        renderer: &mut ProgressRenderer,
        presenter: &mut ProgressPresenter,
        cancel: &mut oneshot::Receiver<()>,
        started_at: Instant,
    ) -> Result<RunState, BridgeError> {
        let mut state = RunState::default();

        let admitted = tokio::select! {
            permit = self.sessions.admit(request.resume.as_deref()) => permit,
            _ = &mut *cancel => Err(BridgeError::ShuttingDown),
        };
        let _permit = match admitted {
            Ok(permit) => permit,
            Err(BridgeError::ShuttingDown) => {
                tracing::info!("Run cancelled before it started");
                state.cancelled = true;
                return Ok(state);
            }
            Err(e) => return Err(e),
        };

        let (events_tx, mut events) = mpsc::channel(EVENT_BUFFER);
        let (stop_tx, stop_rx) = oneshot::channel();
        let run_request =
            RunRequest::new(request.prompt.clone()).with_resume(request.resume.clone());
        let run = self.runner.run(&run_request, events_tx, stop_rx);
        tokio::pin!(run);

        let mut events_open = true;
        let mut exit = None;
        let mut aborted = None;
        while events_open || exit.is_none() {
            let flush_at = presenter.next_flush_at();
            let step = tokio::select! {
                biased;
                _ = &mut *cancel => {
                    tracing::info!("Run cancelled");
                    state.cancelled = true;
                    break;
                }
                event = events.recv(), if events_open => match event {
                    Some(raw) => self.apply(raw, renderer, presenter, &mut state, started_at).await,
                    None => {
                        events_open = false;
                        Ok(())
                    }
                },
                result = &mut run, if exit.is_none() => {
                    exit = Some(result);
                    Ok(())
                }
                _ = sleep_until(flush_at.unwrap_or(started_at)), if flush_at.is_some() => {
                    presenter.flush().await.map(drop)
                }
            };
            if let Err(e) = step {
                aborted = Some(e);
                break;
            }
        }

        // The session permit is held until the agent process is gone.
        if exit.is_none() {
            drop(events);
            let _ = stop_tx.send(());
            let result = (&mut run).await;
            tracing::debug!(reaped = ?result.as_ref().map(|exit| exit.code), "Agent run stopped");
            exit = Some(result);
        }
        if let Some(e) = aborted {
            return Err(e.into());
        }

        match exit {
            Some(Ok(_)) if state.cancelled => {}
            Some(Ok(exit)) if !exit.is_success() => {
                self.note_failed_exit(&exit, renderer, &mut state)
            }
            Some(Ok(_)) | None => {}
            Some(Err(e)) => {
                tracing::error!("Agent run failed: {}", e);
                state.failure = Some(e.to_string());
            }
        }
        Ok(state)
    }

    async fn apply(
        &self,
        raw: Value,
        renderer: &mut ProgressRenderer,
        presenter: &mut ProgressPresenter,
        state: &mut RunState,
        started_at: Instant,
    ) -> Result<(), TransportError> {
        match project(raw) {
            Some(Projected::Event(event)) => {
                if renderer.note(&event) {
                    presenter
                        .update(renderer.render_progress(started_at.elapsed()))
                        .await?;
                }
            }
            Some(Projected::AgentMessage(text)) => state.answer = Some(text),
            Some(Projected::RunCompleted) => tracing::debug!("Turn completed"),
            Some(Projected::RunFailed(message)) => {
                tracing::warn!("Agent reported failure: {}", message);
                state.failure = Some(message);
            }
            None => {}
        }
        Ok(())
    }

    fn note_failed_exit(
        &self,
        exit: &RunExit,
        renderer: &mut ProgressRenderer,
        state: &mut RunState,
    ) {
        let label = self.runner.command_label();
        let action = Action::new(EXIT_ACTION_ID, ActionKind::Command, label.as_str())
            .with_detail("exit_code", exit.code);
        renderer.note(&ActionEvent::completed(action, Some(false)).into());

        state.failure.get_or_insert_with(|| {
            let mut message = format!("`{label}` exited with code {}", exit.code);
            if !exit.stderr_tail.is_empty() {
                message.push_str("\n\n```\n");
                message.push_str(&exit.stderr_tail.join("\n"));
                message.push_str("\n```");
            }
            message
        });
    }
}
