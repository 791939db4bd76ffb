//! Stateful progress renderer.
//!
//! Accumulates a bounded window of recent action lines and renders the
//! header/body/footer of the progress message and of the final answer.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::model::{ActionEvent, ActionKind, ActionPhase, BridgeEvent, ResumeToken};
use crate::render::format::{HARD_BREAK, MAX_PROGRESS_CMD_LEN, format_action_line, format_header};
use crate::resume::format_resume_line;

/// Default size of the recent-action window.
pub const DEFAULT_MAX_ACTIONS: usize = 5;

/// Formats the footer shown once a resume token is known.
pub type ResumeFormatter = Arc<dyn Fn(&ResumeToken) -> String + Send + Sync>;

/// The three sections of a rendered message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageParts {
    pub header: String,
    pub body: Option<String>,
    pub footer: Option<String>,
}

impl MessageParts {
    /// Join non-empty sections with blank lines.
    pub fn assemble(&self) -> String {
        [Some(self.header.as_str()), self.body.as_deref(), self.footer.as_deref()]
            .into_iter()
            .flatten()
            .filter(|chunk| !chunk.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// One slot of the display window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentLine {
    pub action_id: String,
    pub text: String,
    pub completed: bool,
    pub kind: ActionKind,
    pub failed: bool,
}

impl RecentLine {
    /// Shell/tool invocation markers that are noise once the answer is in.
    fn is_invocation_noise(&self) -> bool {
        matches!(self.kind, ActionKind::Command | ActionKind::Tool) && !self.failed
    }
}

pub struct ProgressRenderer {
    engine: String,
    max_actions: usize,
    command_width: Option<usize>,
    base_dir: Option<PathBuf>,
    lines: VecDeque<RecentLine>,
    action_count: usize,
    seen_action_ids: HashSet<String>,
    resume_token: Option<ResumeToken>,
    session_title: Option<String>,
    show_title: bool,
    resume_formatter: ResumeFormatter,
}

impl std::fmt::Debug for ProgressRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressRenderer")
            .field("engine", &self.engine)
            .field("max_actions", &self.max_actions)
            .field("lines", &self.lines)
            .field("action_count", &self.action_count)
            .field("resume_token", &self.resume_token)
            .finish()
    }
}

impl ProgressRenderer {
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            max_actions: DEFAULT_MAX_ACTIONS,
            command_width: Some(MAX_PROGRESS_CMD_LEN),
            base_dir: None,
            lines: VecDeque::with_capacity(DEFAULT_MAX_ACTIONS),
            action_count: 0,
            seen_action_ids: HashSet::new(),
            resume_token: None,
            session_title: None,
            show_title: false,
            resume_formatter: Arc::new(|token: &ResumeToken| format_resume_line(&token.value)),
        }
    }

    /// Set the window capacity.
    pub fn with_max_actions(mut self, max_actions: usize) -> Self {
        self.max_actions = max_actions;
        self.lines = VecDeque::with_capacity(max_actions);
        self
    }

    /// Set the command title width (`None` for unlimited).
    pub fn with_command_width(mut self, width: Option<usize>) -> Self {
        self.command_width = width;
        self
    }

    /// Render changed file paths relative to this directory.
    pub fn with_base_dir(mut self, base_dir: Option<PathBuf>) -> Self {
        self.base_dir = base_dir;
        self
    }

    /// Show the session title next to the label.
    pub fn with_show_title(mut self, show: bool) -> Self {
        self.show_title = show;
        self
    }

    /// Replace the resume footer formatter.
    pub fn with_resume_formatter(mut self, formatter: ResumeFormatter) -> Self {
        self.resume_formatter = formatter;
        self
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Distinct action ids observed so far.
    pub fn action_count(&self) -> usize {
        self.action_count
    }

    pub fn resume_token(&self) -> Option<&ResumeToken> {
        self.resume_token.as_ref()
    }

    pub fn lines(&self) -> impl Iterator<Item = &RecentLine> {
        self.lines.iter()
    }

    /// Texts of the display window, oldest first.
    pub fn recent_actions(&self) -> Vec<String> {
        self.lines.iter().map(|line| line.text.clone()).collect()
    }

    /// Fold an event into the state. Returns whether anything changed.
    pub fn note(&mut self, event: &BridgeEvent) -> bool {
        match event {
            BridgeEvent::Started(started) => {
                self.resume_token = started.resume.clone();
                self.session_title = started.title.clone();
                true
            }
            BridgeEvent::Action(event) => self.note_action(event),
        }
    }

    fn note_action(&mut self, event: &ActionEvent) -> bool {
        let action = &event.action;
        if action.kind == ActionKind::Turn || action.id.is_empty() {
            return false;
        }

        let completed = event.phase == ActionPhase::Completed;
        let has_open = self.open_line_index(&action.id).is_some();
        let phase = match event.phase {
            ActionPhase::Started if has_open => ActionPhase::Updated,
            phase => phase,
        };
        let text = format_action_line(
            action,
            phase,
            event.ok,
            self.command_width,
            self.base_dir.as_deref(),
        );

        if self.seen_action_ids.insert(action.id.clone()) {
            self.action_count += 1;
        }

        self.upsert_line(RecentLine {
            action_id: action.id.clone(),
            text,
            completed,
            kind: action.kind,
            failed: event.failed(),
        });
        true
    }

    fn open_line_index(&self, action_id: &str) -> Option<usize> {
        self.lines
            .iter()
            .rposition(|line| line.action_id == action_id && !line.completed)
    }

    fn upsert_line(&mut self, line: RecentLine) {
        if let Some(index) = self.open_line_index(&line.action_id) {
            self.lines[index] = line;
            return;
        }
        if self.max_actions == 0 {
            return;
        }
        while self.lines.len() >= self.max_actions {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn label(&self, label: &str) -> String {
        match (&self.session_title, self.show_title) {
            (Some(title), true) => format!("{label} ({title})"),
            _ => label.to_string(),
        }
    }

    fn header(&self, elapsed: Duration, label: &str) -> String {
        let step = (self.action_count > 0).then_some(self.action_count);
        format_header(elapsed, step, &self.label(label), &self.engine)
    }

    fn footer(&self) -> Option<String> {
        self.resume_token
            .as_ref()
            .map(|token| (self.resume_formatter)(token))
    }

    fn assemble_body<'a>(lines: impl Iterator<Item = &'a str>) -> Option<String> {
        let lines: Vec<&str> = lines.collect();
        if lines.is_empty() {
            None
        } else {
            Some(lines.join(HARD_BREAK))
        }
    }

    /// Render the in-flight progress message.
    pub fn render_progress(&self, elapsed: Duration) -> MessageParts {
        MessageParts {
            header: self.header(elapsed, "working"),
            body: Self::assemble_body(self.lines.iter().map(|line| line.text.as_str())),
            footer: self.footer(),
        }
    }

    /// Render the final message with the answer appended.
    pub fn render_final(&self, elapsed: Duration, answer: &str, status: &str) -> MessageParts {
        let keep_all = status != "done";
        let body = Self::assemble_body(
            self.lines
                .iter()
                .filter(|line| keep_all || !line.is_invocation_noise())
                .map(|line| line.text.as_str()),
        );
        let answer = answer.trim();
        let body = match (body, answer.is_empty()) {
            (body, true) => body,
            (None, false) => Some(answer.to_string()),
            (Some(body), false) => Some(format!("{body}\n\n{answer}")),
        };
        MessageParts {
            header: self.header(elapsed, status),
            body,
            footer: self.footer(),
        }
    }
}
