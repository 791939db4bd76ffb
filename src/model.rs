//! Canonical action model shared by the projector and the renderer.

use serde_json::{Map, Value};

/// Kind of unit of agent work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Command,
    Tool,
    WebSearch,
    FileChange,
    Note,
    Warning,
    /// Administrative turn marker. Never rendered.
    Turn,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Command => "command",
            ActionKind::Tool => "tool",
            ActionKind::WebSearch => "web_search",
            ActionKind::FileChange => "file_change",
            ActionKind::Note => "note",
            ActionKind::Warning => "warning",
            ActionKind::Turn => "turn",
        }
    }
}

/// Lifecycle phase of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    Started,
    Updated,
    Completed,
}

/// One unit of agent work.
///
/// An empty `id` means the action cannot be tracked across phases.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub id: String,
    pub kind: ActionKind,
    pub title: String,
    pub detail: Map<String, Value>,
}

impl Action {
    pub fn new(id: impl Into<String>, kind: ActionKind, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            detail: Map::new(),
        }
    }

    /// Attach a detail field.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }

    /// Integer exit code recorded in `detail`, if any.
    pub fn exit_code(&self) -> Option<i64> {
        self.detail.get("exit_code").and_then(Value::as_i64)
    }
}

/// A phase transition of an action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionEvent {
    pub action: Action,
    pub phase: ActionPhase,
    /// `None` on completion means success is derived from `detail.exit_code`.
    pub ok: Option<bool>,
}

impl ActionEvent {
    pub fn started(action: Action) -> Self {
        Self {
            action,
            phase: ActionPhase::Started,
            ok: None,
        }
    }

    pub fn updated(action: Action) -> Self {
        Self {
            action,
            phase: ActionPhase::Updated,
            ok: None,
        }
    }

    pub fn completed(action: Action, ok: Option<bool>) -> Self {
        Self {
            action,
            phase: ActionPhase::Completed,
            ok,
        }
    }

    /// Whether this completion represents a failure.
    pub fn failed(&self) -> bool {
        if self.phase != ActionPhase::Completed {
            return false;
        }
        match self.ok {
            Some(ok) => !ok,
            None => self.action.exit_code().is_some_and(|code| code != 0),
        }
    }
}

/// Identifier allowing a later request to continue the same agent session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResumeToken {
    pub engine: String,
    pub value: String,
}

impl ResumeToken {
    /// Build a token, rejecting values that are not UUID-shaped.
    pub fn parse(engine: impl Into<String>, value: &str) -> Option<Self> {
        if !crate::resume::is_session_id(value) {
            return None;
        }
        Some(Self {
            engine: engine.into(),
            value: value.to_string(),
        })
    }
}

/// Emitted once per run; establishes session metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedEvent {
    pub engine: String,
    pub resume: Option<ResumeToken>,
    pub title: Option<String>,
}

/// Everything the renderer can be told about.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Started(StartedEvent),
    Action(ActionEvent),
}

impl From<StartedEvent> for BridgeEvent {
    fn from(event: StartedEvent) -> Self {
        BridgeEvent::Started(event)
    }
}

impl From<ActionEvent> for BridgeEvent {
    fn from(event: ActionEvent) -> Self {
        BridgeEvent::Action(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_derives_from_exit_code() {
        let ok = Action::new("a", ActionKind::Command, "true").with_detail("exit_code", 0);
        let bad = Action::new("b", ActionKind::Command, "false").with_detail("exit_code", 2);

        assert!(!ActionEvent::completed(ok.clone(), None).failed());
        assert!(ActionEvent::completed(bad.clone(), None).failed());
        assert!(!ActionEvent::started(bad.clone()).failed());
        assert!(!ActionEvent::completed(bad, Some(true)).failed());
        assert!(ActionEvent::completed(ok, Some(false)).failed());
    }

    #[test]
    fn test_resume_token_rejects_malformed_values() {
        assert!(ResumeToken::parse("codex", "019b66fc-64c2-7a71-81cd-081c504cfeb2").is_some());
        assert!(ResumeToken::parse("codex", "abc").is_none());
        assert!(ResumeToken::parse("codex", "019b66fc64c27a7181cd081c504cfeb2").is_none());
    }
}
