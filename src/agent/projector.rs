//! Projection of raw agent JSONL records onto the canonical action model.
//!
//! Unknown or malformed records project to nothing. Projection is a pure
//! function of the record.

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::model::{Action, ActionEvent, ActionKind, BridgeEvent, ResumeToken, StartedEvent};

/// Engine id reported in `StartedEvent`.
pub const CODEX_ENGINE: &str = "codex";

/// Result of projecting one raw record.
#[derive(Debug, Clone, PartialEq)]
pub enum Projected {
    /// Something the renderer tracks.
    Event(BridgeEvent),
    /// A completed assistant message; the last one is the final answer.
    AgentMessage(String),
    /// The turn finished.
    RunCompleted,
    /// The turn or the stream failed.
    RunFailed(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RawEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted {
        thread_id: String,
        #[serde(default)]
        title: Option<String>,
    },
    #[serde(rename = "turn.started")]
    TurnStarted {},
    #[serde(rename = "turn.completed")]
    TurnCompleted {},
    #[serde(rename = "turn.failed")]
    TurnFailed {
        #[serde(default)]
        error: Option<RawError>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "item.started")]
    ItemStarted { item: RawItem },
    #[serde(rename = "item.updated")]
    ItemUpdated { item: RawItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: RawItem },
}

#[derive(Debug, Deserialize)]
struct RawError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    #[serde(default)]
    id: Value,
    #[serde(rename = "type")]
    item_type: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Started,
    Updated,
    Completed,
}

/// Parse and project one line of agent output.
pub fn project_line(line: &str) -> Option<Projected> {
    let raw: Value = serde_json::from_str(line).ok()?;
    project(raw)
}

/// Project one raw record.
pub fn project(raw: Value) -> Option<Projected> {
    let event: RawEvent = match serde_json::from_value(raw) {
        Ok(event) => event,
        Err(e) => {
            tracing::trace!("Ignoring unrecognised agent event: {}", e);
            return None;
        }
    };

    match event {
        RawEvent::ThreadStarted { thread_id, title } => {
            let resume = ResumeToken::parse(CODEX_ENGINE, &thread_id);
            if resume.is_none() {
                tracing::debug!("thread.started carried a malformed thread id: {}", thread_id);
            }
            Some(Projected::Event(BridgeEvent::Started(StartedEvent {
                engine: CODEX_ENGINE.to_string(),
                resume,
                title,
            })))
        }
        RawEvent::TurnStarted {} => Some(Projected::Event(BridgeEvent::Action(
            ActionEvent::started(Action::new("turn", ActionKind::Turn, "turn")),
        ))),
        RawEvent::TurnCompleted {} => Some(Projected::RunCompleted),
        RawEvent::TurnFailed { error } => Some(Projected::RunFailed(
            error.map(|e| e.message).unwrap_or_default(),
        )),
        RawEvent::Error { message } => Some(Projected::RunFailed(message)),
        RawEvent::ItemStarted { item } => project_item(item, Stage::Started),
        RawEvent::ItemUpdated { item } => project_item(item, Stage::Updated),
        RawEvent::ItemCompleted { item } => project_item(item, Stage::Completed),
    }
}

fn project_item(item: RawItem, stage: Stage) -> Option<Projected> {
    let id = item_id(&item.id);
    let fields = &item.fields;
    let failed_status = str_field(fields, "status") == "failed"
        || str_field(fields, "status") == "declined";

    let (action, ok) = match item.item_type.as_str() {
        "agent_message" => {
            return match stage {
                Stage::Completed => Some(Projected::AgentMessage(
                    str_field(fields, "text").to_string(),
                )),
                _ => None,
            };
        }
        "command_execution" | "command" => {
            let mut action = Action::new(id, ActionKind::Command, str_field(fields, "command"));
            if let Some(code) = fields.get("exit_code").and_then(Value::as_i64) {
                action = action.with_detail("exit_code", code);
            }
            (action, failed_status.then_some(false))
        }
        "mcp_tool_call" | "tool" => {
            let server = str_field(fields, "server");
            let tool = str_field(fields, "tool");
            let name = [server, tool]
                .into_iter()
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(".");
            let title = if name.is_empty() { "tool".to_string() } else { name };
            let action = Action::new(id, ActionKind::Tool, title)
                .with_detail("server", server)
                .with_detail("tool", tool);
            (action, Some(!failed_status))
        }
        "web_search" => {
            let query = str_field(fields, "query");
            let action = Action::new(id, ActionKind::WebSearch, query).with_detail("query", query);
            (action, Some(true))
        }
        "file_change" => {
            let changes: Vec<Value> = fields
                .get("changes")
                .and_then(Value::as_array)
                .map(|changes| {
                    changes
                        .iter()
                        .filter_map(|change| {
                            let path = change.get("path").and_then(Value::as_str)?;
                            let kind = change.get("kind").and_then(Value::as_str).unwrap_or("");
                            Some(json!({ "path": path, "kind": kind }))
                        })
                        .collect()
                })
                .unwrap_or_default();
            let title = format!("{} files", changes.len());
            let action = Action::new(id, ActionKind::FileChange, title)
                .with_detail("changes", Value::Array(changes));
            (action, Some(!failed_status))
        }
        "reasoning" | "note" => {
            let text = first_non_empty(fields, &["text", "title"]);
            (Action::new(id, ActionKind::Note, text), Some(true))
        }
        "error" | "warning" => {
            let text = first_non_empty(fields, &["message", "text", "title"]);
            (Action::new(id, ActionKind::Warning, text), Some(false))
        }
        "turn" => (Action::new(id, ActionKind::Turn, "turn"), None),
        other => {
            tracing::trace!("Ignoring unknown item type: {}", other);
            return None;
        }
    };

    let event = match stage {
        Stage::Started => ActionEvent::started(action),
        Stage::Updated => ActionEvent::updated(action),
        Stage::Completed => ActionEvent::completed(action, ok),
    };
    Some(Projected::Event(BridgeEvent::Action(event)))
}

fn item_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn str_field<'a>(fields: &'a Map<String, Value>, key: &str) -> &'a str {
    fields.get(key).and_then(Value::as_str).unwrap_or("")
}

fn first_non_empty<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> &'a str {
    keys.iter()
        .map(|key| str_field(fields, key))
        .find(|value| !value.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionPhase;

    fn action_event(projected: Option<Projected>) -> ActionEvent {
        match projected {
            Some(Projected::Event(BridgeEvent::Action(event))) => event,
            other => panic!("expected an action event, got {:?}", other),
        }
    }

    #[test]
    fn test_thread_started_carries_resume_token() {
        let projected = project(json!({
            "type": "thread.started",
            "thread_id": "019b66fc-64c2-7a71-81cd-081c504cfeb2"
        }));
        let Some(Projected::Event(BridgeEvent::Started(started))) = projected else {
            panic!("expected started event");
        };
        assert_eq!(started.engine, "codex");
        assert_eq!(
            started.resume.map(|r| r.value).as_deref(),
            Some("019b66fc-64c2-7a71-81cd-081c504cfeb2")
        );
    }

    #[test]
    fn test_thread_started_with_bad_id_has_no_token() {
        let projected = project(json!({ "type": "thread.started", "thread_id": "abc" }));
        let Some(Projected::Event(BridgeEvent::Started(started))) = projected else {
            panic!("expected started event");
        };
        assert!(started.resume.is_none());
    }

    #[test]
    fn test_terminal_signals() {
        assert_eq!(
            project(json!({ "type": "turn.completed", "usage": {"input_tokens": 1} })),
            Some(Projected::RunCompleted)
        );
        assert_eq!(
            project(json!({ "type": "turn.failed", "error": { "message": "boom" } })),
            Some(Projected::RunFailed("boom".into()))
        );
        assert_eq!(
            project(json!({ "type": "error", "message": "stream lost" })),
            Some(Projected::RunFailed("stream lost".into()))
        );
    }

    #[test]
    fn test_turn_started_is_turn_action() {
        let event = action_event(project(json!({ "type": "turn.started" })));
        assert_eq!(event.action.kind, ActionKind::Turn);
    }

    #[test]
    fn test_unknown_and_malformed_events_are_ignored() {
        assert_eq!(project(json!({ "type": "mystery" })), None);
        assert_eq!(project(json!({ "no_type": true })), None);
        assert_eq!(project(json!({ "type": "item.started" })), None);
        assert_eq!(
            project(json!({ "type": "item.started", "item": { "id": "x", "type": "hologram" } })),
            None
        );
        assert_eq!(project_line("not json at all"), None);
    }

    #[test]
    fn test_command_surfaces_exit_code() {
        let line = json!({
            "type": "item.completed",
            "item": {
                "id": "item_0",
                "type": "command_execution",
                "command": "ls",
                "exit_code": 2,
                "status": "completed"
            }
        })
        .to_string();
        let event = action_event(project_line(&line));
        assert_eq!(event.phase, ActionPhase::Completed);
        assert_eq!(event.action.kind, ActionKind::Command);
        assert_eq!(event.action.title, "ls");
        assert_eq!(event.action.exit_code(), Some(2));
        assert_eq!(event.ok, None);
        assert!(event.failed());
    }

    #[test]
    fn test_tool_name_is_dotted() {
        let event = action_event(project(json!({
            "type": "item.started",
            "item": {
                "id": "t",
                "type": "mcp_tool_call",
                "server": "github",
                "tool": "search_issues"
            }
        })));
        assert_eq!(event.action.kind, ActionKind::Tool);
        assert_eq!(event.action.title, "github.search_issues");
        assert_eq!(event.phase, ActionPhase::Started);
    }

    #[test]
    fn test_file_change_lists_changes() {
        let event = action_event(project(json!({
            "type": "item.completed",
            "item": {
                "id": "f",
                "type": "file_change",
                "changes": [
                    { "path": "README.md", "kind": "add" },
                    { "kind": "update" },
                    { "path": "src/lib.rs", "kind": "update" }
                ]
            }
        })));
        assert_eq!(
            event.action.detail.get("changes"),
            Some(&json!([
                { "path": "README.md", "kind": "add" },
                { "path": "src/lib.rs", "kind": "update" }
            ]))
        );
        assert_eq!(event.ok, Some(true));
    }

    #[test]
    fn test_web_search_surfaces_query() {
        let event = action_event(project(json!({
            "type": "item.completed",
            "item": { "id": "s", "type": "web_search", "query": "rust jsonl" }
        })));
        assert_eq!(event.action.kind, ActionKind::WebSearch);
        assert_eq!(event.action.title, "rust jsonl");
        assert_eq!(event.action.detail.get("query"), Some(&json!("rust jsonl")));
    }

    #[test]
    fn test_agent_message_only_on_completion() {
        let item = json!({ "id": "m", "type": "agent_message", "text": "all done" });
        assert_eq!(
            project(json!({ "type": "item.completed", "item": item.clone() })),
            Some(Projected::AgentMessage("all done".into()))
        );
        assert_eq!(project(json!({ "type": "item.started", "item": item })), None);
    }

    #[test]
    fn test_numeric_and_missing_ids() {
        let event = action_event(project(json!({
            "type": "item.started",
            "item": { "id": 7, "type": "reasoning", "text": "thinking" }
        })));
        assert_eq!(event.action.id, "7");
        assert_eq!(event.action.kind, ActionKind::Note);

        let event = action_event(project(json!({
            "type": "item.completed",
            "item": { "type": "error", "message": "careful" }
        })));
        assert_eq!(event.action.id, "");
        assert_eq!(event.action.kind, ActionKind::Warning);
        assert_eq!(event.ok, Some(false));
    }
}
