//! Text formatting helpers for progress lines and headers.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;

use crate::model::{Action, ActionKind, ActionPhase};

pub const STATUS_RUNNING: &str = "▸";
pub const STATUS_UPDATE: &str = "↻";
pub const STATUS_DONE: &str = "✓";
pub const STATUS_FAIL: &str = "✗";

pub const HEADER_SEP: &str = " · ";
/// Markdown hard line break between body lines.
pub const HARD_BREAK: &str = "  \n";
pub const ELLIPSIS: &str = "…";

/// Default width for command titles.
pub const MAX_PROGRESS_CMD_LEN: usize = 300;
/// File changes listed inline before collapsing into "…(N more)".
pub const MAX_FILE_CHANGES_INLINE: usize = 3;

/// Format elapsed time as `Ns`, `Nm SSs` or `Nh MMm`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (minutes, seconds) = (total / 60, total % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

/// `<label> · <engine> · <elapsed>[ · step N]`.
pub fn format_header(elapsed: Duration, step: Option<usize>, label: &str, engine: &str) -> String {
    let mut parts = vec![label.to_string(), engine.to_string(), format_elapsed(elapsed)];
    if let Some(step) = step {
        parts.push(format!("step {step}"));
    }
    parts.join(HEADER_SEP)
}

/// Collapse whitespace and cut to `width` characters, marker included.
///
/// The ellipsis is only appended when something was cut. `None` disables
/// the width limit but still collapses whitespace.
pub fn shorten(text: &str, width: Option<usize>) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let Some(width) = width else {
        return collapsed;
    };
    if width == 0 {
        return String::new();
    }
    if collapsed.chars().count() <= width {
        return collapsed;
    }
    let keep = width - ELLIPSIS.chars().count();
    let head: String = collapsed.chars().take(keep).collect();
    format!("{}{ELLIPSIS}", head.trim_end())
}

/// Status symbol for an action line.
pub fn action_status(action: &Action, completed: bool, ok: Option<bool>) -> &'static str {
    if !completed {
        return STATUS_RUNNING;
    }
    let failed = match ok {
        Some(ok) => !ok,
        None => action.exit_code().is_some_and(|code| code != 0),
    };
    if failed { STATUS_FAIL } else { STATUS_DONE }
}

/// ` (exit N)` for a nonzero exit code.
pub fn action_suffix(action: &Action) -> String {
    match action.exit_code() {
        Some(code) if code != 0 => format!(" (exit {code})"),
        _ => String::new(),
    }
}

/// Show `path` relative to `base_dir` when it lies inside it.
///
/// Relative paths, paths outside `base_dir` and the base directory itself are
/// returned unchanged.
pub fn relativize_path(path: &str, base_dir: Option<&Path>) -> String {
    let Some(base_dir) = base_dir else {
        return path.to_string();
    };
    match Path::new(path).strip_prefix(base_dir) {
        Ok(relative) if !relative.as_os_str().is_empty() => {
            relative.to_string_lossy().into_owned()
        }
        _ => path.to_string(),
    }
}

/// `files: add `a`, update `b`, …(N more)`.
pub fn format_file_change_title(
    action: &Action,
    width: Option<usize>,
    base_dir: Option<&Path>,
) -> String {
    let rendered: Vec<String> = action
        .detail
        .get("changes")
        .and_then(Value::as_array)
        .map(|changes| {
            changes
                .iter()
                .filter_map(|change| {
                    let path = change.get("path").and_then(Value::as_str)?;
                    if path.is_empty() {
                        return None;
                    }
                    let verb = change
                        .get("kind")
                        .and_then(Value::as_str)
                        .filter(|kind| !kind.is_empty())
                        .unwrap_or("update");
                    Some(format!("{verb} `{}`", relativize_path(path, base_dir)))
                })
                .collect()
        })
        .unwrap_or_default();

    if rendered.is_empty() {
        return format!("files: {}", shorten(&action.title, width));
    }

    let mut inline: Vec<String> = rendered.iter().take(MAX_FILE_CHANGES_INLINE).cloned().collect();
    if rendered.len() > MAX_FILE_CHANGES_INLINE {
        inline.push(format!(
            "{ELLIPSIS}({} more)",
            rendered.len() - MAX_FILE_CHANGES_INLINE
        ));
    }
    format!("files: {}", shorten(&inline.join(", "), width))
}

pub fn format_action_title(
    action: &Action,
    width: Option<usize>,
    base_dir: Option<&Path>,
) -> String {
    match action.kind {
        ActionKind::Command => format!("`{}`", shorten(&action.title, width)),
        ActionKind::Tool => format!("tool: {}", shorten(&action.title, width)),
        ActionKind::WebSearch => format!("searched: {}", shorten(&action.title, width)),
        ActionKind::FileChange => format_file_change_title(action, width, base_dir),
        ActionKind::Note | ActionKind::Warning | ActionKind::Turn => {
            shorten(&action.title, width)
        }
    }
}

/// Render one action as a progress line.
pub fn format_action_line(
    action: &Action,
    phase: ActionPhase,
    ok: Option<bool>,
    width: Option<usize>,
    base_dir: Option<&Path>,
) -> String {
    let title = format_action_title(action, width, base_dir);
    match phase {
        ActionPhase::Started => format!("{STATUS_RUNNING} {title}"),
        ActionPhase::Updated => format!("{STATUS_UPDATE} {title}"),
        ActionPhase::Completed => format!(
            "{} {title}{}",
            action_status(action, true, ok),
            action_suffix(action)
        ),
    }
}
