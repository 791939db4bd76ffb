//! Resume marker lines: `resume: `<uuid>``.
//!
//! The final message of every run ends with a resume line. Replying to that
//! message (or pasting the line) continues the same agent session.

use std::sync::LazyLock;

use regex::Regex;

/// Marker that starts a resume line.
pub const RESUME_MARKER: &str = "resume:";

const UUID_PATTERN: &str =
    r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}";

static SESSION_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{UUID_PATTERN}$")).expect("session id pattern is valid")
});

static RESUME_LINE: LazyLock<Regex> = LazyLock::new(|| {
    // Horizontal whitespace only, so a match never spans lines.
    Regex::new(&format!(
        r"(?m)^[ \t]*resume:[ \t]*`(?P<id>{UUID_PATTERN})`[ \t]*\r?$"
    ))
        .expect("resume line pattern is valid")
});

/// True when `value` is UUID-shaped.
pub fn is_session_id(value: &str) -> bool {
    SESSION_ID.is_match(value)
}

/// Format the resume line for a session id.
pub fn format_resume_line(session_id: &str) -> String {
    format!("{RESUME_MARKER} `{session_id}`")
}

/// Extract the session id from the last well-formed resume line in `text`.
pub fn extract_session_id(text: &str) -> Option<String> {
    RESUME_LINE
        .captures_iter(text)
        .last()
        .map(|caps| caps["id"].to_string())
}

/// Pick the session to resume.
///
/// The message itself wins; the replied-to message is only consulted when
/// the message carries no resume line.
pub fn resolve_resume_session(text: &str, reply_text: Option<&str>) -> Option<String> {
    extract_session_id(text).or_else(|| reply_text.and_then(extract_session_id))
}

/// True when `line` is a well-formed resume line.
pub fn is_resume_line(line: &str) -> bool {
    !line.contains('\n') && RESUME_LINE.is_match(line)
}
