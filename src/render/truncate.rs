//! Clamp rendered messages to the transport's size limit.
//!
//! Only the body is ever shortened. The header and the resume footer survive
//! intact; when even that is not enough, the text is cut from the tail of the
//! allowed budget while the last non-empty line (the resume line) is kept
//! whole at the end.

use std::collections::VecDeque;

use crate::render::format::ELLIPSIS;
use crate::render::markup::{MarkupRenderer, MessageEntity};
use crate::render::progress::MessageParts;

/// Telegram's hard limit on message text.
pub const TELEGRAM_MAX_LEN: usize = 4096;

const SECTION_SEP: &str = "\n\n";

/// Text ready to hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMessage {
    pub text: String,
    /// `None` whenever truncation happened: offsets into the original text
    /// are no longer valid.
    pub entities: Option<Vec<MessageEntity>>,
    pub truncated: bool,
}

/// Length as counted against the limit.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// True when the assembled message does not fit without truncation.
pub fn is_oversized(parts: &MessageParts, limit: usize) -> bool {
    char_len(&parts.assemble()) > limit
}

/// Drop the oldest body lines until the message fits, then hard-cut the
/// remaining body. Returns the fitted parts and whether anything was cut.
pub fn fit_parts(parts: &MessageParts, limit: usize) -> (MessageParts, bool) {
    if !is_oversized(parts, limit) {
        return (parts.clone(), false);
    }

    let mut fitted = parts.clone();
    if let Some(body) = parts.body.as_deref() {
        let mut lines: VecDeque<&str> = body.split('\n').collect();
        while lines.len() > 1 && is_oversized(&fitted, limit) {
            lines.pop_front();
            while lines.len() > 1 && lines.front().is_some_and(|line| line.trim().is_empty()) {
                lines.pop_front();
            }
            fitted.body = Some(lines.iter().copied().collect::<Vec<_>>().join("\n"));
        }
    }

    if is_oversized(&fitted, limit) {
        let without_body = MessageParts {
            body: None,
            ..fitted.clone()
        };
        let fixed = char_len(&without_body.assemble()) + SECTION_SEP.len();
        let budget = limit.saturating_sub(fixed);
        fitted.body = match fitted.body.as_deref() {
            Some(body) if budget >= 2 => Some(cut_tail(body, budget)),
            _ => None,
        };
    }

    (fitted, true)
}

/// Keep at most `budget` characters of `text`, ending with an ellipsis.
fn cut_tail(text: &str, budget: usize) -> String {
    if char_len(text) <= budget {
        return text.to_string();
    }
    let head: String = text.chars().take(budget.saturating_sub(1)).collect();
    format!("{}{ELLIPSIS}", head.trim_end())
}

/// Clamp raw text to `limit`, keeping the last non-empty line intact.
///
/// As long as `limit` is at least the length of that line, the output ends
/// with it exactly and never exceeds `limit`.
pub fn truncate_text(text: &str, limit: usize) -> String {
    if char_len(text) <= limit {
        return text.to_string();
    }

    let trimmed = text.trim_end();
    let (head, tail) = match trimmed.rfind('\n') {
        Some(index) => (&trimmed[..index], &trimmed[index + 1..]),
        None => ("", trimmed),
    };

    let tail_len = char_len(tail);
    if tail_len >= limit {
        return cut_tail(tail, limit);
    }

    let budget = limit - tail_len - 1;
    let head = head.trim_end();
    if budget < 2 || head.is_empty() {
        return tail.to_string();
    }
    format!("{}\n{tail}", cut_tail(head, budget))
}

/// Fit, render and, if still needed, hard-truncate a message.
pub fn prepare_message(
    parts: &MessageParts,
    limit: usize,
    markup: &dyn MarkupRenderer,
) -> PreparedMessage {
    let (fitted, mut truncated) = fit_parts(parts, limit);
    let rendered = markup.render(&fitted.assemble());

    let mut text = rendered.text;
    if char_len(&text) > limit {
        text = truncate_text(&text, limit);
        truncated = true;
    }

    let entities = if truncated || rendered.entities.is_empty() {
        None
    } else {
        Some(rendered.entities)
    };

    PreparedMessage {
        text,
        entities,
        truncated,
    }
}
