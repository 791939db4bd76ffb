//! Boundary to the markdown → transport formatting converter.

use serde::Serialize;

/// A formatting annotation over a span of the rendered text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Transport-native text plus its formatting annotations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderedText {
    pub text: String,
    pub entities: Vec<MessageEntity>,
}

/// Converts assembled markdown into transport-native text.
pub trait MarkupRenderer: Send + Sync {
    fn render(&self, markdown: &str) -> RenderedText;
}

/// Sends markdown as-is, without formatting annotations.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainText;

impl MarkupRenderer for PlainText {
    fn render(&self, markdown: &str) -> RenderedText {
        RenderedText {
            text: markdown.to_string(),
            entities: Vec::new(),
        }
    }
}
