//! Progress and final message rendering.

pub mod format;
pub mod markup;
pub mod progress;
pub mod truncate;

pub use markup::{MarkupRenderer, MessageEntity, PlainText, RenderedText};
pub use progress::{
    DEFAULT_MAX_ACTIONS, MessageParts, ProgressRenderer, RecentLine, ResumeFormatter,
};
pub use truncate::{PreparedMessage, TELEGRAM_MAX_LEN, is_oversized, prepare_message};
