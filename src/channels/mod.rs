//! Chat transports.
//!
//! - [`Transport`] is the send/edit/delete seam the bridge talks through
//! - [`TelegramClient`] implements it over the Bot API
//! - [`ProgressPresenter`] turns renders into a live-edited message

mod channel;
pub mod presenter;
pub mod telegram;

pub use channel::{IncomingMessage, SendOptions, Transport};
pub use presenter::{DEFAULT_EDIT_EVERY, PresenterOptions, ProgressPresenter};
pub use telegram::{
    DEFAULT_API_BASE, POLL_TIMEOUT_SECS, TelegramClient, TelegramMessage, TelegramUpdate,
};

#[cfg(test)]
pub(crate) use channel::testing;
