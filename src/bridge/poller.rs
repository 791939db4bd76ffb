//! Long-poll loop feeding chat messages into the bridge.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::bridge::{Bridge, IncomingRequest};
use crate::channels::{
    IncomingMessage, POLL_TIMEOUT_SECS, SendOptions, TelegramClient, TelegramUpdate,
};
use crate::error::BridgeError;

/// Pause after a failed `getUpdates` call.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(2);

const CANCEL_COMMAND: &str = "/cancel";

/// What to do with one incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Run(IncomingRequest),
    /// `/cancel` replying to the given message.
    Cancel { chat_id: i64, target: Option<i64> },
    Ignore,
}

/// Decide what a message asks for.
pub fn dispatch(message: &IncomingMessage, chat_id: i64) -> Dispatch {
    if message.chat_id != chat_id {
        tracing::debug!(chat_id = message.chat_id, "Ignoring message from another chat");
        return Dispatch::Ignore;
    }
    let text = message.text.trim();
    if text.is_empty() {
        return Dispatch::Ignore;
    }
    if is_cancel_command(text) {
        return Dispatch::Cancel {
            chat_id: message.chat_id,
            target: message.reply_to_message_id,
        };
    }
    Dispatch::Run(IncomingRequest::from_message(message))
}

/// `/cancel` or `/cancel@botname`.
fn is_cancel_command(text: &str) -> bool {
    let command = text.split_whitespace().next().unwrap_or("");
    command == CANCEL_COMMAND
        || command
            .strip_prefix(CANCEL_COMMAND)
            .is_some_and(|rest| rest.starts_with('@'))
}

/// Poll for updates until `shutdown` resolves, then cancel and drain runs.
pub async fn run_poller(
    bridge: Arc<Bridge>,
    client: Arc<TelegramClient>,
    startup_message: String,
    shutdown: impl Future<Output = ()>,
) -> Result<(), BridgeError> {
    let chat_id = bridge.settings().chat_id;
    bridge
        .transport()
        .send(chat_id, &startup_message, SendOptions::default())
        .await?;
    tracing::info!(chat_id, "Bridge ready, polling for updates");

    tokio::pin!(shutdown);
    let mut offset = None;
    let mut tasks = JoinSet::new();

    loop {
        let updates = tokio::select! {
            _ = &mut shutdown => break,
            updates = client.get_updates(offset, POLL_TIMEOUT_SECS) => updates,
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!("getUpdates failed: {}", e);
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => continue,
                }
            }
        };

        for update in updates {
            offset = Some(next_offset(offset, &update));
            let Some(message) = update.message.and_then(|m| m.into_incoming()) else {
                continue;
            };
            match dispatch(&message, chat_id) {
                Dispatch::Run(request) => {
                    let bridge = Arc::clone(&bridge);
                    tasks.spawn(async move {
                        if let Err(e) = bridge.handle_message(request).await {
                            tracing::error!("Run failed: {}", e);
                        }
                    });
                }
                Dispatch::Cancel { chat_id, target } => {
                    handle_cancel(&bridge, chat_id, message.message_id, target).await;
                }
                Dispatch::Ignore => {}
            }
        }

        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                tracing::error!("Run task panicked: {}", e);
            }
        }
    }

    let cancelled = bridge.shutdown();
    tracing::info!(cancelled, pending = tasks.len(), "Shutting down, waiting for runs");
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!("Run task panicked: {}", e);
        }
    }
    Ok(())
}

fn next_offset(current: Option<i64>, update: &TelegramUpdate) -> i64 {
    current.unwrap_or(0).max(update.update_id + 1)
}

async fn handle_cancel(bridge: &Bridge, chat_id: i64, message_id: i64, target: Option<i64>) {
    let notice = match target {
        None => "reply to a progress message to cancel it",
        Some(target) if bridge.cancel(chat_id, target) => return,
        Some(_) => "nothing is running for that message",
    };
    if let Err(e) = bridge
        .transport()
        .send(chat_id, notice, SendOptions::loud_reply(Some(message_id)))
        .await
    {
        tracing::warn!("Failed to answer /cancel: {}", e);
    }
}
