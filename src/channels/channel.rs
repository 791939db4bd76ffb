//! Transport trait and message types.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::render::markup::MessageEntity;

/// A chat message the bridge was asked to act on.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Chat the message was posted in.
    pub chat_id: i64,
    /// Message id within the chat.
    pub message_id: i64,
    /// Sender id, when known.
    pub user_id: Option<i64>,
    /// Message text.
    pub text: String,
    /// Id of the message this one replies to.
    pub reply_to_message_id: Option<i64>,
    /// Text of the message this one replies to.
    pub reply_to_text: Option<String>,
}

impl IncomingMessage {
    /// Create a new incoming message.
    pub fn new(chat_id: i64, message_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            message_id,
            user_id: None,
            text: text.into(),
            reply_to_message_id: None,
            reply_to_text: None,
        }
    }

    /// Mark this message as a reply.
    pub fn in_reply_to(mut self, message_id: i64, text: Option<String>) -> Self {
        self.reply_to_message_id = Some(message_id);
        self.reply_to_text = text;
        self
    }

    /// Set the sender.
    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// Options for a new outgoing message.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Message to reply to.
    pub reply_to: Option<i64>,
    /// Deliver without a notification.
    pub silent: bool,
    /// Formatting annotations for the text.
    pub entities: Option<Vec<MessageEntity>>,
}

impl SendOptions {
    /// A silent reply.
    pub fn silent_reply(reply_to: Option<i64>) -> Self {
        Self {
            reply_to,
            silent: true,
            entities: None,
        }
    }

    /// A notifying reply.
    pub fn loud_reply(reply_to: Option<i64>) -> Self {
        Self {
            reply_to,
            silent: false,
            entities: None,
        }
    }

    pub fn with_entities(mut self, entities: Option<Vec<MessageEntity>>) -> Self {
        self.entities = entities;
        self
    }
}

/// Chat transport the bridge presents progress through.
///
/// Implementations retry throttled calls themselves; every error they
/// return is permanent from the caller's point of view.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name (e.g. "telegram").
    fn name(&self) -> &str;

    /// Send a new message. Returns its id.
    async fn send(
        &self,
        chat_id: i64,
        text: &str,
        options: SendOptions,
    ) -> Result<i64, TransportError>;

    /// Replace the text of an existing message. Returns its id.
    async fn edit(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        entities: Option<Vec<MessageEntity>>,
    ) -> Result<i64, TransportError>;

    /// Delete a message.
    async fn delete(&self, chat_id: i64, message_id: i64) -> Result<bool, TransportError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording transport for unit tests.

    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Send {
            chat_id: i64,
            text: String,
            reply_to: Option<i64>,
            silent: bool,
            entities: Option<Vec<MessageEntity>>,
        },
        Edit {
            message_id: i64,
            text: String,
            entities: Option<Vec<MessageEntity>>,
        },
        Delete {
            message_id: i64,
        },
    }

    #[derive(Debug, Default)]
    pub struct RecordingTransport {
        calls: Mutex<Vec<Call>>,
        /// Fail every edit with this API error code.
        pub fail_edits: Option<i64>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_edits(code: i64) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_edits: Some(code),
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn sends(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|call| matches!(call, Call::Send { .. }))
                .collect()
        }

        pub fn edits(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|call| matches!(call, Call::Edit { .. }))
                .collect()
        }

        pub fn deletes(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|call| matches!(call, Call::Delete { .. }))
                .collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(
            &self,
            chat_id: i64,
            text: &str,
            options: SendOptions,
        ) -> Result<i64, TransportError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call::Send {
                chat_id,
                text: text.to_string(),
                reply_to: options.reply_to,
                silent: options.silent,
                entities: options.entities,
            });
            Ok(calls.len() as i64)
        }

        async fn edit(
            &self,
            _chat_id: i64,
            message_id: i64,
            text: &str,
            entities: Option<Vec<MessageEntity>>,
        ) -> Result<i64, TransportError> {
            if let Some(code) = self.fail_edits {
                return Err(TransportError::Api {
                    method: "editMessageText".into(),
                    code,
                    description: "Forbidden".into(),
                });
            }
            self.calls.lock().unwrap().push(Call::Edit {
                message_id,
                text: text.to_string(),
                entities,
            });
            Ok(message_id)
        }

        async fn delete(&self, _chat_id: i64, message_id: i64) -> Result<bool, TransportError> {
            self.calls.lock().unwrap().push(Call::Delete { message_id });
            Ok(true)
        }
    }
}
