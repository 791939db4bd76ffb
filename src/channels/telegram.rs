//! Telegram Bot API client.
//!
//! Wraps `sendMessage`, `editMessageText`, `deleteMessage` and `getUpdates`.
//! Throttled calls (HTTP 429 with `retry_after`) are retried after sleeping
//! the advised duration. The bot token lives in the request URL, so it is
//! stripped from every error before it can reach a log line.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::channels::channel::{IncomingMessage, SendOptions, Transport};
use crate::error::TransportError;
use crate::render::markup::MessageEntity;

/// Default Bot API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Long-poll timeout for `getUpdates`, in seconds.
pub const POLL_TIMEOUT_SECS: u64 = 30;

/// Throttle retries before giving up on a call.
const MAX_THROTTLE_RETRIES: u32 = 5;

/// Request timeout; must exceed the long-poll timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(POLL_TIMEOUT_SECS + 30);

/// Telegram Update object.
/// https://core.telegram.org/bots/api#update
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
}

/// Telegram Message object.
/// https://core.telegram.org/bots/api#message
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    pub text: Option<String>,
    pub reply_to_message: Option<Box<TelegramMessage>>,
}

impl TelegramMessage {
    /// Convert a text message into the transport-neutral form.
    pub fn into_incoming(self) -> Option<IncomingMessage> {
        let text = self.text?;
        let mut incoming = IncomingMessage::new(self.chat.id, self.message_id, text);
        if let Some(user) = self.from {
            incoming = incoming.with_user(user.id);
        }
        if let Some(reply) = self.reply_to_message {
            incoming = incoming.in_reply_to(reply.message_id, reply.text);
        }
        Some(incoming)
    }
}

/// https://core.telegram.org/bots/api#user
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
}

/// https://core.telegram.org/bots/api#chat
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub chat_type: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// Telegram Bot API client.
pub struct TelegramClient {
    http: reqwest::Client,
    token: SecretString,
    api_base: String,
    max_throttle_retries: u32,
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("api_base", &self.api_base)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl TelegramClient {
    pub fn new(token: SecretString) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            token,
            api_base: DEFAULT_API_BASE.to_string(),
            max_throttle_retries: MAX_THROTTLE_RETRIES,
        }
    }

    /// Point the client at another Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_throttle_retries(mut self, retries: u32) -> Self {
        self.max_throttle_retries = retries;
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base,
            self.token.expose_secret(),
            method
        )
    }

    /// Call a Bot API method, retrying throttled responses.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &Value,
    ) -> Result<T, TransportError> {
        let url = self.method_url(method);
        let mut throttled = 0;

        loop {
            let response = self
                .http
                .post(&url)
                .json(params)
                .send()
                .await
                .map_err(|e| TransportError::Http(e.without_url()))?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| TransportError::Http(e.without_url()))?;

            let parsed: ApiResponse<T> = match serde_json::from_str(&body) {
                Ok(parsed) => parsed,
                Err(e) if status.is_success() => {
                    return Err(TransportError::InvalidResponse {
                        method: method.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    return Err(TransportError::Api {
                        method: method.to_string(),
                        code: i64::from(status.as_u16()),
                        description: body.chars().take(200).collect(),
                    });
                }
            };

            if parsed.ok {
                return parsed
                    .result
                    .ok_or_else(|| TransportError::InvalidResponse {
                        method: method.to_string(),
                        reason: "ok response without result".to_string(),
                    });
            }

            let code = parsed
                .error_code
                .unwrap_or_else(|| i64::from(status.as_u16()));
            let retry_after = parsed.parameters.and_then(|p| p.retry_after);

            if let (429, Some(seconds)) = (code, retry_after) {
                let retry_after = Duration::from_secs(seconds);
                if throttled >= self.max_throttle_retries {
                    return Err(TransportError::RateLimited {
                        method: method.to_string(),
                        retry_after,
                    });
                }
                throttled += 1;
                tracing::warn!(
                    method,
                    retry_after_secs = seconds,
                    attempt = throttled,
                    "Telegram rate limited, backing off"
                );
                tokio::time::sleep(retry_after).await;
                continue;
            }

            return Err(TransportError::Api {
                method: method.to_string(),
                code,
                description: parsed
                    .description
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }
    }

    /// Fetch updates after `offset`, long-polling up to `timeout_secs`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<TelegramUpdate>, TransportError> {
        let mut params = json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            params["offset"] = json!(offset);
        }
        self.call("getUpdates", &params).await
    }
}

fn is_not_modified(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::Api { description, .. } if description.contains("message is not modified")
    )
}

#[async_trait]
impl Transport for TelegramClient {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(
        &self,
        chat_id: i64,
        text: &str,
        options: SendOptions,
    ) -> Result<i64, TransportError> {
        let mut params = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_notification": options.silent,
        });
        if let Some(reply_to) = options.reply_to {
            params["reply_parameters"] = json!({
                "message_id": reply_to,
                "allow_sending_without_reply": true,
            });
        }
        if let Some(entities) = options.entities {
            params["entities"] = json!(entities);
        }

        let sent: SentMessage = self.call("sendMessage", &params).await?;
        tracing::debug!(
            chat_id,
            message_id = sent.message_id,
            silent = options.silent,
            "Sent message"
        );
        Ok(sent.message_id)
    }

    async fn edit(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        entities: Option<Vec<MessageEntity>>,
    ) -> Result<i64, TransportError> {
        let mut params = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        if let Some(entities) = entities {
            params["entities"] = json!(entities);
        }

        match self.call::<Value>("editMessageText", &params).await {
            Ok(_) => Ok(message_id),
            Err(e) if is_not_modified(&e) => Ok(message_id),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, chat_id: i64, message_id: i64) -> Result<bool, TransportError> {
        self.call(
            "deleteMessage",
            &json!({ "chat_id": chat_id, "message_id": message_id }),
        )
        .await
    }
}
