//! Validated runtime configuration.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};

use crate::bridge::BridgeSettings;
use crate::cli::Cli;
use crate::error::ConfigError;
use crate::render::TELEGRAM_MAX_LEN;

static BOT_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+:[A-Za-z0-9_-]+$").expect("bot token pattern is valid"));

#[derive(Debug)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub chat_id: i64,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct CodexConfig {
    pub command: String,
    pub workspace: PathBuf,
    pub extra_args: Vec<String>,
    pub termination_grace: Duration,
}

#[derive(Debug)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub codex: CodexConfig,
    pub bridge: BridgeSettings,
    pub log_json: bool,
}

impl TryFrom<Cli> for Config {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let bot_token = cli
            .bot_token
            .filter(|token| !token.trim().is_empty())
            .map(|token| SecretString::from(token.trim().to_string()))
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "TELEGRAM_BOT_TOKEN".to_string(),
                hint: "Pass --bot-token or set TELEGRAM_BOT_TOKEN".to_string(),
            })?;
        validate_bot_token(&bot_token)?;

        let chat_id = cli.chat_id.ok_or_else(|| ConfigError::MissingRequired {
            key: "TELEGRAM_CHAT_ID".to_string(),
            hint: "Pass --chat-id or set TELEGRAM_CHAT_ID".to_string(),
        })?;

        if cli.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BRIDGE_MAX_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let workspace = match cli.workspace {
            Some(path) => path,
            None => std::env::current_dir().map_err(|e| ConfigError::InvalidValue {
                key: "CODEX_WORKSPACE".to_string(),
                message: format!("cannot read current directory: {e}"),
            })?,
        };
        if !workspace.is_dir() {
            return Err(ConfigError::InvalidValue {
                key: "CODEX_WORKSPACE".to_string(),
                message: format!("{} is not a directory", workspace.display()),
            });
        }

        Ok(Self {
            telegram: TelegramConfig {
                bot_token,
                chat_id,
                api_base: cli.api_base,
            },
            codex: CodexConfig {
                command: cli.codex_cmd,
                workspace,
                extra_args: cli.codex_args,
                termination_grace: positive_seconds(
                    "BRIDGE_TERMINATION_GRACE",
                    cli.termination_grace,
                )?,
            },
            bridge: BridgeSettings {
                chat_id,
                final_notify: cli.final_notify,
                progress_edit_every: positive_seconds(
                    "BRIDGE_PROGRESS_EDIT_EVERY",
                    cli.progress_edit_every,
                )?,
                max_concurrency: cli.max_concurrency,
                max_actions: cli.max_actions,
                message_limit: TELEGRAM_MAX_LEN,
                show_title: cli.show_title,
            },
            log_json: cli.log_json,
        })
    }
}

fn validate_bot_token(token: &SecretString) -> Result<(), ConfigError> {
    if BOT_TOKEN.is_match(token.expose_secret()) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key: "TELEGRAM_BOT_TOKEN".to_string(),
            message: "expected <digits>:<token>".to_string(),
        })
    }
}

fn positive_seconds(key: &str, seconds: f64) -> Result<Duration, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    };
    if !(seconds.is_finite() && seconds > 0.0) {
        return Err(invalid(format!(
            "must be a positive number of seconds, got {seconds}"
        )));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| invalid(format!("{seconds} seconds is out of range: {e}")))
}
