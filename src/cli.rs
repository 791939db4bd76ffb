//! Command-line interface.
//!
//! Every option can also come from the environment (or a `.env` file).

use std::path::PathBuf;

use clap::Parser;

use crate::channels::DEFAULT_API_BASE;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "codex-telegram-bridge",
    version,
    about = "Run codex from a Telegram chat with live progress"
)]
pub struct Cli {
    /// Bot token from @BotFather
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub bot_token: Option<String>,

    /// The only chat the bridge answers
    #[arg(long, env = "TELEGRAM_CHAT_ID", allow_hyphen_values = true)]
    pub chat_id: Option<i64>,

    /// Bot API base URL
    #[arg(long, env = "TELEGRAM_API_BASE", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// Agent executable
    #[arg(long, env = "CODEX_CMD", default_value = "codex")]
    pub codex_cmd: String,

    /// Directory the agent runs in (defaults to the current directory)
    #[arg(long, env = "CODEX_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Extra argument passed to `codex exec` (repeatable)
    #[arg(
        long = "codex-arg",
        env = "CODEX_EXTRA_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    pub codex_args: Vec<String>,

    /// Deliver final answers as new messages so they notify
    #[arg(long, env = "BRIDGE_FINAL_NOTIFY")]
    pub final_notify: bool,

    /// Minimum seconds between progress edits
    #[arg(long, env = "BRIDGE_PROGRESS_EDIT_EVERY", default_value_t = 1.0)]
    pub progress_edit_every: f64,

    /// Maximum agent processes running at once
    #[arg(long, env = "BRIDGE_MAX_CONCURRENCY", default_value_t = 16)]
    pub max_concurrency: usize,

    /// Recent actions shown in the progress message
    #[arg(long, env = "BRIDGE_MAX_ACTIONS", default_value_t = 5)]
    pub max_actions: usize,

    /// Seconds between SIGTERM and SIGKILL when cancelling
    #[arg(long, env = "BRIDGE_TERMINATION_GRACE", default_value_t = 2.0)]
    pub termination_grace: f64,

    /// Show the session title in headers
    #[arg(long, env = "BRIDGE_SHOW_TITLE")]
    pub show_title: bool,

    /// Log as JSON lines
    #[arg(long, env = "BRIDGE_LOG_JSON")]
    pub log_json: bool,
}
