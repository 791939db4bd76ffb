//! Bridge a codex agent run to a Telegram chat.
//!
//! A prompt sent to the bot starts `codex exec --json`; the agent's event
//! stream is rendered into one progress message that is edited as the run
//! advances and finally replaced by the answer, ending with a resume line
//! that continues the same session when replied to.

pub mod agent;
pub mod bridge;
pub mod channels;
pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod render;
pub mod resume;

pub use bridge::{Bridge, BridgeSettings, IncomingRequest, RunOutcome, RunStatus};
pub use config::Config;
pub use error::{BridgeError, ConfigError, Result, SupervisorError, TransportError};
