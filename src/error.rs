//! Error types for the bridge.

use std::time::Duration;

/// Errors raised by the chat transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The HTTP request itself failed. The URL is stripped because it embeds
    /// the bot token.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with `ok: false`.
    #[error("{method} failed ({code}): {description}")]
    Api {
        method: String,
        code: i64,
        description: String,
    },

    /// Throttled more times than the retry budget allows.
    #[error("{method} still rate limited after retries (retry after {retry_after:?})")]
    RateLimited { method: String, retry_after: Duration },

    /// The response body could not be understood.
    #[error("Invalid response from {method}: {reason}")]
    InvalidResponse { method: String, reason: String },
}

/// Errors raised while owning the agent subprocess.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The child could not be started.
    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    /// The supervising task went away before reporting an exit.
    #[error("Supervisor task failed: {reason}")]
    TaskFailed { reason: String },

    /// I/O error while talking to the child.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors that abort a bridged run.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The bridge is shutting down and admits no new runs.
    #[error("Bridge is shutting down")]
    ShuttingDown,
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
