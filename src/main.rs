use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use codex_telegram_bridge::agent::{CodexRunner, ProcessSupervisor};
use codex_telegram_bridge::bridge::{Bridge, run_poller};
use codex_telegram_bridge::channels::TelegramClient;
use codex_telegram_bridge::cli::Cli;
use codex_telegram_bridge::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = Config::try_from(cli)?;
    tracing::info!(
        chat_id = config.telegram.chat_id,
        workspace = %config.codex.workspace.display(),
        command = %config.codex.command,
        "Starting codex bridge"
    );

    let Config {
        telegram,
        codex,
        bridge: settings,
        ..
    } = config;

    let client = Arc::new(TelegramClient::new(telegram.bot_token).with_api_base(telegram.api_base));
    let startup = startup_message(&codex.command, &codex.workspace, &codex.extra_args);
    let runner = CodexRunner::new(codex.command)
        .with_workspace(codex.workspace)
        .with_extra_args(codex.extra_args)
        .with_supervisor(ProcessSupervisor::new().with_grace(codex.termination_grace));
    let bridge = Arc::new(Bridge::new(client.clone(), Arc::new(runner), settings));

    run_poller(bridge, client, startup, shutdown_signal()).await?;
    tracing::info!("Bridge stopped");
    Ok(())
}

fn startup_message(command: &str, workspace: &Path, extra_args: &[String]) -> String {
    let invocation = std::iter::once(command.to_string())
        .chain(["exec".to_string(), "--json".to_string()])
        .chain(extra_args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "codex bridge is ready\n\nworkspace: `{}`\ncommand: `{invocation}`",
        workspace.display()
    )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Ctrl-C received, shutting down");
}
