//! chatclaw - Chat-Driven Orchestrator for a Command-Line Coding Agent
//!
//! Binary entry point: loads configuration, wires the dispatcher to a chat
//! adapter, and manages bounded shutdown.

use anyhow::Result;
use chatclaw::{
    agent::SessionService,
    bot::Dispatcher,
    chat::ConsoleChat,
    config::{apply_env_overrides, ChatClawConfig},
    store::JsonFileStore,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Bounded wait for workers on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "chatclaw")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Chat-driven orchestrator for a command-line coding agent")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CHATCLAW_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot against the console chat adapter
    Run,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("chatclaw={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = if let Some(config_path) = cli.config {
        let content = std::fs::read_to_string(&config_path)?;
        toml::from_str(&content)?
    } else {
        ChatClawConfig::default()
    };
    apply_env_overrides(&mut config);

    match cli.command {
        Commands::Run => run_bot(config).await?,
        Commands::Config { default } => {
            let config = if default {
                ChatClawConfig::default()
            } else {
                config
            };
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn run_bot(config: ChatClawConfig) -> Result<()> {
    tracing::info!("Starting chatclaw");

    let shutdown = CancellationToken::new();
    let store = Arc::new(JsonFileStore::new(&config.store.root)?);
    let service = Arc::new(SessionService::new(config.agent.clone()));
    let console = Arc::new(ConsoleChat::new());

    let dispatcher = Arc::new(Dispatcher::new(
        config.bot.clone(),
        console.clone(),
        service.clone(),
        store,
        None,
        shutdown.clone(),
    )?);

    let reaper = dispatcher.start_reaper();

    let (events_tx, events_rx) = mpsc::channel(64);
    let run_handle = tokio::spawn(dispatcher.clone().run(events_rx));

    let source_handle = {
        let console = console.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            console.run_source(events_tx, shutdown).await;
        })
    };

    tracing::info!(
        command = %config.bot.command,
        "chatclaw is running. Press Ctrl+C to stop."
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    shutdown.cancel();
    service.shutdown().await;
    dispatcher.tracker().close();

    let drain = async {
        let _ = run_handle.await;
        let _ = reaper.await;
        let _ = source_handle.await;
        dispatcher.tracker().wait().await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("Timeout waiting for workers to stop");
    }

    tracing::info!("chatclaw stopped");
    Ok(())
}
