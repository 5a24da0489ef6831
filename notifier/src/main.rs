mod config;
mod diff;
mod fetcher;
mod notify;
mod pipeline;
mod store;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Channels, Config};
use crate::pipeline::{Pipeline, RunError};
use crate::store::{FileStore, KvStore};

#[derive(Parser)]
#[command(name = "notifier", about = "Facility schedule change notifier")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "notifier.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single fetch-diff-notify pass
    Run,
    /// Poll on an interval until interrupted
    Serve,
    /// Write an example configuration file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notifier=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if let Command::InitConfig = cli.command {
        let example = toml::to_string_pretty(&Config::example())?;
        std::fs::write(&cli.config, example)?;
        tracing::info!("Wrote example config to {}", cli.config.display());
        return Ok(());
    }

    let config = Config::load(&cli.config)?;
    let channels = Channels::from_env();
    tracing::info!(
        "Tracking {} event configs (Discord: {} webhooks, Telegram: {})",
        config.events.len(),
        channels.discord_webhook_urls.len(),
        if channels.telegram_bot_token.is_some() {
            "enabled"
        } else {
            "disabled"
        },
    );

    let poll_interval = Duration::from_secs(config.poll_interval_secs);
    let store = FileStore::new(&config.data_dir);
    let pipeline = Pipeline::new(config, channels, store)?;

    match cli.command {
        Command::Run => {
            if let Err(e) = run_pass(&pipeline).await {
                log_run_error(&e);
                std::process::exit(1);
            }
        }
        Command::Serve => serve(&pipeline, poll_interval).await,
        Command::InitConfig => unreachable!("handled above"),
    }

    Ok(())
}

async fn run_pass<S: KvStore>(pipeline: &Pipeline<S>) -> Result<(), RunError> {
    let outcome = pipeline.run_once().await?;
    tracing::info!("{} (message sent: {})", outcome.message, outcome.has_changes);
    Ok(())
}

/// Poll forever; a failed pass is logged and retried on the next tick,
/// which is safe because failed passes never persist their snapshots.
async fn serve<S: KvStore>(pipeline: &Pipeline<S>, interval: Duration) {
    tracing::info!("Polling every {:?}. Press Ctrl+C to stop.", interval);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_pass(pipeline).await {
                    log_run_error(&e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received, stopping");
                break;
            }
        }
    }
}

fn log_run_error(error: &RunError) {
    match error {
        RunError::Delivery(errors) => {
            for e in errors {
                tracing::error!("{}: {}", e.message, e.error);
            }
        }
        other => tracing::error!("Pass failed: {}", other),
    }
}
