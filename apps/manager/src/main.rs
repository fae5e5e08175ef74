use std::{io::Write, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    CancellationToken, LoopbackClientFactory, RegistryConfig, SessionEvent, SessionRegistry,
};
use shared::protocol::HistoryRecord;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{execute, parse_line, Command};
use config::load_settings;

#[derive(Parser, Debug)]
#[command(about = "Manage several messaging sessions and their historical media")]
struct Args {
    /// Settings file (defaults to ./manager.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    media_dir: Option<PathBuf>,
    #[arg(long)]
    history_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(data_dir) = args.data_dir {
        if args.media_dir.is_none() {
            settings.media_dir = data_dir.join("media");
        }
        settings.data_dir = data_dir;
    }
    if let Some(media_dir) = args.media_dir {
        settings.media_dir = media_dir;
    }
    if let Some(history_file) = args.history_file {
        settings.history_file = Some(history_file);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let history = match &settings.history_file {
        Some(path) => load_history(path).await?,
        None => Vec::new(),
    };
    let registry = SessionRegistry::new(
        RegistryConfig::new(&settings.data_dir).with_media_dir(&settings.media_dir),
        Arc::new(LoopbackClientFactory::with_history(history)),
    )
    .await?;
    info!(
        data_dir = %settings.data_dir.display(),
        media_dir = %settings.media_dir.display(),
        "manager: ready"
    );

    let printer = tokio::spawn(print_events(registry.subscribe_events()));
    run_prompt(&registry).await?;

    for name in registry.list_sessions().await {
        let connected = matches!(registry.status(&name).await, Ok(status) if status.connected);
        if connected {
            if let Err(err) = registry.disconnect_session(&name).await {
                warn!(session = %name, error = %err, "manager: disconnect on exit failed");
            }
        }
    }
    printer.abort();
    Ok(())
}

async fn run_prompt(registry: &SessionRegistry) -> Result<()> {
    println!("type a command (list, add, connect, media list, ...) or `help`; `quit` exits");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().context("failed to flush prompt")?;

        let Some(line) = lines.next_line().await.context("failed to read stdin")? else {
            return Ok(());
        };
        let command = match parse_line(&line) {
            Ok(Some(Command::Quit)) => return Ok(()),
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };

        let cancel = CancellationToken::new();
        let run = execute(registry, command, &cancel);
        tokio::pin!(run);
        let outcome = tokio::select! {
            outcome = &mut run => outcome,
            _ = tokio::signal::ctrl_c() => {
                println!("cancelling...");
                cancel.cancel();
                run.await
            }
        };
        if let Err(err) = outcome {
            println!("error: {err:#}");
        }
    }
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::PairingCode { session, code }) => {
                println!("\n[{session}] pairing code: {code}");
                println!("[{session}] confirm it on the paired device to finish linking");
            }
            Ok(SessionEvent::StateChanged { session, state }) => {
                info!(session = %session, state = %state, "manager: state changed");
            }
            Ok(SessionEvent::HistorySynced {
                session,
                records,
                media_items,
            }) => {
                println!(
                    "\n[{session}] history sync: {records} message(s), {media_items} attachment(s) indexed"
                );
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "manager: event printer fell behind");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn load_history(path: &std::path::Path) -> Result<Vec<HistoryRecord>> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read history file '{}'", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse history file '{}'", path.display()))
}
