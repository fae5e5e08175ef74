use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{CancellationToken, SessionError, SessionRegistry};
use shared::protocol::HistoryAnchor;

const DEFAULT_HISTORY_COUNT: u32 = 50;

/// One line typed at the manager prompt.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(no_binary_name = true, disable_help_flag = true)]
pub struct Line {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// List every session with its state and storage file
    #[command(alias = "ls")]
    List,
    Add {
        name: String,
    },
    #[command(alias = "rm")]
    Remove {
        name: String,
    },
    /// Connect one session; first-time sessions print a pairing code
    Connect {
        name: String,
    },
    Disconnect {
        name: String,
    },
    ConnectAll,
    DisconnectAll,
    Status {
        name: String,
    },
    /// Delete storage files that no registered session uses
    Cleanup,
    Media {
        #[command(subcommand)]
        command: MediaCommand,
    },
    /// Ask a connected session for older history
    History {
        session: String,
        #[arg(long, default_value_t = DEFAULT_HISTORY_COUNT)]
        count: u32,
        /// Indexed media message to page back from
        #[arg(long)]
        before: Option<String>,
    },
    #[command(alias = "exit")]
    Quit,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum MediaCommand {
    List { session: String },
    Fetch { session: String, message_id: String },
    FetchAll { session: String },
    Save { session: String, path: PathBuf },
    Load { session: String, path: PathBuf },
}

/// Parses a prompt line; `Ok(None)` for blank input.
pub fn parse_line(line: &str) -> Result<Option<Command>, clap::Error> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() {
        return Ok(None);
    }
    Line::try_parse_from(words).map(|line| Some(line.command))
}

pub async fn execute(
    registry: &SessionRegistry,
    command: Command,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        Command::List => {
            let names = registry.list_sessions().await;
            if names.is_empty() {
                println!("no sessions registered; use `add <name>`");
                return Ok(());
            }
            println!("{} session(s)", names.len());
            for (position, name) in names.iter().enumerate() {
                match registry.status(name).await {
                    Ok(status) => println!(
                        "{}. {} [{}] {}",
                        position + 1,
                        status.name,
                        status.state,
                        status.storage_path.display()
                    ),
                    Err(err) => println!("{}. {name} error: {err}", position + 1),
                }
            }
        }
        Command::Add { name } => {
            let handle = registry.add_session(&name).await?;
            println!(
                "added session '{name}' (storage {})",
                handle.storage_path().display()
            );
        }
        Command::Remove { name } => {
            registry.remove_session(&name).await?;
            println!("removed session '{name}'");
        }
        Command::Connect { name } => {
            println!("connecting '{name}'; press Ctrl-C to abort");
            registry.connect_session(&name, cancel).await?;
            println!("session '{name}' connected");
        }
        Command::Disconnect { name } => {
            registry.disconnect_session(&name).await?;
            println!("session '{name}' disconnected");
        }
        Command::ConnectAll => {
            registry.connect_all(cancel).await?;
            println!("all sessions connected");
        }
        Command::DisconnectAll => {
            registry.disconnect_all(cancel).await?;
            println!("all sessions disconnected");
        }
        Command::Status { name } => {
            let status = registry.status(&name).await?;
            println!("session:   {}", status.name);
            println!("state:     {}", status.state);
            println!("connected: {}", status.connected);
            println!("storage:   {}", status.storage_path.display());
        }
        Command::Cleanup => {
            let removed = registry.cleanup_storage().await?;
            println!("removed {removed} unused storage file(s)");
        }
        Command::Media { command } => execute_media(registry, command, cancel).await?,
        Command::History {
            session,
            count,
            before,
        } => {
            let handle = registry.get_session(&session).await?;
            let anchor = match before {
                Some(message_id) => {
                    let item = handle
                        .media_index()
                        .lookup(&message_id.as_str().into())
                        .await
                        .with_context(|| {
                            format!("message '{message_id}' is not in the media index")
                        })?;
                    Some(HistoryAnchor {
                        conversation_id: item.conversation_id,
                        message_id: item.message_id,
                        sent_at: item.timestamp,
                    })
                }
                None => None,
            };
            handle
                .request_history_sync(anchor.as_ref(), count, cancel)
                .await?;
            println!("requested up to {count} older message(s) for '{session}'");
        }
        Command::Quit => bail!("quit is handled by the prompt loop"),
    }
    Ok(())
}

async fn execute_media(
    registry: &SessionRegistry,
    command: MediaCommand,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        MediaCommand::List { session } => {
            let handle = registry.get_session(&session).await?;
            let items = handle.media_index().list().await;
            println!("{} historical attachment(s) indexed", items.len());
            for item in items {
                println!(
                    "{} {} {} {} {}",
                    item.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    item.message_id,
                    item.kind,
                    item.mime_type,
                    item.caption.as_deref().unwrap_or("-")
                );
            }
        }
        MediaCommand::Fetch {
            session,
            message_id,
        } => {
            let handle = registry.get_session(&session).await?;
            let path = handle
                .fetch_media(&message_id.as_str().into(), cancel)
                .await?;
            println!("{}", path.display());
        }
        MediaCommand::FetchAll { session } => {
            let handle = registry.get_session(&session).await?;
            let mut fetched = 0;
            for item in handle.media_index().list().await {
                match handle.media_index().fetch_item(&item, cancel).await {
                    Ok(_) => fetched += 1,
                    Err(err @ SessionError::Cancelled { .. }) => return Err(err.into()),
                    Err(err) => println!("{}: {err}", item.message_id),
                }
            }
            println!("{fetched} attachment(s) available on disk");
        }
        MediaCommand::Save { session, path } => {
            let handle = registry.get_session(&session).await?;
            handle.media_index().save_snapshot(&path).await?;
            println!("saved media index of '{session}' to {}", path.display());
        }
        MediaCommand::Load { session, path } => {
            let handle = registry.get_session(&session).await?;
            let loaded = handle.media_index().load_snapshot(&path).await?;
            println!("loaded {loaded} item(s) into '{session}'");
        }
    }
    Ok(())
}
