//! livecomet CLI - follow a live broadcast's comment feed from a terminal.
//!
//! Thin wrapper over the `livecomet` library: connects to the given watch
//! page and prints chats, gifts, and notifications as they arrive until
//! the session closes or Ctrl-C.

use anyhow::Result;
use clap::Parser;
use livecomet::{ClientConfig, LiveClient, SessionEvent};

#[derive(Parser)]
#[command(name = "livecomet")]
#[command(version)]
#[command(about = "Follow a live broadcast's comment and event feed")]
struct Cli {
    /// URL of the live watch page.
    watch_url: String,

    /// Requested stream quality (overrides LIVECOMET_QUALITY).
    #[arg(long)]
    quality: Option<String>,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut config = ClientConfig::load();
    if let Some(quality) = cli.quality {
        config.stream.quality = quality;
    }

    let mut client = LiveClient::new(config)?;
    let mut session_events = client.subscribe_session();
    let mut chats = client.subscribe_chats();
    let mut gifts = client.subscribe_gifts();
    let mut notifications = client.subscribe_notifications();

    println!("Connecting to {}...", cli.watch_url);
    client.connect(&cli.watch_url).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted, disconnecting...");
                break;
            }

            event = session_events.recv() => match event {
                Ok(SessionEvent::EndpointNegotiated(info)) => {
                    println!("Connected; receiving from {}", info.view_uri);
                }
                Ok(SessionEvent::Closed { reason }) => {
                    eprintln!("Session closed: {reason}");
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("missed {n} session events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },

            chat = chats.recv() => if let Ok(chat) = chat {
                let name = chat.body.name.as_deref().unwrap_or("anonymous");
                println!("[chat] {}: {}", name, chat.body.content);
            },

            gift = gifts.recv() => if let Ok(gift) = gift {
                let from = gift.body.advertiser_name.as_deref().unwrap_or("someone");
                let item = gift.body.item_name.as_deref().unwrap_or(&gift.body.item_id);
                println!("[gift] {from} sent {item}");
            },

            notification = notifications.recv() => if let Ok(n) = notification {
                println!("[notice] {}", n.body.message);
            },
        }
    }

    client.disconnect().await;
    Ok(())
}
