//! Chat command implementation.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use peerlink_core::chat::{ChatManager, ChatOptions};
use peerlink_core::connection::{parse_host_address, resolve_local_ip};
use peerlink_core::events::{Event, EventBus};

use super::ChatArgs;
use crate::ui::{describe_event, format_timestamp};

/// Run the chat command.
pub async fn run(args: ChatArgs) -> Result<()> {
    let config = super::load_config();
    let mut options =
        ChatOptions::from_config(&config, resolve_local_ip(config.network.local_ip));
    let target = parse_host_address(&args.peer, options.peer_port)?;
    options.peer_port = target.port();
    let peer = target.ip();

    let events = EventBus::default();
    let chat = ChatManager::new(options, events.clone());
    chat.start_server()
        .await
        .context("Failed to start chat server")?;
    let printer = tokio::spawn(print_chat_events(events.subscribe()));

    chat.connect(peer)
        .await
        .with_context(|| format!("Could not connect to {}", target))?;

    println!();
    println!("  Chatting with {}. Type a message and press Enter; /quit to leave.", peer);
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            break;
        }

        match chat.send(peer, text).await {
            Ok(message) => println!(
                "  [{}] you: {}",
                format_timestamp(message.timestamp),
                message.content
            ),
            Err(e) => eprintln!("  Not sent: {}", e),
        }
    }

    chat.disconnect(peer).await;
    chat.stop_server().await;
    printer.abort();
    Ok(())
}

/// Print chat traffic as it arrives.
async fn print_chat_events(mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => println!("{}", describe_event(&event)),
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
