//! Clipboard sync command implementation.

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;

use peerlink_core::clipboard::{
    create_clipboard, ClipboardOptions, ClipboardSyncManager, HistoryDirection,
};
use peerlink_core::connection::{parse_host_address, resolve_local_ip};
use peerlink_core::events::{Event, EventBus};
use peerlink_core::state::SharedState;

use super::ClipboardArgs;
use crate::ui::{describe_event, format_timestamp, truncate_string};

/// Run the clipboard command.
pub async fn run(args: ClipboardArgs) -> Result<()> {
    if args.peers.is_empty() && !args.listen {
        bail!("Give at least one peer address, or --listen to wait for peers");
    }

    let config = super::load_config();
    let options = ClipboardOptions::from_config(&config, resolve_local_ip(config.network.local_ip));
    let peer_port = options.peer_port;

    let events = EventBus::default();
    let sync = ClipboardSyncManager::new(
        options,
        create_clipboard(),
        SharedState::new(config.resolved_save_dir()),
        events.clone(),
    );
    sync.start_server()
        .await
        .context("Failed to start clipboard server")?;
    let printer = tokio::spawn(print_clipboard_events(events.subscribe()));

    for peer in &args.peers {
        let addr = parse_host_address(peer, peer_port)?;
        if addr.port() != peer_port {
            tracing::warn!(
                "Ignoring port {} for {}; clipboard peers are dialed on {}",
                addr.port(),
                addr.ip(),
                peer_port
            );
        }
        if let Err(e) = sync.connect(addr.ip()).await {
            eprintln!("  Could not connect to {}: {}", addr.ip(), e);
        }
    }

    sync.start_polling().await;

    println!();
    println!("  Syncing clipboard. Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c().await?;

    sync.stop_polling().await;
    sync.stop_server().await;
    sync.disconnect_all().await;
    printer.abort();

    if args.history {
        print_history(&sync);
    }
    Ok(())
}

fn print_history(sync: &ClipboardSyncManager) {
    let history = sync.history();
    println!();
    println!("Clipboard History:");
    println!("{}", "─".repeat(60));
    if history.is_empty() {
        println!("  (empty)");
    }
    for entry in history {
        let arrow = match entry.direction {
            HistoryDirection::Sent => "→",
            HistoryDirection::Received => "←",
        };
        println!(
            "  {} [{}] {:15} {}",
            arrow,
            format_timestamp(entry.message.timestamp),
            entry.message.from_ip,
            truncate_string(&entry.message.content.replace('\n', " "), 36)
        );
    }
    println!("{}", "─".repeat(60));
}

/// Print clipboard traffic as it arrives.
async fn print_clipboard_events(mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => println!("{}", describe_event(&event)),
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
