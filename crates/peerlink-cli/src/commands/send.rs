//! Send command implementation.
//!
//! Sends files straight to a peer's transfer port, one file at a time.
//! Ctrl+C cancels the file in flight and skips the rest.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, oneshot};

use peerlink_core::connection::parse_host_address;
use peerlink_core::events::{Event, EventBus};
use peerlink_core::file::{collect_outgoing, format_size, FsStorage};
use peerlink_core::state::SharedState;
use peerlink_core::transfer::{TransferCoordinator, TransferOptions, TransferState};

use super::SendArgs;
use crate::ui::{describe_event, progress_line};

/// Run the send command.
pub async fn run(args: SendArgs) -> Result<()> {
    let config = super::load_config();
    let addr = parse_host_address(&args.peer, config.network.transfer_port)?;

    let files = collect_outgoing(&args.paths).context("Failed to collect files")?;
    let total_size: u64 = files.iter().map(|f| f.size).sum();

    if !args.quiet && !args.json {
        println!();
        println!("PeerLink v{}", peerlink_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!(
            "  Sending {} file(s) ({}) to {}",
            files.len(),
            format_size(total_size),
            addr
        );
        println!();
    }

    let events = EventBus::default();
    let coordinator = Arc::new(TransferCoordinator::new(
        TransferOptions::from_config(&config),
        SharedState::new(config.resolved_save_dir()),
        Arc::new(FsStorage::new()),
        events.clone(),
    ));

    let (done_tx, done_rx) = oneshot::channel();
    let printer = (!args.quiet)
        .then(|| tokio::spawn(print_events(events.subscribe(), done_rx, args.json)));

    let cancel = Arc::clone(&coordinator);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let start_time = Instant::now();
    let result = coordinator.send_files(addr, files).await;
    ctrl_c.abort();
    let _ = done_tx.send(());
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    match result {
        Ok(sessions) => {
            let sent = sessions
                .iter()
                .filter(|s| s.state() == TransferState::Completed)
                .count();
            if args.json {
                let output = serde_json::json!({
                    "status": "completed",
                    "files": sessions,
                    "elapsed_ms": start_time.elapsed().as_millis(),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else if !args.quiet {
                println!();
                println!(
                    "  Done: {} file(s), {} in {:.1}s",
                    sent,
                    format_size(total_size),
                    start_time.elapsed().as_secs_f64()
                );
            }
            Ok(())
        }
        Err(e) => {
            if args.json {
                let output = serde_json::json!({
                    "status": if e.is_cancellation() { "cancelled" } else { "error" },
                    "error": e.to_string(),
                    "queue": coordinator.subscribe().borrow().clone(),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                eprintln!();
                eprintln!("  Error: {}", e);
                if let Some(suggestion) = e.suggestion() {
                    eprintln!();
                    for line in suggestion.lines() {
                        eprintln!("  {}", line);
                    }
                }
            }
            Err(e.into())
        }
    }
}

/// Print sender events until `done` fires, then flush what is buffered.
async fn print_events(
    mut rx: broadcast::Receiver<Event>,
    mut done: oneshot::Receiver<()>,
    json: bool,
) {
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(event) => print_event(event, json),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = &mut done => break,
        }
    }
    while let Ok(event) = rx.try_recv() {
        print_event(event, json);
    }
}

fn print_event(event: Event, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(&event) {
            println!("{}", line);
        }
        return;
    }
    match event {
        Event::TransferProgress(progress) => {
            print!("\r{}", progress_line(&progress));
            let _ = io::stdout().flush();
        }
        event @ Event::FileSent { .. } => println!("\r{}", describe_event(&event)),
        event => println!("{}", describe_event(&event)),
    }
}
