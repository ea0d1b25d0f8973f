//! Run command implementation.

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;

use peerlink_core::node::Node;

use super::RunArgs;
use crate::ui::describe_event;

/// Run the run command.
pub async fn run(args: RunArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(output) = args.output {
        config.general.save_dir = Some(output);
    }
    if args.sync_clipboard {
        config.clipboard.sync_on_start = true;
    }

    let node = Node::start(config).await.context("Failed to start node")?;
    let mut events = node.events().subscribe();

    if !args.json {
        println!();
        println!(
            "  PeerLink running as {} ({})",
            node.config().general.device_name,
            node.local_ip()
        );
        println!(
            "  Saving files to {}",
            node.state().save_dir().await.display()
        );
        println!("  Press Ctrl+C to stop.");
        println!();
    }

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    if args.json {
                        println!("{}", serde_json::to_string(&event)?);
                    } else {
                        println!("{}", describe_event(&event));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    node.shutdown().await;
    if !args.json {
        println!();
        println!("  Stopped.");
    }
    Ok(())
}
