//! PeerLink CLI - peer-to-peer LAN file transfer, chat and clipboard sync
//!
//! Every PeerLink node finds the others on the local network by itself.
//! Point a command at a peer's address and it connects directly.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run a node (receives files, chat and clipboard)
//! peerlink run
//!
//! # See who is around
//! peerlink devices
//!
//! # Send files to a peer
//! peerlink send 192.168.1.20 ./photos ./notes.txt
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => commands::run::run(args).await,
        Command::Devices(args) => commands::devices::run(args).await,
        Command::Send(args) => commands::send::run(args).await,
        Command::Chat(args) => commands::chat::run(args).await,
        Command::Clipboard(args) => commands::clipboard::run(args).await,
        Command::Config(args) => commands::config::run(args).await,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,peerlink=info,peerlink_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
