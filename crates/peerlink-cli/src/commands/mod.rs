//! CLI command definitions and handlers.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Load configuration with graceful fallback to defaults.
///
/// A missing or unreadable config file is not fatal for any command; the
/// defaults are used and the problem is logged.
pub fn load_config() -> peerlink_core::config::Config {
    peerlink_core::config::Config::load().unwrap_or_else(|e| {
        tracing::warn!("Using default configuration: {}", e);
        peerlink_core::config::Config::default()
    })
}

pub mod chat;
pub mod clipboard;
pub mod config;
pub mod devices;
pub mod run;
pub mod send;

/// PeerLink - LAN discovery, file transfer, chat and clipboard sync
#[derive(Parser)]
#[command(name = "peerlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Run a full node until interrupted
    Run(RunArgs),

    /// List devices announcing themselves on the network
    Devices(DevicesArgs),

    /// Send files and folders to a peer
    Send(SendArgs),

    /// Chat with a peer
    Chat(ChatArgs),

    /// Sync the clipboard with one or more peers
    Clipboard(ClipboardArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the run command
#[derive(Parser)]
pub struct RunArgs {
    /// Directory for received files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Start clipboard polling immediately
    #[arg(long)]
    pub sync_clipboard: bool,

    /// Print every event as one JSON object per line
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the devices command
#[derive(Parser)]
pub struct DevicesArgs {
    /// How long to listen (e.g., 5s, 10s)
    #[arg(short, long, default_value = "5s")]
    pub duration: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// Peer address (IP or IP:PORT)
    pub peer: String,

    /// Files and folders to send
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the chat command
#[derive(Parser)]
pub struct ChatArgs {
    /// Peer address
    pub peer: String,
}

/// Arguments for the clipboard command
#[derive(Parser)]
pub struct ClipboardArgs {
    /// Peer addresses to sync with
    pub peers: Vec<String>,

    /// Keep running with no peers given, waiting for inbound ones
    #[arg(long)]
    pub listen: bool,

    /// Print the clipboard history on exit
    #[arg(long)]
    pub history: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,

        /// Value to set
        value: String,
    },

    /// Show all configuration
    Show,

    /// Print the configuration file location
    Path,

    /// Reset to defaults
    Reset,
}
