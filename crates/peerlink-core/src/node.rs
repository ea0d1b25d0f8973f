//! A running PeerLink node.
//!
//! [`Node`] creates the shared handles once and passes them to every
//! subsystem. A subsystem that cannot start (usually because its port is
//! taken) is reported through the event bus and left out; the others still
//! run.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use crate::chat::{ChatManager, ChatOptions};
use crate::clipboard::{
    create_clipboard, ClipboardAccess, ClipboardOptions, ClipboardSyncManager,
};
use crate::config::Config;
use crate::connection::resolve_local_ip;
use crate::discovery::{Device, DiscoveryOptions, DiscoveryService};
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::file::{collect_outgoing, FsStorage, Storage};
use crate::state::SharedState;
use crate::transfer::{TransferCoordinator, TransferOptions, TransferServer, TransferSession};

/// Collaborators a node is built from.
pub struct NodeParts {
    /// Where incoming files go and outgoing files come from
    pub storage: Arc<dyn Storage>,
    /// Clipboard the sync manager reads and writes
    pub clipboard: Box<dyn ClipboardAccess>,
}

impl Default for NodeParts {
    fn default() -> Self {
        Self {
            storage: Arc::new(FsStorage::new()),
            clipboard: create_clipboard(),
        }
    }
}

/// Every subsystem of one node.
#[derive(Debug)]
pub struct Node {
    config: Config,
    local_ip: IpAddr,
    state: Arc<SharedState>,
    events: EventBus,
    discovery: Option<DiscoveryService>,
    transfer_server: Option<TransferServer>,
    coordinator: Arc<TransferCoordinator>,
    chat: ChatManager,
    clipboard: ClipboardSyncManager,
}

impl Node {
    /// Start a node with the filesystem and the system clipboard.
    pub async fn start(config: Config) -> Result<Self> {
        Self::start_with(config, NodeParts::default()).await
    }

    /// Start a node with the given collaborators.
    ///
    /// Only an invalid configuration is an error; subsystems that fail to
    /// bind are reported as events and skipped.
    pub async fn start_with(config: Config, parts: NodeParts) -> Result<Self> {
        config.validate()?;

        let local_ip = resolve_local_ip(config.network.local_ip);
        let save_dir = config.resolved_save_dir();
        let state = SharedState::new(&save_dir);
        let events = EventBus::default();

        tracing::info!(
            "Starting node {} on {} (saving to {})",
            config.general.device_name,
            local_ip,
            save_dir.display()
        );

        let discovery = start_discovery(&config, local_ip, &events).await;

        let transfer_options = TransferOptions::from_config(&config);
        let transfer_addr = SocketAddr::new(
            std::net::Ipv4Addr::UNSPECIFIED.into(),
            config.network.transfer_port,
        );
        let transfer_server = match TransferServer::start(
            transfer_addr,
            transfer_options.clone(),
            Arc::clone(&state),
            Arc::clone(&parts.storage),
            events.clone(),
            local_ip,
        )
        .await
        {
            Ok(server) => Some(server),
            Err(e) => {
                tracing::error!("Transfer server unavailable: {}", e);
                events.emit(Event::TransferServerError {
                    message: e.to_string(),
                });
                None
            }
        };
        let coordinator = Arc::new(TransferCoordinator::new(
            transfer_options,
            Arc::clone(&state),
            parts.storage,
            events.clone(),
        ));

        let chat = ChatManager::new(ChatOptions::from_config(&config, local_ip), events.clone());
        // Failure is already reported as chat-server-error.
        let _ = chat.start_server().await;

        let clipboard = ClipboardSyncManager::new(
            ClipboardOptions::from_config(&config, local_ip),
            parts.clipboard,
            Arc::clone(&state),
            events.clone(),
        );
        let _ = clipboard.start_server().await;
        if config.clipboard.sync_on_start {
            clipboard.start_polling().await;
        }

        Ok(Self {
            config,
            local_ip,
            state,
            events,
            discovery,
            transfer_server,
            coordinator,
            chat,
            clipboard,
        })
    }

    /// Notification bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Shared state (save directory, cancel flags).
    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    /// Configuration the node was started with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Address this node announces.
    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    /// Discovery, if it could bind.
    pub fn discovery(&self) -> Option<&DiscoveryService> {
        self.discovery.as_ref()
    }

    /// Transfer listener, if it could bind.
    pub fn transfer_server(&self) -> Option<&TransferServer> {
        self.transfer_server.as_ref()
    }

    /// Outgoing transfer queue.
    pub fn coordinator(&self) -> &Arc<TransferCoordinator> {
        &self.coordinator
    }

    /// Chat connections.
    pub fn chat(&self) -> &ChatManager {
        &self.chat
    }

    /// Clipboard sync.
    pub fn clipboard(&self) -> &ClipboardSyncManager {
        &self.clipboard
    }

    /// Devices currently on the network.
    pub async fn devices(&self) -> Vec<Device> {
        match &self.discovery {
            Some(discovery) => discovery.devices().await,
            None => Vec::new(),
        }
    }

    /// Send files and folders to `peer`, one file at a time.
    pub async fn send_paths(
        &self,
        peer: IpAddr,
        paths: &[PathBuf],
    ) -> Result<Vec<TransferSession>> {
        let files = collect_outgoing(paths)?;
        let addr = SocketAddr::new(peer, self.coordinator.port());
        self.coordinator.send_files(addr, files).await
    }

    /// Stop every subsystem and close every connection.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down node");
        if let Some(discovery) = &self.discovery {
            discovery.stop().await;
        }
        if let Some(server) = &self.transfer_server {
            server.stop();
        }
        self.coordinator.cancel();
        self.clipboard.stop_polling().await;
        self.clipboard.stop_server().await;
        self.clipboard.disconnect_all().await;
        self.chat.stop_server().await;
        self.chat.disconnect_all().await;
    }
}

async fn start_discovery(
    config: &Config,
    local_ip: IpAddr,
    events: &EventBus,
) -> Option<DiscoveryService> {
    let options = DiscoveryOptions::from_config(config, local_ip);
    let service = DiscoveryService::bind(options, events.clone()).await.ok()?;
    match service.start().await {
        Ok(()) => Some(service),
        Err(e) => {
            tracing::error!("Discovery failed to start: {}", e);
            events.emit(Event::DiscoveryError {
                message: e.to_string(),
            });
            None
        }
    }
}
