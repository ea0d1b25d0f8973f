//! Receiving side of the transfer protocol.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use super::protocol::{FileMeta, ProgressThrottle};
use super::{TransferDirection, TransferOptions, TransferProgress, TransferSession, TransferState};
use crate::connection::bind_reusable_listener;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::file::{OpenedStream, Storage};
use crate::state::SharedState;
use crate::transport::{is_disconnect, spawn_acceptor, WsWriter};
use crate::CANCEL_CLOSE_CODE;

/// Close code sent when the destination cannot be written.
const STORAGE_FAILURE_CLOSE_CODE: u16 = 1011;

struct ReceiveContext {
    state: Arc<SharedState>,
    storage: Arc<dyn Storage>,
    events: EventBus,
    options: TransferOptions,
}

/// Accepts incoming files.
///
/// Each connection carries one file and is handled on its own task. The save
/// directory is read when a connection starts, so changing it affects only
/// later transfers.
#[derive(Debug)]
pub struct TransferServer {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl TransferServer {
    /// Bind `addr` and start accepting connections.
    pub async fn start(
        addr: SocketAddr,
        options: TransferOptions,
        state: Arc<SharedState>,
        storage: Arc<dyn Storage>,
        events: EventBus,
        local_ip: IpAddr,
    ) -> Result<Self> {
        let listener = bind_reusable_listener("transfer", addr)?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let ctx = Arc::new(ReceiveContext {
            state,
            storage,
            events,
            options,
        });

        tracing::info!("Transfer server listening on {}", local_addr);

        spawn_acceptor("transfer", listener, local_ip, shutdown_rx, move |ws, peer| {
            handle_connection(ws, peer, Arc::clone(&ctx))
        });

        Ok(Self {
            local_addr,
            shutdown_tx,
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections. Transfers in progress run to completion.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn handle_connection(
    ws_stream: WebSocketStream<TcpStream>,
    peer: IpAddr,
    ctx: Arc<ReceiveContext>,
) {
    ctx.state.reset_receive_cancel();
    let save_dir = ctx.state.save_dir().await;

    let (sink, mut reader) = ws_stream.split();
    let mut writer = WsWriter::Accepted(sink);

    match receive_file(&mut writer, &mut reader, peer, &save_dir, &ctx).await {
        Ok(state) => tracing::debug!("Transfer from {} finished: {:?}", peer, state),
        Err(e) => tracing::warn!("Transfer from {} failed: {}", peer, e),
    }
}

async fn receive_file<S>(
    writer: &mut WsWriter,
    reader: &mut S,
    peer: IpAddr,
    save_dir: &Path,
    ctx: &ReceiveContext,
) -> Result<TransferState>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    let meta = match read_metadata(reader, peer).await {
        Ok(meta) => meta,
        Err(e) => {
            writer.close().await;
            return Err(e);
        }
    };
    let name = meta.display_name();

    let opened = match ctx
        .storage
        .open_write_stream(save_dir, &meta.storage_name())
        .await
    {
        Ok(opened) => opened,
        Err(e) => {
            ctx.events.emit(Event::FileReceiveFailed {
                name,
                reason: e.to_string(),
            });
            writer
                .close_with_code(STORAGE_FAILURE_CLOSE_CODE, "Cannot write file")
                .await;
            return Err(e);
        }
    };

    let mut session = TransferSession::new(
        name.clone(),
        meta.size,
        meta.position(),
        meta.total.unwrap_or(1),
    );
    session.transition(TransferState::InProgress);

    tracing::info!("Receiving {} from {}", name, peer);
    ctx.events.emit(Event::FileReceivingStarted {
        name: name.clone(),
        size: meta.size,
        index: meta.index,
        total: meta.total,
        from: peer,
    });

    let mut throttle = ProgressThrottle::new(meta.size, ctx.options.progress_interval);
    let mut clean_close = false;

    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Binary(data)) => {
                if ctx.state.receive_cancelled() {
                    cancel_by_receiver(writer, reader, &opened, &mut session, ctx).await;
                    return Ok(session.state());
                }

                if let Err(e) = ctx.storage.write(opened.handle, &data).await {
                    let _ = ctx.storage.delete(opened.handle).await;
                    session.transition(TransferState::Failed);
                    ctx.events.emit(Event::FileReceiveFailed {
                        name,
                        reason: e.to_string(),
                    });
                    writer
                        .close_with_code(STORAGE_FAILURE_CLOSE_CODE, "Cannot write file")
                        .await;
                    return Err(e);
                }

                session.record(data.len() as u64);
                if throttle.update(session.bytes_transferred) {
                    ctx.events.emit(Event::TransferProgress(TransferProgress::new(
                        TransferDirection::Receive,
                        peer,
                        &name,
                        session.bytes_transferred,
                        meta.size.unwrap_or(session.bytes_transferred),
                    )));
                }
            }
            Ok(Message::Close(_)) => {
                clean_close = true;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if !is_disconnect(&e) {
                    tracing::warn!("WebSocket error from {}: {}", peer, e);
                }
                break;
            }
        }
    }

    let complete = if meta.size.is_some() {
        session.is_complete()
    } else {
        clean_close
    };

    if !complete {
        tracing::info!(
            "Transfer of {} ended after {} of {:?} bytes",
            name,
            session.bytes_transferred,
            meta.size
        );
        discard(&opened, &mut session, ctx).await;
        return Ok(session.state());
    }

    if let Err(e) = ctx.storage.close(opened.handle).await {
        session.transition(TransferState::Failed);
        ctx.events.emit(Event::FileReceiveFailed {
            name,
            reason: e.to_string(),
        });
        return Err(e);
    }

    session.transition(TransferState::Completed);
    // Flushes the echo of the sender's close frame, which confirms receipt.
    writer.close().await;
    tracing::info!(
        "Received {} ({} bytes) into {}",
        name,
        session.bytes_transferred,
        opened.location.display()
    );
    ctx.events.emit(Event::FileReceived {
        name,
        size: session.bytes_transferred,
        path: opened.location,
    });
    Ok(TransferState::Completed)
}

async fn read_metadata<S>(reader: &mut S, peer: IpAddr) -> Result<FileMeta>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => return FileMeta::parse(&text),
            Ok(Message::Binary(_)) => {
                return Err(Error::ProtocolError(
                    "file data arrived before metadata".to_string(),
                ))
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(Error::ConnectionLost {
                    peer: peer.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
    Err(Error::ProtocolError(
        "connection closed before metadata".to_string(),
    ))
}

/// Tell the sender to stop, then drop the partial file.
async fn cancel_by_receiver<S>(
    writer: &mut WsWriter,
    reader: &mut S,
    opened: &OpenedStream,
    session: &mut TransferSession,
    ctx: &ReceiveContext,
) where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    tracing::info!("Cancelling receipt of {}", session.file_name);
    writer
        .close_with_code(CANCEL_CLOSE_CODE, "Cancelled by receiver")
        .await;
    discard(opened, session, ctx).await;

    // Let the sender's close reply arrive so the cancel frame is not lost to a reset.
    let _ = tokio::time::timeout(ctx.options.close_grace, async {
        while let Some(Ok(frame)) = reader.next().await {
            if matches!(frame, Message::Close(_)) {
                break;
            }
        }
    })
    .await;
}

async fn discard(opened: &OpenedStream, session: &mut TransferSession, ctx: &ReceiveContext) {
    if let Err(e) = ctx.storage.delete(opened.handle).await {
        tracing::warn!("Failed to remove partial {}: {}", opened.location.display(), e);
    }
    session.transition(TransferState::Cancelled);
    ctx.events.emit(Event::FileReceiveCancelled {
        name: session.file_name.clone(),
        bytes_received: session.bytes_transferred,
        expected: session.total_bytes,
    });
}
