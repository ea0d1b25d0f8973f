//! Sending side of the transfer protocol.
//!
//! The producer reads chunks from storage and queues frames for a writer
//! task. Bytes queued but not yet written are counted; above the high-water
//! mark the producer stops reading and polls until the writer catches up. A
//! reader task watches for the receiver's close frame so a cancel (code 4001)
//! is seen even while the producer is paused.
//!
//! A send that stops early aborts the writer: binary frames still queued are
//! dropped, so the close frame follows the frame in flight and the receiver
//! never sees the whole body.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::protocol::{FileMeta, ProgressThrottle};
use super::{TransferDirection, TransferOptions, TransferProgress};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::file::{OutgoingFile, Storage, StorageHandle};
use crate::state::SharedState;
use crate::transport::{self, close_message, is_disconnect};
use crate::CANCEL_CLOSE_CODE;

/// Close code of a finished send; the receiver echoes it back to confirm.
const NORMAL_CLOSE_CODE: u16 = 1000;

/// What the receiver has said about the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerClose {
    Open,
    Closed(Option<u16>),
}

/// Everything one file send needs.
pub(super) struct SendContext<'a> {
    pub state: &'a SharedState,
    pub storage: &'a dyn Storage,
    pub events: &'a EventBus,
    pub options: &'a TransferOptions,
}

/// Send one file over its own connection.
///
/// `index` is the file's 0-based position in a queue of `total`, as it goes
/// on the wire. Returns the number of bytes sent once the receiver has
/// closed normally.
pub(super) async fn send_file(
    addr: SocketAddr,
    file: &OutgoingFile,
    index: u32,
    total: u32,
    ctx: &SendContext<'_>,
) -> Result<u64> {
    let (sink, mut stream) = transport::dial(addr).await?;
    let peer = addr.ip();
    let name = file.display_name().to_string();

    let (close_tx, close_rx) = watch::channel(PeerClose::Open);
    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Close(frame)) => {
                    let code = frame.map(|f| u16::from(f.code));
                    let _ = close_tx.send(PeerClose::Closed(code));
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    if !is_disconnect(&e) {
                        tracing::debug!("Transfer connection error: {}", e);
                    }
                    break;
                }
            }
        }
        let _ = close_tx.send(PeerClose::Closed(None));
    });

    let buffered = Arc::new(AtomicU64::new(0));
    let aborted = Arc::new(AtomicBool::new(false));
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(drain_frames(
        sink,
        frame_rx,
        Arc::clone(&buffered),
        Arc::clone(&aborted),
    ));

    let meta = FileMeta {
        name: file.name.clone(),
        size: Some(file.size),
        index: Some(index),
        total: Some(total),
        relative_path: file.relative_path.clone(),
    };

    ctx.events.emit(Event::FileSending {
        name: name.clone(),
        size: file.size,
        index,
        total,
        to: peer,
    });

    let produced = match (Producer {
        frame_tx: &frame_tx,
        buffered: &buffered,
        close_rx: &close_rx,
        ctx,
        peer,
        name: &name,
    })
    .run(&meta, file)
    .await
    {
        Ok(sent) => {
            let _ = frame_tx.send(close_message(NORMAL_CLOSE_CODE, "Transfer complete"));
            Ok(sent)
        }
        Err(e) => {
            aborted.store(true, Ordering::Release);
            if matches!(e, Error::CancelledByLocal { .. }) {
                let _ = frame_tx.send(Message::Close(None));
            }
            Err(e)
        }
    };
    drop(frame_tx);

    let write_result = writer
        .await
        .unwrap_or_else(|e| Err(Error::Internal(e.to_string())));
    let limit = produced.is_err().then_some(ctx.options.close_grace);
    let remote = wait_for_close(close_rx, limit).await;
    reader.abort();

    match (produced, remote) {
        (_, PeerClose::Closed(Some(CANCEL_CLOSE_CODE))) => {
            tracing::info!("{} cancelled by receiver", name);
            Err(Error::CancelledByRemote { file: name })
        }
        (Err(e), _) => Err(e),
        (Ok(sent), PeerClose::Closed(Some(_))) if write_result.is_ok() => {
            tracing::info!("Sent {} ({} bytes) to {}", name, sent, peer);
            ctx.events.emit(Event::FileSent {
                name,
                size: sent,
                to: peer,
            });
            Ok(sent)
        }
        (Ok(_), _) => Err(connection_lost(
            peer,
            &write_result.err().map_or_else(
                || "connection dropped before the receiver confirmed".to_string(),
                |e| e.to_string(),
            ),
        )),
    }
}

struct Producer<'a, 'c> {
    frame_tx: &'a mpsc::UnboundedSender<Message>,
    buffered: &'a AtomicU64,
    close_rx: &'a watch::Receiver<PeerClose>,
    ctx: &'a SendContext<'c>,
    peer: IpAddr,
    name: &'a str,
}

impl Producer<'_, '_> {
    async fn run(&self, meta: &FileMeta, file: &OutgoingFile) -> Result<u64> {
        self.enqueue(Message::text(meta.encode()?))?;

        let handle = self.ctx.storage.open_read_stream(&file.source).await?;
        let result = self.stream_body(handle, file.size).await;
        if let Err(e) = self.ctx.storage.close(handle).await {
            tracing::debug!("Failed to close {}: {}", file.source.display(), e);
        }
        result
    }

    async fn stream_body(&self, handle: StorageHandle, size: u64) -> Result<u64> {
        let options = self.ctx.options;
        let mut throttle = ProgressThrottle::new(Some(size), options.progress_interval);
        let mut offset = 0u64;

        loop {
            self.check_interrupted()?;

            while self.buffered.load(Ordering::Acquire) > options.high_water_mark {
                tokio::time::sleep(options.drain_poll_interval).await;
                self.check_interrupted()?;
            }

            let chunk = self
                .ctx
                .storage
                .read_chunk(handle, offset, options.chunk_size)
                .await?;
            if chunk.is_empty() {
                break;
            }

            let len = chunk.len() as u64;
            self.buffered.fetch_add(len, Ordering::AcqRel);
            self.enqueue(Message::binary(chunk))?;
            offset += len;
            let finished = offset >= size;

            if throttle.update(offset) {
                self.ctx
                    .events
                    .emit(Event::TransferProgress(TransferProgress::new(
                        TransferDirection::Send,
                        self.peer,
                        self.name,
                        offset,
                        size,
                    )));
            }
            // The whole body is queued; a cancel from here on is too late.
            if finished {
                break;
            }
        }

        Ok(offset)
    }

    fn check_interrupted(&self) -> Result<()> {
        if self.ctx.state.send_cancelled() {
            tracing::info!("Sending {} cancelled", self.name);
            return Err(Error::CancelledByLocal {
                file: self.name.to_string(),
            });
        }
        match *self.close_rx.borrow() {
            PeerClose::Open => Ok(()),
            PeerClose::Closed(Some(CANCEL_CLOSE_CODE)) => Err(Error::CancelledByRemote {
                file: self.name.to_string(),
            }),
            PeerClose::Closed(code) => Err(connection_lost(
                self.peer,
                &code.map_or_else(
                    || "connection closed".to_string(),
                    |c| format!("closed by receiver with code {c}"),
                ),
            )),
        }
    }

    fn enqueue(&self, msg: Message) -> Result<()> {
        self.frame_tx
            .send(msg)
            .map_err(|_| connection_lost(self.peer, "transport closed"))
    }
}

/// Write queued frames until the queue closes or a write fails.
///
/// Once `aborted` is set, binary frames still in the queue are dropped
/// unsent.
async fn drain_frames<S>(
    mut sink: S,
    mut frames: mpsc::UnboundedReceiver<Message>,
    buffered: Arc<AtomicU64>,
    aborted: Arc<AtomicBool>,
) -> Result<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(msg) = frames.recv().await {
        let len = match &msg {
            Message::Binary(data) => data.len() as u64,
            _ => 0,
        };
        if len > 0 && aborted.load(Ordering::Acquire) {
            buffered.fetch_sub(len, Ordering::AcqRel);
            continue;
        }
        let is_close = matches!(msg, Message::Close(_));
        let sent = sink.send(msg).await;
        buffered.fetch_sub(len, Ordering::AcqRel);
        sent?;
        if is_close {
            break;
        }
    }
    Ok(())
}

/// Wait for the receiver's close frame, for at most `limit` when given.
async fn wait_for_close(
    mut close_rx: watch::Receiver<PeerClose>,
    limit: Option<std::time::Duration>,
) -> PeerClose {
    let closed = close_rx.wait_for(|c| *c != PeerClose::Open);
    let verdict = match limit {
        Some(limit) => tokio::time::timeout(limit, closed)
            .await
            .ok()
            .and_then(|r| r.ok().map(|c| *c)),
        None => closed.await.ok().map(|c| *c),
    };
    verdict.unwrap_or_else(|| *close_rx.borrow())
}

fn connection_lost(peer: IpAddr, reason: &str) -> Error {
    Error::ConnectionLost {
        peer: peer.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::file::FsStorage;

    /// Queue three 4-byte body frames and a close, then run the writer.
    async fn drain_queued_body(aborted: bool) -> (Vec<Message>, u64) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        for _ in 0..3 {
            frame_tx.send(Message::binary(vec![1u8; 4])).unwrap();
        }
        frame_tx.send(Message::Close(None)).unwrap();

        let buffered = Arc::new(AtomicU64::new(12));
        let (sink, written) = futures::channel::mpsc::unbounded();
        drain_frames(
            sink.sink_map_err(|_| WsError::ConnectionClosed),
            frame_rx,
            Arc::clone(&buffered),
            Arc::new(AtomicBool::new(aborted)),
        )
        .await
        .unwrap();
        (written.collect().await, buffered.load(Ordering::Acquire))
    }

    #[tokio::test]
    async fn test_writer_flushes_whole_queue() {
        let (written, buffered) = drain_queued_body(false).await;
        assert_eq!(written.len(), 4);
        assert_eq!(written[3], Message::Close(None));
        assert_eq!(buffered, 0);
    }

    #[tokio::test]
    async fn test_aborted_writer_drops_queued_body() {
        let (written, buffered) = drain_queued_body(true).await;
        assert_eq!(written, vec![Message::Close(None)]);
        assert_eq!(buffered, 0);
    }

    #[tokio::test]
    async fn test_producer_pauses_at_high_water_mark() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.bin");
        let size = 1024 * 1024u64;
        std::fs::write(&path, vec![7u8; 1024 * 1024]).unwrap();

        let options = TransferOptions {
            chunk_size: 64 * 1024,
            high_water_mark: 256 * 1024,
            drain_poll_interval: Duration::from_millis(1),
            ..TransferOptions::default()
        };
        let limit = options.high_water_mark + options.chunk_size as u64;
        let state = SharedState::new(dir.path());
        let storage = FsStorage::new();
        let events = EventBus::default();
        let ctx = SendContext {
            state: &state,
            storage: &storage,
            events: &events,
            options: &options,
        };

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let buffered = AtomicU64::new(0);
        let (_close_tx, close_rx) = watch::channel(PeerClose::Open);
        let producer = Producer {
            frame_tx: &frame_tx,
            buffered: &buffered,
            close_rx: &close_rx,
            ctx: &ctx,
            peer: "127.0.0.1".parse().unwrap(),
            name: "body.bin",
        };
        let handle = storage.open_read_stream(&path).await.unwrap();

        let consumer = async {
            // Nothing is written yet, so the producer has to stall.
            tokio::time::sleep(Duration::from_millis(200)).await;
            let stalled_at = buffered.load(Ordering::Acquire);

            let mut written = 0u64;
            while written < size {
                let Some(msg) = frame_rx.recv().await else {
                    break;
                };
                if let Message::Binary(data) = msg {
                    let len = data.len() as u64;
                    let queued = buffered.fetch_sub(len, Ordering::AcqRel);
                    assert!(queued <= limit, "{queued} bytes queued, limit {limit}");
                    written += len;
                    // A slow link: one chunk per poll interval.
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            }
            (stalled_at, written)
        };

        let (sent, (stalled_at, written)) =
            tokio::join!(producer.stream_body(handle, size), consumer);
        assert_eq!(sent.unwrap(), size);
        assert_eq!(written, size);
        assert!(
            stalled_at > options.high_water_mark && stalled_at <= limit,
            "stalled with {stalled_at} bytes queued"
        );
    }
}
