//! Per-connection read and write loops.
//!
//! Each WebSocket is split in two. The read half stays on the upgrade task
//! and turns text frames into queued [`Message`]s. The write half is moved
//! into its own task which drains the connection's outbound channel, so a
//! slow socket never holds up a broadcast beyond the send timeout.
//!
//! A connection ends when the client closes, the transport fails, the writer
//! stops (for instance after the connection was evicted), or the server
//! shuts down. In every case the connection is removed from the registry
//! exactly once, after any close frame has been handed to the writer.

use crate::server::{
    session::{
        Hub,
        registry::{ClientHandle, OutboundFrame},
    },
    telemetry::{increment_frames_received, increment_frames_rejected},
};
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::{SinkExt, Stream, StreamExt, stream::SplitSink};
use huddle_core::{
    Error,
    error::{CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR},
    types::{ConnectionId, InboundFrame, Message},
};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// What the read half produced next.
#[derive(Debug)]
pub enum Received {
    /// A well-formed chat message.
    Frame(InboundFrame),
    /// The client closed the connection or the stream ended.
    Disconnected,
    /// A frame that is not a valid chat message. The connection stays open.
    Malformed(Error),
    /// The transport failed.
    Failed(axum::Error),
}

/// Reads until the next frame that matters to the relay.
///
/// Control frames are skipped; the WebSocket layer answers pings itself.
pub async fn next_received<S>(stream: &mut S) -> Received
where
    S: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            None | Some(Ok(WsMessage::Close(_))) => return Received::Disconnected,
            Some(Err(e)) => return Received::Failed(e),
            Some(Ok(WsMessage::Text(text))) => {
                return match InboundFrame::parse(text.as_str()) {
                    Ok(frame) => Received::Frame(frame),
                    Err(e) => Received::Malformed(e),
                };
            }
            Some(Ok(WsMessage::Binary(_))) => {
                return Received::Malformed(Error::MalformedFrame {
                    reason: "binary frames are not supported".to_string(),
                });
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
        }
    }
}

enum Exit {
    /// Close the socket with this frame, if any.
    Close(Option<CloseFrame>),
    /// The writer already finished; nothing left to send.
    WriterGone,
}

fn close_frame(code: u16, reason: &str) -> CloseFrame {
    CloseFrame {
        code,
        reason: reason.to_owned().into(),
    }
}

/// Drives one upgraded WebSocket until it ends.
#[tracing::instrument(name = "connection", skip_all, fields(id = %id))]
pub async fn handle_connection(
    id: ConnectionId,
    socket: WebSocket,
    hub: Arc<Hub>,
    outbound_buffer: usize,
    shutdown: CancellationToken,
) {
    let (sink, mut stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(outbound_buffer.max(1));
    let (close_tx, close_rx) = oneshot::channel();
    let mut writer = tokio::spawn(write_loop(id, sink, outbound_rx, close_rx));

    hub.registry.add(ClientHandle::new(id, outbound_tx));
    tracing::info!("Client connected ({} total)", hub.registry.len());

    let exit = read_loop(id, &mut stream, &hub, &shutdown, &mut writer).await;

    let writer = match exit {
        Exit::Close(frame) => {
            if let Some(frame) = frame {
                let _ = close_tx.send(frame);
            }
            Some(writer)
        }
        Exit::WriterGone => None,
    };

    let departure = hub.registry.remove(id).await;
    tracing::info!("Client disconnected ({departure:?})");

    if let Some(writer) = writer {
        if let Err(e) = writer.await {
            tracing::warn!("Writer task for {id} failed: {e}");
        }
    }
}

async fn read_loop<S>(
    id: ConnectionId,
    stream: &mut S,
    hub: &Hub,
    shutdown: &CancellationToken,
    writer: &mut JoinHandle<()>,
) -> Exit
where
    S: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    let going_away = || Exit::Close(Some(close_frame(CLOSE_GOING_AWAY, "server shutting down")));

    loop {
        let received = tokio::select! {
            biased;
            () = shutdown.cancelled() => return going_away(),
            _ = &mut *writer => return Exit::WriterGone,
            received = next_received(stream) => received,
        };

        match received {
            Received::Frame(frame) => {
                increment_frames_received();
                let message = Message::new(id, hub.conversation.session(), frame);
                let enqueued = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => return going_away(),
                    enqueued = hub.queue.enqueue(message) => enqueued,
                };
                match enqueued {
                    Ok(()) => {}
                    Err(Error::QueueFull) => {
                        increment_frames_rejected();
                        tracing::warn!("Inbound queue full; dropped message from {id}");
                    }
                    Err(e) => {
                        return Exit::Close(Some(close_frame(e.close_code(), "server shutting down")));
                    }
                }
            }
            Received::Malformed(e) => {
                increment_frames_rejected();
                tracing::warn!("Rejected frame from {id}: {e}");
            }
            Received::Disconnected => return Exit::Close(None),
            Received::Failed(e) => {
                tracing::warn!("Transport error on {id}: {e}");
                return Exit::Close(Some(close_frame(CLOSE_INTERNAL_ERROR, "transport error")));
            }
        }
    }
}

/// Forwards outbound frames to the socket until told to close.
///
/// Ends when a close frame arrives, the outbound channel is dropped (the
/// connection left the registry), or the socket rejects a write.
async fn write_loop(
    id: ConnectionId,
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    mut close: oneshot::Receiver<CloseFrame>,
) {
    loop {
        tokio::select! {
            biased;
            frame = &mut close => {
                if let Ok(frame) = frame {
                    tracing::debug!("Closing {id} with code {}", frame.code);
                    let _ = sink.send(WsMessage::Close(Some(frame))).await;
                }
                break;
            }
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        tracing::debug!("Write to {id} failed: {e}");
                        break;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
        }
    }
}
