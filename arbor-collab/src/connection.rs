//! One task per WebSocket: decode, dispatch, fan out, keep alive.
//!
//! ```text
//!            ┌─────────── select! ───────────┐
//! socket ──► │ frame  → SharedDoc::handle    │ ──► reply ──┐
//! group  ──► │ frame from another connection │ ────────────┤ bounded queue
//! timer  ──► │ heartbeat: ping / timeout     │ ──► ping ───┤
//!            └───────────────────────────────┘             ▼
//!                     │                             writer task ──► socket
//!                     │ close, timeout, lag, stall, send error, error budget
//!                     ▼
//!            registry.detach → awareness purge, flush on last detach
//! ```
//!
//! Frames are handled strictly in arrival order. The loop itself never
//! awaits a socket write, so a peer that stops reading still misses its
//! heartbeat and gets dropped.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::ConnId;
use crate::doc::SharedDoc;
use crate::protocol::{Message, ProtocolError, SyncMessage};
use crate::registry::DocumentRegistry;

/// What to do with frames that fail to decode or apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeErrorPolicy {
    /// Log and keep the connection.
    #[default]
    Lenient,
    /// Disconnect once `max_errors` frames have failed.
    Strict { max_errors: u32 },
}

impl DecodeErrorPolicy {
    fn exhausted(&self, errors: u32) -> bool {
        match self {
            DecodeErrorPolicy::Lenient => false,
            DecodeErrorPolicy::Strict { max_errors } => errors >= *max_errors,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub ping_interval: Duration,
    pub decode_policy: DecodeErrorPolicy,
    /// Frames waiting for the socket before the peer counts as stalled.
    pub send_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            decode_policy: DecodeErrorPolicy::Lenient,
            send_queue: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or end of stream.
    PeerClosed,
    /// No pong since the previous ping.
    Timeout,
    /// Fell behind the broadcast buffer by this many frames.
    Lagged(u64),
    /// Outgoing queue full: the peer stopped reading.
    Stalled,
    SendFailed,
    Transport,
    TooManyErrors,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub reason: CloseReason,
    pub frames_in: u64,
    pub bytes_in: u64,
    pub decode_errors: u32,
}

/// Serve `ws` as connection `conn` of room `room` until it ends, then
/// detach it.
pub async fn run_connection<S>(
    ws: WebSocketStream<S>,
    conn: ConnId,
    room: &str,
    registry: Arc<DocumentRegistry>,
    config: &ConnectionConfig,
) -> ConnectionSummary
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let doc = registry.attach(room, conn).await;
    log::info!("Connection {} joined room {}", conn, room);

    let summary = drive(ws, conn, &doc, config).await;
    match summary.reason {
        CloseReason::PeerClosed => log::info!("Connection {} left room {}", conn, room),
        reason => log::warn!("Connection {} dropped from room {}: {:?}", conn, room, reason),
    }

    registry.detach(&doc, conn).await;
    summary
}

async fn drive<S>(
    ws: WebSocketStream<S>,
    conn: ConnId,
    doc: &Arc<SharedDoc>,
    config: &ConnectionConfig,
) -> ConnectionSummary
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Subscribe before the greeting so no update slips between them.
    let mut outbound = doc.group().subscribe();
    let (sink, mut stream) = ws.split();
    let (out_tx, out_rx) = mpsc::channel(config.send_queue.max(2));
    let mut writer = spawn_writer(conn, sink, out_rx);

    let mut summary = ConnectionSummary {
        reason: CloseReason::PeerClosed,
        frames_in: 0,
        bytes_in: 0,
        decode_errors: 0,
    };

    let period = config.ping_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_received = true;
    let mut phase = Phase::Handshake;

    let greeting = doc
        .initial_messages()
        .into_iter()
        .try_for_each(|msg| enqueue(&out_tx, binary(msg.encode())));

    let reason = match greeting {
        Err(reason) => reason,
        Ok(()) => loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(WsMessage::Binary(data))) => {
                        summary.frames_in += 1;
                        summary.bytes_in += data.len() as u64;

                        let reply = Message::decode(&data).and_then(|msg| {
                            if phase == Phase::Handshake
                                && matches!(msg, Message::Sync(SyncMessage::Step1(_) | SyncMessage::Step2(_)))
                            {
                                phase = Phase::Synced;
                                log::debug!("Connection {} synced with room {}", conn, doc.name());
                            }
                            doc.handle(conn, msg)
                        });
                        match reply {
                            Ok(Some(reply)) => {
                                if let Err(reason) = enqueue(&out_tx, binary(reply.encode())) {
                                    break reason;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                summary.decode_errors += 1;
                                log_rejected(conn, doc.name(), &e);
                                if config.decode_policy.exhausted(summary.decode_errors) {
                                    break CloseReason::TooManyErrors;
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => pong_received = true,
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(reason) = enqueue(&out_tx, WsMessage::Pong(data)) {
                            break reason;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break CloseReason::PeerClosed,
                    Some(Ok(other)) => {
                        log::debug!("Connection {}: ignoring non-binary frame ({} bytes)", conn, other.len());
                    }
                    Some(Err(e)) => {
                        log::debug!("Connection {}: transport error: {}", conn, e);
                        break CloseReason::Transport;
                    }
                },

                frame = outbound.recv() => match frame {
                    Ok(out) if out.is_from(conn) => {}
                    Ok(out) => {
                        if let Err(reason) = enqueue(&out_tx, binary(out.frame.clone())) {
                            break reason;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        doc.group().record_lag(missed);
                        break CloseReason::Lagged(missed);
                    }
                    // The document outlives every attached connection.
                    Err(RecvError::Closed) => break CloseReason::PeerClosed,
                },

                _ = heartbeat.tick() => {
                    if !pong_received {
                        break CloseReason::Timeout;
                    }
                    pong_received = false;
                    if let Err(reason) = enqueue(&out_tx, WsMessage::Ping(Vec::<u8>::new().into())) {
                        break reason;
                    }
                }
            }
        },
    };

    // Closing the queue lets the writer flush and send a close frame. A
    // peer that stopped reading would hold it forever, so it is cut off.
    drop(out_tx);
    match reason {
        CloseReason::Timeout | CloseReason::Stalled => writer.abort(),
        _ => {
            if timeout(period, &mut writer).await.is_err() {
                writer.abort();
            }
        }
    }
    summary.reason = reason;
    summary
}

fn binary(frame: Vec<u8>) -> WsMessage {
    WsMessage::Binary(frame.into())
}

fn enqueue(outgoing: &mpsc::Sender<WsMessage>, msg: WsMessage) -> Result<(), CloseReason> {
    outgoing.try_send(msg).map_err(|e| match e {
        TrySendError::Full(_) => CloseReason::Stalled,
        TrySendError::Closed(_) => CloseReason::SendFailed,
    })
}

/// Forward queued frames to the socket until the queue closes or a write
/// fails, then close the socket.
fn spawn_writer<S>(
    conn: ConnId,
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut queue: mpsc::Receiver<WsMessage>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = queue.recv().await {
            if let Err(e) = sink.send(msg).await {
                log::debug!("Connection {}: write failed: {}", conn, e);
                return;
            }
        }
        let _ = sink.close().await;
    })
}

fn log_rejected(conn: ConnId, room: &str, error: &ProtocolError) {
    match error {
        ProtocolError::Document(e) => {
            log::warn!("Connection {} sent an update room {} rejected: {}", conn, room, e)
        }
        e => log::warn!("Connection {}: undecodable frame: {}", conn, e),
    }
}
