//! Relay server: accept loop and per-connection channel tasks.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Upgrading each accepted connection to a WebSocket.
//! 3. Running the handshake: the first frame must be `Pair` or `Resume`
//!    within `handshake_timeout`.
//! 4. Driving the established channel:
//!    - **Reader**: decodes frames from the phone; prompts go to the
//!      session's inbox, acks and heartbeats only refresh liveness.
//!    - **Writer**: a separate task draining a bounded `mpsc` queue of
//!      frames, so the router and the heartbeat never touch the socket.
//!    - **Heartbeat**: every `heartbeat_interval` sends our high-water mark
//!      and checks that the phone has not been silent for
//!      `missed_heartbeats` intervals.
//! 5. Reporting how the channel ended to the [`RelayService`], which decides
//!    between "wait for a resume" and "session over".
//! 6. Stopping the accept loop when the `running` flag is cleared.
//!
//! # Why one writer task?
//!
//! A WebSocket sink can only be used by one writer at a time.  Instead of
//! sharing it behind a mutex, every producer (handshake replies, router acks,
//! heartbeats, the registry's `Superseded` notice) pushes a [`Frame`] onto
//! the same queue, and the writer serialises them in order.
//!
//! Pairing codes and prompt text are never logged here.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_core::protocol::codec::MAX_FRAME_BYTES;
use relay_core::{
    decode_frame, encode_frame, ErrorCode, Frame, FrameBody, HeartbeatMonitor, Liveness,
    ProtocolError,
};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::application::session_registry::{ChannelLease, ClientInfo};
use crate::application::{now, CloseReason, PromptRejected, RelayService};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// How long the writer gets to flush its last frames after the channel ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that end a single channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The phone closed the socket or the stream ended.
    #[error("connection closed")]
    Closed,

    /// Nothing arrived in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The phone sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Pairing or resume was refused.
    #[error("rejected ({code:?}): {reason}")]
    Rejected { code: ErrorCode, reason: String },

    /// Transport-level WebSocket failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[source] WsError),
}

impl From<ProtocolError> for ChannelError {
    fn from(err: ProtocolError) -> Self {
        ChannelError::ProtocolViolation(err.to_string())
    }
}

impl From<WsError> for ChannelError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => ChannelError::Closed,
            other => ChannelError::WebSocket(other),
        }
    }
}

impl ChannelError {
    /// The `Error` frame that tells the phone why the channel is closing, if
    /// the phone is still there to read it.
    pub fn error_frame(&self) -> Option<Frame> {
        match self {
            ChannelError::ProtocolViolation(detail) => {
                Some(Frame::error(ErrorCode::ProtocolViolation, detail.clone()))
            }
            ChannelError::Rejected { code, reason } => Some(Frame::error(*code, reason.clone())),
            ChannelError::Timeout("handshake") => Some(Frame::error(
                ErrorCode::HandshakeTimeout,
                "expected Pair or Resume",
            )),
            ChannelError::Closed | ChannelError::Timeout(_) | ChannelError::WebSocket(_) => None,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// A bound relay listener.
///
/// Binding and running are separate steps so callers (and tests) can learn
/// the actual port before the loop starts, e.g. when binding port 0.
pub struct RelayServer {
    listener: TcpListener,
    service: Arc<RelayService>,
}

impl RelayServer {
    /// Binds the WebSocket listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is in use or not bindable.
    pub async fn bind(addr: SocketAddr, service: Arc<RelayService>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind relay listener on {addr}"))?;
        Ok(Self { listener, service })
    }

    /// The address actually bound.
    ///
    /// # Errors
    ///
    /// Propagates the OS error if the socket address cannot be read.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read relay listener address")
    }

    /// Runs the accept loop until `running` is set to `false`.
    ///
    /// Each accepted connection is handed to its own Tokio task, so one slow
    /// phone never blocks another.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; the `Result` leaves room for fatal
    /// listener errors.
    pub async fn run(self, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        info!("relay listening on {}", self.local_addr()?);

        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping accept loop");
                break;
            }

            // Short timeout so the shutdown flag is re-checked while idle.
            match timeout(Duration::from_millis(200), self.listener.accept()).await {
                Ok(Ok((stream, peer_addr))) => {
                    debug!("new connection from {peer_addr}");
                    let service = Arc::clone(&self.service);
                    tokio::spawn(async move {
                        handle_connection(stream, peer_addr, service).await;
                    });
                }
                Ok(Err(e)) => {
                    // Transient (e.g. too many open files); keep serving.
                    error!("accept error: {e}");
                }
                Err(_) => {}
            }
        }

        Ok(())
    }
}

// ── Per-connection handler ────────────────────────────────────────────────────

/// Wraps [`run_connection`] and logs the outcome.
async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, service: Arc<RelayService>) {
    match run_connection(stream, peer_addr, service).await {
        Ok(()) => info!("connection {peer_addr} closed"),
        Err(ChannelError::Closed) => info!("connection {peer_addr} closed by peer"),
        Err(e) => warn!("connection {peer_addr} closed: {e}"),
    }
}

/// Runs one connection from WebSocket upgrade to teardown.
async fn run_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: Arc<RelayService>,
) -> Result<(), ChannelError> {
    let relay = service.settings().relay.clone();

    // ── Step 1: WebSocket upgrade ─────────────────────────────────────────────
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_FRAME_BYTES);
    ws_config.max_frame_size = Some(MAX_FRAME_BYTES);
    let ws_stream = timeout(
        relay.handshake_timeout,
        accept_async_with_config(stream, Some(ws_config)),
    )
    .await
    .map_err(|_| ChannelError::Timeout("WebSocket upgrade"))??;

    let (sink, mut source) = ws_stream.split();
    let (tx, rx) = mpsc::channel::<Frame>(relay.outbound_queue.max(1));
    let mut writer = tokio::spawn(write_frames(sink, rx, peer_addr));

    // ── Step 2: Pair / Resume ─────────────────────────────────────────────────
    let outcome = match handshake(&service, &mut source, &tx, peer_addr).await {
        Err(e) => Err(e),
        Ok(mut lease) => {
            // ── Step 3: Established channel ───────────────────────────────────
            let ended = drive_channel(&service, &mut lease, &mut source, &tx).await;
            let reason = close_reason(&ended);
            debug!(
                "session {}: channel {} ended ({reason:?})",
                lease.session_id, lease.generation
            );
            service.channel_closed(&lease, reason).await;
            ended.map(|_| ())
        }
    };

    // ── Step 4: Tell the phone why, then let the writer drain ────────────────
    if let Err(e) = &outcome {
        if let Some(frame) = e.error_frame() {
            let _ = tx.try_send(frame);
        }
    }
    drop(tx);
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!("connection {peer_addr}: writer did not drain in time");
        writer.abort();
    }

    outcome
}

/// How the session is told about a channel that ended with `ended`.
fn close_reason(ended: &Result<CloseReason, ChannelError>) -> CloseReason {
    match ended {
        Ok(reason) => *reason,
        Err(ChannelError::Timeout(_)) => CloseReason::Stale,
        Err(_) => CloseReason::Transport,
    }
}

/// Reads the first frame and turns it into a channel lease.
///
/// Only the read is bounded by `handshake_timeout`.  Once a frame is in,
/// pairing runs to completion: cancelling it between consuming the code and
/// attaching the channel would strand the new session.
async fn handshake(
    service: &Arc<RelayService>,
    source: &mut WsSource,
    tx: &mpsc::Sender<Frame>,
    peer_addr: SocketAddr,
) -> Result<ChannelLease, ChannelError> {
    let text = timeout(service.settings().relay.handshake_timeout, next_text(source))
        .await
        .map_err(|_| ChannelError::Timeout("handshake"))??;
    let frame = decode_frame(&text)?;
    let frame_type = frame.frame_type();

    match frame.body {
        FrameBody::Pair {
            code,
            client_name,
            client_id,
        } => {
            let client = ClientInfo {
                name: client_name,
                peer_addr,
                client_id,
            };
            service
                .pair(&code, client, tx.clone())
                .await
                .map_err(|e| ChannelError::Rejected {
                    code: e.error_code(),
                    reason: e.to_string(),
                })
        }
        FrameBody::Resume => {
            let session_id = frame.session_id.ok_or_else(|| {
                ChannelError::ProtocolViolation("Resume frame without sessionId".to_string())
            })?;
            debug!(
                "session {session_id}: resume from {peer_addr} (phone acked through {})",
                frame.seq
            );
            service
                .resume(session_id, tx.clone())
                .await
                .map_err(|e| ChannelError::Rejected {
                    code: ErrorCode::UnknownSession,
                    reason: e.to_string(),
                })
        }
        _ => Err(ChannelError::ProtocolViolation(format!(
            "expected Pair or Resume, got {frame_type:?}"
        ))),
    }
}

/// Runs reader and heartbeat for an attached channel until it ends.
async fn drive_channel(
    service: &Arc<RelayService>,
    lease: &mut ChannelLease,
    source: &mut WsSource,
    tx: &mpsc::Sender<Frame>,
) -> Result<CloseReason, ChannelError> {
    let relay = &service.settings().relay;
    let session_id = lease.session_id;
    let mut monitor =
        HeartbeatMonitor::new(relay.heartbeat_interval, relay.missed_heartbeats, now());
    let mut ticker = interval_at(
        tokio::time::Instant::now() + relay.heartbeat_interval,
        relay.heartbeat_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Fires when a newer connection resumed the session, or when the
            // session was removed from under us.
            _ = &mut lease.superseded => {
                return Ok(CloseReason::Superseded);
            }

            _ = ticker.tick() => {
                match monitor.check(now()) {
                    Liveness::Stale => {
                        warn!("session {session_id}: no frames for {} heartbeat intervals", relay.missed_heartbeats);
                        return Err(ChannelError::Timeout("heartbeat"));
                    }
                    Liveness::Missed(n) => debug!("session {session_id}: {n} heartbeat(s) missed"),
                    Liveness::Alive => {}
                }
                if tx.try_send(Frame::heartbeat(lease.delivered_through())).is_err() {
                    debug!("session {session_id}: writer busy, heartbeat skipped");
                }
            }

            incoming = next_text(source) => {
                let text = incoming?;
                monitor.record(now());
                let frame = decode_frame(&text)?;

                match frame.body {
                    FrameBody::Prompt { text } => {
                        service
                            .accept_prompt(lease, frame.seq, text)
                            .await
                            .map_err(|e| match e {
                                PromptRejected::SessionClosed => ChannelError::Closed,
                                e @ PromptRejected::TooFarAhead { .. } => {
                                    ChannelError::ProtocolViolation(e.to_string())
                                }
                            })?;
                    }
                    FrameBody::Ack | FrameBody::Heartbeat => service.touch(lease).await,
                    FrameBody::Disconnect => {
                        info!("session {session_id}: phone disconnected");
                        return Ok(CloseReason::ClientDisconnect);
                    }
                    _ => {
                        return Err(ChannelError::ProtocolViolation(format!(
                            "{:?} is not allowed on an established channel",
                            frame.frame_type()
                        )));
                    }
                }
            }
        }
    }
}

/// Returns the next text message, skipping WebSocket-level pings and pongs.
async fn next_text(source: &mut WsSource) -> Result<String, ChannelError> {
    loop {
        match source.next().await {
            Some(Ok(WsMessage::Text(text))) => return Ok(text),
            Some(Ok(WsMessage::Binary(_))) => {
                return Err(ChannelError::ProtocolViolation(
                    "binary frames are not part of the protocol".to_string(),
                ))
            }
            Some(Ok(WsMessage::Close(_))) | None => return Err(ChannelError::Closed),
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Drains the outbound queue onto the socket until every sender is gone.
///
/// An `Error` frame is always the last thing written.
async fn write_frames(mut sink: WsSink, mut rx: mpsc::Receiver<Frame>, peer_addr: SocketAddr) {
    while let Some(frame) = rx.recv().await {
        let text = match encode_frame(&frame) {
            Ok(text) => text,
            Err(e) => {
                error!("connection {peer_addr}: failed to encode {:?}: {e}", frame.frame_type());
                continue;
            }
        };
        let terminal = matches!(frame.body, FrameBody::Error { .. });

        if let Err(e) = sink.send(WsMessage::Text(text)).await {
            debug!("connection {peer_addr}: send failed: {e}");
            return;
        }
        if terminal {
            break;
        }
    }
    let _ = sink.close().await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
