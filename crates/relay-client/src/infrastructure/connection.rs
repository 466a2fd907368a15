//! WebSocket connection driver for the relay client.
//!
//! Architecture:
//! - [`RelayClient`] is a cheap handle; every call becomes a [`Command`] on
//!   an `mpsc` queue.
//! - One driver task owns the [`ClientSession`] and the socket.  It connects,
//!   sends the handshake, and then selects over commands, inbound frames and
//!   its heartbeat timer.
//! - When the socket drops, the driver waits `reconnect_interval` and
//!   connects again with `Resume`.  Prompts submitted meanwhile are numbered
//!   and queued in the outbox, so nothing typed offline is lost.
//! - Events for the application arrive on the receiver returned by
//!   [`RelayClient::start`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_core::{decode_frame, encode_frame, Frame, HeartbeatMonitor, Liveness, PairingPayload};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::{ClientEvent, ClientIdentity, ClientSession};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors returned by [`RelayClient`] calls.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Too many prompts are waiting for acknowledgement.
    #[error(transparent)]
    OutboxFull(#[from] relay_core::OutboxError),

    /// The driver task has stopped (session ended or client disconnected).
    #[error("relay client is stopped")]
    Stopped,
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port` of the relay host.
    pub url: String,
    /// Pairing code from the QR payload.
    pub code: String,
    pub client_name: Option<String>,
    /// Stable id for this install; a fresh UUID by default.
    pub client_id: String,
    pub heartbeat_interval: Duration,
    /// Host silence, in heartbeat intervals, before the socket is dropped.
    pub missed_heartbeats: u32,
    pub reconnect_interval: Duration,
    /// Consecutive failed connects before giving up.
    pub max_reconnect_attempts: u32,
    pub outbox_capacity: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            code: code.into(),
            client_name: None,
            client_id: Uuid::new_v4().to_string(),
            heartbeat_interval: Duration::from_secs(10),
            missed_heartbeats: 3,
            reconnect_interval: Duration::from_secs(2),
            max_reconnect_attempts: 30,
            outbox_capacity: 256,
        }
    }

    /// Settings for the host and code named in a scanned pairing payload.
    pub fn from_payload(payload: &PairingPayload) -> Self {
        Self::new(payload.ws_url(), payload.code.as_str())
    }
}

#[derive(Debug)]
enum Command {
    Prompt {
        text: String,
        reply: oneshot::Sender<Result<u64, ClientError>>,
    },
    DropConnection,
    Disconnect,
}

/// Handle to a running relay client.
#[derive(Debug)]
pub struct RelayClient {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl RelayClient {
    /// Starts the driver task and returns the handle plus the event stream.
    pub fn start(config: ClientConfig) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (commands, command_rx) = mpsc::channel(64);
        let (events, event_rx) = mpsc::channel(256);
        let task = tokio::spawn(drive(config, command_rx, events));
        (Self { commands, task }, event_rx)
    }

    /// Numbers `text` and sends it, or queues it until the connection is
    /// back.  Returns its sequence number.
    ///
    /// # Errors
    ///
    /// [`ClientError::OutboxFull`] or [`ClientError::Stopped`].
    pub async fn send_prompt(&self, text: impl Into<String>) -> Result<u64, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Prompt {
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)?
    }

    /// Closes the socket without a `Disconnect`, as a lost network would.
    /// The client reconnects and resumes on its own.
    ///
    /// # Errors
    ///
    /// [`ClientError::Stopped`] if the driver is gone.
    pub async fn drop_connection(&self) -> Result<(), ClientError> {
        self.commands
            .send(Command::DropConnection)
            .await
            .map_err(|_| ClientError::Stopped)
    }

    /// Ends the session: sends `Disconnect` and waits for the driver to stop.
    pub async fn disconnect(self) {
        let _ = self.commands.send(Command::Disconnect).await;
        if let Err(e) = self.task.await {
            warn!("relay client task failed: {e}");
        }
    }
}

// ── Driver ────────────────────────────────────────────────────────────────────

/// How one connection ended.
enum Ended {
    /// Socket lost; reconnect.
    Dropped(String),
    /// Session over; stop.
    Finished(String),
}

async fn drive(
    config: ClientConfig,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ClientEvent>,
) {
    let identity = ClientIdentity {
        client_id: config.client_id.clone(),
        name: config.client_name.clone(),
    };
    let mut session = ClientSession::new(config.code.clone(), identity, config.outbox_capacity);
    let mut failures = 0u32;

    loop {
        match connect_async(config.url.as_str()).await {
            Ok((socket, _)) => {
                failures = 0;
                info!("connected to {}", config.url);
                let ended = run_connection(&config, &mut session, socket, &mut commands, &events).await;
                session.transport_lost();
                match ended {
                    Ended::Finished(reason) => {
                        info!("session ended: {reason}");
                        let _ = events.send(ClientEvent::Ended { reason }).await;
                        return;
                    }
                    Ended::Dropped(reason) => {
                        info!("connection lost ({reason}); reconnecting in {:?}", config.reconnect_interval);
                        let _ = events.send(ClientEvent::Disconnected { reason }).await;
                    }
                }
            }
            Err(e) => {
                failures += 1;
                warn!("could not connect to {} (attempt {failures}): {e}", config.url);
                if failures >= config.max_reconnect_attempts {
                    let reason = format!("gave up after {failures} connection attempts");
                    let _ = events.send(ClientEvent::Ended { reason }).await;
                    return;
                }
            }
        }

        if !wait_offline(&config, &mut session, &mut commands).await {
            return;
        }
    }
}

/// Sleeps `reconnect_interval` while still accepting prompts.
///
/// Returns `false` when the client should stop instead of reconnecting.
async fn wait_offline(
    config: &ClientConfig,
    session: &mut ClientSession,
    commands: &mut mpsc::Receiver<Command>,
) -> bool {
    let pause = tokio::time::sleep(config.reconnect_interval);
    tokio::pin!(pause);

    loop {
        tokio::select! {
            _ = &mut pause => return true,
            command = commands.recv() => match command {
                Some(Command::Prompt { text, reply }) => {
                    let result = session.queue_prompt(text).map(|(seq, _)| seq).map_err(ClientError::from);
                    let _ = reply.send(result);
                }
                Some(Command::DropConnection) => {}
                Some(Command::Disconnect) | None => return false,
            },
        }
    }
}

/// Drives one socket from handshake until it ends.
async fn run_connection(
    config: &ClientConfig,
    session: &mut ClientSession,
    socket: Socket,
    commands: &mut mpsc::Receiver<Command>,
    events: &mpsc::Sender<ClientEvent>,
) -> Ended {
    let (mut sink, mut stream) = socket.split();

    let handshake = session.handshake();
    if let Err(reason) = send(&mut sink, &handshake).await {
        return Ended::Dropped(reason);
    }

    let mut monitor = HeartbeatMonitor::new(
        config.heartbeat_interval,
        config.missed_heartbeats,
        Instant::now().into_std(),
    );
    let mut ticker = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Prompt { text, reply }) => {
                    match session.queue_prompt(text) {
                        Ok((seq, frame)) => {
                            let _ = reply.send(Ok(seq));
                            if let Some(frame) = frame {
                                if let Err(reason) = send(&mut sink, &frame).await {
                                    return Ended::Dropped(reason);
                                }
                            }
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e.into()));
                        }
                    }
                }
                Some(Command::DropConnection) => {
                    return Ended::Dropped("connection dropped on request".to_string());
                }
                Some(Command::Disconnect) | None => {
                    let _ = send(&mut sink, &Frame::disconnect()).await;
                    let _ = sink.close().await;
                    return Ended::Finished("disconnected by client".to_string());
                }
            },

            _ = ticker.tick() => {
                if monitor.check(Instant::now().into_std()) == Liveness::Stale {
                    return Ended::Dropped("host stopped responding".to_string());
                }
                if let Err(reason) = send(&mut sink, &session.heartbeat()).await {
                    return Ended::Dropped(reason);
                }
            }

            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return Ended::Dropped("host closed the connection".to_string());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Ended::Dropped(e.to_string()),
                };
                monitor.record(Instant::now().into_std());

                let frame = match decode_frame(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("undecodable frame from host: {e}");
                        continue;
                    }
                };

                match session.on_frame(frame) {
                    Ok(reaction) => {
                        for event in reaction.events {
                            let _ = events.send(event).await;
                        }
                        for frame in &reaction.send {
                            if let Err(reason) = send(&mut sink, frame).await {
                                return Ended::Dropped(reason);
                            }
                        }
                    }
                    Err(e) => return Ended::Finished(e.to_string()),
                }
            }
        }
    }
}

async fn send<S>(sink: &mut S, frame: &Frame) -> Result<(), String>
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = encode_frame(frame).map_err(|e| e.to_string())?;
    debug!("→ {:?} seq={}", frame.frame_type(), frame.seq);
    sink.send(WsMessage::Text(text)).await.map_err(|e| e.to_string())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
