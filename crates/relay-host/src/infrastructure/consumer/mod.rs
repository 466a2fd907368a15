//! Consumer adapters: where delivered prompts leave the host.
//!
//! The application layer only knows the [`PromptConsumer`] trait.  Two
//! implementations live here:
//!
//! - **[`JsonLinesConsumer`]** – writes one JSON object per line.  An editor
//!   extension spawns `relay-host serve` and reads its stdout; logs go to
//!   stderr so the stream stays machine-readable.
//! - **[`ChannelConsumer`]** – forwards events into a `tokio::mpsc` queue,
//!   for embedding the host in another process and for tests.
//!
//! # Event format
//!
//! ```json
//! {"event":"pairing","payload":{"address":"192.168.1.42","port":24900,"code":"309322"}}
//! {"event":"status","sessionId":"6f0c…","status":{"state":"Connected"}}
//! {"event":"prompt","sessionId":"6f0c…","seq":1,"text":"add a test for the parser"}
//! ```

use async_trait::async_trait;
use relay_core::{PairingPayload, SessionId, SessionStatus};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::application::PromptConsumer;

/// One line of the consumer stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConsumerEvent {
    /// A new pairing code is live; render `payload` as a QR code.
    Pairing { payload: PairingPayload },
    #[serde(rename_all = "camelCase")]
    Prompt {
        session_id: SessionId,
        seq: u64,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        session_id: SessionId,
        status: SessionStatus,
    },
}

// ── JSON lines ────────────────────────────────────────────────────────────────

/// Writes every event as a single line of JSON to `W`.
pub struct JsonLinesConsumer<W> {
    writer: Mutex<W>,
}

impl JsonLinesConsumer<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesConsumer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Announces a freshly issued pairing code.
    pub async fn emit_pairing(&self, payload: &PairingPayload) {
        self.emit(&ConsumerEvent::Pairing {
            payload: payload.clone(),
        })
        .await;
    }

    /// Serializes `event`, appends a newline, and flushes.
    ///
    /// A closed reader (the extension went away) is logged, not fatal: the
    /// phone keeps getting acks and the session state stays consistent.
    pub async fn emit(&self, event: &ConsumerEvent) {
        let mut line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("consumer event serialization failed: {e}");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!("consumer stream write failed: {e}");
        }
    }

    /// Gives back the writer, for inspecting what was written.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> PromptConsumer for JsonLinesConsumer<W> {
    async fn on_prompt_received(&self, session_id: SessionId, text: &str, seq: u64) {
        self.emit(&ConsumerEvent::Prompt {
            session_id,
            seq,
            text: text.to_string(),
        })
        .await;
    }

    async fn on_session_status(&self, session_id: SessionId, status: &SessionStatus) {
        self.emit(&ConsumerEvent::Status {
            session_id,
            status: status.clone(),
        })
        .await;
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// Forwards every event into a bounded `mpsc` queue.
///
/// When the receiver is dropped, events are discarded.
#[derive(Debug, Clone)]
pub struct ChannelConsumer {
    tx: mpsc::Sender<ConsumerEvent>,
}

impl ChannelConsumer {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ConsumerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    async fn forward(&self, event: ConsumerEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("consumer channel closed, event discarded");
        }
    }
}

#[async_trait]
impl PromptConsumer for ChannelConsumer {
    async fn on_prompt_received(&self, session_id: SessionId, text: &str, seq: u64) {
        self.forward(ConsumerEvent::Prompt {
            session_id,
            seq,
            text: text.to_string(),
        })
        .await;
    }

    async fn on_session_status(&self, session_id: SessionId, status: &SessionStatus) {
        self.forward(ConsumerEvent::Status {
            session_id,
            status: status.clone(),
        })
        .await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use relay_core::PairingCode;
    use serde_json::{json, Value};

    fn lines(bytes: Vec<u8>) -> Vec<Value> {
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_json_lines_writes_one_object_per_event() {
        // Arrange
        let consumer = JsonLinesConsumer::new(Vec::new());
        let id = SessionId::new();

        // Act
        consumer.on_session_status(id, &SessionStatus::Connected).await;
        consumer.on_prompt_received(id, "fix the build", 1).await;

        // Assert
        let out = lines(consumer.into_inner());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["event"], "status");
        assert_eq!(out[0]["sessionId"], id.to_string());
        assert_eq!(
            out[1],
            json!({"event": "prompt", "sessionId": id.to_string(), "seq": 1, "text": "fix the build"})
        );
    }

    #[tokio::test]
    async fn test_json_lines_keeps_multiline_prompt_on_one_line() {
        let consumer = JsonLinesConsumer::new(Vec::new());

        consumer
            .on_prompt_received(SessionId::new(), "line one\nline two", 4)
            .await;

        let out = lines(consumer.into_inner());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["text"], "line one\nline two");
    }

    #[tokio::test]
    async fn test_emit_pairing_carries_qr_payload() {
        let consumer = JsonLinesConsumer::new(Vec::new());
        let payload = PairingPayload {
            address: Ipv4Addr::new(192, 168, 1, 42),
            port: 24900,
            code: PairingCode::from_number(309_322, 6).unwrap(),
            loopback_only: false,
        };

        consumer.emit_pairing(&payload).await;

        let out = lines(consumer.into_inner());
        assert_eq!(
            out[0],
            json!({"event": "pairing", "payload": {"address": "192.168.1.42", "port": 24900, "code": "309322"}})
        );
    }

    #[tokio::test]
    async fn test_channel_consumer_forwards_in_order() {
        let (consumer, mut rx) = ChannelConsumer::new(8);
        let id = SessionId::new();

        consumer.on_prompt_received(id, "a", 1).await;
        consumer.on_session_status(id, &SessionStatus::Expired).await;

        assert_eq!(
            rx.recv().await,
            Some(ConsumerEvent::Prompt {
                session_id: id,
                seq: 1,
                text: "a".into()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(ConsumerEvent::Status {
                session_id: id,
                status: SessionStatus::Expired
            })
        );
    }

    #[tokio::test]
    async fn test_channel_consumer_tolerates_dropped_receiver() {
        let (consumer, rx) = ChannelConsumer::new(1);
        drop(rx);

        // Must not panic or hang.
        consumer.on_prompt_received(SessionId::new(), "x", 1).await;
    }
}
