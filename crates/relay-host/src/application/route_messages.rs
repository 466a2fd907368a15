//! Message routing between the phone and the desktop-side consumer.
//!
//! # Inbound: phone → consumer
//!
//! Each session has one bounded inbox (owned by the [`SessionRegistry`]) and
//! one delivery task (spawned here) that drains it.  The delivery task owns a
//! [`ReorderBuffer`], so prompts reach [`PromptConsumer::on_prompt_received`]
//! in strictly increasing sequence order even when the transport reorders or
//! the phone retransmits after a reconnect.
//!
//! After every hand-off the task acknowledges the highest contiguous
//! sequence number to the phone.  The consumer never acks anything itself;
//! the phone's retransmission logic only depends on the router.
//!
//! A gap that stays open for `gap_timeout`, or a reorder buffer that
//! overflows, is a permanent loss: the range is skipped and reported as
//! [`SessionStatus::Dropped`] instead of stalling every later prompt.
//!
//! Status changes travel through the same inbox, so the consumer sees
//! `Expired` only after every prompt that arrived before it.
//!
//! # Outbound: desktop → phone
//!
//! [`MessageRouter::send`] looks up the session's current channel in the
//! registry and queues a frame on its writer.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{Delivery, Frame, Message, PushOutcome, ReorderBuffer, SessionId, SessionStatus};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::application::now;
use crate::application::session_registry::{
    InboxItem, Outbound, RegistryError, SessionInbox, SessionRegistry,
};

/// The desktop-side recipient of prompts and status changes, typically the
/// editor extension.
///
/// Calls for one session are strictly sequential.  Implementations should
/// return quickly; a slow consumer backs up that session's inbox and, in
/// turn, the phone.
#[async_trait]
pub trait PromptConsumer: Send + Sync {
    /// A prompt, delivered exactly once and in `seq` order per session.
    async fn on_prompt_received(&self, session_id: SessionId, text: &str, seq: u64);

    /// The session's status changed.
    async fn on_session_status(&self, session_id: SessionId, status: &SessionStatus);
}

/// Errors returned by the message router.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("session {0} has no open channel")]
    ChannelClosed(SessionId),

    #[error("prompts {from}..={to} were lost in transit")]
    Dropped { from: u64, to: u64 },
}

impl From<RegistryError> for RouterError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) | RegistryError::Expired(id) => {
                RouterError::SessionNotFound(id)
            }
            RegistryError::Detached(id) => RouterError::ChannelClosed(id),
        }
    }
}

/// Reorder tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterSettings {
    /// Prompts held back behind a gap before it is declared lost.
    pub max_pending: usize,
    /// How long a gap may stay open before it is declared lost.
    pub gap_timeout: Duration,
    /// Furthest a prompt's seq may run ahead of the delivery mark.  The
    /// channel closes on anything further; the delivery task discards it.
    pub max_seq_ahead: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_pending: 64,
            gap_timeout: Duration::from_secs(5),
            max_seq_ahead: 1_024,
        }
    }
}

/// Routes prompts to the consumer and control frames to the phone.
#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    consumer: Arc<dyn PromptConsumer>,
    settings: RouterSettings,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        consumer: Arc<dyn PromptConsumer>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            registry,
            consumer,
            settings,
        }
    }

    /// Queues `message` for the phone attached to `session_id`.
    ///
    /// # Errors
    ///
    /// - [`RouterError::SessionNotFound`] if the session does not exist
    ///   (never paired, disconnected for good, or grace period elapsed).
    /// - [`RouterError::ChannelClosed`] if the session is waiting for a
    ///   resume or its writer has shut down.
    pub async fn send(&self, session_id: SessionId, message: Message) -> Result<(), RouterError> {
        let outbound = self.registry.outbound(session_id).await?;
        let frame = frame_for(message, &outbound);
        outbound
            .sender
            .send(frame)
            .await
            .map_err(|_| RouterError::ChannelClosed(session_id))
    }

    /// Queues a status change for the consumer, ordered after every prompt
    /// already in the session's inbox.
    ///
    /// # Errors
    ///
    /// [`RouterError::SessionNotFound`] if the session does not exist.
    pub async fn publish_status(
        &self,
        session_id: SessionId,
        status: SessionStatus,
    ) -> Result<(), RouterError> {
        let inbox = self
            .registry
            .inbox(session_id)
            .await
            .ok_or(RouterError::SessionNotFound(session_id))?;
        inbox
            .send(InboxItem::Status(status))
            .await
            .map_err(|_| RouterError::SessionNotFound(session_id))
    }

    /// Starts the delivery task for a newly registered session.
    ///
    /// The task ends once the registry drops the session and every queued
    /// item has been handed to the consumer.
    pub fn spawn_delivery(&self, session_id: SessionId, inbox: SessionInbox) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move { router.run_delivery(session_id, inbox).await })
    }

    async fn run_delivery(self, session_id: SessionId, inbox: SessionInbox) {
        let SessionInbox {
            mut receiver,
            delivered,
        } = inbox;
        let mut buffer = ReorderBuffer::new(self.settings.max_pending, self.settings.gap_timeout)
            .with_window(self.settings.max_seq_ahead);

        loop {
            let item = match buffer.deadline() {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline.into(), receiver.recv()).await {
                        Ok(item) => item,
                        Err(_) => {
                            let deliveries = buffer.expire(now());
                            self.hand_off_all(session_id, deliveries, &delivered).await;
                            self.ack(session_id, buffer.delivered_through()).await;
                            continue;
                        }
                    }
                }
                None => receiver.recv().await,
            };

            let Some(item) = item else {
                break;
            };

            match item {
                InboxItem::Status(status) => {
                    self.consumer.on_session_status(session_id, &status).await;
                }
                InboxItem::Prompt { seq, text } => match buffer.push(seq, text, now()) {
                    PushOutcome::Delivered(deliveries) => {
                        self.hand_off_all(session_id, deliveries, &delivered).await;
                        self.ack(session_id, buffer.delivered_through()).await;
                    }
                    PushOutcome::Buffered => {
                        debug!(
                            "session {session_id}: prompt {seq} held back ({} pending)",
                            buffer.pending_len()
                        );
                    }
                    PushOutcome::Duplicate => {
                        debug!("session {session_id}: duplicate prompt {seq} re-acknowledged");
                        self.ack(session_id, buffer.delivered_through()).await;
                    }
                    PushOutcome::OutOfWindow => {
                        warn!(
                            "session {session_id}: prompt {seq} is too far ahead of {}; discarded",
                            buffer.delivered_through()
                        );
                    }
                },
            }
        }

        debug!("session {session_id}: delivery task finished");
    }

    async fn hand_off_all(
        &self,
        session_id: SessionId,
        deliveries: Vec<Delivery>,
        delivered: &std::sync::atomic::AtomicU64,
    ) {
        for delivery in deliveries {
            match self.hand_off(session_id, delivery).await {
                Ok(seq) => delivered.store(seq, Ordering::Release),
                Err(RouterError::Dropped { from, to }) => {
                    warn!("session {session_id}: prompts {from}..={to} lost, skipping");
                    delivered.store(to, Ordering::Release);
                }
                Err(err) => warn!("session {session_id}: {err}"),
            }
        }
    }

    /// Hands one delivery to the consumer and returns its sequence number.
    async fn hand_off(&self, session_id: SessionId, delivery: Delivery) -> Result<u64, RouterError> {
        match delivery {
            Delivery::Prompt { seq, text } => {
                debug!("session {session_id}: prompt {seq}: {text:?}");
                self.consumer
                    .on_prompt_received(session_id, &text, seq)
                    .await;
                Ok(seq)
            }
            Delivery::Dropped { from, to } => {
                let status = SessionStatus::Dropped { from, to };
                self.consumer.on_session_status(session_id, &status).await;
                self.notify(session_id, Message::StatusChange { state: status })
                    .await;
                Err(RouterError::Dropped { from, to })
            }
        }
    }

    async fn ack(&self, session_id: SessionId, seq: u64) {
        self.notify(session_id, Message::Ack { seq }).await;
    }

    /// Best-effort send that never waits on a full writer queue.  Acks are
    /// cumulative and the phone learns the high-water mark again from
    /// `Resumed`, so a skipped frame costs nothing.
    async fn notify(&self, session_id: SessionId, message: Message) {
        match self.registry.outbound(session_id).await {
            Ok(outbound) => {
                let frame = frame_for(message, &outbound);
                if outbound.sender.try_send(frame).is_err() {
                    debug!("session {session_id}: writer busy or closed, control frame skipped");
                }
            }
            Err(err) => debug!("session {session_id}: {err}, control frame skipped"),
        }
    }
}

fn frame_for(message: Message, outbound: &Outbound) -> Frame {
    match message {
        Message::Prompt { text, client_seq } => Frame::prompt(client_seq, text),
        Message::Ack { seq } => Frame::ack(seq),
        Message::Heartbeat => Frame::heartbeat(outbound.delivered_through),
        Message::StatusChange { state } => Frame::status(outbound.status_seq.next(), state),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use relay_core::FrameBody;
    use tokio::sync::mpsc;

    use crate::application::session_registry::ClientInfo;

    #[derive(Debug, PartialEq, Eq)]
    enum Seen {
        Prompt(u64, String),
        Status(SessionStatus),
    }

    /// Records every consumer call on a channel.
    struct RecordingConsumer {
        tx: mpsc::UnboundedSender<Seen>,
    }

    #[async_trait]
    impl PromptConsumer for RecordingConsumer {
        async fn on_prompt_received(&self, _session_id: SessionId, text: &str, seq: u64) {
            let _ = self.tx.send(Seen::Prompt(seq, text.to_string()));
        }

        async fn on_session_status(&self, _session_id: SessionId, status: &SessionStatus) {
            let _ = self.tx.send(Seen::Status(status.clone()));
        }
    }

    struct Harness {
        router: MessageRouter,
        registry: Arc<SessionRegistry>,
        session_id: SessionId,
        seen: mpsc::UnboundedReceiver<Seen>,
        phone: mpsc::Receiver<Frame>,
    }

    impl Harness {
        async fn new() -> Self {
            let registry = Arc::new(SessionRegistry::new(32));
            let (tx, seen) = mpsc::unbounded_channel();
            let router = MessageRouter::new(
                Arc::clone(&registry),
                Arc::new(RecordingConsumer { tx }),
                RouterSettings::default(),
            );
            let client = ClientInfo::new("192.168.1.50:5000".parse().unwrap());
            let (session_id, inbox) = registry.register(client, Instant::now()).await;
            router.spawn_delivery(session_id, inbox);

            let (out_tx, mut phone) = mpsc::channel(64);
            registry
                .attach(session_id, out_tx, |_| Frame::paired(session_id, 60, 10), Instant::now())
                .await
                .unwrap();
            let _ = phone.recv().await; // Paired

            Self {
                router,
                registry,
                session_id,
                seen,
                phone,
            }
        }

        async fn push(&self, seq: u64, text: &str) {
            let inbox = self.registry.inbox(self.session_id).await.unwrap();
            inbox
                .send(InboxItem::Prompt {
                    seq,
                    text: text.to_string(),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_out_of_order_prompts_are_delivered_in_order() {
        // Arrange
        let mut h = Harness::new().await;

        // Act – transport delivers 2, 1, 3
        h.push(2, "second").await;
        h.push(1, "first").await;
        h.push(3, "third").await;

        // Assert
        assert_eq!(h.seen.recv().await, Some(Seen::Prompt(1, "first".into())));
        assert_eq!(h.seen.recv().await, Some(Seen::Prompt(2, "second".into())));
        assert_eq!(h.seen.recv().await, Some(Seen::Prompt(3, "third".into())));
    }

    #[tokio::test]
    async fn test_acks_are_cumulative_and_follow_hand_off() {
        let mut h = Harness::new().await;

        h.push(2, "b").await;
        h.push(1, "a").await;

        // Prompt 2 alone is buffered, so the first ack covers both.
        assert_eq!(h.phone.recv().await, Some(Frame::ack(2)));
    }

    #[tokio::test]
    async fn test_duplicate_is_discarded_and_reacknowledged() {
        let mut h = Harness::new().await;
        h.push(1, "a").await;
        assert_eq!(h.phone.recv().await, Some(Frame::ack(1)));

        h.push(1, "a again").await;
        h.push(2, "b").await;

        assert_eq!(h.phone.recv().await, Some(Frame::ack(1)));
        assert_eq!(h.seen.recv().await, Some(Seen::Prompt(1, "a".into())));
        assert_eq!(h.seen.recv().await, Some(Seen::Prompt(2, "b".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_timeout_reports_dropped_and_resumes_delivery() {
        // Arrange
        let mut h = Harness::new().await;
        h.push(1, "a").await;
        assert_eq!(h.seen.recv().await, Some(Seen::Prompt(1, "a".into())));

        // Act – prompt 2 never arrives; the paused clock auto-advances to
        // the gap deadline once the runtime is idle.
        h.push(3, "c").await;

        // Assert
        assert_eq!(
            h.seen.recv().await,
            Some(Seen::Status(SessionStatus::Dropped { from: 2, to: 2 }))
        );
        assert_eq!(h.seen.recv().await, Some(Seen::Prompt(3, "c".into())));

        let mut frames = Vec::new();
        while let Some(frame) = h.phone.recv().await {
            let done = frame == Frame::ack(3);
            frames.push(frame);
            if done {
                break;
            }
        }
        assert!(frames.iter().any(|f| matches!(
            &f.body,
            FrameBody::StatusChange {
                state: SessionStatus::Dropped { from: 2, to: 2 }
            }
        )));
    }

    #[tokio::test]
    async fn test_status_is_ordered_after_queued_prompts() {
        let mut h = Harness::new().await;
        h.push(1, "a").await;

        h.router
            .publish_status(h.session_id, SessionStatus::Disconnected)
            .await
            .unwrap();

        assert_eq!(h.seen.recv().await, Some(Seen::Prompt(1, "a".into())));
        assert_eq!(
            h.seen.recv().await,
            Some(Seen::Status(SessionStatus::Disconnected))
        );
    }

    #[tokio::test]
    async fn test_send_to_unknown_session_is_session_not_found() {
        let h = Harness::new().await;
        let unknown = SessionId::new();

        let result = h.router.send(unknown, Message::Heartbeat).await;

        assert_eq!(result, Err(RouterError::SessionNotFound(unknown)));
    }

    #[tokio::test]
    async fn test_send_to_detached_session_is_channel_closed() {
        let h = Harness::new().await;
        let lease_generation = {
            // Re-attach to learn a generation we own, then detach it.
            let (tx, _rx) = mpsc::channel(4);
            let lease = h
                .registry
                .attach(h.session_id, tx, |d| Frame::resumed(h.session_id, d), Instant::now())
                .await
                .unwrap();
            lease.generation
        };
        h.registry.detach(h.session_id, lease_generation).await;

        let result = h.router.send(h.session_id, Message::Heartbeat).await;

        assert_eq!(result, Err(RouterError::ChannelClosed(h.session_id)));
    }

    #[tokio::test]
    async fn test_send_status_change_uses_outbound_numbering() {
        let mut h = Harness::new().await;

        h.router
            .send(
                h.session_id,
                Message::StatusChange {
                    state: SessionStatus::Connected,
                },
            )
            .await
            .unwrap();
        h.router
            .send(h.session_id, Message::Heartbeat)
            .await
            .unwrap();

        assert_eq!(
            h.phone.recv().await,
            Some(Frame::status(1, SessionStatus::Connected))
        );
        assert_eq!(h.phone.recv().await, Some(Frame::heartbeat(0)));
    }

    #[tokio::test]
    async fn test_delivery_task_ends_when_session_removed() {
        // Arrange
        let registry = Arc::new(SessionRegistry::new(4));
        let (tx, _seen) = mpsc::unbounded_channel();
        let router = MessageRouter::new(
            Arc::clone(&registry),
            Arc::new(RecordingConsumer { tx }),
            RouterSettings::default(),
        );
        let client = ClientInfo::new("10.0.0.2:1".parse().unwrap());
        let (id, inbox) = registry.register(client, Instant::now()).await;
        let task = router.spawn_delivery(id, inbox);

        // Act
        drop(registry.remove(id).await);

        // Assert
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("delivery task must stop")
            .unwrap();
    }

    #[test]
    fn test_registry_errors_map_to_router_errors() {
        let id = SessionId::new();
        assert_eq!(
            RouterError::from(RegistryError::Expired(id)),
            RouterError::SessionNotFound(id)
        );
        assert_eq!(
            RouterError::from(RegistryError::Detached(id)),
            RouterError::ChannelClosed(id)
        );
    }
}
