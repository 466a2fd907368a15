//! RelayService: the operations the WebSocket server calls.
//!
//! The server owns sockets; this service owns the decisions.  A connection
//! is turned into a [`ChannelLease`] by [`RelayService::pair`] or
//! [`RelayService::resume`], and handed back with a [`CloseReason`] when it
//! ends.  Everything between (which session, which generation, whether a
//! grace timer runs) lives here and in the registry.
//!
//! # Session lifecycle (for beginners)
//!
//! ```text
//!   pair ──► Connected ──(transport lost)──► Disconnected ──(resume)──► Connected
//!                │                                 │
//!          (Disconnect)                    (resume_grace elapsed)
//!                │                                 │
//!                └──► Disconnected, Expired        └──► Expired
//! ```
//!
//! Every arrow emits a [`SessionStatus`] to the consumer through the
//! session's inbox, so statuses and prompts reach it in one ordered stream.

use std::sync::Arc;
use std::time::Duration;

use relay_core::{Frame, Message, PairingCode, SessionId, SessionStatus};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::now;
use crate::application::pairing::{PairingAuthority, PairingError, PairingSettings};
use crate::application::route_messages::{
    MessageRouter, PromptConsumer, RouterError, RouterSettings,
};
use crate::application::session_registry::{
    ChannelLease, ClientInfo, InboxItem, RegistryError, SessionRegistry,
};

/// Channel timing and queue sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub heartbeat_interval: Duration,
    /// Consecutive silent intervals before the link is declared stale.
    pub missed_heartbeats: u32,
    /// How long a dropped session waits for `Resume`.
    pub resume_grace: Duration,
    /// How long a new connection has to send `Pair` or `Resume`.
    pub handshake_timeout: Duration,
    /// Frames queued per connection writer.
    pub outbound_queue: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            missed_heartbeats: 3,
            resume_grace: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            outbound_queue: 64,
        }
    }
}

/// Everything the service needs to be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub pairing: PairingSettings,
    pub relay: RelaySettings,
    pub router: RouterSettings,
    /// Items queued per session inbox before the reader waits.
    pub inbox_capacity: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            pairing: PairingSettings::default(),
            relay: RelaySettings::default(),
            router: RouterSettings::default(),
            inbox_capacity: 256,
        }
    }
}

/// Why an inbound prompt was not queued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PromptRejected {
    /// The seq is further ahead of the delivery mark than any phone
    /// following the protocol could be.
    #[error("prompt seq {seq} is more than {limit} ahead of delivered seq {delivered}")]
    TooFarAhead { seq: u64, delivered: u64, limit: u64 },

    /// The session's delivery task is gone.
    #[error("session inbox closed")]
    SessionClosed,
}

/// Why a channel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The phone sent `Disconnect`: end the session now.
    ClientDisconnect,
    /// A newer connection resumed the session.
    Superseded,
    /// Heartbeats stopped arriving.
    Stale,
    /// The socket closed or errored, or the phone broke the protocol.
    Transport,
}

/// Pairing, sessions and routing for one host process.
pub struct RelayService {
    settings: ServiceSettings,
    registry: Arc<SessionRegistry>,
    authority: PairingAuthority,
    router: MessageRouter,
}

impl RelayService {
    pub fn new(settings: ServiceSettings, consumer: Arc<dyn PromptConsumer>) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new(settings.inbox_capacity));
        let authority = PairingAuthority::new(settings.pairing.clone(), Arc::clone(&registry));
        let router = MessageRouter::new(Arc::clone(&registry), consumer, settings.router.clone());
        Arc::new(Self {
            settings,
            registry,
            authority,
            router,
        })
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn authority(&self) -> &PairingAuthority {
        &self.authority
    }

    /// Consumes `code` and attaches `outbound` to the resulting session.
    ///
    /// The `Paired` frame is queued on `outbound` before this returns.  A
    /// recognised retry re-attaches to the session created by the first
    /// attempt.
    ///
    /// # Errors
    ///
    /// Any [`PairingError`]; the caller reports it to the phone with
    /// [`PairingError::error_code`].
    pub async fn pair(
        &self,
        code: &str,
        client: ClientInfo,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<ChannelLease, PairingError> {
        let now = now();
        let ticket = self
            .authority
            .validate_and_consume(code, &client, now)
            .await?;
        let session_id = ticket.session_id;
        let retry = ticket.is_retry();
        if let Some(inbox) = ticket.inbox {
            self.router.spawn_delivery(session_id, inbox);
        }

        let grace = self.settings.relay.resume_grace.as_secs();
        let heartbeat = self.settings.relay.heartbeat_interval.as_secs();
        let attached = self
            .registry
            .attach(
                session_id,
                outbound,
                |_| Frame::paired(session_id, grace, heartbeat),
                now,
            )
            .await;
        let lease = match attached {
            Ok(lease) => lease,
            Err(err) => {
                warn!("session {session_id}: attach after pairing failed: {err}");
                // A fresh session nobody was told about would never be
                // resumed or expired.  A retry leaves the original alone.
                if !retry {
                    self.registry.remove(session_id).await;
                }
                return Err(PairingError::SessionLost(session_id));
            }
        };

        if retry {
            info!("session {session_id}: pairing retry from {}", client.label());
        } else {
            info!("session {session_id}: paired with {}", client.label());
        }
        self.publish(session_id, SessionStatus::Connected).await;
        Ok(lease)
    }

    /// Attaches `outbound` to an existing session.
    ///
    /// The `Resumed` frame, carrying the delivery high-water mark, is queued
    /// on `outbound` before this returns.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] or [`RegistryError::Expired`] when the
    /// session cannot be resumed.
    pub async fn resume(
        &self,
        session_id: SessionId,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<ChannelLease, RegistryError> {
        let lease = self
            .registry
            .attach(
                session_id,
                outbound,
                |delivered| Frame::resumed(session_id, delivered),
                now(),
            )
            .await?;
        info!(
            "session {session_id}: resumed on channel {} (delivered={})",
            lease.generation,
            lease.delivered_through()
        );
        self.publish(session_id, SessionStatus::Connected).await;
        Ok(lease)
    }

    /// Records inbound activity and queues a prompt for delivery.
    ///
    /// # Errors
    ///
    /// - [`PromptRejected::TooFarAhead`] if `seq` exceeds the delivery mark
    ///   by more than `router.max_seq_ahead`; the channel should be closed.
    /// - [`PromptRejected::SessionClosed`] if the session is gone.
    pub async fn accept_prompt(
        &self,
        lease: &ChannelLease,
        seq: u64,
        text: String,
    ) -> Result<(), PromptRejected> {
        let delivered = lease.delivered_through();
        let limit = self.settings.router.max_seq_ahead;
        if seq > delivered.saturating_add(limit) {
            return Err(PromptRejected::TooFarAhead {
                seq,
                delivered,
                limit,
            });
        }

        self.registry.touch(lease.session_id, now()).await;
        lease
            .inbox
            .send(InboxItem::Prompt { seq, text })
            .await
            .map_err(|_| PromptRejected::SessionClosed)
    }

    /// Records inbound activity that carries no payload (acks, heartbeats).
    pub async fn touch(&self, lease: &ChannelLease) {
        self.registry.touch(lease.session_id, now()).await;
    }

    /// Sends a message to the phone attached to `session_id`.
    ///
    /// # Errors
    ///
    /// See [`MessageRouter::send`].
    pub async fn send(&self, session_id: SessionId, message: Message) -> Result<(), RouterError> {
        self.router.send(session_id, message).await
    }

    /// Handles the end of the channel identified by `lease`.
    ///
    /// Only the generation that still owns the session's slot changes
    /// anything; a superseded channel closing late is ignored.
    pub async fn channel_closed(self: &Arc<Self>, lease: &ChannelLease, reason: CloseReason) {
        let session_id = lease.session_id;
        match reason {
            CloseReason::ClientDisconnect => {
                self.end_session(session_id).await;
            }
            CloseReason::Superseded => {
                debug!("session {session_id}: channel {} superseded", lease.generation);
            }
            CloseReason::Stale | CloseReason::Transport => {
                if reason == CloseReason::Stale {
                    self.registry.mark_stale(session_id, lease.generation).await;
                }
                if self.registry.detach(session_id, lease.generation).await {
                    self.publish(session_id, SessionStatus::Disconnected).await;
                    self.start_grace_timer(session_id, lease.generation);
                }
            }
        }
    }

    /// Removes a session immediately; it cannot be resumed.
    ///
    /// Returns `false` if the session did not exist.
    pub async fn end_session(&self, session_id: SessionId) -> bool {
        let Some(removed) = self.registry.remove(session_id).await else {
            return false;
        };
        info!("session {session_id}: ended by {}", removed.info.client.label());
        for status in [SessionStatus::Disconnected, SessionStatus::Expired] {
            let _ = removed.inbox.send(InboxItem::Status(status)).await;
        }
        true
    }

    /// Sweeps stale codes and issues a fresh one if none is pending.
    ///
    /// Returns the new code, or `None` when a pending code is still live.
    ///
    /// # Errors
    ///
    /// [`PairingError::Exhausted`] or [`PairingError::InvalidCode`] from
    /// issuance.
    pub async fn ensure_pairing_code(&self) -> Result<Option<PairingCode>, PairingError> {
        let now = now();
        let swept = self.authority.sweep(now).await;
        if swept > 0 {
            debug!("swept {swept} pairing codes");
        }
        if self.authority.pending_count(now).await > 0 {
            return Ok(None);
        }
        self.authority.issue_code(now).await.map(Some)
    }

    fn start_grace_timer(self: &Arc<Self>, session_id: SessionId, generation: u64) {
        let service = Arc::clone(self);
        let grace = self.settings.relay.resume_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(removed) = service
                .registry
                .expire_if_detached(session_id, generation)
                .await
            {
                let _ = removed
                    .inbox
                    .send(InboxItem::Status(SessionStatus::Expired))
                    .await;
            }
        });
    }

    async fn publish(&self, session_id: SessionId, status: SessionStatus) {
        if let Err(err) = self.router.publish_status(session_id, status).await {
            debug!("session {session_id}: status not published: {err}");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
