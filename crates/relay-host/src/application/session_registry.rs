//! Session registry: the process-wide table of paired sessions.
//!
//! The registry is the single source of truth for "which phone is attached
//! to which session right now".  It is an explicitly owned store, shared as
//! `Arc<SessionRegistry>` by the pairing authority, the message router and
//! the relay server.  Nothing is global.
//!
//! # Channels are leases, not owners
//!
//! A WebSocket connection never owns its session.  When it authenticates it
//! receives a [`ChannelLease`] stamped with a *generation* number.  All later
//! operations that could change the session on behalf of that connection
//! (`detach`, `mark_stale`) must present the generation, and are ignored if a
//! newer connection has since taken the slot.  This is what keeps a slow,
//! half-dead socket from tearing down a session that the phone has already
//! resumed over a fresh one.
//!
//! Superseding is forceful: `attach` fires the old lease's `superseded`
//! signal and queues an `Error{superseded}` frame on the old writer, so at
//! most one channel is ever attached to a session.
//!
//! # Teardown
//!
//! Removing an entry drops the registry's inbox sender and the channel's kill
//! switch.  The session's delivery task finishes once the inbox drains, and
//! the attached channel (if any) observes its `superseded` receiver resolve
//! with an error and closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use relay_core::{ErrorCode, Frame, LinkEvent, LinkState, SequenceCounter, SessionId, SessionStatus};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

/// Errors returned by registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {0} has expired")]
    Expired(SessionId),

    #[error("session {0} has no attached channel")]
    Detached(SessionId),
}

/// Who paired: reported by the phone and observed on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Display name from the `Pair` frame.
    pub name: Option<String>,
    /// Remote socket address of the connection that paired.
    pub peer_addr: SocketAddr,
    /// Retry-detection id from the `Pair` frame.
    pub client_id: Option<String>,
}

impl ClientInfo {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self {
            name: None,
            peer_addr,
            client_id: None,
        }
    }

    /// Name for log messages: the display name, or the peer address.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{name} ({})", self.peer_addr),
            None => self.peer_addr.to_string(),
        }
    }
}

/// Work item for a session's delivery task.
///
/// Prompts and status changes share one queue so the consumer sees them in
/// the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxItem {
    Prompt { seq: u64, text: String },
    Status(SessionStatus),
}

/// Receiving half of a new session's inbox, handed to the message router.
#[derive(Debug)]
pub struct SessionInbox {
    pub receiver: mpsc::Receiver<InboxItem>,
    /// Highest prompt seq handed to the consumer; written by the delivery
    /// task, read by the registry for `Resumed` and heartbeats.
    pub delivered: Arc<AtomicU64>,
}

/// Proof that a connection is the attached channel of a session.
#[derive(Debug)]
pub struct ChannelLease {
    pub session_id: SessionId,
    pub generation: u64,
    /// Where inbound prompts go.
    pub inbox: mpsc::Sender<InboxItem>,
    /// Resolves `Ok(())` when a newer channel took over, or `Err` when the
    /// session was removed.
    pub superseded: oneshot::Receiver<()>,
    delivered: Arc<AtomicU64>,
}

impl ChannelLease {
    /// Highest prompt seq delivered to the consumer so far.
    pub fn delivered_through(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }
}

/// Writer handle for sending frames to the phone.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub sender: mpsc::Sender<Frame>,
    pub delivered_through: u64,
    /// Numbering for desktop-originated `StatusChange` frames.
    pub status_seq: Arc<SequenceCounter>,
}

/// Read-only view of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub client: ClientInfo,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub link: LinkState,
    pub delivered_through: u64,
    pub attached: bool,
}

/// An entry taken out of the registry.
#[derive(Debug)]
pub struct RemovedSession {
    pub info: SessionInfo,
    /// Still open so a final status can be queued for the consumer.
    pub inbox: mpsc::Sender<InboxItem>,
}

#[derive(Debug)]
struct ChannelSlot {
    generation: u64,
    outbound: mpsc::Sender<Frame>,
    kill: oneshot::Sender<()>,
}

#[derive(Debug)]
struct SessionEntry {
    client: ClientInfo,
    created_at: Instant,
    last_activity: Instant,
    link: LinkState,
    inbox: mpsc::Sender<InboxItem>,
    delivered: Arc<AtomicU64>,
    status_seq: Arc<SequenceCounter>,
    channel: Option<ChannelSlot>,
    /// Generation whose close started the current grace period.
    detached_generation: Option<u64>,
}

impl SessionEntry {
    fn info(&self, session_id: SessionId) -> SessionInfo {
        SessionInfo {
            session_id,
            client: self.client.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            link: self.link,
            delivered_through: self.delivered.load(Ordering::Acquire),
            attached: self.channel.is_some(),
        }
    }
}

/// Concurrency-safe `SessionId → session` table.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    generations: AtomicU64,
    inbox_capacity: usize,
}

impl SessionRegistry {
    /// Creates an empty registry whose session inboxes hold `inbox_capacity`
    /// items (clamped to at least 1).
    pub fn new(inbox_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            inbox_capacity: inbox_capacity.max(1),
        }
    }

    /// Creates a session with a fresh id and returns the inbox receiver for
    /// its delivery task.  The session starts with no channel attached.
    pub async fn register(&self, client: ClientInfo, now: Instant) -> (SessionId, SessionInbox) {
        let (tx, rx) = mpsc::channel(self.inbox_capacity);
        let delivered = Arc::new(AtomicU64::new(0));

        let mut sessions = self.sessions.lock().await;
        let mut session_id = SessionId::new();
        while sessions.contains_key(&session_id) {
            session_id = SessionId::new();
        }

        info!("session {session_id}: registered for {}", client.label());
        sessions.insert(
            session_id,
            SessionEntry {
                client,
                created_at: now,
                last_activity: now,
                link: LinkState::Active,
                inbox: tx,
                delivered: Arc::clone(&delivered),
                status_seq: Arc::new(SequenceCounter::new()),
                channel: None,
                detached_generation: None,
            },
        );

        (
            session_id,
            SessionInbox {
                receiver: rx,
                delivered,
            },
        )
    }

    pub async fn lookup(&self, session_id: SessionId) -> Option<SessionInfo> {
        let sessions = self.sessions.lock().await;
        sessions.get(&session_id).map(|e| e.info(session_id))
    }

    /// Records inbound activity.  Returns `false` if the session is gone.
    pub async fn touch(&self, session_id: SessionId, now: Instant) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&session_id) {
            Some(entry) => {
                entry.last_activity = now;
                entry.link = entry.link.on(LinkEvent::ActivityObserved);
                true
            }
            None => false,
        }
    }

    /// Removes a session outright.
    pub async fn remove(&self, session_id: SessionId) -> Option<RemovedSession> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.remove(&session_id)?;
        info!("session {session_id}: removed");
        Some(RemovedSession {
            info: entry.info(session_id),
            inbox: entry.inbox,
        })
    }

    /// Attaches `outbound` as the session's channel, superseding any current
    /// one.
    ///
    /// `greeting` builds the first frame for the new channel from the
    /// current delivery high-water mark; it is queued before the channel
    /// becomes visible to the router, so it is always the first frame the
    /// phone receives.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::NotFound`] if no such session exists.
    /// - [`RegistryError::Expired`] if the session's link has expired.
    /// - [`RegistryError::Detached`] if `outbound` is already closed.
    pub async fn attach<F>(
        &self,
        session_id: SessionId,
        outbound: mpsc::Sender<Frame>,
        greeting: F,
        now: Instant,
    ) -> Result<ChannelLease, RegistryError>
    where
        F: FnOnce(u64) -> Frame,
    {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .get_mut(&session_id)
            .ok_or(RegistryError::NotFound(session_id))?;
        if !entry.link.is_resumable() {
            return Err(RegistryError::Expired(session_id));
        }

        let delivered = entry.delivered.load(Ordering::Acquire);
        outbound
            .try_send(greeting(delivered))
            .map_err(|_| RegistryError::Detached(session_id))?;

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let (kill_tx, kill_rx) = oneshot::channel();
        let previous = entry.channel.replace(ChannelSlot {
            generation,
            outbound,
            kill: kill_tx,
        });

        if let Some(old) = previous {
            info!(
                "session {session_id}: channel {} superseded by {generation}",
                old.generation
            );
            let _ = old.outbound.try_send(Frame::error(
                ErrorCode::Superseded,
                "a newer connection resumed this session",
            ));
            let _ = old.kill.send(());
        }

        entry.link = entry.link.on(LinkEvent::Resumed);
        entry.detached_generation = None;
        entry.last_activity = now;
        debug!("session {session_id}: channel {generation} attached (delivered={delivered})");

        Ok(ChannelLease {
            session_id,
            generation,
            inbox: entry.inbox.clone(),
            superseded: kill_rx,
            delivered: Arc::clone(&entry.delivered),
        })
    }

    /// Detaches the channel of `generation` and starts the grace period.
    ///
    /// Returns `true` if this call detached the channel; `false` if the
    /// session is gone or a newer channel owns the slot.
    pub async fn detach(&self, session_id: SessionId, generation: u64) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(entry) = sessions.get_mut(&session_id) else {
            return false;
        };
        if entry.channel.as_ref().map(|slot| slot.generation) != Some(generation) {
            return false;
        }

        entry.channel = None;
        entry.link = entry.link.on(LinkEvent::TransportClosed);
        entry.detached_generation = Some(generation);
        info!("session {session_id}: channel {generation} detached, grace period started");
        true
    }

    /// Marks the link stale if `generation` still owns the slot.
    pub async fn mark_stale(&self, session_id: SessionId, generation: u64) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(&session_id) {
            if entry.channel.as_ref().map(|slot| slot.generation) == Some(generation) {
                entry.link = entry.link.on(LinkEvent::HeartbeatsMissed);
            }
        }
    }

    /// Removes the session if it is still in the grace period started by
    /// `generation`'s detach.
    ///
    /// A grace timer from an earlier disconnect finds a different (or no)
    /// detached generation and leaves the session alone.
    pub async fn expire_if_detached(
        &self,
        session_id: SessionId,
        generation: u64,
    ) -> Option<RemovedSession> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(&session_id)?;
        if entry.channel.is_some() || entry.detached_generation != Some(generation) {
            return None;
        }

        entry.link = entry.link.on(LinkEvent::GraceElapsed);
        let entry = sessions.remove(&session_id)?;
        info!("session {session_id}: grace period elapsed, session expired");
        Some(RemovedSession {
            info: entry.info(session_id),
            inbox: entry.inbox,
        })
    }

    /// Returns the attached channel's writer.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the session is gone,
    /// [`RegistryError::Detached`] if no channel is attached.
    pub async fn outbound(&self, session_id: SessionId) -> Result<Outbound, RegistryError> {
        let sessions = self.sessions.lock().await;
        let entry = sessions
            .get(&session_id)
            .ok_or(RegistryError::NotFound(session_id))?;
        let slot = entry
            .channel
            .as_ref()
            .ok_or(RegistryError::Detached(session_id))?;
        Ok(Outbound {
            sender: slot.outbound.clone(),
            delivered_through: entry.delivered.load(Ordering::Acquire),
            status_seq: Arc::clone(&entry.status_seq),
        })
    }

    /// Returns the inbox sender of a session.
    pub async fn inbox(&self, session_id: SessionId) -> Option<mpsc::Sender<InboxItem>> {
        let sessions = self.sessions.lock().await;
        sessions.get(&session_id).map(|e| e.inbox.clone())
    }

    /// All sessions, oldest first.
    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut list: Vec<SessionInfo> = sessions.iter().map(|(id, e)| e.info(*id)).collect();
        list.sort_by_key(|info| info.created_at);
        list
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::FrameBody;

    fn client() -> ClientInfo {
        ClientInfo {
            name: Some("Pixel 8".to_string()),
            peer_addr: "192.168.1.50:50000".parse().unwrap(),
            client_id: Some("phone-1".to_string()),
        }
    }

    async fn registered(registry: &SessionRegistry) -> (SessionId, SessionInbox) {
        registry.register(client(), Instant::now()).await
    }

    async fn attach(
        registry: &SessionRegistry,
        id: SessionId,
    ) -> (ChannelLease, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        let lease = registry
            .attach(id, tx, |delivered| Frame::resumed(id, delivered), Instant::now())
            .await
            .expect("attach");
        (lease, rx)
    }

    #[tokio::test]
    async fn test_register_then_lookup_returns_detached_active_session() {
        // Arrange
        let registry = SessionRegistry::new(8);

        // Act
        let (id, _inbox) = registered(&registry).await;
        let info = registry.lookup(id).await.unwrap();

        // Assert
        assert_eq!(info.session_id, id);
        assert_eq!(info.client.name.as_deref(), Some("Pixel 8"));
        assert_eq!(info.link, LinkState::Active);
        assert!(!info.attached);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_attach_queues_greeting_first() {
        let registry = SessionRegistry::new(8);
        let (id, inbox) = registered(&registry).await;
        inbox.delivered.store(7, Ordering::Release);

        let (_lease, mut rx) = attach(&registry, id).await;

        assert_eq!(rx.recv().await, Some(Frame::resumed(id, 7)));
    }

    #[tokio::test]
    async fn test_attach_supersedes_previous_channel() {
        // Arrange
        let registry = SessionRegistry::new(8);
        let (id, _inbox) = registered(&registry).await;
        let (first, mut first_rx) = attach(&registry, id).await;
        let _ = first_rx.recv().await; // greeting

        // Act
        let (second, _second_rx) = attach(&registry, id).await;

        // Assert
        assert!(second.generation > first.generation);
        assert_eq!(first.superseded.await, Ok(()));
        let frame = first_rx.recv().await.expect("superseded notice");
        assert!(matches!(
            frame.body,
            FrameBody::Error {
                code: ErrorCode::Superseded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_detach_with_stale_generation_is_ignored() {
        let registry = SessionRegistry::new(8);
        let (id, _inbox) = registered(&registry).await;
        let (first, _rx1) = attach(&registry, id).await;
        let (_second, _rx2) = attach(&registry, id).await;

        assert!(!registry.detach(id, first.generation).await);
        assert!(registry.lookup(id).await.unwrap().attached);
    }

    #[tokio::test]
    async fn test_detach_enters_grace_period() {
        let registry = SessionRegistry::new(8);
        let (id, _inbox) = registered(&registry).await;
        let (lease, _rx) = attach(&registry, id).await;

        assert!(registry.detach(id, lease.generation).await);

        let info = registry.lookup(id).await.unwrap();
        assert_eq!(info.link, LinkState::GracePeriod);
        assert!(!info.attached);
        assert_eq!(
            registry.outbound(id).await.unwrap_err(),
            RegistryError::Detached(id)
        );
    }

    #[tokio::test]
    async fn test_expire_if_detached_removes_session() {
        // Arrange
        let registry = SessionRegistry::new(8);
        let (id, _inbox) = registered(&registry).await;
        let (lease, _rx) = attach(&registry, id).await;
        registry.detach(id, lease.generation).await;

        // Act
        let removed = registry.expire_if_detached(id, lease.generation).await;

        // Assert
        assert_eq!(removed.unwrap().info.link, LinkState::Expired);
        assert!(registry.lookup(id).await.is_none());
    }

    #[tokio::test]
    async fn test_old_grace_timer_does_not_expire_resumed_session() {
        // Drop, resume, drop again: the first timer must not cut the second
        // grace period short.
        let registry = SessionRegistry::new(8);
        let (id, _inbox) = registered(&registry).await;
        let (first, _rx1) = attach(&registry, id).await;
        registry.detach(id, first.generation).await;
        let (second, _rx2) = attach(&registry, id).await;
        registry.detach(id, second.generation).await;

        assert!(registry.expire_if_detached(id, first.generation).await.is_none());
        assert!(registry.lookup(id).await.is_some());
        assert!(registry.expire_if_detached(id, second.generation).await.is_some());
    }

    #[tokio::test]
    async fn test_expire_if_detached_ignores_attached_session() {
        let registry = SessionRegistry::new(8);
        let (id, _inbox) = registered(&registry).await;
        let (lease, _rx) = attach(&registry, id).await;

        assert!(registry.expire_if_detached(id, lease.generation).await.is_none());
    }

    #[tokio::test]
    async fn test_mark_stale_then_touch_recovers() {
        let registry = SessionRegistry::new(8);
        let (id, _inbox) = registered(&registry).await;
        let (lease, _rx) = attach(&registry, id).await;

        registry.mark_stale(id, lease.generation).await;
        assert_eq!(registry.lookup(id).await.unwrap().link, LinkState::Stale);

        assert!(registry.touch(id, Instant::now()).await);
        assert_eq!(registry.lookup(id).await.unwrap().link, LinkState::Active);
    }

    #[tokio::test]
    async fn test_remove_closes_inbox_and_kills_channel() {
        // Arrange
        let registry = SessionRegistry::new(8);
        let (id, mut inbox) = registered(&registry).await;
        let (lease, _rx) = attach(&registry, id).await;
        let ChannelLease {
            inbox: lease_inbox,
            superseded,
            ..
        } = lease;
        drop(lease_inbox);

        // Act
        let removed = registry.remove(id).await.expect("present");
        drop(removed);

        // Assert
        assert!(superseded.await.is_err(), "kill switch dropped, not fired");
        assert_eq!(inbox.receiver.recv().await, None);
    }

    #[tokio::test]
    async fn test_outbound_for_unknown_session_is_not_found() {
        let registry = SessionRegistry::new(8);
        let id = SessionId::new();
        assert_eq!(
            registry.outbound(id).await.unwrap_err(),
            RegistryError::NotFound(id)
        );
    }

    #[tokio::test]
    async fn test_attach_to_closed_writer_fails() {
        let registry = SessionRegistry::new(8);
        let (id, _inbox) = registered(&registry).await;
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let result = registry
            .attach(id, tx, |d| Frame::resumed(id, d), Instant::now())
            .await;

        assert_eq!(result.unwrap_err(), RegistryError::Detached(id));
    }

    #[tokio::test]
    async fn test_snapshot_is_oldest_first() {
        let registry = SessionRegistry::new(8);
        let t0 = Instant::now();
        let (old, _a) = registry.register(client(), t0).await;
        let (new, _b) = registry
            .register(client(), t0 + std::time::Duration::from_secs(1))
            .await;

        let ids: Vec<SessionId> = registry.snapshot().await.iter().map(|s| s.session_id).collect();

        assert_eq!(ids, vec![old, new]);
    }
}
