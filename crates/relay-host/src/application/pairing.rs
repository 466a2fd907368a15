//! Pairing authority: issues single-use pairing codes and trades a valid code
//! for a new session.
//!
//! # Code lifecycle
//!
//! ```text
//!   issue_code ──► Pending ──(validate_and_consume)──► Consumed ──(retention)──► removed
//!                     │
//!                     └──(TTL elapsed)──► removed
//! ```
//!
//! A consumed code is kept around for a short retention window so that a
//! phone which paired but never saw the `Paired` reply (socket dropped at the
//! worst moment) can repeat the request and receive the *same* session
//! instead of an error.  The phone is recognised by the `clientId` it sends
//! with every `Pair` frame.
//!
//! # The one place a race is a correctness bug
//!
//! Validation, consumption and session registration happen under a single
//! lock.  Of N concurrent attempts with the same valid code, exactly one
//! creates a session; the rest observe `Consumed` and get
//! [`PairingError::AlreadyConsumed`].
//!
//! # Brute-force guard
//!
//! A 6-digit code has only a million values.  Every `NotFound` / `Expired`
//! result counts as a failure against the peer's IP address; after
//! `max_failed_attempts` failures inside the lockout window the address is
//! refused with [`PairingError::LockedOut`] until the window passes.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relay_core::domain::pairing::{DEFAULT_CODE_LEN, MAX_CODE_LEN, MIN_CODE_LEN};
use relay_core::{ErrorCode, InvalidCode, PairingCode, PairingPayload, SessionId};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::application::session_registry::{ClientInfo, SessionInbox, SessionRegistry};

/// Give up issuing after this many collisions with live codes.
const MAX_ISSUE_ATTEMPTS: u32 = 1_000;

/// Errors returned by the pairing authority.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairingError {
    /// No live code matches.
    #[error("pairing code not recognised")]
    NotFound,

    /// The code existed but its TTL elapsed before it was used.
    #[error("pairing code expired")]
    Expired,

    /// The code was already used by another device.
    #[error("pairing code already used")]
    AlreadyConsumed,

    /// Too many failed attempts from this address.
    #[error("too many failed pairing attempts; retry in {seconds_remaining}s")]
    LockedOut { seconds_remaining: u64 },

    /// Every candidate code collided with a live one.
    #[error("no free pairing code after {0} attempts")]
    Exhausted(u32),

    /// The configured code length is out of range.
    #[error(transparent)]
    InvalidCode(#[from] InvalidCode),

    /// The code was consumed but the new session could not be attached to
    /// the connection that submitted it.
    #[error("session {0} could not be attached")]
    SessionLost(SessionId),
}

impl PairingError {
    /// Machine-readable code for the `Error` frame sent to the phone.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            PairingError::NotFound | PairingError::InvalidCode(_) => ErrorCode::UnknownCode,
            PairingError::Expired => ErrorCode::CodeExpired,
            PairingError::AlreadyConsumed => ErrorCode::CodeConsumed,
            PairingError::LockedOut { .. } => ErrorCode::LockedOut,
            PairingError::Exhausted(_) => ErrorCode::HostUnavailable,
            PairingError::SessionLost(_) => ErrorCode::UnknownSession,
        }
    }
}

/// Tunables for code issuance, retention and lockout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSettings {
    pub code_length: usize,
    pub code_ttl: Duration,
    /// How long a consumed code stays recognisable for retries.
    pub consumed_retention: Duration,
    pub max_failed_attempts: u32,
    pub lockout: Duration,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            code_length: DEFAULT_CODE_LEN,
            code_ttl: Duration::from_secs(300),
            consumed_retention: Duration::from_secs(10),
            max_failed_attempts: 5,
            lockout: Duration::from_secs(60),
        }
    }
}

/// Successful outcome of [`PairingAuthority::validate_and_consume`].
#[derive(Debug)]
pub struct SessionTicket {
    pub session_id: SessionId,
    /// Present only for a newly created session; the caller must start the
    /// session's delivery task with it.  `None` for a recognised retry.
    pub inbox: Option<SessionInbox>,
}

impl SessionTicket {
    pub fn is_retry(&self) -> bool {
        self.inbox.is_none()
    }
}

#[derive(Debug)]
enum CodeState {
    Pending,
    Consumed {
        session_id: SessionId,
        client_id: Option<String>,
        at: Instant,
    },
}

#[derive(Debug)]
struct CodeEntry {
    expires_at: Instant,
    state: CodeState,
}

/// Per-IP failure counter.
#[derive(Debug)]
struct FailureRecord {
    count: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

#[derive(Debug)]
struct AuthorityState {
    codes: HashMap<String, CodeEntry>,
    failures: HashMap<IpAddr, FailureRecord>,
    rng: StdRng,
}

/// Issues and validates pairing codes.
#[derive(Debug)]
pub struct PairingAuthority {
    settings: PairingSettings,
    registry: Arc<SessionRegistry>,
    state: Mutex<AuthorityState>,
}

impl PairingAuthority {
    pub fn new(settings: PairingSettings, registry: Arc<SessionRegistry>) -> Self {
        Self::with_rng(settings, registry, StdRng::from_entropy())
    }

    /// Uses the given generator for codes; tests seed it for repeatability.
    pub fn with_rng(settings: PairingSettings, registry: Arc<SessionRegistry>, rng: StdRng) -> Self {
        Self {
            settings,
            registry,
            state: Mutex::new(AuthorityState {
                codes: HashMap::new(),
                failures: HashMap::new(),
                rng,
            }),
        }
    }

    pub fn settings(&self) -> &PairingSettings {
        &self.settings
    }

    /// Issues a fresh code that collides with no live code.
    ///
    /// # Errors
    ///
    /// [`PairingError::InvalidCode`] if the configured length is out of
    /// range, [`PairingError::Exhausted`] if the code space is saturated.
    pub async fn issue_code(&self, now: Instant) -> Result<PairingCode, PairingError> {
        let len = self.settings.code_length;
        if !(MIN_CODE_LEN..=MAX_CODE_LEN).contains(&len) {
            return Err(InvalidCode::BadLength(len).into());
        }
        let space = 10u64.pow(len as u32);

        let mut state = self.state.lock().await;
        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let code = PairingCode::from_number(state.rng.gen_range(0..space), len)?;
            if state.codes.contains_key(code.as_str()) {
                continue;
            }
            state.codes.insert(
                code.as_str().to_string(),
                CodeEntry {
                    expires_at: now + self.settings.code_ttl,
                    state: CodeState::Pending,
                },
            );
            info!(
                "issued pairing code (valid for {}s)",
                self.settings.code_ttl.as_secs()
            );
            return Ok(code);
        }

        Err(PairingError::Exhausted(MAX_ISSUE_ATTEMPTS))
    }

    /// Consumes `code` on behalf of `client` and registers a new session.
    ///
    /// # Errors
    ///
    /// - [`PairingError::LockedOut`] if `client`'s IP is locked out.
    /// - [`PairingError::NotFound`] if no live code matches.
    /// - [`PairingError::Expired`] if the code outlived its TTL.
    /// - [`PairingError::AlreadyConsumed`] if another client used it.
    pub async fn validate_and_consume(
        &self,
        code: &str,
        client: &ClientInfo,
        now: Instant,
    ) -> Result<SessionTicket, PairingError> {
        let ip = client.peer_addr.ip();
        let code = code.trim();

        let mut state = self.state.lock().await;
        self.check_lockout(&mut state, ip, now)?;

        let Some(entry) = state.codes.get_mut(code) else {
            self.record_failure(&mut state, ip, now);
            return Err(PairingError::NotFound);
        };

        match &entry.state {
            CodeState::Consumed {
                session_id,
                client_id: Some(owner),
                at,
            } if client.client_id.as_deref() == Some(owner.as_str())
                && now < *at + self.settings.consumed_retention =>
            {
                debug!("session {session_id}: repeated pair from the same client");
                return Ok(SessionTicket {
                    session_id: *session_id,
                    inbox: None,
                });
            }
            CodeState::Consumed { .. } => return Err(PairingError::AlreadyConsumed),
            CodeState::Pending if now >= entry.expires_at => {
                state.codes.remove(code);
                self.record_failure(&mut state, ip, now);
                return Err(PairingError::Expired);
            }
            CodeState::Pending => {}
        }

        // Registration happens while the code table is still locked, so no
        // second attempt can observe the code as pending.
        let (session_id, inbox) = self.registry.register(client.clone(), now).await;
        entry.state = CodeState::Consumed {
            session_id,
            client_id: client.client_id.clone(),
            at: now,
        };
        state.failures.remove(&ip);
        debug!("session {session_id}: code consumed by {}", client.label());

        Ok(SessionTicket {
            session_id,
            inbox: Some(inbox),
        })
    }

    /// Purges expired pending codes, consumed codes past retention, and
    /// lapsed failure records.  Returns the number of codes removed.
    pub async fn sweep(&self, now: Instant) -> usize {
        let retention = self.settings.consumed_retention;
        let lockout = self.settings.lockout;
        let mut state = self.state.lock().await;

        let before = state.codes.len();
        state.codes.retain(|_, entry| match entry.state {
            CodeState::Pending => now < entry.expires_at,
            CodeState::Consumed { at, .. } => now < (at + retention).max(entry.expires_at),
        });
        state.failures.retain(|_, record| match record.locked_until {
            Some(until) => now < until,
            None => now < record.window_start + lockout,
        });

        let removed = before - state.codes.len();
        if removed > 0 {
            debug!("pairing sweep removed {removed} code(s)");
        }
        removed
    }

    /// Number of codes still waiting to be used.
    pub async fn pending_count(&self, now: Instant) -> usize {
        let state = self.state.lock().await;
        state
            .codes
            .values()
            .filter(|entry| matches!(entry.state, CodeState::Pending) && now < entry.expires_at)
            .count()
    }

    fn check_lockout(
        &self,
        state: &mut AuthorityState,
        ip: IpAddr,
        now: Instant,
    ) -> Result<(), PairingError> {
        let locked_until = state.failures.get(&ip).and_then(|record| record.locked_until);
        match locked_until {
            Some(until) if now < until => {
                let remaining = until - now;
                let seconds_remaining = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                Err(PairingError::LockedOut { seconds_remaining })
            }
            Some(_) => {
                state.failures.remove(&ip);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn record_failure(&self, state: &mut AuthorityState, ip: IpAddr, now: Instant) {
        let lockout = self.settings.lockout;
        let record = state.failures.entry(ip).or_insert(FailureRecord {
            count: 0,
            window_start: now,
            locked_until: None,
        });
        if now >= record.window_start + lockout {
            record.count = 0;
            record.window_start = now;
        }
        record.count += 1;
        if record.count >= self.settings.max_failed_attempts {
            record.locked_until = Some(now + lockout);
            warn!(
                "{ip}: {} failed pairing attempts, locked out for {}s",
                record.count,
                lockout.as_secs()
            );
        }
    }
}

/// Builds the QR payload for `code`.  A loopback address marks the payload
/// `loopbackOnly`.
pub fn pairing_payload(address: Ipv4Addr, port: u16, code: PairingCode) -> PairingPayload {
    PairingPayload {
        address,
        port,
        code,
        loopback_only: address.is_loopback(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> (PairingAuthority, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new(8));
        let authority = PairingAuthority::with_rng(
            PairingSettings::default(),
            Arc::clone(&registry),
            StdRng::seed_from_u64(7),
        );
        (authority, registry)
    }

    fn phone(addr: &str, id: Option<&str>) -> ClientInfo {
        ClientInfo {
            name: None,
            peer_addr: addr.parse().unwrap(),
            client_id: id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_issue_code_has_configured_length_and_digits() {
        let (authority, _) = authority();
        let code = authority.issue_code(Instant::now()).await.unwrap();
        assert_eq!(code.as_str().len(), 6);
        assert!(code.as_str().bytes().all(|b| b.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_issued_codes_are_unique_among_live_codes() {
        // Arrange – 4-digit codes make collisions likely without the check
        let registry = Arc::new(SessionRegistry::new(8));
        let settings = PairingSettings {
            code_length: 4,
            ..PairingSettings::default()
        };
        let authority = PairingAuthority::with_rng(settings, registry, StdRng::seed_from_u64(1));
        let now = Instant::now();

        // Act
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            let code = authority.issue_code(now).await.unwrap();
            assert!(seen.insert(code), "duplicate live code issued");
        }

        // Assert
        assert_eq!(authority.pending_count(now).await, 500);
    }

    #[tokio::test]
    async fn test_out_of_range_code_length_is_rejected() {
        let registry = Arc::new(SessionRegistry::new(8));
        let settings = PairingSettings {
            code_length: 3,
            ..PairingSettings::default()
        };
        let authority = PairingAuthority::new(settings, registry);
        assert_eq!(
            authority.issue_code(Instant::now()).await,
            Err(PairingError::InvalidCode(InvalidCode::BadLength(3)))
        );
    }

    #[tokio::test]
    async fn test_consume_once_then_already_consumed() {
        // Arrange
        let (authority, registry) = authority();
        let now = Instant::now();
        let code = authority.issue_code(now).await.unwrap();

        // Act
        let first = authority
            .validate_and_consume(code.as_str(), &phone("192.168.1.50:5000", None), now)
            .await
            .unwrap();
        let second = authority
            .validate_and_consume(code.as_str(), &phone("192.168.1.51:5000", None), now)
            .await;

        // Assert
        assert!(!first.is_retry());
        assert!(registry.lookup(first.session_id).await.is_some());
        assert_eq!(second.unwrap_err(), PairingError::AlreadyConsumed);
    }

    #[tokio::test]
    async fn test_unknown_code_is_not_found() {
        let (authority, _) = authority();
        let result = authority
            .validate_and_consume("000000", &phone("10.0.0.2:1", None), Instant::now())
            .await;
        assert_eq!(result.unwrap_err(), PairingError::NotFound);
    }

    #[tokio::test]
    async fn test_code_past_ttl_is_expired_never_ok() {
        // Arrange
        let (authority, registry) = authority();
        let t0 = Instant::now();
        let code = authority.issue_code(t0).await.unwrap();

        // Act
        let result = authority
            .validate_and_consume(
                code.as_str(),
                &phone("10.0.0.2:1", None),
                t0 + Duration::from_secs(300),
            )
            .await;

        // Assert
        assert_eq!(result.unwrap_err(), PairingError::Expired);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_expired_code_is_purged_on_lookup() {
        let (authority, _) = authority();
        let t0 = Instant::now();
        let code = authority.issue_code(t0).await.unwrap();
        let later = t0 + Duration::from_secs(301);
        let client = phone("10.0.0.2:1", None);

        let _ = authority.validate_and_consume(code.as_str(), &client, later).await;
        let again = authority.validate_and_consume(code.as_str(), &client, later).await;

        assert_eq!(again.unwrap_err(), PairingError::NotFound);
    }

    #[tokio::test]
    async fn test_same_client_retry_returns_same_session() {
        // Arrange
        let (authority, registry) = authority();
        let t0 = Instant::now();
        let code = authority.issue_code(t0).await.unwrap();
        let client = phone("192.168.1.50:5000", Some("phone-1"));
        let first = authority
            .validate_and_consume(code.as_str(), &client, t0)
            .await
            .unwrap();

        // Act – same phone, new socket port, within the retention window
        let retry_client = phone("192.168.1.50:5001", Some("phone-1"));
        let retry = authority
            .validate_and_consume(code.as_str(), &retry_client, t0 + Duration::from_secs(3))
            .await
            .unwrap();

        // Assert
        assert!(retry.is_retry());
        assert_eq!(retry.session_id, first.session_id);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_retry_after_retention_is_already_consumed() {
        let (authority, _) = authority();
        let t0 = Instant::now();
        let code = authority.issue_code(t0).await.unwrap();
        let client = phone("192.168.1.50:5000", Some("phone-1"));
        authority
            .validate_and_consume(code.as_str(), &client, t0)
            .await
            .unwrap();

        let late = authority
            .validate_and_consume(code.as_str(), &client, t0 + Duration::from_secs(10))
            .await;

        assert_eq!(late.unwrap_err(), PairingError::AlreadyConsumed);
    }

    #[tokio::test]
    async fn test_retry_without_client_id_is_not_recognised() {
        let (authority, _) = authority();
        let t0 = Instant::now();
        let code = authority.issue_code(t0).await.unwrap();
        let client = phone("192.168.1.50:5000", None);
        authority
            .validate_and_consume(code.as_str(), &client, t0)
            .await
            .unwrap();

        let again = authority.validate_and_consume(code.as_str(), &client, t0).await;

        assert_eq!(again.unwrap_err(), PairingError::AlreadyConsumed);
    }

    #[tokio::test]
    async fn test_concurrent_consume_has_exactly_one_winner() {
        // Arrange
        let (authority, registry) = authority();
        let authority = Arc::new(authority);
        let now = Instant::now();
        let code = authority.issue_code(now).await.unwrap();

        // Act
        let mut handles = Vec::new();
        for i in 0..32u16 {
            let authority = Arc::clone(&authority);
            let code = code.clone();
            handles.push(tokio::spawn(async move {
                let client = phone(&format!("192.168.1.{}:{}", 10 + i, 40000 + i), None);
                authority
                    .validate_and_consume(code.as_str(), &client, now)
                    .await
            }));
        }
        let mut wins = 0;
        let mut consumed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(PairingError::AlreadyConsumed) => consumed += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        // Assert
        assert_eq!(wins, 1);
        assert_eq!(consumed, 31);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_lockout_after_repeated_failures() {
        // Arrange
        let (authority, _) = authority();
        let t0 = Instant::now();
        let code = authority.issue_code(t0).await.unwrap();
        let attacker = phone("192.168.1.66:4000", None);
        for guess in 0..5 {
            let _ = authority
                .validate_and_consume(&format!("{guess:06}x"), &attacker, t0)
                .await;
        }

        // Act – even the correct code is refused while locked out
        let result = authority
            .validate_and_consume(code.as_str(), &attacker, t0 + Duration::from_secs(1))
            .await;

        // Assert
        assert_eq!(
            result.unwrap_err(),
            PairingError::LockedOut {
                seconds_remaining: 59
            }
        );
    }

    #[tokio::test]
    async fn test_lockout_is_per_address_and_lapses() {
        let (authority, _) = authority();
        let t0 = Instant::now();
        let code = authority.issue_code(t0).await.unwrap();
        let attacker = phone("192.168.1.66:4000", None);
        for _ in 0..5 {
            let _ = authority.validate_and_consume("999999x", &attacker, t0).await;
        }

        // Another phone is unaffected.
        let bystander = phone("192.168.1.67:4000", None);
        assert!(authority
            .validate_and_consume("123", &bystander, t0)
            .await
            .is_err_and(|e| e == PairingError::NotFound));

        // After the window, the attacker may try again.
        let later = t0 + Duration::from_secs(61);
        assert!(authority
            .validate_and_consume(code.as_str(), &attacker, later)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_and_retained_codes() {
        // Arrange
        let (authority, _) = authority();
        let t0 = Instant::now();
        let consumed = authority.issue_code(t0).await.unwrap();
        let _pending = authority.issue_code(t0).await.unwrap();
        authority
            .validate_and_consume(consumed.as_str(), &phone("10.0.0.9:1", None), t0)
            .await
            .unwrap();

        // Act / Assert – consumed codes live until the later of retention and TTL
        assert_eq!(authority.sweep(t0 + Duration::from_secs(11)).await, 0);
        assert_eq!(authority.sweep(t0 + Duration::from_secs(300)).await, 2);
        assert_eq!(authority.pending_count(t0 + Duration::from_secs(300)).await, 0);
    }

    #[tokio::test]
    async fn test_pending_count_ignores_consumed_and_expired() {
        let (authority, _) = authority();
        let t0 = Instant::now();
        let a = authority.issue_code(t0).await.unwrap();
        authority.issue_code(t0).await.unwrap();
        authority
            .validate_and_consume(a.as_str(), &phone("10.0.0.9:1", None), t0)
            .await
            .unwrap();

        assert_eq!(authority.pending_count(t0).await, 1);
        assert_eq!(
            authority.pending_count(t0 + Duration::from_secs(300)).await,
            0
        );
    }

    #[test]
    fn test_pairing_payload_marks_loopback_only() {
        let code = PairingCode::new("309322").unwrap();

        let lan = pairing_payload(Ipv4Addr::new(192, 168, 1, 42), 24900, code.clone());
        let local = pairing_payload(Ipv4Addr::LOCALHOST, 24900, code);

        assert!(!lan.loopback_only);
        assert!(local.loopback_only);
        assert_eq!(
            serde_json::to_string(&lan).unwrap(),
            r#"{"address":"192.168.1.42","port":24900,"code":"309322"}"#
        );
    }

    #[test]
    fn test_pairing_error_maps_to_wire_codes() {
        assert_eq!(PairingError::NotFound.error_code(), ErrorCode::UnknownCode);
        assert_eq!(PairingError::Expired.error_code(), ErrorCode::CodeExpired);
        assert_eq!(
            PairingError::AlreadyConsumed.error_code(),
            ErrorCode::CodeConsumed
        );
        assert_eq!(
            PairingError::LockedOut {
                seconds_remaining: 3
            }
            .error_code(),
            ErrorCode::LockedOut
        );
    }

    #[test]
    fn test_server_side_failures_do_not_blame_the_code() {
        // A saturated code space is the host's problem, not "code already used".
        assert_eq!(
            PairingError::Exhausted(MAX_ISSUE_ATTEMPTS).error_code(),
            ErrorCode::HostUnavailable
        );
        assert_eq!(
            PairingError::SessionLost(SessionId::new()).error_code(),
            ErrorCode::UnknownSession
        );
    }
}
