//! Link liveness and the reconnect state machine.
//!
//! # States
//!
//! ```text
//!            heartbeats missed             transport closed
//!   Active ─────────────────────►  Stale ─────────────────► GracePeriod ──► Expired
//!     ▲  ◄──── activity seen ────────┘                          │    grace elapsed
//!     │                                                         │
//!     └──────────────────────── resumed ────────────────────────┘
//! ```
//!
//! `Active` and `Stale` can also move straight to `GracePeriod` when the
//! transport closes.  `Expired` is absorbing: a new pairing is required.
//!
//! The state machine is independent of any timer or task primitive; the
//! relay channel feeds it events from heartbeat checks, socket closes, and
//! the grace timer.

use std::time::{Duration, Instant};

/// Reconnect state of a session's link to the phone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// A channel is attached and traffic is flowing.
    Active,
    /// A channel is attached but nothing has been heard for too long.
    Stale,
    /// No channel is attached; the phone may still resume.
    GracePeriod,
    /// The session is over.
    Expired,
}

/// Inputs that drive [`LinkState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Any inbound frame arrived.
    ActivityObserved,
    /// The heartbeat monitor reported the link stale.
    HeartbeatsMissed,
    /// The underlying socket closed or was torn down.
    TransportClosed,
    /// A new channel reattached to the session.
    Resumed,
    /// The grace period ran out without a resume.
    GraceElapsed,
}

impl LinkState {
    /// Returns the state after applying `event`.
    ///
    /// Events that make no sense in the current state leave it unchanged.
    pub fn on(self, event: LinkEvent) -> LinkState {
        use LinkEvent::*;
        use LinkState::*;

        match (self, event) {
            (Expired, _) => Expired,
            (Active | Stale, ActivityObserved) => Active,
            (Active, HeartbeatsMissed) => Stale,
            (Active | Stale, TransportClosed) => GracePeriod,
            (_, Resumed) => Active,
            (GracePeriod, GraceElapsed) => Expired,
            (state, _) => state,
        }
    }

    /// Returns `true` if a `Resume` may reattach to the session.
    ///
    /// Resume is allowed while still `Active` because the phone often notices
    /// a dead socket before the desktop does.
    pub fn is_resumable(self) -> bool {
        !matches!(self, LinkState::Expired)
    }
}

/// Liveness verdict from [`HeartbeatMonitor::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Something was heard within the last interval.
    Alive,
    /// `n` whole intervals passed in silence, below the stale threshold.
    Missed(u32),
    /// The silence reached the stale threshold.
    Stale,
}

/// Tracks the time of the last inbound frame on one channel.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    missed_limit: u32,
    last_seen: Instant,
}

impl HeartbeatMonitor {
    /// Creates a monitor that considers the link stale after `missed_limit`
    /// silent intervals.  `missed_limit` is clamped to at least 1.
    pub fn new(interval: Duration, missed_limit: u32, now: Instant) -> Self {
        Self {
            interval,
            missed_limit: missed_limit.max(1),
            last_seen: now,
        }
    }

    /// Records that a frame arrived at `now`.
    pub fn record(&mut self, now: Instant) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Counts whole silent intervals since the last frame.
    pub fn check(&self, now: Instant) -> Liveness {
        let silent = now.saturating_duration_since(self.last_seen);
        let interval_nanos = self.interval.as_nanos().max(1);
        let missed = (silent.as_nanos() / interval_nanos).min(u32::MAX as u128) as u32;

        if missed >= self.missed_limit {
            Liveness::Stale
        } else if missed == 0 {
            Liveness::Alive
        } else {
            Liveness::Missed(missed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_path_active_stale_grace_expired() {
        let state = LinkState::Active
            .on(LinkEvent::HeartbeatsMissed)
            .on(LinkEvent::TransportClosed)
            .on(LinkEvent::GraceElapsed);
        assert_eq!(state, LinkState::Expired);
    }

    #[test]
    fn test_stale_recovers_on_activity() {
        let state = LinkState::Stale.on(LinkEvent::ActivityObserved);
        assert_eq!(state, LinkState::Active);
    }

    #[test]
    fn test_grace_period_resumes_to_active() {
        let state = LinkState::GracePeriod.on(LinkEvent::Resumed);
        assert_eq!(state, LinkState::Active);
    }

    #[test]
    fn test_expired_is_absorbing() {
        for event in [
            LinkEvent::ActivityObserved,
            LinkEvent::Resumed,
            LinkEvent::TransportClosed,
        ] {
            assert_eq!(LinkState::Expired.on(event), LinkState::Expired);
        }
    }

    #[test]
    fn test_grace_elapsed_while_active_is_ignored() {
        // A stale timer firing after a resume must not expire a live session.
        assert_eq!(
            LinkState::Active.on(LinkEvent::GraceElapsed),
            LinkState::Active
        );
    }

    #[test]
    fn test_activity_does_not_revive_grace_period() {
        assert_eq!(
            LinkState::GracePeriod.on(LinkEvent::ActivityObserved),
            LinkState::GracePeriod
        );
    }

    #[test]
    fn test_only_expired_is_not_resumable() {
        assert!(LinkState::Active.is_resumable());
        assert!(LinkState::Stale.is_resumable());
        assert!(LinkState::GracePeriod.is_resumable());
        assert!(!LinkState::Expired.is_resumable());
    }

    #[test]
    fn test_monitor_alive_within_first_interval() {
        let t0 = Instant::now();
        let monitor = HeartbeatMonitor::new(Duration::from_secs(10), 3, t0);
        assert_eq!(monitor.check(t0 + Duration::from_secs(9)), Liveness::Alive);
    }

    #[test]
    fn test_monitor_counts_missed_intervals() {
        let t0 = Instant::now();
        let monitor = HeartbeatMonitor::new(Duration::from_secs(10), 3, t0);
        assert_eq!(
            monitor.check(t0 + Duration::from_secs(25)),
            Liveness::Missed(2)
        );
    }

    #[test]
    fn test_monitor_stale_after_three_missed() {
        // Arrange
        let t0 = Instant::now();
        let monitor = HeartbeatMonitor::new(Duration::from_secs(10), 3, t0);

        // Act
        let verdict = monitor.check(t0 + Duration::from_secs(30));

        // Assert
        assert_eq!(verdict, Liveness::Stale);
    }

    #[test]
    fn test_record_resets_silence() {
        let t0 = Instant::now();
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(10), 3, t0);
        monitor.record(t0 + Duration::from_secs(25));
        assert_eq!(
            monitor.check(t0 + Duration::from_secs(30)),
            Liveness::Alive
        );
    }

    #[test]
    fn test_record_ignores_older_instant() {
        let t0 = Instant::now();
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(10), 3, t0);
        monitor.record(t0 + Duration::from_secs(5));
        monitor.record(t0);
        assert_eq!(monitor.last_seen(), t0 + Duration::from_secs(5));
    }
}
