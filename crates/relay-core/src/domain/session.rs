//! Session identity and status types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a paired session.
///
/// Generated by the desktop when a pairing code is consumed.  The pairing
/// code is a single-use credential; the session id is the durable identity
/// the phone presents when it reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a new random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Session status reported to the desktop consumer and, as `StatusChange`
/// frames, to the phone.
///
/// Serialized with an internal `"state"` tag:
///
/// ```json
/// {"state":"Connected"}
/// {"state":"Dropped","from":4,"to":6}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum SessionStatus {
    /// A phone is attached to the session (after pairing or resume).
    Connected,
    /// The phone's connection dropped; the session waits for a resume.
    Disconnected,
    /// The grace period elapsed or the phone disconnected for good; a new
    /// pairing is required.
    Expired,
    /// Prompts `from..=to` were never received and will not be delivered.
    Dropped { from: u64, to: u64 },
}

impl SessionStatus {
    /// Returns `true` if the session can no longer deliver prompts.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Expired)
    }
}
