//! Frame and message types for the relay wire protocol.
//!
//! A [`Frame`] is one unit on the wire: a type tag, a sequence number, an
//! optional session id, and a typed body.  The JSON shape is produced by
//! [`crate::protocol::codec`]:
//!
//! ```json
//! {"type":"Prompt","seq":3,"sessionId":"6f0c…","payload":{"text":"add a test"}}
//! ```
//!
//! # Meaning of `seq` per frame type
//!
//! | Type           | Direction       | `seq` carries                                  |
//! |----------------|-----------------|------------------------------------------------|
//! | `Pair`         | phone → desktop | 0                                              |
//! | `Resume`       | phone → desktop | highest prompt seq the phone saw acknowledged  |
//! | `Paired`       | desktop → phone | 0                                              |
//! | `Resumed`      | desktop → phone | highest prompt seq delivered to the consumer   |
//! | `Prompt`       | either          | the sender's per-session prompt number (≥ 1)   |
//! | `Ack`          | either          | cumulative: everything ≤ `seq` was handed off  |
//! | `Heartbeat`    | either          | sender's current high-water mark (informational)|
//! | `StatusChange` | desktop → phone | desktop's outbound status number               |
//! | `Error`        | desktop → phone | 0                                              |
//! | `Disconnect`   | either          | 0                                              |
//!
//! Only `Prompt` numbers must be gapless; they are what the receiver orders
//! and acknowledges.  Control frames reuse `seq` for a high-water mark so a
//! heartbeat from the desktop doubles as an implicit acknowledgement.

use serde::{Deserialize, Serialize};

use crate::domain::session::{SessionId, SessionStatus};

/// The type tag carried in every frame's `"type"` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    Pair,
    Resume,
    Paired,
    Resumed,
    Prompt,
    Ack,
    Heartbeat,
    StatusChange,
    Error,
    Disconnect,
}

/// Machine-readable reason carried in an `Error` frame.
///
/// The phone uses this to pick a user-facing message ("code expired, scan
/// again") without parsing the free-text description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The submitted pairing code is unknown.
    UnknownCode,
    /// The submitted pairing code outlived its TTL.
    CodeExpired,
    /// The submitted pairing code was already used by another device.
    CodeConsumed,
    /// Too many failed pairing attempts from this address.
    LockedOut,
    /// A `Resume` referenced a session that no longer exists.
    UnknownSession,
    /// The peer sent a malformed or out-of-place frame.
    ProtocolViolation,
    /// A newer connection for the same session replaced this one.
    Superseded,
    /// The first frame did not arrive in time.
    HandshakeTimeout,
    /// The host cannot take new pairings right now; try again later.
    HostUnavailable,
}

/// One decoded unit of the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Sequence number; see the module docs for its meaning per type.
    pub seq: u64,
    /// Session this frame belongs to, when the frame refers to one.
    pub session_id: Option<SessionId>,
    /// Type-specific content.
    pub body: FrameBody,
}

/// Type-specific content of a [`Frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// First frame of a new connection: consume a pairing code.
    Pair {
        code: String,
        /// Display name of the phone, shown in the editor.
        client_name: Option<String>,
        /// Random id the phone keeps for its lifetime; lets a repeated
        /// `Pair` after a lost `Paired` reply be recognised as a retry.
        client_id: Option<String>,
    },
    /// First frame of a reconnection: reattach to an existing session.
    Resume,
    /// Pairing succeeded; `session_id` is set on the frame.
    Paired {
        resume_grace_secs: u64,
        heartbeat_interval_secs: u64,
    },
    /// Resume succeeded; `seq` is the delivery high-water mark.
    Resumed,
    /// A user prompt.
    Prompt { text: String },
    /// Cumulative acknowledgement of `seq`.
    Ack,
    /// Liveness signal.
    Heartbeat,
    /// Session status notification.
    StatusChange { state: SessionStatus },
    /// Fatal error; the sender closes the connection afterwards.
    Error { code: ErrorCode, description: String },
    /// Graceful end of the session.
    Disconnect,
}

impl Frame {
    /// Returns the wire type tag for this frame.
    pub fn frame_type(&self) -> FrameType {
        match self.body {
            FrameBody::Pair { .. } => FrameType::Pair,
            FrameBody::Resume => FrameType::Resume,
            FrameBody::Paired { .. } => FrameType::Paired,
            FrameBody::Resumed => FrameType::Resumed,
            FrameBody::Prompt { .. } => FrameType::Prompt,
            FrameBody::Ack => FrameType::Ack,
            FrameBody::Heartbeat => FrameType::Heartbeat,
            FrameBody::StatusChange { .. } => FrameType::StatusChange,
            FrameBody::Error { .. } => FrameType::Error,
            FrameBody::Disconnect => FrameType::Disconnect,
        }
    }

    pub fn pair(code: impl Into<String>, client_name: Option<String>) -> Self {
        Self {
            seq: 0,
            session_id: None,
            body: FrameBody::Pair {
                code: code.into(),
                client_name,
                client_id: None,
            },
        }
    }

    /// Sets the retry-detection id on a `Pair` frame; no-op for other types.
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        if let FrameBody::Pair { client_id, .. } = &mut self.body {
            *client_id = Some(id.into());
        }
        self
    }

    pub fn resume(session_id: SessionId, last_acked: u64) -> Self {
        Self {
            seq: last_acked,
            session_id: Some(session_id),
            body: FrameBody::Resume,
        }
    }

    pub fn paired(
        session_id: SessionId,
        resume_grace_secs: u64,
        heartbeat_interval_secs: u64,
    ) -> Self {
        Self {
            seq: 0,
            session_id: Some(session_id),
            body: FrameBody::Paired {
                resume_grace_secs,
                heartbeat_interval_secs,
            },
        }
    }

    pub fn resumed(session_id: SessionId, last_delivered: u64) -> Self {
        Self {
            seq: last_delivered,
            session_id: Some(session_id),
            body: FrameBody::Resumed,
        }
    }

    pub fn prompt(seq: u64, text: impl Into<String>) -> Self {
        Self {
            seq,
            session_id: None,
            body: FrameBody::Prompt { text: text.into() },
        }
    }

    pub fn ack(seq: u64) -> Self {
        Self {
            seq,
            session_id: None,
            body: FrameBody::Ack,
        }
    }

    pub fn heartbeat(high_water: u64) -> Self {
        Self {
            seq: high_water,
            session_id: None,
            body: FrameBody::Heartbeat,
        }
    }

    pub fn status(seq: u64, state: SessionStatus) -> Self {
        Self {
            seq,
            session_id: None,
            body: FrameBody::StatusChange { state },
        }
    }

    pub fn error(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            seq: 0,
            session_id: None,
            body: FrameBody::Error {
                code,
                description: description.into(),
            },
        }
    }

    pub fn disconnect() -> Self {
        Self {
            seq: 0,
            session_id: None,
            body: FrameBody::Disconnect,
        }
    }

    /// Attaches a session id to the frame.
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Extracts the application-level [`Message`] carried by this frame, if any.
    ///
    /// Handshake, error and disconnect frames are connection control and do
    /// not map to a message.
    pub fn to_message(&self) -> Option<Message> {
        match &self.body {
            FrameBody::Prompt { text } => Some(Message::Prompt {
                text: text.clone(),
                client_seq: self.seq,
            }),
            FrameBody::Ack => Some(Message::Ack { seq: self.seq }),
            FrameBody::Heartbeat => Some(Message::Heartbeat),
            FrameBody::StatusChange { state } => Some(Message::StatusChange {
                state: state.clone(),
            }),
            _ => None,
        }
    }
}

/// Application-level message exchanged over an established session.
///
/// Messages are ephemeral: constructed per send and discarded after delivery
/// or acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A prompt numbered by its sender.
    Prompt { text: String, client_seq: u64 },
    /// Cumulative acknowledgement.
    Ack { seq: u64 },
    /// Liveness signal.
    Heartbeat,
    /// Session status notification.
    StatusChange { state: SessionStatus },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_matches_body() {
        let id = SessionId::new();
        let cases = [
            (Frame::pair("123456", None), FrameType::Pair),
            (Frame::resume(id, 4), FrameType::Resume),
            (Frame::paired(id, 60, 10), FrameType::Paired),
            (Frame::resumed(id, 4), FrameType::Resumed),
            (Frame::prompt(1, "hi"), FrameType::Prompt),
            (Frame::ack(1), FrameType::Ack),
            (Frame::heartbeat(0), FrameType::Heartbeat),
            (
                Frame::status(1, SessionStatus::Connected),
                FrameType::StatusChange,
            ),
            (
                Frame::error(ErrorCode::UnknownCode, "nope"),
                FrameType::Error,
            ),
            (Frame::disconnect(), FrameType::Disconnect),
        ];

        for (frame, expected) in cases {
            assert_eq!(frame.frame_type(), expected);
        }
    }

    #[test]
    fn test_resume_carries_last_acked_in_seq() {
        let id = SessionId::new();
        let frame = Frame::resume(id, 17);
        assert_eq!(frame.seq, 17);
        assert_eq!(frame.session_id, Some(id));
    }

    #[test]
    fn test_prompt_frame_maps_to_prompt_message_with_client_seq() {
        // Arrange
        let frame = Frame::prompt(9, "refactor this");

        // Act
        let msg = frame.to_message();

        // Assert
        assert_eq!(
            msg,
            Some(Message::Prompt {
                text: "refactor this".to_string(),
                client_seq: 9,
            })
        );
    }

    #[test]
    fn test_handshake_frames_carry_no_message() {
        let id = SessionId::new();
        assert!(Frame::pair("000000", None).to_message().is_none());
        assert!(Frame::resumed(id, 0).to_message().is_none());
        assert!(Frame::disconnect().to_message().is_none());
    }

    #[test]
    fn test_with_client_id_only_touches_pair() {
        let pair = Frame::pair("123456", None).with_client_id("phone-1");
        assert!(matches!(
            pair.body,
            FrameBody::Pair { client_id: Some(ref id), .. } if id == "phone-1"
        ));
        assert_eq!(Frame::ack(1).with_client_id("x"), Frame::ack(1));
    }

    #[test]
    fn test_with_session_sets_id() {
        let id = SessionId::new();
        let frame = Frame::ack(3).with_session(id);
        assert_eq!(frame.session_id, Some(id));
    }
}
