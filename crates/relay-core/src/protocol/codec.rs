//! JSON codec for encoding and decoding relay frames.
//!
//! Wire format (one WebSocket text message per frame):
//!
//! ```text
//! {"type": <FrameType>, "seq": <u64>, "sessionId"?: <uuid>, "payload"?: <object>}
//! ```
//!
//! `seq` defaults to 0 when absent.  `payload` is required for `Pair`,
//! `Paired`, `Prompt`, `StatusChange` and `Error` and ignored otherwise.
//! `sessionId` is required for `Resume`, `Paired` and `Resumed`.
//!
//! Any violation is reported as a [`ProtocolError`]; the relay channel treats
//! every decode failure as fatal for the connection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::session::{SessionId, SessionStatus};
use crate::protocol::frame::{ErrorCode, Frame, FrameBody, FrameType};

/// Upper bound for one encoded frame, in bytes.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Upper bound for the text of one prompt, in bytes.
pub const MAX_PROMPT_BYTES: usize = 32 * 1024;

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The raw frame exceeds [`MAX_FRAME_BYTES`].
    #[error("frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    /// The frame is not valid JSON or does not match the envelope schema.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The frame type requires a payload but none was present.
    #[error("{0:?} frame is missing its payload")]
    MissingPayload(FrameType),

    /// The frame type requires a `sessionId` but none was present.
    #[error("{0:?} frame is missing sessionId")]
    MissingSessionId(FrameType),

    /// A prompt used sequence number 0, which is reserved.
    #[error("{0:?} frame has reserved sequence number 0")]
    ReservedSequence(FrameType),

    /// The prompt text exceeds [`MAX_PROMPT_BYTES`].
    #[error("prompt too large: {size} bytes (limit {limit})")]
    PromptTooLarge { size: usize, limit: usize },

    /// Serialization failed.
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

// ── Wire representation ───────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    #[serde(rename = "type")]
    frame_type: FrameType,
    #[serde(default)]
    seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairPayload {
    code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairedPayload {
    resume_grace_secs: u64,
    heartbeat_interval_secs: u64,
}

#[derive(Serialize, Deserialize)]
struct PromptPayload {
    text: String,
}

#[derive(Serialize, Deserialize)]
struct ErrorPayload {
    code: ErrorCode,
    description: String,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Frame`] into its JSON text form.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails.
///
/// # Examples
///
/// ```rust
/// use relay_core::protocol::{decode_frame, encode_frame, Frame};
///
/// let text = encode_frame(&Frame::prompt(1, "write docs")).unwrap();
/// assert_eq!(decode_frame(&text).unwrap(), Frame::prompt(1, "write docs"));
/// ```
pub fn encode_frame(frame: &Frame) -> Result<String, ProtocolError> {
    let payload = match &frame.body {
        FrameBody::Pair {
            code,
            client_name,
            client_id,
        } => Some(to_value(&PairPayload {
            code: code.clone(),
            client_name: client_name.clone(),
            client_id: client_id.clone(),
        })?),
        FrameBody::Paired {
            resume_grace_secs,
            heartbeat_interval_secs,
        } => Some(to_value(&PairedPayload {
            resume_grace_secs: *resume_grace_secs,
            heartbeat_interval_secs: *heartbeat_interval_secs,
        })?),
        FrameBody::Prompt { text } => Some(to_value(&PromptPayload { text: text.clone() })?),
        FrameBody::StatusChange { state } => Some(to_value(state)?),
        FrameBody::Error { code, description } => Some(to_value(&ErrorPayload {
            code: *code,
            description: description.clone(),
        })?),
        FrameBody::Resume
        | FrameBody::Resumed
        | FrameBody::Ack
        | FrameBody::Heartbeat
        | FrameBody::Disconnect => None,
    };

    let wire = WireFrame {
        frame_type: frame.frame_type(),
        seq: frame.seq,
        session_id: frame.session_id,
        payload,
    };

    serde_json::to_string(&wire).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decodes one [`Frame`] from its JSON text form.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the text is oversized, not valid JSON, or
/// violates the per-type rules listed in the module docs.
pub fn decode_frame(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            limit: MAX_FRAME_BYTES,
        });
    }

    let wire: WireFrame =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let frame_type = wire.frame_type;

    let body = match frame_type {
        FrameType::Pair => {
            let p: PairPayload = payload(frame_type, wire.payload)?;
            FrameBody::Pair {
                code: p.code,
                client_name: p.client_name,
                client_id: p.client_id,
            }
        }
        FrameType::Resume => {
            require_session(frame_type, wire.session_id)?;
            FrameBody::Resume
        }
        FrameType::Paired => {
            require_session(frame_type, wire.session_id)?;
            let p: PairedPayload = payload(frame_type, wire.payload)?;
            FrameBody::Paired {
                resume_grace_secs: p.resume_grace_secs,
                heartbeat_interval_secs: p.heartbeat_interval_secs,
            }
        }
        FrameType::Resumed => {
            require_session(frame_type, wire.session_id)?;
            FrameBody::Resumed
        }
        FrameType::Prompt => {
            if wire.seq == 0 {
                return Err(ProtocolError::ReservedSequence(frame_type));
            }
            let p: PromptPayload = payload(frame_type, wire.payload)?;
            if p.text.len() > MAX_PROMPT_BYTES {
                return Err(ProtocolError::PromptTooLarge {
                    size: p.text.len(),
                    limit: MAX_PROMPT_BYTES,
                });
            }
            FrameBody::Prompt { text: p.text }
        }
        FrameType::Ack => FrameBody::Ack,
        FrameType::Heartbeat => FrameBody::Heartbeat,
        FrameType::StatusChange => {
            let state: SessionStatus = payload(frame_type, wire.payload)?;
            FrameBody::StatusChange { state }
        }
        FrameType::Error => {
            let p: ErrorPayload = payload(frame_type, wire.payload)?;
            FrameBody::Error {
                code: p.code,
                description: p.description,
            }
        }
        FrameType::Disconnect => FrameBody::Disconnect,
    };

    Ok(Frame {
        seq: wire.seq,
        session_id: wire.session_id,
        body,
    })
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn payload<T: for<'de> Deserialize<'de>>(
    frame_type: FrameType,
    value: Option<serde_json::Value>,
) -> Result<T, ProtocolError> {
    let value = value.ok_or(ProtocolError::MissingPayload(frame_type))?;
    serde_json::from_value(value)
        .map_err(|e| ProtocolError::Malformed(format!("{frame_type:?} payload: {e}")))
}

fn require_session(
    frame_type: FrameType,
    session_id: Option<SessionId>,
) -> Result<SessionId, ProtocolError> {
    session_id.ok_or(ProtocolError::MissingSessionId(frame_type))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
