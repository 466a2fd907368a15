//! # relay-core
//!
//! Shared library for Prompt Relay containing the wire protocol, sequence
//! numbering, and the delivery-ordering primitives used by both the desktop
//! host and the mobile-side client.
//!
//! This crate has zero dependencies on sockets, async runtimes, or the
//! operating system.  Every type that depends on time takes an explicit
//! `Instant` argument so the behaviour is fully deterministic under test.
//!
//! # Architecture overview
//!
//! Prompt Relay forwards short text prompts typed on a phone to a code-editor
//! extension on the desktop.  The phone pairs with the desktop by submitting a
//! short numeric code, then streams prompts over a WebSocket.
//!
//! - **`protocol`** – How frames travel over the network.  Every frame is a
//!   JSON object `{type, seq, sessionId?, payload?}` carried in one WebSocket
//!   text message.
//!
//! - **`domain`** – Pure logic with no I/O: pairing codes and the QR payload,
//!   session identifiers and statuses, the receive-side reorder buffer, the
//!   send-side outbox, and the link state machine that drives reconnection.

pub mod domain;
pub mod protocol;

pub use domain::link::{HeartbeatMonitor, LinkEvent, LinkState, Liveness};
pub use domain::outbox::{Outbox, OutboxError};
pub use domain::pairing::{InvalidCode, PairingCode, PairingPayload};
pub use domain::reorder::{Delivery, PushOutcome, ReorderBuffer};
pub use domain::session::{SessionId, SessionStatus};
pub use protocol::codec::{decode_frame, encode_frame, ProtocolError};
pub use protocol::frame::{ErrorCode, Frame, FrameBody, FrameType, Message};
pub use protocol::sequence::SequenceCounter;
