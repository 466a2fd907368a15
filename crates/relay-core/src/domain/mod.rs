//! Domain layer: pure delivery and pairing logic with no I/O.
//!
//! - [`pairing`] – pairing codes and the QR payload.
//! - [`session`] – session identifiers and consumer-facing statuses.
//! - [`reorder`] – receive side: restores prompt order, drops duplicates,
//!   gives up on permanent gaps.
//! - [`outbox`] – send side: numbers prompts and keeps them until acknowledged.
//! - [`link`] – heartbeat liveness and the reconnect state machine.

pub mod link;
pub mod outbox;
pub mod pairing;
pub mod reorder;
pub mod session;
