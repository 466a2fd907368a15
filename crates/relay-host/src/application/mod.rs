//! Application layer use cases for the relay host.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure rules in `relay-core`) and the infrastructure (sockets, files,
//! stdout).
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** domain objects to fulfil a user goal (e.g., "turn a
//!   scanned pairing code into a session the phone can stream prompts to").
//! - **Depend on abstractions** (the [`route_messages::PromptConsumer`]
//!   trait, plain `mpsc` channels) rather than concrete transports.
//! - **Contain no socket or file I/O**.
//!
//! # Sub-modules
//!
//! - **`pairing`**          – Issues single-use pairing codes and trades a
//!   valid one for a session, exactly once.
//!
//! - **`session_registry`** – The table of live sessions and which
//!   connection (if any) currently carries each one.
//!
//! - **`route_messages`**   – Per-session delivery tasks that reorder
//!   prompts and hand them to the consumer; outbound sends to the phone.
//!
//! - **`relay_service`**    – Ties the three together behind the operations
//!   the WebSocket server calls: pair, resume, channel closed.

pub mod pairing;
pub mod relay_service;
pub mod route_messages;
pub mod session_registry;

pub use relay_service::{CloseReason, PromptRejected, RelayService, RelaySettings, ServiceSettings};
pub use route_messages::{MessageRouter, PromptConsumer, RouterError, RouterSettings};

/// Current time as a `std` instant, read from Tokio's clock.
///
/// Reading through Tokio lets tests pause and advance time; the domain types
/// only ever see the `std::time::Instant` this returns.
pub fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}
