//! Infrastructure layer for the relay host.
//!
//! The infrastructure layer handles all I/O: the WebSocket listener, network
//! interface enumeration, the config file, and the stream the consumer
//! reads.
//!
//! # Sub-modules
//!
//! - **`relay_server`** – Accept loop and per-connection reader / writer /
//!   heartbeat tasks (tokio-tungstenite).
//! - **`network`**      – Picks the LAN address that goes into the QR payload.
//! - **`storage`**      – `host.toml` loading, defaults and validation.
//! - **`consumer`**     – `PromptConsumer` implementations: JSON lines on
//!   stdout, or an in-process channel.
//!
//! # What does NOT belong here?
//!
//! - Pairing, session and ordering decisions (that is the application layer)
//! - Frame encoding rules (that is `relay-core`)

pub mod consumer;
pub mod network;
pub mod relay_server;
pub mod storage;

// Re-export the primary entry points so `main.rs` can call them concisely.
pub use consumer::{ChannelConsumer, ConsumerEvent, JsonLinesConsumer};
pub use relay_server::{ChannelError, RelayServer};
