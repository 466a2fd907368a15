//! relay-host library crate.
//!
//! The desktop side of Prompt Relay: it shows a pairing code, accepts the
//! phone's WebSocket connection, and hands every prompt to a consumer (the
//! editor extension) exactly once and in order.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Phone (JSON frames over WebSocket)
//!         ↕
//! [relay-host]
//!   ├── application/        Pairing authority, session registry, message
//!   │                       router, relay service
//!   └── infrastructure/
//!         ├── relay_server/ WebSocket accept loop (tokio-tungstenite)
//!         ├── network/      LAN address for the QR payload
//!         ├── storage/      host.toml
//!         └── consumer/     JSON lines on stdout / mpsc channel
//!         ↕
//! Editor extension (reads stdout, or embeds the library)
//! ```
//!
//! # Layer rules
//!
//! - The domain lives in `relay-core`: frames, codes, reorder buffer, link
//!   state.  No I/O.
//! - `application` depends on `relay-core` and Tokio primitives (tasks,
//!   channels, locks) but opens no sockets or files.
//! - `infrastructure` depends on everything plus `tokio-tungstenite`,
//!   `local-ip-address` and `toml`.

/// Application layer: pairing, sessions, routing.
pub mod application;

/// Infrastructure layer: WebSocket server, address resolver, config, consumers.
pub mod infrastructure;
