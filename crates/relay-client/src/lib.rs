//! relay-client library entry point.
//!
//! Shares one module tree between the binary in `main.rs` and the
//! integration tests in `tests/`.
//!
//! # What does relay-client do? (for beginners)
//!
//! The relay client plays the phone's part of Prompt Relay.  A real mobile
//! app speaks the same protocol; this crate is the reference endpoint and
//! the driver for end-to-end tests.
//!
//! 1. Reads the pairing payload the host shows as a QR code (address, port,
//!    code) and connects to `ws://address:port`.
//! 2. Sends `Pair` with the code and waits for `Paired` and a session id.
//! 3. Numbers every prompt from 1 upward and keeps it until the host acks it.
//! 4. When the network drops, keeps numbering prompts offline, reconnects,
//!    sends `Resume`, and retransmits whatever the host has not delivered.

/// Application layer: the protocol state machine.
pub mod application;

/// Infrastructure layer: the WebSocket driver.
pub mod infrastructure;
