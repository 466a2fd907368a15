//! Application layer for the relay client.
//!
//! # Sub-modules
//!
//! - **`client_session`** – Pairing / resume handshakes, prompt numbering
//!   and the retransmit rules, as a plain state machine fed one host frame
//!   at a time.  No sockets, no timers.

pub mod client_session;

pub use client_session::{ClientEvent, ClientIdentity, ClientSession, Reaction, SessionError};
