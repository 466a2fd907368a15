//! Infrastructure layer for the relay client.
//!
//! - **`connection`** – Owns the WebSocket.  Connects, runs the handshake,
//!   sends heartbeats, and reconnects with `Resume` after a drop.

pub mod connection;

pub use connection::{ClientConfig, ClientError, RelayClient};
