//! Network infrastructure for the host.
//!
//! # Sub-modules
//!
//! - **`address`** – Enumerates local interfaces and selects the IPv4 address
//!   embedded in the pairing QR payload.  This is how a phone on the same
//!   Wi-Fi finds the desktop without the user typing an IP address.

pub mod address;
