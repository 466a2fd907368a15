//! Pairing codes and the QR pairing payload.
//!
//! The desktop shows a QR code encoding a [`PairingPayload`].  The phone scans
//! it, opens a WebSocket to `address:port`, and sends the `code` in its first
//! frame.  A code is a short run of ASCII digits (6 by default) so it can
//! also be typed by hand when the camera is unavailable.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shortest accepted code length.
pub const MIN_CODE_LEN: usize = 4;
/// Longest accepted code length.
pub const MAX_CODE_LEN: usize = 10;
/// Default code length.
pub const DEFAULT_CODE_LEN: usize = 6;

/// Reasons a string is not a well-formed pairing code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidCode {
    #[error("pairing code must be {MIN_CODE_LEN}..={MAX_CODE_LEN} digits, got {0}")]
    BadLength(usize),
    #[error("pairing code must contain only ASCII digits")]
    NonDigit,
}

/// A short numeric pairing code.
///
/// Construction validates the charset and length, so any `PairingCode`
/// value is well-formed.  Uniqueness among live codes is enforced by the
/// pairing authority, not by this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PairingCode(String);

impl PairingCode {
    /// Validates `code` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidCode`] when `code` is too short, too long, or
    /// contains anything other than ASCII digits.
    pub fn new(code: impl Into<String>) -> Result<Self, InvalidCode> {
        let code = code.into();
        if !(MIN_CODE_LEN..=MAX_CODE_LEN).contains(&code.len()) {
            return Err(InvalidCode::BadLength(code.len()));
        }
        if !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidCode::NonDigit);
        }
        Ok(Self(code))
    }

    /// Builds a code of `len` digits from a number, zero-padding on the left.
    ///
    /// `value` is reduced modulo `10^len`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidCode::BadLength`] when `len` is out of range.
    pub fn from_number(value: u64, len: usize) -> Result<Self, InvalidCode> {
        if !(MIN_CODE_LEN..=MAX_CODE_LEN).contains(&len) {
            return Err(InvalidCode::BadLength(len));
        }
        let modulus = 10u64.pow(len as u32);
        Ok(Self(format!("{:0width$}", value % modulus, width = len)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PairingCode {
    type Error = InvalidCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PairingCode> for String {
    fn from(code: PairingCode) -> Self {
        code.0
    }
}

/// The tuple the phone needs to pair, encoded into the QR code as JSON.
///
/// ```json
/// {"address":"192.168.1.42","port":24900,"code":"309322"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingPayload {
    /// LAN address of the desktop host.
    pub address: Ipv4Addr,
    /// Port of the relay WebSocket endpoint.
    pub port: u16,
    /// The pairing code to submit.
    pub code: PairingCode,
    /// Set when no LAN address was found and the host fell back to loopback.
    /// A phone cannot reach such an address; the UI must say so.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub loopback_only: bool,
}

impl PairingPayload {
    /// Returns the WebSocket URL the phone should connect to.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.address, self.port)
    }
}
