//! Four-byte message type prefixes.
//!
//! A prefix is up to four ASCII alphanumerics, zero padded on the right:
//! `GIVB`, `PING`, or `AB\0\0`. No non-zero byte may follow a zero byte.

use crate::wire::{WireError, WireResult};
use std::fmt;
use std::str::FromStr;

/// Number of bytes in a message prefix.
pub const PREFIX_SIZE: usize = 4;

/// A validated message type prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessagePrefix([u8; PREFIX_SIZE]);

impl MessagePrefix {
    /// Validate raw prefix bytes read off the wire.
    pub fn new(bytes: [u8; PREFIX_SIZE]) -> WireResult<Self> {
        if bytes[0] == 0 {
            return Err(WireError::InvalidPrefix(bytes));
        }

        let mut seen_zero = false;
        for b in bytes {
            if b == 0 {
                seen_zero = true;
            } else if seen_zero || !b.is_ascii_alphanumeric() {
                return Err(WireError::InvalidPrefix(bytes));
            }
        }

        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PREFIX_SIZE] {
        &self.0
    }

    /// The prefix without its zero padding.
    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|b| *b == 0).unwrap_or(PREFIX_SIZE);
        // validated as ASCII alphanumerics
        std::str::from_utf8(&self.0[..len]).unwrap_or("")
    }
}

impl FromStr for MessagePrefix {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.as_bytes();
        let mut bytes = [0u8; PREFIX_SIZE];
        if raw.len() > PREFIX_SIZE {
            bytes.copy_from_slice(&raw[..PREFIX_SIZE]);
            return Err(WireError::InvalidPrefix(bytes));
        }
        bytes[..raw.len()].copy_from_slice(raw);
        Self::new(bytes)
    }
}

impl fmt::Display for MessagePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for MessagePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessagePrefix({:?})", self.as_str())
    }
}
