//! Blockchain public keys
//!
//! Nodes on the same network share the blockchain's secp256k1 public key.
//! It travels in the introduction handshake as a 33-byte compressed key so
//! peers on a different chain can be told apart before any sync starts.

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use std::fmt;
use thiserror::Error;

/// Length of a compressed secp256k1 public key
pub const PUBKEY_SIZE: usize = 33;

/// Errors that can occur while parsing a public key
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid public key length: {0} (expected {PUBKEY_SIZE})")]
    InvalidLength(usize),
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A validated compressed secp256k1 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubKey([u8; PUBKEY_SIZE]);

impl PubKey {
    /// Parse and validate a compressed public key
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != PUBKEY_SIZE {
            return Err(KeyError::InvalidLength(bytes.len()));
        }
        // Rejects byte strings that are the right length but not a curve point
        let key = PublicKey::from_slice(bytes)?;
        Ok(Self(key.serialize()))
    }

    /// Parse a hex-encoded compressed public key
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }

    /// Derive the public key of a secret key
    pub fn from_secret_key(secret_key: &SecretKey) -> Self {
        let secp = Secp256k1::new();
        Self(PublicKey::from_secret_key(&secp, secret_key).serialize())
    }

    pub fn as_bytes(&self) -> &[u8; PUBKEY_SIZE] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", self.hex())
    }
}

/// Generate a random public key (used by tests and local test networks)
pub fn random_pubkey() -> PubKey {
    let secp = Secp256k1::new();
    let (_, public_key) = secp.generate_keypair(&mut rand::thread_rng());
    PubKey(public_key.serialize())
}
