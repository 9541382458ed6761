//! Cryptographic hashing utilities for the daemon
//!
//! Provides the SHA-256 digest type used to identify transactions and
//! blocks on the wire and in the announcement cache.

use sha2::{Digest, Sha256 as Sha256Hasher};
use std::fmt;

/// Size of a SHA-256 digest in bytes
pub const HASH_SIZE: usize = 32;

/// A SHA-256 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Sha256(pub [u8; HASH_SIZE]);

impl Sha256 {
    /// Hash arbitrary bytes
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256Hasher::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Parse a hex-encoded digest
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; HASH_SIZE];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The all-zero digest, used as the previous hash of a genesis block
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256({})", self.hex())
    }
}

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Sha256 {
    Sha256::digest(data)
}

/// Computes SHA-256 hash and returns it as a hex string
pub fn sha256_hex(data: &[u8]) -> String {
    sha256(data).hex()
}
