//! Cryptographic utilities for the daemon
//!
//! This module provides:
//! - SHA-256 digests for transactions and blocks
//! - secp256k1 public keys identifying a blockchain network

pub mod hash;
pub mod keys;

pub use hash::{sha256, sha256_hex, Sha256, HASH_SIZE};
pub use keys::{random_pubkey, KeyError, PubKey, PUBKEY_SIZE};
