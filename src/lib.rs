//! Chain-Daemon: the peer-to-peer layer of a blockchain node
//!
//! This crate provides:
//! - A binary wire protocol with length-prefixed frames and 4-byte prefixes
//! - A TCP connection pool with per-connection reader and writer tasks
//! - An introduction handshake with mirror-based duplicate detection
//! - A connection registry indexed by address, mirror and IP
//! - Block and transaction gossip through a narrow ledger interface
//! - A JSON-persisted peer book with IP blacklisting
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use chain_daemon::network::{FrameCodec, Message, MessageRegistry, PingMessage};
//! use chain_daemon::network::DEFAULT_MAX_MESSAGE_LENGTH;
//! use std::sync::Arc;
//! use tokio_util::codec::Encoder;
//!
//! let registry = Arc::new(MessageRegistry::standard().unwrap());
//! let mut codec = FrameCodec::new(registry, DEFAULT_MAX_MESSAGE_LENGTH);
//!
//! let mut frame = BytesMut::new();
//! codec.encode(Message::Ping(PingMessage {}), &mut frame).unwrap();
//! assert_eq!(&frame[4..8], b"PING");
//! ```

pub mod core;
pub mod crypto;
pub mod daemon;
pub mod network;
pub mod wire;

// Re-export commonly used types
pub use core::{Block, MemoryVisor, SignedBlock, Transaction, Visor};
pub use crypto::{PubKey, Sha256};
pub use daemon::{
    ConnectionRegistry, Daemon, DaemonConfig, EventLoop, MessageGate, NodeIdentity,
};
pub use network::{
    ConnectionPool, DisconnectReason, Message, MessageRegistry, PeerBook, Transport,
};
