//! Node daemon
//!
//! This module contains:
//! - Connection registry with mirror and per-IP indexes
//! - Introduction handshake and identity
//! - Two-phase message dispatch
//! - Peer height tracking and transaction announcement stamps
//! - The event loop that owns all daemon state

pub mod announced;
pub mod config;
pub mod connections;
pub mod event_loop;
pub mod heights;
pub mod introduction;
pub mod messages;
pub mod state;

pub use announced::{now_nanos, AnnouncementCache};
pub use config::{ConfigError, DaemonConfig};
pub use connections::{split_addr, Connection, ConnectionError, ConnectionRegistry, ConnectionState};
pub use event_loop::{EventLoop, LoopContext};
pub use heights::{PeerBlockchainHeight, PeerHeightTracker};
pub use introduction::NodeIdentity;
pub use messages::{AsyncMessage, MessageContext, MessageGate};
pub use state::Daemon;
