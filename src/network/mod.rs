//! P2P networking module
//!
//! This module contains:
//! - Message types and their prefix registry
//! - Length-prefixed framing codec
//! - Disconnect reason codes
//! - Transport interface and the TCP connection pool
//! - Peer directory with JSON persistence

pub mod codec;
pub mod disconnect;
pub mod message;
pub mod peerbook;
pub mod pool;
pub mod registry;
pub mod transport;

pub use codec::{FrameCodec, DEFAULT_MAX_MESSAGE_LENGTH, LENGTH_SIZE};
pub use disconnect::{DisconnectReason, NO_ERROR_CODE, UNKNOWN_REASON_CODE};
pub use message::{
    AnnounceBlocksMessage, AnnounceTxnsMessage, DisconnectMessage, GetBlocksMessage,
    GetPeersMessage, GetTxnsMessage, GiveBlocksMessage, GivePeersMessage, GiveTxnsMessage,
    IntroductionExtra, IntroductionMessage, Message, MessageKind, PeerAddress, PingMessage,
    PongMessage, MAX_PEERS_PER_MESSAGE, PROTOCOL_VERSION,
};
pub use peerbook::{PeerBook, PeerBookError, PeerDirectory, PEERS_FILE};
pub use pool::{ConnectionPool, PoolConfig};
pub use registry::MessageRegistry;
pub use transport::{
    daemon_channels, ConnectionEvent, DaemonReceivers, DaemonSenders, DialFailure,
    InboundHandler, ReadyMessage, Transport, TransportError,
};
