//! Network message types for P2P communication
//!
//! Defines every message exchanged between daemons and its body layout.
//! Framing and prefix registration live in `codec` and `registry`; the
//! handle/process behaviour of each message lives in `daemon::messages`.

use crate::core::{SignedBlock, Transaction};
use crate::crypto::{Sha256, PUBKEY_SIZE};
use crate::wire::{decode_exact, WireEncode, WireError, WireResult};
use crate::wire_struct;
use bytes::BufMut;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Protocol version spoken by this daemon
pub const PROTOCOL_VERSION: i32 = 2;

/// Maximum peers sent in one `GivePeers`
pub const MAX_PEERS_PER_MESSAGE: usize = 100;

// =============================================================================
// Message kinds
// =============================================================================

/// The concrete message types known to the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Introduction,
    GetPeers,
    GivePeers,
    Ping,
    Pong,
    GetBlocks,
    GiveBlocks,
    AnnounceBlocks,
    GetTransactions,
    GiveTransactions,
    AnnounceTransactions,
    Disconnect,
}

impl MessageKind {
    /// Every message kind, in registration order
    pub const ALL: [MessageKind; 12] = [
        MessageKind::Introduction,
        MessageKind::GetPeers,
        MessageKind::GivePeers,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::GetBlocks,
        MessageKind::GiveBlocks,
        MessageKind::AnnounceBlocks,
        MessageKind::GetTransactions,
        MessageKind::GiveTransactions,
        MessageKind::AnnounceTransactions,
        MessageKind::Disconnect,
    ];

    /// The wire prefix this kind is registered under by default
    pub fn default_prefix(&self) -> &'static str {
        match self {
            MessageKind::Introduction => "INTR",
            MessageKind::GetPeers => "GETP",
            MessageKind::GivePeers => "GIVP",
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
            MessageKind::GetBlocks => "GETB",
            MessageKind::GiveBlocks => "GIVB",
            MessageKind::AnnounceBlocks => "ANNB",
            MessageKind::GetTransactions => "GETT",
            MessageKind::GiveTransactions => "GIVT",
            MessageKind::AnnounceTransactions => "ANNT",
            MessageKind::Disconnect => "DISC",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Handshake sent immediately after a socket connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroductionMessage {
    /// Random value the sender generated at startup
    pub mirror: u32,
    /// Port the sender accepts connections on
    pub listen_port: u16,
    pub protocol_version: i32,
    /// Optional [`IntroductionExtra`]
    pub extra: Vec<u8>,
}

wire_struct!(IntroductionMessage {
    mirror,
    listen_port,
    protocol_version,
    extra
});

/// Trailing handshake data: the blockchain public key, then a user agent.
///
/// Layout: empty, or 33 key bytes, optionally followed by a length-prefixed
/// UTF-8 user agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntroductionExtra {
    pub pubkey: Option<[u8; PUBKEY_SIZE]>,
    pub user_agent: Option<String>,
}

impl IntroductionExtra {
    pub fn parse(extra: &[u8]) -> WireResult<Self> {
        if extra.is_empty() {
            return Ok(Self::default());
        }
        if extra.len() < PUBKEY_SIZE {
            return Err(WireError::Malformed(format!(
                "extra data of {} bytes is shorter than a public key",
                extra.len()
            )));
        }

        let mut pubkey = [0u8; PUBKEY_SIZE];
        pubkey.copy_from_slice(&extra[..PUBKEY_SIZE]);

        let rest = &extra[PUBKEY_SIZE..];
        let user_agent = if rest.is_empty() {
            None
        } else {
            Some(decode_exact::<String>(rest)?)
        };

        Ok(Self {
            pubkey: Some(pubkey),
            user_agent,
        })
    }

    /// Encode for the introduction's `extra` field. A user agent is only
    /// sent together with a public key.
    pub fn to_bytes(&self) -> Vec<u8> {
        let Some(pubkey) = self.pubkey else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(PUBKEY_SIZE);
        out.extend_from_slice(&pubkey);
        if let Some(agent) = &self.user_agent {
            agent.encode(&mut out);
        }
        out
    }
}

/// Request for known peer addresses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetPeersMessage {}

wire_struct!(GetPeersMessage {});

/// An IPv4 peer address as exchanged in `GivePeers`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub ip: u32,
    pub port: u16,
}

wire_struct!(PeerAddress { ip, port });

impl PeerAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            ip: u32::from(ip),
            port,
        }
    }

    /// Parse an `ip:port` string; only IPv4 addresses are exchanged
    pub fn from_addr_str(addr: &str) -> Option<Self> {
        addr.parse::<SocketAddrV4>()
            .ok()
            .map(|sa| Self::new(*sa.ip(), sa.port()))
    }

    pub fn to_addr_string(&self) -> String {
        SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port).to_string()
    }
}

/// Response to `GetPeers`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GivePeersMessage {
    pub peers: Vec<PeerAddress>,
}

wire_struct!(GivePeersMessage { peers });

/// Liveness probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingMessage {}

wire_struct!(PingMessage {});

/// Reply to `Ping`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PongMessage {}

wire_struct!(PongMessage {});

/// Request blocks after `last_block`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksMessage {
    pub last_block: u64,
    pub requested_blocks: u64,
}

wire_struct!(GetBlocksMessage {
    last_block,
    requested_blocks
});

/// Blocks sent in response to `GetBlocks`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiveBlocksMessage {
    pub blocks: Vec<SignedBlock>,
}

wire_struct!(GiveBlocksMessage { blocks });

/// Tells a peer our chain head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceBlocksMessage {
    pub max_bk_seq: u64,
}

wire_struct!(AnnounceBlocksMessage { max_bk_seq });

/// Request transactions by hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetTxnsMessage {
    pub txns: Vec<Sha256>,
}

wire_struct!(GetTxnsMessage { txns });

/// Transactions sent in response to `GetTxns`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiveTxnsMessage {
    pub txns: Vec<Transaction>,
}

wire_struct!(GiveTxnsMessage { txns });

/// Announces unconfirmed transactions by hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceTxnsMessage {
    pub txns: Vec<Sha256>,
}

wire_struct!(AnnounceTxnsMessage { txns });

/// Sent before closing a connection, carrying the disconnect reason code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectMessage {
    pub reason: u16,
    pub reserved: Vec<u8>,
}

wire_struct!(DisconnectMessage { reason, reserved });

// =============================================================================
// Message
// =============================================================================

/// Any message the daemon sends or receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Introduction(IntroductionMessage),
    GetPeers(GetPeersMessage),
    GivePeers(GivePeersMessage),
    Ping(PingMessage),
    Pong(PongMessage),
    GetBlocks(GetBlocksMessage),
    GiveBlocks(GiveBlocksMessage),
    AnnounceBlocks(AnnounceBlocksMessage),
    GetTxns(GetTxnsMessage),
    GiveTxns(GiveTxnsMessage),
    AnnounceTxns(AnnounceTxnsMessage),
    Disconnect(DisconnectMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Introduction(_) => MessageKind::Introduction,
            Message::GetPeers(_) => MessageKind::GetPeers,
            Message::GivePeers(_) => MessageKind::GivePeers,
            Message::Ping(_) => MessageKind::Ping,
            Message::Pong(_) => MessageKind::Pong,
            Message::GetBlocks(_) => MessageKind::GetBlocks,
            Message::GiveBlocks(_) => MessageKind::GiveBlocks,
            Message::AnnounceBlocks(_) => MessageKind::AnnounceBlocks,
            Message::GetTxns(_) => MessageKind::GetTransactions,
            Message::GiveTxns(_) => MessageKind::GiveTransactions,
            Message::AnnounceTxns(_) => MessageKind::AnnounceTransactions,
            Message::Disconnect(_) => MessageKind::Disconnect,
        }
    }

    /// Exact size of the body, excluding length and prefix
    pub fn body_size(&self) -> usize {
        match self {
            Message::Introduction(m) => m.encode_size(),
            Message::GetPeers(m) => m.encode_size(),
            Message::GivePeers(m) => m.encode_size(),
            Message::Ping(m) => m.encode_size(),
            Message::Pong(m) => m.encode_size(),
            Message::GetBlocks(m) => m.encode_size(),
            Message::GiveBlocks(m) => m.encode_size(),
            Message::AnnounceBlocks(m) => m.encode_size(),
            Message::GetTxns(m) => m.encode_size(),
            Message::GiveTxns(m) => m.encode_size(),
            Message::AnnounceTxns(m) => m.encode_size(),
            Message::Disconnect(m) => m.encode_size(),
        }
    }

    pub fn encode_body<B: BufMut>(&self, buf: &mut B) {
        match self {
            Message::Introduction(m) => m.encode(buf),
            Message::GetPeers(m) => m.encode(buf),
            Message::GivePeers(m) => m.encode(buf),
            Message::Ping(m) => m.encode(buf),
            Message::Pong(m) => m.encode(buf),
            Message::GetBlocks(m) => m.encode(buf),
            Message::GiveBlocks(m) => m.encode(buf),
            Message::AnnounceBlocks(m) => m.encode(buf),
            Message::GetTxns(m) => m.encode(buf),
            Message::GiveTxns(m) => m.encode(buf),
            Message::AnnounceTxns(m) => m.encode(buf),
            Message::Disconnect(m) => m.encode(buf),
        }
    }

    /// Decode a body that must be consumed exactly
    pub fn decode_body(kind: MessageKind, body: &[u8]) -> WireResult<Self> {
        Ok(match kind {
            MessageKind::Introduction => Message::Introduction(decode_exact(body)?),
            MessageKind::GetPeers => Message::GetPeers(decode_exact(body)?),
            MessageKind::GivePeers => Message::GivePeers(decode_exact(body)?),
            MessageKind::Ping => Message::Ping(decode_exact(body)?),
            MessageKind::Pong => Message::Pong(decode_exact(body)?),
            MessageKind::GetBlocks => Message::GetBlocks(decode_exact(body)?),
            MessageKind::GiveBlocks => Message::GiveBlocks(decode_exact(body)?),
            MessageKind::AnnounceBlocks => Message::AnnounceBlocks(decode_exact(body)?),
            MessageKind::GetTransactions => Message::GetTxns(decode_exact(body)?),
            MessageKind::GiveTransactions => Message::GiveTxns(decode_exact(body)?),
            MessageKind::AnnounceTransactions => Message::AnnounceTxns(decode_exact(body)?),
            MessageKind::Disconnect => Message::Disconnect(decode_exact(body)?),
        })
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Introduction(_) => "Introduction",
            Message::GetPeers(_) => "GetPeers",
            Message::GivePeers(_) => "GivePeers",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::GetBlocks(_) => "GetBlocks",
            Message::GiveBlocks(_) => "GiveBlocks",
            Message::AnnounceBlocks(_) => "AnnounceBlocks",
            Message::GetTxns(_) => "GetTxns",
            Message::GiveTxns(_) => "GiveTxns",
            Message::AnnounceTxns(_) => "AnnounceTxns",
            Message::Disconnect(_) => "Disconnect",
        }
    }
}
