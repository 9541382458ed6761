//! Disconnect reasons and their stable wire codes.
//!
//! The code table is append-only: a code, once assigned, keeps its meaning
//! forever. `0` means "no error". Codes a peer sends that are not in the
//! table decode to [`DisconnectReason::Unknown`] instead of failing, so
//! daemons of different versions can still tell each other why they hang up.

use crate::wire::WireError;
use std::fmt;

/// Reserved code meaning "no error"
pub const NO_ERROR_CODE: u16 = 0;

/// Code of [`DisconnectReason::Unknown`]
pub const UNKNOWN_REASON_CODE: u16 = 1;

/// Why a connection was (or is about to be) closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// A code not present in this daemon's table
    Unknown,
    InvalidVersion,
    IntroductionTimeout,
    IsBlacklisted,
    SelfConnect,
    ConnectedTwice,
    Idle,
    NoIntroduction,
    IPLimitReached,
    MaxOutgoingConnectionsReached,
    FailedSend,
    InvalidExtraData,
    ReceivedDisconnect,
    BlockchainPubkeyNotMatched,
    MalformedMessage,
    BufferUnderflow,
    UnknownMessage,
    OtherError,
    ReadFailed,
    PoolShutdown,
}

const CODE_TABLE: [(DisconnectReason, u16); 20] = [
    (DisconnectReason::Unknown, UNKNOWN_REASON_CODE),
    (DisconnectReason::InvalidVersion, 2),
    (DisconnectReason::IntroductionTimeout, 3),
    (DisconnectReason::IsBlacklisted, 4),
    (DisconnectReason::SelfConnect, 5),
    (DisconnectReason::ConnectedTwice, 6),
    (DisconnectReason::Idle, 7),
    (DisconnectReason::NoIntroduction, 8),
    (DisconnectReason::IPLimitReached, 9),
    (DisconnectReason::MaxOutgoingConnectionsReached, 10),
    (DisconnectReason::FailedSend, 11),
    (DisconnectReason::InvalidExtraData, 12),
    (DisconnectReason::ReceivedDisconnect, 13),
    (DisconnectReason::BlockchainPubkeyNotMatched, 14),
    (DisconnectReason::MalformedMessage, 15),
    (DisconnectReason::BufferUnderflow, 16),
    (DisconnectReason::UnknownMessage, 17),
    (DisconnectReason::OtherError, 18),
    (DisconnectReason::ReadFailed, 19),
    (DisconnectReason::PoolShutdown, 20),
];

impl DisconnectReason {
    /// Stable wire code
    pub fn code(&self) -> u16 {
        CODE_TABLE
            .iter()
            .find(|(reason, _)| reason == self)
            .map(|(_, code)| *code)
            .unwrap_or(UNKNOWN_REASON_CODE)
    }

    /// Reason for a wire code; unknown and reserved codes map to `Unknown`
    pub fn from_code(code: u16) -> Self {
        CODE_TABLE
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(reason, _)| *reason)
            .unwrap_or(DisconnectReason::Unknown)
    }

    /// The protocol violation a codec error represents
    pub fn from_wire_error(err: &WireError) -> Self {
        match err {
            WireError::BufferUnderflow { .. } => DisconnectReason::BufferUnderflow,
            WireError::UnknownPrefix(_) => DisconnectReason::UnknownMessage,
            WireError::InvalidPrefix(_)
            | WireError::Malformed(_)
            | WireError::MessageTooLarge { .. } => DisconnectReason::MalformedMessage,
            WireError::Io(_) => DisconnectReason::ReadFailed,
            WireError::DuplicatePrefix(_)
            | WireError::DuplicateType(_)
            | WireError::Unregistered(_) => DisconnectReason::OtherError,
        }
    }

    /// Whether the remote address is blacklisted after this disconnect
    pub fn should_blacklist(&self) -> bool {
        matches!(
            self,
            DisconnectReason::InvalidVersion
                | DisconnectReason::InvalidExtraData
                | DisconnectReason::BlockchainPubkeyNotMatched
                | DisconnectReason::MalformedMessage
                | DisconnectReason::BufferUnderflow
                | DisconnectReason::UnknownMessage
        )
    }

    /// Whether the reason should be sent to the peer before closing
    pub fn notify_peer(&self) -> bool {
        !matches!(
            self,
            DisconnectReason::ReadFailed
                | DisconnectReason::FailedSend
                | DisconnectReason::ReceivedDisconnect
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::Unknown => "unknown disconnect reason",
            DisconnectReason::InvalidVersion => "version is not supported",
            DisconnectReason::IntroductionTimeout => "introduction timeout",
            DisconnectReason::IsBlacklisted => "blacklisted",
            DisconnectReason::SelfConnect => "self connect",
            DisconnectReason::ConnectedTwice => "already connected",
            DisconnectReason::Idle => "idle",
            DisconnectReason::NoIntroduction => "first message was not an introduction",
            DisconnectReason::IPLimitReached => "maximum number of connections for this IP was reached",
            DisconnectReason::MaxOutgoingConnectionsReached => "maximum outgoing connections was reached",
            DisconnectReason::FailedSend => "failed to send message",
            DisconnectReason::InvalidExtraData => "invalid extra data in introduction",
            DisconnectReason::ReceivedDisconnect => "received disconnect message",
            DisconnectReason::BlockchainPubkeyNotMatched => "blockchain pubkey does not match",
            DisconnectReason::MalformedMessage => "malformed message",
            DisconnectReason::BufferUnderflow => "buffer underflow",
            DisconnectReason::UnknownMessage => "unknown message",
            DisconnectReason::OtherError => "incomprehensible error",
            DisconnectReason::ReadFailed => "read failed",
            DisconnectReason::PoolShutdown => "connection pool shutting down",
        };
        f.write_str(s)
    }
}
