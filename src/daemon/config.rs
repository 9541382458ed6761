//! Daemon configuration
//!
//! Loaded from a JSON file when one is given, otherwise built from defaults.
//! Command line flags override individual fields; `validate` runs last.

use crate::crypto::{KeyError, PubKey};
use crate::network::message::PROTOCOL_VERSION;
use crate::network::pool::PoolConfig;
use crate::wire::PREFIX_SIZE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Longest accepted timer period or timeout (one year)
pub const MAX_PERIOD_SECS: u64 = 365 * 24 * 60 * 60;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid blockchain public key: {0}")]
    InvalidPubkey(#[from] KeyError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything the daemon needs to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Interface to listen on
    pub address: String,
    pub port: u16,
    pub protocol_version: i32,
    pub data_dir: PathBuf,
    /// Bootstrap peers, dialed first and never promoted to the peer book
    pub default_connections: Vec<String>,
    pub disable_outgoing: bool,

    pub max_connections: usize,
    pub max_outgoing_connections: usize,
    pub max_pending_connections: usize,
    pub max_incoming_per_ip: usize,
    pub max_known_peers: usize,

    pub outgoing_rate_secs: u64,
    pub stale_check_rate_secs: u64,
    pub ping_rate_secs: u64,
    pub peers_request_rate_secs: u64,
    pub blacklist_sweep_rate_secs: u64,
    pub flush_announced_rate_secs: u64,
    pub rebroadcast_rate_secs: u64,
    pub blocks_request_rate_secs: u64,
    pub blocks_announce_rate_secs: u64,

    pub introduction_timeout_secs: u64,
    pub idle_limit_secs: u64,
    pub dial_timeout_secs: u64,
    pub blacklist_secs: u64,

    pub ready_queue_size: usize,
    pub event_queue_size: usize,
    pub dial_failure_queue_size: usize,
    pub write_queue_size: usize,

    pub max_message_length: usize,
    pub peers_per_message: usize,
    pub blocks_response_count: u64,

    /// Hex compressed secp256k1 key identifying the network
    pub blockchain_pubkey: Option<String>,
    /// Timestamp of the genesis block every peer must share
    pub genesis_time: u64,
    pub user_agent: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 6000,
            protocol_version: PROTOCOL_VERSION,
            data_dir: PathBuf::from(".chain_daemon"),
            default_connections: Vec::new(),
            disable_outgoing: false,

            max_connections: 128,
            max_outgoing_connections: 8,
            max_pending_connections: 8,
            max_incoming_per_ip: 4,
            max_known_peers: 1000,

            outgoing_rate_secs: 5,
            stale_check_rate_secs: 1,
            ping_rate_secs: 30,
            peers_request_rate_secs: 60,
            blacklist_sweep_rate_secs: 60,
            flush_announced_rate_secs: 3,
            rebroadcast_rate_secs: 300,
            blocks_request_rate_secs: 60,
            blocks_announce_rate_secs: 60,

            introduction_timeout_secs: 30,
            idle_limit_secs: 90,
            dial_timeout_secs: 10,
            blacklist_secs: 3600,

            ready_queue_size: 1024,
            event_queue_size: 256,
            dial_failure_queue_size: 256,
            write_queue_size: 256,

            max_message_length: crate::network::codec::DEFAULT_MAX_MESSAGE_LENGTH,
            peers_per_message: crate::network::message::MAX_PEERS_PER_MESSAGE,
            blocks_response_count: 20,

            blockchain_pubkey: None,
            genesis_time: 1_700_000_000,
            user_agent: format!("chain-daemon:{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DaemonConfig {
    /// Read a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: DaemonConfig = serde_json::from_str(&content)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.into()))
        }

        if self.port == 0 {
            return invalid("port must be nonzero");
        }
        if self.max_connections == 0 {
            return invalid("max_connections must be positive");
        }
        if self.max_outgoing_connections > self.max_connections {
            return invalid("max_outgoing_connections exceeds max_connections");
        }
        if self.max_pending_connections == 0 || self.max_incoming_per_ip == 0 {
            return invalid("pending and per-IP limits must be positive");
        }

        let rates = [
            ("outgoing_rate_secs", self.outgoing_rate_secs),
            ("stale_check_rate_secs", self.stale_check_rate_secs),
            ("ping_rate_secs", self.ping_rate_secs),
            ("peers_request_rate_secs", self.peers_request_rate_secs),
            ("blacklist_sweep_rate_secs", self.blacklist_sweep_rate_secs),
            ("flush_announced_rate_secs", self.flush_announced_rate_secs),
            ("rebroadcast_rate_secs", self.rebroadcast_rate_secs),
            ("blocks_request_rate_secs", self.blocks_request_rate_secs),
            ("blocks_announce_rate_secs", self.blocks_announce_rate_secs),
            ("introduction_timeout_secs", self.introduction_timeout_secs),
            ("idle_limit_secs", self.idle_limit_secs),
            ("dial_timeout_secs", self.dial_timeout_secs),
        ];
        if let Some((name, _)) = rates.iter().find(|(_, v)| *v == 0) {
            return invalid(format!("{} must be positive", name));
        }
        if let Some((name, value)) = rates.iter().find(|(_, v)| *v > MAX_PERIOD_SECS) {
            return invalid(format!(
                "{} is {}, at most {} allowed",
                name, value, MAX_PERIOD_SECS
            ));
        }
        if self.blacklist_secs > MAX_PERIOD_SECS {
            return invalid("blacklist_secs exceeds one year");
        }

        let queues = [
            self.ready_queue_size,
            self.event_queue_size,
            self.dial_failure_queue_size,
            self.write_queue_size,
        ];
        if queues.contains(&0) {
            return invalid("queue sizes must be positive");
        }

        if self.max_message_length < PREFIX_SIZE || self.max_message_length > u32::MAX as usize {
            return invalid(format!(
                "max_message_length {} out of range",
                self.max_message_length
            ));
        }
        if self.blocks_response_count == 0 {
            return invalid("blocks_response_count must be positive");
        }

        for peer in &self.default_connections {
            if peer.parse::<SocketAddr>().is_err() {
                return invalid(format!("default connection {} is not ip:port", peer));
            }
        }
        if self.listen_addr().parse::<SocketAddr>().is_err() {
            return invalid(format!("listen address {} is invalid", self.listen_addr()));
        }

        self.blockchain_pubkey()?;
        Ok(())
    }

    /// The configured network identity, if any
    pub fn blockchain_pubkey(&self) -> Result<Option<PubKey>, ConfigError> {
        self.blockchain_pubkey
            .as_deref()
            .map(PubKey::from_hex)
            .transpose()
            .map_err(Into::into)
    }

    pub fn listen_addr(&self) -> String {
        SocketAddr::new(
            self.address
                .parse()
                .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
            self.port,
        )
        .to_string()
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            write_queue_size: self.write_queue_size,
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            max_message_length: self.max_message_length,
        }
    }

    pub fn blacklist_duration(&self) -> Duration {
        Duration::from_secs(self.blacklist_secs)
    }

    pub fn introduction_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.introduction_timeout_secs as i64)
    }

    pub fn idle_limit(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_limit_secs as i64)
    }
}
