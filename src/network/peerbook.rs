//! Peer directory
//!
//! Remembers addresses peers can be dialed on and which IPs are
//! temporarily banned. [`PeerBook`] persists both to `peers.json` in the
//! data directory.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name of the persisted peer book
pub const PEERS_FILE: &str = "peers.json";

/// Bans longer than this are clamped
const MAX_BAN_DAYS: i64 = 365 * 100;

/// Peer book errors
#[derive(Error, Debug)]
pub enum PeerBookError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Where the daemon finds peers to dial and who it refuses
pub trait PeerDirectory: Send {
    /// Record a dialable address. Returns false if it was rejected.
    fn add_peer(&mut self, addr: &str) -> bool;

    /// Forget `addr`
    fn remove_peer(&mut self, addr: &str);

    /// Whether the base IP of `addr` is banned
    fn is_blacklisted(&self, addr: &str) -> bool;

    /// Ban the base IP of `addr` for `duration`
    fn add_blacklist_entry(&mut self, addr: &str, duration: Duration);

    /// Up to `n` random known peers that are not banned
    fn random_peers(&self, n: usize) -> Vec<String>;

    /// Drop expired bans, returning how many were removed
    fn prune_blacklist(&mut self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save(&self) -> Result<(), PeerBookError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeerRecord {
    addr: String,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BanRecord {
    ip: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PeerBookFile {
    peers: Vec<PeerRecord>,
    blacklist: Vec<BanRecord>,
}

fn base_ip(addr: &str) -> Option<String> {
    addr.parse::<SocketAddr>()
        .ok()
        .map(|sa| sa.ip().to_string())
        .or_else(|| addr.parse::<std::net::IpAddr>().ok().map(|ip| ip.to_string()))
}

/// JSON-backed [`PeerDirectory`]
#[derive(Debug)]
pub struct PeerBook {
    path: Option<PathBuf>,
    max_peers: usize,
    peers: HashMap<String, DateTime<Utc>>,
    blacklist: HashMap<String, DateTime<Utc>>,
}

impl PeerBook {
    /// A peer book that is never written to disk
    pub fn in_memory(max_peers: usize) -> Self {
        Self {
            path: None,
            max_peers,
            peers: HashMap::new(),
            blacklist: HashMap::new(),
        }
    }

    /// Load `peers.json` from `data_dir`, starting empty if it does not exist
    pub fn load(data_dir: &Path, max_peers: usize) -> Result<Self, PeerBookError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(PEERS_FILE);

        let mut book = Self::in_memory(max_peers);
        book.path = Some(path.clone());

        if !path.exists() {
            return Ok(book);
        }

        let file = fs::File::open(&path)?;
        let stored: PeerBookFile = serde_json::from_reader(BufReader::new(file))?;

        let now = Utc::now();
        for record in stored.peers {
            book.peers.insert(record.addr, record.last_seen);
        }
        for ban in stored.blacklist.into_iter().filter(|b| b.expires_at > now) {
            book.blacklist.insert(ban.ip, ban.expires_at);
        }

        log::info!(
            "Loaded {} peers and {} bans from {}",
            book.peers.len(),
            book.blacklist.len(),
            path.display()
        );
        Ok(book)
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.peers.contains_key(addr)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .peers
            .iter()
            .min_by_key(|(_, seen)| **seen)
            .map(|(addr, _)| addr.clone());
        if let Some(addr) = oldest {
            self.peers.remove(&addr);
        }
    }
}

impl PeerDirectory for PeerBook {
    fn add_peer(&mut self, addr: &str) -> bool {
        let valid = addr
            .parse::<SocketAddr>()
            .map(|sa| sa.port() != 0 && !sa.ip().is_unspecified())
            .unwrap_or(false);
        if !valid {
            log::debug!("Ignoring invalid peer address {}", addr);
            return false;
        }

        if !self.peers.contains_key(addr) && self.peers.len() >= self.max_peers {
            self.evict_oldest();
        }
        self.peers.insert(addr.to_string(), Utc::now());
        true
    }

    fn remove_peer(&mut self, addr: &str) {
        self.peers.remove(addr);
    }

    fn is_blacklisted(&self, addr: &str) -> bool {
        let Some(ip) = base_ip(addr) else {
            return false;
        };
        self.blacklist
            .get(&ip)
            .map_or(false, |expires| *expires > Utc::now())
    }

    fn add_blacklist_entry(&mut self, addr: &str, duration: Duration) {
        let Some(ip) = base_ip(addr) else {
            log::warn!("Cannot blacklist invalid address {}", addr);
            return;
        };
        let duration = chrono::Duration::from_std(duration)
            .unwrap_or_else(|_| chrono::Duration::days(MAX_BAN_DAYS));
        let expires_at = Utc::now()
            .checked_add_signed(duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        log::info!("Blacklisting {} until {}", ip, expires_at);
        self.peers
            .retain(|peer, _| base_ip(peer).as_deref() != Some(ip.as_str()));
        self.blacklist.insert(ip, expires_at);
    }

    fn random_peers(&self, n: usize) -> Vec<String> {
        let candidates: Vec<&String> = self
            .peers
            .keys()
            .filter(|addr| !self.is_blacklisted(addr))
            .collect();

        let mut rng = rand::thread_rng();
        candidates
            .choose_multiple(&mut rng, n)
            .map(|addr| (*addr).clone())
            .collect()
    }

    fn prune_blacklist(&mut self) -> usize {
        let now = Utc::now();
        let before = self.blacklist.len();
        self.blacklist.retain(|_, expires| *expires > now);
        before - self.blacklist.len()
    }

    fn len(&self) -> usize {
        self.peers.len()
    }

    fn save(&self) -> Result<(), PeerBookError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut peers: Vec<PeerRecord> = self
            .peers
            .iter()
            .map(|(addr, last_seen)| PeerRecord {
                addr: addr.clone(),
                last_seen: *last_seen,
            })
            .collect();
        peers.sort_by(|a, b| a.addr.cmp(&b.addr));

        let mut blacklist: Vec<BanRecord> = self
            .blacklist
            .iter()
            .map(|(ip, expires_at)| BanRecord {
                ip: ip.clone(),
                expires_at: *expires_at,
            })
            .collect();
        blacklist.sort_by(|a, b| a.ip.cmp(&b.ip));

        // Write to temporary file first
        let temp_path = path.with_extension("json.tmp");
        let file = fs::File::create(&temp_path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &PeerBookFile { peers, blacklist })?;

        fs::rename(&temp_path, path)?;
        log::debug!("Saved {} peers to {}", self.peers.len(), path.display());
        Ok(())
    }
}
