//! Peer blockchain heights
//!
//! Heights are what peers claim in their block announcements. They are used
//! only to decide whether more blocks are worth requesting.

use parking_lot::Mutex;
use std::collections::HashMap;

/// A peer's last reported head sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerBlockchainHeight {
    pub address: String,
    pub height: u64,
}

/// Last reported height per peer address
#[derive(Debug, Default)]
pub struct PeerHeightTracker {
    heights: Mutex<HashMap<String, u64>>,
}

impl PeerHeightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a report; the latest one wins even if it is lower
    pub fn record(&self, addr: &str, height: u64) {
        self.heights.lock().insert(addr.to_string(), height);
    }

    pub fn remove(&self, addr: &str) {
        self.heights.lock().remove(addr);
    }

    /// Highest known height, never below `local_head`
    pub fn estimate(&self, local_head: u64) -> u64 {
        self.heights
            .lock()
            .values()
            .copied()
            .fold(local_head, u64::max)
    }

    /// Every report, sorted by address
    pub fn all(&self) -> Vec<PeerBlockchainHeight> {
        let mut all: Vec<PeerBlockchainHeight> = self
            .heights
            .lock()
            .iter()
            .map(|(address, height)| PeerBlockchainHeight {
                address: address.clone(),
                height: *height,
            })
            .collect();
        all.sort_by(|a, b| a.address.cmp(&b.address));
        all
    }

    pub fn len(&self) -> usize {
        self.heights.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heights.lock().is_empty()
    }
}
