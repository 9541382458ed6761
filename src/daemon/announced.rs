//! Transaction announcement stamps
//!
//! Every announcement stamps its hashes with the current time. The stamps
//! are handed to the ledger in batches so it can tell which unconfirmed
//! transactions are due for another broadcast.

use crate::crypto::Sha256;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem;

/// Nanoseconds since the epoch, saturating
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Pending announcement stamps
#[derive(Debug, Default)]
pub struct AnnouncementCache {
    stamps: Mutex<HashMap<Sha256, i64>>,
}

impl AnnouncementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp `hashes` with the current time, replacing older stamps
    pub fn add(&self, hashes: &[Sha256]) {
        let now = now_nanos();
        let mut stamps = self.stamps.lock();
        for hash in hashes {
            stamps.insert(*hash, now);
        }
    }

    /// Take every stamp, leaving the cache empty
    pub fn flush(&self) -> HashMap<Sha256, i64> {
        mem::take(&mut *self.stamps.lock())
    }

    pub fn len(&self) -> usize {
        self.stamps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.lock().is_empty()
    }
}
