//! Ledger collaborator
//!
//! The daemon talks to the ledger only through the narrow [`Visor`] trait.
//! [`MemoryVisor`] is a small in-memory implementation: a linear chain of
//! signed blocks plus an unconfirmed transaction pool. It is what the binary
//! runs with and what the daemon tests drive.

use crate::core::block::{Block, SignedBlock};
use crate::core::transaction::{Transaction, TransactionError};
use crate::crypto::Sha256;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Ledger errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VisorError {
    #[error("Block {got} does not follow head {head}")]
    NonSequential { head: u64, got: u64 },
    #[error("Block {0} previous hash does not match head")]
    PrevHashMismatch(u64),
    #[error("Block {0} body hash mismatch")]
    BodyHashMismatch(u64),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(#[from] TransactionError),
}

/// Narrow interface the daemon uses to reach the ledger
pub trait Visor: Send {
    /// Sequence of the chain head
    fn head_sequence(&self) -> u64;

    /// Up to `max` consecutive blocks after `seq`
    fn blocks_since(&self, seq: u64, max: u64) -> Vec<SignedBlock>;

    /// Append a block to the chain
    fn execute_block(&mut self, block: SignedBlock) -> Result<(), VisorError>;

    /// The subset of `candidates` already known, confirmed or not
    fn known_transaction_hashes(&self, candidates: &[Sha256]) -> Vec<Sha256>;

    /// Add a transaction to the unconfirmed pool. `Ok(false)` if already known.
    fn inject_transaction(&mut self, tx: Transaction) -> Result<bool, VisorError>;

    /// Unconfirmed transactions among `hashes`
    fn transactions(&self, hashes: &[Sha256]) -> Vec<Transaction>;

    /// Unconfirmed transactions last announced before `announced_before` (ns)
    fn unconfirmed_hashes(&self, announced_before: i64) -> Vec<Sha256>;

    /// Record when transactions were last announced (ns timestamps)
    fn set_transactions_announced(&mut self, announced: HashMap<Sha256, i64>);
}

#[derive(Debug, Clone)]
struct UnconfirmedEntry {
    tx: Transaction,
    /// Last announcement, nanoseconds since the epoch; 0 if never
    announced: i64,
}

/// In-memory chain and unconfirmed pool
#[derive(Debug)]
pub struct MemoryVisor {
    blocks: Vec<SignedBlock>,
    confirmed: HashSet<Sha256>,
    unconfirmed: HashMap<Sha256, UnconfirmedEntry>,
}

impl MemoryVisor {
    /// Create a visor whose chain starts at `genesis`
    pub fn new(genesis: SignedBlock) -> Self {
        Self {
            blocks: vec![genesis],
            confirmed: HashSet::new(),
            unconfirmed: HashMap::new(),
        }
    }

    /// Get the head block
    pub fn head(&self) -> &SignedBlock {
        // the chain always holds at least the genesis block
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn unconfirmed_len(&self) -> usize {
        self.unconfirmed.len()
    }

    /// Last announcement stamp of an unconfirmed transaction
    pub fn announced_at(&self, hash: &Sha256) -> Option<i64> {
        self.unconfirmed.get(hash).map(|e| e.announced)
    }

    fn validate_block(&self, block: &SignedBlock) -> Result<(), VisorError> {
        let head = &self.head().block.head;
        let seq = block.seq();

        if seq != head.seq + 1 {
            return Err(VisorError::NonSequential {
                head: head.seq,
                got: seq,
            });
        }
        if block.block.head.prev_hash != head.hash() {
            return Err(VisorError::PrevHashMismatch(seq));
        }
        if block.block.head.body_hash != Block::calculate_body_hash(&block.block.body) {
            return Err(VisorError::BodyHashMismatch(seq));
        }
        for tx in &block.block.body {
            tx.verify_structure()?;
        }
        Ok(())
    }
}

impl Visor for MemoryVisor {
    fn head_sequence(&self) -> u64 {
        self.head().seq()
    }

    fn blocks_since(&self, seq: u64, max: u64) -> Vec<SignedBlock> {
        let start = (seq as usize).saturating_add(1);
        self.blocks
            .iter()
            .skip(start)
            .take(max as usize)
            .cloned()
            .collect()
    }

    fn execute_block(&mut self, block: SignedBlock) -> Result<(), VisorError> {
        self.validate_block(&block)?;

        for tx in &block.block.body {
            let hash = tx.hash();
            self.unconfirmed.remove(&hash);
            self.confirmed.insert(hash);
        }

        log::debug!("Executed block {} ({})", block.seq(), block.hash());
        self.blocks.push(block);
        Ok(())
    }

    fn known_transaction_hashes(&self, candidates: &[Sha256]) -> Vec<Sha256> {
        candidates
            .iter()
            .filter(|h| self.confirmed.contains(h) || self.unconfirmed.contains_key(h))
            .copied()
            .collect()
    }

    fn inject_transaction(&mut self, tx: Transaction) -> Result<bool, VisorError> {
        tx.verify_structure()?;

        let hash = tx.hash();
        if self.confirmed.contains(&hash) || self.unconfirmed.contains_key(&hash) {
            return Ok(false);
        }

        self.unconfirmed
            .insert(hash, UnconfirmedEntry { tx, announced: 0 });
        Ok(true)
    }

    fn transactions(&self, hashes: &[Sha256]) -> Vec<Transaction> {
        hashes
            .iter()
            .filter_map(|h| self.unconfirmed.get(h).map(|e| e.tx.clone()))
            .collect()
    }

    fn unconfirmed_hashes(&self, announced_before: i64) -> Vec<Sha256> {
        let mut hashes: Vec<Sha256> = self
            .unconfirmed
            .iter()
            .filter(|(_, e)| e.announced < announced_before)
            .map(|(h, _)| *h)
            .collect();
        hashes.sort();
        hashes
    }

    fn set_transactions_announced(&mut self, announced: HashMap<Sha256, i64>) {
        for (hash, at) in announced {
            if let Some(entry) = self.unconfirmed.get_mut(&hash) {
                entry.announced = entry.announced.max(at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::sample_transaction;

    const GENESIS_TIME: u64 = 1_700_000_000;

    fn visor() -> MemoryVisor {
        MemoryVisor::new(SignedBlock::new(Block::genesis(GENESIS_TIME)))
    }

    fn next_block(visor: &MemoryVisor, body: Vec<Transaction>) -> SignedBlock {
        let head = &visor.head().block.head;
        SignedBlock::new(Block::new(head, head.time + 10, 0, body))
    }

    #[test]
    fn test_execute_sequential_blocks() {
        let mut visor = visor();
        assert_eq!(visor.head_sequence(), 0);

        let b1 = next_block(&visor, vec![]);
        visor.execute_block(b1).unwrap();
        let b2 = next_block(&visor, vec![sample_transaction(1)]);
        visor.execute_block(b2).unwrap();

        assert_eq!(visor.head_sequence(), 2);
        assert_eq!(visor.blocks_since(0, 10).len(), 2);
        assert_eq!(visor.blocks_since(1, 10)[0].seq(), 2);
        assert!(visor.blocks_since(2, 10).is_empty());
        assert_eq!(visor.blocks_since(0, 1).len(), 1);
    }

    #[test]
    fn test_rejects_gap_and_wrong_parent() {
        let mut visor = visor();
        let b1 = next_block(&visor, vec![]);

        let mut gap = b1.clone();
        gap.block.head.seq = 5;
        assert_eq!(
            visor.execute_block(gap),
            Err(VisorError::NonSequential { head: 0, got: 5 })
        );

        let mut orphan = b1;
        orphan.block.head.prev_hash = Sha256::default();
        assert_eq!(
            visor.execute_block(orphan),
            Err(VisorError::PrevHashMismatch(1))
        );
    }

    #[test]
    fn test_inject_and_confirm_transaction() {
        let mut visor = visor();
        let tx = sample_transaction(4);
        let hash = tx.hash();

        assert!(visor.inject_transaction(tx.clone()).unwrap());
        assert!(!visor.inject_transaction(tx.clone()).unwrap());
        assert_eq!(visor.known_transaction_hashes(&[hash]), vec![hash]);
        assert_eq!(visor.transactions(&[hash]), vec![tx.clone()]);

        let block = next_block(&visor, vec![tx]);
        visor.execute_block(block).unwrap();
        assert_eq!(visor.unconfirmed_len(), 0);
        assert_eq!(visor.known_transaction_hashes(&[hash]), vec![hash]);
    }

    #[test]
    fn test_announced_stamps_filter_rebroadcast() {
        let mut visor = visor();
        let tx = sample_transaction(5);
        let hash = tx.hash();
        visor.inject_transaction(tx).unwrap();

        assert_eq!(visor.unconfirmed_hashes(100), vec![hash]);

        visor.set_transactions_announced(HashMap::from([(hash, 500)]));
        assert_eq!(visor.announced_at(&hash), Some(500));
        assert!(visor.unconfirmed_hashes(100).is_empty());
        assert_eq!(visor.unconfirmed_hashes(501), vec![hash]);

        // an older stamp never moves the record backwards
        visor.set_transactions_announced(HashMap::from([(hash, 200)]));
        assert_eq!(visor.announced_at(&hash), Some(500));
    }

    #[test]
    fn test_invalid_transaction_rejected() {
        let mut visor = visor();
        let mut tx = sample_transaction(6);
        tx.outputs.clear();
        assert_eq!(
            visor.inject_transaction(tx),
            Err(VisorError::InvalidTransaction(TransactionError::NoOutputs))
        );
    }
}
