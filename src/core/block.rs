//! Block payloads exchanged during chain sync
//!
//! A block contains a header with metadata and a list of transactions.
//! Blocks travel signed; verifying the signature is the visor's concern.

use crate::core::transaction::{Transaction, SIGNATURE_SIZE};
use crate::crypto::{sha256, Sha256, HASH_SIZE};
use crate::wire::encode_to_bytes;
use crate::wire_struct;

/// Current block version
pub const BLOCK_VERSION: u32 = 0;

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    /// Unix seconds
    pub time: u64,
    /// Height of the block; the genesis block is 0
    pub seq: u64,
    pub fee: u64,
    /// Hash of the previous block's header
    pub prev_hash: Sha256,
    /// Hash over the body's transaction hashes
    pub body_hash: Sha256,
}

wire_struct!(BlockHeader {
    version,
    time,
    seq,
    fee,
    prev_hash,
    body_hash
});

impl BlockHeader {
    /// Calculate the hash of the block header
    pub fn hash(&self) -> Sha256 {
        sha256(&encode_to_bytes(self))
    }
}

/// A block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub head: BlockHeader,
    pub body: Vec<Transaction>,
}

wire_struct!(Block { head, body });

impl Block {
    /// Create the block following `prev`
    pub fn new(prev: &BlockHeader, time: u64, fee: u64, body: Vec<Transaction>) -> Self {
        let head = BlockHeader {
            version: BLOCK_VERSION,
            time,
            seq: prev.seq + 1,
            fee,
            prev_hash: prev.hash(),
            body_hash: Self::calculate_body_hash(&body),
        };
        Self { head, body }
    }

    /// Create the genesis block
    pub fn genesis(time: u64) -> Self {
        let head = BlockHeader {
            version: BLOCK_VERSION,
            time,
            seq: 0,
            fee: 0,
            prev_hash: Sha256::default(),
            body_hash: Self::calculate_body_hash(&[]),
        };
        Self {
            head,
            body: Vec::new(),
        }
    }

    /// Hash over the concatenated transaction hashes
    pub fn calculate_body_hash(body: &[Transaction]) -> Sha256 {
        let mut data = Vec::with_capacity(body.len() * HASH_SIZE);
        for tx in body {
            data.extend_from_slice(tx.hash().as_bytes());
        }
        sha256(&data)
    }

    pub fn hash(&self) -> Sha256 {
        self.head.hash()
    }

    pub fn seq(&self) -> u64 {
        self.head.seq
    }
}

/// A block together with the signature of the blockchain key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBlock {
    pub block: Block,
    pub signature: [u8; SIGNATURE_SIZE],
}

wire_struct!(SignedBlock { block, signature });

impl SignedBlock {
    pub fn new(block: Block) -> Self {
        Self {
            block,
            signature: [0u8; SIGNATURE_SIZE],
        }
    }

    pub fn seq(&self) -> u64 {
        self.block.seq()
    }

    pub fn hash(&self) -> Sha256 {
        self.block.hash()
    }
}
