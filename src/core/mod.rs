//! Ledger-facing types
//!
//! This module contains:
//! - Transactions and signed blocks as they travel on the wire
//! - The visor interface the daemon uses to reach the ledger

pub mod block;
pub mod transaction;
pub mod visor;

pub use block::{Block, BlockHeader, SignedBlock, BLOCK_VERSION};
pub use transaction::{
    Transaction, TransactionError, TransactionOutput, ADDRESS_SIZE, MAX_TX_SIZE, SIGNATURE_SIZE,
};
pub use visor::{MemoryVisor, Visor, VisorError};
