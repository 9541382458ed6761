//! Transaction payloads exchanged during mempool gossip
//!
//! The daemon never spends or signs anything; it only needs a transaction's
//! wire layout, its hash, and a structural sanity check before handing it to
//! the visor.

use crate::crypto::{sha256, Sha256};
use crate::wire::{encode_to_bytes, WireEncode};
use crate::wire_struct;
use std::collections::HashSet;
use thiserror::Error;

/// Maximum encoded transaction size in bytes
pub const MAX_TX_SIZE: usize = 32 * 1024;

/// Length of a recoverable secp256k1 signature
pub const SIGNATURE_SIZE: usize = 65;

/// Length of an output address
pub const ADDRESS_SIZE: usize = 20;

/// Structural transaction errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction has no inputs")]
    NoInputs,
    #[error("Transaction has no outputs")]
    NoOutputs,
    #[error("Signature count {sigs} does not match input count {inputs}")]
    SignatureMismatch { sigs: usize, inputs: usize },
    #[error("Duplicate input {0}")]
    DuplicateInput(Sha256),
    #[error("Output {0} has zero coins")]
    ZeroCoins(usize),
    #[error("Transaction too large: {0} bytes (max: {MAX_TX_SIZE})")]
    TooLarge(usize),
}

/// A transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOutput {
    pub address: [u8; ADDRESS_SIZE],
    pub coins: u64,
    pub hours: u64,
}

wire_struct!(TransactionOutput {
    address,
    coins,
    hours
});

/// A transaction spending previous outputs by hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Hashes of the outputs being spent
    pub inputs: Vec<Sha256>,
    pub outputs: Vec<TransactionOutput>,
    /// One signature per input
    pub signatures: Vec<[u8; SIGNATURE_SIZE]>,
}

wire_struct!(Transaction {
    inputs,
    outputs,
    signatures
});

impl Transaction {
    /// Hash of the full wire encoding
    pub fn hash(&self) -> Sha256 {
        sha256(&encode_to_bytes(self))
    }

    pub fn size(&self) -> usize {
        self.encode_size()
    }

    /// Check the transaction is well formed, without touching ledger state
    pub fn verify_structure(&self) -> Result<(), TransactionError> {
        if self.inputs.is_empty() {
            return Err(TransactionError::NoInputs);
        }
        if self.outputs.is_empty() {
            return Err(TransactionError::NoOutputs);
        }
        if self.signatures.len() != self.inputs.len() {
            return Err(TransactionError::SignatureMismatch {
                sigs: self.signatures.len(),
                inputs: self.inputs.len(),
            });
        }

        let mut seen = HashSet::with_capacity(self.inputs.len());
        for input in &self.inputs {
            if !seen.insert(input) {
                return Err(TransactionError::DuplicateInput(*input));
            }
        }

        if let Some(i) = self.outputs.iter().position(|o| o.coins == 0) {
            return Err(TransactionError::ZeroCoins(i));
        }

        let size = self.size();
        if size > MAX_TX_SIZE {
            return Err(TransactionError::TooLarge(size));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_transaction(seed: u8) -> Transaction {
    Transaction {
        inputs: vec![sha256(&[seed])],
        outputs: vec![TransactionOutput {
            address: [seed; ADDRESS_SIZE],
            coins: 1_000_000,
            hours: 10,
        }],
        signatures: vec![[seed; SIGNATURE_SIZE]],
    }
}
