use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use super::crypto::{digest, merkle_root, Address, Hash};
use super::transaction::Transaction;

/// How many nonces are tried between cancellation checks
const CANCEL_CHECK_INTERVAL: u64 = 1 << 12;

/// How far past local time a block timestamp may run, in milliseconds
pub const MAX_FUTURE_DRIFT_MS: i64 = 2 * 60 * 60 * 1000;

/// Reasons a block fails verification against its parent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("index {got} does not follow parent index {parent}")]
    IndexMismatch { parent: u64, got: u64 },

    #[error("previous hash {got} does not match parent hash {expected}")]
    ParentHashMismatch { expected: Hash, got: Hash },

    #[error("stored hash {stored} does not match computed hash {computed}")]
    HashMismatch { stored: Hash, computed: Hash },

    #[error("hash has {got} leading zero bits, difficulty requires {required}")]
    InsufficientWork { required: u32, got: u32 },

    #[error("timestamp {got} is not after parent timestamp {parent}")]
    TimestampNotIncreasing { parent: i64, got: i64 },

    #[error("timestamp {got} is too far past local time {now}")]
    TimestampTooFarAhead { now: i64, got: i64 },

    #[error("parent block #{0} leaves no room for a successor")]
    NoSuccessor(u64),

    #[error("transactions root does not match block transactions")]
    TransactionsRootMismatch,

    #[error("transaction {0} appears more than once")]
    DuplicateTransaction(Hash),

    #[error("transaction {0} has an invalid signature")]
    InvalidTransaction(Hash),

    #[error("difficulty {got} is below the required {required}")]
    DifficultyTooLow { required: u32, got: u32 },

    #[error("first block is not the genesis block")]
    NotGenesis,
}

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Height of the block, genesis is 0
    pub index: u64,

    /// Milliseconds since the Unix epoch
    pub timestamp: i64,

    pub previous_hash: Hash,

    #[serde(rename = "minerAddress")]
    pub miner: Option<Address>,

    pub transactions: Vec<Transaction>,

    /// Merkle root over the transaction hashes
    #[serde(rename = "transactionsRootHash")]
    pub transactions_root: Hash,

    /// Ledger commitment before this block executed
    #[serde(rename = "stateRootHash")]
    pub state_root: Hash,

    pub difficulty: u32,

    /// Proof of work
    pub nonce: u64,

    pub hash: Hash,
}

/// Immutable snapshot of the header fields the proof of work runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiningJob {
    pub index: u64,
    pub timestamp: i64,
    pub previous_hash: Hash,
    pub transactions_root: Hash,
    pub difficulty: u32,
}

impl MiningJob {
    /// Searches nonces from zero until the header hash meets the difficulty.
    ///
    /// Returns `None` once `cancel` is observed set.
    pub fn solve(&self, cancel: &AtomicBool) -> Option<(Hash, u64)> {
        let mut nonce: u64 = 0;
        loop {
            if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                return None;
            }

            let hash = header_hash(
                self.index,
                self.timestamp,
                &self.previous_hash,
                &self.transactions_root,
                nonce,
            );
            if hash.leading_zero_bits() >= self.difficulty {
                return Some((hash, nonce));
            }

            nonce = nonce.wrapping_add(1);
        }
    }
}

/// digest(index, timestamp, previousHash, transactionsRootHash, nonce)
pub fn header_hash(
    index: u64,
    timestamp: i64,
    previous_hash: &Hash,
    transactions_root: &Hash,
    nonce: u64,
) -> Hash {
    let mut bytes = Vec::with_capacity(8 + 8 + 32 + 32 + 8);
    bytes.extend_from_slice(&index.to_be_bytes());
    bytes.extend_from_slice(&timestamp.to_be_bytes());
    bytes.extend_from_slice(previous_hash.as_bytes());
    bytes.extend_from_slice(transactions_root.as_bytes());
    bytes.extend_from_slice(&nonce.to_be_bytes());
    digest(&bytes)
}

impl Block {
    /// Creates an unsealed candidate block on top of `parent`
    pub fn new(
        parent: &Block,
        miner: Address,
        transactions: Vec<Transaction>,
        state_root: Hash,
        difficulty: u32,
    ) -> Result<Self, BlockError> {
        let no_successor = || BlockError::NoSuccessor(parent.index);
        let index = parent.index.checked_add(1).ok_or_else(no_successor)?;
        // Keep timestamps strictly increasing even if the clock stalls
        let after_parent = parent.timestamp.checked_add(1).ok_or_else(no_successor)?;
        let timestamp = Utc::now().timestamp_millis().max(after_parent);
        let transactions_root = Self::compute_transactions_root(&transactions);

        Ok(Block {
            index,
            timestamp,
            previous_hash: parent.hash,
            miner: Some(miner),
            transactions,
            transactions_root,
            state_root,
            difficulty,
            nonce: 0,
            hash: Hash::ZERO,
        })
    }

    /// The first block of every chain
    pub fn genesis() -> Self {
        Block {
            index: 0,
            timestamp: 0,
            previous_hash: Hash::ZERO,
            miner: None,
            transactions: Vec::new(),
            transactions_root: Hash::ZERO,
            state_root: Hash::ZERO,
            difficulty: 0,
            nonce: 0,
            hash: Hash::ZERO,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.hash == Hash::ZERO && self.transactions.is_empty()
    }

    pub fn compute_transactions_root(transactions: &[Transaction]) -> Hash {
        let leaves: Vec<Hash> = transactions.iter().map(|tx| tx.hash).collect();
        merkle_root(&leaves)
    }

    pub fn calculate_hash(&self) -> Hash {
        header_hash(
            self.index,
            self.timestamp,
            &self.previous_hash,
            &self.transactions_root,
            self.nonce,
        )
    }

    pub fn mining_job(&self) -> MiningJob {
        MiningJob {
            index: self.index,
            timestamp: self.timestamp,
            previous_hash: self.previous_hash,
            transactions_root: self.transactions_root,
            difficulty: self.difficulty,
        }
    }

    /// Writes the proof-of-work result into the header
    pub fn seal(&mut self, hash: Hash, nonce: u64) {
        self.hash = hash;
        self.nonce = nonce;
    }

    /// Runs the proof of work on the current thread
    pub fn mine(&mut self) {
        let never = AtomicBool::new(false);
        if let Some((hash, nonce)) = self.mining_job().solve(&never) {
            self.seal(hash, nonce);
        }
    }

    /// Checks this block against its parent and the local clock. No ledger access.
    pub fn verify(&self, parent: &Block) -> Result<(), BlockError> {
        if parent.index.checked_add(1) != Some(self.index) {
            return Err(BlockError::IndexMismatch {
                parent: parent.index,
                got: self.index,
            });
        }

        if self.previous_hash != parent.hash {
            return Err(BlockError::ParentHashMismatch {
                expected: parent.hash,
                got: self.previous_hash,
            });
        }

        let computed = self.calculate_hash();
        if computed != self.hash {
            return Err(BlockError::HashMismatch {
                stored: self.hash,
                computed,
            });
        }

        let work = self.hash.leading_zero_bits();
        if work < self.difficulty {
            return Err(BlockError::InsufficientWork {
                required: self.difficulty,
                got: work,
            });
        }

        if self.timestamp <= parent.timestamp {
            return Err(BlockError::TimestampNotIncreasing {
                parent: parent.timestamp,
                got: self.timestamp,
            });
        }

        let now = Utc::now().timestamp_millis();
        if self.timestamp > now.saturating_add(MAX_FUTURE_DRIFT_MS) {
            return Err(BlockError::TimestampTooFarAhead {
                now,
                got: self.timestamp,
            });
        }

        if Self::compute_transactions_root(&self.transactions) != self.transactions_root {
            return Err(BlockError::TransactionsRootMismatch);
        }

        // An odd Merkle level repeats its last leaf, so the root alone
        // does not pin the list
        let mut seen = HashSet::with_capacity(self.transactions.len());
        if let Some(tx) = self
            .transactions
            .iter()
            .find(|tx| !seen.insert((tx.hash, tx.nonce)))
        {
            return Err(BlockError::DuplicateTransaction(tx.hash));
        }

        if let Some(tx) = self.transactions.iter().find(|tx| tx.validate().is_err()) {
            return Err(BlockError::InvalidTransaction(tx.hash));
        }

        Ok(())
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block #{} 0x{} parent=0x{} txs={} difficulty={} nonce={}",
            self.index,
            self.hash,
            self.previous_hash,
            self.transactions.len(),
            self.difficulty,
            self.nonce
        )
    }
}
