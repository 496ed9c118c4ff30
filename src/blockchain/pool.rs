use log::debug;
use thiserror::Error;

use std::collections::HashSet;

use super::account::Ledger;
use super::crypto::Hash;
use super::transaction::{Transaction, TransactionError};

/// Errors that can occur while admitting a transaction
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(#[from] TransactionError),

    #[error("Invalid transaction: unknown sender {0}")]
    UnknownSender(String),

    #[error("Invalid transaction: nonce mismatch, expected {expected}, got {got}")]
    NonceMismatch { expected: u64, got: u64 },

    #[error("Invalid transaction: {0} is already pending")]
    AlreadyPending(Hash),
}

/// Unconfirmed, signature-valid transactions in arrival order
#[derive(Debug, Clone, Default)]
pub struct TransactionPool {
    pending: Vec<Transaction>,
}

impl TransactionPool {
    pub fn new() -> Self {
        TransactionPool {
            pending: Vec::new(),
        }
    }

    /// Admits a transaction whose signature recovers to its sender and
    /// whose nonce equals the sender's current ledger nonce.
    pub fn admit(&mut self, tx: Transaction, ledger: &Ledger) -> Result<(), PoolError> {
        tx.validate()?;

        let account = ledger
            .get_account(&tx.sender)
            .ok_or_else(|| PoolError::UnknownSender(tx.sender.0.clone()))?;

        if account.nonce != tx.nonce {
            return Err(PoolError::NonceMismatch {
                expected: account.nonce,
                got: tx.nonce,
            });
        }

        if self.contains(&tx.hash, tx.nonce) {
            return Err(PoolError::AlreadyPending(tx.hash));
        }

        debug!("Admitted {}", tx);
        self.pending.push(tx);
        Ok(())
    }

    fn contains(&self, hash: &Hash, nonce: u64) -> bool {
        self.pending
            .iter()
            .any(|tx| &tx.hash == hash && tx.nonce == nonce)
    }

    /// Greedy prefix of the pending list whose cumulative fee stays within
    /// `fee_limit`. Stops at the first transaction that would exceed the
    /// limit so that a sender's transactions are never taken out of order.
    pub fn select_for_block(&self, fee_limit: u64) -> Vec<Transaction> {
        let mut selected = Vec::new();
        let mut fees: u64 = 0;

        for tx in &self.pending {
            match fees.checked_add(tx.fee) {
                Some(total) if total <= fee_limit => {
                    fees = total;
                    selected.push(tx.clone());
                }
                _ => break,
            }
        }

        selected
    }

    /// Drops pending transactions matching an executed `(hash, nonce)` pair
    pub fn remove_executed<'a, I>(&mut self, executed: I)
    where
        I: IntoIterator<Item = &'a Transaction>,
    {
        let executed: HashSet<(Hash, u64)> = executed
            .into_iter()
            .map(|tx| (tx.hash, tx.nonce))
            .collect();

        let before = self.pending.len();
        self.pending
            .retain(|tx| !executed.contains(&(tx.hash, tx.nonce)));
        debug!("Removed {} executed transactions from pool", before - self.pending.len());
    }

    pub fn pending(&self) -> &[Transaction] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
