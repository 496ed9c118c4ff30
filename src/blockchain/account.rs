use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::collections::BTreeMap;
use std::fmt;

use super::crypto::{digest, merkle_root, Address, Hash};
use super::transaction::Transaction;

/// Why a transaction could not be executed against the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    UnknownSender(Address),
    UnknownReceiver(Address),
    InsufficientFunds { required: u64, available: u64 },
    NonceMismatch { expected: u64, got: u64 },
    BalanceOverflow,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnknownSender(address) => write!(f, "unknown sender {}", address),
            RejectReason::UnknownReceiver(address) => write!(f, "unknown receiver {}", address),
            RejectReason::InsufficientFunds {
                required,
                available,
            } => write!(
                f,
                "insufficient funds: required {}, available {}",
                required, available
            ),
            RejectReason::NonceMismatch { expected, got } => {
                write!(f, "nonce mismatch: expected {}, got {}", expected, got)
            }
            RejectReason::BalanceOverflow => write!(f, "balance overflow"),
        }
    }
}

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Account already exists: {0}")]
    DuplicateAccount(Address),

    #[error("Account not found: {0}")]
    AccountNotFound(Address),

    #[error("Transaction rejected: {0}")]
    TransactionRejected(RejectReason),
}

/// Represents an account in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Account {
    /// The account's address
    pub address: Address,

    /// The account's balance
    pub balance: u64,

    /// Number of confirmed outgoing transactions
    pub nonce: u64,
}

impl Account {
    pub fn new(address: Address, balance: u64, nonce: u64) -> Self {
        Account {
            address,
            balance,
            nonce,
        }
    }

    /// Digest committed to by the state root
    pub fn commitment(&self) -> Hash {
        let mut bytes = Vec::with_capacity(self.address.0.len() + 16);
        bytes.extend_from_slice(self.address.0.as_bytes());
        bytes.extend_from_slice(&self.balance.to_be_bytes());
        bytes.extend_from_slice(&self.nonce.to_be_bytes());
        digest(&bytes)
    }
}

/// Account state store.
///
/// Accounts are only ever mutated through the methods below; callers get
/// copies. Iteration is ordered by address so every node computes the same
/// commitment for the same set of accounts.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    accounts: BTreeMap<Address, Account>,
}

impl Ledger {
    pub fn new() -> Self {
        Ledger {
            accounts: BTreeMap::new(),
        }
    }

    /// Inserts a new account. Re-adding a known address is an error.
    pub fn add_account(
        &mut self,
        address: Address,
        initial_balance: u64,
        initial_nonce: u64,
    ) -> Result<(), LedgerError> {
        if self.accounts.contains_key(&address) {
            return Err(LedgerError::DuplicateAccount(address));
        }

        debug!("Adding account {} with balance {}", address, initial_balance);
        self.accounts.insert(
            address.clone(),
            Account::new(address, initial_balance, initial_nonce),
        );
        Ok(())
    }

    pub fn get_account(&self, address: &Address) -> Option<Account> {
        self.accounts.get(address).cloned()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.accounts.contains_key(address)
    }

    pub fn get_all_accounts(&self) -> Vec<Account> {
        self.accounts.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Executes a transfer.
    ///
    /// Checks run in a fixed order: sender exists, receiver exists, funds
    /// cover `value + fee`, nonce equals the sender's current nonce. The
    /// first failure marks the transaction FAILED and leaves every account
    /// untouched.
    pub fn apply_transaction(
        &mut self,
        tx: &mut Transaction,
        block_index: u64,
        block_hash: Hash,
    ) -> Result<(), LedgerError> {
        if let Err(reason) = self.check_transaction(tx) {
            tx.mark_failed();
            return Err(LedgerError::TransactionRejected(reason));
        }

        let total = tx.value + tx.fee;

        if let Some(sender) = self.accounts.get_mut(&tx.sender) {
            sender.balance -= total;
            sender.nonce += 1;
        }
        if let Some(receiver) = self.accounts.get_mut(&tx.receiver) {
            receiver.balance += tx.value;
        }

        tx.mark_confirmed(block_index, block_hash);
        Ok(())
    }

    fn check_transaction(&self, tx: &Transaction) -> Result<(), RejectReason> {
        let sender = self
            .accounts
            .get(&tx.sender)
            .ok_or_else(|| RejectReason::UnknownSender(tx.sender.clone()))?;

        let receiver = self
            .accounts
            .get(&tx.receiver)
            .ok_or_else(|| RejectReason::UnknownReceiver(tx.receiver.clone()))?;

        let required = tx
            .value
            .checked_add(tx.fee)
            .ok_or(RejectReason::BalanceOverflow)?;
        if sender.balance < required {
            return Err(RejectReason::InsufficientFunds {
                required,
                available: sender.balance,
            });
        }

        if sender.nonce != tx.nonce {
            return Err(RejectReason::NonceMismatch {
                expected: sender.nonce,
                got: tx.nonce,
            });
        }

        if receiver.balance.checked_add(tx.value).is_none() {
            return Err(RejectReason::BalanceOverflow);
        }

        Ok(())
    }

    /// Credits the block reward to the miner
    pub fn credit_mining_reward(&mut self, miner: &Address, amount: u64) -> Result<(), LedgerError> {
        let account = self
            .accounts
            .get_mut(miner)
            .ok_or_else(|| LedgerError::AccountNotFound(miner.clone()))?;

        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::TransactionRejected(RejectReason::BalanceOverflow))?;
        Ok(())
    }

    /// Merkle root over every account digest, in address order
    pub fn commitment(&self) -> Hash {
        let leaves: Vec<Hash> = self.accounts.values().map(Account::commitment).collect();
        merkle_root(&leaves)
    }

    /// Sum of all balances
    pub fn total_supply(&self) -> u128 {
        self.accounts.values().map(|a| a.balance as u128).sum()
    }
}
