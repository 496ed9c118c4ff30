// Blockchain module
//
// This module contains the ledger side of a node:
// - Cryptography utilities (hashes, addresses, signatures)
// - Account state
// - Transaction structure and pool
// - Block structure and proof of work
// - Blockchain orchestration

pub mod account;
pub mod block;
pub mod chain;
pub mod crypto;
pub mod pool;
pub mod transaction;

// Re-export main components for easier access
pub use account::{Account, Ledger};
pub use block::Block;
pub use chain::{Blockchain, BlockchainError};
pub use crypto::{Address, Hash, Wallet};
pub use transaction::{Transaction, TransactionStatus};
