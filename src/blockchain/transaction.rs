use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::fmt;

use super::crypto::{digest, recover_address, Address, CryptoError, DigitalSignature, Hash, PublicKey, Wallet};

/// Errors that can occur while building or validating a transaction
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Sender and receiver are the same address: {0}")]
    SelfTransfer(Address),

    #[error("Transaction not signed")]
    NotSigned,

    #[error("Transaction already signed")]
    AlreadySigned,

    #[error("Wallet {wallet} cannot sign for sender {sender}")]
    WrongSigner { wallet: Address, sender: Address },

    #[error("Hash does not match transaction contents")]
    HashMismatch,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Lifecycle of a transaction. Moves only from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    #[default]
    Pending,
    Confirmed,
    Failed,
}

/// A signed value transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub sender: Address,
    pub receiver: Address,
    pub value: u64,
    pub fee: u64,

    /// Must equal the sender's confirmed nonce at execution time
    pub nonce: u64,

    /// Digest of (sender, receiver, value, fee)
    pub hash: Hash,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<DigitalSignature>,

    /// Public key the signer is recovered from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<PublicKey>,

    // Execution bookkeeping is local to each node and never read off the wire.
    #[serde(skip_deserializing)]
    pub status: TransactionStatus,

    #[serde(skip_deserializing)]
    pub block_index: Option<u64>,

    #[serde(skip_deserializing)]
    pub block_hash: Option<Hash>,
}

impl Transaction {
    /// Creates a new unsigned transaction
    pub fn new(
        sender: Address,
        receiver: Address,
        value: u64,
        fee: u64,
        nonce: u64,
    ) -> Result<Self, TransactionError> {
        if sender == receiver {
            return Err(TransactionError::SelfTransfer(sender));
        }

        let hash = Self::compute_hash(&sender, &receiver, value, fee);
        Ok(Transaction {
            sender,
            receiver,
            value,
            fee,
            nonce,
            hash,
            signature: None,
            recovery: None,
            status: TransactionStatus::Pending,
            block_index: None,
            block_hash: None,
        })
    }

    /// Creates and signs a transaction from `wallet`
    pub fn signed(
        wallet: &Wallet,
        receiver: Address,
        value: u64,
        fee: u64,
        nonce: u64,
    ) -> Result<Self, TransactionError> {
        let mut tx = Self::new(wallet.address().clone(), receiver, value, fee, nonce)?;
        tx.sign(wallet)?;
        Ok(tx)
    }

    pub fn compute_hash(sender: &Address, receiver: &Address, value: u64, fee: u64) -> Hash {
        let mut bytes = Vec::with_capacity(sender.0.len() + receiver.0.len() + 16);
        bytes.extend_from_slice(sender.0.as_bytes());
        bytes.extend_from_slice(receiver.0.as_bytes());
        bytes.extend_from_slice(&value.to_be_bytes());
        bytes.extend_from_slice(&fee.to_be_bytes());
        digest(&bytes)
    }

    /// Signs the transaction hash with the sender's wallet
    pub fn sign(&mut self, wallet: &Wallet) -> Result<(), TransactionError> {
        if self.signature.is_some() {
            return Err(TransactionError::AlreadySigned);
        }

        if wallet.address() != &self.sender {
            return Err(TransactionError::WrongSigner {
                wallet: wallet.address().clone(),
                sender: self.sender.clone(),
            });
        }

        self.signature = Some(wallet.sign(&self.hash));
        self.recovery = Some(wallet.public_key());
        Ok(())
    }

    /// Recovers the address that signed this transaction
    pub fn recover_signer(&self) -> Result<Address, TransactionError> {
        let (signature, recovery) = match (&self.signature, &self.recovery) {
            (Some(signature), Some(recovery)) => (signature, recovery),
            _ => return Err(TransactionError::NotSigned),
        };

        Ok(recover_address(&self.hash, signature, recovery)?)
    }

    /// Structural and signature checks; no ledger access
    pub fn validate(&self) -> Result<(), TransactionError> {
        if self.sender == self.receiver {
            return Err(TransactionError::SelfTransfer(self.sender.clone()));
        }

        if self.hash != Self::compute_hash(&self.sender, &self.receiver, self.value, self.fee) {
            return Err(TransactionError::HashMismatch);
        }

        match self.recover_signer() {
            Ok(signer) if signer == self.sender => Ok(()),
            Ok(_) | Err(TransactionError::CryptoError(_)) => Err(TransactionError::InvalidSignature),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn mark_confirmed(&mut self, block_index: u64, block_hash: Hash) {
        if self.status != TransactionStatus::Pending {
            warn!("Transaction {} already {:?}", self.hash, self.status);
            return;
        }
        self.status = TransactionStatus::Confirmed;
        self.block_index = Some(block_index);
        self.block_hash = Some(block_hash);
    }

    /// Forgets any execution outcome recorded elsewhere
    pub(crate) fn reset_execution(&mut self) {
        self.status = TransactionStatus::Pending;
        self.block_index = None;
        self.block_hash = None;
    }

    pub(crate) fn mark_failed(&mut self) {
        if self.status != TransactionStatus::Pending {
            warn!("Transaction {} already {:?}", self.hash, self.status);
            return;
        }
        self.status = TransactionStatus::Failed;
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tx 0x{} 0x{} -> 0x{} value={} fee={} nonce={}",
            self.hash, self.sender, self.receiver, self.value, self.fee, self.nonce
        )
    }
}
