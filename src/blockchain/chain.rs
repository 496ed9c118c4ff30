use log::{debug, info, warn};
use thiserror::Error;

use crate::config::ChainConfig;

use super::account::{Ledger, LedgerError};
use super::block::{Block, BlockError};
use super::crypto::Address;
use super::pool::{PoolError, TransactionPool};
use super::transaction::Transaction;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("{0}")]
    Pool(#[from] PoolError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Invalid chain: {0}")]
    ChainInvalid(#[from] BlockError),

    #[error("No eligible transactions in the pool")]
    EmptyPool,

    #[error("Miner account {0} is not known to the ledger")]
    UnknownMiner(Address),

    #[error("Block #{0} names no miner")]
    MissingMiner(u64),
}

/// Ledger, transaction pool and the block sequence, owned together.
///
/// Every method takes `&mut self`, so whoever holds the `Blockchain`
/// serializes transaction application.
#[derive(Debug, Clone)]
pub struct Blockchain {
    chain: Vec<Block>,
    ledger: Ledger,
    pool: TransactionPool,
    miner: Address,
    config: ChainConfig,
}

impl Blockchain {
    /// Creates a chain holding only the genesis block
    pub fn new(miner: Address, config: ChainConfig) -> Self {
        Blockchain {
            chain: vec![Block::genesis()],
            ledger: Ledger::new(),
            pool: TransactionPool::new(),
            miner,
            config,
        }
    }

    pub fn add_account(&mut self, address: Address, balance: u64) -> Result<(), BlockchainError> {
        self.ledger.add_account(address, balance, 0)?;
        Ok(())
    }

    /// Adds an account with an explicit nonce, used when importing peer state
    pub fn import_account(
        &mut self,
        address: Address,
        balance: u64,
        nonce: u64,
    ) -> Result<(), BlockchainError> {
        self.ledger.add_account(address, balance, nonce)?;
        Ok(())
    }

    /// Admits a signed transaction to the pool
    pub fn submit_transaction(&mut self, tx: Transaction) -> Result<(), BlockchainError> {
        self.pool.admit(tx, &self.ledger)?;
        Ok(())
    }

    /// Builds an unsealed candidate on top of the current tip
    pub fn prepare_block(&self) -> Result<Block, BlockchainError> {
        let transactions = self.pool.select_for_block(self.config.fee_limit);
        if transactions.is_empty() {
            return Err(BlockchainError::EmptyPool);
        }

        if !self.ledger.contains(&self.miner) {
            return Err(BlockchainError::UnknownMiner(self.miner.clone()));
        }

        let block = Block::new(
            self.last_block(),
            self.miner.clone(),
            transactions,
            self.ledger.commitment(),
            self.config.difficulty,
        )?;
        Ok(block)
    }

    /// Builds, seals and appends a block in one step
    pub fn produce_block(&mut self) -> Result<Block, BlockchainError> {
        let mut block = self.prepare_block()?;
        block.mine();
        info!("Block mined: {}", block.hash);
        self.commit_mined_block(block)
    }

    /// Appends a locally sealed candidate.
    ///
    /// The candidate goes through the same checks as a remote block, so one
    /// built on a tip that has since moved is rejected.
    pub fn commit_mined_block(&mut self, block: Block) -> Result<Block, BlockchainError> {
        self.append_block(block)
    }

    /// Verifies a block received from a peer against the tip and applies it.
    /// Nothing changes unless the whole block is accepted.
    pub fn accept_remote_block(&mut self, block: Block) -> Result<Block, BlockchainError> {
        if block.state_root != self.ledger.commitment() {
            warn!(
                "Block #{} state root {} differs from local state {}",
                block.index,
                block.state_root,
                self.ledger.commitment()
            );
        }
        self.append_block(block)
    }

    fn check_difficulty(&self, block: &Block) -> Result<(), BlockError> {
        if block.difficulty < self.config.difficulty {
            return Err(BlockError::DifficultyTooLow {
                required: self.config.difficulty,
                got: block.difficulty,
            });
        }
        Ok(())
    }

    fn append_block(&mut self, mut block: Block) -> Result<Block, BlockchainError> {
        block.verify(self.last_block())?;
        self.check_difficulty(&block)?;

        let miner = match &block.miner {
            Some(miner) if self.ledger.contains(miner) => miner.clone(),
            Some(miner) => return Err(BlockchainError::UnknownMiner(miner.clone())),
            None => return Err(BlockchainError::MissingMiner(block.index)),
        };

        // Apply to a staged copy so a late failure leaves no partial effects
        let mut staged = self.ledger.clone();
        let mut collected_fees: u64 = 0;
        let mut executed = 0;

        for tx in block.transactions.iter_mut() {
            tx.reset_execution();
            match staged.apply_transaction(tx, block.index, block.hash) {
                Ok(()) => {
                    collected_fees = collected_fees.saturating_add(tx.fee);
                    executed += 1;
                    debug!("Executed {}", tx);
                }
                Err(e) => warn!("Transaction failed: {} ({})", tx, e),
            }
        }

        let reward = collected_fees.saturating_add(self.config.mining_reward);
        staged.credit_mining_reward(&miner, reward)?;

        self.ledger = staged;
        self.pool.remove_executed(&block.transactions);
        self.chain.push(block.clone());

        info!(
            "Appended {} ({}/{} transactions executed, miner {} credited {})",
            block,
            executed,
            block.transactions.len(),
            miner,
            reward
        );
        Ok(block)
    }

    /// Replaces the local chain with `candidate` if it is valid from genesis
    /// to tip. The swap is all or nothing.
    pub fn sync_chain(&mut self, candidate: Vec<Block>) -> Result<(), BlockchainError> {
        match candidate.first() {
            Some(first) if first.is_genesis() => {}
            _ => return Err(BlockchainError::ChainInvalid(BlockError::NotGenesis)),
        }

        for pair in candidate.windows(2) {
            pair[1].verify(&pair[0])?;
            self.check_difficulty(&pair[1])?;
        }

        let included: Vec<&Transaction> = candidate
            .iter()
            .flat_map(|block| block.transactions.iter())
            .collect();
        self.pool.remove_executed(included);

        info!("Synced chain: {} blocks", candidate.len());
        self.chain = candidate;
        Ok(())
    }

    /// Re-verifies every link of the local chain
    pub fn is_valid(&self) -> bool {
        match self.chain.first() {
            Some(first) if first.is_genesis() => {}
            _ => return false,
        }

        self.chain
            .windows(2)
            .all(|pair| pair[1].verify(&pair[0]).is_ok())
    }

    pub fn last_block(&self) -> &Block {
        // The chain always holds at least the genesis block
        &self.chain[self.chain.len() - 1]
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn height(&self) -> u64 {
        self.last_block().index
    }

    pub fn pending_transactions(&self) -> &[Transaction] {
        self.pool.pending()
    }

    pub fn has_pending(&self) -> bool {
        !self.pool.is_empty()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn miner(&self) -> &Address {
        &self.miner
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::account::RejectReason;
    use crate::blockchain::crypto::Wallet;
    use crate::blockchain::transaction::TransactionStatus;

    fn test_config() -> ChainConfig {
        ChainConfig {
            difficulty: 4,
            ..ChainConfig::default()
        }
    }

    struct Fixture {
        chain: Blockchain,
        alice: Wallet,
        bob: Wallet,
        miner: Wallet,
    }

    fn fixture() -> Fixture {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let miner = Wallet::new();

        let mut chain = Blockchain::new(miner.address().clone(), test_config());
        chain.add_account(alice.address().clone(), 100).unwrap();
        chain.add_account(bob.address().clone(), 100).unwrap();
        chain.add_account(miner.address().clone(), 0).unwrap();

        Fixture {
            chain,
            alice,
            bob,
            miner,
        }
    }

    /// A second node that knows the same accounts
    fn peer_of(f: &Fixture) -> Blockchain {
        let other_miner = Wallet::new();
        let mut peer = Blockchain::new(other_miner.address().clone(), test_config());
        for account in f.chain.ledger().get_all_accounts() {
            peer.import_account(account.address, account.balance, account.nonce)
                .unwrap();
        }
        peer
    }

    fn balance(chain: &Blockchain, wallet: &Wallet) -> u64 {
        chain.ledger().get_account(wallet.address()).unwrap().balance
    }

    #[test]
    fn test_new_blockchain() {
        let f = fixture();
        assert_eq!(f.chain.chain().len(), 1);
        assert!(f.chain.last_block().is_genesis());
        assert!(f.chain.is_valid());
    }

    #[test]
    fn test_produce_block_on_empty_pool() {
        let mut f = fixture();
        assert!(matches!(f.chain.produce_block(), Err(BlockchainError::EmptyPool)));
        assert_eq!(f.chain.chain().len(), 1);
    }

    #[test]
    fn test_end_to_end_transfer() {
        let mut f = fixture();
        let reward = f.chain.config().mining_reward;

        let tx = Transaction::signed(&f.alice, f.bob.address().clone(), 20, 1, 0).unwrap();
        f.chain.submit_transaction(tx.clone()).unwrap();

        let block = f.chain.produce_block().unwrap();
        assert_eq!(block.index, 1);
        assert!(block.hash.leading_zero_bits() >= 4);
        assert_eq!(block.transactions[0].status, TransactionStatus::Confirmed);
        assert_eq!(block.transactions[0].block_hash, Some(block.hash));

        let alice = f.chain.ledger().get_account(f.alice.address()).unwrap();
        assert_eq!(alice.balance, 79);
        assert_eq!(alice.nonce, 1);
        assert_eq!(balance(&f.chain, &f.bob), 120);
        assert_eq!(balance(&f.chain, &f.miner), 1 + reward);
        assert!(!f.chain.has_pending());
        assert!(f.chain.is_valid());

        // Replaying the same transaction is rejected by the ledger
        let mut staged = f.chain.ledger().clone();
        let mut replay = tx;
        assert!(matches!(
            staged.apply_transaction(&mut replay, 2, block.hash),
            Err(LedgerError::TransactionRejected(RejectReason::NonceMismatch { .. }))
        ));

        // and never makes it back into the pool
        let replay = Transaction::signed(&f.alice, f.bob.address().clone(), 20, 1, 0).unwrap();
        assert!(matches!(
            f.chain.submit_transaction(replay),
            Err(BlockchainError::Pool(PoolError::NonceMismatch { .. }))
        ));
    }

    #[test]
    fn test_failed_transaction_does_not_abort_block() {
        let mut f = fixture();
        let reward = f.chain.config().mining_reward;

        // Both carry nonce 0; only the first can execute
        let first = Transaction::signed(&f.alice, f.bob.address().clone(), 10, 1, 0).unwrap();
        let second = Transaction::signed(&f.alice, f.miner.address().clone(), 10, 2, 0).unwrap();
        f.chain.submit_transaction(first).unwrap();
        f.chain.submit_transaction(second).unwrap();

        let block = f.chain.produce_block().unwrap();
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(block.transactions[0].status, TransactionStatus::Confirmed);
        assert_eq!(block.transactions[1].status, TransactionStatus::Failed);

        assert_eq!(balance(&f.chain, &f.alice), 89);
        // Only the executed fee is collected
        assert_eq!(balance(&f.chain, &f.miner), 1 + reward);
        assert!(!f.chain.has_pending());
    }

    #[test]
    fn test_block_respects_fee_limit() {
        let mut f = fixture();
        let limit = f.chain.config().fee_limit;

        let cheap = Transaction::signed(&f.alice, f.bob.address().clone(), 1, limit, 0).unwrap();
        let next = Transaction::signed(&f.bob, f.alice.address().clone(), 1, 1, 0).unwrap();
        f.chain.submit_transaction(cheap).unwrap();
        f.chain.submit_transaction(next).unwrap();

        let block = f.chain.produce_block().unwrap();
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(f.chain.pending_transactions().len(), 1);
    }

    #[test]
    fn test_minted_amount_per_block() {
        let mut f = fixture();
        let reward = f.chain.config().mining_reward as u128;
        let before = f.chain.ledger().total_supply();

        let tx = Transaction::signed(&f.alice, f.bob.address().clone(), 30, 2, 0).unwrap();
        f.chain.submit_transaction(tx).unwrap();
        f.chain.produce_block().unwrap();

        // Fees move from senders to the miner; only the fixed reward is new
        assert_eq!(f.chain.ledger().total_supply(), before + reward);
    }

    #[test]
    fn test_accept_remote_block() {
        let mut f = fixture();
        let mut peer = peer_of(&f);

        let tx = Transaction::signed(&f.alice, f.bob.address().clone(), 20, 1, 0).unwrap();
        f.chain.submit_transaction(tx.clone()).unwrap();
        peer.submit_transaction(tx).unwrap();

        let block = f.chain.produce_block().unwrap();
        peer.accept_remote_block(block.clone()).unwrap();

        assert_eq!(peer.last_block().hash, block.hash);
        assert_eq!(peer.ledger().get_all_accounts(), f.chain.ledger().get_all_accounts());
        assert_eq!(peer.ledger().commitment(), f.chain.ledger().commitment());
        assert!(!peer.has_pending());
    }

    #[test]
    fn test_tampered_remote_block_leaves_no_trace() {
        let mut f = fixture();
        let mut peer = peer_of(&f);
        let accounts_before = peer.ledger().get_all_accounts();

        let tx = Transaction::signed(&f.alice, f.bob.address().clone(), 20, 1, 0).unwrap();
        f.chain.submit_transaction(tx).unwrap();
        let mut block = f.chain.produce_block().unwrap();
        block.timestamp += 1;

        assert!(matches!(
            peer.accept_remote_block(block),
            Err(BlockchainError::ChainInvalid(BlockError::HashMismatch { .. }))
        ));
        assert_eq!(peer.chain().len(), 1);
        assert_eq!(peer.ledger().get_all_accounts(), accounts_before);
    }

    #[test]
    fn test_remote_block_from_unknown_miner_rejected() {
        let mut f = fixture();
        let stranger = Wallet::new();
        let mut other = Blockchain::new(stranger.address().clone(), test_config());
        for account in f.chain.ledger().get_all_accounts() {
            other
                .import_account(account.address, account.balance, account.nonce)
                .unwrap();
        }
        other.add_account(stranger.address().clone(), 0).unwrap();

        let tx = Transaction::signed(&f.alice, f.bob.address().clone(), 5, 1, 0).unwrap();
        other.submit_transaction(tx).unwrap();
        let block = other.produce_block().unwrap();

        assert!(matches!(
            f.chain.accept_remote_block(block),
            Err(BlockchainError::UnknownMiner(_))
        ));
        assert_eq!(f.chain.chain().len(), 1);
    }

    #[test]
    fn test_low_difficulty_block_rejected() {
        let mut f = fixture();
        let mut lax = Blockchain::new(
            f.miner.address().clone(),
            ChainConfig {
                difficulty: 0,
                ..test_config()
            },
        );
        for account in f.chain.ledger().get_all_accounts() {
            lax.import_account(account.address, account.balance, account.nonce)
                .unwrap();
        }

        let tx = Transaction::signed(&f.alice, f.bob.address().clone(), 5, 1, 0).unwrap();
        lax.submit_transaction(tx).unwrap();
        let block = lax.produce_block().unwrap();

        assert!(matches!(
            f.chain.accept_remote_block(block),
            Err(BlockchainError::ChainInvalid(BlockError::DifficultyTooLow { .. }))
        ));
    }

    #[test]
    fn test_far_future_remote_block_rejected() {
        let mut f = fixture();
        let mut peer = peer_of(&f);

        let tx = Transaction::signed(&f.alice, f.bob.address().clone(), 5, 1, 0).unwrap();
        f.chain.submit_transaction(tx.clone()).unwrap();
        peer.submit_transaction(tx).unwrap();

        let mut block = f.chain.prepare_block().unwrap();
        block.timestamp = i64::MAX;
        block.mine();

        assert!(matches!(
            peer.accept_remote_block(block),
            Err(BlockchainError::ChainInvalid(BlockError::TimestampTooFarAhead { .. }))
        ));
        assert_eq!(peer.chain().len(), 1);

        // The tip is untouched, so local production carries on
        let peer_miner = peer.miner().clone();
        peer.add_account(peer_miner, 0).unwrap();
        let produced = peer.produce_block().unwrap();
        assert_eq!(produced.index, 1);
        assert!(peer.is_valid());
    }

    #[test]
    fn test_stale_mined_block_rejected() {
        let mut f = fixture();
        let mut peer = peer_of(&f);
        let peer_miner = peer.miner().clone();
        peer.add_account(peer_miner.clone(), 0).unwrap();
        f.chain.add_account(peer_miner, 0).unwrap();

        let tx = Transaction::signed(&f.alice, f.bob.address().clone(), 5, 1, 0).unwrap();
        f.chain.submit_transaction(tx.clone()).unwrap();
        peer.submit_transaction(tx).unwrap();

        // Local candidate is sealed, but a competing block lands first
        let mut candidate = f.chain.prepare_block().unwrap();
        candidate.mine();
        let competing = peer.produce_block().unwrap();
        f.chain.accept_remote_block(competing).unwrap();

        assert!(matches!(
            f.chain.commit_mined_block(candidate),
            Err(BlockchainError::ChainInvalid(BlockError::IndexMismatch { .. }))
        ));
        assert_eq!(f.chain.chain().len(), 2);
    }

    #[test]
    fn test_sync_chain() {
        let mut f = fixture();
        let mut fresh = Blockchain::new(Wallet::new().address().clone(), test_config());

        for nonce in 0..2 {
            let tx = Transaction::signed(&f.alice, f.bob.address().clone(), 5, 1, nonce).unwrap();
            f.chain.submit_transaction(tx).unwrap();
            f.chain.produce_block().unwrap();
        }

        fresh.sync_chain(f.chain.chain().to_vec()).unwrap();
        assert_eq!(fresh.chain().len(), 3);
        assert_eq!(fresh.last_block().hash, f.chain.last_block().hash);
        assert!(fresh.is_valid());
    }

    #[test]
    fn test_sync_chain_requires_genesis() {
        let mut f = fixture();
        let tx = Transaction::signed(&f.alice, f.bob.address().clone(), 5, 1, 0).unwrap();
        f.chain.submit_transaction(tx).unwrap();
        f.chain.produce_block().unwrap();

        let mut fresh = Blockchain::new(Wallet::new().address().clone(), test_config());

        let mut forged = f.chain.chain().to_vec();
        forged[0].hash.0[0] = 1;
        assert!(matches!(
            fresh.sync_chain(forged),
            Err(BlockchainError::ChainInvalid(BlockError::NotGenesis))
        ));

        assert!(matches!(
            fresh.sync_chain(Vec::new()),
            Err(BlockchainError::ChainInvalid(BlockError::NotGenesis))
        ));

        let headless = f.chain.chain()[1..].to_vec();
        assert!(fresh.sync_chain(headless).is_err());
        assert_eq!(fresh.chain().len(), 1);
    }

    #[test]
    fn test_sync_chain_is_all_or_nothing() {
        let mut f = fixture();
        for nonce in 0..2 {
            let tx = Transaction::signed(&f.alice, f.bob.address().clone(), 5, 1, nonce).unwrap();
            f.chain.submit_transaction(tx).unwrap();
            f.chain.produce_block().unwrap();
        }

        let mut fresh = Blockchain::new(Wallet::new().address().clone(), test_config());
        let mut broken = f.chain.chain().to_vec();
        broken[2].nonce += 1;

        assert!(fresh.sync_chain(broken).is_err());
        assert_eq!(fresh.chain().len(), 1);
    }
}
