use clap::Parser;

use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const BOOTSTRAP_PORT: u16 = 3001;
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_DIFFICULTY: u32 = 4;
pub const BLOCK_FEE_LIMIT: u64 = 5;
pub const MINING_REWARD: u64 = 2;
pub const INITIAL_BALANCE: u64 = 100;
pub const DEFAULT_FEE: u64 = 1;
pub const BUCKET_SIZE: usize = 2;
pub const DEDUP_CAPACITY: usize = 256;
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Command line options of a ledger node
#[derive(Debug, Clone, Parser)]
#[command(name = "gossip_ledger", version, about = "Peer-to-peer ledger node")]
pub struct NodeConfig {
    /// Interface the peer listener binds to
    #[arg(long, env = "LEDGER_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Peer protocol port
    #[arg(long, env = "LEDGER_PORT", default_value_t = BOOTSTRAP_PORT)]
    pub port: u16,

    /// Address of the bootstrap node
    #[arg(long, env = "LEDGER_BOOTSTRAP", default_value = "127.0.0.1:3001")]
    pub bootstrap: SocketAddr,

    /// Run as the bootstrap node
    #[arg(long, env = "LEDGER_BOOTSTRAP_NODE")]
    pub bootstrap_node: bool,

    /// HTTP API port
    #[arg(long, env = "LEDGER_HTTP_PORT", default_value_t = DEFAULT_HTTP_PORT)]
    pub http_port: u16,

    /// Leading zero bits required of a block hash
    #[arg(long, env = "LEDGER_DIFFICULTY", default_value_t = DEFAULT_DIFFICULTY)]
    pub difficulty: u32,

    /// Maximum total fees per block
    #[arg(long, env = "LEDGER_FEE_LIMIT", default_value_t = BLOCK_FEE_LIMIT)]
    pub fee_limit: u64,

    #[arg(long, env = "LEDGER_MINING_REWARD", default_value_t = MINING_REWARD)]
    pub mining_reward: u64,

    /// Peers kept per routing bucket
    #[arg(long, env = "LEDGER_BUCKET_SIZE", default_value_t = BUCKET_SIZE)]
    pub bucket_size: usize,

    /// Balance of accounts created through the API
    #[arg(long, env = "LEDGER_INITIAL_BALANCE", default_value_t = INITIAL_BALANCE)]
    pub initial_balance: u64,

    /// Mine pending transactions every N seconds
    #[arg(long, env = "LEDGER_AUTO_MINE_SECS")]
    pub auto_mine_secs: Option<u64>,
}

impl NodeConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn chain(&self) -> ChainConfig {
        ChainConfig {
            difficulty: self.difficulty,
            fee_limit: self.fee_limit,
            mining_reward: self.mining_reward,
            initial_balance: self.initial_balance,
        }
    }

    pub fn network(&self) -> NetworkConfig {
        NetworkConfig {
            listen: self.listen_addr(),
            bootstrap: self.bootstrap,
            is_bootstrap: self.bootstrap_node,
            bucket_size: self.bucket_size,
            auto_mine: self.auto_mine_secs.map(Duration::from_secs),
            ..NetworkConfig::default()
        }
    }
}

/// Consensus and economics parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub difficulty: u32,
    pub fee_limit: u64,
    pub mining_reward: u64,
    pub initial_balance: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            difficulty: DEFAULT_DIFFICULTY,
            fee_limit: BLOCK_FEE_LIMIT,
            mining_reward: MINING_REWARD,
            initial_balance: INITIAL_BALANCE,
        }
    }
}

/// Peer-to-peer parameters
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// `host:port` the listener binds to. Port 0 picks an ephemeral port.
    pub listen: String,
    pub bootstrap: SocketAddr,
    pub is_bootstrap: bool,
    pub bucket_size: usize,
    pub dedup_capacity: usize,
    /// Messages queued per peer before further ones are dropped
    pub outbound_capacity: usize,
    /// Longest accepted wire line, newline excluded
    pub max_message_bytes: usize,
    pub auto_mine: Option<Duration>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            listen: format!("{}:{}", DEFAULT_HOST, BOOTSTRAP_PORT),
            bootstrap: SocketAddr::from(([127, 0, 0, 1], BOOTSTRAP_PORT)),
            is_bootstrap: false,
            bucket_size: BUCKET_SIZE,
            dedup_capacity: DEDUP_CAPACITY,
            outbound_capacity: OUTBOUND_QUEUE_CAPACITY,
            max_message_bytes: MAX_MESSAGE_BYTES,
            auto_mine: None,
        }
    }
}
