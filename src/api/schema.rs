use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::network::Peer;

/// One non-empty routing bucket
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BucketView {
    /// Leading zero bits shared with the local node id
    pub index: usize,

    /// Peers ordered by distance from the local node
    pub peers: Vec<Peer>,
}

/// Routing table contents
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PeersResponse {
    /// Number of open peer connections
    pub connections: usize,

    pub buckets: Vec<BucketView>,
}

/// Identity of the local node
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NodeInfo {
    /// Hex encoded node id
    pub node_id: String,

    pub host: String,
    pub port: u16,

    /// Whether this is the bootstrap node
    pub bootstrap: bool,

    /// Address credited with rewards for blocks mined here
    pub miner: String,

    /// Index of the chain tip
    pub height: u64,

    /// Sum of all ledger balances
    #[schema(value_type = u64)]
    pub total_supply: u128,

    /// Whether a proof-of-work attempt is running
    pub mining: bool,
}
