use log::{debug, info};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use utoipa::ToSchema;

use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Length of a node identifier in bytes
pub const NODE_ID_LEN: usize = 20;

/// One bucket per bit of the identifier
pub const BUCKET_COUNT: usize = NODE_ID_LEN * 8;

#[derive(Debug, Error)]
pub enum NodeIdError {
    #[error("Invalid node id: {0}")]
    Invalid(String),
}

/// A node identifier, compared by XOR distance
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ToSchema)]
#[schema(value_type = String)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    pub fn distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Orders `a` and `b` by their distance from `self`, as big-endian integers
    pub fn cmp_distance(&self, a: &NodeId, b: &NodeId) -> Ordering {
        self.distance(a).cmp(&self.distance(b))
    }

    /// Leading zero bits of the XOR distance. Identical IDs land in the last bucket.
    pub fn bucket_index(&self, other: &NodeId) -> usize {
        let distance = self.distance(other);
        for (i, byte) in distance.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        BUCKET_COUNT - 1
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| NodeIdError::Invalid(e.to_string()))?;
        let bytes: [u8; NODE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| NodeIdError::Invalid(format!("expected {} bytes", NODE_ID_LEN)))?;
        Ok(NodeId(bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A routing table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Peer {
    #[serde(rename = "nodeID")]
    pub node_id: NodeId,

    /// Empty when the sender left it out; filled from the socket address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,

    pub port: u16,
}

impl Peer {
    pub fn new(node_id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Peer {
            node_id,
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Fills in a missing host from the address the peer connected from
    pub fn with_fallback_host(mut self, remote: &SocketAddr) -> Self {
        if self.host.is_empty() {
            self.host = remote.ip().to_string();
        }
        self
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_id, self.host, self.port)
    }
}

/// Result of inserting a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion {
    pub evicted: Option<Peer>,
}

/// Kademlia routing table of 160 distance buckets.
///
/// Each bucket is kept sorted by distance from the local ID. When a bucket
/// grows past `bucket_size` the most distant entry is evicted and reported,
/// unless this is the bootstrap node's table, which keeps everyone.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    local: NodeId,
    bucket_size: usize,
    bootstrap: bool,
    buckets: Vec<Vec<Peer>>,
}

impl RoutingTable {
    pub fn new(local: NodeId, bucket_size: usize, bootstrap: bool) -> Self {
        RoutingTable {
            local,
            bucket_size,
            bootstrap,
            buckets: vec![Vec::new(); BUCKET_COUNT],
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }

    /// Adds `peer` to its bucket, replacing an entry with the same ID
    pub fn insert(&mut self, peer: Peer) -> Insertion {
        let local = self.local;
        let index = local.bucket_index(&peer.node_id);
        let bucket = &mut self.buckets[index];

        bucket.retain(|p| p.node_id != peer.node_id);
        debug!("Adding peer {} to bucket {}", peer, index);
        bucket.push(peer);
        bucket.sort_by(|a, b| local.cmp_distance(&a.node_id, &b.node_id));

        let evicted = if bucket.len() > self.bucket_size && !self.bootstrap {
            let evicted = bucket.pop();
            if let Some(peer) = &evicted {
                info!("Bucket {} full, evicting {}", index, peer);
            }
            evicted
        } else {
            None
        };

        Insertion { evicted }
    }

    /// Removes the peer with `node_id`. Returns whether anything was removed.
    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        let index = self.local.bucket_index(node_id);
        let bucket = &mut self.buckets[index];
        let before = bucket.len();
        bucket.retain(|p| &p.node_id != node_id);
        bucket.len() != before
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.buckets[self.local.bucket_index(node_id)]
            .iter()
            .any(|p| &p.node_id == node_id)
    }

    /// Up to `count` peers ordered by XOR distance to `target`, excluding `target`
    pub fn closest_to(&self, target: &NodeId, count: usize) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .buckets
            .iter()
            .flatten()
            .filter(|p| &p.node_id != target)
            .cloned()
            .collect();

        peers.sort_by(|a, b| target.cmp_distance(&a.node_id, &b.node_id));
        peers.truncate(count);
        peers
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.buckets.iter().flatten().cloned().collect()
    }

    /// Non-empty buckets with their index
    pub fn buckets(&self) -> Vec<(usize, Vec<Peer>)> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(i, bucket)| (i, bucket.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
