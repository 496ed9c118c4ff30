// Network module
//
// Peer-to-peer side of a node:
// - Kademlia routing table
// - Wire messages
// - Per-topic dedup caches
// - Node: connections, handshake, gossip relay and mining driver

pub mod kademlia;
pub mod message;
pub mod node;
pub mod subscription;

pub use kademlia::{NodeId, Peer, RoutingTable};
pub use message::{Message, Publication, PublishContent};
pub use node::{Node, NetworkError};
pub use subscription::{SeenCache, Topic};
