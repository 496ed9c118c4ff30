use serde::{Deserialize, Serialize};

use std::collections::{HashSet, VecDeque};
use std::fmt;

use crate::blockchain::Hash;

/// Gossip topics, one dedup cache each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    NewAccount,
    NewBlock,
    Transaction,
    Ping,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::NewAccount, Topic::NewBlock, Topic::Transaction, Topic::Ping];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::NewAccount => "NEW_ACCOUNT",
            Topic::NewBlock => "NEW_BLOCK",
            Topic::Transaction => "TRANSACTION",
            Topic::Ping => "PING",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded record of recently seen publication hashes.
///
/// Once `capacity` entries are held, the older half is dropped in one go.
/// Only decides re-propagation; ledger correctness never depends on it.
#[derive(Debug, Clone)]
pub struct SeenCache {
    capacity: usize,
    hashes: HashSet<Hash>,
    order: VecDeque<Hash>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        SeenCache {
            capacity,
            hashes: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Records `hash`. Returns `true` if it was already present.
    pub fn check_and_record(&mut self, hash: Hash) -> bool {
        if self.hashes.contains(&hash) {
            return true;
        }

        if self.order.len() >= self.capacity {
            let drop = self.capacity / 2;
            for old in self.order.drain(..drop) {
                self.hashes.remove(&old);
            }
        }

        self.hashes.insert(hash);
        self.order.push_back(hash);
        false
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
