use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blockchain::{Account, Block, Hash, Transaction};

use super::kademlia::Peer;
use super::subscription::Topic;

pub const HANDSHAKE: &str = "HANDSHAKE";
pub const RESPONSE_CLOSEST_NODES: &str = "RESPONSE_CLOSEST_NODES";
pub const REQUEST_CHAIN: &str = "REQUEST_CHAIN";
pub const RESPONSE_CHAIN: &str = "RESPONSE_CHAIN";

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

/// What travels on the socket: `{ "type": ..., "message": "<json>" }`, one per line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PublishBody<T> {
    hash: Hash,
    content: T,
}

/// Content carried by a gossip publication
#[derive(Debug, Clone, PartialEq)]
pub enum PublishContent {
    NewAccount(Account),
    NewBlock(Block),
    Transaction(Transaction),
    Ping(String),
}

impl PublishContent {
    pub fn topic(&self) -> Topic {
        match self {
            PublishContent::NewAccount(_) => Topic::NewAccount,
            PublishContent::NewBlock(_) => Topic::NewBlock,
            PublishContent::Transaction(_) => Topic::Transaction,
            PublishContent::Ping(_) => Topic::Ping,
        }
    }
}

/// A message ID plus its content. The ID is random, not a content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub hash: Hash,
    pub content: PublishContent,
}

impl Publication {
    pub fn new(content: PublishContent) -> Self {
        Publication {
            hash: Hash::random(),
            content,
        }
    }

    pub fn topic(&self) -> Topic {
        self.content.topic()
    }
}

/// Chain and account state handed to a joining node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub chain: Vec<Block>,
    pub accounts: Vec<Account>,
}

/// Every message understood by the peer protocol
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(Peer),
    ClosestNodes(Vec<Peer>),
    Publish(Publication),
    RequestChain,
    ResponseChain(ChainSnapshot),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake(_) => HANDSHAKE,
            Message::ClosestNodes(_) => RESPONSE_CLOSEST_NODES,
            Message::Publish(publication) => publication.topic().as_str(),
            Message::RequestChain => REQUEST_CHAIN,
            Message::ResponseChain(_) => RESPONSE_CHAIN,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, MessageError> {
        let message = match self {
            Message::Handshake(peer) => serde_json::to_string(peer)?,
            Message::ClosestNodes(peers) => serde_json::to_string(peers)?,
            Message::Publish(Publication { hash, content }) => match content {
                PublishContent::NewAccount(account) => publish_body(*hash, account)?,
                PublishContent::NewBlock(block) => publish_body(*hash, block)?,
                PublishContent::Transaction(tx) => publish_body(*hash, tx)?,
                PublishContent::Ping(text) => publish_body(*hash, text)?,
            },
            Message::RequestChain => String::new(),
            Message::ResponseChain(snapshot) => serde_json::to_string(snapshot)?,
        };

        Ok(Envelope {
            kind: self.kind().to_string(),
            message,
        })
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, MessageError> {
        let body = envelope.message.as_str();
        let message = match envelope.kind.as_str() {
            HANDSHAKE => Message::Handshake(serde_json::from_str(body)?),
            RESPONSE_CLOSEST_NODES => Message::ClosestNodes(serde_json::from_str(body)?),
            REQUEST_CHAIN => Message::RequestChain,
            RESPONSE_CHAIN => Message::ResponseChain(serde_json::from_str(body)?),
            kind if kind == Topic::NewAccount.as_str() => {
                let body: PublishBody<Account> = serde_json::from_str(body)?;
                publication(body.hash, PublishContent::NewAccount(body.content))
            }
            kind if kind == Topic::NewBlock.as_str() => {
                let body: PublishBody<Block> = serde_json::from_str(body)?;
                publication(body.hash, PublishContent::NewBlock(body.content))
            }
            kind if kind == Topic::Transaction.as_str() => {
                let body: PublishBody<Transaction> = serde_json::from_str(body)?;
                publication(body.hash, PublishContent::Transaction(body.content))
            }
            kind if kind == Topic::Ping.as_str() => {
                let body: PublishBody<String> = serde_json::from_str(body)?;
                publication(body.hash, PublishContent::Ping(body.content))
            }
            other => return Err(MessageError::UnknownType(other.to_string())),
        };
        Ok(message)
    }

    /// Serializes to a single JSON line without the trailing newline
    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(&self.to_envelope()?)?)
    }

    pub fn decode(line: &str) -> Result<Self, MessageError> {
        let envelope: Envelope = serde_json::from_str(line)?;
        Self::from_envelope(&envelope)
    }
}

fn publish_body<T: Serialize>(hash: Hash, content: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&PublishBody { hash, content })
}

fn publication(hash: Hash, content: PublishContent) -> Message {
    Message::Publish(Publication { hash, content })
}
