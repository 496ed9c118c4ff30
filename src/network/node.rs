use dashmap::DashMap;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::blockchain::{
    Account, Address, Block, Blockchain, BlockchainError, Hash, Transaction, Wallet,
};
use crate::config::{ChainConfig, NetworkConfig};

use super::kademlia::{NodeId, Peer, RoutingTable};
use super::message::{ChainSnapshot, Message, MessageError, Publication, PublishContent};
use super::subscription::{SeenCache, Topic};

/// Errors that can occur in the peer protocol
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Blockchain(#[from] BlockchainError),

    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("Mining already in progress")]
    MiningInProgress,

    #[error("Mining task failed: {0}")]
    MiningFailed(String),
}

/// Lifecycle of a single peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Established,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Established => "established",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Sending half of a connection, shared with the registry
#[derive(Debug, Clone)]
struct ConnectionHandle {
    id: Uuid,
    outbound: mpsc::Sender<Message>,
    close: Arc<Notify>,
}

impl ConnectionHandle {
    /// Queues `message` without waiting. A full queue drops it.
    fn send(&self, message: Message) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!("Outbound queue of connection {} is full, dropping {}", self.id, message.kind());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn close(&self) {
        self.close.notify_one();
    }
}

/// Routing table and connection map, always mutated together
#[derive(Debug)]
pub struct PeerRegistry {
    table: RoutingTable,
    connections: HashMap<NodeId, ConnectionHandle>,
}

impl PeerRegistry {
    fn new(table: RoutingTable) -> Self {
        PeerRegistry {
            table,
            connections: HashMap::new(),
        }
    }

    /// Records an established peer. Closes whichever connection the table evicted.
    fn establish(&mut self, peer: Peer, handle: ConnectionHandle) -> Option<Peer> {
        let node_id = peer.node_id;
        self.connections.insert(node_id, handle);

        let evicted = self.table.insert(peer).evicted;
        if let Some(evicted) = &evicted {
            if let Some(handle) = self.connections.remove(&evicted.node_id) {
                handle.close();
            }
        }
        evicted
    }

    /// Forgets `node_id` if `connection` is still the one registered for it
    fn release(&mut self, node_id: &NodeId, connection: Uuid) -> bool {
        match self.connections.get(node_id) {
            Some(handle) if handle.id == connection => {
                self.connections.remove(node_id);
                self.table.remove(node_id);
                true
            }
            _ => false,
        }
    }

    fn is_connected(&self, node_id: &NodeId) -> bool {
        self.connections.contains_key(node_id)
    }

    /// Queues `message` for every connected peer except `except`
    fn broadcast(&self, message: &Message, except: Option<&NodeId>) -> usize {
        let mut sent = 0;
        for (node_id, handle) in &self.connections {
            if Some(node_id) == except {
                continue;
            }
            if handle.send(message.clone()) {
                sent += 1;
            }
        }
        sent
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// The in-flight proof-of-work task, at most one per node
#[derive(Debug)]
struct MiningTask {
    index: u64,
    cancel: Arc<AtomicBool>,
}

/// Per-connection bookkeeping owned by the connection task
struct Session {
    id: Uuid,
    remote: SocketAddr,
    dialed: bool,
    state: ConnectionState,
    peer: Option<Peer>,
    handle: ConnectionHandle,
}

impl Session {
    fn transition(&mut self, state: ConnectionState) {
        debug!("Connection {} with {}: {} -> {}", self.id, self.remote, self.state, state);
        self.state = state;
    }
}

enum Flow {
    Continue,
    Close,
}

/// A ledger node: peer listener, gossip relay and mining driver
pub struct Node {
    id: NodeId,
    local: Peer,
    config: NetworkConfig,
    blockchain: Mutex<Blockchain>,
    registry: Mutex<PeerRegistry>,
    subscriptions: DashMap<Topic, SeenCache>,
    mining: Mutex<Option<MiningTask>>,
    sync_requested: AtomicBool,
    announced: AtomicBool,
}

impl Node {
    /// Binds the listener, joins the network through the bootstrap node and
    /// starts background tasks.
    ///
    /// # Arguments
    ///
    /// * `config` - Network parameters
    /// * `chain` - Consensus parameters
    /// * `miner` - Address credited with block rewards
    pub async fn start(
        config: NetworkConfig,
        chain: ChainConfig,
        miner: Address,
    ) -> Result<Arc<Node>, NetworkError> {
        let listener = TcpListener::bind(&config.listen).await?;
        let bound = listener.local_addr()?;

        let id = NodeId::random();
        let local = Peer::new(id, bound.ip().to_string(), bound.port());

        let mut blockchain = Blockchain::new(miner.clone(), chain);
        blockchain.add_account(miner, 0)?;

        let table = RoutingTable::new(id, config.bucket_size, config.is_bootstrap);
        let subscriptions = DashMap::new();
        for topic in Topic::ALL {
            subscriptions.insert(topic, SeenCache::new(config.dedup_capacity));
        }

        let node = Arc::new(Node {
            id,
            local,
            config,
            blockchain: Mutex::new(blockchain),
            registry: Mutex::new(PeerRegistry::new(table)),
            subscriptions,
            mining: Mutex::new(None),
            sync_requested: AtomicBool::new(false),
            announced: AtomicBool::new(false),
        });

        info!("Node {} listening on {}", id, bound);

        let acceptor = Arc::clone(&node);
        tokio::spawn(async move { acceptor.accept_loop(listener).await });

        if !node.config.is_bootstrap {
            let bootstrap = node.config.bootstrap.to_string();
            if let Err(e) = node.connect(&bootstrap).await {
                warn!("Could not reach bootstrap node {}: {}", bootstrap, e);
            }
        }

        if let Some(period) = node.config.auto_mine {
            let miner = Arc::clone(&node);
            tokio::spawn(async move { miner.auto_mine(period).await });
        }

        Ok(node)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// How this node advertises itself to peers
    pub fn local_peer(&self) -> &Peer {
        &self.local
    }

    pub fn local_addr(&self) -> String {
        self.local.address()
    }

    pub fn is_bootstrap(&self) -> bool {
        self.config.is_bootstrap
    }

    pub fn blockchain(&self) -> &Mutex<Blockchain> {
        &self.blockchain
    }

    /// Non-empty routing buckets
    pub async fn routing_buckets(&self) -> Vec<(usize, Vec<Peer>)> {
        self.registry.lock().await.table().buckets()
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.registry.lock().await.table().peers()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.lock().await.connection_count()
    }

    pub async fn is_mining(&self) -> bool {
        self.mining.lock().await.is_some()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    info!("Accepted connection from {}", remote);
                    let node = Arc::clone(&self);
                    tokio::spawn(async move { node.run_connection(stream, remote, false).await });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    }

    /// Dials `addr` and runs the connection in the background
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<(), NetworkError> {
        debug!("Connection to {}: {}", addr, ConnectionState::Connecting);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::PeerUnavailable(format!("{}: {}", addr, e)))?;
        let remote = stream.peer_addr()?;

        let node = Arc::clone(self);
        tokio::spawn(async move { node.run_connection(stream, remote, true).await });
        Ok(())
    }

    fn spawn_connect(self: &Arc<Self>, peer: Peer) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = node.connect(&peer.address()).await {
                warn!("Could not connect to discovered peer {}: {}", peer, e);
            }
        });
    }

    async fn run_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr, dialed: bool) {
        let (reader, writer) = stream.into_split();
        let (outbound, mut queue) = mpsc::channel::<Message>(self.config.outbound_capacity.max(1));
        let close = Arc::new(Notify::new());

        let id = Uuid::new_v4();
        let mut session = Session {
            id,
            remote,
            dialed,
            state: ConnectionState::Connecting,
            peer: None,
            handle: ConnectionHandle {
                id,
                outbound,
                close: Arc::clone(&close),
            },
        };

        let writer_task = tokio::spawn(async move {
            let mut writer = BufWriter::new(writer);
            while let Some(message) = queue.recv().await {
                let line = match message.encode() {
                    Ok(line) => line,
                    Err(e) => {
                        error!("Failed to encode {} for {}: {}", message.kind(), remote, e);
                        continue;
                    }
                };
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    break;
                }
            }
        });

        session.transition(ConnectionState::Handshaking);
        if dialed {
            session.handle.send(Message::Handshake(self.local.clone()));
        }

        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let max_line = self.config.max_message_bytes as u64 + 1;

        loop {
            line.clear();
            let mut limited = (&mut reader).take(max_line);
            tokio::select! {
                result = limited.read_line(&mut line) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) if n as u64 == max_line && !line.ends_with('\n') => {
                            warn!(
                                "Closing connection with {}: message exceeds {} bytes",
                                remote, self.config.max_message_bytes
                            );
                            break;
                        }
                        Ok(_) => {
                            let message = match Message::decode(line.trim_end()) {
                                Ok(message) => message,
                                Err(e) => {
                                    warn!("Dropping message from {}: {}", remote, e);
                                    continue;
                                }
                            };
                            match self.handle_message(&mut session, message).await {
                                Flow::Continue => {}
                                Flow::Close => break,
                            }
                        }
                        Err(e) => {
                            warn!("Read error from {}: {}", remote, e);
                            break;
                        }
                    }
                }
                _ = close.notified() => {
                    debug!("Closing connection with {}", remote);
                    break;
                }
            }
        }

        session.transition(ConnectionState::Closed);
        if let Some(peer) = &session.peer {
            if self.registry.lock().await.release(&peer.node_id, session.id) {
                info!("Peer {} disconnected, removed from routing table", peer);
            }
        }
        writer_task.abort();
    }

    async fn handle_message(self: &Arc<Self>, session: &mut Session, message: Message) -> Flow {
        if let Message::Handshake(peer) = message {
            return self.handle_handshake(session, peer).await;
        }

        let sender = match &session.peer {
            Some(peer) if session.state == ConnectionState::Established => peer.node_id,
            _ => {
                warn!("Ignoring {} from {} before handshake", message.kind(), session.remote);
                return Flow::Continue;
            }
        };

        match message {
            Message::Handshake(_) => {}
            Message::ClosestNodes(peers) => self.handle_closest_nodes(peers).await,
            Message::Publish(publication) => self.receive(publication, Some(sender)).await,
            Message::RequestChain => {
                let chain = self.blockchain.lock().await;
                let snapshot = ChainSnapshot {
                    chain: chain.chain().to_vec(),
                    accounts: chain.ledger().get_all_accounts(),
                };
                drop(chain);
                session.handle.send(Message::ResponseChain(snapshot));
            }
            Message::ResponseChain(snapshot) => self.handle_chain_snapshot(snapshot).await,
        }
        Flow::Continue
    }

    async fn handle_handshake(self: &Arc<Self>, session: &mut Session, peer: Peer) -> Flow {
        if peer.node_id == self.id {
            warn!("Refusing handshake carrying our own id from {}", session.remote);
            return Flow::Close;
        }
        if session.state == ConnectionState::Established {
            debug!("Repeated handshake from {}", session.remote);
            return Flow::Continue;
        }

        let peer = peer.with_fallback_host(&session.remote);
        if !session.dialed {
            session.handle.send(Message::Handshake(self.local.clone()));
        }

        let mut registry = self.registry.lock().await;
        let evicted = registry.establish(peer.clone(), session.handle.clone());
        let closest = if self.config.is_bootstrap {
            Some(registry.table().closest_to(&peer.node_id, self.config.bucket_size))
        } else {
            None
        };
        drop(registry);

        session.peer = Some(peer.clone());
        session.transition(ConnectionState::Established);
        info!("Added peer {}", peer);

        if let Some(evicted) = evicted {
            info!("Evicted peer {}", evicted);
            if evicted.node_id == peer.node_id {
                return Flow::Close;
            }
        }

        if let Some(closest) = closest {
            debug!("Sending {} closest nodes to {}", closest.len(), peer);
            session.handle.send(Message::ClosestNodes(closest));
        }

        let at_genesis = self.blockchain.lock().await.height() == 0;
        if at_genesis && !self.sync_requested.swap(true, Ordering::SeqCst) {
            debug!("Requesting chain from {}", peer);
            session.handle.send(Message::RequestChain);
        }

        if !self.announced.swap(true, Ordering::SeqCst) {
            let miner = {
                let chain = self.blockchain.lock().await;
                chain.ledger().get_account(chain.miner())
            };
            if let Some(account) = miner {
                self.publish(PublishContent::NewAccount(account)).await;
            }
        }

        Flow::Continue
    }

    async fn handle_closest_nodes(self: &Arc<Self>, peers: Vec<Peer>) {
        info!("Discovered {} nodes", peers.len());
        for peer in peers {
            if peer.node_id == self.id || peer.host.is_empty() {
                continue;
            }
            if self.registry.lock().await.is_connected(&peer.node_id) {
                continue;
            }
            self.spawn_connect(peer);
        }
    }

    async fn handle_chain_snapshot(&self, snapshot: ChainSnapshot) {
        let mut chain = self.blockchain.lock().await;
        if chain.height() != 0 {
            debug!("Ignoring chain snapshot, local chain already at #{}", chain.height());
            return;
        }

        if let Err(e) = chain.sync_chain(snapshot.chain) {
            warn!("Rejected chain snapshot: {}", e);
            return;
        }

        let mut imported = 0;
        for account in snapshot.accounts {
            if chain.ledger().contains(&account.address) {
                continue;
            }
            if chain
                .import_account(account.address, account.balance, account.nonce)
                .is_ok()
            {
                imported += 1;
            }
        }
        info!("Synced to #{} and imported {} accounts", chain.height(), imported);
    }

    /// Applies an incoming publication once and relays it to everyone but
    /// the sender. Content that the local state rejects is not relayed.
    async fn receive(&self, publication: Publication, from: Option<NodeId>) {
        let topic = publication.topic();
        let seen = self
            .subscriptions
            .entry(topic)
            .or_insert_with(|| SeenCache::new(self.config.dedup_capacity))
            .check_and_record(publication.hash);
        if seen {
            debug!("Already seen {} {}", topic, publication.hash);
            return;
        }

        if !self.apply(&publication.content).await {
            return;
        }

        let relayed = self
            .registry
            .lock()
            .await
            .broadcast(&Message::Publish(publication), from.as_ref());
        debug!("Relayed {} to {} peers", topic, relayed);
    }

    async fn apply(&self, content: &PublishContent) -> bool {
        match content {
            PublishContent::NewAccount(account) => {
                let mut chain = self.blockchain.lock().await;
                match chain.import_account(account.address.clone(), account.balance, account.nonce) {
                    Ok(()) => {
                        info!("New account {}", account.address);
                        true
                    }
                    Err(e) => {
                        debug!("Not adding account: {}", e);
                        false
                    }
                }
            }
            PublishContent::Transaction(tx) => {
                match self.blockchain.lock().await.submit_transaction(tx.clone()) {
                    Ok(()) => {
                        info!("Received {}", tx);
                        true
                    }
                    Err(e) => {
                        warn!("Rejected gossiped transaction {}: {}", tx.hash, e);
                        false
                    }
                }
            }
            PublishContent::NewBlock(block) => {
                let accepted = self.blockchain.lock().await.accept_remote_block(block.clone());
                match accepted {
                    Ok(block) => {
                        self.cancel_mining(block.index).await;
                        true
                    }
                    Err(e) => {
                        warn!("Rejected block #{} {}: {}", block.index, block.hash, e);
                        false
                    }
                }
            }
            PublishContent::Ping(text) => {
                info!("PING {}", text);
                true
            }
        }
    }

    /// Sends new content to every peer under a fresh message id
    pub async fn publish(&self, content: PublishContent) -> Hash {
        let publication = Publication::new(content);
        let topic = publication.topic();
        let hash = publication.hash;

        // Record first so our own broadcast is never processed when it echoes back
        self.subscriptions
            .entry(topic)
            .or_insert_with(|| SeenCache::new(self.config.dedup_capacity))
            .check_and_record(hash);

        let sent = self
            .registry
            .lock()
            .await
            .broadcast(&Message::Publish(publication), None);
        info!("Published {} {} to {} peers", topic, hash, sent);
        hash
    }

    /// Admits a transaction locally and gossips it
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<(), NetworkError> {
        self.blockchain.lock().await.submit_transaction(tx.clone())?;
        self.publish(PublishContent::Transaction(tx)).await;
        Ok(())
    }

    /// Creates a funded account with a fresh key pair and announces it
    pub async fn create_account(&self) -> Result<Wallet, NetworkError> {
        let wallet = Wallet::new();
        let account = {
            let mut chain = self.blockchain.lock().await;
            let balance = chain.config().initial_balance;
            chain.add_account(wallet.address().clone(), balance)?;
            Account::new(wallet.address().clone(), balance, 0)
        };

        self.publish(PublishContent::NewAccount(account)).await;
        Ok(wallet)
    }

    pub async fn broadcast_ping(&self, text: String) -> Hash {
        self.publish(PublishContent::Ping(text)).await
    }

    /// Mines the pending pool into a block, commits it and gossips it.
    ///
    /// The proof of work runs on the blocking pool against an immutable
    /// header snapshot. If a remote block for the same height is accepted
    /// meanwhile, the attempt is dropped and mining restarts from the new
    /// tip while transactions remain.
    pub async fn mine(&self) -> Result<Block, NetworkError> {
        loop {
            let (mut candidate, cancel) = {
                let mut slot = self.mining.lock().await;
                if slot.is_some() {
                    return Err(NetworkError::MiningInProgress);
                }

                let mut blockchain = self.blockchain.lock().await;
                if blockchain.config().difficulty == 0 {
                    // Any nonce seals at zero difficulty
                    let block = blockchain.produce_block()?;
                    drop(blockchain);
                    drop(slot);
                    info!("Mined block #{} {}", block.index, block.hash);
                    self.publish(PublishContent::NewBlock(block.clone())).await;
                    return Ok(block);
                }

                let candidate = blockchain.prepare_block()?;
                let cancel = Arc::new(AtomicBool::new(false));
                *slot = Some(MiningTask {
                    index: candidate.index,
                    cancel: Arc::clone(&cancel),
                });
                (candidate, cancel)
            };

            info!(
                "Mining block #{} with {} transactions at difficulty {}",
                candidate.index,
                candidate.transactions.len(),
                candidate.difficulty
            );

            let job = candidate.mining_job();
            let solved = tokio::task::spawn_blocking(move || job.solve(&cancel)).await;
            self.mining.lock().await.take();

            let (hash, nonce) = match solved {
                Ok(Some(result)) => result,
                Ok(None) => {
                    info!("Mining of #{} cancelled, restarting from new tip", candidate.index);
                    continue;
                }
                Err(e) => return Err(NetworkError::MiningFailed(e.to_string())),
            };
            candidate.seal(hash, nonce);

            let committed = self.blockchain.lock().await.commit_mined_block(candidate);
            match committed {
                Ok(block) => {
                    info!("Mined block #{} {}", block.index, block.hash);
                    self.publish(PublishContent::NewBlock(block.clone())).await;
                    return Ok(block);
                }
                Err(BlockchainError::ChainInvalid(e)) => {
                    info!("Discarding stale block: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn cancel_mining(&self, accepted_index: u64) {
        if let Some(task) = self.mining.lock().await.as_ref() {
            if task.index <= accepted_index {
                info!("Cancelling mining of #{}", task.index);
                task.cancel.store(true, Ordering::Relaxed);
            }
        }
    }

    async fn auto_mine(self: Arc<Self>, period: std::time::Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if !self.blockchain.lock().await.has_pending() {
                continue;
            }
            match self.mine().await {
                Ok(_) => {}
                Err(NetworkError::MiningInProgress) => debug!("Mining already running"),
                Err(NetworkError::Blockchain(BlockchainError::EmptyPool)) => {}
                Err(e) => warn!("Periodic mining failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::time::timeout;

    fn chain_config() -> ChainConfig {
        ChainConfig {
            difficulty: 4,
            ..ChainConfig::default()
        }
    }

    fn bootstrap_config() -> NetworkConfig {
        NetworkConfig {
            listen: "127.0.0.1:0".to_string(),
            is_bootstrap: true,
            ..NetworkConfig::default()
        }
    }

    fn joining_config(bootstrap: &Node) -> NetworkConfig {
        NetworkConfig {
            listen: "127.0.0.1:0".to_string(),
            bootstrap: bootstrap.local_addr().parse().unwrap(),
            ..NetworkConfig::default()
        }
    }

    async fn start(config: NetworkConfig) -> Arc<Node> {
        Node::start(config, chain_config(), Wallet::new().address().clone())
            .await
            .unwrap()
    }

    macro_rules! eventually {
        ($condition:expr) => {{
            let mut met = false;
            for _ in 0..200 {
                if $condition {
                    met = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            assert!(met, "condition not met in time: {}", stringify!($condition));
        }};
    }

    /// A bare TCP client speaking the wire protocol
    struct RawPeer {
        id: NodeId,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl RawPeer {
        async fn connect(node: &Node, id: NodeId) -> RawPeer {
            let stream = TcpStream::connect(node.local_addr()).await.unwrap();
            let (reader, writer) = stream.into_split();
            let mut peer = RawPeer {
                id,
                reader: BufReader::new(reader),
                writer,
            };
            peer.send(&Message::Handshake(Peer::new(id, "127.0.0.1", 1))).await;
            peer
        }

        async fn send(&mut self, message: &Message) {
            let line = format!("{}\n", message.encode().unwrap());
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        /// Messages received until the line goes quiet
        async fn drain(&mut self) -> Vec<Message> {
            let mut received = Vec::new();
            loop {
                let mut line = String::new();
                match timeout(Duration::from_millis(300), self.reader.read_line(&mut line)).await {
                    Ok(Ok(n)) if n > 0 => received.push(Message::decode(line.trim_end()).unwrap()),
                    _ => return received,
                }
            }
        }
    }

    fn pings(messages: &[Message]) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, Message::Publish(p) if p.topic() == Topic::Ping))
            .count()
    }

    #[tokio::test]
    async fn test_join_through_bootstrap() {
        let bootstrap = start(bootstrap_config()).await;
        let joiner = start(joining_config(&bootstrap)).await;

        eventually!(bootstrap.peers().await.len() == 1 && joiner.peers().await.len() == 1);

        assert_eq!(bootstrap.peers().await[0].node_id, *joiner.id());
        assert_eq!(joiner.peers().await[0].node_id, *bootstrap.id());
        assert_eq!(joiner.peers().await[0].port, bootstrap.local_peer().port);
    }

    #[tokio::test]
    async fn test_discovers_peers_from_bootstrap() {
        let bootstrap = start(bootstrap_config()).await;
        let first = start(joining_config(&bootstrap)).await;
        eventually!(bootstrap.peers().await.len() == 1);

        let second = start(joining_config(&bootstrap)).await;

        // The second node learns about the first from the closest-nodes reply
        eventually!(
            second.peers().await.iter().any(|p| p.node_id == *first.id())
                && first.peers().await.iter().any(|p| p.node_id == *second.id())
        );
    }

    #[tokio::test]
    async fn test_relay_skips_sender_and_duplicates() {
        let node = start(bootstrap_config()).await;
        let mut origin = RawPeer::connect(&node, NodeId::random()).await;
        let mut other = RawPeer::connect(&node, NodeId::random()).await;
        eventually!(node.connection_count().await == 2);
        origin.drain().await;
        other.drain().await;

        let publication = Publication::new(PublishContent::Ping("hello".to_string()));
        origin.send(&Message::Publish(publication.clone())).await;
        origin.send(&Message::Publish(publication)).await;

        assert_eq!(pings(&other.drain().await), 1);
        assert_eq!(pings(&origin.drain().await), 0);
    }

    #[tokio::test]
    async fn test_own_publication_not_reprocessed() {
        let node = start(bootstrap_config()).await;
        let mut echo = RawPeer::connect(&node, NodeId::random()).await;
        let mut other = RawPeer::connect(&node, NodeId::random()).await;
        eventually!(node.connection_count().await == 2);
        echo.drain().await;
        other.drain().await;

        let hash = node.broadcast_ping("hi".to_string()).await;
        assert_eq!(pings(&echo.drain().await), 1);
        assert_eq!(pings(&other.drain().await), 1);

        // Echo it straight back; the node already knows the id
        let publication = Publication {
            hash,
            content: PublishContent::Ping("hi".to_string()),
        };
        echo.send(&Message::Publish(publication)).await;
        assert_eq!(pings(&other.drain().await), 0);
    }

    #[tokio::test]
    async fn test_handshake_with_own_id_refused() {
        let node = start(bootstrap_config()).await;
        let mut impostor = RawPeer::connect(&node, *node.id()).await;

        let mut line = String::new();
        let read = timeout(Duration::from_secs(2), impostor.reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
        assert!(node.peers().await.is_empty());
        assert_eq!(impostor.id, *node.id());
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer() {
        let node = start(bootstrap_config()).await;
        let peer = RawPeer::connect(&node, NodeId::random()).await;
        eventually!(node.connection_count().await == 1);

        drop(peer);
        eventually!(node.connection_count().await == 0 && node.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_mine_on_empty_pool() {
        let node = start(bootstrap_config()).await;
        assert!(matches!(
            node.mine().await,
            Err(NetworkError::Blockchain(BlockchainError::EmptyPool))
        ));
        assert!(!node.is_mining().await);
    }

    #[tokio::test]
    async fn test_transaction_and_block_propagation() {
        let bootstrap = start(bootstrap_config()).await;
        let joiner = start(joining_config(&bootstrap)).await;
        eventually!(bootstrap.peers().await.len() == 1 && joiner.peers().await.len() == 1);

        // Both miners must be known on both sides
        eventually!(
            bootstrap.blockchain().lock().await.ledger().len() == 2
                && joiner.blockchain().lock().await.ledger().len() == 2
        );

        let alice = bootstrap.create_account().await.unwrap();
        let bob = bootstrap.create_account().await.unwrap();
        eventually!(joiner.blockchain().lock().await.ledger().len() == 4);

        let tx = Transaction::signed(&alice, bob.address().clone(), 20, 1, 0).unwrap();
        bootstrap.submit_transaction(tx).await.unwrap();
        eventually!(joiner.blockchain().lock().await.pending_transactions().len() == 1);

        let block = bootstrap.mine().await.unwrap();
        assert_eq!(block.index, 1);

        eventually!(joiner.blockchain().lock().await.height() == 1);

        let local = bootstrap.blockchain().lock().await;
        let remote = joiner.blockchain().lock().await;
        assert_eq!(remote.last_block().hash, block.hash);
        assert_eq!(remote.ledger().get_all_accounts(), local.ledger().get_all_accounts());
        assert_eq!(remote.ledger().get_account(alice.address()).unwrap().balance, 79);
        assert!(!remote.has_pending());
    }

    #[tokio::test]
    async fn test_joiner_syncs_existing_chain() {
        let bootstrap = start(bootstrap_config()).await;
        let alice = bootstrap.create_account().await.unwrap();
        let bob = bootstrap.create_account().await.unwrap();
        let tx = Transaction::signed(&alice, bob.address().clone(), 10, 1, 0).unwrap();
        bootstrap.submit_transaction(tx).await.unwrap();
        bootstrap.mine().await.unwrap();

        let joiner = start(joining_config(&bootstrap)).await;
        eventually!(joiner.blockchain().lock().await.height() == 1);

        let chain = joiner.blockchain().lock().await;
        assert!(chain.is_valid());
        assert_eq!(chain.ledger().get_account(alice.address()).unwrap().balance, 89);
    }

    #[test]
    fn test_full_outbound_queue_drops_messages() {
        let (outbound, mut queue) = mpsc::channel(1);
        let handle = ConnectionHandle {
            id: Uuid::new_v4(),
            outbound,
            close: Arc::new(Notify::new()),
        };

        assert!(handle.send(Message::RequestChain));
        assert!(!handle.send(Message::RequestChain));
        assert_eq!(queue.try_recv().unwrap(), Message::RequestChain);
        assert!(queue.try_recv().is_err());

        drop(queue);
        assert!(!handle.send(Message::RequestChain));
    }

    #[test]
    fn test_broadcast_skips_congested_peer() {
        let local = NodeId::random();
        let mut registry = PeerRegistry::new(RoutingTable::new(local, 20, true));

        let mut queues = Vec::new();
        for port in 1..=2 {
            let (outbound, queue) = mpsc::channel(1);
            let handle = ConnectionHandle {
                id: Uuid::new_v4(),
                outbound,
                close: Arc::new(Notify::new()),
            };
            registry.establish(Peer::new(NodeId::random(), "127.0.0.1", port), handle);
            queues.push(queue);
        }

        assert_eq!(registry.broadcast(&Message::RequestChain, None), 2);
        queues[0].try_recv().unwrap();

        // Only the drained queue has room
        assert_eq!(registry.broadcast(&Message::RequestChain, None), 1);
        assert_eq!(queues[0].try_recv().unwrap(), Message::RequestChain);
        assert_eq!(queues[1].try_recv().unwrap(), Message::RequestChain);
        assert!(queues[1].try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_line_closes_connection() {
        let config = NetworkConfig {
            max_message_bytes: 1024,
            ..bootstrap_config()
        };
        let node = start(config).await;
        let mut peer = RawPeer::connect(&node, NodeId::random()).await;
        eventually!(node.connection_count().await == 1);

        peer.send(&Message::Publish(Publication::new(PublishContent::Ping("short".to_string()))))
            .await;
        assert_eq!(node.connection_count().await, 1);

        // No newline within the limit
        let _ = peer.writer.write_all(&[b'a'; 4096]).await;
        eventually!(node.connection_count().await == 0 && node.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_closes_farther_peer() {
        let unreachable = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let config = NetworkConfig {
            listen: "127.0.0.1:0".to_string(),
            bootstrap: unreachable,
            bucket_size: 1,
            ..NetworkConfig::default()
        };
        let node = start(config).await;
        assert!(!node.is_bootstrap());

        // Same bucket, `far` one bit further away
        let id_at = |last: u8| {
            let mut bytes = node.id().0;
            bytes[0] ^= 0x80;
            let end = bytes.len() - 1;
            bytes[end] ^= last;
            NodeId(bytes)
        };
        let near_id = id_at(0);
        let far_id = id_at(1);

        let mut far = RawPeer::connect(&node, far_id).await;
        eventually!(node.peers().await.iter().any(|p| p.node_id == far_id));

        let _near = RawPeer::connect(&node, near_id).await;
        eventually!(node.peers().await.iter().map(|p| p.node_id).collect::<Vec<_>>() == vec![near_id]);

        let closed = timeout(Duration::from_secs(2), async {
            let mut line = String::new();
            loop {
                line.clear();
                match far.reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "evicted connection was left open");
        eventually!(node.connection_count().await == 1);
    }

    #[tokio::test]
    async fn test_mine_at_zero_difficulty() {
        let chain = ChainConfig {
            difficulty: 0,
            ..ChainConfig::default()
        };
        let node = Node::start(bootstrap_config(), chain, Wallet::new().address().clone())
            .await
            .unwrap();
        let alice = node.create_account().await.unwrap();
        let bob = node.create_account().await.unwrap();
        let tx = Transaction::signed(&alice, bob.address().clone(), 5, 1, 0).unwrap();
        node.submit_transaction(tx).await.unwrap();

        let block = node.mine().await.unwrap();
        assert_eq!(block.index, 1);
        assert!(!node.is_mining().await);
        assert!(node.blockchain().lock().await.is_valid());
    }

    #[test]
    fn test_remote_block_cancels_mining_and_restarts_from_new_tip() {
        // One blocking thread, so the proof of work can be held back
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let node = start(bootstrap_config()).await;
            let alice = Wallet::new();
            let bob = Wallet::new();
            let rival = Wallet::new();

            let mut competitor = Blockchain::new(rival.address().clone(), chain_config());
            {
                let mut chain = node.blockchain().lock().await;
                for (wallet, balance) in [(&alice, 100), (&bob, 100), (&rival, 0)] {
                    chain.add_account(wallet.address().clone(), balance).unwrap();
                    competitor.add_account(wallet.address().clone(), balance).unwrap();
                }
            }

            let to_bob = Transaction::signed(&alice, bob.address().clone(), 10, 1, 0).unwrap();
            let to_alice = Transaction::signed(&bob, alice.address().clone(), 5, 1, 0).unwrap();
            competitor.submit_transaction(to_bob.clone()).unwrap();
            let rival_block = competitor.produce_block().unwrap();

            node.submit_transaction(to_bob).await.unwrap();
            node.submit_transaction(to_alice.clone()).await.unwrap();

            let mut peer = RawPeer::connect(&node, NodeId::random()).await;
            eventually!(node.connection_count().await == 1);

            let (gate, gate_rx) = std::sync::mpsc::channel::<()>();
            let held = tokio::task::spawn_blocking(move || gate_rx.recv());

            let miner = Arc::clone(&node);
            let mining = tokio::spawn(async move { miner.mine().await });
            eventually!(node.is_mining().await);

            peer.send(&Message::Publish(Publication::new(PublishContent::NewBlock(
                rival_block.clone(),
            ))))
            .await;
            eventually!(node.blockchain().lock().await.height() == 1);

            let cancelled = node
                .mining
                .lock()
                .await
                .as_ref()
                .map(|task| task.cancel.load(Ordering::Relaxed));
            assert_eq!(cancelled, Some(true));

            gate.send(()).unwrap();
            held.await.unwrap().unwrap();

            let block = timeout(Duration::from_secs(10), mining)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(block.index, 2);
            assert_eq!(block.previous_hash, rival_block.hash);
            assert_eq!(block.transactions.len(), 1);
            assert_eq!(block.transactions[0].hash, to_alice.hash);
            assert!(!node.is_mining().await);
            assert!(node.blockchain().lock().await.is_valid());
        });
    }
}
