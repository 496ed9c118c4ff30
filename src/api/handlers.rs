use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::{Account, Address, Block, BlockchainError, Hash, Transaction, Wallet};
use crate::config::DEFAULT_FEE;
use crate::network::{NetworkError, Node};

use super::schema::{BucketView, NodeInfo, PeersResponse};

/// Shared node handle
pub type NodeData = web::Data<Node>;

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The blocks in the chain
    pub chain: Vec<Block>,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Request for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    /// The sender's address
    pub sender: String,

    /// The recipient's address
    pub recipient: String,

    /// The amount to transfer
    pub amount: u64,

    /// The transaction fee, 1 when omitted
    #[serde(default)]
    pub fee: Option<u64>,

    /// The sender's private key (for signing)
    pub private_key: String,
}

/// Response for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    /// The message
    pub message: String,

    /// The transaction hash
    pub hash: Hash,

    /// The nonce the transaction was signed with
    pub nonce: u64,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    /// The message
    pub message: String,

    /// The newly mined block
    pub block: Block,
}

/// Response for the create account endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct WalletResponse {
    /// The account's address
    pub address: String,

    /// The wallet's private key (hex encoded)
    pub private_key: String,

    /// Starting balance
    pub balance: u64,
}

/// Request for the ping endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct PingRequest {
    pub message: String,
}

/// Response for the ping endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct PingResponse {
    /// Message id the ping was published under
    pub hash: Hash,
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({ "error": message }))
}

/// Get the full blockchain
///
/// Returns the entire blockchain and its validity status
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(node: NodeData) -> impl Responder {
    let blockchain = node.blockchain().lock().await;
    let chain = blockchain.chain().to_vec();

    let response = ChainResponse {
        length: chain.len(),
        chain,
        is_valid: blockchain.is_valid(),
    };

    HttpResponse::Ok().json(response)
}

/// Check if the blockchain is valid
///
/// Re-verifies every block against its parent
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = bool)
    )
)]
pub async fn validate_chain(node: NodeData) -> impl Responder {
    let is_valid = node.blockchain().lock().await.is_valid();
    HttpResponse::Ok().json(is_valid)
}

/// Get all pending transactions
///
/// Returns all transactions waiting to be included in a block
#[utoipa::path(
    get,
    path = "/api/v1/transactions/pending",
    responses(
        (status = 200, description = "Pending transactions retrieved successfully", body = Vec<Transaction>)
    )
)]
pub async fn get_pending_transactions(node: NodeData) -> impl Responder {
    let transactions = node.blockchain().lock().await.pending_transactions().to_vec();
    HttpResponse::Ok().json(transactions)
}

/// Create a new transaction
///
/// Signs a transfer with the sender's key, admits it to the pool and gossips it
#[utoipa::path(
    post,
    path = "/api/v1/transactions/new",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction created successfully", body = TransactionResponse),
        (status = 400, description = "Invalid transaction data"),
        (status = 404, description = "Sender account not found")
    )
)]
pub async fn new_transaction(
    node: NodeData,
    transaction_req: web::Json<TransactionRequest>,
) -> impl Responder {
    let sender: Address = match transaction_req.sender.parse() {
        Ok(address) => address,
        Err(err) => return bad_request(format!("Invalid sender: {}", err)),
    };
    let recipient: Address = match transaction_req.recipient.parse() {
        Ok(address) => address,
        Err(err) => return bad_request(format!("Invalid recipient: {}", err)),
    };

    let private_key_bytes = match hex::decode(&transaction_req.private_key) {
        Ok(bytes) => bytes,
        Err(_) => return bad_request("Invalid private key format. Must be a hex string.".to_string()),
    };

    let wallet = match Wallet::from_secret_key(&private_key_bytes) {
        Ok(wallet) => wallet,
        Err(err) => return bad_request(format!("Invalid private key: {}", err)),
    };

    if wallet.address() != &sender {
        return bad_request("Private key does not match sender address".to_string());
    }

    // Sign with the sender's current nonce
    let nonce = match node.blockchain().lock().await.ledger().get_account(&sender) {
        Some(account) => account.nonce,
        None => {
            return HttpResponse::NotFound().json(serde_json::json!({
                "error": format!("Account not found: {}", sender)
            }))
        }
    };

    let fee = transaction_req.fee.unwrap_or(DEFAULT_FEE);
    let transaction = match Transaction::signed(&wallet, recipient, transaction_req.amount, fee, nonce) {
        Ok(transaction) => transaction,
        Err(err) => return bad_request(format!("Failed to create transaction: {}", err)),
    };
    let hash = transaction.hash;

    match node.submit_transaction(transaction).await {
        Ok(()) => HttpResponse::Created().json(TransactionResponse {
            message: "Transaction added to the pool".to_string(),
            hash,
            nonce,
        }),
        Err(err) => bad_request(format!("Failed to add transaction: {}", err)),
    }
}

/// Mine a new block
///
/// Seals pending transactions into a block and gossips it
#[utoipa::path(
    post,
    path = "/api/v1/mine",
    responses(
        (status = 200, description = "Block mined successfully", body = MineResponse),
        (status = 400, description = "No eligible transactions"),
        (status = 409, description = "Mining already in progress"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn mine_block(node: NodeData) -> impl Responder {
    match node.mine().await {
        Ok(block) => HttpResponse::Ok().json(MineResponse {
            message: "New Block Mined".to_string(),
            block,
        }),
        Err(NetworkError::Blockchain(BlockchainError::EmptyPool)) => {
            bad_request("No eligible transactions to mine".to_string())
        }
        Err(NetworkError::MiningInProgress) => HttpResponse::Conflict().json(serde_json::json!({
            "error": "Mining already in progress"
        })),
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": format!("Failed to mine block: {}", err)
        })),
    }
}

/// Create a new account
///
/// Creates a funded account with a random keypair and announces it to peers.
///
/// The private key must be stored by your own
#[utoipa::path(
    post,
    path = "/api/v1/accounts/new",
    responses(
        (status = 201, description = "Account created successfully", body = WalletResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn create_account(node: NodeData) -> impl Responder {
    match node.create_account().await {
        Ok(wallet) => {
            let balance = node.blockchain().lock().await.config().initial_balance;
            HttpResponse::Created().json(WalletResponse {
                address: wallet.address().0.clone(),
                private_key: hex::encode(wallet.export_secret_key()),
                balance,
            })
        }
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": format!("Failed to create account: {}", err)
        })),
    }
}

/// Get all accounts
///
/// Returns all accounts known to this node
#[utoipa::path(
    get,
    path = "/api/v1/accounts",
    responses(
        (status = 200, description = "Accounts retrieved successfully", body = Vec<Account>)
    )
)]
pub async fn get_all_accounts(node: NodeData) -> impl Responder {
    let accounts = node.blockchain().lock().await.ledger().get_all_accounts();
    HttpResponse::Ok().json(accounts)
}

/// Get an account
///
/// Returns the balance and nonce of one address
#[utoipa::path(
    get,
    path = "/api/v1/accounts/{address}",
    params(
        ("address" = String, Path, description = "Hex encoded account address")
    ),
    responses(
        (status = 200, description = "Account retrieved successfully", body = Account),
        (status = 400, description = "Invalid address"),
        (status = 404, description = "Account not found")
    )
)]
pub async fn get_account(node: NodeData, address: web::Path<String>) -> impl Responder {
    let address: Address = match address.into_inner().parse() {
        Ok(address) => address,
        Err(err) => return bad_request(format!("Invalid address: {}", err)),
    };

    match node.blockchain().lock().await.ledger().get_account(&address) {
        Some(account) => HttpResponse::Ok().json(account),
        None => HttpResponse::NotFound().json(serde_json::json!({
            "error": format!("Account not found: {}", address)
        })),
    }
}

/// Get the routing table
///
/// Returns every non-empty Kademlia bucket
#[utoipa::path(
    get,
    path = "/api/v1/peers",
    responses(
        (status = 200, description = "Routing table retrieved successfully", body = PeersResponse)
    )
)]
pub async fn get_peers(node: NodeData) -> impl Responder {
    let buckets = node
        .routing_buckets()
        .await
        .into_iter()
        .map(|(index, peers)| BucketView { index, peers })
        .collect();

    HttpResponse::Ok().json(PeersResponse {
        connections: node.connection_count().await,
        buckets,
    })
}

/// Get the local node identity
#[utoipa::path(
    get,
    path = "/api/v1/node",
    responses(
        (status = 200, description = "Node identity", body = NodeInfo)
    )
)]
pub async fn get_node(node: NodeData) -> impl Responder {
    let (miner, height, total_supply) = {
        let blockchain = node.blockchain().lock().await;
        (
            blockchain.miner().0.clone(),
            blockchain.height(),
            blockchain.ledger().total_supply(),
        )
    };
    let local = node.local_peer();

    HttpResponse::Ok().json(NodeInfo {
        node_id: node.id().to_hex(),
        host: local.host.clone(),
        port: local.port,
        bootstrap: node.is_bootstrap(),
        miner,
        height,
        total_supply,
        mining: node.is_mining().await,
    })
}

/// Broadcast a ping
///
/// Publishes a PING to every peer; peers relay it onward once
#[utoipa::path(
    post,
    path = "/api/v1/ping",
    request_body = PingRequest,
    responses(
        (status = 200, description = "Ping published", body = PingResponse)
    )
)]
pub async fn ping(node: NodeData, ping_req: web::Json<PingRequest>) -> impl Responder {
    let hash = node.broadcast_ping(ping_req.into_inner().message).await;
    HttpResponse::Ok().json(PingResponse { hash })
}
