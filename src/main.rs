use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use log::{debug, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod blockchain;
mod config;
mod network;

use config::NodeConfig;
use network::Node;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::validate_chain,
        api::handlers::get_pending_transactions,
        api::handlers::new_transaction,
        api::handlers::mine_block,
        api::handlers::create_account,
        api::handlers::get_all_accounts,
        api::handlers::get_account,
        api::handlers::get_peers,
        api::handlers::get_node,
        api::handlers::ping
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::TransactionStatus,
            blockchain::Account,
            blockchain::crypto::Address,
            blockchain::crypto::Hash,
            blockchain::crypto::DigitalSignature,
            blockchain::crypto::PublicKey,
            network::Peer,
            network::NodeId,
            api::schema::BucketView,
            api::schema::PeersResponse,
            api::schema::NodeInfo,
            api::handlers::ChainResponse,
            api::handlers::TransactionRequest,
            api::handlers::TransactionResponse,
            api::handlers::MineResponse,
            api::handlers::WalletResponse,
            api::handlers::PingRequest,
            api::handlers::PingResponse
        )
    ),
    tags(
        (name = "ledger", description = "Peer-to-peer ledger node endpoints")
    ),
    info(
        title = "Gossip Ledger API",
        version = "0.1.0",
        description = "HTTP front end of a peer-to-peer ledger node",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::parse();

    // Rewards for blocks mined here go to a fresh key pair
    let miner = blockchain::Wallet::new();
    info!("Miner address: {}", miner.address());
    debug!("Miner private key: {}", hex::encode(miner.export_secret_key()));

    let node = Node::start(config.network(), config.chain(), miner.address().clone())
        .await
        .with_context(|| format!("failed to start peer listener on {}", config.listen_addr()))?;
    let node = web::Data::from(node);

    info!("Starting HTTP server at http://{}:{}", config.host, config.http_port);

    // Start HTTP server
    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(node.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((config.host.as_str(), config.http_port))
    .with_context(|| format!("failed to bind HTTP server on port {}", config.http_port))?
    .run()
    .await?;

    Ok(())
}
