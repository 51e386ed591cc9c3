// src/main.rs
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use ethers::providers::{Http, Middleware, Provider};
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use tower::ServiceBuilder;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod chain;
mod codec;
mod config;
mod entry_point;
mod error;
mod estimator;
mod http;
mod rpc;
mod submitter;
mod types;

use crate::chain::ChainClient;
use crate::config::{Args, BundlerConfig};
use crate::error::ConfigError;
use crate::estimator::{EstimatorConfig, GasEstimator};
use crate::http::{RestRouteLayer, REST_ROUTES};
use crate::rpc::{BundlerRpcImpl, BundlerRpcServer};
use crate::submitter::{Submitter, SubmitterConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = BundlerConfig::from_args(Args::parse())?;
    let chain_id = config.chain_id()?;

    let provider = Provider::<Http>::try_from(config.eth_rpc_url.as_str()).map_err(|e| {
        ConfigError::RpcUrl {
            value: config.eth_rpc_url.clone(),
            source: Box::new(e),
        }
    })?;
    let client = ChainClient::new(Arc::new(provider), config.rpc_timeout);

    let submitter = Submitter::new(
        client.clone(),
        SubmitterConfig {
            private_key: config.private_key.clone(),
            chain_id: config.chain_id.clone(),
            entry_point: config.entry_point,
        },
    )?;

    let mut estimator_config = EstimatorConfig::new(config.entry_point, chain_id);
    estimator_config.default_paymaster = config.paymaster;
    estimator_config.buffer_percent = config.gas_buffer_percent;
    let estimator = GasEstimator::new(client.clone(), estimator_config);

    check_node(&client, chain_id, submitter.bundler_address).await;

    let rpc = BundlerRpcImpl::new(Arc::new(estimator), Arc::new(submitter), chain_id);

    info!(
        "Starting bundler RPC server on {} (EntryPoint {:?}, chain {})",
        config.rpc_server_addr, config.entry_point, chain_id
    );

    let server_handle =
        start_server(config.rpc_server_addr, &config.allowed_origins, rpc).await?;

    // Keep the server running until Ctrl+C is pressed
    tokio::signal::ctrl_c().await?;
    server_handle.stop()?;
    info!("Server stopped");

    Ok(())
}

/// Logs the node's view of the bundler. Failures here do not stop startup.
async fn check_node<M: Middleware + 'static>(
    client: &ChainClient<M>,
    chain_id: u64,
    bundler: ethers::types::Address,
) {
    match client.chain_id().await {
        Ok(node_chain_id) if node_chain_id != chain_id.into() => warn!(
            "Node reports chain id {} but {} is configured",
            node_chain_id, chain_id
        ),
        Ok(_) => {}
        Err(e) => warn!("Could not query node chain id: {}", e),
    }

    match client.balance(bundler).await {
        Ok(balance) => info!("Bundler {:?} balance: {} wei", bundler, balance),
        Err(e) => warn!("Could not query bundler balance: {}", e),
    }
}

async fn start_server<M: Middleware + 'static>(
    server_addr: SocketAddr,
    allowed_origins: &[String],
    rpc: BundlerRpcImpl<M>,
) -> anyhow::Result<ServerHandle> {
    // CORS answers browser preflights before the REST routes are rewritten
    let middleware = ServiceBuilder::new()
        .layer(http::cors_layer(allowed_origins))
        .layer(RestRouteLayer::new(REST_ROUTES));

    let server = ServerBuilder::default()
        .set_http_middleware(middleware)
        .build(server_addr)
        .await?;

    let server_handle = server.start(rpc.into_rpc());

    Ok(server_handle)
}
