// src/config.rs
use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use ethers::types::Address;

use crate::error::ConfigError;

pub const MAX_GAS_BUFFER_PERCENT: u64 = 1000;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Single-operation ERC-4337 bundler relay", long_about = None)]
pub struct Args {
    #[clap(long, env = "RPC_SERVER_ADDR", default_value = "127.0.0.1:7930")]
    pub rpc_server_addr: String,

    #[clap(long, env = "CHAIN_RPC", default_value = "http://localhost:8545")]
    pub eth_rpc_url: String,

    #[clap(
        long,
        env = "ENTRYPOINT_ADDRESS",
        default_value = "0x0000000071727De22E5E9d8BAf0edAc6f37da032"
    )]
    pub entry_point: String,

    #[clap(
        long,
        env = "PAYMASTER_ADDRESS",
        default_value = "0x0000000000000000000000000000000000000000"
    )]
    pub paymaster: String,

    #[clap(long, env = "BUNDLER_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: String,

    #[clap(long, env = "CHAIN_ID", default_value = "31337")]
    pub chain_id: String,

    #[clap(long, env = "RPC_TIMEOUT_SECS", default_value_t = 30)]
    pub rpc_timeout_secs: u64,

    #[clap(long, env = "GAS_BUFFER_PERCENT", default_value_t = 10)]
    pub gas_buffer_percent: u64,

    /// Comma-separated CORS origins; `*` allows any.
    #[clap(long, env = "ALLOWED_ORIGIN", value_delimiter = ',', default_value = "*")]
    pub allowed_origins: Vec<String>,
}

/// Startup configuration after validation. The bundler key stays a string until the
/// submitter parses it.
#[derive(Debug, Clone)]
pub struct BundlerConfig {
    pub rpc_server_addr: SocketAddr,
    pub eth_rpc_url: String,
    pub entry_point: Address,
    pub paymaster: Address,
    pub private_key: String,
    pub chain_id: String,
    pub rpc_timeout: Duration,
    pub gas_buffer_percent: u64,
    pub allowed_origins: Vec<String>,
}

impl BundlerConfig {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let rpc_server_addr =
            args.rpc_server_addr
                .parse()
                .map_err(|source| ConfigError::ListenAddr {
                    value: args.rpc_server_addr.clone(),
                    source,
                })?;
        if args.rpc_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if args.gas_buffer_percent > MAX_GAS_BUFFER_PERCENT {
            return Err(ConfigError::GasBuffer {
                value: args.gas_buffer_percent,
                max: MAX_GAS_BUFFER_PERCENT,
            });
        }
        let config = Self {
            rpc_server_addr,
            eth_rpc_url: args.eth_rpc_url,
            entry_point: parse_address("EntryPoint", &args.entry_point)?,
            paymaster: parse_address("paymaster", &args.paymaster)?,
            private_key: args.private_key,
            chain_id: args.chain_id,
            rpc_timeout: Duration::from_secs(args.rpc_timeout_secs),
            gas_buffer_percent: args.gas_buffer_percent,
            allowed_origins: args.allowed_origins,
        };
        config.chain_id()?;
        Ok(config)
    }

    pub fn chain_id(&self) -> Result<u64, ConfigError> {
        self.chain_id
            .trim()
            .parse()
            .map_err(|source| ConfigError::ChainId {
                value: self.chain_id.clone(),
                source,
            })
    }
}

fn parse_address(name: &'static str, value: &str) -> Result<Address, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Address {
        name,
        value: value.to_string(),
    })
}
