// src/error.rs
use std::num::ParseIntError;
use std::time::Duration;

use ethers::signers::WalletError;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid hex in field `{field}`: {source}")]
    Decode {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    #[error("field `{field}` does not fit in {width} bytes")]
    Overflow { field: &'static str, width: usize },

    #[error("field `{field}` has length {actual}, expected {expected}")]
    Length {
        field: &'static str,
        expected: &'static str,
        actual: usize,
    },
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("execution reverted: {reason}")]
    Reverted { reason: String },

    #[error("JSON-RPC request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Ethereum provider error: {0}")]
    Provider(#[source] BoxError),
}

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("simulation of {target} reverted: {reason}")]
    Reverted { target: &'static str, reason: String },

    #[error("sender {0:?} is not deployed and initCode has no factory")]
    SenderNotDeployed(ethers::types::Address),

    #[error("gas estimation failed: {0}")]
    Chain(#[source] ChainError),
}

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid chain id {value:?}: {source}")]
    ChainId {
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error("failed to sign handleOps transaction: {0}")]
    Signing(#[source] WalletError),

    #[error("node rejected handleOps transaction: {0}")]
    Rejected(#[source] ChainError),

    #[error("failed to broadcast handleOps transaction: {0}")]
    Broadcast(#[source] ChainError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid bundler private key: {0}")]
    BundlerKey(#[source] WalletError),

    #[error("invalid chain id {value:?}: {source}")]
    ChainId {
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error("invalid {name} address {value:?}")]
    Address { name: &'static str, value: String },

    #[error("invalid Ethereum RPC URL {value:?}: {source}")]
    RpcUrl {
        value: String,
        #[source]
        source: BoxError,
    },

    #[error("invalid RPC server address {value:?}: {source}")]
    ListenAddr {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("gas buffer of {value}% exceeds the {max}% limit")]
    GasBuffer { value: u64, max: u64 },

    #[error("RPC timeout must be at least one second")]
    ZeroTimeout,
}

impl EstimationError {
    pub(crate) fn from_chain(target: &'static str, err: ChainError) -> Self {
        match err {
            ChainError::Reverted { reason } => EstimationError::Reverted { target, reason },
            other => EstimationError::Chain(other),
        }
    }
}
