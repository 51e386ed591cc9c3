// src/submitter.rs
use ethers::abi::AbiEncode;
use ethers::providers::Middleware;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::chain::ChainClient;
use crate::codec;
use crate::entry_point::{HandleOpsCall, PackedUserOperation};
use crate::error::{ChainError, ConfigError, SubmissionError};

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    /// Hex-encoded secp256k1 scalar, with or without `0x`.
    pub private_key: String,
    /// Decimal chain id, parsed for every submission.
    pub chain_id: String,
    pub entry_point: Address,
}

/// Signs and broadcasts `handleOps` transactions carrying one packed operation.
pub struct Submitter<M> {
    wallet: LocalWallet,
    client: ChainClient<M>,
    pub bundler_address: Address,
    entry_point: Address,
    chain_id: String,
    // held across nonce lookup, signing and broadcast
    nonce_lock: Mutex<()>,
}

impl<M: Middleware + 'static> Submitter<M> {
    pub fn new(client: ChainClient<M>, config: SubmitterConfig) -> Result<Self, ConfigError> {
        let wallet = config
            .private_key
            .trim()
            .parse::<LocalWallet>()
            .map_err(ConfigError::BundlerKey)?;
        let bundler_address = wallet.address();

        info!("Initialized bundler with address: {:?}", bundler_address);

        Ok(Self {
            wallet,
            client,
            bundler_address,
            entry_point: config.entry_point,
            chain_id: config.chain_id,
            nonce_lock: Mutex::new(()),
        })
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub async fn submit(&self, op: PackedUserOperation) -> Result<H256, SubmissionError> {
        // 1. Resolve the chain-scoped signer before touching the network
        let chain_id = self.chain_id()?;
        let wallet = self.wallet.clone().with_chain_id(chain_id);

        let (verification_gas_limit, call_gas_limit) =
            codec::unpack_u128_pair(&op.account_gas_limits);
        debug!(
            "Packing operation from {:?}: verificationGasLimit={} callGasLimit={}",
            op.sender, verification_gas_limit, call_gas_limit
        );
        if let Some(paymaster) = codec::unpack_paymaster_and_data(&op.paymaster_and_data) {
            debug!(
                "Operation from {:?} sponsored by paymaster {:?} (verification={} postOp={}, {} data bytes)",
                op.sender,
                paymaster.paymaster,
                paymaster.verification_gas_limit,
                paymaster.post_op_gas_limit,
                paymaster.data.len()
            );
        }
        let sender = op.sender;
        let calldata = self.handle_ops_calldata(op);

        // 2. Nonce, pricing, signing and broadcast happen under one lock
        let _guard = self.nonce_lock.lock().await;

        let nonce = self
            .client
            .pending_nonce(self.bundler_address)
            .await
            .map_err(SubmissionError::Broadcast)?;
        let gas_price = self
            .client
            .gas_price()
            .await
            .map_err(SubmissionError::Broadcast)?;

        let mut tx = self.build_transaction(calldata, nonce, gas_price, chain_id);
        let gas = self.client.estimate_gas(&tx).await.map_err(|err| match err {
            ChainError::Reverted { .. } => SubmissionError::Rejected(err),
            other => SubmissionError::Broadcast(other),
        })?;
        tx.set_gas(gas);

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(SubmissionError::Signing)?;
        let raw = tx.rlp_signed(&signature);

        let tx_hash = self
            .client
            .send_raw_transaction(raw)
            .await
            .map_err(SubmissionError::Broadcast)?;

        info!(
            "Submitted handleOps for {:?} with nonce {}: {:?}",
            sender, nonce, tx_hash
        );
        Ok(tx_hash)
    }

    fn chain_id(&self) -> Result<u64, SubmissionError> {
        self.chain_id
            .trim()
            .parse::<u64>()
            .map_err(|source| SubmissionError::ChainId {
                value: self.chain_id.clone(),
                source,
            })
    }

    /// `handleOps([op], bundler)`: unused gas is refunded to the bundler itself.
    fn handle_ops_calldata(&self, op: PackedUserOperation) -> Bytes {
        let call = HandleOpsCall {
            ops: vec![op],
            beneficiary: self.bundler_address,
        };
        Bytes::from(call.encode())
    }

    fn build_transaction(
        &self,
        calldata: Bytes,
        nonce: U256,
        gas_price: U256,
        chain_id: u64,
    ) -> TypedTransaction {
        TransactionRequest::new()
            .from(self.bundler_address)
            .to(self.entry_point)
            .data(calldata)
            .nonce(nonce)
            .gas_price(gas_price)
            .chain_id(chain_id)
            .into()
    }
}
