// src/estimator.rs
use ethers::abi::AbiEncode;
use ethers::providers::Middleware;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use tracing::debug;

use crate::chain::ChainClient;
use crate::codec;
use crate::entry_point::{PackedUserOperation, ValidateUserOpCall};
use crate::error::EstimationError;
use crate::types::{GasEstimate, UserOperation};

/// Calldata cost constants used to derive preVerificationGas.
// https://github.com/eth-infinitism/bundler/blob/main/packages/sdk/src/calcPreVerificationGas.ts
#[derive(Debug, Clone)]
pub struct Overhead {
    pub fixed: U256,
    pub per_user_op: U256,
    pub per_user_op_word: U256,
    pub zero_byte: U256,
    pub non_zero_byte: U256,
    pub bundle_size: U256,
    pub sig_size: usize,
}

impl Default for Overhead {
    fn default() -> Self {
        Self {
            fixed: U256::from(21000),
            per_user_op: U256::from(18300),
            per_user_op_word: U256::from(4),
            zero_byte: U256::from(4),
            non_zero_byte: U256::from(16),
            bundle_size: U256::one(),
            sig_size: 65,
        }
    }
}

impl Overhead {
    /// Gas the bundler pays for putting `op` on chain, outside of validation and execution.
    ///
    /// A signature shorter than `sig_size` (typical while estimating) is costed as a
    /// `sig_size` run of non-zero bytes.
    pub fn pre_verification_gas(&self, op: &PackedUserOperation) -> U256 {
        let mut op = op.clone();
        if op.signature.len() < self.sig_size {
            op.signature = Bytes::from(vec![0x01; self.sig_size]);
        }
        let encoded = op.encode();

        let call_data = encoded.iter().fold(U256::zero(), |acc, byte| {
            let cost = if *byte == 0 { self.zero_byte } else { self.non_zero_byte };
            acc.saturating_add(cost)
        });
        let word_cost = div_ceil(
            self.per_user_op_word
                .saturating_mul(U256::from(encoded.len() + 31)),
            U256::from(32),
        );

        div_ceil(self.fixed, self.bundle_size)
            .saturating_add(call_data)
            .saturating_add(self.per_user_op)
            .saturating_add(word_cost)
    }
}

fn div_ceil(numerator: U256, denominator: U256) -> U256 {
    let (quotient, remainder) = numerator.div_mod(denominator);
    if remainder.is_zero() {
        quotient
    } else {
        quotient + U256::one()
    }
}

#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub entry_point: Address,
    pub chain_id: u64,
    /// Paymaster filled into operations that do not name one. Zero means none.
    pub default_paymaster: Address,
    /// Percentage added on top of simulated gas.
    pub buffer_percent: u64,
    /// Validation allowance for accounts that are deployed by the operation itself.
    pub undeployed_validation_gas: U256,
    /// callGasLimit used when the sender does not exist yet.
    pub undeployed_call_gas: U256,
    pub overhead: Overhead,
}

impl EstimatorConfig {
    pub fn new(entry_point: Address, chain_id: u64) -> Self {
        Self {
            entry_point,
            chain_id,
            default_paymaster: Address::zero(),
            buffer_percent: 10,
            undeployed_validation_gas: U256::from(100_000),
            undeployed_call_gas: U256::from(100_000),
            overhead: Overhead::default(),
        }
    }
}

pub struct GasEstimator<M> {
    client: ChainClient<M>,
    config: EstimatorConfig,
}

impl<M: Middleware + 'static> GasEstimator<M> {
    pub fn new(client: ChainClient<M>, config: EstimatorConfig) -> Self {
        Self { client, config }
    }

    pub async fn estimate(&self, user_op: &UserOperation) -> Result<GasEstimate, EstimationError> {
        let op = self.pack(user_op)?;
        let pre_verification_gas = self.config.overhead.pre_verification_gas(&op);

        let code = self
            .client
            .code_at(op.sender)
            .await
            .map_err(EstimationError::Chain)?;

        let (verification_gas_limit, call_gas_limit) = if code.is_empty() {
            self.estimate_undeployed(&op).await?
        } else {
            self.estimate_deployed(&op).await?
        };

        debug!(
            "Estimated gas for {:?}: verification={} call={} preVerification={}",
            op.sender, verification_gas_limit, call_gas_limit, pre_verification_gas
        );

        Ok(GasEstimate {
            call_gas_limit: call_gas_limit.to_string(),
            verification_gas_limit: verification_gas_limit.to_string(),
            pre_verification_gas: pre_verification_gas.to_string(),
        })
    }

    fn pack(&self, user_op: &UserOperation) -> Result<PackedUserOperation, EstimationError> {
        if user_op.paymaster.trim().is_empty() && !self.config.default_paymaster.is_zero() {
            let mut user_op = user_op.clone();
            user_op.paymaster = format!("{:?}", self.config.default_paymaster);
            return Ok(codec::pack(&user_op)?);
        }
        Ok(codec::pack(user_op)?)
    }

    async fn estimate_deployed(
        &self,
        op: &PackedUserOperation,
    ) -> Result<(U256, U256), EstimationError> {
        let user_op_hash = codec::user_op_hash(op, self.config.entry_point, self.config.chain_id);
        let validate = ValidateUserOpCall {
            user_op: op.clone(),
            user_op_hash: user_op_hash.0,
            missing_account_funds: U256::zero(),
        };
        let verification = self
            .simulate("validateUserOp", op.sender, Bytes::from(validate.encode()))
            .await?;

        let call = if op.call_data.is_empty() {
            U256::zero()
        } else {
            self.simulate("callData", op.sender, op.call_data.clone())
                .await?
        };

        Ok((self.with_buffer(verification), self.with_buffer(call)))
    }

    async fn estimate_undeployed(
        &self,
        op: &PackedUserOperation,
    ) -> Result<(U256, U256), EstimationError> {
        if op.init_code.len() < Address::len_bytes() {
            return Err(EstimationError::SenderNotDeployed(op.sender));
        }
        let (factory, factory_data) = op.init_code.split_at(Address::len_bytes());
        let deployment = self
            .simulate(
                "initCode",
                Address::from_slice(factory),
                Bytes::from(factory_data.to_vec()),
            )
            .await?;

        Ok((
            self.with_buffer(deployment)
                .saturating_add(self.config.undeployed_validation_gas),
            self.config.undeployed_call_gas,
        ))
    }

    /// `eth_estimateGas` of `data` sent from the EntryPoint to `to`.
    async fn simulate(
        &self,
        target: &'static str,
        to: Address,
        data: Bytes,
    ) -> Result<U256, EstimationError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.config.entry_point)
            .to(to)
            .data(data)
            .into();
        self.client
            .estimate_gas(&tx)
            .await
            .map_err(|err| EstimationError::from_chain(target, err))
    }

    fn with_buffer(&self, gas: U256) -> U256 {
        let percent = U256::from(100) + U256::from(self.config.buffer_percent);
        gas.saturating_mul(percent) / 100
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use ethers::providers::{JsonRpcError, MockProvider, MockResponse, Provider};
    use serde_json::json;

    fn estimator() -> (GasEstimator<Provider<MockProvider>>, MockProvider) {
        let (provider, mock) = Provider::mocked();
        let client = ChainClient::new(Arc::new(provider), Duration::from_secs(5));
        let config = EstimatorConfig::new(Address::repeat_byte(0xee), 31337);
        (GasEstimator::new(client, config), mock)
    }

    fn user_op() -> UserOperation {
        UserOperation {
            sender: "0x1111111111111111111111111111111111111111".into(),
            nonce: "0x01".into(),
            call_data: "0xb61d27f6".into(),
            max_fee_per_gas: "0x3b9aca00".into(),
            max_priority_fee_per_gas: "0x3b9aca00".into(),
            ..Default::default()
        }
    }

    #[test]
    fn pre_verification_gas_counts_calldata() {
        let overhead = Overhead::default();
        let op = codec::pack(&user_op()).unwrap();
        let pvg = overhead.pre_verification_gas(&op);

        // fixed + per-op overhead is the floor
        assert!(pvg > U256::from(21000 + 18300));

        let mut bigger = op.clone();
        bigger.call_data = Bytes::from(vec![0xff; 100]);
        assert!(overhead.pre_verification_gas(&bigger) > pvg);
    }

    #[tokio::test]
    async fn deployed_sender_is_simulated() -> anyhow::Result<()> {
        let (estimator, mock) = estimator();
        // responses are served last-in first-out
        mock.push(U256::from(50_000))?; // callData
        mock.push(U256::from(40_000))?; // validateUserOp
        mock.push::<Bytes, _>(Bytes::from(vec![0x60, 0x80]))?; // eth_getCode

        let estimate = estimator.estimate(&user_op()).await?;
        assert_eq!(estimate.verification_gas_limit, "44000");
        assert_eq!(estimate.call_gas_limit, "55000");
        let op = codec::pack(&user_op())?;
        assert_eq!(
            estimate.pre_verification_gas,
            Overhead::default().pre_verification_gas(&op).to_string()
        );
        Ok(())
    }

    #[tokio::test]
    async fn undeployed_sender_simulates_factory() -> anyhow::Result<()> {
        let (estimator, mock) = estimator();
        mock.push(U256::from(200_000))?; // factory call
        mock.push::<Bytes, _>(Bytes::default())?; // eth_getCode

        let mut op = user_op();
        op.init_code = format!("0x{}{}", "33".repeat(20), "5fbfb9cf");
        let estimate = estimator.estimate(&op).await?;
        assert_eq!(estimate.verification_gas_limit, "320000");
        assert_eq!(estimate.call_gas_limit, "100000");
        Ok(())
    }

    #[tokio::test]
    async fn undeployed_sender_without_factory_fails() -> anyhow::Result<()> {
        let (estimator, mock) = estimator();
        mock.push::<Bytes, _>(Bytes::default())?;

        let err = estimator.estimate(&user_op()).await.unwrap_err();
        assert!(matches!(err, EstimationError::SenderNotDeployed(_)));
        Ok(())
    }

    #[tokio::test]
    async fn reverting_execution_is_an_error() -> anyhow::Result<()> {
        let (estimator, mock) = estimator();
        mock.push_response(MockResponse::Error(JsonRpcError {
            code: 3,
            message: "execution reverted".to_string(),
            data: Some(json!("0x08c379a0000000000000000000000000000000000000000000000000000000000000002000000000000000000000000000000000000000000000000000000000000000096e6f74206f776e65720000000000000000000000000000000000000000000000")),
        }));
        mock.push(U256::from(40_000))?;
        mock.push::<Bytes, _>(Bytes::from(vec![0x60, 0x80]))?;

        match estimator.estimate(&user_op()).await {
            Err(EstimationError::Reverted { target, reason }) => {
                assert_eq!(target, "callData");
                assert_eq!(reason, "not owner");
            }
            other => panic!("expected revert, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn reverting_validation_is_an_error() -> anyhow::Result<()> {
        let (estimator, mock) = estimator();
        mock.push_response(MockResponse::Error(JsonRpcError {
            code: 3,
            message: "execution reverted: AA23 reverted".to_string(),
            data: None,
        }));
        mock.push::<Bytes, _>(Bytes::from(vec![0x60, 0x80]))?;

        match estimator.estimate(&user_op()).await {
            Err(EstimationError::Reverted { target, reason }) => {
                assert_eq!(target, "validateUserOp");
                assert!(reason.contains("AA23"));
            }
            other => panic!("expected revert, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn huge_buffer_does_not_overflow() -> anyhow::Result<()> {
        let (provider, mock) = Provider::mocked();
        let client = ChainClient::new(Arc::new(provider), Duration::from_secs(5));
        let mut config = EstimatorConfig::new(Address::repeat_byte(0xee), 31337);
        config.buffer_percent = u64::MAX;
        let estimator = GasEstimator::new(client, config);

        mock.push(U256::from(50_000))?;
        mock.push(U256::from(40_000))?;
        mock.push::<Bytes, _>(Bytes::from(vec![0x60, 0x80]))?;

        let estimate = estimator.estimate(&user_op()).await?;
        let expected = U256::from(40_000) * (U256::from(100) + U256::from(u64::MAX)) / 100;
        assert_eq!(estimate.verification_gas_limit, expected.to_string());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_operation_never_reaches_the_node() {
        let (estimator, mock) = estimator();
        let mut op = user_op();
        op.call_data = "0x123".into();

        let err = estimator.estimate(&op).await.unwrap_err();
        assert!(matches!(err, EstimationError::Codec(_)));
        assert!(mock.assert_request("eth_getCode", ()).is_err());
    }

    #[tokio::test]
    async fn default_paymaster_is_packed() -> anyhow::Result<()> {
        let (provider, _mock) = Provider::mocked();
        let client = ChainClient::new(Arc::new(provider), Duration::from_secs(5));
        let mut config = EstimatorConfig::new(Address::repeat_byte(0xee), 31337);
        config.default_paymaster = Address::repeat_byte(0x22);
        let estimator = GasEstimator::new(client, config);

        let packed = estimator.pack(&user_op())?;
        let fields = codec::unpack_paymaster_and_data(&packed.paymaster_and_data).unwrap();
        assert_eq!(fields.paymaster, Address::repeat_byte(0x22));
        Ok(())
    }
}
