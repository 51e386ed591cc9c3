// src/rpc.rs
use std::sync::Arc;

use ethers::providers::Middleware;
use ethers::types::{Address, U64};
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::error::{ErrorObjectOwned, INVALID_PARAMS_CODE};
use tracing::{debug, error, info};

use crate::codec;
use crate::error::{EstimationError, SubmissionError};
use crate::estimator::GasEstimator;
use crate::submitter::Submitter;
use crate::types::{GasEstimate, PackedUserOperationJson, SubmissionResult, UserOperation};

pub const ESTIMATION_ERROR_CODE: i32 = -32000;
pub const SUBMISSION_ERROR_CODE: i32 = -32001;

#[rpc(server, namespace = "bundler")]
pub trait BundlerRpc {
    /// Estimates callGasLimit, verificationGasLimit and preVerificationGas for an operation.
    #[method(name = "estimateGas")]
    async fn estimate_gas(&self, user_op: UserOperation) -> RpcResult<GasEstimate>;

    /// Wraps a packed operation in `handleOps` and broadcasts it.
    #[method(name = "sendTransaction")]
    async fn send_transaction(
        &self,
        user_op: PackedUserOperationJson,
    ) -> RpcResult<SubmissionResult>;

    #[method(name = "chainId")]
    async fn chain_id(&self) -> RpcResult<U64>;

    #[method(name = "supportedEntryPoints")]
    async fn supported_entry_points(&self) -> RpcResult<Vec<Address>>;
}

pub struct BundlerRpcImpl<M> {
    estimator: Arc<GasEstimator<M>>,
    submitter: Arc<Submitter<M>>,
    chain_id: u64,
}

impl<M> BundlerRpcImpl<M> {
    pub fn new(
        estimator: Arc<GasEstimator<M>>,
        submitter: Arc<Submitter<M>>,
        chain_id: u64,
    ) -> Self {
        Self {
            estimator,
            submitter,
            chain_id,
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> BundlerRpcServer for BundlerRpcImpl<M> {
    async fn estimate_gas(&self, user_op: UserOperation) -> RpcResult<GasEstimate> {
        debug!("Received gas estimation request for sender: {}", user_op.sender);

        self.estimator.estimate(&user_op).await.map_err(|e| {
            error!("Failed to estimate gas: {}", e);
            ErrorObjectOwned::from(e)
        })
    }

    async fn send_transaction(
        &self,
        user_op: PackedUserOperationJson,
    ) -> RpcResult<SubmissionResult> {
        debug!("Received send request for sender: {}", user_op.sender);

        let op = codec::decode_packed(&user_op)
            .map_err(SubmissionError::from)
            .map_err(ErrorObjectOwned::from)?;

        match self.submitter.submit(op).await {
            Ok(tx_hash) => {
                info!("Successfully submitted operation for {}", user_op.sender);
                Ok(SubmissionResult { tx_hash })
            }
            Err(e) => {
                error!("Failed to submit operation: {}", e);
                Err(e.into())
            }
        }
    }

    async fn chain_id(&self) -> RpcResult<U64> {
        Ok(U64::from(self.chain_id))
    }

    async fn supported_entry_points(&self) -> RpcResult<Vec<Address>> {
        Ok(vec![self.submitter.entry_point()])
    }
}

impl From<EstimationError> for ErrorObjectOwned {
    fn from(err: EstimationError) -> Self {
        let code = match err {
            EstimationError::Codec(_) => INVALID_PARAMS_CODE,
            _ => ESTIMATION_ERROR_CODE,
        };
        ErrorObjectOwned::owned(code, format!("Gas estimation error: {}", err), None::<()>)
    }
}

impl From<SubmissionError> for ErrorObjectOwned {
    fn from(err: SubmissionError) -> Self {
        let code = match err {
            SubmissionError::Codec(_) => INVALID_PARAMS_CODE,
            _ => SUBMISSION_ERROR_CODE,
        };
        ErrorObjectOwned::owned(code, format!("Submission error: {}", err), None::<()>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;

    #[test]
    fn codec_failures_are_invalid_params() {
        let err = EstimationError::Codec(CodecError::Overflow {
            field: "callGasLimit",
            width: 16,
        });
        let object = ErrorObjectOwned::from(err);
        assert_eq!(object.code(), INVALID_PARAMS_CODE);
        assert!(object.message().contains("callGasLimit"));
    }

    #[test]
    fn simulation_failures_are_server_errors() {
        let err = EstimationError::Reverted {
            target: "callData",
            reason: "not owner".to_string(),
        };
        let object = ErrorObjectOwned::from(err);
        assert_eq!(object.code(), ESTIMATION_ERROR_CODE);
        assert!(object.message().contains("not owner"));
    }

    #[test]
    fn invalid_chain_id_is_a_submission_error() {
        let source = "x".parse::<u64>().unwrap_err();
        let object = ErrorObjectOwned::from(SubmissionError::ChainId {
            value: "x".to_string(),
            source,
        });
        assert_eq!(object.code(), SUBMISSION_ERROR_CODE);
    }
}
