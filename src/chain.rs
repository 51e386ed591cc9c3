// src/chain.rs
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ethers::providers::{JsonRpcError, Middleware, MiddlewareError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, H256, U256};
use tracing::debug;

use crate::entry_point::decode_revert_reason;
use crate::error::ChainError;

/// JSON-RPC code geth and anvil use for reverted calls.
const EXECUTION_REVERTED_CODE: i64 = 3;

/// Read and broadcast access to the execution node. Every request is bounded by `timeout`.
pub struct ChainClient<M> {
    inner: Arc<M>,
    timeout: Duration,
}

impl<M> Clone for ChainClient<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            timeout: self.timeout,
        }
    }
}

impl<M: Middleware + 'static> ChainClient<M> {
    pub fn new(inner: Arc<M>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T, F>(&self, method: &'static str, request: F) -> Result<T, ChainError>
    where
        F: Future<Output = Result<T, M::Error>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                debug!("{} failed: {}", method, err);
                Err(classify(err))
            }
            Err(_) => Err(ChainError::Timeout(self.timeout)),
        }
    }

    pub async fn code_at(&self, address: Address) -> Result<Bytes, ChainError> {
        self.bounded("eth_getCode", self.inner.get_code(address, None))
            .await
    }

    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, ChainError> {
        self.bounded("eth_estimateGas", self.inner.estimate_gas(tx, None))
            .await
    }

    pub async fn gas_price(&self) -> Result<U256, ChainError> {
        self.bounded("eth_gasPrice", self.inner.get_gas_price()).await
    }

    pub async fn pending_nonce(&self, address: Address) -> Result<U256, ChainError> {
        self.bounded(
            "eth_getTransactionCount",
            self.inner
                .get_transaction_count(address, Some(BlockNumber::Pending.into())),
        )
        .await
    }

    pub async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        self.bounded("eth_getBalance", self.inner.get_balance(address, None))
            .await
    }

    pub async fn chain_id(&self) -> Result<U256, ChainError> {
        self.bounded("eth_chainId", self.inner.get_chainid()).await
    }

    pub async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ChainError> {
        self.bounded("eth_sendRawTransaction", async {
            self.inner
                .send_raw_transaction(raw)
                .await
                .map(|pending| pending.tx_hash())
        })
        .await
    }
}

fn classify<E: MiddlewareError + 'static>(err: E) -> ChainError {
    if let Some(reason) = err.as_error_response().and_then(revert_reason) {
        return ChainError::Reverted { reason };
    }
    ChainError::Provider(Box::new(err))
}

/// Extracts a revert reason from a node error, if the error is a revert at all.
fn revert_reason(err: &JsonRpcError) -> Option<String> {
    if err.code != EXECUTION_REVERTED_CODE && !err.message.contains("revert") {
        return None;
    }

    let data = err
        .data
        .as_ref()
        .and_then(|value| value.as_str())
        .and_then(|value| Bytes::from_str(value).ok());

    Some(match data {
        Some(data) if !data.is_empty() => decode_revert_reason(&data),
        _ => err.message.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::{MockProvider, MockResponse, Provider};
    use serde_json::json;

    fn mocked() -> (ChainClient<Provider<MockProvider>>, MockProvider) {
        let (provider, mock) = Provider::mocked();
        (
            ChainClient::new(Arc::new(provider), Duration::from_secs(5)),
            mock,
        )
    }

    #[tokio::test]
    async fn reverted_call_carries_decoded_reason() {
        let (client, mock) = mocked();
        mock.push_response(MockResponse::Error(JsonRpcError {
            code: 3,
            message: "execution reverted: AA94 gas values overflow".to_string(),
            data: Some(json!("0x08c379a00000000000000000000000000000000000000000000000000000000000000020000000000000000000000000000000000000000000000000000000000000001841413934206761732076616c756573206f766572666c6f770000000000000000")),
        }));

        let err = client
            .estimate_gas(&TypedTransaction::default())
            .await
            .unwrap_err();
        match err {
            ChainError::Reverted { reason } => assert_eq!(reason, "AA94 gas values overflow"),
            other => panic!("expected revert, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_node_errors_keep_their_source() {
        let (client, mock) = mocked();
        mock.push_response(MockResponse::Error(JsonRpcError {
            code: -32000,
            message: "insufficient funds for gas * price + value".to_string(),
            data: None,
        }));

        let err = client.gas_price().await.unwrap_err();
        assert!(matches!(err, ChainError::Provider(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn hung_request_times_out() {
        let (provider, _mock) = Provider::mocked();
        let client = ChainClient::new(Arc::new(provider), Duration::from_millis(20));

        let err = client
            .bounded("eth_blockNumber", std::future::pending::<Result<U256, _>>())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Timeout(_)));
    }

    #[tokio::test]
    async fn reads_code() -> anyhow::Result<()> {
        let (client, mock) = mocked();
        mock.push::<Bytes, _>(Bytes::from(vec![0x60, 0x80]))?;

        let code = client.code_at(Address::repeat_byte(0x11)).await?;
        assert_eq!(code.as_ref(), &[0x60, 0x80]);
        Ok(())
    }
}
