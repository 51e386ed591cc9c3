// src/types.rs
use ethers::types::H256;
use serde::{Deserialize, Serialize};

/// Client-facing UserOperation. Every value is a hex string; absent keys are empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserOperation {
    pub sender: String,
    pub nonce: String,
    pub init_code: String,
    pub call_data: String,
    pub call_gas_limit: String,
    pub verification_gas_limit: String,
    pub pre_verification_gas: String,
    pub max_fee_per_gas: String,
    pub max_priority_fee_per_gas: String,
    pub paymaster: String,
    pub paymaster_verification_gas_limit: String,
    pub paymaster_post_op_gas_limit: String,
    pub paymaster_data: String,
    pub signature: String,
}

/// Submit-path request body: an already packed operation, hex encoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackedUserOperationJson {
    pub sender: String,
    pub nonce: String,
    pub init_code: String,
    pub call_data: String,
    pub account_gas_limits: String,
    pub gas_fees: String,
    pub pre_verification_gas: String,
    pub paymaster_and_data: String,
    pub signature: String,
}

/// Gas amounts as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    pub call_gas_limit: String,
    pub verification_gas_limit: String,
    pub pre_verification_gas: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResult {
    pub tx_hash: H256,
}
