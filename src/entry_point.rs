// src/entry_point.rs
use ethers::abi::AbiDecode;
use ethers::contract::{abigen, EthError};

abigen!(
    EntryPoint,
    r#"[
        struct PackedUserOperation {address sender;uint256 nonce;bytes initCode;bytes callData;bytes32 accountGasLimits;uint256 preVerificationGas;bytes32 gasFees;bytes paymasterAndData;bytes signature;}
        function handleOps(PackedUserOperation[] calldata ops,address payable beneficiary) external
        function validateUserOp(PackedUserOperation calldata userOp,bytes32 userOpHash,uint256 missingAccountFunds) external returns (uint256 validationData)
        error FailedOp(uint256 opIndex, string reason)
        error FailedOpWithRevert(uint256 opIndex, string reason, bytes inner)
    ]"#
);

/// Selector of Solidity's `Error(string)`.
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Turns raw revert data into a readable reason.
///
/// EntryPoint `FailedOp` errors and `require`/`revert` strings are decoded;
/// anything else is reported as hex.
pub fn decode_revert_reason(data: &[u8]) -> String {
    if let Some(failed) = FailedOp::decode_with_selector(data) {
        return failed.reason;
    }

    if let Some(failed) = FailedOpWithRevert::decode_with_selector(data) {
        return format!("{} ({})", failed.reason, decode_revert_reason(&failed.inner));
    }

    if data.len() >= 4 && data[..4] == ERROR_STRING_SELECTOR {
        if let Ok(reason) = <String as AbiDecode>::decode(&data[4..]) {
            return reason;
        }
    }

    if data.is_empty() {
        "no revert data".to_string()
    } else {
        format!("0x{}", hex::encode(data))
    }
}
