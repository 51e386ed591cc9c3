// src/codec.rs
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

use crate::entry_point::PackedUserOperation;
use crate::error::CodecError;
use crate::types::{PackedUserOperationJson, UserOperation};

/// Width of each half of `accountGasLimits` / `gasFees`, and of the paymaster gas limits.
const HALF_WORD: usize = 16;
const ADDRESS_LEN: usize = 20;
const WORD_LEN: usize = 32;
/// paymaster address + verification gas limit + post-op gas limit
pub const PAYMASTER_FIELDS_LEN: usize = ADDRESS_LEN + 2 * HALF_WORD;

/// Paymaster portion of a packed operation, split back into its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymasterFields {
    pub paymaster: Address,
    pub verification_gas_limit: U256,
    pub post_op_gas_limit: U256,
    pub data: Bytes,
}

fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

/// Parses a hex DATA string. The nibble count must be even.
pub fn parse_bytes(field: &'static str, value: &str) -> Result<Bytes, CodecError> {
    hex::decode(strip_hex_prefix(value.trim()))
        .map(Bytes::from)
        .map_err(|source| CodecError::Decode { field, source })
}

/// Parses a hex QUANTITY string into a uint256. Odd nibble counts are accepted
/// and an empty string is zero.
pub fn parse_quantity(field: &'static str, value: &str) -> Result<U256, CodecError> {
    let digits = strip_hex_prefix(value.trim());
    let padded;
    let digits = if digits.len() % 2 == 1 {
        padded = format!("0{digits}");
        padded.as_str()
    } else {
        digits
    };

    let raw = hex::decode(digits).map_err(|source| CodecError::Decode { field, source })?;
    let significant = strip_leading_zeros(&raw);
    if significant.len() > WORD_LEN {
        return Err(CodecError::Overflow { field, width: WORD_LEN });
    }
    Ok(U256::from_big_endian(significant))
}

/// Parses an address given as hex. Shorter values are left-padded; an empty
/// string is the zero address.
pub fn parse_address(field: &'static str, value: &str) -> Result<Address, CodecError> {
    let raw = parse_bytes(field, value)?;
    let significant = strip_leading_zeros(&raw);
    if significant.len() > ADDRESS_LEN {
        return Err(CodecError::Overflow { field, width: ADDRESS_LEN });
    }
    let mut address = [0u8; ADDRESS_LEN];
    address[ADDRESS_LEN - significant.len()..].copy_from_slice(significant);
    Ok(Address::from(address))
}

fn strip_leading_zeros(raw: &[u8]) -> &[u8] {
    let first = raw.iter().position(|b| *b != 0).unwrap_or(raw.len());
    &raw[first..]
}

/// Big-endian 16-byte encoding of `value`, rejecting anything at or above 2^128.
fn to_half_word(field: &'static str, value: U256) -> Result<[u8; HALF_WORD], CodecError> {
    if value.bits() > HALF_WORD * 8 {
        return Err(CodecError::Overflow { field, width: HALF_WORD });
    }
    let mut word = [0u8; WORD_LEN];
    value.to_big_endian(&mut word);
    let mut half = [0u8; HALF_WORD];
    half.copy_from_slice(&word[HALF_WORD..]);
    Ok(half)
}

/// Packs two 128-bit values into one 32-byte word, `high` first.
pub fn pack_u128_pair(
    high: (&'static str, U256),
    low: (&'static str, U256),
) -> Result<[u8; WORD_LEN], CodecError> {
    let mut word = [0u8; WORD_LEN];
    word[..HALF_WORD].copy_from_slice(&to_half_word(high.0, high.1)?);
    word[HALF_WORD..].copy_from_slice(&to_half_word(low.0, low.1)?);
    Ok(word)
}

/// Splits a packed word back into its `(high, low)` halves.
pub fn unpack_u128_pair(word: &[u8; WORD_LEN]) -> (U256, U256) {
    (
        U256::from_big_endian(&word[..HALF_WORD]),
        U256::from_big_endian(&word[HALF_WORD..]),
    )
}

fn quantity_to_word(field: &'static str, value: &str) -> Result<[u8; WORD_LEN], CodecError> {
    let mut word = [0u8; WORD_LEN];
    parse_quantity(field, value)?.to_big_endian(&mut word);
    Ok(word)
}

fn pack_paymaster_and_data(user_op: &UserOperation) -> Result<Bytes, CodecError> {
    let paymaster = parse_address("paymaster", &user_op.paymaster)?;
    if paymaster.is_zero() {
        return Ok(Bytes::default());
    }

    let verification_gas_limit = parse_quantity(
        "paymasterVerificationGasLimit",
        &user_op.paymaster_verification_gas_limit,
    )?;
    let post_op_gas_limit =
        parse_quantity("paymasterPostOpGasLimit", &user_op.paymaster_post_op_gas_limit)?;
    let data = parse_bytes("paymasterData", &user_op.paymaster_data)?;

    let mut packed = Vec::with_capacity(PAYMASTER_FIELDS_LEN + data.len());
    packed.extend_from_slice(paymaster.as_bytes());
    packed.extend_from_slice(&to_half_word(
        "paymasterVerificationGasLimit",
        verification_gas_limit,
    )?);
    packed.extend_from_slice(&to_half_word("paymasterPostOpGasLimit", post_op_gas_limit)?);
    packed.extend_from_slice(&data);
    Ok(Bytes::from(packed))
}

/// Splits `paymasterAndData` into its fields. Returns `None` when there is no paymaster.
pub fn unpack_paymaster_and_data(paymaster_and_data: &[u8]) -> Option<PaymasterFields> {
    if paymaster_and_data.len() < PAYMASTER_FIELDS_LEN {
        return None;
    }
    let (head, data) = paymaster_and_data.split_at(PAYMASTER_FIELDS_LEN);
    Some(PaymasterFields {
        paymaster: Address::from_slice(&head[..ADDRESS_LEN]),
        verification_gas_limit: U256::from_big_endian(&head[ADDRESS_LEN..ADDRESS_LEN + HALF_WORD]),
        post_op_gas_limit: U256::from_big_endian(&head[ADDRESS_LEN + HALF_WORD..]),
        data: Bytes::from(data.to_vec()),
    })
}

/// Encodes a client UserOperation into the EntryPoint's packed layout.
pub fn pack(user_op: &UserOperation) -> Result<PackedUserOperation, CodecError> {
    let account_gas_limits = pack_u128_pair(
        (
            "verificationGasLimit",
            parse_quantity("verificationGasLimit", &user_op.verification_gas_limit)?,
        ),
        (
            "callGasLimit",
            parse_quantity("callGasLimit", &user_op.call_gas_limit)?,
        ),
    )?;
    let gas_fees = pack_u128_pair(
        (
            "maxPriorityFeePerGas",
            parse_quantity("maxPriorityFeePerGas", &user_op.max_priority_fee_per_gas)?,
        ),
        (
            "maxFeePerGas",
            parse_quantity("maxFeePerGas", &user_op.max_fee_per_gas)?,
        ),
    )?;

    Ok(PackedUserOperation {
        sender: parse_address("sender", &user_op.sender)?,
        nonce: parse_quantity("nonce", &user_op.nonce)?,
        init_code: parse_bytes("initCode", &user_op.init_code)?,
        call_data: parse_bytes("callData", &user_op.call_data)?,
        account_gas_limits,
        pre_verification_gas: parse_quantity("preVerificationGas", &user_op.pre_verification_gas)?,
        gas_fees,
        paymaster_and_data: pack_paymaster_and_data(user_op)?,
        signature: parse_bytes("signature", &user_op.signature)?,
    })
}

/// Decodes a submit-path body whose gas words are already packed.
pub fn decode_packed(json: &PackedUserOperationJson) -> Result<PackedUserOperation, CodecError> {
    let paymaster_and_data = parse_bytes("paymasterAndData", &json.paymaster_and_data)?;
    if !paymaster_and_data.is_empty() && paymaster_and_data.len() < PAYMASTER_FIELDS_LEN {
        return Err(CodecError::Length {
            field: "paymasterAndData",
            expected: "empty or at least 52 bytes",
            actual: paymaster_and_data.len(),
        });
    }

    Ok(PackedUserOperation {
        sender: parse_address("sender", &json.sender)?,
        nonce: parse_quantity("nonce", &json.nonce)?,
        init_code: parse_bytes("initCode", &json.init_code)?,
        call_data: parse_bytes("callData", &json.call_data)?,
        account_gas_limits: quantity_to_word("accountGasLimits", &json.account_gas_limits)?,
        pre_verification_gas: parse_quantity("preVerificationGas", &json.pre_verification_gas)?,
        gas_fees: quantity_to_word("gasFees", &json.gas_fees)?,
        paymaster_and_data,
        signature: parse_bytes("signature", &json.signature)?,
    })
}

/// EntryPoint v0.7 `getUserOpHash`, computed locally.
pub fn user_op_hash(op: &PackedUserOperation, entry_point: Address, chain_id: u64) -> H256 {
    let fields = encode(&[
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::FixedBytes(keccak256(&op.init_code).to_vec()),
        Token::FixedBytes(keccak256(&op.call_data).to_vec()),
        Token::FixedBytes(op.account_gas_limits.to_vec()),
        Token::Uint(op.pre_verification_gas),
        Token::FixedBytes(op.gas_fees.to_vec()),
        Token::FixedBytes(keccak256(&op.paymaster_and_data).to_vec()),
    ]);
    let outer = encode(&[
        Token::FixedBytes(keccak256(fields).to_vec()),
        Token::Address(entry_point),
        Token::Uint(U256::from(chain_id)),
    ]);
    H256::from(keccak256(outer))
}
