use crate::types::UserOperation;
use anyhow::anyhow;
use ethers::abi::{decode, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};

/// Selector of `Error(string)`.
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
/// Selector of `Panic(uint256)`.
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

pub fn user_op_to_json(op: &UserOperation) -> serde_json::Value {
    serde_json::json!({
        "sender": fmt_address(op.sender),
        "nonce": fmt_u256(op.nonce),
        "initCode": fmt_bytes(&op.init_code),
        "callData": fmt_bytes(&op.call_data),
        "callGasLimit": fmt_u256(op.call_gas_limit),
        "verificationGasLimit": fmt_u256(op.verification_gas_limit),
        "preVerificationGas": fmt_u256(op.pre_verification_gas),
        "maxFeePerGas": fmt_u256(op.max_fee_per_gas),
        "maxPriorityFeePerGas": fmt_u256(op.max_priority_fee_per_gas),
        "paymasterAndData": fmt_bytes(&op.paymaster_and_data),
        "signature": fmt_bytes(&op.signature),
    })
}

pub fn parse_u256_quantity(s: &str) -> anyhow::Result<U256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::zero());
    }
    Ok(U256::from_str_radix(s, 16)?)
}

pub fn parse_h256(s: &str) -> anyhow::Result<H256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        anyhow::bail!("expected 32-byte hex, got {} bytes", bytes.len());
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(H256(arr))
}

pub fn parse_bytes(s: &str) -> anyhow::Result<Bytes> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| anyhow!("invalid hex: {e}"))?;
    Ok(Bytes::from(bytes))
}

/// Decodes solidity revert data into something a human can read.
///
/// `Error(string)` yields the string, `Panic(uint256)` the panic code. Custom
/// errors are returned as their raw hex since we do not know the ABI.
pub fn decode_revert_data(data: &[u8]) -> Option<String> {
    if data.len() < 4 {
        return None;
    }
    let (selector, args) = data.split_at(4);
    if selector == ERROR_STRING_SELECTOR {
        if let Ok(mut tokens) = decode(&[ParamType::String], args) {
            if let Some(Token::String(s)) = tokens.pop() {
                return Some(s);
            }
        }
        return None;
    }
    if selector == PANIC_SELECTOR {
        if let Ok(mut tokens) = decode(&[ParamType::Uint(256)], args) {
            if let Some(Token::Uint(code)) = tokens.pop() {
                return Some(format!("panic 0x{:x}", code));
            }
        }
        return None;
    }
    Some(format!("0x{}", hex::encode(data)))
}

/// Decodes a revert reason from a hex string (as carried in JSON-RPC error
/// `data` or in a receipt's `reason`). Plain text is passed through.
pub fn decode_revert_hex(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed == "0x" {
        return None;
    }
    match trimmed
        .strip_prefix("0x")
        .and_then(|h| hex::decode(h).ok())
    {
        Some(bytes) => decode_revert_data(&bytes),
        None => Some(trimmed.to_string()),
    }
}

/// Pulls the reason out of messages shaped like `execution reverted: Foo`.
pub fn reason_from_message(message: &str) -> Option<String> {
    let lower = message.to_ascii_lowercase();
    for marker in ["reverted:", "revert:", "reverted with reason:"] {
        if let Some(pos) = lower.find(marker) {
            let reason = message[pos + marker.len()..].trim();
            if !reason.is_empty() {
                return Some(reason.trim_matches('"').to_string());
            }
        }
    }
    None
}
