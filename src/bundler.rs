use crate::encoding::{self, decode_revert_hex, parse_h256, reason_from_message};
use crate::error::{BundlerRejection, ExecError};
use crate::rpc::{JsonRpcClient, RpcError};
use crate::types::{GasFields, OperationHandle, Receipt, UserOperation};
use async_trait::async_trait;
use ethers::types::{Address, Log, H256, U256, U64};
use serde::Deserialize;
use serde_json::Value;

/// The bundler's ERC-4337 JSON-RPC surface.
///
/// Implementations are pure request/response: they classify failures into
/// [`ExecError`] but never retry on their own.
#[async_trait]
pub trait BundlerApi: Send + Sync {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasFields, ExecError>;

    async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<H256, ExecError>;

    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<Receipt>, ExecError>;

    async fn get_user_operation_by_hash(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationByHash>, ExecError>;

    /// Submits a signed operation and returns the correlation handle.
    async fn submit(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<OperationHandle, ExecError> {
        let user_op_hash = self.send_user_operation(op, entry_point).await?;
        Ok(OperationHandle::new(user_op_hash, op.sender, op.nonce))
    }

    /// A single non-blocking receipt poll.
    async fn get_receipt(&self, handle: &OperationHandle) -> Result<Option<Receipt>, ExecError> {
        self.get_user_operation_receipt(handle.user_op_hash).await
    }
}

/// Result of `eth_getUserOperationByHash`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationByHash {
    pub user_operation: UserOperation,
    pub entry_point: Address,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub transaction_hash: Option<H256>,
}

#[derive(Debug)]
pub struct BundlerClient {
    rpc: JsonRpcClient,
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            rpc: JsonRpcClient::new(url),
        }
    }
}

#[async_trait]
impl BundlerApi for BundlerClient {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasFields, ExecError> {
        let params = serde_json::json!([
            encoding::user_op_to_json(op),
            encoding::fmt_address(entry_point)
        ]);
        let res = self
            .rpc
            .request("eth_estimateUserOperationGas", params)
            .await
            .map_err(classify_estimate_error)?;

        Ok(GasFields {
            call_gas_limit: parse_u256_field(&res, "callGasLimit")?,
            verification_gas_limit: parse_u256_field(&res, "verificationGasLimit")?,
            pre_verification_gas: parse_u256_field(&res, "preVerificationGas")?,
        })
    }

    async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<H256, ExecError> {
        let params = serde_json::json!([
            encoding::user_op_to_json(op),
            encoding::fmt_address(entry_point)
        ]);
        let res = self
            .rpc
            .request("eth_sendUserOperation", params)
            .await
            .map_err(classify_send_error)?;
        parse_userop_hash(&res)
            .map_err(|e| ExecError::TransientNetwork(format!("eth_sendUserOperation: {e}")))
    }

    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<Receipt>, ExecError> {
        let params = serde_json::json!([encoding::fmt_h256(user_op_hash)]);
        let res = self
            .rpc
            .request("eth_getUserOperationReceipt", params)
            .await
            .map_err(classify_lookup_error)?;
        if res.is_null() {
            return Ok(None);
        }
        parse_receipt(user_op_hash, res).map(Some)
    }

    async fn get_user_operation_by_hash(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationByHash>, ExecError> {
        let params = serde_json::json!([encoding::fmt_h256(user_op_hash)]);
        let res = self
            .rpc
            .request("eth_getUserOperationByHash", params)
            .await
            .map_err(classify_lookup_error)?;
        if res.is_null() {
            return Ok(None);
        }
        serde_json::from_value(res)
            .map(Some)
            .map_err(|e| ExecError::TransientNetwork(format!("malformed user operation: {e}")))
    }
}

fn parse_u256_field(v: &Value, key: &str) -> Result<U256, ExecError> {
    let s = v
        .get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| ExecError::TransientNetwork(format!("missing or invalid field {key}")))?;
    encoding::parse_u256_quantity(s)
        .map_err(|e| ExecError::TransientNetwork(format!("invalid {key}: {e}")))
}

fn parse_userop_hash(res: &Value) -> anyhow::Result<H256> {
    // Most bundlers return the userOpHash directly as a JSON string.
    // Alchemy's docs (and sometimes responses) wrap it in an object: { "result": "0x..." }.
    // Accept both shapes for maximum compatibility.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        anyhow::bail!(
            "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {}",
            res
        );
    };

    parse_h256(hash_str)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    success: bool,
    #[serde(default)]
    actual_gas_used: U256,
    #[serde(default)]
    actual_gas_cost: U256,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    logs: Vec<Log>,
    #[serde(default)]
    receipt: Option<RawTxReceipt>,
    #[serde(default)]
    transaction_hash: Option<H256>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTxReceipt {
    transaction_hash: H256,
}

fn parse_receipt(user_op_hash: H256, res: Value) -> Result<Receipt, ExecError> {
    let raw: RawReceipt = serde_json::from_value(res)
        .map_err(|e| ExecError::TransientNetwork(format!("malformed receipt: {e}")))?;

    let transaction_hash = raw
        .receipt
        .map(|r| r.transaction_hash)
        .or(raw.transaction_hash)
        .ok_or_else(|| ExecError::TransientNetwork("receipt without transaction hash".into()))?;

    let revert_reason = if raw.success {
        None
    } else {
        raw.reason.as_deref().and_then(decode_revert_hex)
    };

    Ok(Receipt {
        user_op_hash,
        transaction_hash,
        success: raw.success,
        actual_gas_used: raw.actual_gas_used,
        actual_gas_cost: raw.actual_gas_cost,
        logs: raw.logs,
        revert_reason,
    })
}

/// Finds an EntryPoint error tag such as `AA25` in a bundler message.
fn aa_code(message: &str) -> Option<&str> {
    let bytes = message.as_bytes();
    (0..bytes.len().saturating_sub(3)).find_map(|i| {
        let w = &bytes[i..i + 4];
        (w[0] == b'A' && w[1] == b'A' && w[2].is_ascii_digit() && w[3].is_ascii_digit())
            .then(|| &message[i..i + 4])
    })
}

/// Maps a bundler JSON-RPC error to a rejection kind.
///
/// Codes follow ERC-4337 §"RPC methods"; messages are matched too because
/// bundlers disagree on codes for fee and nonce problems.
pub fn classify_rejection(code: i64, message: &str) -> BundlerRejection {
    let lower = message.to_ascii_lowercase();
    let aa = aa_code(message);

    if aa == Some("AA25")
        || lower.contains("nonce too low")
        || lower.contains("invalid account nonce")
        || lower.contains("invalid nonce")
    {
        return BundlerRejection::NonceTooLow;
    }
    if aa == Some("AA24")
        || code == -32507
        || lower.contains("invalid signature")
        || lower.contains("signature error")
    {
        return BundlerRejection::InvalidSignature;
    }
    if lower.contains("underpriced")
        || lower.contains("fee too low")
        || lower.contains("replacement")
        || (lower.contains("fee") && lower.contains("too low"))
    {
        return BundlerRejection::Underpriced;
    }
    if aa.is_some() || (-32506..=-32500).contains(&code) {
        return BundlerRejection::EntrypointSimulation;
    }
    BundlerRejection::Other
}

fn classify_send_error(err: RpcError) -> ExecError {
    if err.is_transient() {
        return ExecError::TransientNetwork(err.to_string());
    }
    match err {
        RpcError::Rpc { code, message, .. } => {
            ExecError::rejected(classify_rejection(code, &message), message)
        }
        other => ExecError::rejected(BundlerRejection::Other, other.to_string()),
    }
}

/// Estimation runs the operation; anything that looks like a revert means the
/// batch would fail on-chain too.
///
/// A stale nonce is the exception: validation runs before execution, so a
/// competing operation that landed after our nonce read shows up here as
/// `AA25` and stays a retryable `NonceTooLow`.
fn classify_estimate_error(err: RpcError) -> ExecError {
    if err.is_transient() {
        return ExecError::TransientNetwork(err.to_string());
    }
    let reason = revert_reason(&err);
    match err {
        RpcError::Rpc { code, message, .. } => {
            if classify_rejection(code, &message) == BundlerRejection::NonceTooLow {
                return ExecError::rejected(BundlerRejection::NonceTooLow, message);
            }
            let lower = message.to_ascii_lowercase();
            let reverted = code == -32521
                || (-32506..=-32500).contains(&code)
                || aa_code(&message).is_some()
                || lower.contains("revert");
            if reverted {
                ExecError::SimulationReverted {
                    reason: reason.or(Some(message)),
                }
            } else {
                ExecError::rejected(classify_rejection(code, &message), message)
            }
        }
        other => ExecError::rejected(BundlerRejection::Other, other.to_string()),
    }
}

fn classify_lookup_error(err: RpcError) -> ExecError {
    if err.is_transient() {
        ExecError::TransientNetwork(err.to_string())
    } else {
        ExecError::rejected(BundlerRejection::Other, err.to_string())
    }
}

fn revert_reason(err: &RpcError) -> Option<String> {
    let RpcError::Rpc { message, data, .. } = err else {
        return None;
    };
    let from_data = match data {
        Some(Value::String(s)) => decode_revert_hex(s),
        Some(Value::Object(obj)) => obj
            .get("revertData")
            .or_else(|| obj.get("reason"))
            .and_then(Value::as_str)
            .and_then(decode_revert_hex),
        _ => None,
    };
    from_data.or_else(|| reason_from_message(message))
}
