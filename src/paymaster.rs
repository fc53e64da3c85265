use crate::encoding::{self, parse_bytes, parse_u256_quantity};
use crate::error::ExecError;
use crate::rpc::{JsonRpcClient, RpcError};
use crate::types::UserOperation;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use serde_json::Value;

/// Free-form ERC-7677 context sent with every request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SponsorshipContext {
    pub policy_id: Option<String>,
    /// Alchemy Gas Manager expects this as `webhookData`.
    pub webhook_data: Option<String>,
    /// ERC-20 the paymaster should charge instead of sponsoring outright.
    pub token: Option<Address>,
}

impl SponsorshipContext {
    fn to_json(&self) -> Value {
        let mut ctx = serde_json::Map::new();
        if let Some(p) = &self.policy_id {
            ctx.insert("policyId".into(), Value::String(p.clone()));
        }
        if let Some(wd) = &self.webhook_data {
            ctx.insert("webhookData".into(), Value::String(wd.clone()));
        }
        if let Some(t) = self.token {
            ctx.insert("token".into(), Value::String(encoding::fmt_address(t)));
        }
        Value::Object(ctx)
    }
}

/// Caller-controlled fields a paymaster response may echo back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EchoedFields {
    pub sender: Option<Address>,
    pub nonce: Option<U256>,
    pub init_code: Option<Bytes>,
    pub call_data: Option<Bytes>,
}

/// An approved sponsorship.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymasterData {
    pub paymaster_and_data: Bytes,
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
    /// Stub data that is already final; `pm_getPaymasterData` can be skipped.
    pub is_final: bool,
    pub echoed: EchoedFields,
}

impl PaymasterData {
    pub fn new(paymaster_and_data: Bytes) -> Self {
        Self {
            paymaster_and_data,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymasterDecline {
    pub code: String,
    pub reason: String,
}

impl From<PaymasterDecline> for ExecError {
    fn from(d: PaymasterDecline) -> Self {
        ExecError::SponsorshipDenied {
            code: d.code,
            reason: d.reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sponsorship {
    Approved(PaymasterData),
    Declined(PaymasterDecline),
}

/// The two ERC-7677 phases. Outages are [`ExecError::TransientNetwork`], an
/// unusable endpoint is [`ExecError::PaymasterUnavailable`] and a policy
/// refusal is `Ok(Sponsorship::Declined)`.
#[async_trait]
pub trait PaymasterApi: Send + Sync {
    /// `pm_getPaymasterStubData`: placeholder data sized for gas estimation.
    async fn stub_data(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<Sponsorship, ExecError>;

    /// `pm_getPaymasterData`: the signed sponsorship for the estimated op.
    async fn final_data(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<Sponsorship, ExecError>;
}

/// ERC-7677 paymaster web service client.
///
/// Only the standard methods are used so any compliant provider works.
#[derive(Debug)]
pub struct PaymasterClient {
    rpc: JsonRpcClient,
    context: SponsorshipContext,
}

impl PaymasterClient {
    pub fn new(url: String, context: SponsorshipContext) -> Self {
        Self {
            rpc: JsonRpcClient::new(url),
            context,
        }
    }

    async fn call(
        &self,
        method: &str,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<Sponsorship, ExecError> {
        let params = build_params(op, entry_point, chain_id, &self.context);
        sponsorship_from_response(method, self.rpc.request(method, params).await)
    }
}

#[async_trait]
impl PaymasterApi for PaymasterClient {
    async fn stub_data(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<Sponsorship, ExecError> {
        self.call("pm_getPaymasterStubData", op, entry_point, chain_id)
            .await
    }

    async fn final_data(
        &self,
        op: &UserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<Sponsorship, ExecError> {
        self.call("pm_getPaymasterData", op, entry_point, chain_id)
            .await
    }
}

fn build_params(
    op: &UserOperation,
    entry_point: Address,
    chain_id: u64,
    ctx: &SponsorshipContext,
) -> Value {
    serde_json::json!([
        encoding::user_op_to_json(op),
        encoding::fmt_address(entry_point),
        encoding::fmt_u256(U256::from(chain_id)),
        ctx.to_json()
    ])
}

/// JSON-RPC codes that mean the endpoint does not speak ERC-7677 (or we do
/// not speak it correctly), as opposed to refusing this operation.
const PROTOCOL_ERROR_CODES: [i64; 3] = [-32700, -32601, -32602];

/// Splits a paymaster reply into approval, policy decline, or failure.
///
/// Only a JSON-RPC error object carrying a policy refusal is a decline.
/// Non-throttling HTTP statuses, unknown methods and unparseable results are
/// [`ExecError::PaymasterUnavailable`], so a misconfigured endpoint can never
/// look like a decline that permits self-paid gas.
fn sponsorship_from_response(
    method: &str,
    response: Result<Value, RpcError>,
) -> Result<Sponsorship, ExecError> {
    match response {
        Ok(res) => parse_paymaster_result(&res)
            .map(Sponsorship::Approved)
            .map_err(|e| {
                ExecError::PaymasterUnavailable(format!("{method}: malformed result: {e:#}"))
            }),
        Err(e) if e.is_transient() => {
            Err(ExecError::TransientNetwork(format!("{method} failed: {e}")))
        }
        Err(RpcError::Rpc { code, message, .. }) if PROTOCOL_ERROR_CODES.contains(&code) => Err(
            ExecError::PaymasterUnavailable(format!("{method}: RPC error {code}: {message}")),
        ),
        Err(RpcError::Rpc {
            code,
            message,
            data,
        }) => Ok(Sponsorship::Declined(decline_from_rpc(code, message, data.as_ref()))),
        Err(other) => Err(ExecError::PaymasterUnavailable(format!("{method}: {other}"))),
    }
}

/// Prefers a machine-readable code from `error.data` over the numeric code.
fn decline_from_rpc(code: i64, message: String, data: Option<&Value>) -> PaymasterDecline {
    let data_code = data
        .and_then(|d| d.get("code").or_else(|| d.get("reason")))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    PaymasterDecline {
        code: data_code.unwrap_or_else(|| code.to_string()),
        reason: message,
    }
}

fn parse_paymaster_result(result: &Value) -> anyhow::Result<PaymasterData> {
    // ERC-7677 puts v0.6 data at the top level; Alchemy wraps it in
    // `entrypointV06Response` next to a v0.7 sibling.
    let body = if result.get("paymasterAndData").is_some() {
        result
    } else {
        result
            .get("entrypointV06Response")
            .or_else(|| result.get("entryPointV06Response"))
            .ok_or_else(|| {
                anyhow!("missing paymasterAndData (expected top-level or entrypointV06Response)")
            })?
    };

    let pmd = body
        .get("paymasterAndData")
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing paymasterAndData field"))?;

    let quantity = |key: &str| -> anyhow::Result<Option<U256>> {
        body.get(key)
            .and_then(|x| x.as_str())
            .map(|s| parse_u256_quantity(s).with_context(|| format!("invalid {key}")))
            .transpose()
    };
    let bytes = |key: &str| -> anyhow::Result<Option<Bytes>> {
        body.get(key)
            .and_then(|x| x.as_str())
            .map(|s| parse_bytes(s).with_context(|| format!("invalid {key}")))
            .transpose()
    };
    let sender = body
        .get("sender")
        .and_then(|x| x.as_str())
        .map(|s| s.parse::<Address>().map_err(|e| anyhow!("invalid sender: {e}")))
        .transpose()?;

    Ok(PaymasterData {
        paymaster_and_data: parse_bytes(pmd).context("invalid hex in paymasterAndData")?,
        call_gas_limit: quantity("callGasLimit")?,
        verification_gas_limit: quantity("verificationGasLimit")?,
        pre_verification_gas: quantity("preVerificationGas")?,
        is_final: result
            .get("isFinal")
            .or_else(|| body.get("isFinal"))
            .and_then(|x| x.as_bool())
            .unwrap_or(false),
        echoed: EchoedFields {
            sender,
            nonce: quantity("nonce")?,
            init_code: bytes("initCode")?,
            call_data: bytes("callData")?,
        },
    })
}

/// Applies a sponsorship to `op`, rejecting any response that would change a
/// caller-controlled field.
///
/// Everything the response carries is applied to a copy and the caller-field
/// hash is compared before and after.
pub fn apply_sponsorship(op: &UserOperation, data: &PaymasterData) -> Result<UserOperation, ExecError> {
    let before = op.caller_fields_hash();

    let mut out = op.clone();
    out.paymaster_and_data = data.paymaster_and_data.clone();
    if let Some(v) = data.call_gas_limit {
        out.call_gas_limit = v;
    }
    if let Some(v) = data.verification_gas_limit {
        out.verification_gas_limit = v;
    }
    if let Some(v) = data.pre_verification_gas {
        out.pre_verification_gas = v;
    }
    if let Some(v) = data.echoed.sender {
        out.sender = v;
    }
    if let Some(v) = data.echoed.nonce {
        out.nonce = v;
    }
    if let Some(v) = &data.echoed.init_code {
        out.init_code = v.clone();
    }
    if let Some(v) = &data.echoed.call_data {
        out.call_data = v.clone();
    }

    if out.caller_fields_hash() != before {
        let field = if out.sender != op.sender {
            "sender"
        } else if out.nonce != op.nonce {
            "nonce"
        } else if out.init_code != op.init_code {
            "initCode"
        } else {
            "callData"
        };
        tracing::error!(sender = ?op.sender, field, "paymaster response tampers with caller fields");
        return Err(ExecError::PaymasterTamper { field });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PM_DATA: &str = "0xdeadbeef";

    fn expected_bytes() -> Bytes {
        Bytes::from(vec![0xde, 0xad, 0xbe, 0xef])
    }

    fn op() -> UserOperation {
        UserOperation {
            sender: Address::repeat_byte(0x5e),
            nonce: 4.into(),
            call_data: Bytes::from(vec![1, 2, 3]),
            call_gas_limit: 1_000.into(),
            ..Default::default()
        }
    }

    #[test]
    fn parse_paymaster_and_data_top_level() {
        let res = json!({ "paymasterAndData": PM_DATA });
        let out = parse_paymaster_result(&res).unwrap();
        assert_eq!(out.paymaster_and_data, expected_bytes());
        assert!(!out.is_final);
    }

    #[test]
    fn parse_paymaster_and_data_nested_entrypoint_v06() {
        let res = json!({ "entrypointV06Response": { "paymasterAndData": PM_DATA } });
        let out = parse_paymaster_result(&res).unwrap();
        assert_eq!(out.paymaster_and_data, expected_bytes());
    }

    #[test]
    fn parse_paymaster_and_data_nested_entry_point_v06() {
        let res = json!({ "entryPointV06Response": { "paymasterAndData": PM_DATA }, "isFinal": true });
        let out = parse_paymaster_result(&res).unwrap();
        assert_eq!(out.paymaster_and_data, expected_bytes());
        assert!(out.is_final);
    }

    #[test]
    fn parse_paymaster_and_data_missing_fields() {
        let res = json!({ "entrypointV07Response": { "paymasterAndData": PM_DATA } });
        assert!(parse_paymaster_result(&res).is_err());
    }

    #[test]
    fn parse_revised_gas_fields() {
        let res = json!({
            "paymasterAndData": PM_DATA,
            "callGasLimit": "0x7530",
            "preVerificationGas": "0xc350",
        });
        let out = parse_paymaster_result(&res).unwrap();
        assert_eq!(out.call_gas_limit, Some(U256::from(30_000)));
        assert_eq!(out.verification_gas_limit, None);
        assert_eq!(out.pre_verification_gas, Some(U256::from(50_000)));
    }

    #[test]
    fn context_includes_only_set_fields() {
        let ctx = SponsorshipContext {
            policy_id: Some("pol-1".into()),
            webhook_data: None,
            token: None,
        };
        assert_eq!(ctx.to_json(), json!({ "policyId": "pol-1" }));
    }

    #[test]
    fn rpc_error_becomes_decline_with_data_code() {
        let err = RpcError::Rpc {
            code: -32600,
            message: "policy limit exceeded".into(),
            data: Some(json!({ "code": "POLICY_LIMIT" })),
        };
        match sponsorship_from_response("pm_getPaymasterStubData", Err(err)) {
            Ok(Sponsorship::Declined(d)) => {
                assert_eq!(d.code, "POLICY_LIMIT");
                assert_eq!(d.reason, "policy limit exceeded");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn auth_failure_is_unavailable_not_a_decline() {
        let err = RpcError::Http {
            status: 401,
            body: "unauthorized: bad api key".into(),
        };
        let out = sponsorship_from_response("pm_getPaymasterStubData", Err(err));
        assert!(matches!(out, Err(ExecError::PaymasterUnavailable(m)) if m.contains("401")));
    }

    #[test]
    fn unknown_method_and_garbage_results_are_unavailable() {
        let err = RpcError::Rpc {
            code: -32601,
            message: "the method pm_getPaymasterData does not exist".into(),
            data: None,
        };
        assert!(matches!(
            sponsorship_from_response("pm_getPaymasterData", Err(err)),
            Err(ExecError::PaymasterUnavailable(_))
        ));
        assert!(matches!(
            sponsorship_from_response("pm_getPaymasterData", Ok(json!({ "ok": true }))),
            Err(ExecError::PaymasterUnavailable(_))
        ));
    }

    #[test]
    fn throttling_stays_transient() {
        let err = RpcError::Http {
            status: 429,
            body: "slow down".into(),
        };
        assert!(matches!(
            sponsorship_from_response("pm_getPaymasterStubData", Err(err)),
            Err(ExecError::TransientNetwork(_))
        ));
    }

    #[test]
    fn sponsorship_applies_gas_and_data() {
        let mut data = PaymasterData::new(expected_bytes());
        data.call_gas_limit = Some(2_000.into());
        // echoing an unchanged field is fine
        data.echoed.nonce = Some(4.into());
        let out = apply_sponsorship(&op(), &data).unwrap();
        assert_eq!(out.paymaster_and_data, expected_bytes());
        assert_eq!(out.call_gas_limit, U256::from(2_000));
        assert_eq!(out.caller_fields_hash(), op().caller_fields_hash());
    }

    #[test]
    fn altered_call_data_is_tamper() {
        let mut data = PaymasterData::new(expected_bytes());
        data.echoed.call_data = Some(Bytes::from(vec![9, 9]));
        let err = apply_sponsorship(&op(), &data).unwrap_err();
        assert!(matches!(err, ExecError::PaymasterTamper { field: "callData" }));
    }

    #[test]
    fn altered_sender_is_tamper() {
        let mut data = PaymasterData::new(expected_bytes());
        data.echoed.sender = Some(Address::repeat_byte(0xba));
        let err = apply_sponsorship(&op(), &data).unwrap_err();
        assert!(matches!(err, ExecError::PaymasterTamper { field: "sender" }));
    }
}
