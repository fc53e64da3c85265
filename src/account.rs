//! Calldata for the account, its factory and the fee token.
//!
//! Encoding is done directly with `ethers::abi` so it needs no provider.

use crate::error::ExecError;
use crate::types::{Call, SmartAccountRef};
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::id;
use serde::{Deserialize, Serialize};

pub const EXECUTE_SIG: &str = "execute(address,uint256,bytes)";
pub const EXECUTE_BATCH_WITH_VALUES_SIG: &str = "executeBatch(address[],uint256[],bytes[])";
pub const EXECUTE_BATCH_NO_VALUES_SIG: &str = "executeBatch(address[],bytes[])";
pub const CREATE_ACCOUNT_SIG: &str = "createAccount(address,bytes)";
pub const APPROVE_SIG: &str = "approve(address,uint256)";

/// Which batch entry point the account exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchFlavor {
    /// `executeBatch(address[],uint256[],bytes[])`
    #[default]
    WithValues,
    /// `executeBatch(address[],bytes[])`; batched calls cannot carry value.
    NoValues,
    /// Only `execute`; a send must be a single call.
    SingleOnly,
}

impl std::fmt::Display for BatchFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchFlavor::WithValues => "withValues",
            BatchFlavor::NoValues => "noValues",
            BatchFlavor::SingleOnly => "singleOnly",
        };
        f.write_str(s)
    }
}

/// Capability tags resolved for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountCapabilities {
    pub deployed: bool,
    pub batch: BatchFlavor,
}

/// Finds the batch flavour by looking for `PUSH4 <selector>` in the runtime
/// code. Proxies and undeployed accounts have no selectors to find, so they get
/// `default`.
pub fn detect_batch_flavor(code: &[u8], default: BatchFlavor) -> BatchFlavor {
    let has = |sig: &str| {
        let sel = id(sig);
        code.windows(5)
            .any(|w| w[0] == 0x63 && w[1..] == sel[..])
    };
    if has(EXECUTE_BATCH_WITH_VALUES_SIG) {
        BatchFlavor::WithValues
    } else if has(EXECUTE_BATCH_NO_VALUES_SIG) {
        BatchFlavor::NoValues
    } else if has(EXECUTE_SIG) {
        BatchFlavor::SingleOnly
    } else {
        default
    }
}

fn with_selector(sig: &str, args: &[Token]) -> Bytes {
    let mut out = id(sig).to_vec();
    out.extend_from_slice(&encode(args));
    Bytes::from(out)
}

/// Account callData for `calls`: `execute` for one call, `executeBatch` for
/// more. All calls in the batch succeed or revert together.
pub fn encode_calls(calls: &[Call], flavor: BatchFlavor) -> Result<Bytes, ExecError> {
    match calls {
        [] => Err(ExecError::InvalidInput("a send needs at least one call".into())),
        [call] => Ok(with_selector(
            EXECUTE_SIG,
            &[
                Token::Address(call.to),
                Token::Uint(call.value),
                Token::Bytes(call.data.to_vec()),
            ],
        )),
        calls => {
            let targets = Token::Array(calls.iter().map(|c| Token::Address(c.to)).collect());
            let datas = Token::Array(
                calls
                    .iter()
                    .map(|c| Token::Bytes(c.data.to_vec()))
                    .collect(),
            );
            match flavor {
                BatchFlavor::WithValues => {
                    let values = Token::Array(calls.iter().map(|c| Token::Uint(c.value)).collect());
                    Ok(with_selector(
                        EXECUTE_BATCH_WITH_VALUES_SIG,
                        &[targets, values, datas],
                    ))
                }
                BatchFlavor::NoValues => {
                    if let Some(i) = calls.iter().position(|c| !c.value.is_zero()) {
                        return Err(ExecError::InvalidInput(format!(
                            "call {i} carries value but the account's executeBatch has no values"
                        )));
                    }
                    Ok(with_selector(EXECUTE_BATCH_NO_VALUES_SIG, &[targets, datas]))
                }
                BatchFlavor::SingleOnly => Err(ExecError::InvalidInput(format!(
                    "account has no batch entry point; got {} calls",
                    calls.len()
                ))),
            }
        }
    }
}

/// Inverse of [`encode_calls`].
pub fn decode_calls(call_data: &[u8]) -> Result<Vec<Call>, ExecError> {
    if call_data.len() < 4 {
        return Err(ExecError::InvalidInput("callData shorter than a selector".into()));
    }
    let (sel, args) = call_data.split_at(4);
    let bad = |e: ethers::abi::Error| ExecError::InvalidInput(format!("undecodable callData: {e}"));
    let addresses = || ParamType::Array(Box::new(ParamType::Address));
    let byte_arrays = || ParamType::Array(Box::new(ParamType::Bytes));

    if sel == id(EXECUTE_SIG) {
        let tokens = decode(&[ParamType::Address, ParamType::Uint(256), ParamType::Bytes], args)
            .map_err(bad)?;
        return match tokens.as_slice() {
            [Token::Address(to), Token::Uint(value), Token::Bytes(data)] => {
                Ok(vec![Call::new(*to, *value, Bytes::from(data.clone()))])
            }
            _ => Err(ExecError::InvalidInput("unexpected execute layout".into())),
        };
    }

    let (targets, values, datas) = if sel == id(EXECUTE_BATCH_WITH_VALUES_SIG) {
        let mut t = decode(
            &[addresses(), ParamType::Array(Box::new(ParamType::Uint(256))), byte_arrays()],
            args,
        )
        .map_err(bad)?;
        let datas = t.pop();
        let values = t.pop();
        (t.pop(), values, datas)
    } else if sel == id(EXECUTE_BATCH_NO_VALUES_SIG) {
        let mut t = decode(&[addresses(), byte_arrays()], args).map_err(bad)?;
        let datas = t.pop();
        (t.pop(), None, datas)
    } else {
        return Err(ExecError::InvalidInput(format!(
            "unknown account selector 0x{}",
            hex::encode(sel)
        )));
    };

    let targets = targets.and_then(Token::into_array).unwrap_or_default();
    let datas = datas.and_then(Token::into_array).unwrap_or_default();
    let values = values.and_then(Token::into_array);
    if targets.len() != datas.len() || values.as_ref().is_some_and(|v| v.len() != targets.len()) {
        return Err(ExecError::InvalidInput("batch arrays differ in length".into()));
    }

    let mut calls = Vec::with_capacity(targets.len());
    for (i, (to, data)) in targets.into_iter().zip(datas).enumerate() {
        let to = to
            .into_address()
            .ok_or_else(|| ExecError::InvalidInput(format!("target {i} is not an address")))?;
        let data = data
            .into_bytes()
            .ok_or_else(|| ExecError::InvalidInput(format!("data {i} is not bytes")))?;
        let value = match &values {
            Some(v) => v[i]
                .clone()
                .into_uint()
                .ok_or_else(|| ExecError::InvalidInput(format!("value {i} is not a uint")))?,
            None => U256::zero(),
        };
        calls.push(Call::new(to, value, Bytes::from(data)));
    }
    Ok(calls)
}

/// `createAccount(owner, salt)` calldata for the factory.
pub fn create_account_calldata(account: &SmartAccountRef) -> Bytes {
    with_selector(
        CREATE_ACCOUNT_SIG,
        &[
            Token::Address(account.owner),
            Token::Bytes(account.salt.to_vec()),
        ],
    )
}

/// EntryPoint initCode: factory address followed by the factory calldata.
pub fn init_code(account: &SmartAccountRef) -> Bytes {
    let calldata = create_account_calldata(account);
    let mut v = Vec::with_capacity(20 + calldata.len());
    v.extend_from_slice(account.factory.as_bytes());
    v.extend_from_slice(calldata.as_ref());
    Bytes::from(v)
}

/// ERC-20 `approve(spender, amount)` on `token`, as a batch call.
pub fn approve_call(token: Address, spender: Address, amount: U256) -> Call {
    Call::new(
        token,
        U256::zero(),
        with_selector(APPROVE_SIG, &[Token::Address(spender), Token::Uint(amount)]),
    )
}
