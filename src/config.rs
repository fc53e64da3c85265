use crate::account::BatchFlavor;
use crate::address::AccountBytecode;
use crate::nonce::NoncePolicy;
use crate::paymaster::SponsorshipContext;
use crate::retry::RetryPolicy;
use anyhow::{anyhow, bail, Context, Result};
use ethers::types::{Address, H256, U256};
use serde::Deserialize;
use std::{env, fs, path::Path, time::Duration};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfigRaw {
    pub chain_id: u64,
    #[serde(default)]
    pub rpc: Option<String>,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    #[serde(default)]
    pub bundler: Option<String>,
    #[serde(default)]
    pub bundler_env_var: Option<String>,
    pub entry_point: String,
    pub factory: String,
    pub account: AccountRaw,
    #[serde(default)]
    pub default_batch_flavor: BatchFlavor,
    #[serde(default)]
    pub nonce_mode: NoncePolicy,
    #[serde(default)]
    pub paymaster: Option<PaymasterRaw>,
    #[serde(default)]
    pub gas: GasRaw,
    #[serde(default)]
    pub retry: RetryRaw,
    #[serde(default)]
    pub receipt: ReceiptRaw,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRaw {
    #[serde(default)]
    pub implementation: Option<String>,
    #[serde(default)]
    pub init_code_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterRaw {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub url_env_var: Option<String>,
    #[serde(default)]
    pub policy_id: Option<String>,
    #[serde(default)]
    pub webhook_data: Option<String>,
    #[serde(default)]
    pub allow_self_pay_fallback: bool,
    #[serde(default)]
    pub fee_token: Option<FeeTokenRaw>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeTokenRaw {
    pub token: String,
    pub spender: String,
    /// Decimal or 0x-hex base units.
    pub allowance: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GasRaw {
    pub call_gas_multiplier_bps: u32,
    pub fee_multiplier_bps: u32,
    pub min_fee_bump_bps: u32,
}

impl Default for GasRaw {
    fn default() -> Self {
        Self {
            call_gas_multiplier_bps: 11_000,
            fee_multiplier_bps: 10_000,
            min_fee_bump_bps: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryRaw {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub transient_retries: u32,
}

impl Default for RetryRaw {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 15_000,
            transient_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiptRaw {
    pub poll_interval_ms: u64,
    pub timeout_seconds: u64,
}

impl Default for ReceiptRaw {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_500,
            timeout_seconds: 120,
        }
    }
}

fn default_cache_capacity() -> u32 {
    1024
}

/// ERC-20 gas payment: the account approves `spender` for `allowance` of
/// `token` inside each sponsored batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeTokenConfig {
    pub token: Address,
    pub spender: Address,
    pub allowance: U256,
}

#[derive(Debug, Clone)]
pub struct PaymasterConfig {
    pub url: String,
    pub context: SponsorshipContext,
    pub allow_self_pay_fallback: bool,
    pub fee_token: Option<FeeTokenConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasConfig {
    pub call_gas_multiplier_bps: u32,
    pub fee_multiplier_bps: u32,
    pub min_fee_bump_bps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

/// Validated pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub bundler_url: String,
    pub entry_point: Address,
    pub factory: Address,
    pub account: AccountBytecode,
    pub default_batch_flavor: BatchFlavor,
    pub nonce_mode: NoncePolicy,
    pub paymaster: Option<PaymasterConfig>,
    pub gas: GasConfig,
    pub retry: RetryPolicy,
    pub receipt: ReceiptConfig,
    pub cache_capacity: u32,
}

/// URLs given on the command line; they win over the file and its env vars.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub rpc: Option<String>,
    pub bundler: Option<String>,
    pub paymaster: Option<String>,
}

pub fn load_config(path: &Path, overrides: Overrides) -> Result<PipelineConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read pipeline config at {}", path.display()))?;
    parse_config(&raw, overrides)
        .with_context(|| format!("invalid pipeline config at {}", path.display()))
}

pub fn parse_config(json: &str, overrides: Overrides) -> Result<PipelineConfig> {
    let raw: PipelineConfigRaw =
        serde_json::from_str(json).context("failed to parse pipeline config json")?;
    PipelineConfig::from_raw(raw, overrides)
}

impl PipelineConfig {
    pub fn from_raw(raw: PipelineConfigRaw, overrides: Overrides) -> Result<Self> {
        let rpc_url = resolve_url("rpc", overrides.rpc, raw.rpc_env_var.as_deref(), raw.rpc)?;
        let bundler_url = resolve_url(
            "bundler",
            overrides.bundler,
            raw.bundler_env_var.as_deref(),
            raw.bundler,
        )?;
        for url in [&rpc_url, &bundler_url] {
            if url.contains("alchemy.com/v2/") || url.contains("infura.io/v3/") {
                tracing::warn!("URL looks like it may contain an API key; consider an env var instead of committing it.");
            }
        }

        let entry_point = parse_addr(&raw.entry_point).context("invalid entryPoint address")?;
        let factory = parse_addr(&raw.factory).context("invalid factory address")?;

        let account = match (raw.account.implementation, raw.account.init_code_hash) {
            (Some(imp), None) => AccountBytecode::MinimalProxy {
                implementation: parse_addr(&imp).context("invalid account.implementation")?,
            },
            (None, Some(h)) => AccountBytecode::InitCodeHash(
                h.parse::<H256>()
                    .map_err(|e| anyhow!("invalid account.initCodeHash: {e}"))?,
            ),
            _ => bail!("account needs exactly one of implementation or initCodeHash"),
        };

        let paymaster = raw
            .paymaster
            .map(|pm| parse_paymaster(pm, overrides.paymaster))
            .transpose()?;

        let gas = GasConfig {
            call_gas_multiplier_bps: raw.gas.call_gas_multiplier_bps,
            fee_multiplier_bps: raw.gas.fee_multiplier_bps,
            min_fee_bump_bps: raw.gas.min_fee_bump_bps,
        };
        if gas.call_gas_multiplier_bps < 10_000 {
            bail!("gas.callGasMultiplierBps must be >= 10000");
        }
        if gas.fee_multiplier_bps < 10_000 {
            bail!("gas.feeMultiplierBps must be >= 10000");
        }
        if gas.min_fee_bump_bps == 0 {
            bail!("gas.minFeeBumpBps must be > 0");
        }

        if raw.retry.max_attempts == 0 {
            bail!("retry.maxAttempts must be > 0");
        }
        if raw.retry.backoff_base_ms > raw.retry.backoff_max_ms {
            tracing::warn!(
                base = raw.retry.backoff_base_ms,
                max = raw.retry.backoff_max_ms,
                "backoff base > max; clamping base to max"
            );
        }
        let backoff_max = Duration::from_millis(raw.retry.backoff_max_ms.max(1));
        let retry = RetryPolicy {
            max_attempts: raw.retry.max_attempts,
            backoff_base: Duration::from_millis(raw.retry.backoff_base_ms).min(backoff_max),
            backoff_max,
            transient_retries: raw.retry.transient_retries,
        };

        if raw.receipt.timeout_seconds == 0 {
            bail!("receipt.timeoutSeconds must be > 0");
        }
        let receipt = ReceiptConfig {
            poll_interval: Duration::from_millis(raw.receipt.poll_interval_ms.max(100)),
            timeout: Duration::from_secs(raw.receipt.timeout_seconds),
        };

        if raw.cache_capacity == 0 {
            bail!("cacheCapacity must be > 0");
        }

        Ok(Self {
            chain_id: raw.chain_id,
            rpc_url,
            bundler_url,
            entry_point,
            factory,
            account,
            default_batch_flavor: raw.default_batch_flavor,
            nonce_mode: raw.nonce_mode,
            paymaster,
            gas,
            retry,
            receipt,
            cache_capacity: raw.cache_capacity,
        })
    }
}

fn parse_paymaster(raw: PaymasterRaw, url_override: Option<String>) -> Result<PaymasterConfig> {
    let url = resolve_url("paymaster", url_override, raw.url_env_var.as_deref(), raw.url)?;
    let fee_token = raw
        .fee_token
        .map(|ft| -> Result<FeeTokenConfig> {
            Ok(FeeTokenConfig {
                token: parse_addr(&ft.token).context("invalid paymaster.feeToken.token")?,
                spender: parse_addr(&ft.spender).context("invalid paymaster.feeToken.spender")?,
                allowance: parse_amount(&ft.allowance)
                    .context("invalid paymaster.feeToken.allowance")?,
            })
        })
        .transpose()?;

    Ok(PaymasterConfig {
        url,
        context: SponsorshipContext {
            policy_id: raw.policy_id,
            webhook_data: raw.webhook_data,
            token: fee_token.as_ref().map(|ft| ft.token),
        },
        allow_self_pay_fallback: raw.allow_self_pay_fallback,
        fee_token,
    })
}

/// CLI override, then the named env var, then the literal from the file.
fn resolve_url(
    what: &str,
    cli: Option<String>,
    env_var: Option<&str>,
    literal: Option<String>,
) -> Result<String> {
    cli.or_else(|| env_var.and_then(|k| env::var(k).ok()))
        .or(literal)
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| anyhow!("no {what} url provided (flag, env var, or config file)"))
}

fn parse_addr(s: &str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow!("{e}"))
}

fn parse_amount(s: &str) -> Result<U256> {
    if let Some(hex) = s.strip_prefix("0x") {
        U256::from_str_radix(hex, 16).map_err(|e| anyhow!("{e}"))
    } else {
        U256::from_dec_str(s).map_err(|e| anyhow!("{e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "chainId": 84532,
        "rpc": "http://localhost:8545",
        "bundler": "http://localhost:4337",
        "entryPoint": "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789",
        "factory": "0x9406Cc6185a346906296840746125a0E44976454",
        "account": { "implementation": "0x8ABB13360b87Be5EEb1B98647A016adD927a136c" }
    }"#;

    #[test]
    fn defaults_are_applied() {
        let cfg = parse_config(MINIMAL, Overrides::default()).unwrap();
        assert_eq!(cfg.chain_id, 84532);
        assert_eq!(cfg.nonce_mode, NoncePolicy::Sequential);
        assert_eq!(cfg.default_batch_flavor, BatchFlavor::WithValues);
        assert_eq!(cfg.gas.call_gas_multiplier_bps, 11_000);
        assert_eq!(cfg.gas.min_fee_bump_bps, 1_000);
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert_eq!(cfg.receipt.poll_interval, Duration::from_millis(1_500));
        assert_eq!(cfg.receipt.timeout, Duration::from_secs(120));
        assert_eq!(cfg.cache_capacity, 1024);
        assert!(cfg.paymaster.is_none());
        assert!(matches!(cfg.account, AccountBytecode::MinimalProxy { .. }));
    }

    #[test]
    fn cli_override_wins() {
        let cfg = parse_config(
            MINIMAL,
            Overrides {
                bundler: Some("http://other:4337".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.bundler_url, "http://other:4337");
        assert_eq!(cfg.rpc_url, "http://localhost:8545");
    }

    #[test]
    fn paymaster_with_fee_token() {
        let json = MINIMAL.replace(
            r#""account""#,
            r#""paymaster": {
                "url": "http://pm",
                "policyId": "pol",
                "allowSelfPayFallback": true,
                "feeToken": {
                    "token": "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
                    "spender": "0x0000000000000039cd5e8aE05257CE51C473ddd1",
                    "allowance": "1000000"
                }
            },
            "account""#,
        );
        let cfg = parse_config(&json, Overrides::default()).unwrap();
        let pm = cfg.paymaster.unwrap();
        assert!(pm.allow_self_pay_fallback);
        assert_eq!(pm.context.policy_id.as_deref(), Some("pol"));
        let ft = pm.fee_token.unwrap();
        assert_eq!(ft.allowance, U256::from(1_000_000u64));
        assert_eq!(pm.context.token, Some(ft.token));
    }

    #[test]
    fn rejects_both_account_kinds() {
        let json = MINIMAL.replace(
            r#"{ "implementation""#,
            r#"{ "initCodeHash": "0x0000000000000000000000000000000000000000000000000000000000000001", "implementation""#,
        );
        assert!(parse_config(&json, Overrides::default()).is_err());
    }

    #[test]
    fn rejects_shrinking_multiplier() {
        let json = MINIMAL.replace(
            r#""account""#,
            r#""gas": { "callGasMultiplierBps": 9000 }, "account""#,
        );
        let err = parse_config(&json, Overrides::default()).unwrap_err();
        assert!(format!("{err:#}").contains("callGasMultiplierBps"));
    }

    #[test]
    fn rejects_bad_entry_point() {
        let json = MINIMAL.replace("0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789", "0x123");
        assert!(parse_config(&json, Overrides::default()).is_err());
    }
}
