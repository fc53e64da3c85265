use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::prelude::*;
use smart_account_exec::bundler::{BundlerApi, BundlerClient};
use smart_account_exec::chain::EthersChain;
use smart_account_exec::encoding::{self, fmt_address, fmt_h256, fmt_u256};
use smart_account_exec::paymaster::{PaymasterApi, PaymasterClient};
use smart_account_exec::signer::{LocalWalletSigner, SignatureProvider};
use smart_account_exec::{
    load_config, Call, Overrides, Pipeline, PipelineConfig, SendOptions, SmartAccountRef,
};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// In --json mode stdout carries exactly one JSON object; everything
// human-readable goes to stderr.
macro_rules! outln {
    ($machine_mode:expr, $($arg:tt)*) => {{
        if $machine_mode {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(name = "sa-exec", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the counterfactual smart account address, deployment status and batch flavor.
    Account(AccountArgs),

    /// Build, sponsor, sign and submit a batch of calls, then wait for the receipt.
    Send(SendArgs),

    /// Look up a user operation by hash.
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Pipeline deployment file (chain, entrypoint, factory, paymaster, policies).
    #[arg(long, default_value = "deployments/base-sepolia.json")]
    config: PathBuf,

    /// Override the chain RPC URL.
    #[arg(long, env = "SA_EXEC_RPC_URL")]
    rpc: Option<String>,

    /// Override the bundler URL.
    #[arg(long, env = "SA_EXEC_BUNDLER_URL")]
    bundler: Option<String>,

    /// Override the paymaster URL (only used if the config has a paymaster section).
    #[arg(long, env = "SA_EXEC_PAYMASTER_URL")]
    paymaster: Option<String>,

    /// Print a single JSON object to stdout; logs go to stderr.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct OwnerArgs {
    /// Smart account owner private key.
    ///
    /// Recommended: set via env var SA_EXEC_OWNER_PRIVATE_KEY.
    #[arg(long, env = "SA_EXEC_OWNER_PRIVATE_KEY")]
    owner_private_key: Option<String>,

    /// Account salt as hex bytes (passed to the factory as `data`).
    #[arg(long, default_value = "0x")]
    salt: String,
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    owner: OwnerArgs,

    /// Also ask the factory's getAddress view and fail on a mismatch.
    #[arg(long, default_value_t = false)]
    check_factory: bool,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    owner: OwnerArgs,

    /// A call as `to,value,data`. Value is decimal wei or 0x-hex; data may be empty.
    /// Repeat for a batch.
    #[arg(long = "call")]
    calls: Vec<String>,

    /// JSON file with an array of `{ "to", "value", "data" }` objects (hex encoded).
    #[arg(long)]
    calls_file: Option<PathBuf>,

    /// Pay gas from the account even if a paymaster is configured.
    #[arg(long, default_value_t = false)]
    no_sponsor: bool,

    /// Fall back to self-paid gas if the paymaster declines.
    #[arg(long, default_value_t = false)]
    allow_self_pay: bool,

    /// Explicit 192-bit nonce key (decimal or 0x-hex).
    #[arg(long)]
    nonce_key: Option<String>,

    /// Receipt timeout in seconds (overrides the config).
    #[arg(long)]
    timeout_seconds: Option<u64>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// userOpHash returned by `send`.
    #[arg(long)]
    hash: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::Send(args) => cmd_send(args).await,
        Command::Status(args) => cmd_status(args).await,
    }
}

fn load(common: &CommonArgs) -> Result<PipelineConfig> {
    load_config(
        &common.config,
        Overrides {
            rpc: common.rpc.clone(),
            bundler: common.bundler.clone(),
            paymaster: common.paymaster.clone(),
        },
    )
}

async fn connect(config: &PipelineConfig) -> Result<Arc<EthersChain<Provider<Http>>>> {
    let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
        .context("invalid rpc url")?
        .interval(Duration::from_millis(350));
    let chain = Arc::new(EthersChain::new(Arc::new(provider))?);

    let chain_id = chain.chain_id().await?;
    if chain_id != config.chain_id {
        return Err(anyhow!(
            "chainId mismatch: config has {}, RPC returned {}",
            config.chain_id,
            chain_id
        ));
    }
    Ok(chain)
}

fn load_owner(owner: &OwnerArgs, chain_id: u64) -> Result<LocalWallet> {
    let pk = owner
        .owner_private_key
        .clone()
        .ok_or_else(|| anyhow!("missing SA_EXEC_OWNER_PRIVATE_KEY (or --owner-private-key)"))?;
    let wallet = LocalWallet::from_str(&pk).context("invalid owner private key")?;
    Ok(wallet.with_chain_id(chain_id))
}

fn pipeline(
    config: &PipelineConfig,
    chain: Arc<EthersChain<Provider<Http>>>,
    signer: Arc<dyn SignatureProvider>,
) -> Pipeline {
    let bundler: Arc<dyn BundlerApi> = Arc::new(BundlerClient::new(config.bundler_url.clone()));
    let paymaster = config.paymaster.as_ref().map(|pm| {
        Arc::new(PaymasterClient::new(pm.url.clone(), pm.context.clone())) as Arc<dyn PaymasterApi>
    });
    Pipeline::new(config, chain, bundler, paymaster, signer)
}

fn account_ref(config: &PipelineConfig, owner: Address, salt: &str) -> Result<SmartAccountRef> {
    let salt = encoding::parse_bytes(salt).context("invalid --salt")?;
    Ok(SmartAccountRef::new(config.factory, owner, salt, config.chain_id))
}

async fn cmd_account(args: AccountArgs) -> Result<()> {
    let machine_mode = args.common.json;
    let config = load(&args.common)?;
    let chain = connect(&config).await?;
    let wallet = load_owner(&args.owner, config.chain_id)?;
    let owner = wallet.address();
    let account = account_ref(&config, owner, &args.owner.salt)?;

    let pipeline = pipeline(&config, chain.clone(), Arc::new(LocalWalletSigner::new(wallet)));
    let address = pipeline.compute_address(&account)?;
    let caps = pipeline.capabilities(&account).await?;

    if args.check_factory {
        let onchain = chain
            .factory_get_address(config.factory, owner, account.salt.clone())
            .await
            .context("factory.getAddress failed")?;
        if onchain != address {
            bail!(
                "counterfactual address mismatch: computed {}, factory returned {}",
                fmt_address(address),
                fmt_address(onchain)
            );
        }
        outln!(machine_mode, "factory getAddress matches the computed address");
    }

    if machine_mode {
        let out = serde_json::json!({
            "owner": fmt_address(owner),
            "smartAccount": fmt_address(address),
            "isDeployed": caps.deployed,
            "batchFlavor": caps.batch.to_string(),
        });
        println!("{}", out);
    }

    outln!(machine_mode, "chainId:        {}", config.chain_id);
    outln!(machine_mode, "entryPoint:     {}", fmt_address(config.entry_point));
    outln!(machine_mode, "factory:        {}", fmt_address(config.factory));
    outln!(machine_mode, "owner:          {}", fmt_address(owner));
    outln!(machine_mode, "smartAccount:   {}", fmt_address(address));
    outln!(machine_mode, "isDeployed:     {}", caps.deployed);
    outln!(machine_mode, "batchFlavor:    {}", caps.batch);

    Ok(())
}

async fn cmd_send(args: SendArgs) -> Result<()> {
    let machine_mode = args.common.json;
    let config = load(&args.common)?;
    let calls = collect_calls(&args)?;
    let chain = connect(&config).await?;
    let wallet = load_owner(&args.owner, config.chain_id)?;
    let account = account_ref(&config, wallet.address(), &args.owner.salt)?;
    let pipeline = pipeline(&config, chain, Arc::new(LocalWalletSigner::new(wallet)));

    let options = SendOptions {
        nonce_key: args.nonce_key.as_deref().map(parse_amount).transpose()?,
        sponsor: if args.no_sponsor { Some(false) } else { None },
        allow_self_pay: args.allow_self_pay.then_some(true),
        receipt_timeout: args.timeout_seconds.map(Duration::from_secs),
        cancel: None,
    };

    outln!(machine_mode, "smartAccount:   {}", fmt_address(pipeline.compute_address(&account)?));
    outln!(machine_mode, "calls:          {}", calls.len());

    match pipeline.send_calls(&account, &calls, options).await {
        Ok(receipt) => {
            if machine_mode {
                let out = serde_json::json!({
                    "userOpHash": fmt_h256(receipt.user_op_hash),
                    "transactionHash": fmt_h256(receipt.transaction_hash),
                    "success": receipt.success,
                    "actualGasUsed": fmt_u256(receipt.actual_gas_used),
                    "actualGasCost": fmt_u256(receipt.actual_gas_cost),
                    "revertReason": receipt.revert_reason,
                });
                println!("{}", out);
            }
            outln!(machine_mode, "userOpHash:     {}", fmt_h256(receipt.user_op_hash));
            outln!(machine_mode, "txHash:         {}", fmt_h256(receipt.transaction_hash));
            outln!(machine_mode, "success:        {}", receipt.success);
            outln!(machine_mode, "gasUsed:        {}", receipt.actual_gas_used);
            if let Some(reason) = &receipt.revert_reason {
                outln!(machine_mode, "revertReason:   {}", reason);
            }
            if !receipt.success {
                bail!("user operation was included but reverted");
            }
            Ok(())
        }
        Err(e) => {
            if let Some(h) = &e.handle {
                eprintln!(
                    "last userOpHash: {} (sender {}, nonce {}); it may still land, check with `sa-exec status`",
                    fmt_h256(h.user_op_hash),
                    fmt_address(h.sender),
                    h.nonce
                );
            }
            Err(anyhow!(e).context("send failed"))
        }
    }
}

async fn cmd_status(args: StatusArgs) -> Result<()> {
    let machine_mode = args.common.json;
    let config = load(&args.common)?;
    let hash = encoding::parse_h256(&args.hash).context("invalid --hash")?;

    let bundler = BundlerClient::new(config.bundler_url.clone());
    let found = bundler
        .get_user_operation_by_hash(hash)
        .await
        .context("eth_getUserOperationByHash failed")?;
    let receipt = bundler
        .get_user_operation_receipt(hash)
        .await
        .context("eth_getUserOperationReceipt failed")?;

    if machine_mode {
        let out = serde_json::json!({
            "userOpHash": fmt_h256(hash),
            "known": found.is_some(),
            "sender": found.as_ref().map(|f| fmt_address(f.user_operation.sender)),
            "nonce": found.as_ref().map(|f| fmt_u256(f.user_operation.nonce)),
            "included": receipt.is_some(),
            "success": receipt.as_ref().map(|r| r.success),
            "transactionHash": receipt.as_ref().map(|r| fmt_h256(r.transaction_hash)),
            "revertReason": receipt.as_ref().and_then(|r| r.revert_reason.clone()),
        });
        println!("{}", out);
    }

    outln!(machine_mode, "userOpHash:     {}", fmt_h256(hash));
    match &found {
        Some(f) => {
            outln!(machine_mode, "sender:         {}", fmt_address(f.user_operation.sender));
            outln!(machine_mode, "nonce:          {}", f.user_operation.nonce);
        }
        None => outln!(machine_mode, "bundler has no record of this operation"),
    }
    match &receipt {
        Some(r) => {
            outln!(machine_mode, "txHash:         {}", fmt_h256(r.transaction_hash));
            outln!(machine_mode, "success:        {}", r.success);
            if let Some(reason) = &r.revert_reason {
                outln!(machine_mode, "revertReason:   {}", reason);
            }
        }
        None => outln!(machine_mode, "not included yet"),
    }
    Ok(())
}

fn collect_calls(args: &SendArgs) -> Result<Vec<Call>> {
    let mut calls = Vec::new();
    if let Some(path) = &args.calls_file {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read calls file: {}", path.display()))?;
        let from_file: Vec<Call> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid calls JSON in {}", path.display()))?;
        calls.extend(from_file);
    }
    for raw in &args.calls {
        calls.push(parse_call(raw)?);
    }
    if calls.is_empty() {
        bail!("nothing to send: pass --call to,value,data or --calls-file");
    }
    Ok(calls)
}

fn parse_call(raw: &str) -> Result<Call> {
    let mut parts = raw.splitn(3, ',');
    let to = parts.next().unwrap_or_default().trim();
    let value = parts.next().unwrap_or("0").trim();
    let data = parts.next().unwrap_or("0x").trim();

    let to = Address::from_str(to).with_context(|| format!("invalid call target '{to}'"))?;
    let value = parse_amount(if value.is_empty() { "0" } else { value })?;
    let data = encoding::parse_bytes(data).with_context(|| format!("invalid call data in '{raw}'"))?;
    Ok(Call::new(to, value, data))
}

fn parse_amount(s: &str) -> Result<U256> {
    if s.starts_with("0x") {
        encoding::parse_u256_quantity(s)
    } else {
        U256::from_dec_str(s).with_context(|| format!("invalid decimal amount '{s}'"))
    }
}
