use crate::account::{self, AccountCapabilities, BatchFlavor};
use crate::address::AddressComputer;
use crate::builder::{finalize, placeholder_signature, UserOperationBuilder};
use crate::bundler::{BundlerApi, BundlerClient};
use crate::chain::{ChainReader, EthersChain};
use crate::config::{FeeTokenConfig, PipelineConfig};
use crate::error::{BundlerRejection, ExecError, SendError};
use crate::gas::{bump_fees, GasEstimator};
use crate::nonce::NonceSource;
use crate::paymaster::{apply_sponsorship, PaymasterApi, PaymasterClient, PaymasterData, Sponsorship};
use crate::receipt::ReceiptWatcher;
use crate::retry::{retry_transient, RetryPolicy};
use crate::signer::SignatureProvider;
use crate::types::{Call, FeeFields, OperationHandle, Receipt, SmartAccountRef, UserOperation};
use ethers::providers::{Http, Provider};
use ethers::types::{Address, Bytes, H256, U256};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lifecycle of one `send_calls` invocation.
///
/// `Submitting -> Building` on a retryable rejection is an edge, not a state.
/// `Replaced` is passed through when a cancel or speed-up supersedes the
/// pending operation; callers only ever see `Confirmed` or `Failed` at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Building,
    Estimating,
    Sponsoring,
    Signing,
    Submitting,
    Pending,
    Confirmed,
    Failed,
    Replaced,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Confirmed | BatchState::Failed)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchState::Building => "building",
            BatchState::Estimating => "estimating",
            BatchState::Sponsoring => "sponsoring",
            BatchState::Signing => "signing",
            BatchState::Submitting => "submitting",
            BatchState::Pending => "pending",
            BatchState::Confirmed => "confirmed",
            BatchState::Failed => "failed",
            BatchState::Replaced => "replaced",
        };
        f.write_str(s)
    }
}

/// Per-send knobs. Unset fields fall back to the pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Nonce key; defaults per the configured nonce mode.
    pub nonce_key: Option<U256>,
    /// Ask the paymaster to sponsor gas. Defaults to "if one is configured".
    pub sponsor: Option<bool>,
    /// Pay gas from the account when the paymaster declines.
    pub allow_self_pay: Option<bool>,
    pub receipt_timeout: Option<Duration>,
    /// Stops local receipt polling. The operation itself is unaffected.
    pub cancel: Option<CancellationToken>,
}

/// In-memory record of one send, owned by its orchestrator.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    pub calls: Vec<Call>,
    pub account: SmartAccountRef,
    pub state: BatchState,
    pub last_error: Option<ExecError>,
    /// Build-and-submit attempts so far, including ones that failed before
    /// reaching the bundler.
    pub attempts: u32,
    pub handle: Option<OperationHandle>,
    /// Handles superseded by replacements. Any of them may still land.
    pub replaced: Vec<OperationHandle>,
    submitted: Option<UserOperation>,
    cancellations: Vec<H256>,
}

impl PendingBatch {
    fn new(account: SmartAccountRef, calls: Vec<Call>) -> Self {
        Self {
            calls,
            account,
            state: BatchState::Building,
            last_error: None,
            attempts: 0,
            handle: None,
            replaced: Vec::new(),
            submitted: None,
            cancellations: Vec::new(),
        }
    }

    fn set_state(&mut self, next: BatchState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, attempt = self.attempts, "batch state");
            self.state = next;
        }
    }

    fn candidates(&self) -> Vec<OperationHandle> {
        self.handle
            .iter()
            .chain(self.replaced.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
struct Settings {
    entry_point: Address,
    chain_id: u64,
    retry: RetryPolicy,
    min_fee_bump_bps: u32,
    receipt_timeout: Duration,
    sponsor_by_default: bool,
    allow_self_pay: bool,
    fee_token: Option<FeeTokenConfig>,
}

struct Shared {
    settings: Settings,
    bundler: Arc<dyn BundlerApi>,
    paymaster: Option<Arc<dyn PaymasterApi>>,
    signer: Arc<dyn SignatureProvider>,
    addresses: Arc<AddressComputer>,
    builder: UserOperationBuilder,
    gas: GasEstimator,
    nonces: NonceSource,
    watcher: ReceiptWatcher,
}

/// The wired-up pipeline. Cheap to clone; holds only stateless clients and
/// bounded memo caches, so one instance can serve any number of concurrent
/// sends.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        chain: Arc<dyn ChainReader>,
        bundler: Arc<dyn BundlerApi>,
        paymaster: Option<Arc<dyn PaymasterApi>>,
        signer: Arc<dyn SignatureProvider>,
    ) -> Self {
        let addresses = Arc::new(AddressComputer::new(config.account, config.cache_capacity));
        let builder = UserOperationBuilder::new(
            chain.clone(),
            addresses.clone(),
            config.default_batch_flavor,
            config.cache_capacity,
        );
        let gas = GasEstimator::new(
            bundler.clone(),
            chain.clone(),
            config.entry_point,
            config.gas.call_gas_multiplier_bps,
            config.gas.fee_multiplier_bps,
        );
        let nonces = NonceSource::new(chain, config.entry_point, config.nonce_mode);
        let watcher = ReceiptWatcher::new(bundler.clone(), config.receipt.poll_interval);
        let pm = config.paymaster.as_ref();

        Self {
            shared: Arc::new(Shared {
                settings: Settings {
                    entry_point: config.entry_point,
                    chain_id: config.chain_id,
                    retry: config.retry,
                    min_fee_bump_bps: config.gas.min_fee_bump_bps,
                    receipt_timeout: config.receipt.timeout,
                    sponsor_by_default: paymaster.is_some(),
                    allow_self_pay: pm.is_some_and(|p| p.allow_self_pay_fallback),
                    fee_token: pm.and_then(|p| p.fee_token.clone()),
                },
                bundler,
                paymaster,
                signer,
                addresses,
                builder,
                gas,
                nonces,
                watcher,
            }),
        }
    }

    /// Wires the HTTP clients named in `config`.
    pub fn from_config(
        config: &PipelineConfig,
        signer: Arc<dyn SignatureProvider>,
    ) -> Result<Self, ExecError> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| ExecError::InvalidInput(format!("invalid rpc url: {e}")))?
            .interval(Duration::from_millis(350));
        let chain: Arc<dyn ChainReader> = Arc::new(EthersChain::new(Arc::new(provider))?);
        let bundler: Arc<dyn BundlerApi> = Arc::new(BundlerClient::new(config.bundler_url.clone()));
        let paymaster = config.paymaster.as_ref().map(|pm| {
            Arc::new(PaymasterClient::new(pm.url.clone(), pm.context.clone())) as Arc<dyn PaymasterApi>
        });
        Ok(Self::new(config, chain, bundler, paymaster, signer))
    }

    /// A fresh orchestrator for exactly one `send_calls`.
    pub fn orchestrator(&self) -> ExecutionOrchestrator {
        ExecutionOrchestrator {
            shared: self.shared.clone(),
            batch: Mutex::new(None),
        }
    }

    pub async fn send_calls(
        &self,
        account: &SmartAccountRef,
        calls: &[Call],
        options: SendOptions,
    ) -> Result<Receipt, SendError> {
        self.orchestrator().send_calls(account, calls, options).await
    }

    pub fn compute_address(&self, account: &SmartAccountRef) -> Result<Address, ExecError> {
        self.shared.addresses.compute_address(account)
    }

    pub async fn capabilities(
        &self,
        account: &SmartAccountRef,
    ) -> Result<AccountCapabilities, ExecError> {
        let sender = self.compute_address(account)?;
        self.shared.builder.capabilities(sender).await
    }

    pub fn user_op_hash(&self, op: &UserOperation) -> H256 {
        op.hash(self.shared.settings.entry_point, self.shared.settings.chain_id)
    }

    /// Receipt for an operation rebuilt after a restart, keyed by its
    /// recomputed hash. `None` if the bundler has no record of it landing.
    pub async fn recover(&self, op: &UserOperation) -> Result<Option<Receipt>, ExecError> {
        let hash = self.user_op_hash(op);
        tracing::info!(user_op_hash = ?hash, sender = ?op.sender, nonce = %op.nonce, "recovering operation");
        retry_transient(&self.shared.settings.retry, "receipt", || {
            self.shared.bundler.get_user_operation_receipt(hash)
        })
        .await
    }

    /// Rebuilds a handle from the bundler's record of `user_op_hash`.
    ///
    /// The original submission time is unknown, so `submitted_at` is 0.
    pub async fn lookup(&self, user_op_hash: H256) -> Result<Option<OperationHandle>, ExecError> {
        let found = retry_transient(&self.shared.settings.retry, "lookup", || {
            self.shared.bundler.get_user_operation_by_hash(user_op_hash)
        })
        .await?;
        Ok(found.map(|r| OperationHandle {
            user_op_hash,
            sender: r.user_operation.sender,
            nonce: r.user_operation.nonce,
            submitted_at: 0,
        }))
    }

    /// A single receipt poll.
    pub async fn get_receipt(&self, handle: &OperationHandle) -> Result<Option<Receipt>, ExecError> {
        self.shared.bundler.get_receipt(handle).await
    }
}

/// Drives one send through the state machine.
///
/// `send_calls` may be called once. `cancel` and `speed_up` are meant to be
/// called from another task while `send_calls` is waiting for the receipt.
pub struct ExecutionOrchestrator {
    shared: Arc<Shared>,
    batch: Mutex<Option<PendingBatch>>,
}

impl ExecutionOrchestrator {
    pub async fn send_calls(
        &self,
        account: &SmartAccountRef,
        calls: &[Call],
        options: SendOptions,
    ) -> Result<Receipt, SendError> {
        {
            let mut batch = self.batch.lock();
            if batch.is_some() {
                return Err(SendError::new(
                    ExecError::InvalidInput("orchestrator already used; create one per send".into()),
                    None,
                ));
            }
            *batch = Some(PendingBatch::new(account.clone(), calls.to_vec()));
        }

        let result = self.run(account, calls, &options).await;

        let mut guard = self.batch.lock();
        let Some(batch) = guard.as_mut() else {
            return result.map_err(|e| SendError::new(e, None));
        };
        match result {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                batch.set_state(BatchState::Failed);
                batch.last_error = Some(e.clone());
                tracing::warn!(
                    sender = ?batch.handle.as_ref().map(|h| h.sender),
                    attempts = batch.attempts,
                    error = %e,
                    "send failed"
                );
                Err(SendError::new(e, batch.handle.clone()))
            }
        }
    }

    /// The handle of the operation currently awaiting inclusion.
    pub fn get_pending_handle(&self) -> Option<OperationHandle> {
        self.batch.lock().as_ref().and_then(|b| b.handle.clone())
    }

    pub fn state(&self) -> Option<BatchState> {
        self.batch.lock().as_ref().map(|b| b.state)
    }

    pub fn batch(&self) -> Option<PendingBatch> {
        self.batch.lock().clone()
    }

    /// Replaces the pending operation with a no-op self-call at the same
    /// nonce. If the replacement lands, `send_calls` fails with
    /// [`ExecError::Cancelled`].
    pub async fn cancel(&self, handle: &OperationHandle) -> Result<OperationHandle, ExecError> {
        self.replace(handle, true).await
    }

    /// Resubmits the pending operation at the same nonce with higher fees.
    pub async fn speed_up(&self, handle: &OperationHandle) -> Result<OperationHandle, ExecError> {
        self.replace(handle, false).await
    }

    fn transition(&self, next: BatchState) {
        if let Some(b) = self.batch.lock().as_mut() {
            b.set_state(next);
        }
    }

    fn update(&self, f: impl FnOnce(&mut PendingBatch)) {
        if let Some(b) = self.batch.lock().as_mut() {
            f(b);
        }
    }

    fn candidates(&self) -> Vec<OperationHandle> {
        self.batch
            .lock()
            .as_ref()
            .map(PendingBatch::candidates)
            .unwrap_or_default()
    }

    async fn run(
        &self,
        account: &SmartAccountRef,
        calls: &[Call],
        options: &SendOptions,
    ) -> Result<Receipt, ExecError> {
        let s = &self.shared;
        if calls.is_empty() {
            return Err(ExecError::InvalidInput("a send needs at least one call".into()));
        }
        if account.chain_id != s.settings.chain_id {
            return Err(ExecError::InvalidInput(format!(
                "account is on chain {} but the pipeline targets chain {}",
                account.chain_id, s.settings.chain_id
            )));
        }
        let sender = s.addresses.compute_address(account)?;
        let key = s.nonces.choose_key(options.nonce_key);

        let mut sponsored = options.sponsor.unwrap_or(s.settings.sponsor_by_default);
        if sponsored && s.paymaster.is_none() {
            return Err(ExecError::InvalidInput(
                "sponsorship requested but no paymaster is configured".into(),
            ));
        }
        let allow_self_pay = options.allow_self_pay.unwrap_or(s.settings.allow_self_pay);
        let policy = s.settings.retry;

        let mut nonce = self.fetch_nonce(sender, key).await?;
        let mut fee_floor: Option<FeeFields> = None;
        // InvalidSignature and EntrypointSimulation get one rebuild each
        let mut resigned = false;
        let mut resimulated = false;
        let mut attempt = 0u32;

        let handle = loop {
            attempt += 1;
            self.update(|b| b.attempts = attempt);

            let mut submitted_fees: Option<FeeFields> = None;
            let outcome = match self
                .prepare(account, calls, nonce, fee_floor.as_ref(), &mut sponsored, allow_self_pay)
                .await
            {
                Ok(op) => {
                    let signed = self.sign(&op).await?;
                    submitted_fees = Some(signed.fees());
                    self.transition(BatchState::Submitting);
                    s.bundler
                        .submit(&signed, s.settings.entry_point)
                        .await
                        .map(|handle| (handle, signed))
                }
                // the nonce was taken between the read and simulation
                Err(e) if e.rejection() == Some(BundlerRejection::NonceTooLow) => Err(e),
                Err(e) => return Err(e),
            };

            match outcome {
                Ok((handle, signed)) => {
                    self.update(|b| {
                        b.handle = Some(handle.clone());
                        b.submitted = Some(signed.clone());
                        b.set_state(BatchState::Pending);
                    });
                    tracing::info!(
                        user_op_hash = ?handle.user_op_hash,
                        sender = ?sender,
                        nonce = %signed.nonce,
                        attempt,
                        sponsored,
                        "user operation accepted by bundler"
                    );
                    break handle;
                }
                Err(e) => {
                    self.update(|b| b.last_error = Some(e.clone()));
                    let rejection = e.rejection();
                    match rejection {
                        Some(BundlerRejection::Underpriced) => {
                            if let Some(fees) = &submitted_fees {
                                fee_floor = Some(bump_fees(fees, s.settings.min_fee_bump_bps));
                            }
                        }
                        Some(BundlerRejection::NonceTooLow) => {}
                        Some(BundlerRejection::InvalidSignature) if !resigned => resigned = true,
                        Some(BundlerRejection::EntrypointSimulation) if !resimulated => {
                            resimulated = true
                        }
                        _ if matches!(e, ExecError::TransientNetwork(_)) => {}
                        _ => return Err(e),
                    }
                    if attempt >= policy.max_attempts {
                        tracing::warn!(attempt, error = %e, "retry budget exhausted");
                        return Err(e);
                    }
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt rejected; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if rejection == Some(BundlerRejection::NonceTooLow) {
                        nonce = self.fetch_nonce(sender, key).await?;
                    }
                }
            }
        };

        let cancel = options.cancel.clone().unwrap_or_default();
        let timeout = options.receipt_timeout.unwrap_or(s.settings.receipt_timeout);
        let receipt = s
            .watcher
            .wait_until(|| self.candidates(), timeout, &cancel)
            .await?;

        let mut guard = self.batch.lock();
        let Some(batch) = guard.as_mut() else {
            return Ok(receipt);
        };
        if let Some(landed) = batch
            .candidates()
            .into_iter()
            .find(|h| h.user_op_hash == receipt.user_op_hash)
        {
            batch.handle = Some(landed);
        }
        if batch.cancellations.contains(&receipt.user_op_hash) {
            tracing::info!(user_op_hash = ?receipt.user_op_hash, "cancellation landed");
            return Err(ExecError::Cancelled);
        }
        if receipt.success {
            batch.set_state(BatchState::Confirmed);
            tracing::info!(
                user_op_hash = ?receipt.user_op_hash,
                tx_hash = ?receipt.transaction_hash,
                gas_used = %receipt.actual_gas_used,
                original = ?handle.user_op_hash,
                "batch confirmed"
            );
        } else {
            batch.set_state(BatchState::Failed);
            tracing::warn!(
                user_op_hash = ?receipt.user_op_hash,
                tx_hash = ?receipt.transaction_hash,
                reason = receipt.revert_reason.as_deref().unwrap_or("<none>"),
                "batch reverted on-chain"
            );
        }
        Ok(receipt)
    }

    async fn fetch_nonce(&self, sender: Address, key: U256) -> Result<U256, ExecError> {
        let s = &self.shared;
        retry_transient(&s.settings.retry, "nonce", || s.nonces.next_nonce(sender, key)).await
    }

    fn calls_for(&self, calls: &[Call], sponsored: bool) -> Vec<Call> {
        match (&self.shared.settings.fee_token, sponsored) {
            (Some(ft), true) => std::iter::once(account::approve_call(ft.token, ft.spender, ft.allowance))
                .chain(calls.iter().cloned())
                .collect(),
            _ => calls.to_vec(),
        }
    }

    /// Building -> Estimating -> Sponsoring. Returns an unsigned operation
    /// with final gas, fee and paymaster fields.
    ///
    /// A decline with self-pay allowed clears `sponsored` and starts over.
    async fn prepare(
        &self,
        account: &SmartAccountRef,
        calls: &[Call],
        nonce: U256,
        fee_floor: Option<&FeeFields>,
        sponsored: &mut bool,
        allow_self_pay: bool,
    ) -> Result<UserOperation, ExecError> {
        let s = &self.shared;
        let policy = &s.settings.retry;
        loop {
            self.transition(BatchState::Building);
            let calls = self.calls_for(calls, *sponsored);
            let mut op = retry_transient(policy, "build", || {
                s.builder.build(account, &calls, nonce, None, None)
            })
            .await?;
            let fees = retry_transient(policy, "fees", || s.gas.fees(fee_floor)).await?;
            op.apply_fees(&fees);

            let mut stub_is_final = false;
            if *sponsored {
                match self.sponsorship(&op, true, allow_self_pay).await? {
                    Some(stub) => {
                        stub_is_final = stub.is_final;
                        op = apply_sponsorship(&op, &stub)?;
                    }
                    None => {
                        *sponsored = false;
                        continue;
                    }
                }
            }

            self.transition(BatchState::Estimating);
            let gas = retry_transient(policy, "estimate", || s.gas.estimate(&op)).await?;
            op.apply_gas(&gas);

            if *sponsored && !stub_is_final {
                self.transition(BatchState::Sponsoring);
                match self.sponsorship(&op, false, allow_self_pay).await? {
                    Some(data) => op = apply_sponsorship(&op, &data)?,
                    None => {
                        *sponsored = false;
                        continue;
                    }
                }
            }
            return Ok(op);
        }
    }

    /// `Ok(None)` means declined with self-pay allowed.
    async fn sponsorship(
        &self,
        op: &UserOperation,
        stub: bool,
        allow_self_pay: bool,
    ) -> Result<Option<PaymasterData>, ExecError> {
        let s = &self.shared;
        let pm = s.paymaster.as_ref().ok_or_else(|| {
            ExecError::InvalidInput("sponsorship requested but no paymaster is configured".into())
        })?;
        let (ep, chain_id) = (s.settings.entry_point, s.settings.chain_id);
        let what = if stub { "paymaster stub" } else { "paymaster data" };
        let res = retry_transient(&s.settings.retry, what, || async move {
            if stub {
                pm.stub_data(op, ep, chain_id).await
            } else {
                pm.final_data(op, ep, chain_id).await
            }
        })
        .await?;

        match res {
            Sponsorship::Approved(data) => Ok(Some(data)),
            Sponsorship::Declined(d) if allow_self_pay => {
                tracing::warn!(code = %d.code, reason = %d.reason, "sponsorship declined; falling back to self-paid gas");
                Ok(None)
            }
            Sponsorship::Declined(d) => Err(d.into()),
        }
    }

    async fn sign(&self, op: &UserOperation) -> Result<UserOperation, ExecError> {
        self.transition(BatchState::Signing);
        let s = &self.shared;
        let hash = op.hash(s.settings.entry_point, s.settings.chain_id);
        let sig = s.signer.sign(hash).await?;
        Ok(finalize(op, sig))
    }

    async fn replace(
        &self,
        handle: &OperationHandle,
        cancel: bool,
    ) -> Result<OperationHandle, ExecError> {
        let prev = {
            let guard = self.batch.lock();
            let batch = guard
                .as_ref()
                .ok_or_else(|| ExecError::InvalidInput("nothing has been sent".into()))?;
            if batch.state != BatchState::Pending {
                return Err(ExecError::InvalidInput(format!(
                    "cannot replace a batch that is {}",
                    batch.state
                )));
            }
            if batch.handle.as_ref().map(|h| h.user_op_hash) != Some(handle.user_op_hash) {
                return Err(ExecError::InvalidInput(
                    "handle is not the pending operation".into(),
                ));
            }
            batch
                .submitted
                .clone()
                .ok_or_else(|| ExecError::InvalidInput("no submitted operation".into()))?
        };

        let s = &self.shared;
        let policy = &s.settings.retry;
        let floor = bump_fees(&prev.fees(), s.settings.min_fee_bump_bps);
        let fees = retry_transient(policy, "fees", || s.gas.fees(Some(&floor))).await?;

        let mut op = UserOperation {
            signature: placeholder_signature(),
            ..prev
        };
        op.apply_fees(&fees);
        if cancel {
            let noop = Call::new(op.sender, U256::zero(), Bytes::default());
            op.call_data = account::encode_calls(&[noop], BatchFlavor::WithValues)?;
        }
        if !op.paymaster_and_data.is_empty() {
            // sponsorship signatures cover fees and callData
            match self.sponsorship(&op, false, false).await? {
                Some(data) => op = apply_sponsorship(&op, &data)?,
                None => {
                    return Err(ExecError::InvalidInput(
                        "paymaster declined the replacement".into(),
                    ))
                }
            }
        }

        let hash = op.hash(s.settings.entry_point, s.settings.chain_id);
        let signed = finalize(&op, s.signer.sign(hash).await?);
        let new_handle = retry_transient(policy, "replacement", || {
            s.bundler.submit(&signed, s.settings.entry_point)
        })
        .await?;

        let mut guard = self.batch.lock();
        if let Some(batch) = guard.as_mut() {
            if batch.state == BatchState::Pending {
                batch.set_state(BatchState::Replaced);
                if let Some(old) = batch.handle.replace(new_handle.clone()) {
                    batch.replaced.push(old);
                }
                if cancel {
                    batch.cancellations.push(new_handle.user_op_hash);
                }
                batch.submitted = Some(signed.clone());
                batch.set_state(BatchState::Pending);
            }
        }
        tracing::info!(
            old = ?handle.user_op_hash,
            new = ?new_handle.user_op_hash,
            nonce = %signed.nonce,
            max_fee = %signed.max_fee_per_gas,
            cancel,
            "pending operation replaced"
        );
        Ok(new_handle)
    }
}
