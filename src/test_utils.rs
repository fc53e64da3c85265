//! In-memory collaborators for unit tests.

use crate::account::BatchFlavor;
use crate::address::AccountBytecode;
use crate::bundler::{BundlerApi, UserOperationByHash};
use crate::chain::ChainReader;
use crate::config::{GasConfig, PaymasterConfig, PipelineConfig, ReceiptConfig};
use crate::error::{BundlerRejection, ExecError};
use crate::nonce::NoncePolicy;
use crate::paymaster::{PaymasterApi, PaymasterData, PaymasterDecline, Sponsorship, SponsorshipContext};
use crate::retry::RetryPolicy;
use crate::signer::SignatureProvider;
use crate::types::{FeeFields, GasFields, Receipt, UserOperation, SIGNATURE_LEN};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_CHAIN_ID: u64 = 84532;

/// Pipeline settings with the stock defaults, optionally with a paymaster.
pub fn test_config(with_paymaster: bool) -> PipelineConfig {
    PipelineConfig {
        chain_id: TEST_CHAIN_ID,
        rpc_url: "http://127.0.0.1:8545".into(),
        bundler_url: "http://127.0.0.1:4337".into(),
        entry_point: "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789"
            .parse()
            .unwrap(),
        factory: Address::repeat_byte(0xfa),
        account: AccountBytecode::MinimalProxy {
            implementation: Address::repeat_byte(0x11),
        },
        default_batch_flavor: BatchFlavor::WithValues,
        nonce_mode: NoncePolicy::Sequential,
        paymaster: with_paymaster.then(|| PaymasterConfig {
            url: "http://127.0.0.1:3000".into(),
            context: SponsorshipContext::default(),
            allow_self_pay_fallback: false,
            fee_token: None,
        }),
        gas: GasConfig {
            call_gas_multiplier_bps: 11_000,
            fee_multiplier_bps: 10_000,
            min_fee_bump_bps: 1_000,
        },
        retry: RetryPolicy::default(),
        receipt: ReceiptConfig {
            poll_interval: Duration::from_millis(1500),
            timeout: Duration::from_secs(120),
        },
        cache_capacity: 64,
    }
}

pub fn receipt_for(user_op_hash: H256, success: bool) -> Receipt {
    Receipt {
        user_op_hash,
        transaction_hash: H256::from_low_u64_be(user_op_hash.to_low_u64_be() ^ 0xface),
        success,
        actual_gas_used: 100_000.into(),
        actual_gas_cost: 1_000_000.into(),
        logs: vec![],
        revert_reason: if success {
            None
        } else {
            Some("InsufficientBalance".into())
        },
    }
}

#[derive(Default)]
struct ChainState {
    code: HashMap<Address, Bytes>,
    /// Sequence per (sender, key).
    nonces: HashMap<(Address, U256), U256>,
    fees: Option<FeeFields>,
    gas_price: Option<U256>,
    fee_history_down: bool,
    nonce_failures: u32,
    nonce_reads: u32,
}

#[derive(Default)]
pub struct FakeChain {
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn deploy(&self, address: Address, code: Bytes) {
        self.state.lock().code.insert(address, code);
    }

    pub fn is_deployed(&self, address: Address) -> bool {
        self.state.lock().code.contains_key(&address)
    }

    pub fn set_nonce(&self, sender: Address, seq: U256) {
        self.state.lock().nonces.insert((sender, U256::zero()), seq);
    }

    /// Marks `nonce` as used, as the EntryPoint does on inclusion.
    pub fn consume_nonce(&self, sender: Address, nonce: U256) {
        let key = nonce >> 64;
        let seq = nonce & U256::from(u64::MAX);
        let mut s = self.state.lock();
        let cur = s.nonces.entry((sender, key)).or_default();
        if seq >= *cur {
            *cur = seq + 1;
        }
    }

    pub fn set_fees(&self, fees: FeeFields) {
        self.state.lock().fees = Some(fees);
    }

    pub fn set_gas_price(&self, price: U256) {
        self.state.lock().gas_price = Some(price);
    }

    pub fn fail_fee_history(&self) {
        self.state.lock().fee_history_down = true;
    }

    pub fn fail_nonce_reads(&self, n: u32) {
        self.state.lock().nonce_failures = n;
    }

    pub fn nonce_reads(&self) -> u32 {
        self.state.lock().nonce_reads
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn get_code(&self, address: Address) -> Result<Bytes, ExecError> {
        Ok(self.state.lock().code.get(&address).cloned().unwrap_or_default())
    }

    async fn get_nonce(
        &self,
        _entry_point: Address,
        sender: Address,
        key: U256,
    ) -> Result<U256, ExecError> {
        let mut s = self.state.lock();
        s.nonce_reads += 1;
        if s.nonce_failures > 0 {
            s.nonce_failures -= 1;
            return Err(ExecError::TransientNetwork("rpc down".into()));
        }
        let seq = s.nonces.get(&(sender, key)).copied().unwrap_or_default();
        Ok((key << 64) | seq)
    }

    async fn fee_history_fees(&self) -> Result<FeeFields, ExecError> {
        let s = self.state.lock();
        if s.fee_history_down {
            return Err(ExecError::TransientNetwork("eth_feeHistory unsupported".into()));
        }
        Ok(s.fees.unwrap_or(FeeFields {
            max_fee_per_gas: 1_000.into(),
            max_priority_fee_per_gas: 100.into(),
        }))
    }

    async fn gas_price(&self) -> Result<U256, ExecError> {
        let s = self.state.lock();
        Ok(s.gas_price.unwrap_or_else(|| 900.into()))
    }
}

struct PendingReceipt {
    remaining_polls: Option<u32>,
    receipt: Receipt,
    op: Option<UserOperation>,
    included: bool,
}

struct BundlerState {
    gas: GasFields,
    estimate_error: Option<ExecError>,
    estimate_script: VecDeque<ExecError>,
    estimates: u32,
    send_script: VecDeque<ExecError>,
    send_always: Option<ExecError>,
    submissions: Vec<UserOperation>,
    accepted: Vec<(H256, UserOperation)>,
    land_delays: VecDeque<Option<u32>>,
    land_success: bool,
    receipts: HashMap<H256, PendingReceipt>,
    receipt_polls: u32,
}

impl Default for BundlerState {
    fn default() -> Self {
        Self {
            gas: GasFields {
                call_gas_limit: 50_000.into(),
                verification_gas_limit: 150_000.into(),
                pre_verification_gas: 45_000.into(),
            },
            estimate_error: None,
            estimate_script: VecDeque::new(),
            estimates: 0,
            send_script: VecDeque::new(),
            send_always: None,
            submissions: Vec::new(),
            accepted: Vec::new(),
            land_delays: VecDeque::new(),
            land_success: true,
            receipts: HashMap::new(),
            receipt_polls: 0,
        }
    }
}

/// Bundler that accepts everything unless scripted otherwise. Accepted ops
/// land after one receipt poll by default; landing deploys the account and
/// consumes the nonce on the attached [`FakeChain`]. A scripted `NonceTooLow`
/// consumes the nonce too, as if a competing operation had landed.
#[derive(Default)]
pub struct FakeBundler {
    chain: Option<Arc<FakeChain>>,
    state: Mutex<BundlerState>,
}

impl FakeBundler {
    pub fn with_chain(chain: Arc<FakeChain>) -> Self {
        Self {
            chain: Some(chain),
            state: Mutex::default(),
        }
    }

    pub fn set_gas(&self, gas: GasFields) {
        self.state.lock().gas = gas;
    }

    pub fn set_estimate_error(&self, err: ExecError) {
        self.state.lock().estimate_error = Some(err);
    }

    /// The next estimates fail with these errors, in order.
    pub fn script_estimate_errors(&self, errors: impl IntoIterator<Item = ExecError>) {
        self.state.lock().estimate_script.extend(errors);
    }

    /// The next sends fail with these errors, in order.
    pub fn script_send_errors(&self, errors: impl IntoIterator<Item = ExecError>) {
        self.state.lock().send_script.extend(errors);
    }

    pub fn always_reject(&self, err: ExecError) {
        self.state.lock().send_always = Some(err);
    }

    /// Landing delay (in polls) for the next accepted ops; `None` never lands.
    pub fn script_land_delays(&self, delays: impl IntoIterator<Item = Option<u32>>) {
        self.state.lock().land_delays.extend(delays);
    }

    pub fn land_reverted(&self) {
        self.state.lock().land_success = false;
    }

    pub fn land_after_polls(&self, hash: H256, polls: u32, receipt: Receipt) {
        self.state.lock().receipts.insert(
            hash,
            PendingReceipt {
                remaining_polls: Some(polls),
                receipt,
                op: None,
                included: false,
            },
        );
    }

    fn on_rejection<T>(&self, op: &UserOperation, res: &Result<T, ExecError>) {
        if let (Err(e), Some(chain)) = (res, &self.chain) {
            if e.rejection() == Some(BundlerRejection::NonceTooLow) {
                chain.consume_nonce(op.sender, op.nonce);
            }
        }
    }

    pub fn estimates(&self) -> u32 {
        self.state.lock().estimates
    }

    /// Every op passed to `eth_sendUserOperation`, accepted or not.
    pub fn submissions(&self) -> Vec<UserOperation> {
        self.state.lock().submissions.clone()
    }

    pub fn accepted(&self) -> Vec<(H256, UserOperation)> {
        self.state.lock().accepted.clone()
    }

    pub fn receipt_polls(&self) -> u32 {
        self.state.lock().receipt_polls
    }
}

#[async_trait]
impl BundlerApi for FakeBundler {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        _entry_point: Address,
    ) -> Result<GasFields, ExecError> {
        let res = {
            let mut s = self.state.lock();
            s.estimates += 1;
            let scripted = s.estimate_script.pop_front();
            match scripted.or_else(|| s.estimate_error.clone()) {
                Some(e) => Err(e),
                None => Ok(s.gas),
            }
        };
        self.on_rejection(op, &res);
        res
    }

    async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<H256, ExecError> {
        let rejected = {
            let mut s = self.state.lock();
            s.submissions.push(op.clone());
            let scripted = s.send_script.pop_front();
            scripted.or_else(|| s.send_always.clone())
        };
        if let Some(e) = rejected {
            let res: Result<H256, ExecError> = Err(e);
            self.on_rejection(op, &res);
            return res;
        }
        let mut s = self.state.lock();
        let hash = op.hash(entry_point, TEST_CHAIN_ID);
        s.accepted.push((hash, op.clone()));
        let delay = s.land_delays.pop_front().unwrap_or(Some(1));
        let success = s.land_success;
        s.receipts.insert(
            hash,
            PendingReceipt {
                remaining_polls: delay,
                receipt: receipt_for(hash, success),
                op: Some(op.clone()),
                included: false,
            },
        );
        Ok(hash)
    }

    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<Receipt>, ExecError> {
        let landed = {
            let mut s = self.state.lock();
            s.receipt_polls += 1;
            let Some(p) = s.receipts.get_mut(&user_op_hash) else {
                return Ok(None);
            };
            match p.remaining_polls {
                None => return Ok(None),
                Some(n) if n > 1 => {
                    p.remaining_polls = Some(n - 1);
                    return Ok(None);
                }
                Some(_) => {}
            }
            let first = !p.included;
            p.included = true;
            (p.receipt.clone(), if first { p.op.clone() } else { None })
        };

        let (receipt, newly_included) = landed;
        if let (Some(op), Some(chain)) = (newly_included, &self.chain) {
            if op.has_init_code() {
                chain.deploy(op.sender, Bytes::from(vec![0x60, 0x80, 0x60, 0x40, 0x52]));
            }
            chain.consume_nonce(op.sender, op.nonce);
            // the other candidates for this nonce can no longer land
            let mut s = self.state.lock();
            s.receipts.retain(|h, p| {
                *h == user_op_hash
                    || p.op
                        .as_ref()
                        .map_or(true, |o| o.sender != op.sender || o.nonce != op.nonce)
            });
        }
        Ok(Some(receipt))
    }

    async fn get_user_operation_by_hash(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationByHash>, ExecError> {
        let s = self.state.lock();
        Ok(s.accepted
            .iter()
            .find(|(h, _)| *h == user_op_hash)
            .map(|(_, op)| UserOperationByHash {
                user_operation: op.clone(),
                entry_point: Address::zero(),
                block_number: None,
                transaction_hash: None,
            }))
    }
}

struct PaymasterState {
    stub: Result<Sponsorship, ExecError>,
    final_: Result<Sponsorship, ExecError>,
    stub_calls: u32,
    final_calls: u32,
    last_final_op: Option<UserOperation>,
}

/// Approves everything with a 20-byte `paymasterAndData` unless told otherwise.
pub struct FakePaymaster {
    state: Mutex<PaymasterState>,
}

impl Default for FakePaymaster {
    fn default() -> Self {
        let data = PaymasterData::new(Bytes::from(vec![0x9a; 20]));
        Self {
            state: Mutex::new(PaymasterState {
                stub: Ok(Sponsorship::Approved(data.clone())),
                final_: Ok(Sponsorship::Approved(PaymasterData::new(Bytes::from(
                    vec![0x9b; 85],
                )))),
                stub_calls: 0,
                final_calls: 0,
                last_final_op: None,
            }),
        }
    }
}

impl FakePaymaster {
    pub fn declining(code: &str, reason: &str) -> Self {
        let pm = Self::default();
        pm.set_stub(Ok(Sponsorship::Declined(PaymasterDecline {
            code: code.into(),
            reason: reason.into(),
        })));
        pm
    }

    pub fn set_stub(&self, r: Result<Sponsorship, ExecError>) {
        self.state.lock().stub = r;
    }

    pub fn set_final(&self, r: Result<Sponsorship, ExecError>) {
        self.state.lock().final_ = r;
    }

    pub fn stub_calls(&self) -> u32 {
        self.state.lock().stub_calls
    }

    pub fn final_calls(&self) -> u32 {
        self.state.lock().final_calls
    }

    pub fn last_final_op(&self) -> Option<UserOperation> {
        self.state.lock().last_final_op.clone()
    }
}

#[async_trait]
impl PaymasterApi for FakePaymaster {
    async fn stub_data(
        &self,
        _op: &UserOperation,
        _entry_point: Address,
        _chain_id: u64,
    ) -> Result<Sponsorship, ExecError> {
        let mut s = self.state.lock();
        s.stub_calls += 1;
        s.stub.clone()
    }

    async fn final_data(
        &self,
        op: &UserOperation,
        _entry_point: Address,
        _chain_id: u64,
    ) -> Result<Sponsorship, ExecError> {
        let mut s = self.state.lock();
        s.final_calls += 1;
        s.last_final_op = Some(op.clone());
        s.final_.clone()
    }
}

/// Deterministic 65-byte "signature" derived from the hash.
#[derive(Default)]
pub struct FakeSigner {
    calls: Mutex<Vec<H256>>,
    fail: Mutex<bool>,
}

impl FakeSigner {
    pub fn failing() -> Self {
        let s = Self::default();
        *s.fail.lock() = true;
        s
    }

    pub fn sign_calls(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl SignatureProvider for FakeSigner {
    async fn sign(&self, user_op_hash: H256) -> Result<Bytes, ExecError> {
        if *self.fail.lock() {
            return Err(ExecError::Signing("device unplugged".into()));
        }
        self.calls.lock().push(user_op_hash);
        let mut sig = Vec::with_capacity(SIGNATURE_LEN);
        sig.extend_from_slice(user_op_hash.as_bytes());
        sig.extend_from_slice(user_op_hash.as_bytes());
        sig.push(0x1b);
        Ok(Bytes::from(sig))
    }
}
