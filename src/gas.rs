use crate::bundler::BundlerApi;
use crate::chain::ChainReader;
use crate::error::ExecError;
use crate::race::first_success;
use crate::types::{FeeFields, GasFields, UserOperation};
use ethers::types::{Address, U256};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;

pub const BPS_DENOMINATOR: u32 = 10_000;

/// `value * bps / 10_000`, saturating.
pub fn scale_bps(value: U256, bps: u32) -> U256 {
    value.saturating_mul(U256::from(bps)) / U256::from(BPS_DENOMINATOR)
}

/// Raises both fee fields by at least `bump_bps`, and by at least 1 wei, so a
/// replacement is always strictly more expensive than what it replaces.
pub fn bump_fees(prev: &FeeFields, bump_bps: u32) -> FeeFields {
    let bump = |v: U256| {
        let next = scale_bps(v, BPS_DENOMINATOR.saturating_add(bump_bps));
        if next > v {
            next
        } else {
            v.saturating_add(U256::one())
        }
    };
    FeeFields {
        max_fee_per_gas: bump(prev.max_fee_per_gas),
        max_priority_fee_per_gas: bump(prev.max_priority_fee_per_gas),
    }
}

/// Gas limits from the bundler, fees from the chain's fee market.
pub struct GasEstimator {
    bundler: Arc<dyn BundlerApi>,
    chain: Arc<dyn ChainReader>,
    entry_point: Address,
    call_gas_multiplier_bps: u32,
    fee_multiplier_bps: u32,
}

impl GasEstimator {
    pub fn new(
        bundler: Arc<dyn BundlerApi>,
        chain: Arc<dyn ChainReader>,
        entry_point: Address,
        call_gas_multiplier_bps: u32,
        fee_multiplier_bps: u32,
    ) -> Self {
        Self {
            bundler,
            chain,
            entry_point,
            call_gas_multiplier_bps,
            fee_multiplier_bps,
        }
    }

    /// Bundler estimate with the safety margin applied to `callGasLimit` only.
    ///
    /// A simulation revert comes back as [`ExecError::SimulationReverted`].
    pub async fn estimate(&self, op: &UserOperation) -> Result<GasFields, ExecError> {
        let raw = self
            .bundler
            .estimate_user_operation_gas(op, self.entry_point)
            .await?;
        let gas = GasFields {
            call_gas_limit: scale_bps(raw.call_gas_limit, self.call_gas_multiplier_bps),
            ..raw
        };
        tracing::debug!(
            sender = ?op.sender,
            call_gas = %gas.call_gas_limit,
            verification_gas = %gas.verification_gas_limit,
            pre_verification_gas = %gas.pre_verification_gas,
            "gas estimated"
        );
        Ok(gas)
    }

    /// Current fees, never below `floor`.
    ///
    /// Fee history and `eth_gasPrice` are raced; the first to answer wins.
    pub async fn fees(&self, floor: Option<&FeeFields>) -> Result<FeeFields, ExecError> {
        let strategies: Vec<BoxFuture<'_, Result<FeeFields, ExecError>>> = vec![
            async move { self.chain.fee_history_fees().await }.boxed(),
            async move {
                let price = self.chain.gas_price().await?;
                Ok(FeeFields {
                    max_fee_per_gas: price,
                    max_priority_fee_per_gas: price,
                })
            }
            .boxed(),
        ];
        let market = match first_success(strategies).await {
            Some(r) => r?,
            None => return Err(ExecError::TransientNetwork("no fee strategy available".into())),
        };

        let mut fees = FeeFields {
            max_fee_per_gas: scale_bps(market.max_fee_per_gas, self.fee_multiplier_bps),
            max_priority_fee_per_gas: scale_bps(
                market.max_priority_fee_per_gas,
                self.fee_multiplier_bps,
            ),
        };
        if let Some(floor) = floor {
            fees.max_fee_per_gas = fees.max_fee_per_gas.max(floor.max_fee_per_gas);
            fees.max_priority_fee_per_gas = fees
                .max_priority_fee_per_gas
                .max(floor.max_priority_fee_per_gas);
        }
        fees.max_priority_fee_per_gas = fees.max_priority_fee_per_gas.min(fees.max_fee_per_gas);
        Ok(fees)
    }
}
