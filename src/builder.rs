use crate::account::{self, detect_batch_flavor, AccountCapabilities, BatchFlavor};
use crate::address::AddressComputer;
use crate::chain::ChainReader;
use crate::error::ExecError;
use crate::paymaster::{apply_sponsorship, PaymasterData};
use crate::types::{Call, GasFields, SmartAccountRef, UserOperation, SIGNATURE_LEN};
use ethers::types::{Address, Bytes, U256};
use parking_lot::Mutex;
use schnellru::{ByLength, LruMap};
use std::sync::Arc;

/// Signature placeholder used until the real one is attached. Same length as
/// an ECDSA signature so `verificationGasLimit` estimates match.
pub fn placeholder_signature() -> Bytes {
    Bytes::from(vec![0u8; SIGNATURE_LEN])
}

/// Assembles unsigned user operations.
pub struct UserOperationBuilder {
    chain: Arc<dyn ChainReader>,
    addresses: Arc<AddressComputer>,
    default_flavor: BatchFlavor,
    /// Capability tags of deployed accounts. Undeployed ones are never cached
    /// since their code (and so their tag) is about to change.
    capabilities: Mutex<LruMap<Address, BatchFlavor>>,
}

impl UserOperationBuilder {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        addresses: Arc<AddressComputer>,
        default_flavor: BatchFlavor,
        cache_capacity: u32,
    ) -> Self {
        Self {
            chain,
            addresses,
            default_flavor,
            capabilities: Mutex::new(LruMap::new(ByLength::new(cache_capacity.max(1)))),
        }
    }

    /// Probes the account's code and resolves its capability tags.
    pub async fn capabilities(&self, sender: Address) -> Result<AccountCapabilities, ExecError> {
        let code = self.chain.get_code(sender).await?;
        if code.is_empty() {
            return Ok(AccountCapabilities {
                deployed: false,
                batch: self.default_flavor,
            });
        }
        if let Some(batch) = self.capabilities.lock().get(&sender) {
            return Ok(AccountCapabilities {
                deployed: true,
                batch: *batch,
            });
        }
        let batch = detect_batch_flavor(&code, self.default_flavor);
        tracing::debug!(sender = ?sender, batch = %batch, "resolved account capabilities");
        self.capabilities.lock().insert(sender, batch);
        Ok(AccountCapabilities {
            deployed: true,
            batch,
        })
    }

    /// Builds an unsigned operation. Fee fields are left at zero.
    ///
    /// Deployment status is probed on every call; `initCode` is attached only
    /// if the account has no code yet.
    pub async fn build(
        &self,
        account: &SmartAccountRef,
        calls: &[Call],
        nonce: U256,
        gas: Option<&GasFields>,
        paymaster: Option<&PaymasterData>,
    ) -> Result<UserOperation, ExecError> {
        let sender = self.addresses.compute_address(account)?;
        let caps = self.capabilities(sender).await?;
        let call_data = account::encode_calls(calls, caps.batch)?;

        let mut op = UserOperation {
            sender,
            nonce,
            init_code: if caps.deployed {
                Bytes::default()
            } else {
                account::init_code(account)
            },
            call_data,
            signature: placeholder_signature(),
            ..Default::default()
        };
        if let Some(gas) = gas {
            op.apply_gas(gas);
        }
        if let Some(pm) = paymaster {
            op = apply_sponsorship(&op, pm)?;
        }
        tracing::debug!(
            sender = ?sender,
            nonce = %nonce,
            calls = calls.len(),
            deployed = caps.deployed,
            "built user operation"
        );
        Ok(op)
    }
}

/// Attaches the signature. Pure.
pub fn finalize(op: &UserOperation, signature: Bytes) -> UserOperation {
    UserOperation {
        signature,
        ..op.clone()
    }
}
