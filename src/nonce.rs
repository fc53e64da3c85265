use crate::chain::ChainReader;
use crate::error::ExecError;
use ethers::types::{Address, U256};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How nonce keys are chosen for new operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NoncePolicy {
    /// Key 0 unless the caller passes one. One in-flight op per account.
    #[default]
    Sequential,
    /// A fresh random 192-bit key per send when the caller passes none, so
    /// independent sends never contend for the same sequence.
    Parallel,
}

/// Largest key the EntryPoint accepts (uint192).
pub fn max_nonce_key() -> U256 {
    (U256::one() << 192) - 1
}

/// Random non-zero 192-bit key.
pub fn random_key() -> U256 {
    let mut buf = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut buf);
    buf[23] |= 1;
    U256::from_big_endian(&buf)
}

/// Reads the next usable nonce from the EntryPoint.
///
/// Holds no cache; every call reads the EntryPoint.
#[derive(Clone)]
pub struct NonceSource {
    chain: Arc<dyn ChainReader>,
    entry_point: Address,
    policy: NoncePolicy,
}

impl NonceSource {
    pub fn new(chain: Arc<dyn ChainReader>, entry_point: Address, policy: NoncePolicy) -> Self {
        Self {
            chain,
            entry_point,
            policy,
        }
    }

    /// Key to use for a send that did not ask for one.
    pub fn choose_key(&self, requested: Option<U256>) -> U256 {
        match (requested, self.policy) {
            (Some(k), _) => k,
            (None, NoncePolicy::Sequential) => U256::zero(),
            (None, NoncePolicy::Parallel) => random_key(),
        }
    }

    /// Full 256-bit nonce (key << 64 | sequence) for `sender` under `key`.
    pub async fn next_nonce(&self, sender: Address, key: U256) -> Result<U256, ExecError> {
        if key > max_nonce_key() {
            return Err(ExecError::InvalidInput(format!(
                "nonce key {key:#x} exceeds 192 bits"
            )));
        }
        let nonce = self.chain.get_nonce(self.entry_point, sender, key).await?;
        tracing::debug!(sender = ?sender, key = %key, nonce = %nonce, "fetched entrypoint nonce");
        Ok(nonce)
    }
}
