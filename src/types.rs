use crate::error::ExecError;
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, Log, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Length of an ECDSA signature as produced by the owner signer.
pub const SIGNATURE_LEN: usize = 65;

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// `init_code` and `paymaster_and_data` are empty when absent, which is how
/// the v0.6 wire format expresses "not set".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// ABI-encodes every field except the signature, hashing the dynamic ones.
    pub fn pack_without_signature(&self) -> Bytes {
        let encoded = encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(&self.paymaster_and_data).to_vec()),
        ]);
        Bytes::from(encoded)
    }

    /// The userOpHash the EntryPoint computes in `getUserOpHash`. This is what
    /// the owner signs and what the bundler reports back.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        let inner = keccak256(self.pack_without_signature());
        H256(keccak256(encode(&[
            Token::FixedBytes(inner.to_vec()),
            Token::Address(entry_point),
            Token::Uint(U256::from(chain_id)),
        ])))
    }

    /// Hash over the fields only the caller may decide: sender, nonce,
    /// initCode and callData. Gas, fee and paymaster fields are excluded.
    pub fn caller_fields_hash(&self) -> H256 {
        H256(keccak256(encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
        ])))
    }

    pub fn apply_gas(&mut self, gas: &GasFields) {
        self.call_gas_limit = gas.call_gas_limit;
        self.verification_gas_limit = gas.verification_gas_limit;
        self.pre_verification_gas = gas.pre_verification_gas;
    }

    pub fn apply_fees(&mut self, fees: &FeeFields) {
        self.max_fee_per_gas = fees.max_fee_per_gas;
        self.max_priority_fee_per_gas = fees.max_priority_fee_per_gas;
    }

    pub fn fees(&self) -> FeeFields {
        FeeFields {
            max_fee_per_gas: self.max_fee_per_gas,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
        }
    }

    pub fn has_init_code(&self) -> bool {
        !self.init_code.is_empty()
    }
}

/// One logical on-chain invocation requested by the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub to: Address,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub data: Bytes,
}

impl Call {
    pub fn new(to: Address, value: U256, data: Bytes) -> Self {
        Self { to, value, data }
    }
}

/// Immutable identity of a (possibly undeployed) smart account.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartAccountRef {
    pub factory: Address,
    pub owner: Address,
    pub salt: Bytes,
    pub chain_id: u64,
}

impl SmartAccountRef {
    pub fn new(factory: Address, owner: Address, salt: Bytes, chain_id: u64) -> Self {
        Self {
            factory,
            owner,
            salt,
            chain_id,
        }
    }

    /// Builds a ref from user-supplied strings, rejecting malformed input.
    pub fn parse(factory: &str, owner: &str, salt: &str, chain_id: u64) -> Result<Self, ExecError> {
        let factory = Address::from_str(factory)
            .map_err(|e| ExecError::InvalidInput(format!("invalid factory address '{factory}': {e}")))?;
        let owner = Address::from_str(owner)
            .map_err(|e| ExecError::InvalidInput(format!("invalid owner address '{owner}': {e}")))?;
        let salt = Bytes::from_str(salt)
            .map_err(|e| ExecError::InvalidInput(format!("invalid salt hex '{salt}': {e}")))?;
        Ok(Self::new(factory, owner, salt, chain_id))
    }
}

/// Gas limits as reported by `eth_estimateUserOperationGas`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GasFields {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

/// EIP-1559 fee fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeeFields {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Returned once the bundler accepts an operation. Correlates receipt polling
/// and replacement submissions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationHandle {
    pub user_op_hash: H256,
    pub sender: Address,
    pub nonce: U256,
    /// Unix seconds.
    pub submitted_at: u64,
}

impl OperationHandle {
    pub fn new(user_op_hash: H256, sender: Address, nonce: U256) -> Self {
        Self {
            user_op_hash,
            sender,
            nonce,
            submitted_at: now_unix(),
        }
    }
}

/// Terminal artifact of a send. A reverted batch is `success == false` with the
/// decoded revert reason, never a separate type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub user_op_hash: H256,
    pub transaction_hash: H256,
    pub success: bool,
    pub actual_gas_used: U256,
    pub actual_gas_cost: U256,
    pub logs: Vec<Log>,
    pub revert_reason: Option<String>,
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_op() -> UserOperation {
        UserOperation {
            sender: "0x921f125a92930cabb2969ad9323261d3a2a784e7".parse().unwrap(),
            nonce: 0.into(),
            init_code: "0x9406cc6185a346906296840746125a0e449764545fbfb9cf00000000000000000000000043378ff8c70109ee4dbe85af34428ab0615ebd230000000000000000000000000000000000000000000000000000000000000000".parse().unwrap(),
            call_data: "0xb61d27f6000000000000000000000000a02bfd0ba5d182226627a933333ba92d1a60e234000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000600000000000000000000000000000000000000000000000000000000000000000".parse().unwrap(),
            call_gas_limit: 530_100.into(),
            verification_gas_limit: 500_624.into(),
            pre_verification_gas: 104_056.into(),
            max_fee_per_gas: 1_695_000_030u64.into(),
            max_priority_fee_per_gas: 1_695_000_000u64.into(),
            paymaster_and_data: Bytes::default(),
            signature: "0x5ae30c60c3ad36192f6efc38b3ac41d70d2c08fd8efc5a2f2457bfc17a4deea72fb6b40081dc8e05da85a5f05b977d15a9583fbe0d1766357d2553ad233ddd2f1c".parse().unwrap(),
        }
    }

    #[test]
    fn user_op_hash_matches_entrypoint_v06() {
        let entry_point: Address = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789".parse().unwrap();
        assert_eq!(
            sample_op().hash(entry_point, 5),
            "0x7bca0c9a2ffbd23c25c7d5e1df0520142c0c39454cee778c3201eef6a8a27f06"
                .parse::<H256>()
                .unwrap()
        );
    }

    #[test]
    fn signature_does_not_affect_hash() {
        let entry_point = Address::repeat_byte(0xee);
        let op = sample_op();
        let mut unsigned = op.clone();
        unsigned.signature = Bytes::from(vec![0u8; SIGNATURE_LEN]);
        assert_eq!(op.hash(entry_point, 1), unsigned.hash(entry_point, 1));
    }

    #[test]
    fn caller_fields_hash_ignores_gas_and_paymaster() {
        let op = sample_op();
        let mut changed = op.clone();
        changed.call_gas_limit = 1.into();
        changed.max_fee_per_gas = 2.into();
        changed.paymaster_and_data = Bytes::from(vec![0xaa; 20]);
        assert_eq!(op.caller_fields_hash(), changed.caller_fields_hash());

        changed.call_data = Bytes::from(vec![0x01]);
        assert_ne!(op.caller_fields_hash(), changed.caller_fields_hash());
    }

    #[test]
    fn parse_ref_rejects_bad_address() {
        let err = SmartAccountRef::parse("0x1234", "0x0000000000000000000000000000000000000001", "0x", 1)
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidInput(_)));
    }
}
