use crate::error::ExecError;
use crate::types::SmartAccountRef;
use ethers::abi::{encode, Token};
use ethers::types::{Address, H256};
use ethers::utils::{get_create2_address_from_hash, keccak256};
use parking_lot::Mutex;
use schnellru::{ByLength, LruMap};

/// EIP-1167 creation code, split around the 20-byte implementation address.
const MINIMAL_PROXY_PREFIX: [u8; 20] = [
    0x3d, 0x60, 0x2d, 0x80, 0x60, 0x0a, 0x3d, 0x39, 0x81, 0xf3, 0x36, 0x3d, 0x3d, 0x37, 0x3d, 0x3d,
    0x3d, 0x36, 0x3d, 0x73,
];
const MINIMAL_PROXY_SUFFIX: [u8; 15] = [
    0x5a, 0xf4, 0x3d, 0x82, 0x80, 0x3e, 0x90, 0x3d, 0x91, 0x60, 0x2b, 0x57, 0xfd, 0x5b, 0xf3,
];

/// What the factory deploys for each account, needed for the CREATE2 formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountBytecode {
    /// The factory clones `implementation` with an EIP-1167 minimal proxy.
    MinimalProxy { implementation: Address },
    /// keccak256 of the account creation code, for any other factory.
    InitCodeHash(H256),
}

impl AccountBytecode {
    pub fn init_code_hash(&self) -> H256 {
        match self {
            AccountBytecode::MinimalProxy { implementation } => {
                let mut code = Vec::with_capacity(55);
                code.extend_from_slice(&MINIMAL_PROXY_PREFIX);
                code.extend_from_slice(implementation.as_bytes());
                code.extend_from_slice(&MINIMAL_PROXY_SUFFIX);
                H256(keccak256(code))
            }
            AccountBytecode::InitCodeHash(h) => *h,
        }
    }
}

/// Salt the factory passes to CREATE2: keccak256(abi.encode(owner, salt)).
pub fn combined_salt(account: &SmartAccountRef) -> [u8; 32] {
    keccak256(encode(&[
        Token::Address(account.owner),
        Token::Bytes(account.salt.to_vec()),
    ]))
}

/// Computes counterfactual smart-account addresses.
///
/// The result depends only on the ref and the configured bytecode hash; the
/// memo is an optimisation bounded to `capacity` entries and owned by this
/// instance.
pub struct AddressComputer {
    init_code_hash: H256,
    cache: Mutex<LruMap<SmartAccountRef, Address>>,
}

impl AddressComputer {
    pub fn new(bytecode: AccountBytecode, capacity: u32) -> Self {
        Self {
            init_code_hash: bytecode.init_code_hash(),
            cache: Mutex::new(LruMap::new(ByLength::new(capacity.max(1)))),
        }
    }

    pub fn compute_address(&self, account: &SmartAccountRef) -> Result<Address, ExecError> {
        if account.factory.is_zero() {
            return Err(ExecError::InvalidInput("factory address is zero".into()));
        }
        if account.owner.is_zero() {
            return Err(ExecError::InvalidInput("owner address is zero".into()));
        }

        if let Some(addr) = self.cache.lock().get(account) {
            return Ok(*addr);
        }

        let addr = get_create2_address_from_hash(
            account.factory,
            combined_salt(account),
            self.init_code_hash,
        );
        self.cache.lock().insert(account.clone(), addr);
        Ok(addr)
    }
}

impl std::fmt::Debug for AddressComputer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressComputer")
            .field("init_code_hash", &self.init_code_hash)
            .finish()
    }
}
