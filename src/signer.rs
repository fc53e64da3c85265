use crate::error::ExecError;
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256};

/// Signs a userOpHash on behalf of the account owner.
///
/// Key custody is out of scope; the pipeline only sees this trait.
#[async_trait]
pub trait SignatureProvider: Send + Sync {
    async fn sign(&self, user_op_hash: H256) -> Result<Bytes, ExecError>;

    /// The owner address, when the provider knows it.
    fn owner(&self) -> Option<Address> {
        None
    }
}

/// EIP-191 `personal_sign` over the raw 32-byte hash, which is what
/// SimpleAccount-style accounts recover against.
#[derive(Debug, Clone)]
pub struct LocalWalletSigner {
    wallet: LocalWallet,
}

impl LocalWalletSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }
}

#[async_trait]
impl SignatureProvider for LocalWalletSigner {
    async fn sign(&self, user_op_hash: H256) -> Result<Bytes, ExecError> {
        let sig = self
            .wallet
            .sign_message(user_op_hash.as_bytes())
            .await
            .map_err(|e| ExecError::Signing(format!("failed to sign userOpHash: {e}")))?;
        Ok(Bytes::from(sig.to_vec()))
    }

    fn owner(&self) -> Option<Address> {
        Some(self.wallet.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SIGNATURE_LEN;
    use ethers::types::Signature;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[tokio::test]
    async fn signs_hash_recoverably() {
        let wallet: LocalWallet = KEY.parse().unwrap();
        let owner = wallet.address();
        let signer = LocalWalletSigner::new(wallet);
        let hash = H256::repeat_byte(0x42);

        let sig = signer.sign(hash).await.unwrap();
        assert_eq!(sig.len(), SIGNATURE_LEN);

        let parsed = Signature::try_from(sig.as_ref()).unwrap();
        assert_eq!(parsed.recover(hash.as_bytes()).unwrap(), owner);
        assert_eq!(signer.owner(), Some(owner));
    }
}
