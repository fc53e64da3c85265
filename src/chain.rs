use crate::error::ExecError;
use crate::types::FeeFields;
use async_trait::async_trait;
use ethers::abi::{Abi, AbiParser};
use ethers::contract::Contract;
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;

/// Read-only chain access used by the pipeline.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Deployed bytecode at `address` (empty if none).
    async fn get_code(&self, address: Address) -> Result<Bytes, ExecError>;

    /// `EntryPoint.getNonce(sender, key)`. Works for undeployed senders too.
    async fn get_nonce(
        &self,
        entry_point: Address,
        sender: Address,
        key: U256,
    ) -> Result<U256, ExecError>;

    /// EIP-1559 fees derived from `eth_feeHistory`.
    async fn fee_history_fees(&self) -> Result<FeeFields, ExecError>;

    /// Legacy `eth_gasPrice`.
    async fn gas_price(&self) -> Result<U256, ExecError>;
}

/// [`ChainReader`] over any ethers middleware.
#[derive(Debug)]
pub struct EthersChain<M> {
    client: Arc<M>,
    entry_point_abi: Abi,
    factory_abi: Abi,
}

impl<M: Middleware + 'static> EthersChain<M> {
    pub fn new(client: Arc<M>) -> Result<Self, ExecError> {
        let entry_point_abi = AbiParser::default()
            .parse(&["function getNonce(address sender, uint192 key) view returns (uint256)"])
            .map_err(|e| ExecError::InvalidInput(format!("entrypoint abi: {e}")))?;
        let factory_abi = AbiParser::default()
            .parse(&["function getAddress(address admin, bytes data) view returns (address)"])
            .map_err(|e| ExecError::InvalidInput(format!("factory abi: {e}")))?;
        Ok(Self {
            client,
            entry_point_abi,
            factory_abi,
        })
    }

    pub async fn chain_id(&self) -> Result<u64, ExecError> {
        self.client
            .get_chainid()
            .await
            .map(|id| id.as_u64())
            .map_err(|e| ExecError::TransientNetwork(format!("eth_chainId failed: {e}")))
    }

    /// Asks the factory where it would deploy the account. Used to cross-check
    /// the locally computed counterfactual address.
    pub async fn factory_get_address(
        &self,
        factory: Address,
        owner: Address,
        salt: Bytes,
    ) -> Result<Address, ExecError> {
        let factory_c = Contract::new(factory, self.factory_abi.clone(), self.client.clone());
        factory_c
            .method::<_, Address>("getAddress", (owner, salt))
            .map_err(|e| ExecError::InvalidInput(format!("getAddress: {e}")))?
            .call()
            .await
            .map_err(|e| ExecError::TransientNetwork(format!("factory.getAddress failed: {e}")))
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainReader for EthersChain<M> {
    async fn get_code(&self, address: Address) -> Result<Bytes, ExecError> {
        self.client
            .get_code(address, None)
            .await
            .map_err(|e| ExecError::TransientNetwork(format!("eth_getCode failed: {e}")))
    }

    async fn get_nonce(
        &self,
        entry_point: Address,
        sender: Address,
        key: U256,
    ) -> Result<U256, ExecError> {
        let entrypoint_c =
            Contract::new(entry_point, self.entry_point_abi.clone(), self.client.clone());
        entrypoint_c
            .method::<_, U256>("getNonce", (sender, key))
            .map_err(|e| ExecError::InvalidInput(format!("getNonce: {e}")))?
            .call()
            .await
            .map_err(|e| ExecError::TransientNetwork(format!("entryPoint.getNonce failed: {e}")))
    }

    async fn fee_history_fees(&self) -> Result<FeeFields, ExecError> {
        let (max_fee_per_gas, max_priority_fee_per_gas) = self
            .client
            .estimate_eip1559_fees(None)
            .await
            .map_err(|e| ExecError::TransientNetwork(format!("fee history failed: {e}")))?;
        Ok(FeeFields {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }

    async fn gas_price(&self) -> Result<U256, ExecError> {
        self.client
            .get_gas_price()
            .await
            .map_err(|e| ExecError::TransientNetwork(format!("failed to fetch gas price: {e}")))
    }
}
