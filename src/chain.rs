// TRANSACTION LIFECYCLE - CHAIN QUERY CAPABILITY
// Handles: node queries (nonce, code, gas, blocks, receipts) and raw broadcast

use async_trait::async_trait;
use ethers::{
    providers::{Http, Middleware, Provider},
    types::{
        transaction::eip2718::TypedTransaction, Address, BlockId, BlockNumber, Bytes,
        TransactionRequest, H256, U64,
    },
};
use std::str::FromStr;

use crate::{
    error::TxError,
    hex_quantity::{parse_optional_quantity, strip_hex_prefix, to_quantity},
    types::{TxParams, TxReceipt},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
    Number(u64),
}

impl From<BlockTag> for BlockNumber {
    fn from(tag: BlockTag) -> Self {
        match tag {
            BlockTag::Latest => BlockNumber::Latest,
            BlockTag::Pending => BlockNumber::Pending,
            BlockTag::Number(n) => BlockNumber::Number(U64::from(n)),
        }
    }
}

/// Quantities are hex strings, as exchanged with the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: String,
    pub gas_limit: String,
}

/// Read and broadcast access to a chain node. Implementations must be cheap
/// to share; every component holds an `Arc<dyn ChainQuery>`.
#[async_trait]
pub trait ChainQuery: Send + Sync {
    async fn get_transaction_count(&self, address: &str, block: BlockTag) -> Result<String, TxError>;

    /// Latest balance in wei.
    async fn get_balance(&self, address: &str) -> Result<String, TxError>;

    /// Empty bytes for accounts without code.
    async fn get_code(&self, address: &str) -> Result<Vec<u8>, TxError>;

    async fn estimate_gas(&self, params: &TxParams) -> Result<String, TxError>;

    async fn gas_price(&self) -> Result<String, TxError>;

    async fn get_block_by_number(&self, block: BlockTag) -> Result<BlockHeader, TxError>;

    async fn send_raw_transaction(&self, raw_tx: &str) -> Result<String, TxError>;

    async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<TxReceipt>, TxError>;
}

// ============================================================================
// ETHERS PROVIDER ADAPTER
// ============================================================================

pub struct EthersChainQuery {
    provider: Provider<Http>,
}

impl EthersChainQuery {
    pub fn new(rpc_url: &str) -> Result<Self, TxError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| TxError::ChainQuery(format!("Invalid provider: {}", e)))?;
        Ok(Self { provider })
    }
}

fn parse_address(field: &str, value: &str) -> Result<Address, TxError> {
    Address::from_str(value)
        .map_err(|e| TxError::InvalidParams(format!("Invalid {} address {}: {}", field, value, e)))
}

fn decode_hex_bytes(field: &str, value: &str) -> Result<Bytes, TxError> {
    hex::decode(strip_hex_prefix(value))
        .map(Bytes::from)
        .map_err(|e| TxError::InvalidParams(format!("Invalid {} hex: {}", field, e)))
}

pub fn to_transaction_request(params: &TxParams) -> Result<TransactionRequest, TxError> {
    let mut request = TransactionRequest::new().from(parse_address("from", &params.from)?);

    if let Some(to) = &params.to {
        request = request.to(parse_address("to", to)?);
    }
    if let Some(value) = parse_optional_quantity("value", params.value.as_deref())? {
        request = request.value(value);
    }
    if let Some(gas) = parse_optional_quantity("gas", params.gas.as_deref())? {
        request = request.gas(gas);
    }
    if let Some(gas_price) = parse_optional_quantity("gasPrice", params.gas_price.as_deref())? {
        request = request.gas_price(gas_price);
    }
    if let Some(nonce) = parse_optional_quantity("nonce", params.nonce.as_deref())? {
        request = request.nonce(nonce);
    }
    if let Some(data) = &params.data {
        request = request.data(decode_hex_bytes("data", data)?);
    }

    Ok(request)
}

fn provider_error(e: impl std::fmt::Display) -> TxError {
    TxError::ChainQuery(e.to_string())
}

#[async_trait]
impl ChainQuery for EthersChainQuery {
    async fn get_transaction_count(&self, address: &str, block: BlockTag) -> Result<String, TxError> {
        let addr = parse_address("account", address)?;
        let count = self
            .provider
            .get_transaction_count(addr, Some(BlockId::Number(block.into())))
            .await
            .map_err(provider_error)?;
        Ok(to_quantity(count))
    }

    async fn get_balance(&self, address: &str) -> Result<String, TxError> {
        let addr = parse_address("account", address)?;
        let balance = self
            .provider
            .get_balance(addr, None)
            .await
            .map_err(provider_error)?;
        Ok(to_quantity(balance))
    }

    async fn get_code(&self, address: &str) -> Result<Vec<u8>, TxError> {
        let addr = parse_address("contract", address)?;
        let code = self
            .provider
            .get_code(addr, None)
            .await
            .map_err(provider_error)?;
        Ok(code.to_vec())
    }

    async fn estimate_gas(&self, params: &TxParams) -> Result<String, TxError> {
        let tx: TypedTransaction = to_transaction_request(params)?.into();
        let estimate = self
            .provider
            .estimate_gas(&tx, None)
            .await
            .map_err(provider_error)?;
        Ok(to_quantity(estimate))
    }

    async fn gas_price(&self) -> Result<String, TxError> {
        let price = self.provider.get_gas_price().await.map_err(provider_error)?;
        Ok(to_quantity(price))
    }

    async fn get_block_by_number(&self, block: BlockTag) -> Result<BlockHeader, TxError> {
        let block_number: BlockNumber = block.into();
        let block = self
            .provider
            .get_block(block_number)
            .await
            .map_err(provider_error)?
            .ok_or_else(|| TxError::ChainQuery(format!("Block {:?} not found", block_number)))?;

        let number = block
            .number
            .ok_or_else(|| TxError::ChainQuery("Block has no number".to_string()))?;

        Ok(BlockHeader {
            number: format!("0x{:x}", number.as_u64()),
            gas_limit: to_quantity(block.gas_limit),
        })
    }

    async fn send_raw_transaction(&self, raw_tx: &str) -> Result<String, TxError> {
        let bytes = decode_hex_bytes("rawTx", raw_tx)?;
        let pending = self
            .provider
            .send_raw_transaction(bytes)
            .await
            .map_err(provider_error)?;
        Ok(format!("0x{}", hex::encode(pending.tx_hash())))
    }

    async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<TxReceipt>, TxError> {
        let tx_hash = H256::from_str(strip_hex_prefix(hash))
            .map_err(|e| TxError::InvalidParams(format!("Invalid hash: {}", e)))?;

        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(provider_error)?;

        Ok(receipt.map(|r| TxReceipt {
            transaction_hash: format!("0x{}", hex::encode(r.transaction_hash)),
            block_number: r.block_number.map(|n| n.as_u64()),
            gas_used: r.gas_used.map(to_quantity),
            status: r.status.map(|s| s == U64::from(1)),
        }))
    }
}
