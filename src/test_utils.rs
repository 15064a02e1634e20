//! Scripted collaborators for unit tests.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use crate::{
    chain::{BlockHeader, BlockTag, ChainQuery},
    error::TxError,
    signer::{TransactionSigner, UnsignedTransaction},
    types::{TxParams, TxReceipt},
};

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct MockChainState {
    nonces: HashMap<String, String>,
    balances: HashMap<String, String>,
    codes: HashMap<String, Vec<u8>>,
    receipts: HashMap<String, TxReceipt>,
    estimate_gas: Option<String>,
    estimate_error: Option<String>,
    gas_price: Option<String>,
    block_gas_limit: Option<String>,
    block_number: u64,
    last_estimate: Option<TxParams>,
    send_error: Option<String>,
    sent: Vec<String>,
    fail_nonce: bool,
    fail_code: bool,
    fail_receipts: bool,
}

/// In-memory node. Unset values fall back to a quiet account on a fresh chain.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockChainState>,
    nonce_calls: AtomicUsize,
    gas_price_calls: AtomicUsize,
    estimate_calls: AtomicUsize,
    nonce_hook: Mutex<Option<Hook>>,
    send_hook: Mutex<Option<Hook>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockChainState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_transaction_count(&self, address: &str, nonce: &str) {
        self.with_state(|s| {
            s.nonces.insert(address.to_lowercase(), nonce.to_string());
        });
    }

    pub fn fail_transaction_count(&self, fail: bool) {
        self.with_state(|s| s.fail_nonce = fail);
    }

    pub fn transaction_count_calls(&self) -> usize {
        self.nonce_calls.load(Ordering::SeqCst)
    }

    /// Runs `hook` inside the next nonce query, before the count is read.
    pub fn before_next_transaction_count(&self, hook: impl FnOnce() + Send + 'static) {
        *self.nonce_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Runs `hook` inside the next broadcast, after the node accepted it.
    pub fn after_next_send(&self, hook: impl FnOnce() + Send + 'static) {
        *self.send_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn set_balance(&self, address: &str, balance: &str) {
        self.with_state(|s| {
            s.balances.insert(address.to_lowercase(), balance.to_string());
        });
    }

    pub fn set_code(&self, address: &str, code: Vec<u8>) {
        self.with_state(|s| {
            s.codes.insert(address.to_lowercase(), code);
        });
    }

    pub fn fail_get_code(&self) {
        self.with_state(|s| s.fail_code = true);
    }

    pub fn set_estimate_gas(&self, gas: &str) {
        self.with_state(|s| s.estimate_gas = Some(gas.to_string()));
    }

    pub fn fail_estimate_gas(&self, message: &str) {
        self.with_state(|s| s.estimate_error = Some(message.to_string()));
    }

    pub fn last_estimate_params(&self) -> Option<TxParams> {
        self.with_state(|s| s.last_estimate.clone())
    }

    pub fn estimate_calls(&self) -> usize {
        self.estimate_calls.load(Ordering::SeqCst)
    }

    pub fn set_gas_price(&self, price: &str) {
        self.with_state(|s| s.gas_price = Some(price.to_string()));
    }

    pub fn gas_price_calls(&self) -> usize {
        self.gas_price_calls.load(Ordering::SeqCst)
    }

    pub fn set_block_gas_limit(&self, limit: &str) {
        self.with_state(|s| s.block_gas_limit = Some(limit.to_string()));
    }

    pub fn set_block_number(&self, number: u64) {
        self.with_state(|s| s.block_number = number);
    }

    pub fn set_receipt(&self, hash: &str, receipt: TxReceipt) {
        self.with_state(|s| {
            s.receipts.insert(hash.to_string(), receipt);
        });
    }

    pub fn fail_receipts(&self, fail: bool) {
        self.with_state(|s| s.fail_receipts = fail);
    }

    pub fn fail_send(&self, message: Option<&str>) {
        self.with_state(|s| s.send_error = message.map(str::to_string));
    }

    pub fn sent_raw_txs(&self) -> Vec<String> {
        self.with_state(|s| s.sent.clone())
    }

    /// Hash the mock assigns to the n-th successful broadcast (0-based).
    pub fn hash_for(index: usize) -> String {
        format!("0x{:064x}", index + 1)
    }
}

#[async_trait]
impl ChainQuery for MockChain {
    async fn get_transaction_count(&self, address: &str, _block: BlockTag) -> Result<String, TxError> {
        self.nonce_calls.fetch_add(1, Ordering::SeqCst);
        let hook = self.nonce_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        self.with_state(|s| {
            if s.fail_nonce {
                return Err(TxError::ChainQuery("connection refused".to_string()));
            }
            Ok(s.nonces
                .get(&address.to_lowercase())
                .cloned()
                .unwrap_or_else(|| "0x0".to_string()))
        })
    }

    async fn get_balance(&self, address: &str) -> Result<String, TxError> {
        self.with_state(|s| {
            Ok(s.balances
                .get(&address.to_lowercase())
                .cloned()
                .unwrap_or_else(|| "0xde0b6b3a7640000000".to_string()))
        })
    }

    async fn get_code(&self, address: &str) -> Result<Vec<u8>, TxError> {
        self.with_state(|s| {
            if s.fail_code {
                return Err(TxError::ChainQuery("connection refused".to_string()));
            }
            Ok(s.codes.get(&address.to_lowercase()).cloned().unwrap_or_default())
        })
    }

    async fn estimate_gas(&self, params: &TxParams) -> Result<String, TxError> {
        self.estimate_calls.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| {
            s.last_estimate = Some(params.clone());
            if let Some(message) = &s.estimate_error {
                return Err(TxError::ChainQuery(message.clone()));
            }
            Ok(s.estimate_gas.clone().unwrap_or_else(|| "0x5208".to_string()))
        })
    }

    async fn gas_price(&self) -> Result<String, TxError> {
        self.gas_price_calls.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| Ok(s.gas_price.clone().unwrap_or_else(|| "0x4a817c800".to_string())))
    }

    async fn get_block_by_number(&self, _block: BlockTag) -> Result<BlockHeader, TxError> {
        self.with_state(|s| {
            Ok(BlockHeader {
                number: format!("0x{:x}", s.block_number),
                gas_limit: s
                    .block_gas_limit
                    .clone()
                    .unwrap_or_else(|| "0x47b784".to_string()),
            })
        })
    }

    async fn send_raw_transaction(&self, raw_tx: &str) -> Result<String, TxError> {
        let hash = self.with_state(|s| {
            if let Some(message) = &s.send_error {
                return Err(TxError::ChainQuery(message.clone()));
            }
            s.sent.push(raw_tx.to_string());
            Ok(MockChain::hash_for(s.sent.len() - 1))
        })?;
        let hook = self.send_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(hash)
    }

    async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<TxReceipt>, TxError> {
        self.with_state(|s| {
            if s.fail_receipts {
                return Err(TxError::ChainQuery("timeout".to_string()));
            }
            Ok(s.receipts.get(hash).cloned())
        })
    }
}

#[derive(Default)]
pub struct MockSigner {
    signed: Mutex<Vec<UnsignedTransaction>>,
    fail: AtomicBool,
}

impl MockSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sign_count(&self) -> usize {
        self.signed.lock().unwrap().len()
    }

    pub fn signed(&self) -> Vec<UnsignedTransaction> {
        self.signed.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransactionSigner for MockSigner {
    async fn sign_transaction(&self, tx: &UnsignedTransaction) -> Result<String, TxError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TxError::Signing("device disconnected".to_string()));
        }
        let mut signed = self.signed.lock().unwrap();
        signed.push(tx.clone());
        Ok(format!("0xf86c{:04x}", signed.len()))
    }
}

pub fn receipt(hash: &str, block_number: u64) -> TxReceipt {
    TxReceipt {
        transaction_hash: hash.to_string(),
        block_number: Some(block_number),
        gas_used: Some("0x5208".to_string()),
        status: Some(true),
    }
}
