// TRANSACTION LIFECYCLE - NONCE TRACKER
// Handles: per-address nonce locks, network/local nonce reconciliation, global lock

use dashmap::DashMap;
use ethers::types::U256;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{
    sync::{
        watch, Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
    },
    time,
};
use tracing::{debug, info};

use crate::{
    chain::{BlockTag, ChainQuery},
    error::TxError,
    hex_quantity::{parse_chain_quantity, parse_quantity},
    store::{TxFilter, TxStateStore},
    types::{TransactionMeta, TxStatus},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceDetails {
    pub network_nonce: U256,
    /// One past the highest confirmed local nonce, zero if none.
    pub highest_confirmed: U256,
    pub local_nonce: U256,
}

/// Exclusive reservation of the next nonce for one address. Released on
/// `release()` or drop, whichever comes first.
#[derive(Debug)]
pub struct NonceLock {
    address: String,
    next_nonce: U256,
    details: NonceDetails,
    guard: Option<OwnedMutexGuard<()>>,
    // Shared hold on the global lock, so a global holder waits for us.
    global: Option<OwnedRwLockReadGuard<()>>,
}

impl NonceLock {
    /// Decimal string.
    pub fn next_nonce(&self) -> String {
        self.next_nonce.to_string()
    }

    pub fn next_nonce_value(&self) -> U256 {
        self.next_nonce
    }

    pub fn details(&self) -> &NonceDetails {
        &self.details
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_released(&self) -> bool {
        self.guard.is_none()
    }

    pub fn release(&mut self) {
        self.global.take();
        if self.guard.take().is_some() {
            debug!("[NONCE] Released lock for {}", self.address);
        }
    }
}

impl Drop for NonceLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Held only once every outstanding address lock is released; blocks new
/// per-address acquisitions until dropped.
#[derive(Debug)]
pub struct GlobalNonceLock {
    _guard: OwnedRwLockWriteGuard<()>,
}

pub struct NonceTracker {
    chain: Arc<dyn ChainQuery>,
    store: Arc<TxStateStore>,
    network: watch::Receiver<String>,
    lock_timeout: Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
    global_lock: Arc<RwLock<()>>,
}

impl NonceTracker {
    pub fn new(
        chain: Arc<dyn ChainQuery>,
        store: Arc<TxStateStore>,
        network: watch::Receiver<String>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            store,
            network,
            lock_timeout,
            locks: DashMap::new(),
            global_lock: Arc::new(RwLock::new(())),
        }
    }

    pub async fn acquire_global_lock(&self) -> Result<GlobalNonceLock, TxError> {
        let guard = time::timeout(self.lock_timeout, self.global_lock.clone().write_owned())
            .await
            .map_err(|_| TxError::NonceLockTimeout {
                address: "*".to_string(),
            })?;
        Ok(GlobalNonceLock { _guard: guard })
    }

    pub async fn acquire_nonce_lock(&self, address: &str) -> Result<NonceLock, TxError> {
        let address = address.to_lowercase();

        // Wait out any global holder before queueing on the address.
        let global = time::timeout(self.lock_timeout, self.global_lock.clone().read_owned())
            .await
            .map_err(|_| TxError::NonceLockTimeout {
                address: address.clone(),
            })?;

        let mutex = self
            .locks
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = time::timeout(self.lock_timeout, mutex.lock_owned())
            .await
            .map_err(|_| TxError::NonceLockTimeout {
                address: address.clone(),
            })?;

        // The guard is dropped with any error below.
        let details = self.compute_next_nonce(&address).await?;
        let next_nonce = details.local_nonce.max(details.network_nonce);

        info!(
            "[NONCE] {} next nonce {} (network {}, confirmed {}, local {})",
            address, next_nonce, details.network_nonce, details.highest_confirmed, details.local_nonce
        );

        Ok(NonceLock {
            address,
            next_nonce,
            details,
            guard: Some(guard),
            global: Some(global),
        })
    }

    async fn compute_next_nonce(&self, address: &str) -> Result<NonceDetails, TxError> {
        let network_hex = self
            .chain
            .get_transaction_count(address, BlockTag::Latest)
            .await?;
        let network_nonce = parse_chain_quantity("transactionCount", &network_hex)?;

        let highest_confirmed = highest_nonce(&self.get_confirmed_transactions(address))
            .map(|n| n + U256::one())
            .unwrap_or_default();

        // A lagging or forked node must not push us below our own confirmed txs.
        let suggested = network_nonce.max(highest_confirmed);
        let in_flight = nonce_set(&self.get_in_flight_transactions(address));
        let local_nonce = highest_continuous_from(&in_flight, suggested);

        Ok(NonceDetails {
            network_nonce,
            highest_confirmed,
            local_nonce,
        })
    }

    pub fn get_confirmed_transactions(&self, address: &str) -> Vec<TransactionMeta> {
        self.store.get_tx_list(&TxFilter {
            status: Some(TxStatus::Confirmed),
            from: Some(address.to_string()),
            network_id: Some(self.network.borrow().clone()),
            ..Default::default()
        })
    }

    /// Approved, signed and submitted records of the address, plus rejected
    /// ones that were already broadcast: their nonce may still be mined.
    pub fn get_in_flight_transactions(&self, address: &str) -> Vec<TransactionMeta> {
        let network = self.network.borrow().clone();
        self.store
            .get_tx_list(&TxFilter {
                from: Some(address.to_string()),
                network_id: Some(network),
                ..Default::default()
            })
            .into_iter()
            .filter(|tx| {
                tx.status.is_in_flight() || (tx.status == TxStatus::Rejected && tx.hash.is_some())
            })
            .collect()
    }
}

fn tx_nonce(tx: &TransactionMeta) -> Option<U256> {
    tx.tx_params
        .nonce
        .as_deref()
        .and_then(|n| parse_quantity("nonce", n).ok())
}

fn highest_nonce(txs: &[TransactionMeta]) -> Option<U256> {
    txs.iter().filter_map(tx_nonce).max()
}

fn nonce_set(txs: &[TransactionMeta]) -> HashSet<U256> {
    txs.iter().filter_map(tx_nonce).collect()
}

/// First nonce at or above `start` that no in-flight record is using.
pub fn highest_continuous_from(used: &HashSet<U256>, start: U256) -> U256 {
    let mut nonce = start;
    while used.contains(&nonce) {
        nonce += U256::one();
    }
    nonce
}
