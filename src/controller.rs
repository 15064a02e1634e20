// TRANSACTION LIFECYCLE - CONTROLLER
// Handles: intake, gas defaulting, approval, signing, nonce assignment, broadcast, cancel/replace

use ethers::types::{Address, U256};
use std::{str::FromStr, sync::Arc};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::{
    chain::ChainQuery,
    config::Config,
    error::TxError,
    gas::{GasEstimator, SIMPLE_SEND_GAS},
    hex_quantity::{
        add_hex_prefix, parse_chain_quantity, parse_optional_quantity, parse_quantity,
        strip_hex_prefix, to_quantity,
    },
    nonce::{NonceLock, NonceTracker},
    signer::{TransactionSigner, UnsignedTransaction},
    store::{TxEvent, TxFilter, TxStateStore},
    types::{get_chain_name, next_tx_id, TransactionMeta, TxId, TxParams, TxStatus},
};

pub struct TransactionController {
    store: Arc<TxStateStore>,
    nonce_tracker: Arc<NonceTracker>,
    gas: GasEstimator,
    chain: Arc<dyn ChainQuery>,
    signer: Arc<dyn TransactionSigner>,
    network: watch::Sender<String>,
    replacement_gas_bump_percent: u64,
}

impl TransactionController {
    pub fn new(
        config: &Config,
        chain: Arc<dyn ChainQuery>,
        signer: Arc<dyn TransactionSigner>,
    ) -> Self {
        let (network, network_rx) = watch::channel(config.network_id.clone());
        let store = Arc::new(TxStateStore::new(
            config.tx_history_limit,
            network_rx.clone(),
            config.event_channel_capacity,
        ));
        let nonce_tracker = Arc::new(NonceTracker::new(
            chain.clone(),
            store.clone(),
            network_rx,
            config.nonce_lock_timeout,
        ));

        Self {
            store,
            nonce_tracker,
            gas: GasEstimator::new(chain.clone(), U256::from(config.gas_buffer)),
            chain,
            signer,
            network,
            replacement_gas_bump_percent: config.replacement_gas_bump_percent,
        }
    }

    pub fn store(&self) -> Arc<TxStateStore> {
        self.store.clone()
    }

    pub fn nonce_tracker(&self) -> Arc<NonceTracker> {
        self.nonce_tracker.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TxEvent> {
        self.store.subscribe()
    }

    pub fn network_receiver(&self) -> watch::Receiver<String> {
        self.network.subscribe()
    }

    pub fn network_id(&self) -> String {
        self.network.borrow().clone()
    }

    /// Replay protection is opportunistic: a non-numeric network id yields 0.
    pub fn get_chain_id(&self) -> u64 {
        self.network.borrow().trim().parse().unwrap_or(0)
    }

    /// Switches the active network with no nonce lock outstanding.
    pub async fn set_network_id(&self, network_id: &str) -> Result<(), TxError> {
        let _global = self.nonce_tracker.acquire_global_lock().await?;
        let previous = self.network.send_replace(network_id.to_string());
        info!("[TX-CONTROLLER] Network changed {} -> {}", previous, network_id);
        Ok(())
    }

    fn chain_name(&self) -> String {
        get_chain_name(self.get_chain_id())
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get_tx(&self, id: TxId) -> Result<TransactionMeta, TxError> {
        self.store.get_tx(id).ok_or(TxError::NotFound(id))
    }

    /// Records on the active network.
    pub fn get_transactions(
        &self,
        status: Option<TxStatus>,
        from: Option<String>,
    ) -> Vec<TransactionMeta> {
        self.store.get_tx_list(&TxFilter {
            status,
            from,
            network_id: Some(self.network_id()),
            ..Default::default()
        })
    }

    pub fn get_unapproved_tx_count(&self) -> usize {
        self.store.unapproved_count()
    }

    pub fn get_pending_tx_count(&self) -> usize {
        self.store.pending_count()
    }

    pub fn wipe_transactions(&self, address: &str) -> usize {
        self.store.wipe_transactions(address, &self.network_id())
    }

    // ========================================================================
    // INTAKE
    // ========================================================================

    /// Resolves with the hash once the user approves and the transaction is
    /// broadcast; fails with `UserDenied` if it is rejected instead.
    pub async fn new_unapproved_transaction(&self, params: TxParams) -> Result<String, TxError> {
        let meta = self.add_unapproved_transaction(params).await?;
        self.await_transaction_hash(meta.id).await
    }

    pub async fn add_unapproved_transaction(
        &self,
        params: TxParams,
    ) -> Result<TransactionMeta, TxError> {
        let params = normalize_tx_params(params)?;
        let mut meta = TransactionMeta::new(next_tx_id(), self.network_id(), params);

        self.add_tx_defaults(&mut meta).await?;
        let meta = self.store.add_tx(meta)?;

        info!(
            "[TX-CONTROLLER-{}] New unapproved tx {} from {}",
            self.chain_name(),
            meta.id,
            meta.tx_params.from
        );
        Ok(meta)
    }

    async fn add_tx_defaults(&self, meta: &mut TransactionMeta) -> Result<(), TxError> {
        if meta.tx_params.value.is_none() {
            meta.tx_params.value = Some("0x0".to_string());
        }
        if meta.tx_params.gas_price.is_none() {
            meta.tx_params.gas_price = Some(self.current_gas_price().await?);
        }

        let analysis = self.gas.analyze_gas_usage(&meta.tx_params).await?;
        meta.estimated_gas = Some(to_quantity(analysis.estimated_gas));
        meta.gas_limit_specified = analysis.gas_limit_specified;
        meta.simulation_fails = analysis.simulation_fails;
        if !analysis.gas_limit_specified {
            meta.tx_params.gas = Some(to_quantity(analysis.gas));
        }

        meta.delegate_call_warning = self.gas.check_delegate_call(&meta.tx_params).await;
        Ok(())
    }

    async fn current_gas_price(&self) -> Result<String, TxError> {
        let price = self.chain.gas_price().await?;
        Ok(to_quantity(parse_chain_quantity("gasPrice", &price)?))
    }

    /// Waits on store notifications; never polls the chain.
    pub async fn await_transaction_hash(&self, id: TxId) -> Result<String, TxError> {
        let mut events = self.store.subscribe();

        loop {
            let tx = self.get_tx(id)?;
            match tx.status {
                TxStatus::Rejected => {
                    info!("[TX-CONTROLLER] Tx {} denied by user", id);
                    return Err(TxError::UserDenied);
                }
                TxStatus::Failed => {
                    return Err(TxError::TransactionFailed {
                        id,
                        reason: tx.error.unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
                TxStatus::Submitted | TxStatus::Confirmed | TxStatus::Dropped => {
                    if let Some(hash) = tx.hash {
                        return Ok(hash);
                    }
                }
                _ => {}
            }

            loop {
                match events.recv().await {
                    Ok(event) if event.tx_id().map_or(true, |changed| changed == id) => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Err(TxError::NotFound(id)),
                }
            }
        }
    }

    // ========================================================================
    // APPROVAL
    // ========================================================================

    pub async fn approve_transaction(&self, id: TxId) -> Result<TransactionMeta, TxError> {
        let tx = self.get_tx(id)?;
        if tx.status != TxStatus::Unapproved {
            return Err(TxError::InvalidTransition {
                id,
                from: tx.status,
                to: TxStatus::Approved,
            });
        }

        let mut nonce_lock = self
            .nonce_tracker
            .acquire_nonce_lock(&tx.tx_params.from)
            .await?;
        let result = self.approve_with_lock(id, &nonce_lock).await;
        // Held until the broadcast settled so the next caller sees this nonce in flight.
        nonce_lock.release();
        result
    }

    async fn approve_with_lock(
        &self,
        id: TxId,
        nonce_lock: &NonceLock,
    ) -> Result<TransactionMeta, TxError> {
        let tx = self.get_tx(id)?;

        // Node queries run before the record is approved so a failure leaves it retryable.
        let gas_price = match tx.tx_params.gas_price {
            Some(_) => None,
            None => Some(self.current_gas_price().await?),
        };
        let gas = match tx.tx_params.gas {
            Some(_) => None,
            None => Some(to_quantity(
                self.gas.analyze_gas_usage(&tx.tx_params).await?.gas,
            )),
        };
        let nonce = to_quantity(nonce_lock.next_nonce_value());

        self.store.update_tx(id, |tx| {
            let params = &mut tx.tx_params;
            if params.nonce.is_none() {
                params.nonce = Some(nonce);
            }
            if params.gas_price.is_none() {
                params.gas_price = gas_price;
            }
            if params.gas.is_none() {
                params.gas = gas;
            }
            Ok(())
        })?;
        self.store.set_status(id, TxStatus::Approved)?;

        let outcome: Result<String, TxError> = async {
            self.sign_transaction(id).await?;
            self.publish_transaction(id, None).await
        }
        .await;

        if let Err(e) = outcome {
            self.fail_transaction(id, &e);
            return Err(e);
        }

        let tx = self.get_tx(id)?;
        info!(
            "[TX-CONTROLLER-{}] Approved tx {} nonce={} hash={}",
            self.chain_name(),
            id,
            tx.tx_params.nonce.as_deref().unwrap_or("?"),
            tx.hash.as_deref().unwrap_or("?")
        );
        Ok(tx)
    }

    fn fail_transaction(&self, id: TxId, error: &TxError) {
        match self.store.set_status_failed(id, &error.to_string()) {
            Ok(_) => warn!("[TX-CONTROLLER] Tx {} failed: {}", id, error),
            // Typically cancelled while signing.
            Err(e) => debug!("[TX-CONTROLLER] Tx {} not marked failed ({}): {}", id, error, e),
        }
    }

    pub async fn sign_transaction(&self, id: TxId) -> Result<String, TxError> {
        let tx = self.get_tx(id)?;
        let unsigned = UnsignedTransaction {
            chain_id: self.get_chain_id(),
            params: tx.tx_params,
        };

        let raw_tx = self.signer.sign_transaction(&unsigned).await?;
        self.store.update_tx(id, |tx| {
            tx.raw_tx = Some(raw_tx.clone());
            Ok(())
        })?;
        self.store.set_status(id, TxStatus::Signed)?;
        Ok(raw_tx)
    }

    /// Broadcasts the stored payload, or `raw_tx` when resubmitting with a
    /// new fee. Records the hash and moves the record to `submitted`.
    pub async fn publish_transaction(
        &self,
        id: TxId,
        raw_tx: Option<String>,
    ) -> Result<String, TxError> {
        if let Some(raw) = raw_tx {
            let raw = add_hex_prefix(&raw);
            self.store.update_tx(id, |tx| {
                tx.raw_tx = Some(raw);
                Ok(())
            })?;
        }

        let tx = self.get_tx(id)?;
        let raw = tx.raw_tx.ok_or_else(|| {
            TxError::InvalidParams(format!("Transaction {} has no signed payload", id))
        })?;

        let hash = self
            .chain
            .send_raw_transaction(&raw)
            .await
            .map_err(|e| match e {
                TxError::ChainQuery(message) => TxError::Broadcast(message),
                other => TxError::Broadcast(other.to_string()),
            })?;

        self.set_tx_hash(id, &hash)?;
        match self.get_tx(id)?.status {
            TxStatus::Submitted => {}
            // Cancelled while the send was in flight; the broadcast stands.
            TxStatus::Rejected => {
                info!(
                    "[TX-CONTROLLER-{}] Tx {} was rejected during broadcast: {}",
                    self.chain_name(),
                    id,
                    hash
                );
                return Ok(hash);
            }
            _ => {
                self.store.set_status(id, TxStatus::Submitted)?;
            }
        }

        info!(
            "[TX-CONTROLLER-{}] Submitted tx {}: {}",
            self.chain_name(),
            id,
            hash
        );
        Ok(hash)
    }

    pub fn set_tx_hash(&self, id: TxId, hash: &str) -> Result<TransactionMeta, TxError> {
        self.store.update_tx(id, |tx| {
            tx.hash = Some(hash.to_string());
            Ok(())
        })
    }

    /// Idempotent; valid from any status. In-flight network calls are not
    /// interrupted.
    pub fn cancel_transaction(&self, id: TxId) -> Result<TransactionMeta, TxError> {
        let tx = self.store.set_status_rejected(id)?;
        info!("[TX-CONTROLLER] Tx {} rejected", id);
        Ok(tx)
    }

    // ========================================================================
    // REPLACEMENTS
    // ========================================================================

    /// Rebroadcasts the same transaction at a higher gas price under the same nonce.
    pub async fn speed_up_transaction(
        &self,
        id: TxId,
        gas_price: Option<String>,
    ) -> Result<TransactionMeta, TxError> {
        let original = self.replaceable_tx(id)?;
        let (last_gas_price, bumped) = self.replacement_gas_price(&original, gas_price.as_deref())?;

        let mut params = original.tx_params.clone();
        params.gas_price = Some(bumped);
        self.submit_replacement(&original, params, last_gas_price)
            .await
    }

    /// Zero-value self transfer under the original nonce; the original is
    /// then rejected.
    pub async fn create_cancel_transaction(
        &self,
        id: TxId,
        gas_price: Option<String>,
    ) -> Result<TransactionMeta, TxError> {
        let original = self.replaceable_tx(id)?;
        let (last_gas_price, bumped) = self.replacement_gas_price(&original, gas_price.as_deref())?;

        let from = original.tx_params.from.clone();
        let params = TxParams {
            to: Some(from.clone()),
            from,
            value: Some("0x0".to_string()),
            gas: Some(to_quantity(U256::from(SIMPLE_SEND_GAS))),
            gas_price: Some(bumped),
            nonce: original.tx_params.nonce.clone(),
            data: None,
        };

        let replacement = self
            .submit_replacement(&original, params, last_gas_price)
            .await?;
        self.cancel_transaction(id)?;
        Ok(replacement)
    }

    fn replaceable_tx(&self, id: TxId) -> Result<TransactionMeta, TxError> {
        let tx = self.get_tx(id)?;
        if tx.status != TxStatus::Submitted {
            return Err(TxError::InvalidParams(format!(
                "Transaction {} is {}, only submitted transactions can be replaced",
                id, tx.status
            )));
        }
        if tx.tx_params.nonce.is_none() {
            return Err(TxError::InvalidParams(format!(
                "Transaction {} has no nonce",
                id
            )));
        }
        Ok(tx)
    }

    fn replacement_gas_price(
        &self,
        original: &TransactionMeta,
        requested: Option<&str>,
    ) -> Result<(String, String), TxError> {
        let last = parse_optional_quantity("gasPrice", original.tx_params.gas_price.as_deref())?
            .unwrap_or_default();
        let minimum = bump_gas_price(last, self.replacement_gas_bump_percent);
        let requested = parse_optional_quantity("gasPrice", requested)?.unwrap_or_default();
        Ok((to_quantity(last), to_quantity(requested.max(minimum))))
    }

    async fn submit_replacement(
        &self,
        original: &TransactionMeta,
        params: TxParams,
        last_gas_price: String,
    ) -> Result<TransactionMeta, TxError> {
        let mut meta = TransactionMeta::new(next_tx_id(), original.network_id.clone(), params);
        meta.gas_limit_specified = true;
        meta.last_gas_price = Some(last_gas_price);
        meta.replaces_id = Some(original.id);
        let meta = self.store.add_tx(meta)?;

        info!(
            "[TX-CONTROLLER-{}] Tx {} replaces {} at gasPrice {}",
            self.chain_name(),
            meta.id,
            original.id,
            meta.tx_params.gas_price.as_deref().unwrap_or("?")
        );
        self.approve_transaction(meta.id).await
    }
}

/// Rounds up so small prices still increase.
pub fn bump_gas_price(price: U256, percent: u64) -> U256 {
    price
        .saturating_mul(U256::from(100 + percent))
        .saturating_add(U256::from(99))
        / U256::from(100)
}

fn normalize_address(field: &str, value: &str) -> Result<String, TxError> {
    let address = Address::from_str(value.trim())
        .map_err(|_| TxError::InvalidParams(format!("Invalid {} address: {}", field, value)))?;
    Ok(format!("{:?}", address))
}

/// Lowercases addresses, prefixes quantities and rejects anything the node
/// should never see.
pub fn normalize_tx_params(mut params: TxParams) -> Result<TxParams, TxError> {
    params.from = normalize_address("from", &params.from)?;

    if let Some(data) = params.data.as_mut() {
        hex::decode(strip_hex_prefix(data.trim()))
            .map_err(|e| TxError::InvalidParams(format!("Invalid data: {}", e)))?;
        *data = add_hex_prefix(data.trim());
    }
    let has_data = params
        .data
        .as_deref()
        .map_or(false, |d| !strip_hex_prefix(d).is_empty());

    params.to = match params.to.take() {
        Some(to) if strip_hex_prefix(to.trim()).is_empty() && has_data => None,
        Some(to) => Some(normalize_address("to", &to)?),
        None => None,
    };
    if params.to.is_none() && !has_data {
        return Err(TxError::InvalidParams("Invalid recipient address".to_string()));
    }

    for (field, slot) in [
        ("value", &mut params.value),
        ("gas", &mut params.gas),
        ("gasPrice", &mut params.gas_price),
        ("nonce", &mut params.nonce),
    ] {
        if let Some(value) = slot.as_mut() {
            parse_quantity(field, value)?;
            *value = add_hex_prefix(value.trim());
        }
    }

    Ok(params)
}
