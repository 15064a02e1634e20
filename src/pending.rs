// TRANSACTION LIFECYCLE - PENDING TRANSACTION TRACKER
// Handles: receipt reconciliation, dropped detection, stuck-tx resubmission, block polling

use ethers::types::U256;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};

use crate::{
    chain::{BlockTag, ChainQuery},
    error::TxError,
    hex_quantity::{parse_chain_quantity, parse_optional_quantity, parse_quantity},
    store::{TxFilter, TxStateStore},
    types::{TransactionMeta, TxReceipt, TxStatus},
};

/// Node responses to a rebroadcast that mean the original is still fine.
const BENIGN_RESUBMIT_ERRORS: &[&str] = &[
    "known transaction",
    "already known",
    "replacement transaction underpriced",
    "gas price too low to replace",
    "nonce too low",
];

enum Resolution {
    Confirmed(TxReceipt),
    Dropped,
    Pending,
}

pub struct PendingTxTracker {
    store: Arc<TxStateStore>,
    chain: Arc<dyn ChainQuery>,
    network: watch::Receiver<String>,
}

impl PendingTxTracker {
    pub fn new(
        store: Arc<TxStateStore>,
        chain: Arc<dyn ChainQuery>,
        network: watch::Receiver<String>,
    ) -> Self {
        Self {
            store,
            chain,
            network,
        }
    }

    fn list(&self, status: TxStatus, address: Option<&str>) -> Vec<TransactionMeta> {
        self.store.get_tx_list(&TxFilter {
            status: Some(status),
            from: address.map(str::to_string),
            network_id: Some(self.network.borrow().clone()),
            ..Default::default()
        })
    }

    /// Submitted records on the active network, read straight from the store.
    pub fn get_pending_transactions(&self, address: Option<&str>) -> Vec<TransactionMeta> {
        self.list(TxStatus::Submitted, address)
    }

    pub fn get_confirmed_transactions(&self, address: Option<&str>) -> Vec<TransactionMeta> {
        self.list(TxStatus::Confirmed, address)
    }

    pub async fn on_new_block(&self, block_number: u64) {
        debug!("[PENDING-TX] New block {}", block_number);
        self.update_pending_txs().await;
        self.resubmit_pending_txs(block_number).await;
    }

    /// One reconciliation pass. Query errors leave the record untouched for
    /// the next pass.
    pub async fn update_pending_txs(&self) {
        let pending = self.get_pending_transactions(None);
        if pending.is_empty() {
            return;
        }

        let mut network_nonces: HashMap<String, U256> = HashMap::new();
        for tx in pending {
            match self.resolve(&tx, &mut network_nonces).await {
                Ok(Resolution::Confirmed(receipt)) => self.confirm(&tx, receipt),
                Ok(Resolution::Dropped) => self.drop_tx(&tx),
                Ok(Resolution::Pending) => {}
                Err(e) => {
                    warn!(
                        "[PENDING-TX] Could not check tx {} ({}): {}",
                        tx.id,
                        tx.hash.as_deref().unwrap_or("?"),
                        e
                    );
                }
            }
        }
    }

    async fn resolve(
        &self,
        tx: &TransactionMeta,
        network_nonces: &mut HashMap<String, U256>,
    ) -> Result<Resolution, TxError> {
        let Some(hash) = tx.hash.as_deref() else {
            self.fail(tx, "Submitted transaction has no hash");
            return Ok(Resolution::Pending);
        };

        // Nonce strictly before receipt: a tx mined before the nonce read is
        // guaranteed to show its receipt below.
        let nonces = match tx.tx_params.nonce.as_deref() {
            Some(nonce) => Some((
                parse_quantity("nonce", nonce)?,
                self.network_nonce(&tx.tx_params.from, network_nonces).await?,
            )),
            None => None,
        };

        if let Some(receipt) = self.chain.get_transaction_receipt(hash).await? {
            if receipt.block_number.is_some() {
                return Ok(Resolution::Confirmed(receipt));
            }
        }

        // The nonce was consumed by something other than this hash.
        match nonces {
            Some((nonce, network_nonce)) if network_nonce > nonce => Ok(Resolution::Dropped),
            _ => Ok(Resolution::Pending),
        }
    }

    /// One query per account per pass.
    async fn network_nonce(
        &self,
        from: &str,
        network_nonces: &mut HashMap<String, U256>,
    ) -> Result<U256, TxError> {
        let from = from.to_lowercase();
        if let Some(n) = network_nonces.get(&from) {
            return Ok(*n);
        }
        let count = self
            .chain
            .get_transaction_count(&from, BlockTag::Latest)
            .await?;
        let n = parse_chain_quantity("transactionCount", &count)?;
        network_nonces.insert(from, n);
        Ok(n)
    }

    fn confirm(&self, tx: &TransactionMeta, receipt: TxReceipt) {
        if receipt.status == Some(false) {
            warn!(
                "[PENDING-TX] Tx {} was mined but reverted in block {:?}",
                tx.id, receipt.block_number
            );
        }
        let block_number = receipt.block_number;

        let recorded = self.store.update_tx(tx.id, |tx| {
            tx.receipt = Some(receipt);
            Ok(())
        });
        let result = recorded.and_then(|_| self.store.set_status(tx.id, TxStatus::Confirmed));
        match result {
            Ok(_) => info!(
                "[PENDING-TX] Tx {} confirmed in block {:?}",
                tx.id, block_number
            ),
            Err(e) => debug!("[PENDING-TX] Tx {} not confirmed: {}", tx.id, e),
        }
    }

    fn drop_tx(&self, tx: &TransactionMeta) {
        match self.store.set_status(tx.id, TxStatus::Dropped) {
            Ok(_) => info!(
                "[PENDING-TX] Tx {} dropped, nonce {} was used by another transaction",
                tx.id,
                tx.tx_params.nonce.as_deref().unwrap_or("?")
            ),
            Err(e) => debug!("[PENDING-TX] Tx {} not dropped: {}", tx.id, e),
        }
    }

    fn fail(&self, tx: &TransactionMeta, reason: &str) {
        warn!("[PENDING-TX] Tx {} failed: {}", tx.id, reason);
        if let Err(e) = self.store.set_status_failed(tx.id, reason) {
            debug!("[PENDING-TX] Tx {} not failed: {}", tx.id, e);
        }
    }

    /// Rebroadcasts stuck transactions with exponential block backoff. Never
    /// changes status.
    pub async fn resubmit_pending_txs(&self, block_number: u64) {
        for tx in self.get_pending_transactions(None) {
            if let Err(e) = self.resubmit(&tx, block_number).await {
                let message = e.to_string();
                if is_benign_resubmit_error(&message) {
                    debug!("[PENDING-TX] Resubmit of tx {} ignored: {}", tx.id, message);
                    continue;
                }

                warn!("[PENDING-TX] Resubmit of tx {} failed: {}", tx.id, message);
                let recorded = self.store.update_tx(tx.id, |tx| {
                    tx.warning = Some(message.clone());
                    Ok(())
                });
                if let Err(e) = recorded {
                    debug!("[PENDING-TX] Could not record warning on {}: {}", tx.id, e);
                }
            }
        }
    }

    async fn resubmit(&self, tx: &TransactionMeta, block_number: u64) -> Result<(), TxError> {
        let Some(first_retry) = tx.first_retry_block_number else {
            self.store.update_tx(tx.id, |tx| {
                tx.first_retry_block_number = Some(block_number);
                Ok(())
            })?;
            return Ok(());
        };

        if !retry_due(first_retry, tx.retry_count, block_number) {
            return Ok(());
        }
        let Some(raw_tx) = tx.raw_tx.as_deref() else {
            return Ok(());
        };
        self.check_balance(tx).await?;

        // Counted before sending so a failing node still backs off.
        self.store.update_tx(tx.id, |tx| {
            tx.retry_count = tx.retry_count.saturating_add(1);
            Ok(())
        })?;

        let hash = self.chain.send_raw_transaction(raw_tx).await?;
        info!(
            "[PENDING-TX] Resubmitted tx {} (attempt {}): {}",
            tx.id,
            tx.retry_count + 1,
            hash
        );
        Ok(())
    }

    /// The account must still cover `gas * gasPrice + value`.
    async fn check_balance(&self, tx: &TransactionMeta) -> Result<(), TxError> {
        let params = &tx.tx_params;
        let gas = parse_optional_quantity("gas", params.gas.as_deref())?.unwrap_or_default();
        let gas_price =
            parse_optional_quantity("gasPrice", params.gas_price.as_deref())?.unwrap_or_default();
        let value = parse_optional_quantity("value", params.value.as_deref())?.unwrap_or_default();
        let cost = gas.saturating_mul(gas_price).saturating_add(value);

        let balance = self.chain.get_balance(&params.from).await?;
        let balance = parse_chain_quantity("balance", &balance)?;
        if balance < cost {
            return Err(TxError::Broadcast(format!(
                "Insufficient balance: {} available, {} required",
                balance, cost
            )));
        }
        Ok(())
    }

    pub fn spawn(self: Arc<Self>, mut blocks: mpsc::Receiver<u64>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(block_number) = blocks.recv().await {
                self.on_new_block(block_number).await;
            }
            info!("[PENDING-TX] Block source closed, tracker stopped");
        })
    }
}

/// Due once `2^retry_count` blocks have passed since the first retry block.
pub fn retry_due(first_retry_block: u64, retry_count: u32, block_number: u64) -> bool {
    let blocks_since = block_number.saturating_sub(first_retry_block);
    let backoff = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    blocks_since >= backoff
}

pub fn is_benign_resubmit_error(message: &str) -> bool {
    let message = message.to_lowercase();
    BENIGN_RESUBMIT_ERRORS
        .iter()
        .any(|benign| message.contains(benign))
}

/// Emits each new latest-block number once. Stops when the receiver is gone.
pub async fn poll_new_blocks(
    chain: Arc<dyn ChainQuery>,
    interval: Duration,
    blocks: mpsc::Sender<u64>,
) {
    let mut ticker = time::interval(interval);
    let mut last_seen: Option<u64> = None;

    loop {
        ticker.tick().await;

        let number = match chain.get_block_by_number(BlockTag::Latest).await {
            Ok(block) => parse_chain_quantity("number", &block.number),
            Err(e) => Err(e),
        };
        let number = match number {
            Ok(n) => n.low_u64(),
            Err(e) => {
                warn!("[PENDING-TX] Block poll failed: {}", e);
                continue;
            }
        };

        if last_seen == Some(number) {
            continue;
        }
        last_seen = Some(number);

        if blocks.send(number).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{receipt, MockChain},
        types::{next_tx_id, TxParams},
    };

    const FROM: &str = "0xc684832530fcbddae4b4230a47e991ddcec2831d";

    struct Fixture {
        chain: Arc<MockChain>,
        store: Arc<TxStateStore>,
        tracker: Arc<PendingTxTracker>,
        _network: watch::Sender<String>,
    }

    fn fixture() -> Fixture {
        let (network, network_rx) = watch::channel("1".to_string());
        let chain = Arc::new(MockChain::new());
        let store = Arc::new(TxStateStore::new(40, network_rx.clone(), 64));
        let tracker = Arc::new(PendingTxTracker::new(store.clone(), chain.clone(), network_rx));
        Fixture {
            chain,
            store,
            tracker,
            _network: network,
        }
    }

    fn submitted(f: &Fixture, nonce: &str, hash: Option<&str>) -> u64 {
        let mut meta = TransactionMeta::new(
            next_tx_id(),
            "1",
            TxParams {
                from: FROM.to_string(),
                to: Some(FROM.to_string()),
                nonce: Some(nonce.to_string()),
                ..Default::default()
            },
        );
        meta.status = TxStatus::Submitted;
        meta.hash = hash.map(str::to_string);
        meta.raw_tx = Some("0xf86c01".to_string());
        f.store.add_tx(meta).unwrap().id
    }

    fn status(f: &Fixture, id: u64) -> TxStatus {
        f.store.get_tx(id).unwrap().status
    }

    #[tokio::test]
    async fn receipt_confirms() {
        let f = fixture();
        let id = submitted(&f, "0x0", Some("0xaa"));
        f.chain.set_receipt("0xaa", receipt("0xaa", 7));

        f.tracker.update_pending_txs().await;

        let tx = f.store.get_tx(id).unwrap();
        assert_eq!(tx.status, TxStatus::Confirmed);
        assert_eq!(tx.receipt.unwrap().block_number, Some(7));
        assert_eq!(f.tracker.get_confirmed_transactions(Some(FROM)).len(), 1);
        assert!(f.tracker.get_pending_transactions(Some(FROM)).is_empty());
    }

    #[tokio::test]
    async fn reverted_receipt_still_confirms() {
        let f = fixture();
        let id = submitted(&f, "0x0", Some("0xaa"));
        let mut reverted = receipt("0xaa", 7);
        reverted.status = Some(false);
        f.chain.set_receipt("0xaa", reverted);

        f.tracker.update_pending_txs().await;

        let tx = f.store.get_tx(id).unwrap();
        assert_eq!(tx.status, TxStatus::Confirmed);
        assert_eq!(tx.receipt.unwrap().status, Some(false));
    }

    #[tokio::test]
    async fn advanced_network_nonce_drops() {
        let f = fixture();
        let dropped = submitted(&f, "0x2", Some("0xaa"));
        let waiting = submitted(&f, "0x3", Some("0xbb"));
        f.chain.set_transaction_count(FROM, "0x3");

        f.tracker.update_pending_txs().await;

        assert_eq!(status(&f, dropped), TxStatus::Dropped);
        assert_eq!(status(&f, waiting), TxStatus::Submitted);
        // One nonce query per account per pass.
        assert_eq!(f.chain.transaction_count_calls(), 1);
    }

    #[tokio::test]
    async fn tx_mined_between_queries_is_confirmed_not_dropped() {
        let f = fixture();
        let id = submitted(&f, "0x0", Some("0xaa"));

        let chain = f.chain.clone();
        f.chain.before_next_transaction_count(move || {
            chain.set_receipt("0xaa", receipt("0xaa", 7));
            chain.set_transaction_count(FROM, "0x1");
        });

        f.tracker.update_pending_txs().await;

        let tx = f.store.get_tx(id).unwrap();
        assert_eq!(tx.status, TxStatus::Confirmed);
        assert_eq!(tx.receipt.unwrap().block_number, Some(7));
    }

    #[tokio::test]
    async fn query_errors_never_change_status() {
        let f = fixture();
        let id = submitted(&f, "0x0", Some("0xaa"));
        f.chain.fail_receipts(true);

        f.tracker.update_pending_txs().await;
        assert_eq!(status(&f, id), TxStatus::Submitted);

        f.chain.fail_receipts(false);
        f.chain.set_receipt("0xaa", receipt("0xaa", 9));
        f.tracker.update_pending_txs().await;
        assert_eq!(status(&f, id), TxStatus::Confirmed);
    }

    #[tokio::test]
    async fn missing_hash_fails() {
        let f = fixture();
        let id = submitted(&f, "0x0", None);

        f.tracker.update_pending_txs().await;

        let tx = f.store.get_tx(id).unwrap();
        assert_eq!(tx.status, TxStatus::Failed);
        assert!(tx.error.is_some());
    }

    #[tokio::test]
    async fn rejected_broadcast_tx_is_ignored() {
        let f = fixture();
        let id = submitted(&f, "0x0", Some("0xaa"));
        f.store.set_status_rejected(id).unwrap();
        f.chain.set_receipt("0xaa", receipt("0xaa", 7));

        f.tracker.update_pending_txs().await;

        assert_eq!(status(&f, id), TxStatus::Rejected);
    }

    #[test]
    fn backoff_doubles_per_retry() {
        assert!(!retry_due(10, 0, 10));
        assert!(retry_due(10, 0, 11));
        assert!(!retry_due(10, 1, 11));
        assert!(retry_due(10, 1, 12));
        assert!(!retry_due(10, 3, 17));
        assert!(retry_due(10, 3, 18));
        assert!(!retry_due(10, 200, u64::MAX - 1));
    }

    #[tokio::test]
    async fn resubmission_follows_backoff() {
        let f = fixture();
        let id = submitted(&f, "0x0", Some("0xaa"));

        // First sighting only records the block.
        f.tracker.resubmit_pending_txs(100).await;
        assert_eq!(f.store.get_tx(id).unwrap().first_retry_block_number, Some(100));
        assert!(f.chain.sent_raw_txs().is_empty());

        f.tracker.resubmit_pending_txs(101).await;
        assert_eq!(f.chain.sent_raw_txs().len(), 1);

        // retry_count is now 1: due at 102.
        f.tracker.resubmit_pending_txs(101).await;
        assert_eq!(f.chain.sent_raw_txs().len(), 1);
        f.tracker.resubmit_pending_txs(102).await;
        assert_eq!(f.chain.sent_raw_txs().len(), 2);

        let tx = f.store.get_tx(id).unwrap();
        assert_eq!(tx.retry_count, 2);
        assert_eq!(tx.status, TxStatus::Submitted);
    }

    #[tokio::test]
    async fn resubmit_errors_become_warnings_unless_benign() {
        let f = fixture();
        let id = submitted(&f, "0x0", Some("0xaa"));
        f.tracker.resubmit_pending_txs(1).await;

        f.chain.fail_send(Some("nonce too low"));
        f.tracker.resubmit_pending_txs(2).await;
        assert!(f.store.get_tx(id).unwrap().warning.is_none());

        f.chain.fail_send(Some("insufficient funds"));
        f.tracker.resubmit_pending_txs(10).await;
        let tx = f.store.get_tx(id).unwrap();
        assert!(tx.warning.unwrap().contains("insufficient funds"));
        assert_eq!(tx.status, TxStatus::Submitted);
    }

    #[tokio::test]
    async fn low_balance_skips_resubmission_with_warning() {
        let f = fixture();
        let mut meta = TransactionMeta::new(
            next_tx_id(),
            "1",
            TxParams {
                from: FROM.to_string(),
                to: Some(FROM.to_string()),
                nonce: Some("0x0".to_string()),
                gas: Some("0x5208".to_string()),
                gas_price: Some("0x3b9aca00".to_string()),
                value: Some("0x1".to_string()),
                ..Default::default()
            },
        );
        meta.status = TxStatus::Submitted;
        meta.hash = Some("0xaa".to_string());
        meta.raw_tx = Some("0xf86c01".to_string());
        let id = f.store.add_tx(meta).unwrap().id;
        // 21000 * 1 gwei + 1 wei is needed.
        f.chain.set_balance(FROM, "0x1319718a5000");

        f.tracker.resubmit_pending_txs(1).await;
        f.tracker.resubmit_pending_txs(2).await;

        let tx = f.store.get_tx(id).unwrap();
        assert!(f.chain.sent_raw_txs().is_empty());
        assert_eq!(tx.retry_count, 0);
        assert!(tx.warning.unwrap().contains("Insufficient balance"));
        assert_eq!(tx.status, TxStatus::Submitted);

        f.chain.set_balance(FROM, "0x1319718a5001");
        f.tracker.resubmit_pending_txs(3).await;
        assert_eq!(f.chain.sent_raw_txs().len(), 1);
    }

    #[tokio::test]
    async fn poller_feeds_spawned_tracker() {
        let f = fixture();
        let id = submitted(&f, "0x0", Some("0xaa"));
        f.chain.set_block_number(5);
        f.chain.set_receipt("0xaa", receipt("0xaa", 5));

        let (sender, receiver) = mpsc::channel(8);
        let poller = tokio::spawn(poll_new_blocks(
            f.chain.clone(),
            Duration::from_millis(10),
            sender,
        ));
        let tracker = f.tracker.clone().spawn(receiver);

        let mut events = f.store.subscribe();
        if status(&f, id) != TxStatus::Confirmed {
            time::timeout(Duration::from_secs(2), async {
                while status(&f, id) != TxStatus::Confirmed {
                    let _ = events.recv().await;
                }
            })
            .await
            .unwrap();
        }

        assert_eq!(status(&f, id), TxStatus::Confirmed);
        poller.abort();
        tracker.abort();
    }

    #[test]
    fn benign_errors_match_case_insensitively() {
        assert!(is_benign_resubmit_error("Known transaction: 0xabc"));
        assert!(is_benign_resubmit_error("Chain query failed: already known"));
        assert!(!is_benign_resubmit_error("insufficient funds"));
    }
}
