// TRANSACTION LIFECYCLE - TRANSACTION STATE STORE
// Handles: in-memory records, atomic updates, status validation, pruning, change events

use dashmap::{mapref::entry::Entry, DashMap};
use std::collections::HashSet;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::{
    error::TxError,
    history::push_history,
    types::{get_current_timestamp, TransactionMeta, TxId, TxStatus},
};

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone)]
pub enum TxEvent {
    Added(TransactionMeta),
    Updated(TransactionMeta),
    StatusChanged {
        id: TxId,
        status: TxStatus,
        tx: TransactionMeta,
    },
    BadgeUpdate {
        unapproved: usize,
        pending: usize,
    },
}

impl TxEvent {
    pub fn tx_id(&self) -> Option<TxId> {
        match self {
            TxEvent::Added(tx) | TxEvent::Updated(tx) => Some(tx.id),
            TxEvent::StatusChanged { id, .. } => Some(*id),
            TxEvent::BadgeUpdate { .. } => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TxEvent::Added(tx) => serde_json::json!({
                "event": "TX_ADDED",
                "txId": tx.id,
                "status": tx.status,
                "networkId": tx.network_id,
                "timestamp": get_current_timestamp()
            }),
            TxEvent::Updated(tx) => serde_json::json!({
                "event": "TX_UPDATED",
                "txId": tx.id,
                "status": tx.status,
                "txHash": tx.hash,
                "timestamp": get_current_timestamp()
            }),
            TxEvent::StatusChanged { id, status, tx } => serde_json::json!({
                "event": "TX_STATUS_CHANGED",
                "txId": id,
                "status": status,
                "txHash": tx.hash,
                "networkId": tx.network_id,
                "timestamp": get_current_timestamp()
            }),
            TxEvent::BadgeUpdate {
                unapproved,
                pending,
            } => serde_json::json!({
                "event": "BADGE_UPDATE",
                "unapprovedCount": unapproved,
                "pendingCount": pending,
                "timestamp": get_current_timestamp()
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TxFilter {
    pub status: Option<TxStatus>,
    pub from: Option<String>,
    pub network_id: Option<String>,
    pub nonce: Option<String>,
}

impl TxFilter {
    fn matches(&self, tx: &TransactionMeta) -> bool {
        self.status.map_or(true, |s| tx.status == s)
            && self.from.as_deref().map_or(true, |from| tx.is_from(from))
            && self
                .network_id
                .as_deref()
                .map_or(true, |network| tx.network_id == network)
            && self
                .nonce
                .as_deref()
                .map_or(true, |nonce| tx.tx_params.nonce.as_deref() == Some(nonce))
    }
}

// ============================================================================
// STORE
// ============================================================================

pub struct TxStateStore {
    txs: DashMap<TxId, TransactionMeta>,
    tx_history_limit: usize,
    network: watch::Receiver<String>,
    events: broadcast::Sender<TxEvent>,
}

impl TxStateStore {
    pub fn new(
        tx_history_limit: usize,
        network: watch::Receiver<String>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            txs: DashMap::new(),
            tx_history_limit,
            network,
            events,
        }
    }

    /// Events arrive in mutation order.
    pub fn subscribe(&self) -> broadcast::Receiver<TxEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn add_tx(&self, mut meta: TransactionMeta) -> Result<TransactionMeta, TxError> {
        let id = meta.id;
        if meta.history.is_empty() {
            push_history(&mut meta);
        }

        match self.txs.entry(id) {
            Entry::Occupied(_) => return Err(TxError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(meta.clone());
            }
        }

        debug!("[TX-STORE] Added tx {} ({})", id, meta.status);
        self.prune(&meta.tx_params.from, &meta.network_id);

        self.emit(TxEvent::Added(meta.clone()));
        self.emit_badge();
        Ok(meta)
    }

    pub fn get_tx(&self, id: TxId) -> Option<TransactionMeta> {
        self.txs.get(&id).map(|tx| tx.clone())
    }

    /// Snapshot ordered by creation time, then id.
    pub fn get_tx_list(&self, filter: &TxFilter) -> Vec<TransactionMeta> {
        let mut list: Vec<TransactionMeta> = self
            .txs
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        list.sort_by_key(|tx| (tx.time, tx.id));
        list
    }

    /// Applies `mutator` to a copy under the entry's write lock and writes it
    /// back only on success, appending one history entry. `id` and `history`
    /// cannot be changed by the mutator.
    pub fn update_tx<F>(&self, id: TxId, mutator: F) -> Result<TransactionMeta, TxError>
    where
        F: FnOnce(&mut TransactionMeta) -> Result<(), TxError>,
    {
        let updated = {
            let mut entry = self.txs.get_mut(&id).ok_or(TxError::NotFound(id))?;
            let mut draft = entry.clone();
            let history = std::mem::take(&mut draft.history);

            mutator(&mut draft)?;

            draft.id = id;
            draft.history = history;
            push_history(&mut draft);
            *entry = draft.clone();
            draft
        };

        self.emit(TxEvent::Updated(updated.clone()));
        Ok(updated)
    }

    /// Validated forward transition.
    pub fn set_status(&self, id: TxId, status: TxStatus) -> Result<TransactionMeta, TxError> {
        let updated = self.update_tx(id, |tx| {
            if !tx.status.can_transition_to(status) {
                return Err(TxError::InvalidTransition {
                    id,
                    from: tx.status,
                    to: status,
                });
            }
            tx.status = status;
            Ok(())
        })?;

        self.emit_status_change(&updated);
        Ok(updated)
    }

    /// Records the failure reason together with the `failed` transition.
    pub fn set_status_failed(&self, id: TxId, reason: &str) -> Result<TransactionMeta, TxError> {
        let updated = self.update_tx(id, |tx| {
            if !tx.status.can_transition_to(TxStatus::Failed) {
                return Err(TxError::InvalidTransition {
                    id,
                    from: tx.status,
                    to: TxStatus::Failed,
                });
            }
            tx.status = TxStatus::Failed;
            tx.error = Some(reason.to_string());
            Ok(())
        })?;

        self.emit_status_change(&updated);
        Ok(updated)
    }

    /// Moves any record to `rejected`. Already-rejected records are returned
    /// untouched.
    pub fn set_status_rejected(&self, id: TxId) -> Result<TransactionMeta, TxError> {
        let current = self.get_tx(id).ok_or(TxError::NotFound(id))?;
        if current.status == TxStatus::Rejected {
            return Ok(current);
        }

        let mut changed = false;
        let updated = self.update_tx(id, |tx| {
            changed = tx.status != TxStatus::Rejected;
            tx.status = TxStatus::Rejected;
            Ok(())
        })?;

        if changed {
            self.emit_status_change(&updated);
        }
        Ok(updated)
    }

    /// Removes every record of `address` on `network_id`.
    pub fn wipe_transactions(&self, address: &str, network_id: &str) -> usize {
        let before = self.txs.len();
        self.txs
            .retain(|_, tx| !(tx.is_from(address) && tx.network_id == network_id));
        let removed = before.saturating_sub(self.txs.len());
        if removed > 0 {
            info!("[TX-STORE] Wiped {} txs for {}", removed, address);
            self.emit_badge();
        }
        removed
    }

    pub fn unapproved_count(&self) -> usize {
        self.count_on_current_network(TxStatus::Unapproved)
    }

    pub fn pending_count(&self) -> usize {
        self.count_on_current_network(TxStatus::Submitted)
    }

    fn count_on_current_network(&self, status: TxStatus) -> usize {
        let network = self.network.borrow().clone();
        self.txs
            .iter()
            .filter(|entry| entry.status == status && entry.network_id == network)
            .count()
    }

    /// Drops the oldest finalized records of one (account, network) scope
    /// until the scope fits the limit. Unfinalized records are never dropped.
    fn prune(&self, from: &str, network_id: &str) {
        let scope = TxFilter {
            from: Some(from.to_string()),
            network_id: Some(network_id.to_string()),
            ..Default::default()
        };
        let scoped = self.get_tx_list(&scope);
        if scoped.len() <= self.tx_history_limit {
            return;
        }

        let excess = scoped.len() - self.tx_history_limit;
        let doomed: HashSet<TxId> = scoped
            .iter()
            .filter(|tx| tx.status.is_terminal())
            .take(excess)
            .map(|tx| tx.id)
            .collect();

        for id in &doomed {
            self.txs.remove(id);
        }
        if !doomed.is_empty() {
            debug!(
                "[TX-STORE] Pruned {} finalized txs for {} on network {}",
                doomed.len(),
                from,
                network_id
            );
        }
    }

    fn emit_status_change(&self, tx: &TransactionMeta) {
        info!("[TX-STORE] Tx {} -> {}", tx.id, tx.status);
        self.emit(TxEvent::StatusChanged {
            id: tx.id,
            status: tx.status,
            tx: tx.clone(),
        });
        self.emit_badge();
    }

    fn emit_badge(&self) {
        self.emit(TxEvent::BadgeUpdate {
            unapproved: self.unapproved_count(),
            pending: self.pending_count(),
        });
    }

    fn emit(&self, event: TxEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
