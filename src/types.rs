// TRANSACTION LIFECYCLE - DATA MODEL
// Handles: transaction records, status machine, params, ids, chain names

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::history::HistoryEntry;

pub type TxId = u64;

// ============================================================================
// STATUS MACHINE
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Unapproved,
    Approved,
    Signed,
    Submitted,
    Confirmed,
    Failed,
    Rejected,
    Dropped,
}

impl TxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::Unapproved => "unapproved",
            TxStatus::Approved => "approved",
            TxStatus::Signed => "signed",
            TxStatus::Submitted => "submitted",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
            TxStatus::Rejected => "rejected",
            TxStatus::Dropped => "dropped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxStatus::Confirmed | TxStatus::Failed | TxStatus::Rejected | TxStatus::Dropped
        )
    }

    /// Statuses whose nonce is reserved on the network or about to be.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            TxStatus::Approved | TxStatus::Signed | TxStatus::Submitted
        )
    }

    /// Forward transitions only. Cancellation of an arbitrary status goes
    /// through the store's override path instead.
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        use TxStatus::*;
        matches!(
            (self, next),
            (Unapproved, Approved)
                | (Unapproved, Rejected)
                | (Approved, Signed)
                | (Approved, Failed)
                | (Approved, Rejected)
                | (Signed, Submitted)
                | (Signed, Failed)
                | (Signed, Rejected)
                | (Submitted, Confirmed)
                | (Submitted, Failed)
                | (Submitted, Dropped)
                | (Submitted, Rejected)
        )
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// Quantities are `0x`-prefixed hex strings; see `hex_quantity`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TxParams {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub transaction_hash: String,
    pub block_number: Option<u64>,
    pub gas_used: Option<String>,
    /// `Some(false)` when execution reverted.
    pub status: Option<bool>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    pub id: TxId,
    pub time: u64,
    pub status: TxStatus,
    pub network_id: String,
    pub tx_params: TxParams,
    pub raw_tx: Option<String>,
    pub hash: Option<String>,
    pub estimated_gas: Option<String>,
    pub gas_limit_specified: bool,
    pub simulation_fails: bool,
    pub delegate_call_warning: bool,
    pub retry_count: u32,
    pub first_retry_block_number: Option<u64>,
    pub last_gas_price: Option<String>,
    pub replaces_id: Option<TxId>,
    pub receipt: Option<TxReceipt>,
    pub error: Option<String>,
    pub warning: Option<String>,
    pub history: Vec<HistoryEntry>,
}

impl TransactionMeta {
    pub fn new(id: TxId, network_id: impl Into<String>, tx_params: TxParams) -> Self {
        Self {
            id,
            time: get_current_timestamp(),
            status: TxStatus::Unapproved,
            network_id: network_id.into(),
            tx_params,
            raw_tx: None,
            hash: None,
            estimated_gas: None,
            gas_limit_specified: false,
            simulation_fails: false,
            delegate_call_warning: false,
            retry_count: 0,
            first_retry_block_number: None,
            last_gas_price: None,
            replaces_id: None,
            receipt: None,
            error: None,
            warning: None,
            history: Vec::new(),
        }
    }

    pub fn is_from(&self, address: &str) -> bool {
        self.tx_params.from.eq_ignore_ascii_case(address)
    }
}

// ============================================================================
// UTILITY FUNCTIONS
// ============================================================================

lazy_static::lazy_static! {
    static ref CHAIN_NAMES: HashMap<u64, &'static str> = {
        let mut m = HashMap::new();
        m.insert(1, "Ethereum");
        m.insert(3, "Ropsten");
        m.insert(4, "Rinkeby");
        m.insert(5, "Goerli");
        m.insert(42, "Kovan");
        m.insert(56, "BSC");
        m.insert(137, "Polygon");
        m.insert(42161, "Arbitrum");
        m.insert(10, "Optimism");
        m.insert(43114, "Avalanche");
        m.insert(8453, "Base");
        m.insert(11155111, "Sepolia");
        m
    };

    static ref TX_ID_COUNTER: AtomicU64 =
        AtomicU64::new(rand::thread_rng().gen_range(0..u64::from(u32::MAX)));
}

pub fn get_current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub fn get_chain_name(chain_id: u64) -> String {
    CHAIN_NAMES
        .get(&chain_id)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("Chain {}", chain_id))
}

/// Process-unique, starting from a random offset.
pub fn next_tx_id() -> TxId {
    TX_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}
