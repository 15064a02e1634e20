//! Transaction lifecycle core for a wallet backend: per-account nonce
//! allocation, gas estimation, a validated transaction state machine and
//! reconciliation of submitted transactions against chain state.

pub mod api;
pub mod chain;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod gas;
pub mod history;
pub mod hex_quantity;
pub mod nonce;
pub mod pending;
pub mod signer;
pub mod store;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use config::Config;
pub use controller::TransactionController;
pub use error::TxError;
pub use pending::PendingTxTracker;
pub use types::{TransactionMeta, TxId, TxParams, TxStatus};
