// TRANSACTION LIFECYCLE - ERROR TAXONOMY
// Handles: error variants for validation, nonce contention, chain queries, store invariants

use axum::{http::StatusCode, response::IntoResponse, Json};

use crate::types::{TxId, TxStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    /// Malformed or negative input. Never reaches the network layer.
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Timed out waiting for nonce lock on {address}")]
    NonceLockTimeout { address: String },
    #[error("Chain query failed: {0}")]
    ChainQuery(String),
    #[error("Transaction {0} already exists")]
    DuplicateId(TxId),
    #[error("Transaction {0} not found")]
    NotFound(TxId),
    #[error("Invalid status transition for transaction {id}: {from} -> {to}")]
    InvalidTransition {
        id: TxId,
        from: TxStatus,
        to: TxStatus,
    },
    #[error("User denied transaction signature")]
    UserDenied,
    #[error("Signing failed: {0}")]
    Signing(String),
    #[error("Broadcast failed: {0}")]
    Broadcast(String),
    #[error("Transaction {id} failed: {reason}")]
    TransactionFailed { id: TxId, reason: String },
}

impl TxError {
    /// Contention and node errors may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxError::NonceLockTimeout { .. } | TxError::ChainQuery(_))
    }
}

impl IntoResponse for TxError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            TxError::InvalidParams(_) => StatusCode::BAD_REQUEST,
            TxError::NonceLockTimeout { .. } => StatusCode::CONFLICT,
            TxError::ChainQuery(_) => StatusCode::BAD_GATEWAY,
            TxError::DuplicateId(_) => StatusCode::CONFLICT,
            TxError::NotFound(_) => StatusCode::NOT_FOUND,
            TxError::InvalidTransition { .. } => StatusCode::CONFLICT,
            TxError::UserDenied => StatusCode::FORBIDDEN,
            TxError::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TxError::Broadcast(_) => StatusCode::BAD_GATEWAY,
            TxError::TransactionFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        };

        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
