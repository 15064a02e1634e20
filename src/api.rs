// TRANSACTION LIFECYCLE - HTTP API
// Handles: intake, approval, cancel/replace, queries, network switching

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    controller::TransactionController,
    error::TxError,
    pending::PendingTxTracker,
    types::{get_chain_name, get_current_timestamp, TxId, TxParams, TxStatus},
};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<TransactionController>,
    pub tracker: Arc<PendingTxTracker>,
    pub started_at: u64,
}

impl AppState {
    pub fn new(controller: Arc<TransactionController>, tracker: Arc<PendingTxTracker>) -> Self {
        Self {
            controller,
            tracker,
            started_at: get_current_timestamp(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<TxStatus>,
    from: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplaceRequest {
    gas_price: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkRequest {
    network_id: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/transactions", post(add_tx_handler).get(list_txs_handler))
        .route("/transactions/:id", get(get_tx_handler))
        .route("/transactions/:id/approve", post(approve_tx_handler))
        .route("/transactions/:id/cancel", post(cancel_tx_handler))
        .route("/transactions/:id/speed-up", post(speed_up_handler))
        .route("/transactions/:id/cancel-replacement", post(cancel_replacement_handler))
        .route("/accounts/:address/pending", get(pending_txs_handler))
        .route("/network", post(set_network_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "wallet-tx-lifecycle",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "healthy",
        "networkId": state.controller.network_id(),
        "trackedTransactions": state.controller.store().len()
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let controller = &state.controller;
    Json(serde_json::json!({
        "networkId": controller.network_id(),
        "chainName": get_chain_name(controller.get_chain_id()),
        "unapprovedCount": controller.get_unapproved_tx_count(),
        "pendingCount": controller.get_pending_tx_count(),
        "trackedTransactions": controller.store().len(),
        "uptime": get_current_timestamp().saturating_sub(state.started_at)
    }))
}

async fn add_tx_handler(
    State(state): State<AppState>,
    Json(params): Json<TxParams>,
) -> Result<impl IntoResponse, TxError> {
    let tx = state.controller.add_unapproved_transaction(params).await?;
    Ok(Json(serde_json::json!({ "success": true, "tx": tx })))
}

async fn list_txs_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let txs = state.controller.get_transactions(query.status, query.from);
    Json(serde_json::json!({ "count": txs.len(), "transactions": txs }))
}

async fn get_tx_handler(
    State(state): State<AppState>,
    Path(id): Path<TxId>,
) -> Result<impl IntoResponse, TxError> {
    Ok(Json(state.controller.get_tx(id)?))
}

async fn approve_tx_handler(
    State(state): State<AppState>,
    Path(id): Path<TxId>,
) -> Result<impl IntoResponse, TxError> {
    let tx = state.controller.approve_transaction(id).await?;
    Ok(Json(serde_json::json!({ "success": true, "tx": tx })))
}

async fn cancel_tx_handler(
    State(state): State<AppState>,
    Path(id): Path<TxId>,
) -> Result<impl IntoResponse, TxError> {
    let tx = state.controller.cancel_transaction(id)?;
    Ok(Json(serde_json::json!({ "success": true, "tx": tx })))
}

async fn speed_up_handler(
    State(state): State<AppState>,
    Path(id): Path<TxId>,
    body: Option<Json<ReplaceRequest>>,
) -> Result<impl IntoResponse, TxError> {
    let Json(req) = body.unwrap_or_default();
    let tx = state.controller.speed_up_transaction(id, req.gas_price).await?;
    Ok(Json(serde_json::json!({ "success": true, "tx": tx })))
}

async fn cancel_replacement_handler(
    State(state): State<AppState>,
    Path(id): Path<TxId>,
    body: Option<Json<ReplaceRequest>>,
) -> Result<impl IntoResponse, TxError> {
    let Json(req) = body.unwrap_or_default();
    let tx = state
        .controller
        .create_cancel_transaction(id, req.gas_price)
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "tx": tx })))
}

async fn pending_txs_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let txs = state.tracker.get_pending_transactions(Some(&address));
    Json(serde_json::json!({
        "address": address.to_lowercase(),
        "count": txs.len(),
        "transactions": txs
    }))
}

async fn set_network_handler(
    State(state): State<AppState>,
    Json(req): Json<NetworkRequest>,
) -> Result<impl IntoResponse, TxError> {
    state.controller.set_network_id(&req.network_id).await?;
    info!("[API] Active network is now {}", req.network_id);
    Ok(Json(serde_json::json!({
        "success": true,
        "networkId": req.network_id,
        "chainId": state.controller.get_chain_id()
    })))
}
