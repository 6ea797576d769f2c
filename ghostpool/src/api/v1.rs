//! API version 1 endpoints.

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::pool::BalanceStore;
use crate::stratum::EngineHandle;
use crate::tracing::prelude::*;
use crate::treasury::{CoinbaseNotice, HandledCoinbases, RewardEvent};

/// Shared application state for API endpoints.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: EngineHandle,
    pub store: Arc<dyn BalanceStore>,
    /// Fee-split rewards for the allocator.
    pub rewards: mpsc::Sender<RewardEvent>,
    /// Coinbase transactions already queued.
    pub handled: Arc<Mutex<HandledCoinbases>>,
}

/// API error response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Health check endpoint handler.
async fn health() -> &'static str {
    "OK"
}

/// Effective configuration, after defaults and overrides.
async fn config(State(state): State<AppState>) -> Json<Config> {
    Json(state.config.as_ref().clone())
}

/// Pool and per-worker statistics.
///
/// # Example
/// ```bash
/// curl http://localhost:9100/api/v1/stats
/// ```
async fn stats(State(state): State<AppState>) -> Response {
    match state.engine.snapshot().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

async fn balances(State(state): State<AppState>) -> Response {
    match state.store.read_all().await {
        Ok(balances) => Json(balances).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to read balances");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

/// Matured coinbase notification from the treasury.
///
/// The pool fee is split off here and the rest queued for allocation.
/// Answers 202 with the queued event, or 200 with the event if the
/// transaction was already queued.
///
/// # Example
/// ```bash
/// curl -X POST http://localhost:9100/api/v1/treasury/coinbase \
///    -H "Content-Type: application/json" \
///    -d '{"reward": 50000000000, "txnId": "ab12...", "daaScore": 1234}'
/// ```
async fn coinbase(State(state): State<AppState>, Json(notice): Json<CoinbaseNotice>) -> Response {
    let event = RewardEvent::from_coinbase(notice, state.config.treasury.fee);
    if !state.handled.lock().insert(&event.txn_id) {
        debug!(txn_id = %event.txn_id, "Coinbase already queued");
        return (StatusCode::OK, Json(event)).into_response();
    }
    info!(
        txn_id = %event.txn_id,
        miner_reward = event.miner_reward,
        pool_fee = event.pool_fee,
        "Coinbase matured"
    );

    match state.rewards.send(event.clone()).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(event)).into_response(),
        Err(_) => {
            state.handled.lock().remove(&event.txn_id);
            warn!(txn_id = %event.txn_id, "Reward allocator not running, coinbase dropped");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "reward allocator not running")
        }
    }
}

/// Build the v1 API routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(config))
        .route("/stats", get(stats))
        .route("/balances", get(balances))
        .route("/treasury/coinbase", post(coinbase))
        .with_state(state)
}
