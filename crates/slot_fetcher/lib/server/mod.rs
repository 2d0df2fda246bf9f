pub mod monitoring;
use crate::fetch_service::filter::transaction_count;
use crate::fetch_service::rpc_client::BlockFetchError;
use crate::fetch_service::types::{BlockPayload, Slot};
use crate::state::AppState;
use prometheus_client::encoding::text::encode;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use monitoring::FETCH_METRICS;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, warn};

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

async fn health_handler() -> String {
    "Healthy".to_string()
}

async fn expose_metrics(state: State<Arc<AppState>>) -> Result<String, StatusCode> {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    encode(&mut buffer, &registry).map_err(|err| {
        error!(event = "metrics_encode_failed", error = %err, "failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(buffer)
}

/// Condensed view of a block for quick inspection.
pub fn block_summary(slot: Slot, block: &BlockPayload) -> Value {
    let mut summary = json!({
        "blockNumber": slot,
        "blockhash": block.get("blockhash").cloned().unwrap_or(Value::Null),
        "parentSlot": block.get("parentSlot").cloned().unwrap_or(Value::Null),
        "transactionCount": transaction_count(block),
        "rewardCount": block
            .get("rewards")
            .and_then(Value::as_array)
            .map_or(0, |rewards| rewards.len()),
    });
    for key in ["blockHeight", "blockTime"] {
        if let Some(value) = block.get(key).filter(|value| !value.is_null()) {
            summary[key] = value.clone();
        }
    }
    summary
}

async fn load_block(state: &AppState, raw_slot: &str) -> Result<(Slot, BlockPayload), ApiError> {
    let slot: Slot = raw_slot.parse().map_err(|_| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("invalid slot `{raw_slot}`: expected a non-negative integer"),
        )
    })?;
    let client = state.rpc.as_ref().ok_or_else(|| {
        api_error(StatusCode::SERVICE_UNAVAILABLE, "no RPC endpoint configured")
    })?;

    match client.fetch_block(slot).await {
        Ok(Some(block)) => Ok((slot, block)),
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no block available for slot {slot}"),
        )),
        Err(err) => {
            warn!(
                event = "block_lookup_failed",
                slot,
                error = %err,
                "single-slot getBlock failed"
            );
            let message = match &err {
                BlockFetchError::Provider { .. } => err.to_string(),
                BlockFetchError::Transport(transport) => {
                    format!("RPC transport error ({}): {transport}", transport.failure_class)
                }
            };
            Err(api_error(StatusCode::BAD_GATEWAY, message))
        }
    }
}

async fn block_handler(
    State(state): State<Arc<AppState>>,
    Path(raw_slot): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let (_, block) = load_block(&state, &raw_slot).await?;
    Ok(Json(block))
}

async fn block_summary_handler(
    State(state): State<Arc<AppState>>,
    Path(raw_slot): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let (slot, block) = load_block(&state, &raw_slot).await?;
    Ok(Json(block_summary(slot, &block)))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .route("/block/{slot}", get(block_handler))
        .route("/block/{slot}/summary", get(block_summary_handler))
        .with_state(state)
}

/// Exposes the process-wide fetch metrics through the state's registry.
pub async fn register_metrics(state: &AppState) {
    let mut registry = state.registry.write().await;

    FETCH_METRICS
        .get_or_init(|| async { monitoring::FetchMetrics::new() })
        .await
        .register(&mut registry, "fetcher");

    monitoring::register_build_info_metric(&mut registry, "fetcher");
}

/// Starts the health/metrics HTTP server on the supplied socket address.
pub async fn setup_server_with_addr(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    Ok(setup_server_with_listener(state, listener).await)
}

/// Serves on an already bound listener until the state's shutdown token fires.
pub async fn setup_server_with_listener(
    state: Arc<AppState>,
    listener: TcpListener,
) -> tokio::task::JoinHandle<()> {
    register_metrics(&state).await;

    let shutdown_token = state.shutdown_token.clone();
    let app = router(state);
    tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;
        if let Err(err) = served {
            error!(event = "http_server_failed", error = %err, "metrics server stopped");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::block_summary;
    use serde_json::json;

    #[test]
    fn summary_counts_transactions_and_rewards() {
        let block = json!({
            "blockhash": "abc",
            "parentSlot": 41,
            "blockHeight": 30,
            "blockTime": null,
            "transactions": [{}, {}, {}],
            "rewards": [{}]
        });

        assert_eq!(
            block_summary(42, &block),
            json!({
                "blockNumber": 42,
                "blockhash": "abc",
                "parentSlot": 41,
                "transactionCount": 3,
                "rewardCount": 1,
                "blockHeight": 30
            })
        );
    }

    #[test]
    fn summary_tolerates_sparse_blocks() {
        let summary = block_summary(7, &json!({}));
        assert_eq!(summary["transactionCount"], 0);
        assert_eq!(summary["rewardCount"], 0);
        assert!(summary["blockhash"].is_null());
        assert!(summary.get("blockTime").is_none());
    }
}
