//! HTTP API for health checks, swap status, and operator triggers

use crate::config::ApiConfig;
use crate::error::{SwapError, SwapResult};
use crate::flow::{Flow, FlowSummary};
use crate::host::{HostRegistry, SwapHost};
use crate::swap::Secret;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hosts: Arc<HostRegistry>,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/hosts", get(get_hosts))
        .route("/hosts/:peer/swaps", get(list_swaps))
        .route("/hosts/:peer/swaps/:id", get(get_swap).delete(remove_swap))
        .route("/hosts/:peer/swaps/:id/secret", post(submit_secret))
        .route("/hosts/:peer/swaps/:id/sync-balance", post(sync_balance))
        .route("/hosts/:peer/swaps/:id/retry", post(retry_step))
        .route("/hosts/:peer/swaps/:id/refund", post(refund))
        .route("/hosts/:peer/swaps/:id/refund-tx", get(refund_tx))
        .route("/hosts/:peer/swaps/:id/request-withdraw", post(request_withdraw))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, hosts: Arc<HostRegistry>) -> SwapResult<()> {
    let app = router(AppState { hosts });

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SwapError::Internal(format!("bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| SwapError::Internal(e.to_string()))?;

    Ok(())
}

/// Error body returned by every failing endpoint
enum ApiError {
    UnknownPeer(String),
    Swap(SwapError),
}

impl From<SwapError> for ApiError {
    fn from(e: SwapError) -> Self {
        ApiError::Swap(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::UnknownPeer(peer) => (StatusCode::NOT_FOUND, format!("Unknown peer: {}", peer)),
            ApiError::Swap(e) => {
                let status = match &e {
                    SwapError::SwapNotFound(_) => StatusCode::NOT_FOUND,
                    SwapError::Precondition(_) | SwapError::StepMismatch { .. } => {
                        StatusCode::CONFLICT
                    }
                    SwapError::Config(_) | SwapError::UnknownStep(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    warn!("API request failed: {}", e);
                }
                (status, e.to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn host(state: &AppState, peer: &str) -> Result<Arc<SwapHost>, ApiError> {
    state
        .hosts
        .get(peer)
        .map(|h| h.clone())
        .ok_or_else(|| ApiError::UnknownPeer(peer.to_string()))
}

fn flow(state: &AppState, peer: &str, id: &str) -> Result<Arc<Flow>, ApiError> {
    Ok(host(state, peer)?.get(id)?)
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - every host's store answers
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let hosts: Vec<Arc<SwapHost>> = state.hosts.iter().map(|e| e.value().clone()).collect();

    let mut details = Vec::new();
    for host in hosts {
        let healthy = match host.health_check().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Store of {} is not ready: {}", host.peer_id(), e);
                false
            }
        };
        details.push(StoreHealth {
            peer_id: host.peer_id().to_string(),
            healthy,
        });
    }
    details.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

    let ready = details.iter().all(|d| d.healthy);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, stores: details }))
}

async fn get_hosts(State(state): State<AppState>) -> impl IntoResponse {
    let mut hosts: Vec<HostResponse> = state
        .hosts
        .iter()
        .map(|entry| {
            let host = entry.value();
            let identity = host.identity();
            HostResponse {
                peer_id: entry.key().clone(),
                script_address: identity.script_address.clone(),
                eth_address: identity.eth_address.clone(),
                assets: host.assets().iter().map(|a| a.to_string()).collect(),
                swaps: host.flows().len(),
            }
        })
        .collect();
    hosts.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    Json(hosts)
}

async fn list_swaps(
    State(state): State<AppState>,
    Path(peer): Path<String>,
) -> ApiResult<Vec<FlowSummary>> {
    let mut summaries = Vec::new();
    for flow in host(&state, &peer)?.flows() {
        summaries.push(flow.summary().await);
    }
    Ok(Json(summaries))
}

async fn get_swap(
    State(state): State<AppState>,
    Path((peer, id)): Path<(String, String)>,
) -> ApiResult<FlowSummary> {
    Ok(Json(flow(&state, &peer, &id)?.summary().await))
}

async fn remove_swap(
    State(state): State<AppState>,
    Path((peer, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    host(&state, &peer)?.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Commit the owner's secret; a random one is generated when none is given
async fn submit_secret(
    State(state): State<AppState>,
    Path((peer, id)): Path<(String, String)>,
    body: Option<Json<SecretRequest>>,
) -> ApiResult<SecretResponse> {
    let flow = flow(&state, &peer, &id)?;
    let secret = match body.and_then(|Json(b)| b.secret) {
        Some(hex) => hex.parse::<Secret>()?,
        None => Secret::random(),
    };
    let secret_hash = flow.submit_secret(secret).await?;
    Ok(Json(SecretResponse {
        secret_hash: secret_hash.to_string(),
    }))
}

async fn sync_balance(
    State(state): State<AppState>,
    Path((peer, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    flow(&state, &peer, &id)?.sync_balance().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn retry_step(
    State(state): State<AppState>,
    Path((peer, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    flow(&state, &peer, &id)?.retry_step().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn refund(
    State(state): State<AppState>,
    Path((peer, id)): Path<(String, String)>,
) -> ApiResult<TxResponse> {
    let tx_hash = flow(&state, &peer, &id)?.try_refund().await?;
    Ok(Json(TxResponse { tx_hash }))
}

async fn refund_tx(
    State(state): State<AppState>,
    Path((peer, id)): Path<(String, String)>,
) -> ApiResult<RefundTxResponse> {
    let hex = flow(&state, &peer, &id)?.get_refund_tx_hex().await?;
    Ok(Json(RefundTxResponse { hex }))
}

async fn request_withdraw(
    State(state): State<AppState>,
    Path((peer, id)): Path<(String, String)>,
) -> ApiResult<WithdrawRequestResponse> {
    let sent = flow(&state, &peer, &id)?.request_withdraw_assist().await?;
    Ok(Json(WithdrawRequestResponse { sent }))
}

// Request and response types

#[derive(Deserialize)]
struct SecretRequest {
    /// Hex pre-image
    secret: Option<String>,
}

#[derive(Serialize)]
struct SecretResponse {
    secret_hash: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    stores: Vec<StoreHealth>,
}

#[derive(Serialize)]
struct StoreHealth {
    peer_id: String,
    healthy: bool,
}

#[derive(Serialize)]
struct HostResponse {
    peer_id: String,
    script_address: String,
    eth_address: String,
    assets: Vec<String>,
    swaps: usize,
}

#[derive(Serialize)]
struct TxResponse {
    tx_hash: String,
}

#[derive(Serialize)]
struct RefundTxResponse {
    hex: String,
}

#[derive(Serialize)]
struct WithdrawRequestResponse {
    sent: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
