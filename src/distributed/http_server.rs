//! HTTP/JSON transport for participants and the coordinator.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use tokio::net::TcpListener;

use crate::distributed::coordinator::{Coordinator, CoordinatorStatus, Outcome};
use crate::distributed::messages::{
    ErrorResponse, PrepareRequest, StartRequest, StateResponse, TxidRequest, VoteResponse,
};
use crate::errors::PactumError;
use crate::participant::{Participant, ParticipantStatus};
use crate::twopc::{TransactionId, TransactionState, Vote};

/// Error type that converts to an HTTP response.
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorResponse::new(message),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorResponse::new(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<PactumError> for ApiError {
    fn from(err: PactumError) -> Self {
        match err {
            PactumError::InvalidState { state, .. } => Self {
                status: StatusCode::CONFLICT,
                body: ErrorResponse {
                    error: "invalid state".to_string(),
                    state,
                },
            },
            PactumError::TransactionInFlight(txid) => Self {
                status: StatusCode::CONFLICT,
                body: ErrorResponse::new(format!("transaction {txid} is already in flight")),
            },
            PactumError::InvalidTransactionId(_) | PactumError::Serialization(_) => {
                ApiError::bad_request(err.to_string())
            }
            PactumError::Transport(_) => Self {
                status: StatusCode::BAD_GATEWAY,
                body: ErrorResponse::new(err.to_string()),
            },
            PactumError::Durability(_) | PactumError::Config(_) => {
                error!("request failed: {}", err);
                ApiError::internal(err.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

/// Routes served by a participant node.
pub fn participant_router(participant: Arc<Participant>) -> Router {
    Router::new()
        .route("/prepare", post(prepare))
        .route("/can_commit", post(can_commit))
        .route("/precommit", post(precommit))
        .route("/commit", post(commit))
        .route("/abort", post(abort))
        .route("/status", get(participant_status))
        .with_state(participant)
}

/// Routes served by the coordinator.
pub fn coordinator_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/tx/start", post(start_transaction))
        .route("/status", get(coordinator_status))
        .with_state(coordinator)
}

/// Serves `router` on `listener` until Ctrl-C.
pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to install Ctrl-C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

/// Runs a participant call on the blocking pool; every transition fsyncs.
async fn run_blocking<T, F>(participant: Arc<Participant>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Participant) -> crate::errors::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&participant))
        .await
        .map_err(|e| ApiError::internal(format!("participant task failed: {e}")))?
        .map_err(ApiError::from)
}

async fn prepare(
    State(participant): State<Arc<Participant>>,
    body: Result<Json<PrepareRequest>, JsonRejection>,
) -> Result<Json<VoteResponse>, ApiError> {
    let Json(request) = body?;
    let txid = TransactionId::new(request.txid)?;
    let vote: Vote = run_blocking(participant, move |p| p.prepare(&txid, &request.op)).await?;
    Ok(Json(VoteResponse { vote }))
}

async fn can_commit(
    State(participant): State<Arc<Participant>>,
    body: Result<Json<PrepareRequest>, JsonRejection>,
) -> Result<Json<VoteResponse>, ApiError> {
    let Json(request) = body?;
    let txid = TransactionId::new(request.txid)?;
    let vote = run_blocking(participant, move |p| p.can_commit(&txid, &request.op)).await?;
    Ok(Json(VoteResponse { vote }))
}

async fn transition<F>(
    participant: Arc<Participant>,
    body: Result<Json<TxidRequest>, JsonRejection>,
    f: F,
) -> Result<Json<StateResponse>, ApiError>
where
    F: FnOnce(&Participant, &TransactionId) -> crate::errors::Result<TransactionState>
        + Send
        + 'static,
{
    let Json(request) = body?;
    let txid = TransactionId::new(request.txid)?;
    let state = run_blocking(participant, move |p| f(p, &txid)).await?;
    Ok(Json(StateResponse { state }))
}

async fn precommit(
    State(participant): State<Arc<Participant>>,
    body: Result<Json<TxidRequest>, JsonRejection>,
) -> Result<Json<StateResponse>, ApiError> {
    transition(participant, body, |p, txid| p.precommit(txid)).await
}

async fn commit(
    State(participant): State<Arc<Participant>>,
    body: Result<Json<TxidRequest>, JsonRejection>,
) -> Result<Json<StateResponse>, ApiError> {
    transition(participant, body, |p, txid| p.commit(txid)).await
}

async fn abort(
    State(participant): State<Arc<Participant>>,
    body: Result<Json<TxidRequest>, JsonRejection>,
) -> Result<Json<StateResponse>, ApiError> {
    transition(participant, body, |p, txid| p.abort(txid)).await
}

async fn participant_status(
    State(participant): State<Arc<Participant>>,
) -> Json<ParticipantStatus> {
    Json(participant.status())
}

async fn start_transaction(
    State(coordinator): State<Arc<Coordinator>>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<Outcome>, ApiError> {
    let Json(request) = body?;
    let (Some(txid), Some(op)) = (request.txid, request.op) else {
        return Err(ApiError::bad_request("txid and op required"));
    };
    let txid = TransactionId::new(txid)?;
    // Detached so a client that hangs up cannot stop the run between
    // PREPARE and the broadcast.
    let protocol = request.protocol;
    let outcome = tokio::spawn(async move { coordinator.run(txid, op, protocol).await })
        .await
        .map_err(|e| ApiError::internal(format!("coordinator task failed: {e}")))??;
    Ok(Json(outcome))
}

async fn coordinator_status(
    State(coordinator): State<Arc<Coordinator>>,
) -> Json<CoordinatorStatus> {
    Json(coordinator.status())
}
