//! Delegator control-plane HTTP surface.

use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::ErrorCode;
use crate::{AwcpError, Result};

use super::engine::{CreateDelegation, DelegatorEngine};

/// Handler for `GET /health` — liveness probe.
async fn health() -> &'static str {
    "ok"
}

/// JSON error body returned by the control plane.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

/// Control-plane error wrapper mapping domain errors to HTTP statuses.
struct ApiError(AwcpError);

impl From<AwcpError> for ApiError {
    fn from(err: AwcpError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            AwcpError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error: msg.clone(),
                    code: Some(ErrorCode::NotFound),
                    hint: None,
                },
            ),
            AwcpError::Protocol(err) => {
                let status = match err.code {
                    ErrorCode::NotFound => StatusCode::NOT_FOUND,
                    ErrorCode::WorkspaceTooLarge | ErrorCode::Declined => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    ErrorCode::AuthFailed => StatusCode::UNAUTHORIZED,
                    _ => StatusCode::CONFLICT,
                };
                (
                    status,
                    ErrorBody {
                        error: err.message.clone(),
                        code: Some(err.code),
                        hint: err.hint.clone(),
                    },
                )
            }
            AwcpError::Config(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: msg.clone(),
                    code: None,
                    hint: None,
                },
            ),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    error: other.to_string(),
                    code: None,
                    hint: None,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Body of a successful `POST /delegate`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DelegateResponse {
    delegation_id: String,
}

/// Handler for `POST /delegate` — create and launch a delegation.
async fn create_delegation(
    State(engine): State<DelegatorEngine>,
    Json(params): Json<CreateDelegation>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let record = engine.delegate(params).await?;
    info!(delegation_id = %record.id, "delegation accepted via control plane");
    Ok((
        StatusCode::ACCEPTED,
        Json(DelegateResponse {
            delegation_id: record.id,
        }),
    ))
}

/// Handler for `GET /delegation/{id}` — the current record.
async fn get_delegation(
    State(engine): State<DelegatorEngine>,
    Path(id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let record = engine.get(&id).await?;
    Ok(Json(record))
}

/// Handler for `GET /delegation/{id}/snapshots`.
async fn list_snapshots(
    State(engine): State<DelegatorEngine>,
    Path(id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let snapshots = engine.list_snapshots(&id).await?;
    Ok(Json(snapshots))
}

/// Handler for `POST /delegation/{id}/snapshots/{sid}/apply`.
async fn apply_snapshot(
    State(engine): State<DelegatorEngine>,
    Path((id, sid)): Path<(String, String)>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    engine.apply_snapshot(&id, &sid).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// Handler for `POST /delegation/{id}/snapshots/{sid}/discard`.
async fn discard_snapshot(
    State(engine): State<DelegatorEngine>,
    Path((id, sid)): Path<(String, String)>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    engine.discard_snapshot(&id, &sid).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// Query options for `DELETE /delegation/{id}`.
#[derive(Debug, Deserialize)]
struct CancelOptions {
    /// Also delete the record, export tree, and staged snapshots.
    #[serde(default)]
    purge: bool,
}

/// Handler for `DELETE /delegation/{id}` — cancel, optionally purge.
async fn cancel_delegation(
    State(engine): State<DelegatorEngine>,
    Path(id): Path<String>,
    Query(options): Query<CancelOptions>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    if options.purge {
        engine.release(&id).await?;
    } else {
        engine.cancel(&id).await?;
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// Body of `POST /delegation/{id}/recover`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct RecoverRequest {
    #[serde(default)]
    peer_url: Option<String>,
}

/// Handler for `POST /delegation/{id}/recover` — post-SSE recovery.
async fn recover_delegation(
    State(engine): State<DelegatorEngine>,
    Path(id): Path<String>,
    Json(request): Json<RecoverRequest>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let peer_url = match request.peer_url {
        Some(url) => url,
        None => engine.get(&id).await?.peer_url,
    };
    let record = engine.recover(&id, &peer_url).await?;
    Ok(Json(record))
}

/// Build the control-plane router over shared engine state.
#[must_use]
pub fn router(engine: DelegatorEngine) -> Router {
    Router::new()
        .route("/delegate", post(create_delegation))
        .route("/delegation/{id}", get(get_delegation))
        .route("/delegation/{id}", delete(cancel_delegation))
        .route("/delegation/{id}/snapshots", get(list_snapshots))
        .route("/delegation/{id}/snapshots/{sid}/apply", post(apply_snapshot))
        .route(
            "/delegation/{id}/snapshots/{sid}/discard",
            post(discard_snapshot),
        )
        .route("/delegation/{id}/recover", post(recover_delegation))
        .route("/health", get(health))
        .with_state(engine)
}

/// Serve the control plane until the token is cancelled.
///
/// # Errors
///
/// Returns `AwcpError::Http` if the listener cannot bind or the server
/// fails.
pub async fn serve(engine: DelegatorEngine, port: u16, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AwcpError::Http(format!("failed to bind control plane on {bind}: {err}")))?;

    info!(%bind, "delegator control plane listening");

    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AwcpError::Http(format!("control plane server error: {err}")))?;

    info!("delegator control plane shut down");
    Ok(())
}
