//! Executor HTTP surface: protocol endpoint, event stream, result recovery.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{ErrorCode, ProtocolError};
use crate::protocol::events::DelegationEvent;
use crate::protocol::messages::{ErrorMessage, ProtocolMessage};
use crate::transport::SnapshotPayload;
use crate::{AwcpError, Result};

use super::bus::Subscription;
use super::engine::{CompletionOutcome, ExecutorEngine};

/// Handler for `GET /health` — liveness probe.
async fn health() -> &'static str {
    "ok"
}

/// Body of `GET /tasks/{id}/result`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    highlights: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_payload: Option<SnapshotPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ProtocolError>,
}

impl ResultResponse {
    fn bare(status: &'static str) -> Self {
        Self {
            status,
            completed_at: None,
            summary: None,
            highlights: None,
            snapshot_payload: None,
            error: None,
        }
    }
}

/// Dispatch for `POST /` by message type.
async fn handle_message(
    State(engine): State<ExecutorEngine>,
    Json(message): Json<ProtocolMessage>,
) -> Response {
    match message {
        ProtocolMessage::Invite(invite) => {
            let delegation_id = invite.delegation_id.clone();
            match engine.handle_invite(invite).await {
                Ok(accept) => Json(ProtocolMessage::Accept(accept)).into_response(),
                Err(refusal) => {
                    info!(delegation_id, code = %refusal.code, "INVITE refused");
                    Json(ProtocolMessage::Error(ErrorMessage::new(
                        delegation_id,
                        refusal,
                    )))
                    .into_response()
                }
            }
        }
        ProtocolMessage::Start(start) => {
            let delegation_id = start.delegation_id.clone();
            match engine.handle_start(start) {
                Ok(ack) => Json(ack).into_response(),
                Err(refusal) => Json(ProtocolMessage::Error(ErrorMessage::new(
                    delegation_id,
                    refusal,
                )))
                .into_response(),
            }
        }
        ProtocolMessage::Error(error) => {
            let delegation_id = error.delegation_id.clone();
            match engine.handle_error(error) {
                Ok(ack) => Json(ack).into_response(),
                Err(refusal) => Json(ProtocolMessage::Error(ErrorMessage::new(
                    delegation_id,
                    refusal,
                )))
                .into_response(),
            }
        }
        ProtocolMessage::Accept(accept) => {
            // ACCEPT only ever flows executor -> delegator.
            Json(ProtocolMessage::Error(ErrorMessage::new(
                accept.delegation_id,
                ProtocolError::new(ErrorCode::Declined, "unexpected ACCEPT message"),
            )))
            .into_response()
        }
    }
}

/// Handler for `GET /tasks/{id}/events` — the delegation event stream.
///
/// Live delegations stream every subsequent event and close after the
/// terminal. Completed delegations within the retention window replay one
/// synthetic terminal. Unknown ids get a single `NOT_FOUND` error event.
async fn events(
    State(engine): State<ExecutorEngine>,
    Path(delegation_id): Path<String>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream: futures_util::stream::BoxStream<'static, std::result::Result<Event, Infallible>> =
        match engine.bus().subscribe(&delegation_id) {
            Subscription::Live(rx) => Box::pin(live_event_stream(delegation_id, rx)),
            Subscription::Replay(terminal) => {
                Box::pin(stream::iter(encode_event(&terminal).map(Ok)))
            }
            Subscription::Unknown => {
                let event = DelegationEvent::from_error(ProtocolError::new(
                    ErrorCode::NotFound,
                    format!("unknown delegation {delegation_id}"),
                ));
                Box::pin(stream::iter(encode_event(&event).map(Ok)))
            }
        };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Stream live events until the terminal, inclusive.
///
/// A subscriber that lags past the channel watermark is dropped rather
/// than stalling the producer.
fn live_event_stream(
    delegation_id: String,
    rx: broadcast::Receiver<DelegationEvent>,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    let mut terminal_passed = false;
    BroadcastStream::new(rx)
        .take_while(move |result| {
            if terminal_passed {
                return false;
            }
            match result {
                Ok(event) => {
                    if event.is_terminal() {
                        terminal_passed = true;
                    }
                    true
                }
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!(
                        delegation_id,
                        missed, "subscriber exceeded watermark; dropping stream"
                    );
                    false
                }
            }
        })
        .filter_map(|result| result.ok().and_then(|event| encode_event(&event)).map(Ok))
}

fn encode_event(event: &DelegationEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(data) => Some(Event::default().data(data)),
        Err(err) => {
            warn!(%err, "failed to serialize delegation event");
            None
        }
    }
}

/// Handler for `GET /tasks/{id}/result` — post-SSE recovery.
async fn result(
    State(engine): State<ExecutorEngine>,
    Path(delegation_id): Path<String>,
) -> Json<ResultResponse> {
    if let Some(record) = engine.result_record(&delegation_id) {
        let response = match record.outcome {
            CompletionOutcome::Completed {
                summary,
                highlights,
            } => ResultResponse {
                status: "completed",
                completed_at: Some(record.completed_at),
                summary: Some(summary),
                highlights,
                snapshot_payload: record.snapshot_payload,
                error: None,
            },
            CompletionOutcome::Failed(error) => ResultResponse {
                status: "error",
                completed_at: Some(record.completed_at),
                summary: None,
                highlights: None,
                snapshot_payload: None,
                error: Some(error),
            },
        };
        return Json(response);
    }

    if engine.is_in_flight(&delegation_id) {
        return Json(ResultResponse::bare("running"));
    }
    Json(ResultResponse::bare("not_found"))
}

/// Handler for `GET /status` — aggregate counters.
async fn status(State(engine): State<ExecutorEngine>) -> Response {
    Json(engine.status_counters()).into_response()
}

/// Bearer-token gate applied when `auth_token` is configured.
async fn require_auth(
    State(engine): State<ExecutorEngine>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = engine.config().auth_token.as_deref() else {
        return next.run(request).await;
    };
    // The health probe stays open so orchestrators can check liveness.
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let authorized = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected);

    if authorized {
        next.run(request).await
    } else {
        let body = Json(ProtocolError::new(
            ErrorCode::AuthFailed,
            "missing or invalid bearer token",
        ));
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

/// Build the executor router over shared engine state.
#[must_use]
pub fn router(engine: ExecutorEngine) -> Router {
    Router::new()
        .route("/", post(handle_message))
        .route("/tasks/{delegation_id}/events", get(events))
        .route("/tasks/{delegation_id}/result", get(result))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(
            engine.clone(),
            require_auth,
        ))
        .with_state(engine)
}

/// Serve the executor endpoint until the token is cancelled.
///
/// # Errors
///
/// Returns `AwcpError::Http` if the listener cannot bind or the server
/// fails.
pub async fn serve(engine: ExecutorEngine, port: u16, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AwcpError::Http(format!("failed to bind executor on {bind}: {err}")))?;

    info!(%bind, "executor endpoint listening");

    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AwcpError::Http(format!("executor server error: {err}")))?;

    info!("executor endpoint shut down");
    Ok(())
}
