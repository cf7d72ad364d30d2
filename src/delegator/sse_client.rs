//! SSE subscription to the executor's event stream.
//!
//! A subscription owns the HTTP connection, an incremental parser, and a
//! channel of decoded events. Transport failures reconnect with linear
//! backoff (`delay * attempt`) up to the configured retry count; after
//! exhaustion the subscription surfaces `SSE_FAILED` to the caller.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{ErrorCode, ProtocolError};
use crate::protocol::events::DelegationEvent;
use crate::{AwcpError, Result};

/// Reconnect behavior for one subscription.
#[derive(Debug, Clone)]
pub struct SseClientConfig {
    /// Reconnect attempts before surfacing `SSE_FAILED`.
    pub max_retries: u32,
    /// Linear backoff unit: attempt N waits `N * retry_delay`.
    pub retry_delay: Duration,
    /// Connect deadline per attempt.
    pub connect_timeout: Duration,
    /// Bearer token attached to the request, when the peer requires one.
    pub auth_token: Option<String>,
}

/// Incremental parser for `text/event-stream` bodies.
///
/// Accumulates `data:` lines and yields one joined payload per blank-line
/// event boundary; comments and non-data fields are ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseParser {
    /// Create an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of body bytes; returns completed event payloads.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_owned());
            }
            // `event:`, `id:`, `retry:` and comment lines are ignored.
        }
        events
    }
}

/// Run a subscription until a terminal event, delivering decoded events
/// through `tx`.
///
/// `connected` fires once the stream is established, letting the caller
/// sequence START after the subscription is attached. Returns `Ok(())`
/// once a terminal event was delivered; the terminal itself also flows
/// through `tx`.
///
/// # Errors
///
/// Returns `AwcpError::Protocol` with `SSE_FAILED` after exhausting
/// reconnect attempts, or with `CANCELLED` when `cancel` fires first.
pub async fn run_subscription(
    peer_url: &str,
    delegation_id: &str,
    config: SseClientConfig,
    tx: mpsc::UnboundedSender<DelegationEvent>,
    cancel: CancellationToken,
    connected: tokio::sync::oneshot::Sender<()>,
) -> Result<()> {
    // A dedicated client without a total-request deadline: the stream is
    // long-lived by design, bounded by the lease and the cancel token.
    let client = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .build()
        .map_err(|err| AwcpError::Http(format!("sse client build: {err}")))?;

    let url = format!(
        "{}/tasks/{delegation_id}/events",
        peer_url.trim_end_matches('/')
    );

    let mut attempt: u32 = 0;
    let mut connected = Some(connected);
    loop {
        if cancel.is_cancelled() {
            return Err(AwcpError::protocol(
                ErrorCode::Cancelled,
                "event subscription cancelled",
            ));
        }

        match stream_once(&client, &url, &config, &tx, &cancel, &mut attempt, &mut connected).await
        {
            Ok(StreamEnd::Terminal) => return Ok(()),
            Ok(StreamEnd::Cancelled) => {
                return Err(AwcpError::protocol(
                    ErrorCode::Cancelled,
                    "event subscription cancelled",
                ));
            }
            Ok(StreamEnd::Disconnected) | Err(_) => {
                attempt += 1;
                if attempt > config.max_retries {
                    warn!(
                        delegation_id,
                        attempts = attempt,
                        "event stream reconnects exhausted"
                    );
                    return Err(ProtocolError::new(
                        ErrorCode::SseFailed,
                        format!("event stream failed after {} attempts", config.max_retries),
                    )
                    .with_hint("the executor result may still be recoverable via recover()")
                    .into());
                }
                let delay = config.retry_delay * attempt;
                info!(delegation_id, attempt, ?delay, "reconnecting event stream");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {
                        return Err(AwcpError::protocol(
                            ErrorCode::Cancelled,
                            "event subscription cancelled",
                        ));
                    }
                }
            }
        }
    }
}

enum StreamEnd {
    /// A terminal event was delivered.
    Terminal,
    /// The cancel token fired.
    Cancelled,
    /// The connection closed before a terminal event.
    Disconnected,
}

#[allow(clippy::too_many_arguments)]
async fn stream_once(
    client: &reqwest::Client,
    url: &str,
    config: &SseClientConfig,
    tx: &mpsc::UnboundedSender<DelegationEvent>,
    cancel: &CancellationToken,
    attempt: &mut u32,
    connected: &mut Option<tokio::sync::oneshot::Sender<()>>,
) -> Result<StreamEnd> {
    let mut request = client
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream");
    if let Some(token) = &config.auth_token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(AwcpError::Http(format!(
            "event stream request returned {}",
            response.status()
        )));
    }
    if let Some(signal) = connected.take() {
        let _ = signal.send(());
    }

    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            chunk = body.next() => chunk,
            () = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
        };

        let Some(chunk) = chunk else {
            return Ok(StreamEnd::Disconnected);
        };
        let chunk = chunk.map_err(|err| AwcpError::Http(format!("event stream read: {err}")))?;

        for payload in parser.feed(&chunk) {
            let event: DelegationEvent = match serde_json::from_str(&payload) {
                Ok(event) => event,
                Err(err) => {
                    debug!(%err, "skipping undecodable event payload");
                    continue;
                }
            };

            // A delivered event proves the connection is healthy; the
            // retry count restarts so only sustained outages exhaust it.
            *attempt = 0;

            let terminal = event.is_terminal();
            if tx.send(event).is_err() {
                // Receiver dropped: the engine stopped consuming.
                return Ok(StreamEnd::Cancelled);
            }
            if terminal {
                return Ok(StreamEnd::Terminal);
            }
        }
    }
}
