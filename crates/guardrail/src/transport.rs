//! MCP front door: the SSE stream and the message endpoint.
//!
//! `GET /mcp/v1/sse` opens the reply channel. The first frame is an
//! `endpoint` event carrying the absolute message URL (the only channel
//! by which the client learns where to POST); after that the stream
//! interleaves `message` frames from the session's reply queue with
//! comment keepalives.
//!
//! `POST /mcp/v1/message?session_id=<id>` accepts one JSON-RPC request,
//! acknowledges with 202 and an empty body, and computes the actual
//! response on its own task; the SSE loop forwards it when ready.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, warn};

use guardrail_protocol::{JsonRpcRequest, SseFrame, JSONRPC_VERSION};

use crate::dispatch;
use crate::session::{LookupError, Session};
use crate::state::AppState;

/// Keepalive cadence; must stay at or under the 30s contract.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    session_id: Option<String>,
}

/// `GET /mcp/v1/sse`
pub async fn sse_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    // Reuse the referenced session when it is still live; otherwise
    // allocate a fresh one.
    let session = query
        .session_id
        .as_deref()
        .and_then(|id| state.inner.sessions.get(id).ok())
        .unwrap_or_else(|| state.inner.sessions.create());

    if !session.attach_writer() {
        return (
            StatusCode::CONFLICT,
            "Session already has an active SSE stream",
        )
            .into_response();
    }
    session.touch();
    state
        .inner
        .metrics
        .sessions_live
        .set(state.inner.sessions.len() as i64);

    let endpoint = message_endpoint_url(&state, &headers, session.id());
    let stream = reply_stream(state.clone(), Arc::clone(&session), endpoint);

    let body = Body::from_stream(stream);
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate",
            ),
            (header::CONNECTION, "keep-alive"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response()
}

/// The absolute message URL for a session.
fn message_endpoint_url(state: &AppState, headers: &HeaderMap, session_id: &str) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("localhost:{}", state.inner.config.mcp_port));
    let scheme = if state.inner.config.tls_enabled {
        "https"
    } else {
        "http"
    };
    format!(
        "{}://{}/mcp/v1/message?session_id={}",
        scheme, host, session_id
    )
}

/// Detaches the writer when the stream is dropped, including the case
/// where the client disconnects mid-await. The session and its queued
/// replies persist until idle expiry.
struct WriterGuard {
    session: Arc<Session>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.session.detach_writer();
    }
}

/// The SSE frame stream for one subscription.
fn reply_stream(
    state: AppState,
    session: Arc<Session>,
    endpoint: String,
) -> impl tokio_stream::Stream<Item = Result<String, Infallible>> {
    async_stream::stream! {
        let _guard = WriterGuard {
            session: Arc::clone(&session),
        };
        yield Ok(SseFrame::Endpoint(endpoint).to_string());

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; swallow it.
        keepalive.tick().await;

        loop {
            // Session evicted: close the stream.
            if state.inner.sessions.get(session.id()).is_err() {
                debug!(session = %session.log_id(), "session gone, closing SSE stream");
                break;
            }

            // Drain everything queued before sleeping again.
            while let Some(serialized) = session.dequeue_reply() {
                yield Ok(SseFrame::Message(serialized).to_string());
            }

            tokio::select! {
                _ = session.reply_available() => {}
                _ = keepalive.tick() => {
                    yield Ok(SseFrame::Keepalive.to_string());
                }
            }
        }
    }
}

/// `POST /mcp/v1/message?session_id=<id>`
pub async fn message_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: axum::body::Bytes,
) -> Response {
    let Some(session_id) = query.session_id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing session_id parameter").into_response();
    };

    let session = match state.inner.sessions.get(&session_id) {
        Ok(session) => session,
        Err(LookupError::Unknown) => {
            return (StatusCode::NOT_FOUND, "Unknown session").into_response();
        }
        Err(LookupError::Expired) => {
            return (StatusCode::GONE, "Session expired").into_response();
        }
    };
    session.touch();

    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("Invalid JSON-RPC body: {}", e))
                .into_response();
        }
    };
    if request.jsonrpc != JSONRPC_VERSION {
        return (
            StatusCode::BAD_REQUEST,
            format!("Invalid JSON-RPC version: {}", request.jsonrpc),
        )
            .into_response();
    }

    // Compute on a separate task; replies reach the client via the SSE
    // loop in whatever order handlers complete.
    let task_state = state.clone();
    tokio::spawn(async move {
        let response = dispatch::handle_request(&task_state, &session, request).await;
        if let Some(response) = response {
            match serde_json::to_string(&response) {
                Ok(serialized) => {
                    let dropped = session.enqueue_reply(serialized);
                    if dropped > 0 {
                        task_state
                            .inner
                            .metrics
                            .reply_queue_dropped_total
                            .inc_by(dropped);
                        warn!(
                            session = %session.log_id(),
                            dropped,
                            "reply queue overflow"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize response"),
            }
        }
    });

    StatusCode::ACCEPTED.into_response()
}
