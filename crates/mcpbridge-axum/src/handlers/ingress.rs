//! Ingress handler: JSON-RPC over HTTP POST into child stdin.
//!
//! Fire-and-forget: the 202 acknowledges queueing, not delivery, and
//! responses arrive on the streaming egress. A frame in flight during a
//! child crash can be lost even after a 202.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use bytes::Bytes;
use mcpbridge_core::envelope;
use serde::Serialize;
use tracing::debug;

use crate::error::HttpError;
use crate::state::AppState;

/// Acknowledgement body for accepted ingress posts.
#[derive(Debug, Serialize)]
pub(crate) struct Accepted {
    pub(crate) status: &'static str,
    #[serde(rename = "messageCount")]
    pub(crate) message_count: usize,
}

/// `POST /mcp` — validate, normalize and forward to child stdin.
pub async fn post_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HttpError> {
    let frames = parse_body(&headers, &body)?;
    deliver(&state, &frames).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            status: "accepted",
            message_count: frames.len(),
        }),
    ))
}

/// Validate the content type and body, returning one compact frame per
/// JSON-RPC message. Batch validation is all-or-nothing.
pub(crate) fn parse_body(headers: &HeaderMap, body: &Bytes) -> Result<Vec<String>, HttpError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type.contains("application/json") {
        return Err(HttpError::BadRequest(
            "Content-Type must be application/json".to_owned(),
        ));
    }

    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| HttpError::BadRequest(format!("invalid JSON body: {e}")))?;
    envelope::normalize_body(&value).map_err(|e| HttpError::BadRequest(e.to_string()))
}

/// Hand each frame to the child, newline-terminated, in submission order.
pub(crate) async fn deliver(state: &AppState, frames: &[String]) -> Result<(), HttpError> {
    for frame in frames {
        state.relay.relay(&format!("{frame}\n")).await?;
    }
    debug!(count = frames.len(), "ingress frames forwarded to child");
    Ok(())
}
