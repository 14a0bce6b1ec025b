//! Streaming egress handlers.
//!
//! `/mcp/stream` is the event-stream flavor; `/mcp/streamable` is the
//! chunked-ndjson flavor, whose POST variant can relay a payload and then
//! upgrade the same response into a subscriber.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;

use crate::error::HttpError;
use crate::handlers::ingress::{Accepted, deliver, parse_body};
use crate::state::AppState;

/// `GET /mcp/stream` — attach an event-stream subscriber.
pub async fn sse_stream(State(state): State<AppState>) -> Result<Response, HttpError> {
    state.sse.attach()
}

/// `GET /mcp/streamable` — attach a chunked-ndjson subscriber.
pub async fn ndjson_stream(State(state): State<AppState>) -> Result<Response, HttpError> {
    state.ndjson.attach()
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    stream: Option<String>,
}

/// `POST /mcp/streamable` — ingress identical to `/mcp`, then either a 202
/// or, when the client asked for it, an upgrade of this response into a new
/// ndjson subscriber.
pub async fn ndjson_post(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    let frames = parse_body(&headers, &body)?;
    deliver(&state, &frames).await?;

    if wants_stream(&query, &headers) {
        return state.ndjson.attach();
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            status: "accepted",
            message_count: frames.len(),
        }),
    )
        .into_response())
}

fn wants_stream(query: &StreamQuery, headers: &HeaderMap) -> bool {
    let by_query = query
        .stream
        .as_deref()
        .is_some_and(|value| value.eq_ignore_ascii_case("true"));
    let by_header = headers
        .get("x-mcp-stream")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("true"));
    by_query || by_header
}
