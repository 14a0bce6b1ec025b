//! Health and service-info handlers.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::state::AppState;

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    timestamp: String,
    process: ProcessSection,
    subscribers: SubscriberSection,
}

#[derive(Debug, Serialize)]
struct ProcessSection {
    running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(rename = "restartCount")]
    restart_count: u32,
}

#[derive(Debug, Serialize)]
struct SubscriberSection {
    sse: usize,
    #[serde(rename = "streamableHttp")]
    streamable_http: usize,
}

/// Overall status from the child's state. Degraded once the child has
/// needed more than five restarts; unhealthy once it is down after having
/// crashed at least once.
fn health_status(running: bool, restart_count: u32) -> &'static str {
    if !running && restart_count > 0 {
        "unhealthy"
    } else if restart_count > 5 {
        "degraded"
    } else {
        "healthy"
    }
}

/// `GET /healthz`
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let process = state.supervisor.state().await;
    let status = health_status(process.running, process.restart_count);
    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = HealthBody {
        status,
        timestamp: Utc::now().to_rfc3339(),
        process: ProcessSection {
            running: process.running,
            pid: process.pid,
            restart_count: process.restart_count,
        },
        subscribers: SubscriberSection {
            sse: state.sse.subscriber_count(),
            streamable_http: state.ndjson.subscriber_count(),
        },
    };
    (code, Json(body))
}

/// `GET /` — service identity and endpoint map.
pub async fn root_info() -> Json<serde_json::Value> {
    Json(json!({
        "name": "mcpbridge",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "ingress": "/mcp",
            "stream": "/mcp/stream",
            "streamable": "/mcp/streamable",
            "health": "/healthz",
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reflects_restart_history() {
        assert_eq!(health_status(true, 0), "healthy");
        assert_eq!(health_status(true, 5), "healthy");
        assert_eq!(health_status(true, 6), "degraded");
        assert_eq!(health_status(false, 0), "healthy"); // never started, never crashed
        assert_eq!(health_status(false, 1), "unhealthy");
        assert_eq!(health_status(false, 10), "unhealthy");
    }
}
