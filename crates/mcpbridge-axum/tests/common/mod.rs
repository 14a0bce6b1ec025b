//! Shared helpers for the HTTP integration tests.
//!
//! Tests bridge a real child process (`cat` as a line echo) and drive the
//! router with `tower::ServiceExt::oneshot`.
#![allow(dead_code)] // not every test binary uses every helper

use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use mcpbridge_axum::{AppState, bootstrap};
use mcpbridge_core::{BridgeSettings, ToolSpec};

pub fn test_settings() -> BridgeSettings {
    BridgeSettings {
        port: 0,
        max_buffer_size: 64 * 1024,
        max_subscribers: 8,
        max_message_size: 64 * 1024,
        restart_backoff_base: Duration::from_millis(50),
        restart_backoff_max: Duration::from_millis(500),
        ..BridgeSettings::default()
    }
}

pub fn echo_spec() -> ToolSpec {
    ToolSpec {
        command: "cat".to_owned(),
        args: Vec::new(),
    }
}

/// Bootstrap a bridge around a `cat` child that echoes every frame back.
pub async fn echo_context() -> AppState {
    bootstrap(test_settings(), echo_spec())
        .await
        .expect("bootstrap failed")
}

pub fn json_post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_owned()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Read stream chunks until the collected text contains `pattern`.
pub async fn collect_until(
    stream: &mut (impl Stream<Item = Result<Bytes, axum::Error>> + Unpin),
    pattern: &str,
    limit: Duration,
) -> String {
    let deadline = tokio::time::Instant::now() + limit;
    let mut collected = String::new();
    while !collected.contains(pattern) {
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {pattern:?}, got {collected:?}"))
            .expect("stream ended early")
            .expect("stream errored");
        collected.push_str(&String::from_utf8_lossy(&chunk));
    }
    collected
}

/// Poll `probe` until it returns true.
pub async fn wait_for(limit: Duration, mut probe: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !probe() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
