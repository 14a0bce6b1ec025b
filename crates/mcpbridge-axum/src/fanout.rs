//! Child stdout → engines fan-out.
//!
//! [`FramePump`] is the supervisor's event sink: it frames stdout chunks
//! into lines and pushes them onto an unbounded channel. The message router
//! task consumes that channel, validates each frame as JSON-RPC, and
//! broadcasts the canonical text to both engines. Garbage lines are logged
//! and skipped; they never stop the pipeline.

use std::sync::{Arc, Mutex};

use mcpbridge_core::{ChildEvents, FrameSplitter, ProcessError, validate_frame};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::StreamEngine;

/// Supervisor event sink feeding the message router.
pub struct FramePump {
    splitter: Mutex<FrameSplitter>,
    frames: mpsc::UnboundedSender<String>,
}

impl FramePump {
    /// Create the pump and the receiving end of its frame channel.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                splitter: Mutex::new(FrameSplitter::new()),
                frames: tx,
            }),
            rx,
        )
    }
}

impl ChildEvents for FramePump {
    fn stdout_chunk(&self, chunk: &[u8]) {
        let frames = self.splitter.lock().unwrap().push(chunk);
        for frame in frames {
            if self.frames.send(frame).is_err() {
                debug!("message router gone, dropping frame");
                return;
            }
        }
    }

    fn stderr_line(&self, line: &str) {
        debug!(target: "mcpbridge::child", "{line}");
    }

    fn on_exit(&self, code: Option<i32>, signal: Option<i32>) {
        debug!(code = ?code, signal = ?signal, "child exit observed by pump");
    }

    fn on_error(&self, error: &ProcessError) {
        warn!(error = %error, "child process error");
    }
}

/// Spawn the message router: pull frames, validate, broadcast to both
/// engines in child-emission order.
pub fn spawn_message_router(
    mut frames: mpsc::UnboundedReceiver<String>,
    sse: Arc<StreamEngine>,
    ndjson: Arc<StreamEngine>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = frames.recv().await {
            route_frame(&line, &sse, &ndjson);
        }
        debug!("message router exiting: frame channel closed");
    })
}

fn route_frame(line: &str, sse: &StreamEngine, ndjson: &StreamEngine) {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, raw = %line, "discarding unparseable child output");
            return;
        }
    };
    if let Err(e) = validate_frame(&value) {
        warn!(error = %e, raw = %line, "discarding invalid JSON-RPC from child");
        return;
    }

    let canonical = value.to_string();
    sse.broadcast(&canonical);
    ndjson.broadcast(&canonical);
}
