//! Capability traits wired together at the composition root.
//!
//! The supervisor and the HTTP layer never reference each other directly;
//! they meet through these ports so either side can be replaced in tests.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ProcessError;

/// Callbacks the supervisor invokes for child output and lifecycle events.
///
/// `stdout_chunk` receives raw bytes in emission order (framing is the frame
/// splitter's job); `stderr_line` receives decoded lines that are logged and
/// never parsed. Implementations must be cheap and non-blocking: they run on
/// the reader tasks.
pub trait ChildEvents: Send + Sync {
    fn stdout_chunk(&self, chunk: &[u8]);
    fn stderr_line(&self, line: &str);
    fn on_exit(&self, code: Option<i32>, signal: Option<i32>);
    fn on_error(&self, error: &ProcessError);
}

/// Write-path capability handed to the ingress handlers: deliver one
/// newline-terminated frame to the child's stdin.
#[async_trait]
pub trait FrameRelay: Send + Sync {
    async fn relay(&self, frame: &str) -> Result<(), ProcessError>;
}

/// Point-in-time snapshot of the supervised child.
///
/// `running` implies `pid` is present. `restart_count` is monotonic for the
/// supervisor's lifetime; `last_restart_at` is Unix seconds.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessState {
    pub pid: Option<u32>,
    pub running: bool,
    pub restart_count: u32,
    pub last_restart_at: Option<u64>,
}
