//! Async readers for child stdout and stderr.
//!
//! Stdout is forwarded as raw chunks (the frame splitter downstream owns
//! line boundaries). Stderr is read line by line with lossy decoding so a
//! stray non-UTF8 byte cannot kill the reader task.

use std::sync::Arc;

use mcpbridge_core::ChildEvents;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tracing::debug;

pub(crate) fn spawn_stdout_reader(mut stdout: ChildStdout, events: Arc<dyn ChildEvents>) {
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => events.stdout_chunk(&buf[..n]),
                Err(e) => {
                    debug!(error = %e, "stdout reader exiting on read error");
                    break;
                }
            }
        }
        debug!("stdout reader task exiting");
    });
}

pub(crate) fn spawn_stderr_reader(stderr: ChildStderr, events: Arc<dyn ChildEvents>) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf: Vec<u8> = Vec::with_capacity(1024);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    }
                    let line = String::from_utf8_lossy(&buf);
                    events.stderr_line(&line);
                }
                Err(e) => {
                    debug!(error = %e, "stderr reader exiting on read error");
                    break;
                }
            }
        }
        debug!("stderr reader task exiting");
    });
}
