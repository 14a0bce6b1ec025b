//! Child-process supervision with crash-restart and backoff.
//!
//! The supervisor owns the tool's stdin (all writes are serialized through
//! its lock), hands stdout/stderr to the [`ChildEvents`] capability set, and
//! keeps at most one restart timer armed at any time. An explicit
//! [`ProcessSupervisor::stop`] cancels the timer and prevents any further
//! restarts for the supervisor's remaining lifetime.

use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use mcpbridge_core::{ChildEvents, FrameRelay, ProcessError, ProcessState, ToolSpec};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::reader::{spawn_stderr_reader, spawn_stdout_reader};
use crate::shutdown;

/// Delay between a lazy start and the deferred stdin write, giving the child
/// a moment to come up. Delivery across a crash in this window is best
/// effort: an accepted ingress frame can be lost.
pub const LAZY_WRITE_DELAY: Duration = Duration::from_millis(100);

/// Grace period between closing stdin + SIGTERM and the SIGKILL escalation.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Tuning for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub lazy_start: bool,
}

/// Restart delay for the `restart_count`-th consecutive restart:
/// `min(max, base * 2^(restart_count - 1))`.
#[must_use]
pub fn backoff_delay(base: Duration, max: Duration, restart_count: u32) -> Duration {
    let exponent = restart_count.saturating_sub(1).min(16);
    max.min(base.saturating_mul(1u32 << exponent))
}

struct Inner {
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    running: bool,
    restart_count: u32,
    last_restart_at: Option<u64>,
    restart_timer: Option<JoinHandle<()>>,
    stopping: bool,
    /// Increments per spawn so a stale exit monitor cannot clobber the state
    /// of a newer child.
    generation: u64,
}

/// Supervised child process speaking newline-delimited JSON-RPC over stdio.
pub struct ProcessSupervisor {
    spec: ToolSpec,
    opts: SupervisorOptions,
    events: Arc<dyn ChildEvents>,
    exit_notify: Notify,
    inner: Mutex<Inner>,
    me: Weak<ProcessSupervisor>,
}

impl ProcessSupervisor {
    pub fn new(
        spec: ToolSpec,
        opts: SupervisorOptions,
        events: Arc<dyn ChildEvents>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            spec,
            opts,
            events,
            exit_notify: Notify::new(),
            inner: Mutex::new(Inner {
                stdin: None,
                pid: None,
                running: false,
                restart_count: 0,
                last_restart_at: None,
                restart_timer: None,
                stopping: false,
                generation: 0,
            }),
            me: me.clone(),
        })
    }

    /// Spawn the child if it is not already running. Idempotent.
    ///
    /// A spawn failure reports [`ChildEvents::on_error`], schedules a
    /// restart with backoff, and returns the error.
    pub async fn start(&self) -> Result<(), ProcessError> {
        let mut inner = self.inner.lock().await;
        if inner.running {
            return Ok(());
        }
        if inner.stopping {
            return Err(ProcessError::ShuttingDown);
        }

        let mut child = match self.spawn_child() {
            Ok(child) => child,
            Err(e) => {
                let err = ProcessError::SpawnFailed(e.to_string());
                warn!(command = %self.spec.command, error = %e, "failed to spawn child");
                self.events.on_error(&err);
                self.schedule_restart_locked(&mut inner);
                return Err(err);
            }
        };

        inner.generation += 1;
        let generation = inner.generation;
        inner.pid = child.id();
        inner.running = true;
        inner.stdin = child.stdin.take();
        info!(command = %self.spec.command, pid = ?inner.pid, "child process started");

        if let Some(stdout) = child.stdout.take() {
            spawn_stdout_reader(stdout, self.events.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_reader(stderr, self.events.clone());
        }
        drop(inner);

        let me = self.me.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let (code, signal) = match &status {
                Ok(status) => (status.code(), exit_signal(status)),
                Err(e) => {
                    debug!(error = %e, "waiting on child failed");
                    (None, None)
                }
            };
            match me.upgrade() {
                Some(supervisor) => supervisor.handle_exit(generation, code, signal).await,
                None => events.on_exit(code, signal),
            }
        });

        Ok(())
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        let mut cmd = build_command(&self.spec);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.spawn()
    }

    async fn handle_exit(&self, generation: u64, code: Option<i32>, signal: Option<i32>) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        inner.running = false;
        inner.pid = None;
        inner.stdin = None;
        info!(code = ?code, signal = ?signal, "child process exited");
        self.events.on_exit(code, signal);

        // Clean exit (code 0, no signal) does not trigger a restart.
        let crashed = code != Some(0) || signal.is_some();
        if crashed && !inner.stopping {
            self.schedule_restart_locked(&mut inner);
        }
        drop(inner);
        self.exit_notify.notify_waiters();
    }

    fn schedule_restart_locked(&self, inner: &mut Inner) {
        if inner.stopping || inner.restart_timer.is_some() {
            return;
        }
        inner.restart_count += 1;
        inner.last_restart_at = Some(now_secs());
        let delay = backoff_delay(
            self.opts.backoff_base,
            self.opts.backoff_max,
            inner.restart_count,
        );
        warn!(
            restart_count = inner.restart_count,
            delay_ms = delay.as_millis() as u64,
            "scheduling child restart"
        );

        let me = self.me.clone();
        inner.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(supervisor) = me.upgrade() else {
                return;
            };
            supervisor.inner.lock().await.restart_timer = None;
            if let Err(e) = supervisor.start().await {
                warn!(error = %e, "restart attempt failed");
            }
        }));
    }

    /// Write one newline-terminated frame to the child's stdin.
    ///
    /// Without a running child this fails with `NotRunning` unless lazy
    /// start is enabled, in which case the child is started and the frame is
    /// delivered on a detached task after [`LAZY_WRITE_DELAY`].
    pub async fn write(&self, frame: &str) -> Result<(), ProcessError> {
        debug_assert!(frame.ends_with('\n'), "frames must be newline-terminated");
        {
            let mut inner = self.inner.lock().await;
            if let Some(stdin) = inner.stdin.as_mut() {
                stdin.write_all(frame.as_bytes()).await?;
                stdin.flush().await?;
                return Ok(());
            }
            if inner.stopping {
                return Err(ProcessError::ShuttingDown);
            }
        }

        if !self.opts.lazy_start {
            return Err(ProcessError::NotRunning);
        }

        self.start().await?;
        let me = self.me.clone();
        let frame = frame.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(LAZY_WRITE_DELAY).await;
            let Some(supervisor) = me.upgrade() else {
                return;
            };
            let mut inner = supervisor.inner.lock().await;
            match inner.stdin.as_mut() {
                Some(stdin) => {
                    if let Err(e) = stdin.write_all(frame.as_bytes()).await {
                        warn!(error = %e, "deferred stdin write failed");
                    } else {
                        let _ = stdin.flush().await;
                    }
                }
                None => warn!("child went away before deferred stdin write"),
            }
        });
        Ok(())
    }

    /// Stop the child and prevent any further restarts. Idempotent.
    ///
    /// Closes stdin, sends SIGTERM, waits up to the grace period, then
    /// escalates to SIGKILL. Resolves once the child has exited.
    pub async fn stop(&self) -> Result<(), ProcessError> {
        let pid = {
            let mut inner = self.inner.lock().await;
            inner.stopping = true;
            if let Some(timer) = inner.restart_timer.take() {
                timer.abort();
            }
            inner.stdin.take();
            if !inner.running {
                return Ok(());
            }
            inner.pid
        };
        let Some(pid) = pid else {
            return Ok(());
        };

        info!(pid, "stopping child process");
        shutdown::terminate(pid);
        if self.wait_exit(STOP_GRACE).await {
            return Ok(());
        }

        warn!(pid, "child did not exit within grace period, killing");
        shutdown::kill(pid);
        self.wait_exit(Duration::from_secs(2)).await;
        Ok(())
    }

    /// Wait until the child is no longer running, up to `limit`.
    async fn wait_exit(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.exit_notify.notified();
            if !self.inner.lock().await.running {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Point-in-time snapshot of the child's state.
    pub async fn state(&self) -> ProcessState {
        let inner = self.inner.lock().await;
        ProcessState {
            pid: inner.pid,
            running: inner.running,
            restart_count: inner.restart_count,
            last_restart_at: inner.last_restart_at,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.running
    }
}

#[async_trait]
impl FrameRelay for ProcessSupervisor {
    async fn relay(&self, frame: &str) -> Result<(), ProcessError> {
        self.write(frame).await
    }
}

/// Build the spawn command for the tool.
///
/// Windows cannot execute script-suffix launchers (npx.cmd and friends)
/// directly, so the command goes through the interpreter there. No shell
/// interpolation in either case: arguments are passed as-is.
fn build_command(spec: &ToolSpec) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/c").arg(&spec.command).args(&spec.args);
        cmd
    }

    #[cfg(not(windows))]
    {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        cmd
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    struct Capture {
        chunks: mpsc::UnboundedSender<Vec<u8>>,
        exits: AtomicUsize,
        errors: AtomicUsize,
        stderr: StdMutex<Vec<String>>,
    }

    impl Capture {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    chunks: tx,
                    exits: AtomicUsize::new(0),
                    errors: AtomicUsize::new(0),
                    stderr: StdMutex::new(Vec::new()),
                }),
                rx,
            )
        }
    }

    impl ChildEvents for Capture {
        fn stdout_chunk(&self, chunk: &[u8]) {
            let _ = self.chunks.send(chunk.to_vec());
        }
        fn stderr_line(&self, line: &str) {
            self.stderr.lock().unwrap().push(line.to_owned());
        }
        fn on_exit(&self, _code: Option<i32>, _signal: Option<i32>) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, _error: &ProcessError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn options(lazy_start: bool) -> SupervisorOptions {
        SupervisorOptions {
            backoff_base: Duration::from_millis(20),
            backoff_max: Duration::from_millis(200),
            lazy_start,
        }
    }

    fn spec(command: &str, args: &[&str]) -> ToolSpec {
        ToolSpec {
            command: command.to_owned(),
            args: args.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, max, 6), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, max, 30), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn write_without_child_fails_when_lazy_start_off() {
        let (events, _rx) = Capture::new();
        let supervisor = ProcessSupervisor::new(spec("cat", &[]), options(false), events);
        let result = supervisor.write("{}\n").await;
        assert!(matches!(result, Err(ProcessError::NotRunning)));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn echo_child_round_trips_frames() {
        let (events, mut rx) = Capture::new();
        let supervisor = ProcessSupervisor::new(spec("cat", &[]), options(false), events);
        supervisor.start().await.unwrap();
        assert!(supervisor.is_running().await);
        let state = supervisor.state().await;
        assert!(state.pid.is_some());

        supervisor
            .write("{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await
            .unwrap();

        let mut collected = Vec::new();
        while !collected.ends_with(b"\n") {
            let chunk = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for echo")
                .expect("stdout channel closed");
            collected.extend(chunk);
        }
        assert_eq!(
            collected,
            b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n"
        );

        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn start_is_idempotent() {
        let (events, _rx) = Capture::new();
        let supervisor = ProcessSupervisor::new(spec("cat", &[]), options(false), events);
        supervisor.start().await.unwrap();
        let pid = supervisor.state().await.pid;
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state().await.pid, pid);
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn lazy_start_defers_first_write() {
        let (events, mut rx) = Capture::new();
        let supervisor = ProcessSupervisor::new(spec("cat", &[]), options(true), events);
        supervisor.write("{\"jsonrpc\":\"2.0\",\"method\":\"hi\"}\n").await.unwrap();
        assert!(supervisor.is_running().await);

        let mut collected = Vec::new();
        while !collected.ends_with(b"\n") {
            let chunk = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for deferred write")
                .expect("stdout channel closed");
            collected.extend(chunk);
        }
        assert_eq!(collected, b"{\"jsonrpc\":\"2.0\",\"method\":\"hi\"}\n");
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn crashing_child_is_restarted_with_backoff() {
        let (events, _rx) = Capture::new();
        let supervisor =
            ProcessSupervisor::new(spec("sh", &["-c", "exit 1"]), options(false), events.clone());
        let _ = supervisor.start().await;

        sleep(Duration::from_millis(600)).await;
        let state = supervisor.state().await;
        assert!(state.restart_count >= 2, "restart_count = {}", state.restart_count);
        assert!(state.last_restart_at.is_some());
        assert!(events.exits.load(Ordering::SeqCst) >= 2);

        supervisor.stop().await.unwrap();
        let frozen = supervisor.state().await.restart_count;
        sleep(Duration::from_millis(300)).await;
        assert_eq!(supervisor.state().await.restart_count, frozen);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn clean_exit_is_not_restarted() {
        let (events, _rx) = Capture::new();
        let supervisor =
            ProcessSupervisor::new(spec("sh", &["-c", "exit 0"]), options(false), events.clone());
        supervisor.start().await.unwrap();

        sleep(Duration::from_millis(300)).await;
        let state = supervisor.state().await;
        assert!(!state.running);
        assert_eq!(state.restart_count, 0);
        assert_eq!(events.exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn spawn_failure_reports_error_and_schedules_restart() {
        let (events, _rx) = Capture::new();
        let supervisor = ProcessSupervisor::new(
            spec("/nonexistent/not-a-binary", &[]),
            options(false),
            events.clone(),
        );
        assert!(matches!(
            supervisor.start().await,
            Err(ProcessError::SpawnFailed(_))
        ));
        assert!(events.errors.load(Ordering::SeqCst) >= 1);
        assert_eq!(supervisor.state().await.restart_count, 1);

        // Consecutive failed restarts keep backing off.
        sleep(Duration::from_millis(300)).await;
        assert!(supervisor.state().await.restart_count >= 2);
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn stop_is_idempotent_and_blocks_new_starts() {
        let (events, _rx) = Capture::new();
        let supervisor = ProcessSupervisor::new(spec("cat", &[]), options(false), events);
        supervisor.start().await.unwrap();
        supervisor.stop().await.unwrap();
        supervisor.stop().await.unwrap();
        assert!(matches!(
            supervisor.start().await,
            Err(ProcessError::ShuttingDown)
        ));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn stderr_is_forwarded_line_by_line() {
        let (events, _rx) = Capture::new();
        let supervisor = ProcessSupervisor::new(
            spec("sh", &["-c", "echo diagnostics >&2; exec cat"]),
            options(false),
            events.clone(),
        );
        supervisor.start().await.unwrap();
        sleep(Duration::from_millis(300)).await;
        assert_eq!(
            events.stderr.lock().unwrap().as_slice(),
            &["diagnostics".to_string()]
        );
        supervisor.stop().await.unwrap();
    }
}
