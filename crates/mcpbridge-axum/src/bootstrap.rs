//! Bridge bootstrap - the composition root.
//!
//! This module is the ONLY place where the supervisor, the frame pump, the
//! message router and the two subscriber engines are wired together. All
//! cyclic-looking references run through channels and ports: no component
//! holds a strong reference upward.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use mcpbridge_core::{BridgeSettings, FrameRelay, ToolSpec};
use mcpbridge_runtime::{ProcessSupervisor, SupervisorOptions};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::{EngineConfig, StreamEngine, WireFormat};
use crate::fanout::{FramePump, spawn_message_router};
use crate::routes::create_router;

/// All services behind the HTTP surface.
pub struct BridgeContext {
    pub settings: BridgeSettings,
    pub spec: ToolSpec,
    /// The supervised child process (health introspection, stop).
    pub supervisor: Arc<ProcessSupervisor>,
    /// Write-path port used by the ingress handlers.
    pub relay: Arc<dyn FrameRelay>,
    /// Event-stream subscriber engine.
    pub sse: Arc<StreamEngine>,
    /// Chunked-ndjson subscriber engine.
    pub ndjson: Arc<StreamEngine>,
    router_task: JoinHandle<()>,
    shutdown_started: AtomicBool,
}

impl BridgeContext {
    /// Graceful shutdown, idempotent: close every subscriber on both
    /// engines, stop the child, then retire the router task.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down bridge");
        self.sse.close_all();
        self.ndjson.close_all();
        if let Err(e) = self.supervisor.stop().await {
            warn!(error = %e, "child did not stop cleanly");
        }
        self.router_task.abort();
    }
}

/// Wire all components together.
///
/// With lazy start disabled the child is spawned here; a spawn failure is
/// not fatal (the supervisor keeps retrying with backoff and health reports
/// the state), so this only fails on wiring errors.
pub async fn bootstrap(settings: BridgeSettings, spec: ToolSpec) -> Result<Arc<BridgeContext>> {
    info!(
        command = %spec.command,
        args = ?spec.args,
        port = settings.port,
        lazy_start = settings.lazy_start,
        "bootstrapping bridge"
    );

    let sse = StreamEngine::new(
        "sse",
        WireFormat::EventStream,
        EngineConfig {
            max_subscribers: settings.max_subscribers,
            max_buffer_bytes: settings.max_buffer_size,
            keepalive_interval: Some(settings.keepalive_interval),
            idle_timeout: Some(settings.stream_timeout),
            replay: false,
        },
    );
    let ndjson = StreamEngine::new(
        "streamable-http",
        WireFormat::Ndjson,
        EngineConfig {
            max_subscribers: settings.max_subscribers,
            max_buffer_bytes: settings.max_buffer_size,
            keepalive_interval: None,
            idle_timeout: Some(settings.stream_timeout),
            replay: true,
        },
    );

    let (pump, frames) = FramePump::new();
    let supervisor = ProcessSupervisor::new(
        spec.clone(),
        SupervisorOptions {
            backoff_base: settings.restart_backoff_base,
            backoff_max: settings.restart_backoff_max,
            lazy_start: settings.lazy_start,
        },
        pump,
    );
    let router_task = spawn_message_router(frames, sse.clone(), ndjson.clone());

    if !settings.lazy_start {
        if let Err(e) = supervisor.start().await {
            warn!(error = %e, "initial child start failed, restart scheduled");
        }
    }

    let relay: Arc<dyn FrameRelay> = supervisor.clone();
    Ok(Arc::new(BridgeContext {
        settings,
        spec,
        supervisor,
        relay,
        sse,
        ndjson,
        router_task,
        shutdown_started: AtomicBool::new(false),
    }))
}

/// Bootstrap and serve until a shutdown signal arrives.
///
/// Shutdown order: close subscribers, stop the child, then stop accepting
/// and drain in-flight connections.
pub async fn start_server(settings: BridgeSettings, spec: ToolSpec) -> Result<()> {
    let port = settings.port;
    let ctx = bootstrap(settings, spec).await?;
    let app = create_router(ctx.clone());

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("mcpbridge listening on http://{addr}");

    let shutdown_ctx = ctx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_ctx.shutdown().await;
        })
        .await?;

    // Covers the serve loop ending without a signal; no-op otherwise.
    ctx.shutdown().await;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C"),
        () = terminate => info!("received SIGTERM"),
    }
}
