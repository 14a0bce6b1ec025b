//! Bounded, backpressure-aware subscriber engines.
//!
//! One [`StreamEngine`] manages every subscriber of a single wire format.
//! The event-stream flavor adds an open comment, per-message `data:` framing
//! and periodic keepalives; the ndjson flavor adds the replay buffer that
//! captures broadcasts while nobody is attached. Everything else — capacity
//! cap, per-subscriber byte ceiling, slow-client eviction, ordered flush —
//! is shared.

mod subscriber;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::HttpError;
pub(crate) use subscriber::run_flusher;
use subscriber::{EnqueueOutcome, SINK_CAPACITY, Subscriber};

const KEEPALIVE_CHUNK: &str = ": keepalive\n\n";
const SSE_OPEN_CHUNK: &str = ": stream opened\n\n";
const SSE_CLOSE_CHUNK: &str = ": stream closing\n\n";
/// Synthetic notification that forces intermediaries to flush response
/// headers when an ndjson subscriber attaches with nothing to replay.
const NDJSON_OPEN_CHUNK: &str = "{\"jsonrpc\":\"2.0\",\"method\":\"_stream_opened\"}\n";
const NDJSON_CLOSE_CHUNK: &str = "{\"jsonrpc\":\"2.0\",\"method\":\"_stream_closing\"}\n";

/// On-wire framing of a subscriber stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Server-Sent-Events style: `data: <frame>\n\n` per message.
    EventStream,
    /// Chunked newline-delimited JSON: `<frame>\n` per message.
    Ndjson,
}

impl WireFormat {
    fn frame(self, msg: &str) -> String {
        match self {
            WireFormat::EventStream => format!("data: {msg}\n\n"),
            WireFormat::Ndjson => format!("{msg}\n"),
        }
    }

    fn open_chunk(self) -> Option<&'static str> {
        match self {
            WireFormat::EventStream => Some(SSE_OPEN_CHUNK),
            WireFormat::Ndjson => None,
        }
    }

    fn force_flush_chunk(self) -> Option<&'static str> {
        match self {
            WireFormat::EventStream => None,
            WireFormat::Ndjson => Some(NDJSON_OPEN_CHUNK),
        }
    }

    fn close_chunk(self) -> &'static str {
        match self {
            WireFormat::EventStream => SSE_CLOSE_CHUNK,
            WireFormat::Ndjson => NDJSON_CLOSE_CHUNK,
        }
    }
}

/// Tuning for one engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Subscriber count ceiling; attach beyond it is rejected with 503.
    pub max_subscribers: usize,
    /// Per-subscriber queue byte ceiling; also caps the replay buffer.
    pub max_buffer_bytes: usize,
    /// Keepalive period (event-stream engine only).
    pub keepalive_interval: Option<Duration>,
    /// Idle cutoff for the advisory sweep; `None` disables it.
    pub idle_timeout: Option<Duration>,
    /// Capture broadcasts while no subscriber is attached (ndjson engine).
    pub replay: bool,
}

struct EngineInner {
    subscribers: HashMap<String, Arc<Subscriber>>,
    replay: VecDeque<String>,
    replay_bytes: usize,
    keepalive_task: Option<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
}

/// Manager for all subscribers sharing one wire format.
pub struct StreamEngine {
    name: &'static str,
    format: WireFormat,
    config: EngineConfig,
    inner: Mutex<EngineInner>,
    me: Weak<StreamEngine>,
}

impl StreamEngine {
    pub fn new(name: &'static str, format: WireFormat, config: EngineConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name,
            format,
            config,
            inner: Mutex::new(EngineInner {
                subscribers: HashMap::new(),
                replay: VecDeque::new(),
                replay_bytes: 0,
                keepalive_task: None,
                sweep_task: None,
            }),
            me: me.clone(),
        })
    }

    /// Attach a new subscriber and return its streaming response.
    pub fn attach(&self) -> Result<Response, HttpError> {
        let (sub, rx) = self.attach_subscriber()?;
        tokio::spawn(run_flusher(sub, self.me.clone()));
        Ok(self.streaming_response(rx))
    }

    /// Register a subscriber: capacity check, preamble/replay seeding, timer
    /// transitions. The caller owns spawning the flush task.
    pub(crate) fn attach_subscriber(
        &self,
    ) -> Result<(Arc<Subscriber>, mpsc::Receiver<Bytes>), HttpError> {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        let mut inner = self.inner.lock().unwrap();
        if inner.subscribers.len() >= self.config.max_subscribers {
            warn!(
                engine = self.name,
                limit = self.config.max_subscribers,
                "rejecting subscriber: capacity reached"
            );
            return Err(HttpError::ServiceUnavailable(format!(
                "{} subscriber limit reached",
                self.name
            )));
        }

        let sub = Arc::new(Subscriber::new(Uuid::new_v4().to_string(), tx));
        if let Some(open) = self.format.open_chunk() {
            let _ = sub.enqueue(open, self.config.max_buffer_bytes);
        }

        if self.config.replay {
            let mut replayed = 0usize;
            while let Some(frame) = inner.replay.pop_front() {
                inner.replay_bytes -= frame.len();
                let wire = self.format.frame(&frame);
                if sub.enqueue(&wire, self.config.max_buffer_bytes) == EnqueueOutcome::Overflow {
                    warn!(engine = self.name, "dropping replayed frame: queue full");
                } else {
                    replayed += 1;
                }
            }
            if replayed > 0 {
                debug!(engine = self.name, replayed, "replayed buffered frames");
            }
        }

        // Nothing queued yet: write the synthetic open notification so the
        // HTTP layer flushes headers immediately.
        if sub.queued_bytes() == 0 {
            if let Some(flush) = self.format.force_flush_chunk() {
                let _ = sub.enqueue(flush, self.config.max_buffer_bytes);
            }
        }

        inner.subscribers.insert(sub.id.clone(), sub.clone());
        let count = inner.subscribers.len();
        if count == 1 {
            self.start_timers(&mut inner);
        }
        info!(engine = self.name, subscriber = %sub.id, count, "subscriber attached");
        Ok((sub, rx))
    }

    fn streaming_response(&self, rx: mpsc::Receiver<Bytes>) -> Response {
        let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
        let builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CACHE_CONTROL, "no-cache")
            .header("X-Accel-Buffering", "no");
        let builder = match self.format {
            WireFormat::EventStream => builder
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CONNECTION, "keep-alive"),
            WireFormat::Ndjson => builder.header(header::CONTENT_TYPE, "application/json"),
        };
        builder
            .body(Body::from_stream(stream))
            .expect("static response headers are valid")
    }

    /// Fan one frame out to every subscriber, framing it per the wire
    /// format. With no subscribers attached, a replay-enabled engine
    /// captures the frame instead.
    pub fn broadcast(&self, msg: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.subscribers.is_empty() {
                if self.config.replay {
                    self.push_replay(&mut inner, msg);
                }
                return;
            }
        }
        self.broadcast_chunk(&self.format.frame(msg));
    }

    /// Fan a pre-framed wire chunk out to every subscriber.
    fn broadcast_chunk(&self, wire: &str) {
        let overflowed: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .subscribers
                .values()
                .filter(|sub| {
                    sub.enqueue(wire, self.config.max_buffer_bytes) == EnqueueOutcome::Overflow
                })
                .map(|sub| sub.id.clone())
                .collect()
        };
        for id in overflowed {
            self.evict(&id, "buffer overrun");
        }
    }

    fn push_replay(&self, inner: &mut EngineInner, frame: &str) {
        if inner.replay_bytes + frame.len() > self.config.max_buffer_bytes {
            warn!(engine = self.name, "replay buffer full, dropping frame");
            return;
        }
        inner.replay.push_back(frame.to_owned());
        inner.replay_bytes += frame.len();
    }

    /// Remove one subscriber and release its resources.
    pub(crate) fn evict(&self, id: &str, reason: &str) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let removed = inner.subscribers.remove(id);
            if removed.is_some() && inner.subscribers.is_empty() {
                self.stop_timers(&mut inner);
            }
            removed
        };
        if let Some(sub) = removed {
            sub.clear_and_close();
            info!(
                engine = self.name,
                subscriber = %id,
                reason,
                connected_secs = sub.connected_at.elapsed().as_secs(),
                "subscriber removed"
            );
        }
    }

    /// Orderly close of every subscriber: best-effort end-of-stream
    /// sentinel, drain, end the sink.
    pub fn close_all(&self) {
        let subs: Vec<Arc<Subscriber>> = {
            let mut inner = self.inner.lock().unwrap();
            self.stop_timers(&mut inner);
            inner.replay.clear();
            inner.replay_bytes = 0;
            inner.subscribers.drain().map(|(_, sub)| sub).collect()
        };
        for sub in &subs {
            let _ = sub.enqueue(self.format.close_chunk(), self.config.max_buffer_bytes);
            sub.mark_closing();
        }
        if !subs.is_empty() {
            info!(engine = self.name, count = subs.len(), "closed all subscribers");
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }

    /// Frames currently captured in the replay buffer.
    #[must_use]
    pub fn replay_len(&self) -> usize {
        self.inner.lock().unwrap().replay.len()
    }

    fn start_timers(&self, inner: &mut EngineInner) {
        if let Some(interval) = self.config.keepalive_interval {
            let me = self.me.clone();
            inner.keepalive_task = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // immediate first tick
                loop {
                    ticker.tick().await;
                    let Some(engine) = me.upgrade() else { break };
                    engine.broadcast_chunk(KEEPALIVE_CHUNK);
                }
            }));
        }
        if let Some(idle) = self.config.idle_timeout {
            let me = self.me.clone();
            let period = (idle / 4).max(Duration::from_millis(250));
            inner.sweep_task = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(engine) = me.upgrade() else { break };
                    engine.sweep_idle(idle);
                }
            }));
        }
    }

    fn stop_timers(&self, inner: &mut EngineInner) {
        if let Some(task) = inner.keepalive_task.take() {
            task.abort();
        }
        if let Some(task) = inner.sweep_task.take() {
            task.abort();
        }
    }

    fn sweep_idle(&self, idle: Duration) {
        let stale: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .subscribers
                .values()
                .filter(|sub| sub.idle_for() > idle)
                .map(|sub| sub.id.clone())
                .collect()
        };
        for id in stale {
            self.evict(&id, "idle timeout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn config(replay: bool) -> EngineConfig {
        EngineConfig {
            max_subscribers: 4,
            max_buffer_bytes: 1024,
            keepalive_interval: None,
            idle_timeout: None,
            replay,
        }
    }

    #[tokio::test]
    async fn capacity_cap_rejects_excess_subscribers() {
        let engine = StreamEngine::new(
            "sse",
            WireFormat::EventStream,
            EngineConfig {
                max_subscribers: 2,
                ..config(false)
            },
        );
        let _a = engine.attach_subscriber().unwrap();
        let _b = engine.attach_subscriber().unwrap();
        assert!(matches!(
            engine.attach_subscriber(),
            Err(HttpError::ServiceUnavailable(_))
        ));
        assert_eq!(engine.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn event_stream_frames_and_preamble() {
        let engine = StreamEngine::new("sse", WireFormat::EventStream, config(false));
        let (sub, mut rx) = engine.attach_subscriber().unwrap();
        tokio::spawn(run_flusher(sub, Arc::downgrade(&engine)));

        engine.broadcast("{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}");

        assert_eq!(rx.recv().await.unwrap(), Bytes::from(": stream opened\n\n"));
        assert_eq!(
            rx.recv().await.unwrap(),
            Bytes::from("data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n")
        );
    }

    #[tokio::test]
    async fn broadcast_order_is_preserved_per_subscriber() {
        let engine = StreamEngine::new("ndjson", WireFormat::Ndjson, config(false));
        let (sub, mut rx) = engine.attach_subscriber().unwrap();
        tokio::spawn(run_flusher(sub, Arc::downgrade(&engine)));
        // Skip the attach-time force-flush sentinel.
        let _ = rx.recv().await;

        for i in 0..5 {
            engine.broadcast(&format!("{{\"id\":{i}}}"));
        }
        for i in 0..5 {
            assert_eq!(
                rx.recv().await.unwrap(),
                Bytes::from(format!("{{\"id\":{i}}}\n"))
            );
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_on_overflow() {
        let engine = StreamEngine::new(
            "sse",
            WireFormat::EventStream,
            EngineConfig {
                max_buffer_bytes: 64,
                ..config(false)
            },
        );
        // No flusher: this subscriber never drains.
        let (sub, _rx) = engine.attach_subscriber().unwrap();
        assert_eq!(engine.subscriber_count(), 1);

        // Preamble (17 bytes) + framed chunk (48 bytes) exceeds 64.
        let big = "x".repeat(40);
        engine.broadcast(&big);
        assert_eq!(engine.subscriber_count(), 0);
        assert_eq!(sub.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn healthy_subscriber_survives_while_slow_one_is_evicted() {
        let engine = StreamEngine::new(
            "sse",
            WireFormat::EventStream,
            EngineConfig {
                max_buffer_bytes: 64,
                ..config(false)
            },
        );
        let (fast, mut fast_rx) = engine.attach_subscriber().unwrap();
        tokio::spawn(run_flusher(fast, Arc::downgrade(&engine)));
        let (_slow, _slow_rx) = engine.attach_subscriber().unwrap();
        assert_eq!(
            fast_rx.recv().await.unwrap(),
            Bytes::from(": stream opened\n\n")
        );

        // 27-byte wire frames: the draining subscriber keeps up, while the
        // stalled one overruns its ceiling (17-byte preamble + 2 frames).
        let msg = "x".repeat(19);
        for _ in 0..3 {
            engine.broadcast(&msg);
            let chunk = timeout(Duration::from_secs(2), fast_rx.recv())
                .await
                .expect("fast subscriber should receive all frames")
                .unwrap();
            assert_eq!(chunk, Bytes::from(format!("data: {msg}\n\n")));
        }
        assert_eq!(engine.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn replay_is_delivered_to_first_subscriber_only() {
        let engine = StreamEngine::new("ndjson", WireFormat::Ndjson, config(true));
        engine.broadcast("{\"a\":1}");
        engine.broadcast("{\"b\":2}");
        assert_eq!(engine.replay_len(), 2);

        let (first, mut first_rx) = engine.attach_subscriber().unwrap();
        assert_eq!(engine.replay_len(), 0);
        tokio::spawn(run_flusher(first, Arc::downgrade(&engine)));
        assert_eq!(first_rx.recv().await.unwrap(), Bytes::from("{\"a\":1}\n"));
        assert_eq!(first_rx.recv().await.unwrap(), Bytes::from("{\"b\":2}\n"));

        // Later subscribers get the force-flush sentinel, not the replay.
        let (second, mut second_rx) = engine.attach_subscriber().unwrap();
        tokio::spawn(run_flusher(second, Arc::downgrade(&engine)));
        assert_eq!(
            second_rx.recv().await.unwrap(),
            Bytes::from("{\"jsonrpc\":\"2.0\",\"method\":\"_stream_opened\"}\n")
        );
    }

    #[tokio::test]
    async fn replay_buffer_respects_byte_ceiling() {
        let engine = StreamEngine::new(
            "ndjson",
            WireFormat::Ndjson,
            EngineConfig {
                max_buffer_bytes: 20,
                ..config(true)
            },
        );
        engine.broadcast("{\"seq\":1}"); // 9 bytes
        engine.broadcast("{\"seq\":2}");
        engine.broadcast("{\"seq\":3}"); // over the ceiling: dropped
        assert_eq!(engine.replay_len(), 2);
    }

    #[tokio::test]
    async fn close_all_sends_sentinel_and_ends_streams() {
        let engine = StreamEngine::new("ndjson", WireFormat::Ndjson, config(false));
        let (sub, mut rx) = engine.attach_subscriber().unwrap();
        tokio::spawn(run_flusher(sub, Arc::downgrade(&engine)));
        // Swallow the force-flush sentinel written at attach time.
        assert_eq!(
            rx.recv().await.unwrap(),
            Bytes::from("{\"jsonrpc\":\"2.0\",\"method\":\"_stream_opened\"}\n")
        );

        engine.close_all();
        assert_eq!(engine.subscriber_count(), 0);
        assert_eq!(
            rx.recv().await.unwrap(),
            Bytes::from("{\"jsonrpc\":\"2.0\",\"method\":\"_stream_closing\"}\n")
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn keepalive_ticks_while_subscribed() {
        let engine = StreamEngine::new(
            "sse",
            WireFormat::EventStream,
            EngineConfig {
                keepalive_interval: Some(Duration::from_millis(25)),
                ..config(false)
            },
        );
        let (sub, mut rx) = engine.attach_subscriber().unwrap();
        tokio::spawn(run_flusher(sub, Arc::downgrade(&engine)));

        assert_eq!(rx.recv().await.unwrap(), Bytes::from(": stream opened\n\n"));
        let chunk = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("keepalive should arrive")
            .unwrap();
        assert_eq!(chunk, Bytes::from(": keepalive\n\n"));
    }

    #[tokio::test]
    async fn idle_subscriber_is_swept() {
        let engine = StreamEngine::new(
            "ndjson",
            WireFormat::Ndjson,
            EngineConfig {
                idle_timeout: Some(Duration::from_millis(300)),
                ..config(false)
            },
        );
        let (sub, mut rx) = engine.attach_subscriber().unwrap();
        tokio::spawn(run_flusher(sub, Arc::downgrade(&engine)));
        // Drain the attach-time sentinel so the subscriber goes idle.
        let _ = rx.recv().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while engine.subscriber_count() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "sweep never fired");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
