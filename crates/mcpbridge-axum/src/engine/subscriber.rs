//! Per-connection subscriber state and its flush task.
//!
//! A subscriber is a bounded, byte-accounted queue of wire chunks plus the
//! mpsc sink feeding the HTTP response body. The flush task drains the
//! queue in order; awaiting the bounded sink is the backpressure suspension,
//! and the sink closing is the disconnect signal.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use super::StreamEngine;

/// Sink channel depth. Small on purpose: queueing happens in the
/// byte-accounted subscriber queue, not in the channel.
pub(crate) const SINK_CAPACITY: usize = 8;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EnqueueOutcome {
    Queued,
    Overflow,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<String>,
    bytes: usize,
    closed: bool,
}

pub(crate) struct Subscriber {
    pub(crate) id: String,
    pub(crate) connected_at: Instant,
    queue: Mutex<QueueState>,
    wake: Notify,
    sink: mpsc::Sender<Bytes>,
    last_activity: Mutex<Instant>,
}

impl Subscriber {
    pub(crate) fn new(id: String, sink: mpsc::Sender<Bytes>) -> Self {
        let now = Instant::now();
        Self {
            id,
            connected_at: now,
            queue: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            sink,
            last_activity: Mutex::new(now),
        }
    }

    /// Append one wire chunk, enforcing the byte ceiling.
    pub(crate) fn enqueue(&self, chunk: &str, max_bytes: usize) -> EnqueueOutcome {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.closed {
                return EnqueueOutcome::Queued;
            }
            if queue.bytes + chunk.len() > max_bytes {
                return EnqueueOutcome::Overflow;
            }
            queue.items.push_back(chunk.to_owned());
            queue.bytes += chunk.len();
        }
        self.wake.notify_one();
        EnqueueOutcome::Queued
    }

    /// Mark closing but let already-queued chunks drain first.
    pub(crate) fn mark_closing(&self) {
        self.queue.lock().unwrap().closed = true;
        self.wake.notify_one();
    }

    /// Drop everything and close: eviction path.
    pub(crate) fn clear_and_close(&self) {
        {
            let mut queue = self.queue.lock().unwrap();
            queue.closed = true;
            queue.items.clear();
            queue.bytes = 0;
        }
        self.wake.notify_one();
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.queue.lock().unwrap().bytes
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}

/// Drain the subscriber's queue into its sink until disconnect or close.
///
/// The flush state machine lives in the await points: idle while waiting to
/// be woken, flushing while sending, waiting-for-drain while the bounded
/// sink is full, closed once this task returns.
pub(crate) async fn run_flusher(subscriber: Arc<Subscriber>, engine: Weak<StreamEngine>) {
    loop {
        let next = {
            let queue = subscriber.queue.lock().unwrap();
            queue.items.front().cloned()
        };
        match next {
            Some(chunk) => {
                if subscriber.sink.send(Bytes::from(chunk)).await.is_err() {
                    if let Some(engine) = engine.upgrade() {
                        engine.evict(&subscriber.id, "client disconnected");
                    }
                    break;
                }
                subscriber.touch();
                let mut queue = subscriber.queue.lock().unwrap();
                // Eviction may have cleared the queue mid-send.
                if let Some(sent) = queue.items.pop_front() {
                    queue.bytes -= sent.len();
                }
            }
            None => {
                if subscriber.queue.lock().unwrap().closed {
                    break;
                }
                tokio::select! {
                    () = subscriber.wake.notified() => {}
                    () = subscriber.sink.closed() => {
                        if let Some(engine) = engine.upgrade() {
                            engine.evict(&subscriber.id, "client disconnected");
                        }
                        break;
                    }
                }
            }
        }
    }
    debug!(subscriber = %subscriber.id, "flush task exiting");
}
