// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-viewer send queue and write loop.
//!
//! A tokio mpsc channel cannot express the priority policy (evicting the
//! queued head requires producer-side access), so the viewer channel is an
//! explicit bounded deque with single-consumer semantics:
//! - normal send: non-blocking, drop on full;
//! - priority send: non-blocking, evict one queued item then retry once;
//! - replay send: blocking with a per-item timeout.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome of a priority push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityOutcome {
    Queued,
    EvictedThenQueued,
    Dropped,
}

struct QueueInner {
    items: VecDeque<Bytes>,
    closed: bool,
}

/// Bounded single-consumer byte-frame queue between the session host and one
/// viewer's write loop.
pub struct SendQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner { items: VecDeque::new(), closed: false }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Non-blocking send; `false` means the queue was full or closed and the
    /// frame was dropped.
    pub fn try_push(&self, data: Bytes) -> bool {
        let mut q = self.inner.lock();
        if q.closed || q.items.len() >= self.capacity {
            return false;
        }
        q.items.push_back(data);
        drop(q);
        self.readable.notify_one();
        true
    }

    /// Priority send: when full, evict the queued head to make room, then
    /// retry once. Still-full (zero capacity) drops the frame.
    pub fn push_priority(&self, data: Bytes) -> PriorityOutcome {
        let mut q = self.inner.lock();
        if q.closed {
            return PriorityOutcome::Dropped;
        }
        let mut evicted = false;
        if q.items.len() >= self.capacity {
            if q.items.pop_front().is_none() {
                return PriorityOutcome::Dropped;
            }
            evicted = true;
        }
        if q.items.len() >= self.capacity {
            return PriorityOutcome::Dropped;
        }
        q.items.push_back(data);
        drop(q);
        self.readable.notify_one();
        if evicted {
            PriorityOutcome::EvictedThenQueued
        } else {
            PriorityOutcome::Queued
        }
    }

    /// Blocking send used during replay: waits for queue room up to
    /// `timeout`, returning `false` on timeout or close.
    pub async fn push_replay(&self, data: Bytes, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let room = self.writable.notified();
            {
                let mut q = self.inner.lock();
                if q.closed {
                    return false;
                }
                if q.items.len() < self.capacity {
                    q.items.push_back(data);
                    drop(q);
                    self.readable.notify_one();
                    return true;
                }
            }
            if tokio::time::timeout_at(deadline, room).await.is_err() {
                return false;
            }
        }
    }

    /// Pop the next frame; `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Bytes> {
        loop {
            let ready = self.readable.notified();
            {
                let mut q = self.inner.lock();
                if let Some(item) = q.items.pop_front() {
                    drop(q);
                    self.writable.notify_one();
                    return Some(item);
                }
                if q.closed {
                    return None;
                }
            }
            ready.await;
        }
    }

    /// Close the queue: pending pops drain remaining items, pushes fail.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.readable.notify_one();
        self.writable.notify_one();
    }
}

/// Write half of a viewer connection.
///
/// Boxed-future methods keep the trait object-safe; the production
/// implementation wraps the axum WebSocket sink, tests substitute a recorder.
pub trait ViewerSink: Send {
    fn send_text(&mut self, data: Bytes) -> BoxFuture<'_, anyhow::Result<()>>;
    fn send_ping(&mut self) -> BoxFuture<'_, anyhow::Result<()>>;
    /// Send a close frame with code GoingAway.
    fn send_going_away(&mut self) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// One browser WebSocket attached to a session host.
#[derive(Clone)]
pub struct Viewer {
    pub id: String,
    pub queue: Arc<SendQueue>,
    /// Signaled by the write loop on send failure (or by the host on detach
    /// and stop) so the gateway read loop exits without waiting out its read
    /// deadline.
    pub done: CancellationToken,
}

/// Drain the viewer queue into the sink until failure, detach, or host
/// shutdown. Doubles as the transport-level heartbeat writer: the sink has a
/// single owner, so pings are interleaved here rather than in a second task.
pub(crate) async fn run_write_loop(
    viewer_id: String,
    queue: Arc<SendQueue>,
    done: CancellationToken,
    shutdown: CancellationToken,
    mut sink: Box<dyn ViewerSink>,
    ping_interval: Duration,
) {
    let start = tokio::time::Instant::now() + ping_interval;
    let mut ping = tokio::time::interval_at(start, ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send_going_away().await;
                break;
            }
            _ = done.cancelled() => {
                let _ = sink.send_going_away().await;
                break;
            }
            _ = ping.tick() => {
                if sink.send_ping().await.is_err() {
                    debug!(viewer_id, "viewer ping failed, closing write loop");
                    done.cancel();
                    break;
                }
            }
            item = queue.pop() => {
                match item {
                    Some(data) => {
                        if sink.send_text(data).await.is_err() {
                            debug!(viewer_id, "viewer write failed, closing write loop");
                            done.cancel();
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    queue.close();
}

#[cfg(test)]
#[path = "viewer_tests.rs"]
mod tests;
