// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded per-subscriber queues with an explicit drop-oldest policy.
//!
//! Publishers push without blocking; when a queue is full the oldest entry
//! is discarded and counted. The receiver learns about the gap through a
//! synthetic `__dropped` envelope emitted before the next real event.

use chrono::Utc;
use cvn_core::HookEnvelope;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Shared state between the bus side and the receiver side of one queue.
pub(crate) struct HookQueue {
    buf: Mutex<QueueBuf>,
    notify: Notify,
    capacity: usize,
    /// Total envelopes dropped over the queue's lifetime.
    dropped_total: AtomicU64,
}

struct QueueBuf {
    items: VecDeque<HookEnvelope>,
    /// Drops since the last synthetic envelope was emitted.
    dropped_pending: u64,
    closed: bool,
}

impl HookQueue {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buf: Mutex::new(QueueBuf {
                items: VecDeque::new(),
                dropped_pending: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped_total: AtomicU64::new(0),
        })
    }

    /// Push an envelope, dropping the oldest entry if the queue is full.
    pub(crate) fn push(&self, env: HookEnvelope) {
        let mut buf = self.buf.lock().expect("hook queue lock");
        if buf.closed {
            return;
        }
        if buf.items.len() >= self.capacity {
            buf.items.pop_front();
            buf.dropped_pending += 1;
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
        }
        buf.items.push_back(env);
        drop(buf);
        self.notify.notify_one();
    }

    pub(crate) fn close(&self) {
        self.buf.lock().expect("hook queue lock").closed = true;
        self.notify.notify_waiters();
    }

    pub(crate) fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.buf.lock().expect("hook queue lock").closed
    }

    /// Non-blocking pop; `None` when empty.
    fn try_pop(&self) -> Option<HookEnvelope> {
        let mut buf = self.buf.lock().expect("hook queue lock");
        if buf.dropped_pending > 0 {
            let count = buf.dropped_pending;
            buf.dropped_pending = 0;
            return Some(dropped_envelope(count));
        }
        buf.items.pop_front()
    }

    fn is_closed_and_empty(&self) -> bool {
        let buf = self.buf.lock().expect("hook queue lock");
        buf.closed && buf.items.is_empty() && buf.dropped_pending == 0
    }
}

fn dropped_envelope(count: u64) -> HookEnvelope {
    let mut payload = BTreeMap::new();
    payload.insert("count".to_string(), serde_json::json!(count));
    HookEnvelope {
        event: "__dropped".to_string(),
        hook_event: "__dropped".to_string(),
        at: Utc::now(),
        seq: 0,
        payload,
        source: "bus".to_string(),
    }
}

/// The receiving half of a subscription.
pub struct HookReceiver {
    pub(crate) queue: Arc<HookQueue>,
}

impl HookReceiver {
    /// Await the next envelope; `None` once the subscription is closed and
    /// drained. A `__dropped` synthetic envelope precedes the next real
    /// event whenever the queue overflowed since the last receive.
    pub async fn recv(&self) -> Option<HookEnvelope> {
        loop {
            if let Some(env) = self.queue.try_pop() {
                return Some(env);
            }
            if self.queue.is_closed_and_empty() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Total envelopes this subscription has dropped.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped_total()
    }
}

impl Drop for HookReceiver {
    fn drop(&mut self) {
        self.queue.close();
    }
}
