// SPDX-License-Identifier: MIT OR Apache-2.0
//! The modder-hook event bus.
//!
//! One process-wide [`EventBus`] carries every hook envelope: in-process
//! subscribers, WebSocket fan-out queues, and signed outbound webhooks all
//! hang off it. Publishing assigns a strictly increasing `seq`, appends to a
//! bounded persistent history ring, and enqueues onto each matching
//! subscriber's bounded queue without ever blocking the publisher. Delivery
//! is in `seq` order per subscriber; across subscribers there is no ordering
//! guarantee.

#![deny(unsafe_code)]

mod queue;
mod topic;
mod validate;
mod webhook;

pub use queue::HookReceiver;
pub use topic::TopicFilter;
pub use webhook::{
    sign, DeadLetter, WebhookConfig, WebhookInfo, DEAD_LETTER_CAPACITY, DELIVERY_TIMEOUT,
    WEBHOOK_MAX_ATTEMPTS,
};

use crate::queue::HookQueue;
use crate::webhook::{DeadLetterRing, WebhookWorker};
use chrono::{DateTime, Utc};
use cvn_core::HookEnvelope;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Default bounded history size.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;
/// Default per-subscriber queue size for WebSocket sinks.
pub const DEFAULT_WS_QUEUE_CAPACITY: usize = 256;
/// Hard cap on `history()` query results.
pub const HISTORY_QUERY_LIMIT: usize = 1000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A reserved payload key was missing or mistyped for a cataloged event.
    #[error("invalid payload for {event}: key '{key}' {reason}")]
    InvalidPayload {
        /// Event being published.
        event: String,
        /// Offending key.
        key: String,
        /// What was wrong.
        reason: String,
    },
    /// The history log could not be read or written.
    #[error("hook history at {path}: {source}")]
    History {
        /// Log path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Envelope serialization failed.
    #[error("serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// History query
// ---------------------------------------------------------------------------

/// Filter for `history()` queries.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HistoryFilter {
    /// Exact event name.
    pub event: Option<String>,
    /// Only envelopes with `seq` strictly greater than this.
    pub since_seq: Option<u64>,
    /// Only envelopes at or after this time.
    pub since_ts: Option<DateTime<Utc>>,
    /// Result cap; clamped to [`HISTORY_QUERY_LIMIT`].
    pub limit: Option<usize>,
}

/// Counters exposed on `/status`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BusStatus {
    /// Envelopes published since process start.
    pub published: u64,
    /// Live subscriber queues (WS + in-process).
    pub subscribers: usize,
    /// Registered webhooks.
    pub webhooks: usize,
    /// Envelopes dropped across all subscriber queues.
    pub dropped: u64,
    /// Dead-lettered webhook deliveries currently retained.
    pub dead_letters: usize,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct SubEntry {
    filter: TopicFilter,
    queue: Arc<HookQueue>,
}

struct WebhookEntry {
    info: WebhookInfo,
    filter: TopicFilter,
    queue: Arc<HookQueue>,
}

struct BusInner {
    /// Last assigned sequence number.
    seq: AtomicU64,
    /// Serializes assign-seq + history-append + fan-out so every subscriber
    /// observes envelopes in seq order.
    publish_lock: Mutex<()>,
    history: Mutex<VecDeque<HookEnvelope>>,
    history_capacity: usize,
    log: Mutex<Option<std::fs::File>>,
    log_path: Option<PathBuf>,
    subscribers: Mutex<Vec<SubEntry>>,
    webhooks: Mutex<Vec<WebhookEntry>>,
    dead_letters: DeadLetterRing,
    published: AtomicU64,
}

/// The process-wide hook bus. Clone freely; clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// In-memory bus with the default ring capacity (tests, ephemeral runs).
    pub fn in_memory() -> Self {
        Self::build(None, DEFAULT_HISTORY_CAPACITY).expect("in-memory bus cannot fail")
    }

    /// Bus persisted at `path` (JSONL, one envelope per line). The tail of
    /// the log is replayed to rebuild the ring and restore `seq`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BusError> {
        Self::open_with_capacity(path, DEFAULT_HISTORY_CAPACITY)
    }

    /// As [`EventBus::open`] with an explicit ring capacity.
    pub fn open_with_capacity(
        path: impl Into<PathBuf>,
        capacity: usize,
    ) -> Result<Self, BusError> {
        Self::build(Some(path.into()), capacity)
    }

    fn build(path: Option<PathBuf>, capacity: usize) -> Result<Self, BusError> {
        let mut ring = VecDeque::new();
        let mut last_seq = 0u64;
        let mut log = None;

        if let Some(ref p) = path {
            let io_err = |source| BusError::History { path: p.clone(), source };
            if let Some(dir) = p.parent() {
                std::fs::create_dir_all(dir).map_err(io_err)?;
            }
            match std::fs::File::open(p) {
                Ok(f) => {
                    let reader = std::io::BufReader::new(f);
                    for line in reader.lines() {
                        let line = line.map_err(io_err)?;
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<HookEnvelope>(&line) {
                            Ok(env) => {
                                last_seq = last_seq.max(env.seq);
                                if ring.len() >= capacity {
                                    ring.pop_front();
                                }
                                ring.push_back(env);
                            }
                            Err(e) => {
                                warn!(error = %e, "skipping corrupt hook history line");
                            }
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(e)),
            }

            // Compact on open so the log never grows unbounded across runs.
            let compacted: Vec<u8> = {
                let mut out = Vec::new();
                for env in &ring {
                    serde_json::to_writer(&mut out, env)?;
                    out.push(b'\n');
                }
                out
            };
            std::fs::write(p, &compacted).map_err(io_err)?;
            log = Some(
                std::fs::OpenOptions::new()
                    .append(true)
                    .open(p)
                    .map_err(io_err)?,
            );
        }

        Ok(Self {
            inner: Arc::new(BusInner {
                seq: AtomicU64::new(last_seq),
                publish_lock: Mutex::new(()),
                history: Mutex::new(ring),
                history_capacity: capacity.max(1),
                log: Mutex::new(log),
                log_path: path,
                subscribers: Mutex::new(Vec::new()),
                webhooks: Mutex::new(Vec::new()),
                dead_letters: DeadLetterRing::default(),
                published: AtomicU64::new(0),
            }),
        })
    }

    /// Publish an event. Returns the assigned `seq`.
    ///
    /// Reserved keys of cataloged events are validated strictly; extra keys
    /// pass through. The publisher never blocks on subscribers: full queues
    /// shed their oldest entry, counted per subscriber.
    pub fn publish(
        &self,
        event: &str,
        source: &str,
        payload: BTreeMap<String, serde_json::Value>,
    ) -> Result<u64, BusError> {
        if let Err((key, reason)) = validate::validate_payload(event, &payload) {
            return Err(BusError::InvalidPayload {
                event: event.to_string(),
                key,
                reason,
            });
        }

        let _guard = self.inner.publish_lock.lock().expect("publish lock");

        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut env = HookEnvelope::new(event, source, payload);
        env.seq = seq;

        // Persist to the history log before fan-out.
        if let Some(f) = self.inner.log.lock().expect("bus log lock").as_mut() {
            let path = self.inner.log_path.clone().unwrap_or_default();
            let line = serde_json::to_string(&env)?;
            f.write_all(line.as_bytes())
                .and_then(|()| f.write_all(b"\n"))
                .and_then(|()| f.flush())
                .map_err(|source| BusError::History { path, source })?;
        }

        {
            let mut ring = self.inner.history.lock().expect("bus history lock");
            if ring.len() >= self.inner.history_capacity {
                ring.pop_front();
            }
            ring.push_back(env.clone());
        }

        {
            let mut subs = self.inner.subscribers.lock().expect("bus subscribers lock");
            subs.retain(|s| !s.queue.is_closed());
            for sub in subs.iter() {
                if sub.filter.matches(&env.event) {
                    sub.queue.push(env.clone());
                }
            }
        }
        {
            let hooks = self.inner.webhooks.lock().expect("bus webhooks lock");
            for hook in hooks.iter() {
                if hook.filter.matches(&env.event) {
                    hook.queue.push(env.clone());
                }
            }
        }

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        debug!(event = %env.event, seq, "hook published");
        Ok(seq)
    }

    /// Query the bounded history ring, oldest first.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<HookEnvelope> {
        let limit = filter
            .limit
            .unwrap_or(HISTORY_QUERY_LIMIT)
            .min(HISTORY_QUERY_LIMIT);
        let ring = self.inner.history.lock().expect("bus history lock");
        let mut out: Vec<HookEnvelope> = ring
            .iter()
            .filter(|e| filter.event.as_deref().is_none_or(|ev| e.event == ev))
            .filter(|e| filter.since_seq.is_none_or(|s| e.seq > s))
            .filter(|e| filter.since_ts.is_none_or(|t| e.at >= t))
            .cloned()
            .collect();
        // Keep the newest `limit` entries, still oldest-first.
        if out.len() > limit {
            out.drain(..out.len() - limit);
        }
        out
    }

    /// Subscribe with a bounded queue; the returned receiver observes
    /// matching envelopes in `seq` order.
    pub fn subscribe(&self, filter: TopicFilter, capacity: usize) -> HookReceiver {
        let queue = HookQueue::new(capacity);
        self.inner
            .subscribers
            .lock()
            .expect("bus subscribers lock")
            .push(SubEntry {
                filter,
                queue: Arc::clone(&queue),
            });
        HookReceiver { queue }
    }

    /// Subscribe an in-process callback, driven by its own worker task.
    pub fn subscribe_fn<F>(&self, filter: TopicFilter, callback: F)
    where
        F: Fn(&HookEnvelope) + Send + Sync + 'static,
    {
        let rx = self.subscribe(filter, 1024);
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                callback(&env);
            }
        });
    }

    /// Register a signed outbound webhook; spawns its delivery worker.
    pub fn webhook_register(&self, config: WebhookConfig) -> WebhookInfo {
        let id = Uuid::new_v4();
        let info = WebhookInfo {
            id,
            url: config.url.clone(),
            topics: config.topics.clone(),
            created_at: Utc::now(),
        };
        let (queue, filter) =
            WebhookWorker::spawn(id, config, self.inner.dead_letters.clone());
        self.inner
            .webhooks
            .lock()
            .expect("bus webhooks lock")
            .push(WebhookEntry {
                info: info.clone(),
                filter,
                queue,
            });
        info
    }

    /// Remove a webhook; returns `false` when the id is unknown.
    pub fn webhook_remove(&self, id: Uuid) -> bool {
        let mut hooks = self.inner.webhooks.lock().expect("bus webhooks lock");
        let before = hooks.len();
        hooks.retain(|h| {
            if h.info.id == id {
                h.queue.close();
                false
            } else {
                true
            }
        });
        hooks.len() != before
    }

    /// Registered webhooks.
    pub fn webhooks(&self) -> Vec<WebhookInfo> {
        self.inner
            .webhooks
            .lock()
            .expect("bus webhooks lock")
            .iter()
            .map(|h| h.info.clone())
            .collect()
    }

    /// Dead-lettered deliveries, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.snapshot()
    }

    /// The last assigned sequence number.
    pub fn last_seq(&self) -> u64 {
        self.inner.seq.load(Ordering::SeqCst)
    }

    /// Counters for `/status`.
    pub fn status(&self) -> BusStatus {
        let subs = self.inner.subscribers.lock().expect("bus subscribers lock");
        let dropped_subs: u64 = subs.iter().map(|s| s.queue.dropped_total()).sum();
        let hooks = self.inner.webhooks.lock().expect("bus webhooks lock");
        let dropped_hooks: u64 = hooks.iter().map(|h| h.queue.dropped_total()).sum();
        BusStatus {
            published: self.inner.published.load(Ordering::Relaxed),
            subscribers: subs.len(),
            webhooks: hooks.len(),
            dropped: dropped_subs + dropped_hooks,
            dead_letters: self.inner.dead_letters.len(),
        }
    }
}
