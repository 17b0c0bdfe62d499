// SPDX-License-Identifier: MIT OR Apache-2.0
//! Resource-budget gate.
//!
//! Admission reserves a job's CPU and VRAM hints; when either budget is
//! exceeded the job is parked in a FIFO of delayed entries and `refresh()`
//! promotes it oldest-first once pressure eases. Execution slots
//! (`concurrent_{local,remote}_max`) are a separate claim-time resource:
//! queued jobs hold cpu/vram reservations but consume a slot only while
//! claimed or running. The manager is a plain value owned by the scheduler
//! actor, so none of its state needs locking; every transition publishes
//! `on_perf_budget_state`.

#![deny(unsafe_code)]

use cvn_core::{JobId, JobRecord, Target};
use cvn_events::EventBus;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Budget limits, from configuration.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BudgetConfig {
    /// Total CPU budget in percent (100 per core).
    pub cpu_pct_max: u32,
    /// Total VRAM budget in megabytes.
    pub vram_mb_max: u64,
    /// Claimed-or-running jobs allowed on the local target.
    pub concurrent_local_max: usize,
    /// Claimed-or-running jobs allowed on the remote target.
    pub concurrent_remote_max: usize,
    /// Whether `evict_lazy` may touch the registry cache.
    pub lazy_eviction_enabled: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            cpu_pct_max: 800,
            vram_mb_max: 8192,
            concurrent_local_max: 2,
            concurrent_remote_max: 4,
            lazy_eviction_enabled: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Outcome of [`BudgetManager::admit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Reservation taken; the job may enter its queue.
    Accepted,
    /// A budget is exceeded; the job is parked until `refresh()` promotes it.
    Delayed {
        /// Which budget was exceeded.
        reason: String,
    },
}

#[derive(Clone, Debug)]
struct Reservation {
    cpu_pct: u32,
    vram_mb: u64,
}

/// Cache the budget manager may shrink under pressure. Implemented by the
/// daemon over the asset registry's sidecar cache.
pub trait EvictableCache: Send + Sync {
    /// Evict up to `max` unpinned entries by LRU; returns the count evicted.
    fn evict_lru(&self, max: usize) -> usize;
    /// Current entry count.
    fn len(&self) -> usize;
    /// Whether the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Point-in-time budget state, exposed on `/status` and the scheduler board.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct BudgetSnapshot {
    /// Jobs waiting on capacity.
    pub delayed: u64,
    /// Slots in use on the local target (claimed + running).
    pub active_local: u64,
    /// Slots in use on the remote target (claimed + running).
    pub active_remote: u64,
    /// Reserved CPU percent across admitted jobs.
    pub cpu_pct_reserved: u32,
    /// Reserved VRAM megabytes across admitted jobs.
    pub vram_mb_reserved: u64,
    /// Cache entries evicted since start.
    pub evictions: u64,
}

// ---------------------------------------------------------------------------
// BudgetManager
// ---------------------------------------------------------------------------

/// The budget gate. Owned and driven by the scheduler actor.
pub struct BudgetManager {
    config: BudgetConfig,
    reservations: BTreeMap<JobId, Reservation>,
    delayed: VecDeque<(JobId, Reservation)>,
    local_slots: usize,
    remote_slots: usize,
    evictions: u64,
    cache: Option<Arc<dyn EvictableCache>>,
    bus: EventBus,
}

/// Fraction of slot capacity above which lazy eviction kicks in.
const EVICTION_HIGH_WATER: f64 = 0.8;
/// Entries evicted per `evict_lazy` pass.
const EVICTION_BATCH: usize = 32;

impl BudgetManager {
    /// Build a manager publishing state transitions on `bus`.
    pub fn new(config: BudgetConfig, bus: EventBus) -> Self {
        Self {
            config,
            reservations: BTreeMap::new(),
            delayed: VecDeque::new(),
            local_slots: 0,
            remote_slots: 0,
            evictions: 0,
            cache: None,
            bus,
        }
    }

    /// Attach the cache that `evict_lazy` may shrink.
    pub fn with_cache(mut self, cache: Arc<dyn EvictableCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Admit or delay `job`, reserving its cpu/vram hints on success.
    pub fn admit(&mut self, job: &JobRecord) -> Admission {
        let reservation = Reservation {
            cpu_pct: job.spec.cost_hint.cpu_pct,
            vram_mb: job.spec.cost_hint.vram_mb,
        };

        match self.check(&reservation) {
            Ok(()) => {
                self.reservations.insert(job.id.clone(), reservation);
                self.publish_state();
                Admission::Accepted
            }
            Err(reason) => {
                debug!(job = %job.id, %reason, "admission delayed");
                self.delayed.push_back((job.id.clone(), reservation));
                self.publish_state();
                Admission::Delayed { reason }
            }
        }
    }

    /// Free the cpu/vram reservation held by `id`, if any.
    pub fn release(&mut self, id: &JobId) {
        if self.reservations.remove(id).is_some() {
            self.publish_state();
        }
    }

    /// Forget a delayed entry (cancelled before promotion).
    pub fn forget_delayed(&mut self, id: &JobId) {
        let before = self.delayed.len();
        self.delayed.retain(|(jid, _)| jid != id);
        if self.delayed.len() != before {
            self.publish_state();
        }
    }

    /// Take an execution slot on `target`; `false` when at capacity.
    pub fn try_acquire_slot(&mut self, target: Target) -> bool {
        let (used, cap) = match target {
            Target::Remote => (&mut self.remote_slots, self.config.concurrent_remote_max),
            _ => (&mut self.local_slots, self.config.concurrent_local_max),
        };
        if *used >= cap {
            return false;
        }
        *used += 1;
        self.publish_state();
        true
    }

    /// Return an execution slot on `target`.
    pub fn release_slot(&mut self, target: Target) {
        let used = match target {
            Target::Remote => &mut self.remote_slots,
            _ => &mut self.local_slots,
        };
        *used = used.saturating_sub(1);
        self.publish_state();
    }

    /// Slots currently in use on `target`.
    pub fn slots_in_use(&self, target: Target) -> usize {
        match target {
            Target::Remote => self.remote_slots,
            _ => self.local_slots,
        }
    }

    /// Promote delayed jobs oldest-first while budgets fit. Returns the ids
    /// whose reservations are now active; the scheduler re-queues them.
    pub fn refresh(&mut self) -> Vec<JobId> {
        let mut promoted = Vec::new();
        while let Some((id, reservation)) = self.delayed.front().cloned() {
            if self.check(&reservation).is_err() {
                break;
            }
            self.delayed.pop_front();
            self.reservations.insert(id.clone(), reservation);
            promoted.push(id);
        }
        if !promoted.is_empty() {
            info!(count = promoted.len(), "promoted delayed jobs");
            self.publish_state();
        }
        promoted
    }

    /// Evict unpinned cache entries by LRU when pressure is high.
    ///
    /// No-op unless `lazy_eviction_enabled` and a cache is attached.
    pub fn evict_lazy(&mut self) -> usize {
        if !self.config.lazy_eviction_enabled {
            return 0;
        }
        let Some(cache) = self.cache.as_ref() else {
            return 0;
        };
        let pressure = self.local_slots as f64 / self.config.concurrent_local_max.max(1) as f64;
        if pressure < EVICTION_HIGH_WATER && cache.len() < EVICTION_BATCH * 4 {
            return 0;
        }
        let evicted = cache.evict_lru(EVICTION_BATCH);
        if evicted > 0 {
            self.evictions += evicted as u64;
            info!(evicted, "lazy cache eviction");
            self.publish_state();
        }
        evicted
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            delayed: self.delayed.len() as u64,
            active_local: self.local_slots as u64,
            active_remote: self.remote_slots as u64,
            cpu_pct_reserved: self.reservations.values().map(|r| r.cpu_pct).sum(),
            vram_mb_reserved: self.reservations.values().map(|r| r.vram_mb).sum(),
            evictions: self.evictions,
        }
    }

    /// The configured limits.
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    fn check(&self, r: &Reservation) -> Result<(), String> {
        let cpu: u32 = self.reservations.values().map(|x| x.cpu_pct).sum();
        if cpu + r.cpu_pct > self.config.cpu_pct_max {
            return Err(format!(
                "cpu budget exceeded ({} + {} > {})",
                cpu, r.cpu_pct, self.config.cpu_pct_max
            ));
        }
        let vram: u64 = self.reservations.values().map(|x| x.vram_mb).sum();
        if vram + r.vram_mb > self.config.vram_mb_max {
            return Err(format!(
                "vram budget exceeded ({} + {} > {})",
                vram, r.vram_mb, self.config.vram_mb_max
            ));
        }
        Ok(())
    }

    fn publish_state(&self) {
        let snap = self.snapshot();
        let mut payload = BTreeMap::new();
        payload.insert("delayed".to_string(), json!(snap.delayed));
        payload.insert("active_local".to_string(), json!(snap.active_local));
        payload.insert("active_remote".to_string(), json!(snap.active_remote));
        payload.insert("evictions".to_string(), json!(snap.evictions));
        // Best-effort: budget state is advisory telemetry.
        let _ = self.bus.publish("on_perf_budget_state", "budget", payload);
    }
}
