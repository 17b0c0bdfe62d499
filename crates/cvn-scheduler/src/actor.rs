// SPDX-License-Identifier: MIT OR Apache-2.0
//! The scheduler actor: single logical mutator of all job state.

use crate::cost::{advise, preview_cost, ComputeAdvice};
use crate::store::{JobStore, StoreError};
use crate::{BoardSnapshot, SchedulerConfig, SchedulerHealth};
use chrono::Utc;
use cvn_budget::{Admission, BudgetManager};
use cvn_core::{CostEstimate, JobId, JobRecord, JobSpec, JobState, Target, TraceEntry};
use cvn_error::StudioError;
use cvn_events::EventBus;
use cvn_flags::FlagStore;
use cvn_policy::Enforcer;
use cvn_providers::ProviderRegistry;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Kinds gated by the `enable_compute` umbrella flag.
const COMPUTE_KINDS: &[&str] = &["render", "upscale", "tts"];
/// Completed-duration samples retained per kind.
const ROLLING_WINDOW: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, StudioError>>;

pub(crate) enum Command {
    Submit {
        spec: JobSpec,
        ack_token: Option<String>,
        reply: Reply<JobRecord>,
    },
    Claim {
        worker: String,
        target: Target,
        capabilities: Vec<String>,
        reply: Reply<Option<JobRecord>>,
    },
    Start {
        id: JobId,
        worker: String,
        reply: Reply<JobRecord>,
    },
    Complete {
        id: JobId,
        result: BTreeMap<String, serde_json::Value>,
        reply: Reply<JobRecord>,
    },
    Fail {
        id: JobId,
        error: String,
        reply: Reply<JobRecord>,
    },
    Requeue {
        id: JobId,
        reply: Reply<JobRecord>,
    },
    Cancel {
        id: JobId,
        reply: Reply<JobRecord>,
    },
    State {
        id: JobId,
        reply: Reply<JobRecord>,
    },
    Board {
        target: Option<Target>,
        reply: oneshot::Sender<BoardSnapshot>,
    },
    Health {
        reply: oneshot::Sender<SchedulerHealth>,
    },
    PreviewCost {
        spec: JobSpec,
        reply: oneshot::Sender<CostEstimate>,
    },
    Advise {
        spec: JobSpec,
        reply: oneshot::Sender<ComputeAdvice>,
    },
    Refresh,
    RetryReady {
        id: JobId,
    },
    CancelTimeout {
        id: JobId,
    },
}

pub(crate) struct Actor {
    config: SchedulerConfig,
    jobs: BTreeMap<JobId, JobRecord>,
    /// Per-target queue ordered by `(−priority, submitted_seq, id)`.
    queues: HashMap<Target, BTreeSet<(i64, u64, JobId)>>,
    /// sticky_key → worker that last ran it.
    sticky: HashMap<String, String>,
    /// Rolling completed-duration samples per kind, seconds.
    durations: BTreeMap<String, VecDeque<f64>>,
    submitted_seq: u64,
    store: JobStore,
    budget: BudgetManager,
    enforcer: Enforcer,
    flags: FlagStore,
    providers: ProviderRegistry,
    bus: EventBus,
    self_tx: mpsc::Sender<Command>,
}

impl Actor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: SchedulerConfig,
        store_path: impl Into<PathBuf>,
        mut budget: BudgetManager,
        enforcer: Enforcer,
        flags: FlagStore,
        providers: ProviderRegistry,
        bus: EventBus,
        self_tx: mpsc::Sender<Command>,
    ) -> Result<Self, StoreError> {
        let (store, jobs) = JobStore::open(store_path)?;

        // Restore queues and budget reservations for surviving jobs.
        let mut queues: HashMap<Target, BTreeSet<(i64, u64, JobId)>> = HashMap::new();
        let mut submitted_seq = 0;
        for record in jobs.values() {
            submitted_seq = submitted_seq.max(record.submitted_seq);
            match record.state {
                JobState::Queued | JobState::Requeued => {
                    budget.admit(record);
                    queues
                        .entry(record.resolved_target)
                        .or_default()
                        .insert(record.order_key());
                }
                JobState::Delayed => {
                    budget.admit(record);
                }
                JobState::Claimed | JobState::Running => {
                    budget.admit(record);
                    budget.try_acquire_slot(record.resolved_target);
                }
                _ => {}
            }
        }

        Ok(Self {
            config,
            jobs,
            queues,
            sticky: HashMap::new(),
            durations: BTreeMap::new(),
            submitted_seq,
            store,
            budget,
            enforcer,
            flags,
            providers,
            bus,
            self_tx,
        })
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Submit { spec, ack_token, reply } => {
                    let _ = reply.send(self.submit(spec, ack_token));
                }
                Command::Claim { worker, target, capabilities, reply } => {
                    let _ = reply.send(self.claim(&worker, target, &capabilities));
                }
                Command::Start { id, worker, reply } => {
                    let _ = reply.send(self.start(&id, &worker));
                }
                Command::Complete { id, result, reply } => {
                    let _ = reply.send(self.complete(&id, result));
                }
                Command::Fail { id, error, reply } => {
                    let _ = reply.send(self.fail(&id, &error));
                }
                Command::Requeue { id, reply } => {
                    let _ = reply.send(self.requeue_claimed(&id));
                }
                Command::Cancel { id, reply } => {
                    let _ = reply.send(self.cancel(&id));
                }
                Command::State { id, reply } => {
                    let _ = reply.send(
                        self.jobs
                            .get(&id)
                            .cloned()
                            .ok_or_else(|| StudioError::not_found(format!("job {id}"))),
                    );
                }
                Command::Board { target, reply } => {
                    let _ = reply.send(self.board(target));
                }
                Command::Health { reply } => {
                    let _ = reply.send(self.health());
                }
                Command::PreviewCost { spec, reply } => {
                    let _ = reply.send(preview_cost(
                        &spec,
                        &self.providers.list(),
                        &self.rolling_averages(),
                    ));
                }
                Command::Advise { spec, reply } => {
                    let _ = reply.send(self.advice_for(&spec));
                }
                Command::Refresh => {
                    self.promote_delayed();
                    self.budget.evict_lazy();
                }
                Command::RetryReady { id } => {
                    self.retry_ready(&id);
                }
                Command::CancelTimeout { id } => {
                    self.cancel_timeout(&id);
                }
            }
        }
    }

    // -- submission ----------------------------------------------------------

    fn submit(&mut self, spec: JobSpec, ack_token: Option<String>) -> Result<JobRecord, StudioError> {
        if spec.kind.trim().is_empty() {
            return Err(StudioError::invalid_input("job kind must not be empty"));
        }

        if COMPUTE_KINDS.contains(&spec.kind.as_str()) && !self.flags.is_enabled("enable_compute") {
            return Err(StudioError::feature_disabled("enable_compute"));
        }

        if self.flags.is_enabled("policy_gate_scheduler") {
            let payload = json!({
                "kind": &spec.kind,
                "tags": &spec.tags,
                "input": &spec.input,
            });
            let evaluation = self
                .enforcer
                .evaluate("schedule.submit", payload, ack_token.as_deref());
            if !evaluation.allow {
                return Err(StudioError::policy_blocked("submission blocked by advisory")
                    .with_details(json!({ "findings": evaluation.findings })));
            }
        }

        self.submitted_seq += 1;
        let mut record = JobRecord::new(JobId::new(), spec, self.submitted_seq);
        record.resolved_target = self.resolve_target(&record.spec);

        // Admission decides queued vs delayed; both are durable transitions.
        let admission = self.budget.admit(&record);
        self.jobs.insert(record.id.clone(), record.clone());
        match admission {
            Admission::Accepted => {
                self.transition(&record.id, JobState::Queued, None, None)?;
                self.queue_insert(&record.id);
                self.preempt_for(&record.id);
            }
            Admission::Delayed { reason } => {
                self.transition(&record.id, JobState::Delayed, Some(reason), None)?;
            }
        }
        Ok(self.jobs[&record.id].clone())
    }

    fn resolve_target(&self, spec: &JobSpec) -> Target {
        match self.advice_for(spec) {
            ComputeAdvice::Remote => Target::Remote,
            ComputeAdvice::Gpu | ComputeAdvice::Cpu => Target::Local,
        }
    }

    fn advice_for(&self, spec: &JobSpec) -> ComputeAdvice {
        advise(
            spec,
            &self.providers.list(),
            self.flags.is_enabled("enable_compute"),
            self.flags.is_enabled("enable_remote_compute"),
        )
    }

    /// Preempt for a fresh high-priority arrival when its target has no free
    /// slot: the oldest lowest-priority claimed-but-not-running job yields.
    fn preempt_for(&mut self, new_id: &JobId) {
        let Some(new_job) = self.jobs.get(new_id).cloned() else {
            return;
        };
        let target = new_job.resolved_target;
        let cap = match target {
            Target::Remote => self.budget.config().concurrent_remote_max,
            _ => self.budget.config().concurrent_local_max,
        };
        if self.budget.slots_in_use(target) < cap {
            return;
        }

        let victim = self
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Claimed
                    && j.resolved_target == target
                    && !j.cancel_pending
                    && j.spec.priority < new_job.spec.priority
            })
            .min_by_key(|j| (j.spec.priority, j.submitted_seq))
            .map(|j| j.id.clone());

        if let Some(victim_id) = victim {
            info!(victim = %victim_id, winner = %new_id, "preempting claimed job");
            let note = format!("preempted by {new_id}");
            if self
                .transition(&victim_id, JobState::Requeued, Some(note), None)
                .is_ok()
            {
                if let Some(v) = self.jobs.get_mut(&victim_id) {
                    v.worker_id = None;
                }
                self.budget.release_slot(target);
                let _ = self.transition(&victim_id, JobState::Queued, None, None);
                self.queue_insert(&victim_id);
            }
        }
    }

    // -- claim / start -------------------------------------------------------

    fn claim(
        &mut self,
        worker: &str,
        target: Target,
        capabilities: &[String],
    ) -> Result<Option<JobRecord>, StudioError> {
        let Some(candidate) = self.pick_claimable(worker, target, capabilities) else {
            return Ok(None);
        };
        if !self.budget.try_acquire_slot(target) {
            return Ok(None);
        }

        self.queue_remove(&candidate);
        {
            let record = self.jobs.get_mut(&candidate).expect("picked job exists");
            record.worker_id = Some(worker.to_string());
            record.attempts += 1;
            if let Some(key) = record.spec.sticky_key.clone() {
                self.sticky.insert(key, worker.to_string());
            }
        }
        self.transition(
            &candidate,
            JobState::Claimed,
            None,
            Some(worker.to_string()),
        )?;
        Ok(Some(self.jobs[&candidate].clone()))
    }

    /// Queue-order pick, with sticky affinity: a job whose sticky key last
    /// ran on this worker wins over earlier queue entries.
    fn pick_claimable(
        &self,
        worker: &str,
        target: Target,
        capabilities: &[String],
    ) -> Option<JobId> {
        let queue = self.queues.get(&target)?;
        let eligible = |id: &JobId| {
            let job = self.jobs.get(id)?;
            if !capabilities.is_empty() && !capabilities.iter().any(|c| c == &job.spec.kind) {
                return None;
            }
            Some(job)
        };

        let mut first_match: Option<JobId> = None;
        for (_, _, id) in queue {
            let Some(job) = eligible(id) else { continue };
            if first_match.is_none() {
                first_match = Some(id.clone());
            }
            if let Some(key) = &job.spec.sticky_key {
                if self.sticky.get(key).is_some_and(|w| w == worker) {
                    return Some(id.clone());
                }
            }
        }
        first_match
    }

    fn start(&mut self, id: &JobId, worker: &str) -> Result<JobRecord, StudioError> {
        let record = self.get(id)?;
        if record.state != JobState::Claimed {
            return Err(StudioError::conflict(format!(
                "job {id} is {}, expected claimed",
                record.state
            )));
        }
        if record.worker_id.as_deref() != Some(worker) {
            return Err(StudioError::conflict(format!(
                "job {id} is claimed by another worker"
            )));
        }
        self.transition(id, JobState::Running, None, Some(worker.to_string()))?;
        Ok(self.jobs[id].clone())
    }

    // -- completion / failure ------------------------------------------------

    fn complete(
        &mut self,
        id: &JobId,
        result: BTreeMap<String, serde_json::Value>,
    ) -> Result<JobRecord, StudioError> {
        let record = self.get(id)?;
        if record.state != JobState::Running {
            return Err(StudioError::conflict(format!(
                "job {id} is {}, expected running",
                record.state
            )));
        }

        if record.cancel_pending {
            // Worker reached a terminal report while a cancel was pending:
            // the record clamps to cancelled.
            self.finish(id, JobState::Cancelled, Some("cancel clamped".into()))?;
            return Ok(self.jobs[id].clone());
        }

        self.record_duration(id);
        if let Some(r) = self.jobs.get_mut(id) {
            r.result = Some(result);
        }
        self.finish(id, JobState::Complete, None)?;
        Ok(self.jobs[id].clone())
    }

    fn fail(&mut self, id: &JobId, error: &str) -> Result<JobRecord, StudioError> {
        let record = self.get(id)?;
        if record.state != JobState::Running {
            return Err(StudioError::conflict(format!(
                "job {id} is {}, expected running",
                record.state
            )));
        }

        if let Some(r) = self.jobs.get_mut(id) {
            r.last_error = Some(error.to_string());
        }

        if record.cancel_pending {
            self.finish(id, JobState::Cancelled, Some("cancel clamped".into()))?;
            return Ok(self.jobs[id].clone());
        }

        if record.attempts < self.config.max_attempts {
            // Retry: failed → requeued now, requeued → queued after backoff.
            self.transition(id, JobState::Failed, Some(error.to_string()), None)?;
            self.transition(
                id,
                JobState::Requeued,
                Some(format!("retry {}/{}", record.attempts, self.config.max_attempts)),
                None,
            )?;
            self.budget.release_slot(record.resolved_target);
            if let Some(r) = self.jobs.get_mut(id) {
                r.worker_id = None;
            }

            let backoff = self.config.retry_backoff * 2u32.saturating_pow(record.attempts - 1);
            let tx = self.self_tx.clone();
            let retry_id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                let _ = tx.send(Command::RetryReady { id: retry_id }).await;
            });
        } else {
            self.finish(id, JobState::Failed, Some(format!("retries exhausted: {error}")))?;
        }
        Ok(self.jobs[id].clone())
    }

    fn retry_ready(&mut self, id: &JobId) {
        let Some(record) = self.jobs.get(id) else { return };
        if record.state != JobState::Requeued {
            return;
        }
        if self.transition(id, JobState::Queued, None, None).is_ok() {
            self.queue_insert(id);
        }
    }

    fn requeue_claimed(&mut self, id: &JobId) -> Result<JobRecord, StudioError> {
        let record = self.get(id)?;
        if record.state != JobState::Claimed {
            return Err(StudioError::conflict(format!(
                "job {id} is {}, only claimed jobs can be requeued",
                record.state
            )));
        }
        self.transition(id, JobState::Requeued, Some("requeued by caller".into()), None)?;
        self.budget.release_slot(record.resolved_target);
        if let Some(r) = self.jobs.get_mut(id) {
            r.worker_id = None;
        }
        self.transition(id, JobState::Queued, None, None)?;
        self.queue_insert(id);
        Ok(self.jobs[id].clone())
    }

    // -- cancellation --------------------------------------------------------

    fn cancel(&mut self, id: &JobId) -> Result<JobRecord, StudioError> {
        let record = self.get(id)?;
        match record.state {
            JobState::Complete | JobState::Failed | JobState::Cancelled => {
                Err(StudioError::conflict(format!(
                    "job {id} is already {}",
                    record.state
                )))
            }
            JobState::Queued => {
                self.queue_remove(id);
                self.budget.release(id);
                self.transition(id, JobState::Cancelled, None, None)?;
                self.promote_delayed();
                Ok(self.jobs[id].clone())
            }
            JobState::Delayed => {
                self.budget.forget_delayed(id);
                self.transition(id, JobState::Cancelled, None, None)?;
                Ok(self.jobs[id].clone())
            }
            JobState::Requeued => {
                self.budget.release(id);
                self.transition(id, JobState::Cancelled, None, None)?;
                self.promote_delayed();
                Ok(self.jobs[id].clone())
            }
            JobState::Claimed | JobState::Running => {
                // Cooperative: flag the record, give the worker a grace
                // window, then force the terminal transition.
                if let Some(r) = self.jobs.get_mut(id) {
                    if r.cancel_pending {
                        return Ok(r.clone());
                    }
                    r.cancel_pending = true;
                    r.trace.push(TraceEntry {
                        at: Utc::now(),
                        state: r.state,
                        note: Some("cancel requested".into()),
                        worker_id: r.worker_id.clone(),
                    });
                }
                self.persist(id)?;

                let tx = self.self_tx.clone();
                let grace = self.config.cancel_grace;
                let timeout_id = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = tx.send(Command::CancelTimeout { id: timeout_id }).await;
                });
                Ok(self.jobs[id].clone())
            }
            JobState::PendingAdmission => {
                self.transition(id, JobState::Cancelled, None, None)?;
                Ok(self.jobs[id].clone())
            }
        }
    }

    fn cancel_timeout(&mut self, id: &JobId) {
        let Some(record) = self.jobs.get(id).cloned() else { return };
        if record.state.is_terminal() || !record.cancel_pending {
            return;
        }
        warn!(job = %id, "cooperative cancel timed out, forcing terminal state");
        if let Err(e) = self.finish(id, JobState::Cancelled, Some("cancelled_timeout".into())) {
            warn!(job = %id, error = %e, "forced cancel failed");
        }
    }

    // -- shared transition machinery -----------------------------------------

    /// Terminal transition from claimed/running: frees the slot and the
    /// reservation, then lets delayed jobs move up.
    fn finish(&mut self, id: &JobId, to: JobState, note: Option<String>) -> Result<(), StudioError> {
        let record = self.get(id)?;
        if matches!(record.state, JobState::Claimed | JobState::Running) {
            self.budget.release_slot(record.resolved_target);
        }
        self.budget.release(id);
        self.transition(id, to, note, None)?;
        self.promote_delayed();
        Ok(())
    }

    fn promote_delayed(&mut self) {
        for id in self.budget.refresh() {
            let Some(record) = self.jobs.get(&id) else { continue };
            if record.state != JobState::Delayed {
                continue;
            }
            if self
                .transition(&id, JobState::Queued, Some("budget pressure eased".into()), None)
                .is_ok()
            {
                self.queue_insert(&id);
            }
        }
    }

    /// Apply a state transition: validate, mutate, persist (fsync), then
    /// publish `on_job_state_changed`. Durability strictly precedes the hook.
    fn transition(
        &mut self,
        id: &JobId,
        to: JobState,
        note: Option<String>,
        worker: Option<String>,
    ) -> Result<(), StudioError> {
        let record = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StudioError::not_found(format!("job {id}")))?;
        let from = record.state;
        if !from.can_transition_to(to) {
            return Err(StudioError::conflict(format!(
                "illegal transition {from} -> {to} for job {id}"
            )));
        }
        record.state = to;
        record.trace.push(TraceEntry {
            at: Utc::now(),
            state: to,
            note,
            worker_id: worker.clone().or_else(|| record.worker_id.clone()),
        });

        self.persist(id)?;

        let mut payload = BTreeMap::new();
        payload.insert("id".to_string(), json!(id.as_str()));
        payload.insert("from".to_string(), json!(from.to_string()));
        payload.insert("to".to_string(), json!(to.to_string()));
        if let Some(w) = worker {
            payload.insert("worker".to_string(), json!(w));
        }
        if let Err(e) = self.bus.publish("on_job_state_changed", "scheduler", payload) {
            warn!(job = %id, error = %e, "job state hook publish failed");
        }
        Ok(())
    }

    fn persist(&mut self, id: &JobId) -> Result<(), StudioError> {
        let record = self.jobs.get(id).expect("persist called on live record");
        self.store
            .append(record)
            .map_err(|e| StudioError::internal(format!("job store append: {e}")))
    }

    // -- queries -------------------------------------------------------------

    fn board(&self, target: Option<Target>) -> BoardSnapshot {
        let mut jobs: Vec<JobRecord> = self
            .jobs
            .values()
            .filter(|j| target.is_none_or(|t| j.resolved_target == t))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.order_key());
        BoardSnapshot {
            jobs,
            budget: self.budget.snapshot(),
            queued_local: self.queue_len(Target::Local),
            queued_remote: self.queue_len(Target::Remote),
        }
    }

    fn health(&self) -> SchedulerHealth {
        let snap = self.budget.snapshot();
        SchedulerHealth {
            status: "ok".to_string(),
            queued_local: self.queue_len(Target::Local),
            queued_remote: self.queue_len(Target::Remote),
            active_local: snap.active_local as usize,
            active_remote: snap.active_remote as usize,
            delayed: snap.delayed as usize,
            total_jobs: self.jobs.len(),
        }
    }

    fn rolling_averages(&self) -> BTreeMap<String, f64> {
        self.durations
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(kind, samples)| {
                let mean = samples.iter().sum::<f64>() / samples.len() as f64;
                (kind.clone(), mean)
            })
            .collect()
    }

    fn record_duration(&mut self, id: &JobId) {
        let Some(record) = self.jobs.get(id) else { return };
        let started = record
            .trace
            .iter()
            .rev()
            .find(|t| t.state == JobState::Running)
            .map(|t| t.at);
        if let Some(at) = started {
            let secs = (Utc::now() - at).num_milliseconds() as f64 / 1000.0;
            let samples = self.durations.entry(record.spec.kind.clone()).or_default();
            if samples.len() >= ROLLING_WINDOW {
                samples.pop_front();
            }
            samples.push_back(secs.max(0.0));
        }
    }

    // -- queue helpers -------------------------------------------------------

    fn queue_insert(&mut self, id: &JobId) {
        if let Some(record) = self.jobs.get(id) {
            self.queues
                .entry(record.resolved_target)
                .or_default()
                .insert(record.order_key());
        }
    }

    fn queue_remove(&mut self, id: &JobId) {
        if let Some(record) = self.jobs.get(id) {
            if let Some(queue) = self.queues.get_mut(&record.resolved_target) {
                queue.remove(&record.order_key());
            }
        }
    }

    fn queue_len(&self, target: Target) -> usize {
        self.queues.get(&target).map_or(0, BTreeSet::len)
    }

    fn get(&self, id: &JobId) -> Result<JobRecord, StudioError> {
        self.jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StudioError::not_found(format!("job {id}")))
    }
}
