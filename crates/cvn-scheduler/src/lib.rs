// SPDX-License-Identifier: MIT OR Apache-2.0
//! The job scheduler.
//!
//! All scheduler state lives inside a single actor task fed by a command
//! channel; external callers hold a cloneable [`Scheduler`] handle whose
//! methods send a message and await the reply. This gives totally ordered
//! transitions with no cross-thread races on job records. Each transition is
//! appended to the durable job log (fsync) before its
//! `on_job_state_changed` hook is published.

#![deny(unsafe_code)]

mod actor;
mod cost;
mod store;

pub use cost::{advise, preview_cost, ComputeAdvice};
pub use store::{JobStore, StoreError};

use actor::{Actor, Command};
use cvn_budget::{BudgetManager, BudgetSnapshot};
use cvn_core::{CostEstimate, JobId, JobRecord, JobSpec, Target};
use cvn_error::StudioError;
use cvn_events::EventBus;
use cvn_flags::FlagStore;
use cvn_policy::Enforcer;
use cvn_providers::ProviderRegistry;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Tuning knobs for the scheduler actor.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Execution attempts before a failure is terminal.
    pub max_attempts: u32,
    /// Base delay before a failed job re-enters its queue; doubles per
    /// attempt.
    pub retry_backoff: Duration,
    /// How long a cooperative cancel may stay pending before the record is
    /// forced to `cancelled` with a `cancelled_timeout` note.
    pub cancel_grace: Duration,
    /// Cadence of the background budget refresh.
    pub refresh_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            cancel_grace: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(1),
        }
    }
}

/// Snapshot for Gantt-style UIs.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct BoardSnapshot {
    /// Job records, queue-ordered within each target.
    pub jobs: Vec<JobRecord>,
    /// Current budget state.
    pub budget: BudgetSnapshot,
    /// Jobs waiting in the local queue.
    pub queued_local: usize,
    /// Jobs waiting in the remote queue.
    pub queued_remote: usize,
}

/// Scheduler health summary.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct SchedulerHealth {
    /// Always `"ok"` while the actor is alive.
    pub status: String,
    /// Jobs waiting in the local queue.
    pub queued_local: usize,
    /// Jobs waiting in the remote queue.
    pub queued_remote: usize,
    /// Claimed or running on the local target.
    pub active_local: usize,
    /// Claimed or running on the remote target.
    pub active_remote: usize,
    /// Jobs delayed by the budget gate.
    pub delayed: usize,
    /// Total records held (terminal included).
    pub total_jobs: usize,
}

/// Cloneable handle onto the scheduler actor.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::Sender<Command>,
}

impl Scheduler {
    /// Spawn the actor and its timers. Replays `store_path` on startup.
    pub fn spawn(
        config: SchedulerConfig,
        store_path: impl Into<PathBuf>,
        budget: BudgetManager,
        enforcer: Enforcer,
        flags: FlagStore,
        providers: ProviderRegistry,
        bus: EventBus,
    ) -> Result<Self, StoreError> {
        let (tx, rx) = mpsc::channel(256);
        let actor = Actor::new(config.clone(), store_path, budget, enforcer, flags, providers, bus, tx.clone())?;
        tokio::spawn(actor.run(rx));

        // Background refresh keeps delayed jobs moving even when no
        // completions arrive.
        let refresh_tx = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.refresh_interval);
            loop {
                ticker.tick().await;
                if refresh_tx.send(Command::Refresh).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self { tx })
    }

    /// Submit a job through the flag, advisory, and budget gates.
    pub async fn submit(
        &self,
        spec: JobSpec,
        ack_token: Option<String>,
    ) -> Result<JobRecord, StudioError> {
        self.call(|reply| Command::Submit { spec, ack_token, reply }).await?
    }

    /// Claim the next eligible job for `worker` on `target`.
    pub async fn claim(
        &self,
        worker: &str,
        target: Target,
        capabilities: Vec<String>,
    ) -> Result<Option<JobRecord>, StudioError> {
        self.call(|reply| Command::Claim {
            worker: worker.to_string(),
            target,
            capabilities,
            reply,
        })
        .await?
    }

    /// Worker reports the claimed job has started running.
    pub async fn start(&self, id: &JobId, worker: &str) -> Result<JobRecord, StudioError> {
        self.call(|reply| Command::Start {
            id: id.clone(),
            worker: worker.to_string(),
            reply,
        })
        .await?
    }

    /// Worker reports success.
    pub async fn complete(
        &self,
        id: &JobId,
        result: BTreeMap<String, serde_json::Value>,
    ) -> Result<JobRecord, StudioError> {
        self.call(|reply| Command::Complete {
            id: id.clone(),
            result,
            reply,
        })
        .await?
    }

    /// Worker reports failure; retried until `max_attempts`.
    pub async fn fail(&self, id: &JobId, error: &str) -> Result<JobRecord, StudioError> {
        self.call(|reply| Command::Fail {
            id: id.clone(),
            error: error.to_string(),
            reply,
        })
        .await?
    }

    /// Push a claimed job back into its queue.
    pub async fn requeue(&self, id: &JobId) -> Result<JobRecord, StudioError> {
        self.call(|reply| Command::Requeue { id: id.clone(), reply }).await?
    }

    /// Cancel a job; cooperative when it is claimed or running.
    pub async fn cancel(&self, id: &JobId) -> Result<JobRecord, StudioError> {
        self.call(|reply| Command::Cancel { id: id.clone(), reply }).await?
    }

    /// Fetch a job record.
    pub async fn state(&self, id: &JobId) -> Result<JobRecord, StudioError> {
        self.call(|reply| Command::State { id: id.clone(), reply }).await?
    }

    /// Board snapshot, optionally filtered to one target.
    pub async fn board(&self, target: Option<Target>) -> Result<BoardSnapshot, StudioError> {
        self.call(|reply| Command::Board { target, reply }).await
    }

    /// Scheduler health.
    pub async fn health(&self) -> Result<SchedulerHealth, StudioError> {
        self.call(|reply| Command::Health { reply }).await
    }

    /// Pure cost preview for a prospective job.
    pub async fn preview_cost(&self, spec: JobSpec) -> Result<CostEstimate, StudioError> {
        self.call(|reply| Command::PreviewCost { spec, reply }).await
    }

    /// Pure target advice for a prospective job.
    pub async fn advise(&self, spec: JobSpec) -> Result<ComputeAdvice, StudioError> {
        self.call(|reply| Command::Advise { spec, reply }).await
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, StudioError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| StudioError::internal("scheduler unavailable"))?;
        reply_rx
            .await
            .map_err(|_| StudioError::internal("scheduler dropped reply"))
    }
}

#[cfg(test)]
mod tests;
