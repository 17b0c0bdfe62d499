// SPDX-License-Identifier: MIT OR Apache-2.0
//! Job identity, submission payloads, and the lifecycle state machine.

use crate::cost::CostHint;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// Job identifier: a ULID rendered in its canonical 26-character form.
///
/// ULIDs sort lexicographically by creation time, which makes the id itself
/// a stable final tie-break in queue ordering.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Mint a fresh id from the current wall clock.
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Parse a caller-supplied id, rejecting anything that is not a ULID.
    pub fn parse(s: &str) -> Option<Self> {
        ulid::Ulid::from_string(s).ok().map(|u| Self(u.to_string()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// Where a job wants to run.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// The local queue (this machine).
    #[default]
    Local,
    /// The remote queue (a configured provider).
    Remote,
    /// Resolved at submission time by the cost/affinity policy.
    Auto,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Auto => "auto",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Lifecycle state of a job record.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted, waiting on the flag/advisory/budget gates.
    PendingAdmission,
    /// Held back by the budget manager; promoted when pressure eases.
    Delayed,
    /// Admitted and waiting in its target queue.
    Queued,
    /// Claimed by a worker but not yet started.
    Claimed,
    /// Executing on a worker.
    Running,
    /// Finished successfully (terminal).
    Complete,
    /// Failed with retries exhausted (terminal), or awaiting requeue.
    Failed,
    /// Kicked back to the queue after a failure or preemption.
    Requeued,
    /// Cancelled by a caller (terminal).
    Cancelled,
}

impl JobState {
    /// Returns `true` for states that freeze the record.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// The set of states reachable from `self` in one transition.
    ///
    /// `Failed` lists `Requeued` because a failure only becomes terminal
    /// once the scheduler decides retries are exhausted; until then it may
    /// bounce the job back. `Cancelled` is additionally reachable from every
    /// non-terminal state.
    pub fn valid_transitions(&self) -> &'static [JobState] {
        match self {
            Self::PendingAdmission => &[Self::Delayed, Self::Queued, Self::Cancelled],
            Self::Delayed => &[Self::Queued, Self::Cancelled],
            Self::Queued => &[Self::Claimed, Self::Cancelled],
            Self::Claimed => &[Self::Running, Self::Requeued, Self::Cancelled],
            Self::Running => &[Self::Complete, Self::Failed, Self::Cancelled],
            Self::Failed => &[Self::Requeued],
            Self::Requeued => &[Self::Queued, Self::Cancelled],
            Self::Complete | Self::Cancelled => &[],
        }
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PendingAdmission => "pending_admission",
            Self::Delayed => "delayed",
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Requeued => "requeued",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// JobSpec
// ---------------------------------------------------------------------------

/// A job submission: everything the caller provides.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct JobSpec {
    /// Job kind, e.g. `render`, `tts`, `import`, `export`.
    pub kind: String,
    /// Higher preempts; default 0.
    #[serde(default)]
    pub priority: i32,
    /// Requested execution target.
    #[serde(default)]
    pub target: Target,
    /// Opaque device preference passed through to workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_hint: Option<String>,
    /// When set, the scheduler prefers the device that last ran this key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky_key: Option<String>,
    /// Opaque input payload handed to the worker.
    #[serde(default)]
    pub input: BTreeMap<String, serde_json::Value>,
    /// Caller-supplied resource estimate consumed by the budget gate.
    #[serde(default)]
    pub cost_hint: CostHint,
    /// Free-form labels.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Inputs recorded into provenance for any assets the job produces.
    #[serde(default)]
    pub provenance_inputs: BTreeMap<String, serde_json::Value>,
    /// Optional wall-clock deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// TraceEntry
// ---------------------------------------------------------------------------

/// One append-only entry in a job's transition trace.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct TraceEntry {
    /// When the transition was recorded.
    pub at: DateTime<Utc>,
    /// State entered.
    pub state: JobState,
    /// Short human-readable note (admission reason, error, preemption).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Worker involved, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

// ---------------------------------------------------------------------------
// JobRecord
// ---------------------------------------------------------------------------

/// Full job record as owned by the scheduler and exposed on the board.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    /// Immutable identity.
    pub id: JobId,
    /// The submission as received (with `target` resolved if it was `auto`).
    pub spec: JobSpec,
    /// Target the job was actually enqueued on.
    pub resolved_target: Target,
    /// Current lifecycle state.
    pub state: JobState,
    /// Wall clock at submission.
    pub submitted_at: DateTime<Utc>,
    /// Process-monotonic admission counter; FIFO tie-break within a priority.
    pub submitted_seq: u64,
    /// Number of execution attempts so far.
    pub attempts: u32,
    /// Worker currently holding the job, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Last error reported by a worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Result map reported on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BTreeMap<String, serde_json::Value>>,
    /// Set when a cancel was requested while the job was claimed/running.
    #[serde(default)]
    pub cancel_pending: bool,
    /// Append-only transition history.
    pub trace: Vec<TraceEntry>,
}

impl JobRecord {
    /// Build a fresh record in `pending_admission`.
    pub fn new(id: JobId, spec: JobSpec, submitted_seq: u64) -> Self {
        let now = Utc::now();
        let resolved_target = spec.target;
        Self {
            id,
            spec,
            resolved_target,
            state: JobState::PendingAdmission,
            submitted_at: now,
            submitted_seq,
            attempts: 0,
            worker_id: None,
            last_error: None,
            result: None,
            cancel_pending: false,
            trace: vec![TraceEntry {
                at: now,
                state: JobState::PendingAdmission,
                note: None,
                worker_id: None,
            }],
        }
    }

    /// Queue ordering key: `(−priority, submitted_seq, id)`.
    pub fn order_key(&self) -> (i64, u64, JobId) {
        (-(self.spec.priority as i64), self.submitted_seq, self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: &str) -> JobSpec {
        JobSpec {
            kind: kind.into(),
            priority: 0,
            target: Target::Local,
            device_hint: None,
            sticky_key: None,
            input: BTreeMap::new(),
            cost_hint: CostHint::default(),
            tags: BTreeSet::new(),
            provenance_inputs: BTreeMap::new(),
            deadline: None,
        }
    }

    #[test]
    fn job_id_roundtrips_through_parse() {
        let id = JobId::new();
        assert_eq!(JobId::parse(id.as_str()), Some(id));
    }

    #[test]
    fn job_id_rejects_garbage() {
        assert!(JobId::parse("not-a-ulid").is_none());
        assert!(JobId::parse("").is_none());
    }

    #[test]
    fn fresh_ids_sort_by_creation_order() {
        let a = JobId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = JobId::new();
        assert!(a < b);
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobState::PendingAdmission).unwrap(),
            "\"pending_admission\""
        );
        assert_eq!(
            serde_json::to_string(&JobState::Requeued).unwrap(),
            "\"requeued\""
        );
    }

    #[test]
    fn terminal_states_freeze() {
        for s in [JobState::Complete, JobState::Cancelled] {
            assert!(s.is_terminal());
            assert!(s.valid_transitions().is_empty());
        }
        // Failed is terminal but may still be requeued by the retry policy.
        assert!(JobState::Failed.is_terminal());
        assert_eq!(JobState::Failed.valid_transitions(), &[JobState::Requeued]);
    }

    #[test]
    fn lifecycle_happy_path_is_legal() {
        let path = [
            JobState::PendingAdmission,
            JobState::Queued,
            JobState::Claimed,
            JobState::Running,
            JobState::Complete,
        ];
        for w in path.windows(2) {
            assert!(w[0].can_transition_to(w[1]), "{} -> {}", w[0], w[1]);
        }
    }

    #[test]
    fn retry_loop_is_legal() {
        assert!(JobState::Running.can_transition_to(JobState::Failed));
        assert!(JobState::Failed.can_transition_to(JobState::Requeued));
        assert!(JobState::Requeued.can_transition_to(JobState::Queued));
    }

    #[test]
    fn running_cannot_jump_back_to_queued() {
        assert!(!JobState::Running.can_transition_to(JobState::Queued));
        assert!(!JobState::Complete.can_transition_to(JobState::Running));
    }

    #[test]
    fn order_key_sorts_priority_then_fifo() {
        let mut low = JobRecord::new(JobId::new(), spec("render"), 2);
        low.spec.priority = 0;
        let mut high = JobRecord::new(JobId::new(), spec("render"), 3);
        high.spec.priority = 10;
        let mut first = JobRecord::new(JobId::new(), spec("render"), 1);
        first.spec.priority = 0;

        let mut keys = vec![low.order_key(), high.order_key(), first.order_key()];
        keys.sort();
        assert_eq!(keys[0], high.order_key());
        assert_eq!(keys[1], first.order_key());
        assert_eq!(keys[2], low.order_key());
    }

    #[test]
    fn record_starts_pending_with_one_trace_entry() {
        let r = JobRecord::new(JobId::new(), spec("tts"), 7);
        assert_eq!(r.state, JobState::PendingAdmission);
        assert_eq!(r.trace.len(), 1);
        assert_eq!(r.attempts, 0);
        assert!(!r.cancel_pending);
    }
}
