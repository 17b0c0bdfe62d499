// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end actor behavior over a temp store.

use super::*;
use cvn_budget::BudgetConfig;
use cvn_core::{CostHint, Finding, JobState};
use cvn_events::{HistoryFilter, TopicFilter};
use cvn_policy::{ScanContext, Scanner};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    _tmp: tempfile::TempDir,
    bus: EventBus,
    enforcer: Enforcer,
    scheduler: Scheduler,
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        max_attempts: 3,
        retry_backoff: Duration::from_millis(10),
        cancel_grace: Duration::from_millis(100),
        refresh_interval: Duration::from_millis(50),
    }
}

fn harness_with(budget_config: BudgetConfig) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let bus = EventBus::in_memory();
    let flags = FlagStore::open(tmp.path().join("flags.json")).unwrap();
    let enforcer = Enforcer::new(bus.clone());
    let budget = BudgetManager::new(budget_config, bus.clone());
    let providers = ProviderRegistry::with_local_defaults();
    let scheduler = Scheduler::spawn(
        fast_config(),
        tmp.path().join("jobs.db"),
        budget,
        enforcer.clone(),
        flags,
        providers,
        bus.clone(),
    )
    .unwrap();
    Harness {
        _tmp: tmp,
        bus,
        enforcer,
        scheduler,
    }
}

fn harness() -> Harness {
    harness_with(BudgetConfig::default())
}

fn spec(kind: &str, priority: i32) -> JobSpec {
    JobSpec {
        kind: kind.into(),
        priority,
        target: Target::Local,
        device_hint: None,
        sticky_key: None,
        input: BTreeMap::new(),
        cost_hint: CostHint::default(),
        tags: Default::default(),
        provenance_inputs: BTreeMap::new(),
        deadline: None,
    }
}

#[tokio::test]
async fn linear_submit_claim_start_complete() {
    let h = harness();
    let job = h.scheduler.submit(spec("render", 0), None).await.unwrap();
    assert_eq!(job.state, JobState::Queued);

    let claimed = h
        .scheduler
        .claim("w1", Target::Local, vec![])
        .await
        .unwrap()
        .expect("job available");
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
    assert_eq!(claimed.attempts, 1);

    h.scheduler.start(&job.id, "w1").await.unwrap();
    let done = h
        .scheduler
        .complete(&job.id, BTreeMap::from([("ok".to_string(), serde_json::json!(true))]))
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Complete);
    assert_eq!(done.result.unwrap()["ok"], serde_json::json!(true));

    // Hook stream shows the full lifecycle in seq order.
    let transitions: Vec<(String, String)> = h
        .bus
        .history(&HistoryFilter {
            event: Some("on_job_state_changed".into()),
            ..Default::default()
        })
        .iter()
        .map(|e| {
            (
                e.payload["from"].as_str().unwrap().to_string(),
                e.payload["to"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            ("pending_admission".to_string(), "queued".to_string()),
            ("queued".to_string(), "claimed".to_string()),
            ("claimed".to_string(), "running".to_string()),
            ("running".to_string(), "complete".to_string()),
        ]
    );
}

#[tokio::test]
async fn high_priority_preempts_claimed_job() {
    let h = harness_with(BudgetConfig {
        concurrent_local_max: 1,
        ..Default::default()
    });

    let j1 = h.scheduler.submit(spec("render", 0), None).await.unwrap();
    let j2 = h.scheduler.submit(spec("render", 0), None).await.unwrap();

    // w1 claims J1 but does not start it; J2 stays queued.
    let claimed = h.scheduler.claim("w1", Target::Local, vec![]).await.unwrap().unwrap();
    assert_eq!(claimed.id, j1.id);
    assert_eq!(h.scheduler.state(&j2.id).await.unwrap().state, JobState::Queued);

    // A high-priority arrival bumps J1 back into the queue.
    let j3 = h.scheduler.submit(spec("render", 10), None).await.unwrap();
    let j1_after = h.scheduler.state(&j1.id).await.unwrap();
    assert_eq!(j1_after.state, JobState::Queued);
    assert!(j1_after.trace.iter().any(|t| {
        t.note.as_deref().is_some_and(|n| n.contains("preempted"))
    }));

    // Claim order is now J3, J1, J2.
    for expected in [&j3.id, &j1.id, &j2.id] {
        let job = h.scheduler.claim("w1", Target::Local, vec![]).await.unwrap().unwrap();
        assert_eq!(&job.id, expected);
        h.scheduler.start(&job.id, "w1").await.unwrap();
        h.scheduler.complete(&job.id, BTreeMap::new()).await.unwrap();
    }
}

#[tokio::test]
async fn priority_tie_breaks_fifo() {
    let h = harness();
    let first = h.scheduler.submit(spec("render", 5), None).await.unwrap();
    let second = h.scheduler.submit(spec("render", 5), None).await.unwrap();

    let a = h.scheduler.claim("w1", Target::Local, vec![]).await.unwrap().unwrap();
    assert_eq!(a.id, first.id);
    let b = h.scheduler.claim("w2", Target::Local, vec![]).await.unwrap().unwrap();
    assert_eq!(b.id, second.id);
}

#[tokio::test]
async fn running_jobs_never_preempted() {
    let h = harness_with(BudgetConfig {
        concurrent_local_max: 1,
        ..Default::default()
    });
    let j1 = h.scheduler.submit(spec("render", 0), None).await.unwrap();
    h.scheduler.claim("w1", Target::Local, vec![]).await.unwrap().unwrap();
    h.scheduler.start(&j1.id, "w1").await.unwrap();

    h.scheduler.submit(spec("render", 10), None).await.unwrap();
    assert_eq!(h.scheduler.state(&j1.id).await.unwrap().state, JobState::Running);
}

#[tokio::test]
async fn failure_retries_until_attempts_exhausted() {
    let h = harness();
    let job = h.scheduler.submit(spec("render", 0), None).await.unwrap();

    for attempt in 1..=3u32 {
        // Backoff is 10ms in tests; poll until the retry re-queues.
        let mut claimed = None;
        for _ in 0..100 {
            claimed = h.scheduler.claim("w1", Target::Local, vec![]).await.unwrap();
            if claimed.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let claimed = claimed.expect("job should requeue");
        assert_eq!(claimed.attempts, attempt);
        h.scheduler.start(&job.id, "w1").await.unwrap();
        h.scheduler.fail(&job.id, "worker exploded").await.unwrap();
    }

    let terminal = h.scheduler.state(&job.id).await.unwrap();
    assert_eq!(terminal.state, JobState::Failed);
    assert!(terminal.last_error.unwrap().contains("exploded"));

    // No fourth attempt.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.scheduler.claim("w1", Target::Local, vec![]).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_queued_is_immediate() {
    let h = harness();
    let job = h.scheduler.submit(spec("render", 0), None).await.unwrap();
    let cancelled = h.scheduler.cancel(&job.id).await.unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert!(h.scheduler.claim("w1", Target::Local, vec![]).await.unwrap().is_none());

    // Terminal records reject further cancels.
    let err = h.scheduler.cancel(&job.id).await.unwrap_err();
    assert_eq!(err.kind, cvn_error::ErrorKind::Conflict);
}

#[tokio::test]
async fn cooperative_cancel_clamps_worker_report() {
    let h = harness();
    let job = h.scheduler.submit(spec("render", 0), None).await.unwrap();
    h.scheduler.claim("w1", Target::Local, vec![]).await.unwrap().unwrap();
    h.scheduler.start(&job.id, "w1").await.unwrap();

    let pending = h.scheduler.cancel(&job.id).await.unwrap();
    assert_eq!(pending.state, JobState::Running);
    assert!(pending.cancel_pending);

    // The worker finishes; the record clamps to cancelled.
    let clamped = h.scheduler.complete(&job.id, BTreeMap::new()).await.unwrap();
    assert_eq!(clamped.state, JobState::Cancelled);
}

#[tokio::test]
async fn unresponsive_cancel_escalates_after_grace() {
    let h = harness();
    let job = h.scheduler.submit(spec("render", 0), None).await.unwrap();
    h.scheduler.claim("w1", Target::Local, vec![]).await.unwrap().unwrap();
    h.scheduler.start(&job.id, "w1").await.unwrap();
    h.scheduler.cancel(&job.id).await.unwrap();

    // Grace is 100ms in tests.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let record = h.scheduler.state(&job.id).await.unwrap();
    assert_eq!(record.state, JobState::Cancelled);
    assert!(record.trace.iter().any(|t| {
        t.note.as_deref() == Some("cancelled_timeout")
    }));
}

#[tokio::test]
async fn budget_pressure_delays_then_promotes() {
    let h = harness_with(BudgetConfig {
        cpu_pct_max: 100,
        ..Default::default()
    });

    let mut hungry = spec("render", 0);
    hungry.cost_hint.cpu_pct = 100;
    let j1 = h.scheduler.submit(hungry.clone(), None).await.unwrap();
    assert_eq!(j1.state, JobState::Queued);

    let j2 = h.scheduler.submit(hungry, None).await.unwrap();
    assert_eq!(j2.state, JobState::Delayed);

    // Finish J1; J2 should be promoted by the post-completion refresh.
    h.scheduler.claim("w1", Target::Local, vec![]).await.unwrap().unwrap();
    h.scheduler.start(&j1.id, "w1").await.unwrap();
    h.scheduler.complete(&j1.id, BTreeMap::new()).await.unwrap();

    let promoted = h.scheduler.state(&j2.id).await.unwrap();
    assert_eq!(promoted.state, JobState::Queued);
}

#[tokio::test]
async fn policy_block_rejects_submission_without_record() {
    struct BlockAll;
    impl Scanner for BlockAll {
        fn id(&self) -> &str {
            "blocker"
        }
        fn run(&self, ctx: &ScanContext) -> Vec<Finding> {
            vec![Finding::block("blocker", "forbidden.kind", "nope")
                .with_target(ctx.payload["kind"].as_str().unwrap_or("").to_string())]
        }
    }

    let h = harness();
    h.enforcer.register_scanner(Arc::new(BlockAll));

    let err = h.scheduler.submit(spec("render", 0), None).await.unwrap_err();
    assert_eq!(err.kind, cvn_error::ErrorKind::PolicyBlocked);
    let findings = &err.details.unwrap()["findings"];
    assert_eq!(findings[0]["code"], "forbidden.kind");

    // No job record was created.
    let board = h.scheduler.board(None).await.unwrap();
    assert!(board.jobs.is_empty());

    // The enforcement hook carries the same finding.
    let enforced = h.bus.history(&HistoryFilter {
        event: Some("on_policy_enforced".into()),
        ..Default::default()
    });
    assert_eq!(enforced.len(), 1);
    assert_eq!(enforced[0].payload["findings"][0]["code"], "forbidden.kind");
}

#[tokio::test]
async fn compute_kinds_gated_by_umbrella_flag() {
    let tmp = tempfile::tempdir().unwrap();
    let bus = EventBus::in_memory();
    let flags = FlagStore::open(tmp.path().join("flags.json")).unwrap();
    flags.set("enable_compute", false.into()).unwrap();
    let scheduler = Scheduler::spawn(
        fast_config(),
        tmp.path().join("jobs.db"),
        BudgetManager::new(BudgetConfig::default(), bus.clone()),
        Enforcer::new(bus.clone()),
        flags,
        ProviderRegistry::with_local_defaults(),
        bus,
    )
    .unwrap();

    let err = scheduler.submit(spec("render", 0), None).await.unwrap_err();
    assert_eq!(err.kind, cvn_error::ErrorKind::FeatureDisabled);
    assert!(err.message.contains("enable_compute"));

    // Non-compute kinds still pass.
    assert!(scheduler.submit(spec("import", 0), None).await.is_ok());
}

#[tokio::test]
async fn claim_respects_capabilities_and_concurrency_cap() {
    let h = harness_with(BudgetConfig {
        concurrent_local_max: 1,
        ..Default::default()
    });
    let render = h.scheduler.submit(spec("render", 0), None).await.unwrap();
    let tts = h.scheduler.submit(spec("tts", 0), None).await.unwrap();

    // A tts-only worker skips the earlier render job.
    let claimed = h
        .scheduler
        .claim("w-tts", Target::Local, vec!["tts".into()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, tts.id);

    // Cap is 1: nobody else can claim until the slot frees.
    assert!(h.scheduler.claim("w2", Target::Local, vec![]).await.unwrap().is_none());
    h.scheduler.start(&tts.id, "w-tts").await.unwrap();
    h.scheduler.complete(&tts.id, BTreeMap::new()).await.unwrap();

    let next = h.scheduler.claim("w2", Target::Local, vec![]).await.unwrap().unwrap();
    assert_eq!(next.id, render.id);
}

#[tokio::test]
async fn sticky_key_prefers_previous_worker() {
    let h = harness();
    let mut sticky = spec("render", 0);
    sticky.sticky_key = Some("scene-12".into());

    // First run establishes the affinity.
    let j1 = h.scheduler.submit(sticky.clone(), None).await.unwrap();
    h.scheduler.claim("w-gpu", Target::Local, vec![]).await.unwrap().unwrap();
    h.scheduler.start(&j1.id, "w-gpu").await.unwrap();
    h.scheduler.complete(&j1.id, BTreeMap::new()).await.unwrap();

    // An unrelated job is older in the queue, but the sticky job wins for
    // the worker that ran the key before.
    let plain = h.scheduler.submit(spec("render", 0), None).await.unwrap();
    let j2 = h.scheduler.submit(sticky, None).await.unwrap();
    let claimed = h.scheduler.claim("w-gpu", Target::Local, vec![]).await.unwrap().unwrap();
    assert_eq!(claimed.id, j2.id);

    // Other workers still honor queue order.
    let other = h.scheduler.claim("w-other", Target::Local, vec![]).await.unwrap().unwrap();
    assert_eq!(other.id, plain.id);
}

#[tokio::test]
async fn board_and_health_reflect_state() {
    let h = harness();
    h.scheduler.submit(spec("render", 0), None).await.unwrap();
    h.scheduler.submit(spec("tts", 1), None).await.unwrap();

    let board = h.scheduler.board(Some(Target::Local)).await.unwrap();
    assert_eq!(board.jobs.len(), 2);
    assert_eq!(board.queued_local, 2);
    // Priority 1 sorts ahead of priority 0.
    assert_eq!(board.jobs[0].spec.kind, "tts");

    let health = h.scheduler.health().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.queued_local, 2);
    assert_eq!(health.total_jobs, 2);
}

#[tokio::test]
async fn state_of_unknown_job_is_not_found() {
    let h = harness();
    let err = h.scheduler.state(&JobId::new()).await.unwrap_err();
    assert_eq!(err.kind, cvn_error::ErrorKind::NotFound);
}

#[tokio::test]
async fn start_by_wrong_worker_conflicts() {
    let h = harness();
    let job = h.scheduler.submit(spec("render", 0), None).await.unwrap();
    h.scheduler.claim("w1", Target::Local, vec![]).await.unwrap().unwrap();
    let err = h.scheduler.start(&job.id, "w2").await.unwrap_err();
    assert_eq!(err.kind, cvn_error::ErrorKind::Conflict);
}

#[tokio::test]
async fn preview_cost_is_deterministic() {
    let h = harness();
    let mut s = spec("render", 0);
    s.cost_hint.vram_mb = 2048;
    s.cost_hint.input_bytes = 5_000_000;
    let a = h.scheduler.preview_cost(s.clone()).await.unwrap();
    let b = h.scheduler.preview_cost(s).await.unwrap();
    assert_eq!(a, b);
    assert!(!a.rationale.is_empty());
}

#[tokio::test]
async fn job_state_hooks_observed_in_seq_order_per_subscriber() {
    let h = harness();
    let rx = h.bus.subscribe(TopicFilter::new(["on_job_state_changed"]), 64);

    let job = h.scheduler.submit(spec("render", 0), None).await.unwrap();
    h.scheduler.claim("w1", Target::Local, vec![]).await.unwrap().unwrap();
    h.scheduler.start(&job.id, "w1").await.unwrap();
    h.scheduler.complete(&job.id, BTreeMap::new()).await.unwrap();

    let mut prev_seq = 0;
    for _ in 0..4 {
        let env = rx.recv().await.unwrap();
        assert!(env.seq > prev_seq);
        prev_seq = env.seq;
    }
}
