// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios over the composed control plane.

use cvn_budget::{BudgetConfig, BudgetManager};
use cvn_config::StudioConfig;
use cvn_core::{JobSpec, JobState, Target};
use cvn_daemon::{build_app, build_state};
use cvn_events::{EventBus, HistoryFilter, TopicFilter};
use cvn_flags::FlagStore;
use cvn_policy::Enforcer;
use cvn_providers::ProviderRegistry;
use cvn_scheduler::{Scheduler, SchedulerConfig};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn spec(kind: &str, priority: i32) -> JobSpec {
    serde_json::from_value(json!({"kind": kind, "priority": priority, "target": "local"})).unwrap()
}

fn scheduler_fixture(
    tmp: &tempfile::TempDir,
    budget: BudgetConfig,
) -> (Scheduler, EventBus) {
    let bus = EventBus::in_memory();
    let flags = FlagStore::open(tmp.path().join("flags.json")).unwrap();
    let scheduler = Scheduler::spawn(
        SchedulerConfig {
            retry_backoff: Duration::from_millis(10),
            refresh_interval: Duration::from_millis(50),
            ..Default::default()
        },
        tmp.path().join("jobs.db"),
        BudgetManager::new(budget, bus.clone()),
        Enforcer::new(bus.clone()),
        flags,
        ProviderRegistry::with_local_defaults(),
        bus.clone(),
    )
    .unwrap();
    (scheduler, bus)
}

// S1 — linear submit → complete, hooks in order.
#[tokio::test]
async fn s1_linear_submit_to_complete() {
    let tmp = tempfile::tempdir().unwrap();
    let (scheduler, bus) = scheduler_fixture(&tmp, BudgetConfig::default());

    let job = scheduler.submit(spec("render", 0), None).await.unwrap();
    let claimed = scheduler.claim("w1", Target::Local, vec![]).await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    scheduler.start(&job.id, "w1").await.unwrap();
    scheduler
        .complete(&job.id, BTreeMap::from([("ok".to_string(), json!(true))]))
        .await
        .unwrap();

    assert_eq!(scheduler.state(&job.id).await.unwrap().state, JobState::Complete);

    let transitions: Vec<String> = bus
        .history(&HistoryFilter {
            event: Some("on_job_state_changed".into()),
            ..Default::default()
        })
        .iter()
        .map(|e| {
            format!(
                "{}->{}",
                e.payload["from"].as_str().unwrap(),
                e.payload["to"].as_str().unwrap()
            )
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            "pending_admission->queued",
            "queued->claimed",
            "claimed->running",
            "running->complete",
        ]
    );
}

// S2 — priority preempts a claimed-but-not-started job.
#[tokio::test]
async fn s2_priority_preempts_claim() {
    let tmp = tempfile::tempdir().unwrap();
    let (scheduler, _bus) = scheduler_fixture(
        &tmp,
        BudgetConfig {
            concurrent_local_max: 1,
            ..Default::default()
        },
    );

    let j1 = scheduler.submit(spec("render", 0), None).await.unwrap();
    let j2 = scheduler.submit(spec("render", 0), None).await.unwrap();
    let claimed = scheduler.claim("w1", Target::Local, vec![]).await.unwrap().unwrap();
    assert_eq!(claimed.id, j1.id);

    let j3 = scheduler.submit(spec("render", 10), None).await.unwrap();
    assert_eq!(scheduler.state(&j1.id).await.unwrap().state, JobState::Queued);

    // Completion order starts with J3, then J1, then J2.
    let mut completed = Vec::new();
    while completed.len() < 3 {
        let job = scheduler.claim("w1", Target::Local, vec![]).await.unwrap().unwrap();
        scheduler.start(&job.id, "w1").await.unwrap();
        scheduler.complete(&job.id, BTreeMap::new()).await.unwrap();
        completed.push(job.id);
    }
    assert_eq!(completed, vec![j3.id, j1.id, j2.id]);
}

// S3 — policy block leaves no job behind (HTTP surface).
#[tokio::test]
async fn s3_policy_block_over_http() {
    let tmp = tempfile::tempdir().unwrap();
    let config = StudioConfig {
        root: tmp.path().to_path_buf(),
        ..Default::default()
    };
    let state = build_state(config).unwrap();

    struct BlockRenders;
    impl cvn_policy::Scanner for BlockRenders {
        fn id(&self) -> &str {
            "render-ban"
        }
        fn run(&self, ctx: &cvn_policy::ScanContext) -> Vec<cvn_core::Finding> {
            if ctx.payload["kind"] == json!("render") {
                vec![cvn_core::Finding::block("render-ban", "render.banned", "renders are off")
                    .with_target("render")]
            } else {
                vec![]
            }
        }
    }
    state.enforcer.register_scanner(Arc::new(BlockRenders));

    let app = build_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/api/schedule/submit"))
        .json(&json!({"kind": "render"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 423);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "policy_blocked");
    assert_eq!(body["error"]["details"]["findings"][0]["code"], "render.banned");

    // No job record was created.
    let board: serde_json::Value = client
        .get(format!("http://{addr}/api/schedule/board"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(board["jobs"].as_array().unwrap().is_empty());

    // The enforcement hook carries the finding.
    let enforced = state.bus.history(&HistoryFilter {
        event: Some("on_policy_enforced".into()),
        ..Default::default()
    });
    assert_eq!(enforced.len(), 1);
    assert_eq!(enforced[0].payload["allow"], json!(false));
}

// S4 — asset dedup with sidecars at both paths and two provenance rows.
#[test]
fn s4_asset_dedup_and_sidecars() {
    let tmp = tempfile::tempdir().unwrap();
    let media = tmp.path().join("media");
    std::fs::create_dir_all(&media).unwrap();
    let bus = EventBus::in_memory();
    let registry =
        cvn_assets::AssetRegistry::open(tmp.path().join("provenance.log"), bus).unwrap();

    let p1 = media.join("f1.bin");
    let p2 = media.join("f2.bin");
    std::fs::write(&p1, b"identical-bytes").unwrap();
    std::fs::write(&p2, b"identical-bytes").unwrap();

    let r1 = registry
        .register_file(&p1, cvn_core::AssetType::Other, BTreeMap::new(), BTreeMap::new())
        .unwrap();
    let r2 = registry
        .register_file(&p2, cvn_core::AssetType::Other, BTreeMap::new(), BTreeMap::new())
        .unwrap();

    assert_eq!(r1.uid, r2.uid);
    assert_eq!(registry.len(), 1);
    for p in [&p1, &p2] {
        let sc = cvn_assets::sidecar_path(&std::fs::canonicalize(p).unwrap());
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(sc).unwrap()).unwrap();
        assert_eq!(parsed["uid"], r1.uid);
    }
    let prov = std::fs::read_to_string(tmp.path().join("provenance.log")).unwrap();
    assert_eq!(prov.lines().count(), 2);
}

// S5 — deterministic playtest digests.
#[test]
fn s5_deterministic_playtest() {
    let tmp = tempfile::tempdir().unwrap();
    let bus = EventBus::in_memory();
    let flags = FlagStore::open(tmp.path().join("flags.json")).unwrap();
    let runner = cvn_scenario::ScenarioRunner::new(bus, flags);

    let request: cvn_scenario::RunRequest = serde_json::from_value(json!({
        "scene": {
            "id": "s",
            "nodes": [
                {"id": "a", "choices": [
                    {"id": "x", "label": "X", "goto": "b"},
                    {"id": "y", "label": "Y", "goto": "b"},
                ]},
                {"id": "b"},
            ],
        },
        "seed": 42,
        "pov": "A",
        "variables": {"x": 1},
    }))
    .unwrap();

    let a = runner.run(&request).unwrap();
    let b = runner.run(&request).unwrap();
    assert_eq!(a.digest, b.digest);
    let rngs_a: Vec<&str> = a.steps.iter().map(|s| s.rng_state_digest.as_str()).collect();
    let rngs_b: Vec<&str> = b.steps.iter().map(|s| s.rng_state_digest.as_str()).collect();
    assert_eq!(rngs_a, rngs_b);
}

// S6 — slow subscriber gets a __dropped marker; fast one sees everything.
#[tokio::test]
async fn s6_hook_backpressure() {
    let bus = EventBus::in_memory();
    let slow = bus.subscribe(TopicFilter::all(), 8);
    let fast = bus.subscribe(TopicFilter::all(), 1024);

    for i in 0..100 {
        let mut payload = BTreeMap::new();
        payload.insert("scene".to_string(), json!(format!("s{i}")));
        payload.insert("run".to_string(), json!("r"));
        bus.publish("on_scene_enter", "scenario", payload).unwrap();
    }

    let mut prev = 0;
    for _ in 0..100 {
        let env = fast.recv().await.unwrap();
        assert!(env.seq > prev);
        prev = env.seq;
    }

    let first = slow.recv().await.unwrap();
    assert_eq!(first.event, "__dropped");
    assert!(first.payload["count"].as_u64().unwrap() >= 92);
}

// Every job reaches exactly one terminal state under mixed outcomes.
#[tokio::test]
async fn jobs_reach_exactly_one_terminal_state() {
    let tmp = tempfile::tempdir().unwrap();
    let (scheduler, _bus) = scheduler_fixture(&tmp, BudgetConfig::default());

    let completes = scheduler.submit(spec("import", 0), None).await.unwrap();
    let cancels = scheduler.submit(spec("import", 0), None).await.unwrap();
    scheduler.cancel(&cancels.id).await.unwrap();

    let job = scheduler.claim("w1", Target::Local, vec![]).await.unwrap().unwrap();
    assert_eq!(job.id, completes.id);
    scheduler.start(&job.id, "w1").await.unwrap();
    scheduler.complete(&job.id, BTreeMap::new()).await.unwrap();

    for (id, expected) in [
        (completes.id, JobState::Complete),
        (cancels.id, JobState::Cancelled),
    ] {
        let record = scheduler.state(&id).await.unwrap();
        assert_eq!(record.state, expected);
        assert!(record.state.is_terminal());
        // Exactly one terminal entry closes the trace.
        let terminal_entries = record
            .trace
            .iter()
            .filter(|t| t.state.is_terminal() && t.state != JobState::Failed)
            .count();
        assert_eq!(terminal_entries, 1);
    }
}
