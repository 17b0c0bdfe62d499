// SPDX-License-Identifier: MIT OR Apache-2.0
//! Determinism and POV behavior.

use super::*;
use cvn_events::HistoryFilter;

fn runner() -> (ScenarioRunner, EventBus, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let bus = EventBus::in_memory();
    let flags = FlagStore::open(tmp.path().join("flags.json")).unwrap();
    (ScenarioRunner::new(bus.clone(), flags), bus, tmp)
}

fn branching_scene() -> Scene {
    Scene {
        id: "s".into(),
        nodes: vec![
            SceneNode {
                id: "start".into(),
                text: Some("Dawn over the harbor.".into()),
                set: BTreeMap::from([("x".to_string(), json!(1))]),
                choices: vec![
                    Choice {
                        id: "left".into(),
                        label: "Take the pier".into(),
                        requires_pov: None,
                        goto: Some("pier".into()),
                    },
                    Choice {
                        id: "right".into(),
                        label: "Climb the cliff".into(),
                        requires_pov: Some(vec!["A".into()]),
                        goto: Some("cliff".into()),
                    },
                ],
                next: None,
                duration: Some(2.0),
            },
            SceneNode {
                id: "pier".into(),
                text: None,
                set: BTreeMap::new(),
                choices: vec![],
                next: Some("end".into()),
                duration: None,
            },
            SceneNode {
                id: "cliff".into(),
                text: None,
                set: BTreeMap::new(),
                choices: vec![],
                next: Some("end".into()),
                duration: None,
            },
            SceneNode {
                id: "end".into(),
                text: None,
                set: BTreeMap::new(),
                choices: vec![],
                next: None,
                duration: None,
            },
        ],
    }
}

fn request(seed: u64, pov: Option<&str>) -> RunRequest {
    RunRequest {
        scene: branching_scene(),
        seed,
        pov: pov.map(str::to_string),
        variables: BTreeMap::from([("x".to_string(), json!(0))]),
        workflow: None,
    }
}

#[test]
fn identical_inputs_give_identical_digests() {
    let (runner, _, _tmp) = runner();
    let a = runner.run(&request(42, Some("A"))).unwrap();
    let b = runner.run(&request(42, Some("A"))).unwrap();
    assert_eq!(a.digest, b.digest);
    assert_eq!(a.run_id, b.run_id);
    let rng_a: Vec<&str> = a.steps.iter().map(|s| s.rng_state_digest.as_str()).collect();
    let rng_b: Vec<&str> = b.steps.iter().map(|s| s.rng_state_digest.as_str()).collect();
    assert_eq!(rng_a, rng_b);
}

#[test]
fn seed_changes_digest() {
    let (runner, _, _tmp) = runner();
    let a = runner.run(&request(42, Some("A"))).unwrap();
    let b = runner.run(&request(43, Some("A"))).unwrap();
    assert_ne!(a.digest, b.digest);
}

#[test]
fn pov_filter_hides_restricted_choices() {
    let (runner, _, _tmp) = runner();
    // POV B never sees the cliff choice.
    let b = runner.run(&request(42, Some("B"))).unwrap();
    assert_eq!(b.steps[0].visible_choices, vec!["left".to_string()]);
    assert_eq!(b.steps[0].chosen.as_deref(), Some("left"));
    assert_eq!(b.steps[1].node_id, "pier");

    // POV A sees both.
    let a = runner.run(&request(42, Some("A"))).unwrap();
    assert_eq!(a.steps[0].visible_choices.len(), 2);

    // No active POV hides gated choices entirely.
    let none = runner.run(&request(42, None)).unwrap();
    assert_eq!(none.steps[0].visible_choices, vec!["left".to_string()]);
}

#[test]
fn variables_flow_into_digests() {
    let (runner, _, _tmp) = runner();
    let mut req = request(42, Some("A"));
    let base = runner.run(&req).unwrap();
    req.variables.insert("y".to_string(), json!(9));
    let tweaked = runner.run(&req).unwrap();
    assert_ne!(base.digest, tweaked.digest);
    // `set` on the start node lands in the variable digest.
    assert_ne!(
        base.steps[0].variables_digest,
        canonical_sha256(&BTreeMap::from([("x".to_string(), json!(0))])).unwrap()
    );
}

#[test]
fn empty_scene_has_stable_zero_step_digest() {
    let (runner, _, _tmp) = runner();
    let req = RunRequest {
        scene: Scene {
            id: "empty".into(),
            nodes: vec![],
        },
        seed: 7,
        pov: None,
        variables: BTreeMap::new(),
        workflow: None,
    };
    let a = runner.run(&req).unwrap();
    let b = runner.run(&req).unwrap();
    assert!(a.steps.is_empty());
    assert_eq!(a.digest, b.digest);
    // SHA-256 of the empty concatenation.
    assert_eq!(
        a.digest,
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

#[test]
fn sim_time_accumulates_node_durations() {
    let (runner, _, _tmp) = runner();
    let trace = runner.run(&request(42, Some("B"))).unwrap();
    assert_eq!(trace.steps[0].at_sim_time, 0.0);
    // Start node lasts 2.0 simulated seconds.
    assert_eq!(trace.steps[1].at_sim_time, 2.0);
    assert_eq!(trace.steps[2].at_sim_time, 3.0);
}

#[test]
fn playtest_hooks_cover_the_run() {
    let (runner, bus, _tmp) = runner();
    let trace = runner.run(&request(42, Some("A"))).unwrap();

    let starts = bus.history(&HistoryFilter {
        event: Some("on_playtest_start".into()),
        ..Default::default()
    });
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].payload["pov"], json!("A"));

    let steps = bus.history(&HistoryFilter {
        event: Some("on_playtest_step".into()),
        ..Default::default()
    });
    assert_eq!(steps.len(), trace.steps.len());

    let finished = bus.history(&HistoryFilter {
        event: Some("on_playtest_finished".into()),
        ..Default::default()
    });
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].payload["digest"], json!(trace.digest));

    let renders = bus.history(&HistoryFilter {
        event: Some("on_choice_render".into()),
        ..Default::default()
    });
    assert_eq!(renders.len(), 1);
}

#[test]
fn unknown_goto_is_an_error() {
    let (runner, _, _tmp) = runner();
    let req = RunRequest {
        scene: Scene {
            id: "broken".into(),
            nodes: vec![SceneNode {
                id: "start".into(),
                text: None,
                set: BTreeMap::new(),
                choices: vec![],
                next: Some("nowhere".into()),
                duration: None,
            }],
        },
        seed: 1,
        pov: None,
        variables: BTreeMap::new(),
        workflow: None,
    };
    assert!(matches!(
        runner.run(&req),
        Err(ScenarioError::UnknownNode(n)) if n == "nowhere"
    ));
}

#[test]
fn cyclic_scene_hits_step_limit() {
    let (runner, _, _tmp) = runner();
    let req = RunRequest {
        scene: Scene {
            id: "loop".into(),
            nodes: vec![SceneNode {
                id: "a".into(),
                text: None,
                set: BTreeMap::new(),
                choices: vec![],
                next: Some("a".into()),
                duration: None,
            }],
        },
        seed: 1,
        pov: None,
        variables: BTreeMap::new(),
        workflow: None,
    };
    assert!(matches!(runner.run(&req), Err(ScenarioError::StepLimit)));
}

#[test]
fn worldline_overlay_needs_both_flags() {
    let tmp = tempfile::tempdir().unwrap();
    let bus = EventBus::in_memory();
    let flags = FlagStore::open(tmp.path().join("flags.json")).unwrap();
    let runner = ScenarioRunner::new(bus, flags.clone());

    // Overlay alone is inert without the worldline store.
    flags.set("enable_worldline_overlay", true.into()).unwrap();
    assert!(!runner.run(&request(1, None)).unwrap().worldline_overlay);

    flags.set("enable_worldlines", true.into()).unwrap();
    assert!(runner.run(&request(1, None)).unwrap().worldline_overlay);
}
