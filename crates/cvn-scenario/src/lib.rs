// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic scenario runner.
//!
//! Given `{scene, seed, pov, variables, workflow}` the runner walks the
//! scene graph with a splittable seeded RNG (ChaCha8, one stream per step),
//! filters choices through the POV visibility rule, and produces a trace
//! whose per-step digests roll up into one run digest. Identical inputs
//! give a bit-identical digest on every OS and build.

#![deny(unsafe_code)]

use cvn_core::canonical_sha256;
use cvn_events::EventBus;
use cvn_flags::FlagStore;
use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

/// Hard cap on steps per run; cyclic graphs terminate with an error.
pub const STEP_LIMIT: u64 = 10_000;

// ---------------------------------------------------------------------------
// Scene model
// ---------------------------------------------------------------------------

/// A choice offered on a node.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct Choice {
    /// Stable choice id.
    pub id: String,
    /// Display label.
    pub label: String,
    /// POVs that may see this choice; `None` means everyone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_pov: Option<Vec<String>>,
    /// Node to jump to when taken; fall through to `next` otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,
}

/// One node in a scene graph.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct SceneNode {
    /// Stable node id.
    pub id: String,
    /// Narration or dialogue text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Variable assignments applied on entry.
    #[serde(default)]
    pub set: BTreeMap<String, serde_json::Value>,
    /// Choices offered here.
    #[serde(default)]
    pub choices: Vec<Choice>,
    /// Fallthrough node when no choice is taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Simulated seconds spent on this node (default 1.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// A scene graph; execution starts at the first node.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct Scene {
    /// Scene id.
    pub id: String,
    /// Nodes, entry-first.
    #[serde(default)]
    pub nodes: Vec<SceneNode>,
}

/// A playtest request.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct RunRequest {
    /// The scene to walk.
    pub scene: Scene,
    /// Master seed.
    pub seed: u64,
    /// Active point of view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pov: Option<String>,
    /// Initial variables.
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Workflow tag recorded into the trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
}

// ---------------------------------------------------------------------------
// Trace
// ---------------------------------------------------------------------------

/// One step of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepTrace {
    /// Zero-based step index.
    pub step_id: u64,
    /// Node visited.
    pub node_id: String,
    /// Digest of this step's RNG stream state.
    pub rng_state_digest: String,
    /// Digest of the variable map at this step.
    pub variables_digest: String,
    /// Choice ids visible after the POV filter.
    pub visible_choices: Vec<String>,
    /// Choice taken, when any were visible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen: Option<String>,
    /// Simulated time entering this step.
    pub at_sim_time: f64,
}

/// A finished run.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct RunTrace {
    /// Deterministic run id (digest of the request).
    pub run_id: String,
    /// Scene walked.
    pub scene: String,
    /// Master seed.
    pub seed: u64,
    /// Active POV.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pov: Option<String>,
    /// Workflow tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// Per-step traces.
    pub steps: Vec<StepTrace>,
    /// Hash over the concatenated per-step digests.
    pub digest: String,
    /// Set when worldline overlay annotations are enabled.
    #[serde(default)]
    pub worldline_overlay: bool,
}

/// Errors from a run.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    /// A `goto`/`next` referenced a node that does not exist.
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    /// The walk exceeded [`STEP_LIMIT`] steps.
    #[error("step limit of {STEP_LIMIT} exceeded (cyclic scene?)")]
    StepLimit,
    /// Digest computation failed.
    #[error("digest: {0}")]
    Digest(#[from] cvn_core::CanonicalError),
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// The scenario runner used by the playtest harness and branching runtime.
#[derive(Clone)]
pub struct ScenarioRunner {
    bus: EventBus,
    flags: FlagStore,
}

impl ScenarioRunner {
    /// Build a runner publishing playtest hooks on `bus`.
    pub fn new(bus: EventBus, flags: FlagStore) -> Self {
        Self { bus, flags }
    }

    /// Execute a run to completion.
    pub fn run(&self, request: &RunRequest) -> Result<RunTrace, ScenarioError> {
        let run_id = run_id(request)?;
        let scene = &request.scene;

        self.publish(
            "on_playtest_start",
            &[
                ("run", json!(run_id)),
                ("scene", json!(scene.id)),
                ("seed", json!(request.seed)),
            ],
            request.pov.as_deref(),
        );
        self.publish(
            "on_scene_enter",
            &[("scene", json!(scene.id)), ("run", json!(run_id))],
            request.pov.as_deref(),
        );

        let mut variables = request.variables.clone();
        let mut steps: Vec<StepTrace> = Vec::new();
        let mut digest_concat = String::new();
        let mut sim_time = 0.0f64;

        let mut cursor = scene.nodes.first().map(|n| n.id.clone());
        while let Some(node_id) = cursor {
            let step_id = steps.len() as u64;
            if step_id >= STEP_LIMIT {
                return Err(ScenarioError::StepLimit);
            }
            let node = scene
                .nodes
                .iter()
                .find(|n| n.id == node_id)
                .ok_or_else(|| ScenarioError::UnknownNode(node_id.clone()))?;

            for (k, v) in &node.set {
                variables.insert(k.clone(), v.clone());
            }

            // One deterministic RNG stream per step, split off the master
            // seed; sub-steps draw from their own stream without disturbing
            // any other step's sequence.
            let mut rng = ChaCha8Rng::seed_from_u64(request.seed);
            rng.set_stream(step_id);
            let draw = rng.next_u64();
            let rng_state_digest =
                canonical_sha256(&json!({"seed": request.seed, "stream": step_id, "draw": draw}))?;
            let variables_digest = canonical_sha256(&variables)?;

            let visible: Vec<&Choice> = node
                .choices
                .iter()
                .filter(|c| pov_visible(c, request.pov.as_deref()))
                .collect();
            let visible_ids: Vec<String> = visible.iter().map(|c| c.id.clone()).collect();

            if !visible.is_empty() {
                self.publish(
                    "on_choice_render",
                    &[
                        ("scene", json!(scene.id)),
                        ("node", json!(node.id)),
                        ("choices", json!(visible_ids)),
                    ],
                    request.pov.as_deref(),
                );
            }

            let chosen = if visible.is_empty() {
                None
            } else {
                let index = (draw % visible.len() as u64) as usize;
                Some(visible[index].clone())
            };

            let step = StepTrace {
                step_id,
                node_id: node.id.clone(),
                rng_state_digest,
                variables_digest,
                visible_choices: visible_ids,
                chosen: chosen.as_ref().map(|c| c.id.clone()),
                at_sim_time: sim_time,
            };
            let step_digest = canonical_sha256(&json!({
                "node": step.node_id,
                "rng": step.rng_state_digest,
                "vars": step.variables_digest,
                "chosen": step.chosen,
            }))?;
            digest_concat.push_str(&step_digest);

            self.publish(
                "on_playtest_step",
                &[
                    ("run", json!(run_id)),
                    ("step", json!(step.step_id)),
                    ("node", json!(step.node_id)),
                    ("digest", json!(step_digest)),
                ],
                request.pov.as_deref(),
            );

            sim_time += node.duration.unwrap_or(1.0);
            steps.push(step);

            cursor = match chosen {
                Some(choice) => choice.goto.clone().or_else(|| node.next.clone()),
                None => node.next.clone(),
            };
        }

        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(digest_concat.as_bytes());
            format!("{:x}", hasher.finalize())
        };

        let worldline_overlay = self.flags.is_enabled("enable_worldlines")
            && self.flags.is_enabled("enable_worldline_overlay");

        self.publish(
            "on_playtest_finished",
            &[
                ("run", json!(run_id)),
                ("steps", json!(steps.len() as u64)),
                ("digest", json!(digest)),
            ],
            request.pov.as_deref(),
        );
        debug!(run = %run_id, steps = steps.len(), %digest, "playtest finished");

        Ok(RunTrace {
            run_id,
            scene: scene.id.clone(),
            seed: request.seed,
            pov: request.pov.clone(),
            workflow: request.workflow.clone(),
            steps,
            digest,
            worldline_overlay,
        })
    }

    fn publish(&self, event: &str, pairs: &[(&str, serde_json::Value)], pov: Option<&str>) {
        let mut payload: BTreeMap<String, serde_json::Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        if let Some(p) = pov {
            payload.insert("pov".to_string(), json!(p));
        }
        if let Err(e) = self.bus.publish(event, "scenario", payload) {
            debug!(event, error = %e, "playtest hook publish failed");
        }
    }
}

/// Deterministic run id: digest of the identifying request fields.
fn run_id(request: &RunRequest) -> Result<String, ScenarioError> {
    let digest = canonical_sha256(&json!({
        "scene": request.scene.id,
        "seed": request.seed,
        "pov": request.pov,
        "variables": request.variables,
        "workflow": request.workflow,
    }))?;
    Ok(digest[..16].to_string())
}

/// The POV visibility rule: a choice with `requires_pov` is visible only to
/// a listed POV; with no active POV such choices are hidden.
fn pov_visible(choice: &Choice, pov: Option<&str>) -> bool {
    match (&choice.requires_pov, pov) {
        (None, _) => true,
        (Some(allowed), Some(active)) => allowed.iter().any(|p| p == active),
        (Some(_), None) => false,
    }
}

#[cfg(test)]
mod tests;
