// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hook envelopes and the canonical modder-hook event catalog.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// HookEnvelope
// ---------------------------------------------------------------------------

/// The envelope wrapped around every event published on the bus.
///
/// `seq` is a strictly increasing per-process counter; `at` and `seq`
/// together totally order events. `hook_event` duplicates `event` for
/// compatibility with consumers that key on either field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HookEnvelope {
    /// Event name, e.g. `on_job_state_changed`.
    pub event: String,
    /// Same as `event`.
    pub hook_event: String,
    /// Wall-clock publish time.
    pub at: DateTime<Utc>,
    /// Strictly increasing per-process sequence number.
    pub seq: u64,
    /// Event payload; reserved keys are validated at the bus ingress,
    /// unknown keys pass through for forward compatibility.
    pub payload: BTreeMap<String, serde_json::Value>,
    /// Publishing component, e.g. `scheduler`, `assets`, `policy`.
    pub source: String,
}

impl HookEnvelope {
    /// Build an envelope; `seq` is assigned by the bus at publish time.
    pub fn new(
        event: impl Into<String>,
        source: impl Into<String>,
        payload: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let event = event.into();
        Self {
            hook_event: event.clone(),
            event,
            at: Utc::now(),
            seq: 0,
            payload,
            source: source.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Event catalog
// ---------------------------------------------------------------------------

/// Documentation entry for one hook event: payload keys and their types.
#[derive(Clone, Debug, Serialize, JsonSchema)]
pub struct HookEventDoc {
    /// Event name.
    pub event: &'static str,
    /// Emitting component.
    pub source: &'static str,
    /// `key: type` lines describing the payload schema.
    pub payload_keys: &'static [&'static str],
}

/// Canonical hook event names. Synthetic envelopes (`__dropped`, `__error`)
/// are not part of the catalog; they are delivery artifacts, not hooks.
pub fn known_hook_events() -> &'static [&'static str] {
    &[
        "on_scene_enter",
        "on_choice_render",
        "on_asset_registered",
        "on_asset_meta_updated",
        "on_asset_sidecar_written",
        "on_asset_removed",
        "on_job_state_changed",
        "on_policy_enforced",
        "on_collab_operation",
        "on_playtest_start",
        "on_playtest_step",
        "on_playtest_finished",
        "on_perf_budget_state",
        "on_flag_changed",
    ]
}

/// The documented payload schema for every canonical hook event.
pub fn hook_catalog() -> Vec<HookEventDoc> {
    vec![
        HookEventDoc {
            event: "on_scene_enter",
            source: "scenario",
            payload_keys: &["scene: string", "pov: string?", "run: string"],
        },
        HookEventDoc {
            event: "on_choice_render",
            source: "scenario",
            payload_keys: &["scene: string", "node: string", "choices: string[]"],
        },
        HookEventDoc {
            event: "on_asset_registered",
            source: "assets",
            payload_keys: &["uid: string", "type: string", "path: string", "size_bytes: u64"],
        },
        HookEventDoc {
            event: "on_asset_meta_updated",
            source: "assets",
            payload_keys: &["uid: string", "changed_keys: string[]"],
        },
        HookEventDoc {
            event: "on_asset_sidecar_written",
            source: "assets",
            payload_keys: &["uid: string", "sidecar_path: string"],
        },
        HookEventDoc {
            event: "on_asset_removed",
            source: "assets",
            payload_keys: &["uid: string", "path: string"],
        },
        HookEventDoc {
            event: "on_job_state_changed",
            source: "scheduler",
            payload_keys: &["id: string", "from: string", "to: string", "worker: string?"],
        },
        HookEventDoc {
            event: "on_policy_enforced",
            source: "policy",
            payload_keys: &["action: string", "allow: bool", "findings: object[]"],
        },
        HookEventDoc {
            event: "on_collab_operation",
            source: "collab",
            payload_keys: &["op: string", "actor: string", "target: string"],
        },
        HookEventDoc {
            event: "on_playtest_start",
            source: "scenario",
            payload_keys: &["run: string", "scene: string", "seed: u64", "pov: string?"],
        },
        HookEventDoc {
            event: "on_playtest_step",
            source: "scenario",
            payload_keys: &["run: string", "step: u64", "node: string", "digest: string"],
        },
        HookEventDoc {
            event: "on_playtest_finished",
            source: "scenario",
            payload_keys: &["run: string", "steps: u64", "digest: string"],
        },
        HookEventDoc {
            event: "on_perf_budget_state",
            source: "budget",
            payload_keys: &["delayed: u64", "active_local: u64", "active_remote: u64", "evictions: u64"],
        },
        HookEventDoc {
            event: "on_flag_changed",
            source: "flags",
            payload_keys: &["name: string", "value: any", "previous: any"],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_duplicates_event_name() {
        let env = HookEnvelope::new("on_scene_enter", "scenario", BTreeMap::new());
        assert_eq!(env.event, env.hook_event);
        assert_eq!(env.seq, 0);
    }

    #[test]
    fn catalog_covers_every_known_event() {
        let catalog = hook_catalog();
        for name in known_hook_events() {
            assert!(
                catalog.iter().any(|d| d.event == *name),
                "missing catalog entry for {name}"
            );
        }
        assert_eq!(catalog.len(), known_hook_events().len());
    }

    #[test]
    fn envelope_wire_shape() {
        let mut payload = BTreeMap::new();
        payload.insert("id".to_string(), serde_json::json!("J1"));
        let mut env = HookEnvelope::new("on_job_state_changed", "scheduler", payload);
        env.seq = 42;
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["event"], "on_job_state_changed");
        assert_eq!(v["hook_event"], "on_job_state_changed");
        assert_eq!(v["seq"], 42);
        assert_eq!(v["source"], "scheduler");
        assert_eq!(v["payload"]["id"], "J1");
    }
}
