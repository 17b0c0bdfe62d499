// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ingress validation of reserved payload keys.
//!
//! Events in the catalog have required keys with fixed JSON types; unknown
//! extra keys pass through untouched for forward compatibility. Events not
//! in the catalog are accepted as-is.

use serde_json::Value;
use std::collections::BTreeMap;

/// Expected JSON type of a reserved key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum KeyType {
    Str,
    Bool,
    Uint,
    Array,
}

impl KeyType {
    fn accepts(&self, v: &Value) -> bool {
        match self {
            Self::Str => v.is_string(),
            Self::Bool => v.is_boolean(),
            Self::Uint => v.is_u64(),
            Self::Array => v.is_array(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Bool => "bool",
            Self::Uint => "unsigned integer",
            Self::Array => "array",
        }
    }
}

/// Required keys per cataloged event. Optional keys are not listed; they
/// are only checked for type when present.
fn required_keys(event: &str) -> &'static [(&'static str, KeyType)] {
    match event {
        "on_scene_enter" => &[("scene", KeyType::Str), ("run", KeyType::Str)],
        "on_choice_render" => &[
            ("scene", KeyType::Str),
            ("node", KeyType::Str),
            ("choices", KeyType::Array),
        ],
        "on_asset_registered" => &[
            ("uid", KeyType::Str),
            ("type", KeyType::Str),
            ("path", KeyType::Str),
            ("size_bytes", KeyType::Uint),
        ],
        "on_asset_meta_updated" => &[("uid", KeyType::Str), ("changed_keys", KeyType::Array)],
        "on_asset_sidecar_written" => &[("uid", KeyType::Str), ("sidecar_path", KeyType::Str)],
        "on_asset_removed" => &[("uid", KeyType::Str), ("path", KeyType::Str)],
        "on_job_state_changed" => &[
            ("id", KeyType::Str),
            ("from", KeyType::Str),
            ("to", KeyType::Str),
        ],
        "on_policy_enforced" => &[
            ("action", KeyType::Str),
            ("allow", KeyType::Bool),
            ("findings", KeyType::Array),
        ],
        "on_collab_operation" => &[
            ("op", KeyType::Str),
            ("actor", KeyType::Str),
            ("target", KeyType::Str),
        ],
        "on_playtest_start" => &[
            ("run", KeyType::Str),
            ("scene", KeyType::Str),
            ("seed", KeyType::Uint),
        ],
        "on_playtest_step" => &[
            ("run", KeyType::Str),
            ("step", KeyType::Uint),
            ("node", KeyType::Str),
            ("digest", KeyType::Str),
        ],
        "on_playtest_finished" => &[
            ("run", KeyType::Str),
            ("steps", KeyType::Uint),
            ("digest", KeyType::Str),
        ],
        "on_perf_budget_state" => &[
            ("delayed", KeyType::Uint),
            ("active_local", KeyType::Uint),
            ("active_remote", KeyType::Uint),
            ("evictions", KeyType::Uint),
        ],
        "on_flag_changed" => &[("name", KeyType::Str)],
        _ => &[],
    }
}

/// Validate a payload against the reserved-key schema for `event`.
///
/// Returns the first violation as `(key, reason)`.
pub(crate) fn validate_payload(
    event: &str,
    payload: &BTreeMap<String, Value>,
) -> Result<(), (String, String)> {
    for (key, ty) in required_keys(event) {
        match payload.get(*key) {
            None => {
                return Err((key.to_string(), "missing required key".to_string()));
            }
            Some(v) if !ty.accepts(v) => {
                return Err((key.to_string(), format!("expected {}", ty.name())));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn valid_job_state_payload_passes() {
        let p = payload(&[
            ("id", json!("01J")),
            ("from", json!("queued")),
            ("to", json!("claimed")),
            ("worker", json!("w1")),
        ]);
        assert!(validate_payload("on_job_state_changed", &p).is_ok());
    }

    #[test]
    fn missing_key_rejected() {
        let p = payload(&[("id", json!("01J")), ("from", json!("queued"))]);
        let (key, _) = validate_payload("on_job_state_changed", &p).unwrap_err();
        assert_eq!(key, "to");
    }

    #[test]
    fn wrong_type_rejected() {
        let p = payload(&[
            ("id", json!(7)),
            ("from", json!("queued")),
            ("to", json!("claimed")),
        ]);
        let (key, reason) = validate_payload("on_job_state_changed", &p).unwrap_err();
        assert_eq!(key, "id");
        assert!(reason.contains("string"));
    }

    #[test]
    fn extras_pass_through() {
        let p = payload(&[
            ("uid", json!("ab")),
            ("type", json!("image")),
            ("path", json!("/x")),
            ("size_bytes", json!(12)),
            ("custom_modder_key", json!({"anything": true})),
        ]);
        assert!(validate_payload("on_asset_registered", &p).is_ok());
    }

    #[test]
    fn unknown_events_are_unchecked() {
        assert!(validate_payload("on_totally_custom", &BTreeMap::new()).is_ok());
    }
}
