// SPDX-License-Identifier: MIT OR Apache-2.0
//! Policy/advisory findings.

use crate::canonical::canonical_sha256;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Severity of a finding.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational; never gates.
    Info,
    /// Worth surfacing; never gates.
    Warn,
    /// Stops the action unless overridden through an acknowledgement.
    Block,
}

/// How a `block` finding composes with acknowledgement tokens.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum FindingGate {
    /// An acknowledgement token lifts the block.
    #[default]
    Overridable,
    /// No override; the action never proceeds.
    Hard,
}

/// A single scanner result.
///
/// Findings are deduplicated by `(scanner, code, target_hash)`; duplicates
/// increment `count` instead of appending.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Finding {
    /// Producing scanner id.
    pub scanner: String,
    /// Stable machine-readable code, e.g. `license.unknown`.
    pub code: String,
    /// Severity level.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
    /// What the finding is about (path, uid, job kind), if anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Scanner-specific detail map.
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    /// Gate behavior for `block` findings.
    #[serde(default)]
    pub gate: FindingGate,
    /// How many times this finding was produced for the same target.
    #[serde(default = "one")]
    pub count: u64,
}

fn one() -> u64 {
    1
}

impl Finding {
    /// Build an `info` finding.
    pub fn info(scanner: &str, code: &str, message: impl Into<String>) -> Self {
        Self::with_severity(scanner, code, Severity::Info, message)
    }

    /// Build a `warn` finding.
    pub fn warn(scanner: &str, code: &str, message: impl Into<String>) -> Self {
        Self::with_severity(scanner, code, Severity::Warn, message)
    }

    /// Build a `block` finding (overridable by default).
    pub fn block(scanner: &str, code: &str, message: impl Into<String>) -> Self {
        Self::with_severity(scanner, code, Severity::Block, message)
    }

    fn with_severity(scanner: &str, code: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            scanner: scanner.to_string(),
            code: code.to_string(),
            severity,
            message: message.into(),
            target: None,
            details: BTreeMap::new(),
            gate: FindingGate::default(),
            count: 1,
        }
    }

    /// Attach a target.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Mark the block as non-overridable.
    pub fn hard(mut self) -> Self {
        self.gate = FindingGate::Hard;
        self
    }

    /// Dedup key: `(scanner, code, sha256(canonical(target)))`.
    pub fn dedup_key(&self) -> (String, String, String) {
        let target_hash =
            canonical_sha256(&self.target).unwrap_or_else(|_| String::from("unhashable"));
        (self.scanner.clone(), self.code.clone(), target_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_info_warn_block() {
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Warn < Severity::Block);
    }

    #[test]
    fn dedup_key_ignores_message() {
        let a = Finding::warn("license", "license.unknown", "no license on file A")
            .with_target("uid-1");
        let b = Finding::warn("license", "license.unknown", "different wording")
            .with_target("uid-1");
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn dedup_key_separates_targets() {
        let a = Finding::warn("license", "license.unknown", "m").with_target("uid-1");
        let b = Finding::warn("license", "license.unknown", "m").with_target("uid-2");
        assert_ne!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn block_defaults_overridable() {
        let f = Finding::block("nsfw", "nsfw.explicit", "flagged");
        assert_eq!(f.gate, FindingGate::Overridable);
        assert_eq!(f.hard().gate, FindingGate::Hard);
    }
}
