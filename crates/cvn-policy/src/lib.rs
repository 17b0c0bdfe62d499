// SPDX-License-Identifier: MIT OR Apache-2.0
//! Advisory / policy enforcement.
//!
//! Scanners are compiled-in plug-ins behind the [`Scanner`] trait. The
//! [`Enforcer`] runs every registered scanner in stable id order, dedups the
//! findings, applies the acknowledgement gate, records an audit entry, and
//! publishes `on_policy_enforced`. Evaluation itself is a pure function of
//! the payload, the scanner set, and the ack store.

#![deny(unsafe_code)]

mod audit;

pub use audit::{AuditEntry, AuditLog};

use chrono::{DateTime, Utc};
use cvn_core::{Finding, FindingGate, Severity};
use cvn_events::EventBus;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

// ---------------------------------------------------------------------------
// Scanner interface
// ---------------------------------------------------------------------------

/// Context handed to each scanner.
#[derive(Clone, Debug)]
pub struct ScanContext {
    /// The action under evaluation, e.g. `schedule.submit`, `assets.register`.
    pub action: String,
    /// The action's payload.
    pub payload: serde_json::Value,
}

/// A compiled-in advisory scanner.
///
/// Scanners must be deterministic over their context; the enforcer relies on
/// that for evaluation purity.
pub trait Scanner: Send + Sync {
    /// Stable scanner id; evaluation order sorts on this.
    fn id(&self) -> &str;
    /// Produce findings for the given context.
    fn run(&self, ctx: &ScanContext) -> Vec<Finding>;
}

// ---------------------------------------------------------------------------
// Evaluation result
// ---------------------------------------------------------------------------

/// What the gate decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    /// No block-level finding.
    Open,
    /// Block-level finding stopped the action.
    Blocked,
    /// Block-level finding present, lifted by an acknowledgement token.
    Overridden,
}

/// Result of [`Enforcer::evaluate`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Evaluation {
    /// Whether the action may proceed.
    pub allow: bool,
    /// Deduplicated findings, in scanner-id order.
    pub findings: Vec<Finding>,
    /// Gate outcome.
    pub gate: GateOutcome,
}

/// A recorded acknowledgement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckRecord {
    /// Opaque token presented back to `evaluate`.
    pub token: String,
    /// Acknowledging user.
    pub user: String,
    /// Why the user accepted the finding.
    pub reason: String,
    /// When the acknowledgement was recorded.
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Enforcer
// ---------------------------------------------------------------------------

/// The scanner host and admission gate.
#[derive(Clone)]
pub struct Enforcer {
    inner: Arc<EnforcerInner>,
}

struct EnforcerInner {
    scanners: RwLock<Vec<Arc<dyn Scanner>>>,
    acks: Mutex<BTreeMap<String, AckRecord>>,
    audit: AuditLog,
    bus: EventBus,
}

impl Enforcer {
    /// Build an enforcer publishing `on_policy_enforced` on `bus`.
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Arc::new(EnforcerInner {
                scanners: RwLock::new(Vec::new()),
                acks: Mutex::new(BTreeMap::new()),
                audit: AuditLog::default(),
                bus,
            }),
        }
    }

    /// Register a scanner. Replaces any scanner with the same id.
    pub fn register_scanner(&self, scanner: Arc<dyn Scanner>) {
        let mut scanners = self.inner.scanners.write().expect("scanner lock");
        scanners.retain(|s| s.id() != scanner.id());
        scanners.push(scanner);
        scanners.sort_by(|a, b| a.id().cmp(b.id()));
    }

    /// Record an acknowledgement token.
    pub fn ack(&self, token: impl Into<String>, user: impl Into<String>, reason: impl Into<String>) {
        let token = token.into();
        let record = AckRecord {
            token: token.clone(),
            user: user.into(),
            reason: reason.into(),
            at: Utc::now(),
        };
        self.inner.acks.lock().expect("ack lock").insert(token, record);
    }

    /// Evaluate `action` over `payload`, optionally presenting an ack token.
    ///
    /// `allow` is false iff a block-level finding survives the ack gate:
    /// an acknowledged token lifts `Overridable` blocks, never `Hard` ones.
    pub fn evaluate(
        &self,
        action: &str,
        payload: serde_json::Value,
        ack_token: Option<&str>,
    ) -> Evaluation {
        let ctx = ScanContext {
            action: action.to_string(),
            payload,
        };

        let scanners = self.inner.scanners.read().expect("scanner lock");
        let mut deduped: BTreeMap<(String, String, String), Finding> = BTreeMap::new();
        for scanner in scanners.iter() {
            for finding in scanner.run(&ctx) {
                let key = finding.dedup_key();
                match deduped.get_mut(&key) {
                    Some(existing) => existing.count += finding.count,
                    None => {
                        deduped.insert(key, finding);
                    }
                }
            }
        }
        drop(scanners);
        let findings: Vec<Finding> = deduped.into_values().collect();

        let ack_valid = ack_token
            .map(|t| self.inner.acks.lock().expect("ack lock").contains_key(t))
            .unwrap_or(false);

        let mut hard_block = false;
        let mut soft_block = false;
        for f in findings.iter().filter(|f| f.severity == Severity::Block) {
            match f.gate {
                FindingGate::Hard => hard_block = true,
                FindingGate::Overridable => soft_block = true,
            }
        }

        let (allow, gate) = if hard_block {
            (false, GateOutcome::Blocked)
        } else if soft_block {
            if ack_valid {
                (true, GateOutcome::Overridden)
            } else {
                (false, GateOutcome::Blocked)
            }
        } else {
            (true, GateOutcome::Open)
        };

        let evaluation = Evaluation { allow, findings, gate };

        self.inner.audit.record(AuditEntry {
            at: Utc::now(),
            action: action.to_string(),
            allow,
            gate,
            findings: evaluation.findings.clone(),
            ack_token: ack_token.filter(|_| ack_valid).map(str::to_string),
        });

        let mut hook_payload = BTreeMap::new();
        hook_payload.insert("action".to_string(), json!(action));
        hook_payload.insert("allow".to_string(), json!(allow));
        hook_payload.insert(
            "findings".to_string(),
            serde_json::to_value(&evaluation.findings).unwrap_or_else(|_| json!([])),
        );
        if let Err(e) = self.inner.bus.publish("on_policy_enforced", "policy", hook_payload) {
            debug!(error = %e, "policy hook publish failed");
        }

        evaluation
    }

    /// The audit trail, newest last.
    pub fn audit(&self) -> Vec<AuditEntry> {
        self.inner.audit.entries()
    }

    /// Registered scanner ids, in evaluation order.
    pub fn scanner_ids(&self) -> Vec<String> {
        self.inner
            .scanners
            .read()
            .expect("scanner lock")
            .iter()
            .map(|s| s.id().to_string())
            .collect()
    }

    /// Recorded acknowledgements.
    pub fn acks(&self) -> Vec<AckRecord> {
        self.inner.acks.lock().expect("ack lock").values().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Built-in scanners
// ---------------------------------------------------------------------------

/// Flags payloads whose `nsfw` meta is true without an `audience` rating.
pub struct NsfwScanner;

impl Scanner for NsfwScanner {
    fn id(&self) -> &str {
        "nsfw"
    }

    fn run(&self, ctx: &ScanContext) -> Vec<Finding> {
        let meta = &ctx.payload["meta"];
        if meta["nsfw"] == json!(true) && meta.get("audience").is_none() {
            vec![
                Finding::block("nsfw", "nsfw.unrated", "nsfw content without an audience rating")
                    .with_target(
                        ctx.payload["uid"].as_str().unwrap_or("unknown").to_string(),
                    ),
            ]
        } else {
            Vec::new()
        }
    }
}

/// Warns when an asset payload carries no license meta.
pub struct LicenseScanner;

impl Scanner for LicenseScanner {
    fn id(&self) -> &str {
        "license"
    }

    fn run(&self, ctx: &ScanContext) -> Vec<Finding> {
        if !ctx.action.starts_with("assets.") {
            return Vec::new();
        }
        if ctx.payload["meta"].get("license").is_none() {
            vec![
                Finding::warn("license", "license.missing", "asset has no license metadata")
                    .with_target(
                        ctx.payload["uid"].as_str().unwrap_or("unknown").to_string(),
                    ),
            ]
        } else {
            Vec::new()
        }
    }
}
