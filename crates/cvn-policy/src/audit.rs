// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded audit trail of policy evaluations.

use crate::GateOutcome;
use chrono::{DateTime, Utc};
use cvn_core::Finding;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Retained audit entries.
const AUDIT_CAPACITY: usize = 1000;

/// One recorded evaluation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the evaluation ran.
    pub at: DateTime<Utc>,
    /// Action evaluated.
    pub action: String,
    /// Decision.
    pub allow: bool,
    /// Gate outcome.
    pub gate: GateOutcome,
    /// Findings at the time of evaluation.
    pub findings: Vec<Finding>,
    /// Ack token that was presented and valid, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_token: Option<String>,
}

/// Bounded in-memory audit ring, oldest evicted first.
#[derive(Clone, Default)]
pub struct AuditLog {
    inner: Arc<Mutex<VecDeque<AuditEntry>>>,
}

impl AuditLog {
    /// Append an entry, evicting the oldest past capacity.
    pub fn record(&self, entry: AuditEntry) {
        let mut log = self.inner.lock().expect("audit lock");
        if log.len() >= AUDIT_CAPACITY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Snapshot, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().expect("audit lock").iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let log = AuditLog::default();
        for i in 0..(AUDIT_CAPACITY + 5) {
            log.record(AuditEntry {
                at: Utc::now(),
                action: format!("a{i}"),
                allow: true,
                gate: GateOutcome::Open,
                findings: Vec::new(),
                ack_token: None,
            });
        }
        let entries = log.entries();
        assert_eq!(entries.len(), AUDIT_CAPACITY);
        assert_eq!(entries[0].action, "a5");
    }
}
