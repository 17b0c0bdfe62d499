// SPDX-License-Identifier: MIT OR Apache-2.0
//! Compute provider records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Whether a provider runs on this machine or over the network.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// On-box execution (CPU or local GPU).
    Local,
    /// Networked provider with metered cost.
    Remote,
}

/// Health snapshot, swapped atomically by the prober.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProviderStatus {
    /// Last probe succeeded.
    pub healthy: bool,
    /// Time of the last successful probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ok_at: Option<DateTime<Utc>>,
    /// Error from the last failed probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Round-trip latency of the last successful probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// Cost metadata used by `preview_cost`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProviderCost {
    /// Billed currency per wall-clock minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_minute: Option<f64>,
    /// Billed currency per gigabyte of egress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_per_gb: Option<f64>,
    /// Billed currency per VRAM-gigabyte-minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_per_gb_minute: Option<f64>,
}

/// A registered compute provider.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ProviderRecord {
    /// Stable provider id.
    pub id: String,
    /// Local or remote.
    pub kind: ProviderKind,
    /// Capability tags, e.g. `gpu`, `sdxl`, `tts`.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Provider-specific configuration (endpoints, device names).
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    /// Latest health snapshot.
    #[serde(default)]
    pub status: ProviderStatus,
    /// Cost metadata; all-None for unmetered local devices.
    #[serde(default)]
    pub cost: ProviderCost,
}

impl ProviderRecord {
    /// A healthy local provider with the given capability tags.
    pub fn local(id: impl Into<String>, capabilities: &[&str]) -> Self {
        Self {
            id: id.into(),
            kind: ProviderKind::Local,
            capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
            config: BTreeMap::new(),
            status: ProviderStatus {
                healthy: true,
                last_ok_at: Some(Utc::now()),
                last_error: None,
                latency_ms: None,
            },
            cost: ProviderCost::default(),
        }
    }
}
