// SPDX-License-Identifier: MIT OR Apache-2.0
//! Resource hints supplied by callers and cost estimates produced by the
//! scheduler's `preview_cost`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Caller-supplied resource estimate consumed by the budget gate.
///
/// All fields default to zero; a zero hint reserves only a queue slot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CostHint {
    /// Expected CPU share in percent of one core (0–100 per core).
    #[serde(default)]
    pub cpu_pct: u32,
    /// Expected VRAM residency in megabytes.
    #[serde(default)]
    pub vram_mb: u64,
    /// Input payload size in bytes, when known.
    #[serde(default)]
    pub input_bytes: u64,
}

/// Deterministic output of `preview_cost`.
///
/// A pure function of the job and a provider-stats snapshot; identical
/// inputs always produce identical estimates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CostEstimate {
    /// Predicted wall-clock duration in seconds.
    pub duration_sec: f64,
    /// Bytes expected to be sent to the provider.
    pub bytes_tx: u64,
    /// Bytes expected back.
    pub bytes_rx: u64,
    /// VRAM-gigabyte-minutes consumed.
    pub vram_minutes: f64,
    /// Currency estimate in the provider's billing unit (USD by default).
    pub currency_estimate: f64,
    /// Human-readable derivation steps, in computation order.
    pub rationale: Vec<String>,
}

impl CostEstimate {
    /// An all-zero estimate with a single rationale line.
    pub fn free(reason: impl Into<String>) -> Self {
        Self {
            duration_sec: 0.0,
            bytes_tx: 0,
            bytes_rx: 0,
            vram_minutes: 0.0,
            currency_estimate: 0.0,
            rationale: vec![reason.into()],
        }
    }
}
