// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cost estimation and compute-target advice.
//!
//! Both entry points are pure functions of their arguments; the actor feeds
//! them its provider snapshot and rolling duration history, so identical
//! inputs always produce identical outputs.

use cvn_core::{CostEstimate, JobSpec, ProviderKind, ProviderRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Advice on where a job should execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeAdvice {
    /// Run on the local CPU.
    Cpu,
    /// Run on a local GPU device.
    Gpu,
    /// Dispatch to a remote provider.
    Remote,
}

/// Fallback duration per kind when no history exists yet, in seconds.
fn default_duration_sec(kind: &str) -> f64 {
    match kind {
        "render" => 30.0,
        "upscale" => 45.0,
        "tts" => 10.0,
        "import" => 5.0,
        "export" => 20.0,
        _ => 15.0,
    }
}

/// Deterministic cost preview for `spec` against a provider snapshot.
///
/// `rolling_avg_sec` is the per-kind rolling mean the actor maintains from
/// completed jobs; kinds without history fall back to a fixed table.
pub fn preview_cost(
    spec: &JobSpec,
    providers: &[ProviderRecord],
    rolling_avg_sec: &BTreeMap<String, f64>,
) -> CostEstimate {
    let mut rationale = Vec::new();

    let duration_sec = match rolling_avg_sec.get(&spec.kind) {
        Some(avg) => {
            rationale.push(format!(
                "duration {avg:.1}s from rolling average for kind '{}'",
                spec.kind
            ));
            *avg
        }
        None => {
            let d = default_duration_sec(&spec.kind);
            rationale.push(format!("duration {d:.1}s from default table for kind '{}'", spec.kind));
            d
        }
    };

    let bytes_tx = spec.cost_hint.input_bytes;
    let bytes_rx = bytes_tx;
    rationale.push(format!("transfer {bytes_tx}B out, {bytes_rx}B back from input size"));

    let vram_minutes = (spec.cost_hint.vram_mb as f64 / 1024.0) * (duration_sec / 60.0);
    rationale.push(format!(
        "{vram_minutes:.3} vram-GB-minutes from {}MB over the run",
        spec.cost_hint.vram_mb
    ));

    // Cheapest healthy remote provider prices the metered path; local
    // execution is unmetered.
    let provider = providers
        .iter()
        .filter(|p| p.kind == ProviderKind::Remote && p.status.healthy)
        .min_by(|a, b| {
            let ca = a.cost.per_minute.unwrap_or(0.0);
            let cb = b.cost.per_minute.unwrap_or(0.0);
            ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
        });

    let currency_estimate = match provider {
        Some(p) => {
            let per_minute = p.cost.per_minute.unwrap_or(0.0) * duration_sec / 60.0;
            let egress = p.cost.egress_per_gb.unwrap_or(0.0) * bytes_tx as f64 / 1e9;
            let vram = p.cost.vram_per_gb_minute.unwrap_or(0.0) * vram_minutes;
            rationale.push(format!(
                "priced against '{}': {per_minute:.4} time + {egress:.4} egress + {vram:.4} vram",
                p.id
            ));
            per_minute + egress + vram
        }
        None => {
            rationale.push("no healthy remote provider, local execution is unmetered".to_string());
            0.0
        }
    };

    CostEstimate {
        duration_sec,
        bytes_tx,
        bytes_rx,
        vram_minutes,
        currency_estimate,
        rationale,
    }
}

/// Resolve where a job should run.
///
/// With the `enable_compute` umbrella off, remote dispatch degrades to the
/// best local option instead of erroring.
pub fn advise(
    spec: &JobSpec,
    providers: &[ProviderRecord],
    enable_compute: bool,
    enable_remote_compute: bool,
) -> ComputeAdvice {
    let remote_healthy = providers
        .iter()
        .any(|p| p.kind == ProviderKind::Remote && p.status.healthy);
    let local_gpu = providers.iter().any(|p| {
        p.kind == ProviderKind::Local && p.status.healthy && p.capabilities.contains("gpu")
    });

    let wants_remote = matches!(spec.target, cvn_core::Target::Remote)
        || (matches!(spec.target, cvn_core::Target::Auto)
            && spec.cost_hint.vram_mb > 0
            && !local_gpu);

    if wants_remote && enable_compute && enable_remote_compute && remote_healthy {
        return ComputeAdvice::Remote;
    }
    if local_gpu && gpu_kind(&spec.kind) {
        return ComputeAdvice::Gpu;
    }
    ComputeAdvice::Cpu
}

fn gpu_kind(kind: &str) -> bool {
    matches!(kind, "render" | "upscale" | "tts")
}
