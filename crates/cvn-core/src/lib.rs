// SPDX-License-Identifier: MIT OR Apache-2.0
//! Contract types shared by every subsystem of the ComfyVN Studio control
//! plane: the job model and its lifecycle state machine, hook envelopes,
//! asset and provenance records, provider records, policy findings, cost
//! estimates, and canonical-JSON digest helpers.
//!
//! Nothing in this crate performs I/O. Components own their state; callers
//! hold ids (`JobId`, asset `uid`) and exchange these types over the wire.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod asset;
pub mod canonical;
pub mod cost;
pub mod finding;
pub mod hook;
pub mod job;
pub mod provider;

pub use asset::{AssetRecord, AssetType, ProvenanceRecord, RESERVED_META_KEYS};
pub use canonical::{canonical_json, canonical_sha256, CanonicalError};
pub use cost::{CostEstimate, CostHint};
pub use finding::{Finding, FindingGate, Severity};
pub use hook::{HookEnvelope, HookEventDoc, hook_catalog, known_hook_events};
pub use job::{JobId, JobRecord, JobSpec, JobState, Target, TraceEntry};
pub use provider::{ProviderCost, ProviderKind, ProviderRecord, ProviderStatus};

/// Version string reported by `/status` and `studio doctor`.
pub const CONTRACT_VERSION: &str = "0.1.0";
