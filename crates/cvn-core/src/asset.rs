// SPDX-License-Identifier: MIT OR Apache-2.0
//! Asset and provenance records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Meta keys with registry-enforced semantics. Anything else is free-form.
pub const RESERVED_META_KEYS: &[&str] = &["license", "tags", "nsfw", "origin", "aliases"];

/// Broad media class of an asset.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    /// Still image (thumbnail-eligible).
    Image,
    /// Audio clip.
    Audio,
    /// Text document.
    Text,
    /// Anything else.
    #[default]
    Other,
}

impl AssetType {
    /// Directory segment under `data/assets/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Text => "text",
            Self::Other => "other",
        }
    }
}

/// A registered, content-addressed asset.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct AssetRecord {
    /// BLAKE2s-256 hex of the file bytes.
    pub uid: String,
    /// Media class.
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    /// Canonical absolute path (first registration wins).
    pub path: PathBuf,
    /// Co-located `<path>.asset.json`.
    pub sidecar_path: PathBuf,
    /// Generated thumbnail, when the asset is an image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<PathBuf>,
    /// File size in bytes.
    pub size_bytes: u64,
    /// First registration time.
    pub created_at: DateTime<Utc>,
    /// Open metadata map; see [`RESERVED_META_KEYS`].
    pub meta: BTreeMap<String, serde_json::Value>,
    /// Latest provenance row id for this asset.
    pub provenance_id: u64,
}

/// Append-only provenance row; never rewritten after append.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ProvenanceRecord {
    /// Row id, monotonically increasing in the log.
    pub id: u64,
    /// Asset this row belongs to.
    pub asset_uid: String,
    /// Where the bytes came from (path, import batch, generator name).
    pub source: String,
    /// Hash of the generative workflow that produced the asset, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_hash: Option<String>,
    /// Generator seed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Inputs captured at production time.
    pub inputs_json: BTreeMap<String, serde_json::Value>,
    /// Producing tool name.
    pub tool: String,
    /// Producing tool version.
    pub version: String,
    /// Append time.
    pub created_at: DateTime<Utc>,
}
