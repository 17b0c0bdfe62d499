// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed asset registry.
//!
//! Assets are keyed by the BLAKE2s-256 of their bytes. Every registered
//! asset carries a deterministic sidecar (`<path>.asset.json`) and an
//! append-only provenance row; mutations become durable (sidecar + row)
//! before their hook is published. Reads run lock-free over an immutable
//! snapshot map that is swapped atomically after each write; writes
//! serialize on a per-uid lock.

#![deny(unsafe_code)]

mod cache;
mod hash;
mod sidecar;
mod thumbs;

pub use cache::{SidecarCache, DEFAULT_CACHE_CAPACITY};
pub use hash::{hash_bytes, hash_file};
pub use sidecar::{asset_path_of, sidecar_path, SIDECAR_SUFFIX};
pub use thumbs::THUMBNAIL_MAX_DIM;

use crate::thumbs::{ThumbJob, ThumbnailWorker};
use chrono::Utc;
use cvn_core::{AssetRecord, AssetType, ProvenanceRecord};
use cvn_events::EventBus;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    /// No asset with the given uid.
    #[error("asset not found: {0}")]
    NotFound(String),
    /// Filesystem failure.
    #[error("asset io at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// JSON (de)serialization failure.
    #[error("asset json: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> AssetError + '_ {
    move |source| AssetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Filter for [`AssetRegistry::list`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AssetFilter {
    /// Exact uid match.
    pub hash: Option<String>,
    /// All-of tag match against `meta.tags`.
    pub tags: Option<Vec<String>>,
    /// Case-insensitive substring over path and string meta values.
    pub text: Option<String>,
    /// Asset type.
    #[serde(rename = "type")]
    pub asset_type: Option<AssetType>,
    /// Page size.
    pub limit: Option<usize>,
    /// Page offset.
    pub offset: Option<usize>,
}

/// One page of list results.
#[derive(Clone, Debug, Serialize)]
pub struct AssetPage {
    /// Matching records for this page.
    pub items: Vec<AssetRecord>,
    /// Total matching count before pagination.
    pub total: usize,
}

/// Options for [`AssetRegistry::rebuild`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RebuildOptions {
    /// Write sidecars that are missing.
    #[serde(default)]
    pub enforce_sidecars: bool,
    /// Rewrite every sidecar even when current.
    #[serde(default)]
    pub overwrite_sidecars: bool,
    /// Coerce reserved meta keys to their expected shapes.
    #[serde(default)]
    pub fix_metadata: bool,
    /// Collect metadata issues without changing anything.
    #[serde(default)]
    pub metadata_report: bool,
}

/// Result of a rebuild pass.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RebuildSummary {
    /// Files visited.
    pub scanned: u64,
    /// Files hashed.
    pub rehashed: u64,
    /// New rows created for previously unknown files.
    pub registered: u64,
    /// Sidecars written or rewritten.
    pub sidecars_written: u64,
    /// Rows pruned because the file vanished.
    pub pruned: u64,
    /// Leftover tombstones cleared.
    pub tombstones_cleared: u64,
    /// Metadata issues found (and fixed, when `fix_metadata`).
    pub metadata_issues: Vec<String>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct RegistryInner {
    provenance_path: PathBuf,
    snapshot: RwLock<Arc<BTreeMap<String, AssetRecord>>>,
    latest_prov: Mutex<HashMap<String, ProvenanceRecord>>,
    uid_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    prov_seq: AtomicU64,
    prov_file: Mutex<std::fs::File>,
    bus: EventBus,
    cache: SidecarCache,
    thumbs: OnceLock<ThumbnailWorker>,
}

/// The asset registry. Clone freely; clones share state.
#[derive(Clone)]
pub struct AssetRegistry {
    inner: Arc<RegistryInner>,
}

impl AssetRegistry {
    /// Open a registry whose provenance log lives at `provenance_path`.
    ///
    /// The log is replayed to restore the row-id counter and the latest
    /// provenance row per asset. Rows themselves are rebuilt from sidecars
    /// via [`AssetRegistry::rebuild`].
    pub fn open(provenance_path: impl Into<PathBuf>, bus: EventBus) -> Result<Self, AssetError> {
        let provenance_path = provenance_path.into();
        if let Some(dir) = provenance_path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err(&provenance_path))?;
        }

        let mut latest: HashMap<String, ProvenanceRecord> = HashMap::new();
        let mut max_id = 0u64;
        match std::fs::read_to_string(&provenance_path) {
            Ok(content) => {
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<ProvenanceRecord>(line) {
                        Ok(row) => {
                            max_id = max_id.max(row.id);
                            latest.insert(row.asset_uid.clone(), row);
                        }
                        Err(e) => warn!(error = %e, "skipping corrupt provenance line"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&provenance_path)(e)),
        }

        let prov_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&provenance_path)
            .map_err(io_err(&provenance_path))?;

        let inner = Arc::new(RegistryInner {
            provenance_path,
            snapshot: RwLock::new(Arc::new(BTreeMap::new())),
            latest_prov: Mutex::new(latest),
            uid_locks: Mutex::new(HashMap::new()),
            prov_seq: AtomicU64::new(max_id),
            prov_file: Mutex::new(prov_file),
            bus,
            cache: SidecarCache::default(),
            thumbs: OnceLock::new(),
        });

        let weak: Weak<RegistryInner> = Arc::downgrade(&inner);
        let worker = ThumbnailWorker::spawn(Box::new(move |uid, thumb_path| {
            if let Some(inner) = weak.upgrade() {
                RegistryInner::set_thumbnail(&inner, uid, thumb_path.clone());
            }
        }));
        let _ = inner.thumbs.set(worker);

        Ok(Self { inner })
    }

    /// Register a file. Identical bytes dedup onto one row; re-registration
    /// merges meta, records the new path as an alias, and always appends a
    /// provenance row.
    pub fn register_file(
        &self,
        path: &Path,
        asset_type: AssetType,
        meta: BTreeMap<String, serde_json::Value>,
        provenance_inputs: BTreeMap<String, serde_json::Value>,
    ) -> Result<AssetRecord, AssetError> {
        let path = std::fs::canonicalize(path).map_err(io_err(path))?;
        let size_bytes = std::fs::metadata(&path).map_err(io_err(&path))?.len();
        let uid = hash::hash_file(&path).map_err(io_err(&path))?;

        let lock = self.uid_lock(&uid);
        let _guard = lock.lock().expect("uid lock");

        let existing = self.snapshot().get(&uid).cloned();
        match existing {
            None => self.insert_new(uid, asset_type, path, size_bytes, meta, provenance_inputs),
            Some(record) => self.merge_existing(record, path, meta, provenance_inputs),
        }
    }

    /// Merge `patch` into an asset's meta. Maps merge deep, arrays replace.
    pub fn update_meta(
        &self,
        uid: &str,
        patch: BTreeMap<String, serde_json::Value>,
    ) -> Result<AssetRecord, AssetError> {
        let lock = self.uid_lock(uid);
        let _guard = lock.lock().expect("uid lock");

        let mut record = self
            .snapshot()
            .get(uid)
            .cloned()
            .ok_or_else(|| AssetError::NotFound(uid.to_string()))?;

        let mut changed_keys = Vec::new();
        for (k, v) in &patch {
            if record.meta.get(k) != Some(v) {
                changed_keys.push(k.clone());
            }
        }
        deep_merge(&mut record.meta, &patch);

        if !changed_keys.is_empty() {
            self.write_sidecars(&record)?;
        }
        self.swap_in(record.clone());

        self.publish(
            "on_asset_meta_updated",
            &[
                ("uid", json!(record.uid)),
                ("changed_keys", json!(changed_keys)),
            ],
        );
        if !changed_keys.is_empty() {
            self.publish(
                "on_asset_sidecar_written",
                &[
                    ("uid", json!(record.uid)),
                    ("sidecar_path", json!(record.sidecar_path.display().to_string())),
                ],
            );
        }
        Ok(record)
    }

    /// Remove an asset: row, sidecars (tombstoned then unlinked), and any
    /// thumbnail. The media file itself stays on disk.
    pub fn remove(&self, uid: &str) -> Result<(), AssetError> {
        let lock = self.uid_lock(uid);
        let _guard = lock.lock().expect("uid lock");

        let record = self
            .snapshot()
            .get(uid)
            .cloned()
            .ok_or_else(|| AssetError::NotFound(uid.to_string()))?;

        for sc in self.all_sidecar_paths(&record) {
            sidecar::remove_tombstoned(&sc).map_err(io_err(&sc))?;
        }
        if let Some(thumb) = &record.thumbnail_path {
            if thumb.exists() {
                std::fs::remove_file(thumb).map_err(io_err(thumb))?;
            }
        }

        {
            let mut snap = self.inner.snapshot.write().expect("registry snapshot lock");
            let mut next = (**snap).clone();
            next.remove(uid);
            *snap = Arc::new(next);
        }
        self.inner.cache.invalidate(uid);

        self.publish(
            "on_asset_removed",
            &[
                ("uid", json!(uid)),
                ("path", json!(record.path.display().to_string())),
            ],
        );
        info!(uid, "asset removed");
        Ok(())
    }

    /// Query assets.
    pub fn list(&self, filter: &AssetFilter) -> AssetPage {
        let snap = self.snapshot();
        let needle = filter.text.as_deref().map(str::to_lowercase);
        let mut matches: Vec<&AssetRecord> = snap
            .values()
            .filter(|r| filter.hash.as_deref().is_none_or(|h| r.uid == h))
            .filter(|r| filter.asset_type.is_none_or(|t| r.asset_type == t))
            .filter(|r| match &filter.tags {
                None => true,
                Some(wanted) => {
                    let tags: Vec<String> = r
                        .meta
                        .get("tags")
                        .and_then(|v| v.as_array())
                        .map(|a| {
                            a.iter()
                                .filter_map(|t| t.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                    wanted.iter().all(|w| tags.iter().any(|t| t == w))
                }
            })
            .filter(|r| match &needle {
                None => true,
                Some(n) => {
                    r.path.display().to_string().to_lowercase().contains(n)
                        || r.meta.values().any(|v| {
                            v.as_str().is_some_and(|s| s.to_lowercase().contains(n))
                        })
                }
            })
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uid.cmp(&b.uid)));

        let total = matches.len();
        let offset = filter.offset.unwrap_or(0).min(total);
        let limit = filter.limit.unwrap_or(usize::MAX);
        let items = matches
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        AssetPage { items, total }
    }

    /// Fetch a record by uid.
    pub fn get(&self, uid: &str) -> Option<AssetRecord> {
        self.snapshot().get(uid).cloned()
    }

    /// Parsed sidecar JSON for an asset.
    pub fn sidecar(&self, uid: &str) -> Result<serde_json::Value, AssetError> {
        if let Some(v) = self.inner.cache.get(uid) {
            return Ok(v);
        }
        let record = self
            .snapshot()
            .get(uid)
            .cloned()
            .ok_or_else(|| AssetError::NotFound(uid.to_string()))?;
        let content =
            std::fs::read_to_string(&record.sidecar_path).map_err(io_err(&record.sidecar_path))?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        self.inner.cache.put(uid, value.clone());
        Ok(value)
    }

    /// Scan `root`, re-hash files, reconcile rows and sidecars.
    pub fn rebuild(&self, root: &Path, options: &RebuildOptions) -> Result<RebuildSummary, AssetError> {
        let mut summary = RebuildSummary::default();
        if !root.exists() {
            return Ok(summary);
        }

        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let name = path.to_string_lossy();
            if name.ends_with(sidecar::TOMBSTONE_SUFFIX) {
                std::fs::remove_file(path).map_err(io_err(path))?;
                summary.tombstones_cleared += 1;
                continue;
            }
            if name.ends_with(SIDECAR_SUFFIX) || name.ends_with(".thumb.png") {
                continue;
            }

            summary.scanned += 1;
            let uid = hash::hash_file(path).map_err(io_err(path))?;
            summary.rehashed += 1;

            let known = self.snapshot().get(&uid).cloned();
            match known {
                None => {
                    self.register_file(
                        path,
                        guess_type(path),
                        BTreeMap::new(),
                        BTreeMap::from([("source".to_string(), json!("rebuild"))]),
                    )?;
                    summary.registered += 1;
                    summary.sidecars_written += 1;
                }
                Some(record) => {
                    self.check_metadata(&record, options, &mut summary)?;
                    // Metadata fixes above may have rewritten the record.
                    let record = self.snapshot().get(&uid).cloned().unwrap_or(record);
                    let missing = !record.sidecar_path.exists();
                    if options.overwrite_sidecars || (options.enforce_sidecars && missing) {
                        let lock = self.uid_lock(&uid);
                        let _guard = lock.lock().expect("uid lock");
                        self.write_sidecars(&record)?;
                        summary.sidecars_written += 1;
                        self.publish(
                            "on_asset_sidecar_written",
                            &[
                                ("uid", json!(record.uid)),
                                (
                                    "sidecar_path",
                                    json!(record.sidecar_path.display().to_string()),
                                ),
                            ],
                        );
                    }
                }
            }
        }

        // Prune rows under this root whose file disappeared.
        let stale: Vec<String> = self
            .snapshot()
            .values()
            .filter(|r| r.path.starts_with(root) && !r.path.exists())
            .map(|r| r.uid.clone())
            .collect();
        for uid in stale {
            self.remove(&uid)?;
            summary.pruned += 1;
        }

        info!(
            scanned = summary.scanned,
            registered = summary.registered,
            pruned = summary.pruned,
            "rebuild finished"
        );
        Ok(summary)
    }

    /// Evict up to `max` unpinned cache entries; returns the count evicted.
    pub fn cache_evict_lru(&self, max: usize) -> usize {
        self.inner.cache.evict_lru(max)
    }

    /// Current sidecar-cache size.
    pub fn cache_len(&self) -> usize {
        self.inner.cache.len()
    }

    /// Pin or unpin a cache entry.
    pub fn cache_pin(&self, uid: &str, pinned: bool) {
        self.inner.cache.set_pinned(uid, pinned);
    }

    /// Number of registered assets.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- internals -----------------------------------------------------------

    fn snapshot(&self) -> Arc<BTreeMap<String, AssetRecord>> {
        Arc::clone(&self.inner.snapshot.read().expect("registry snapshot lock"))
    }

    fn uid_lock(&self, uid: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.uid_locks.lock().expect("uid lock map");
        Arc::clone(locks.entry(uid.to_string()).or_default())
    }

    fn insert_new(
        &self,
        uid: String,
        asset_type: AssetType,
        path: PathBuf,
        size_bytes: u64,
        meta: BTreeMap<String, serde_json::Value>,
        provenance_inputs: BTreeMap<String, serde_json::Value>,
    ) -> Result<AssetRecord, AssetError> {
        let provenance = self.append_provenance(&uid, provenance_inputs)?;
        let record = AssetRecord {
            uid: uid.clone(),
            asset_type,
            sidecar_path: sidecar_path(&path),
            thumbnail_path: None,
            path: path.clone(),
            size_bytes,
            created_at: Utc::now(),
            meta,
            provenance_id: provenance.id,
        };
        self.write_sidecars(&record)?;
        self.swap_in(record.clone());

        self.publish(
            "on_asset_registered",
            &[
                ("uid", json!(record.uid)),
                ("type", json!(record.asset_type.dir_name())),
                ("path", json!(record.path.display().to_string())),
                ("size_bytes", json!(record.size_bytes)),
            ],
        );
        self.publish(
            "on_asset_sidecar_written",
            &[
                ("uid", json!(record.uid)),
                ("sidecar_path", json!(record.sidecar_path.display().to_string())),
            ],
        );

        if record.asset_type == AssetType::Image {
            if let Some(worker) = self.inner.thumbs.get() {
                worker.enqueue(ThumbJob {
                    uid: record.uid.clone(),
                    source: record.path.clone(),
                    dest: thumb_path(&record.path),
                });
            }
        }
        debug!(uid = %record.uid, path = %record.path.display(), "asset registered");
        Ok(record)
    }

    fn merge_existing(
        &self,
        mut record: AssetRecord,
        new_path: PathBuf,
        meta: BTreeMap<String, serde_json::Value>,
        provenance_inputs: BTreeMap<String, serde_json::Value>,
    ) -> Result<AssetRecord, AssetError> {
        let mut changed_keys: Vec<String> = meta
            .iter()
            .filter(|(k, v)| record.meta.get(*k) != Some(v))
            .map(|(k, _)| k.clone())
            .collect();
        deep_merge(&mut record.meta, &meta);

        // The first registered path stays canonical; later paths are aliases.
        if new_path != record.path {
            let aliases = record
                .meta
                .entry("aliases".to_string())
                .or_insert_with(|| json!([]));
            if let Some(arr) = aliases.as_array_mut() {
                let rendered = json!(new_path.display().to_string());
                if !arr.contains(&rendered) {
                    arr.push(rendered);
                    changed_keys.push("aliases".to_string());
                }
            }
        }

        let provenance = self.append_provenance(&record.uid, provenance_inputs)?;
        record.provenance_id = provenance.id;

        self.write_sidecars(&record)?;
        self.swap_in(record.clone());

        self.publish(
            "on_asset_meta_updated",
            &[
                ("uid", json!(record.uid)),
                ("changed_keys", json!(changed_keys)),
            ],
        );
        self.publish(
            "on_asset_sidecar_written",
            &[
                ("uid", json!(record.uid)),
                ("sidecar_path", json!(record.sidecar_path.display().to_string())),
            ],
        );
        debug!(uid = %record.uid, "asset re-registered (dedup)");
        Ok(record)
    }

    /// Write the canonical sidecar plus one per alias path, atomically.
    fn write_sidecars(&self, record: &AssetRecord) -> Result<(), AssetError> {
        let provenance = self
            .inner
            .latest_prov
            .lock()
            .expect("provenance map lock")
            .get(&record.uid)
            .cloned()
            .unwrap_or_else(|| placeholder_provenance(&record.uid));
        let content = sidecar::render(record, &provenance)?;
        for sc in self.all_sidecar_paths(record) {
            sidecar::write_atomic(&sc, &content).map_err(io_err(&sc))?;
        }
        self.inner.cache.put(&record.uid, serde_json::from_str(&content)?);
        Ok(())
    }

    fn all_sidecar_paths(&self, record: &AssetRecord) -> Vec<PathBuf> {
        let mut out = vec![record.sidecar_path.clone()];
        if let Some(aliases) = record.meta.get("aliases").and_then(|v| v.as_array()) {
            for alias in aliases.iter().filter_map(|a| a.as_str()) {
                out.push(sidecar_path(Path::new(alias)));
            }
        }
        out
    }

    fn append_provenance(
        &self,
        uid: &str,
        inputs_json: BTreeMap<String, serde_json::Value>,
    ) -> Result<ProvenanceRecord, AssetError> {
        let workflow_hash = inputs_json
            .get("workflow_hash")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let seed = inputs_json.get("seed").and_then(|v| v.as_u64());
        let source = inputs_json
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("register")
            .to_string();

        let row = ProvenanceRecord {
            id: self.inner.prov_seq.fetch_add(1, Ordering::SeqCst) + 1,
            asset_uid: uid.to_string(),
            source,
            workflow_hash,
            seed,
            inputs_json,
            tool: "comfyvn-studio".to_string(),
            version: cvn_core::CONTRACT_VERSION.to_string(),
            created_at: Utc::now(),
        };

        {
            let mut f = self.inner.prov_file.lock().expect("provenance file lock");
            let line = serde_json::to_string(&row)?;
            f.write_all(line.as_bytes())
                .and_then(|()| f.write_all(b"\n"))
                .and_then(|()| f.sync_data())
                .map_err(io_err(&self.inner.provenance_path))?;
        }
        self.inner
            .latest_prov
            .lock()
            .expect("provenance map lock")
            .insert(uid.to_string(), row.clone());
        Ok(row)
    }

    fn swap_in(&self, record: AssetRecord) {
        let mut snap = self.inner.snapshot.write().expect("registry snapshot lock");
        let mut next = (**snap).clone();
        next.insert(record.uid.clone(), record);
        *snap = Arc::new(next);
    }

    fn check_metadata(
        &self,
        record: &AssetRecord,
        options: &RebuildOptions,
        summary: &mut RebuildSummary,
    ) -> Result<(), AssetError> {
        if !options.fix_metadata && !options.metadata_report {
            return Ok(());
        }
        let mut fixes = BTreeMap::new();
        if let Some(tags) = record.meta.get("tags") {
            if !tags.is_array() {
                summary
                    .metadata_issues
                    .push(format!("{}: meta.tags is not an array", record.uid));
                fixes.insert("tags".to_string(), json!([]));
            }
        }
        if let Some(nsfw) = record.meta.get("nsfw") {
            if !nsfw.is_boolean() {
                summary
                    .metadata_issues
                    .push(format!("{}: meta.nsfw is not a bool", record.uid));
                fixes.insert("nsfw".to_string(), json!(nsfw.as_str() == Some("true")));
            }
        }
        if options.fix_metadata && !fixes.is_empty() {
            self.update_meta(&record.uid, fixes)?;
        }
        Ok(())
    }

    fn publish(&self, event: &str, pairs: &[(&str, serde_json::Value)]) {
        let payload: BTreeMap<String, serde_json::Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        if let Err(e) = self.inner.bus.publish(event, "assets", payload) {
            debug!(event, error = %e, "asset hook publish failed");
        }
    }
}

impl RegistryInner {
    fn set_thumbnail(inner: &Arc<RegistryInner>, uid: &str, thumb: PathBuf) {
        let mut snap = inner.snapshot.write().expect("registry snapshot lock");
        if let Some(record) = snap.get(uid) {
            let mut updated = record.clone();
            updated.thumbnail_path = Some(thumb);
            let mut next = (**snap).clone();
            next.insert(uid.to_string(), updated);
            *snap = Arc::new(next);
        }
    }
}

fn thumb_path(asset_path: &Path) -> PathBuf {
    let mut s = asset_path.as_os_str().to_os_string();
    s.push(".thumb.png");
    PathBuf::from(s)
}

fn guess_type(path: &Path) -> AssetType {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("png" | "jpg" | "jpeg" | "webp" | "gif" | "bmp") => AssetType::Image,
        Some("ogg" | "wav" | "mp3" | "flac" | "opus") => AssetType::Audio,
        Some("txt" | "md" | "json" | "yaml" | "toml" | "rpy") => AssetType::Text,
        _ => AssetType::Other,
    }
}

/// Deep merge: objects merge recursively, everything else (arrays included)
/// replaces. Disjoint keys are order-independent.
fn deep_merge(
    dest: &mut BTreeMap<String, serde_json::Value>,
    patch: &BTreeMap<String, serde_json::Value>,
) {
    for (k, v) in patch {
        match (dest.get_mut(k), v) {
            (Some(serde_json::Value::Object(d)), serde_json::Value::Object(p)) => {
                merge_objects(d, p);
            }
            _ => {
                dest.insert(k.clone(), v.clone());
            }
        }
    }
}

fn merge_objects(
    dest: &mut serde_json::Map<String, serde_json::Value>,
    patch: &serde_json::Map<String, serde_json::Value>,
) {
    for (k, v) in patch {
        match (dest.get_mut(k), v) {
            (Some(serde_json::Value::Object(d)), serde_json::Value::Object(p)) => {
                merge_objects(d, p);
            }
            _ => {
                dest.insert(k.clone(), v.clone());
            }
        }
    }
}

fn placeholder_provenance(uid: &str) -> ProvenanceRecord {
    ProvenanceRecord {
        id: 0,
        asset_uid: uid.to_string(),
        source: "unknown".to_string(),
        workflow_hash: None,
        seed: None,
        inputs_json: BTreeMap::new(),
        tool: "comfyvn-studio".to_string(),
        version: cvn_core::CONTRACT_VERSION.to_string(),
        created_at: Utc::now(),
    }
}
