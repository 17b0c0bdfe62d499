// SPDX-License-Identifier: MIT OR Apache-2.0
//! Feature-flag authority.
//!
//! A process-wide typed map with persisted overrides. Reads clone an `Arc`
//! snapshot and never block writers; writes serialize through a single lock,
//! persist to one JSON document with atomic replace (temp file, fsync,
//! rename), and only then notify watchers. A failed persist fails the `set`
//! and notifies nobody.

#![deny(unsafe_code)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

// ---------------------------------------------------------------------------
// FlagValue
// ---------------------------------------------------------------------------

/// Value of a feature flag: bool, number, or enum-style string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum FlagValue {
    /// On/off switch.
    Bool(bool),
    /// Numeric knob.
    Number(f64),
    /// Enum-style choice.
    Text(String),
}

impl FlagValue {
    /// Interpret the flag as a boolean gate.
    ///
    /// Numbers gate on non-zero, strings on non-empty.
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0,
            Self::Text(s) => !s.is_empty(),
        }
    }
}

impl From<bool> for FlagValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for FlagValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for FlagValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Compile-time default table. Unknown names read as `false` and warn once.
pub fn default_flags() -> BTreeMap<String, FlagValue> {
    let mut m = BTreeMap::new();
    m.insert("enable_compute".into(), FlagValue::Bool(true));
    m.insert("enable_remote_compute".into(), FlagValue::Bool(false));
    m.insert("enable_worldlines".into(), FlagValue::Bool(false));
    m.insert("enable_worldline_overlay".into(), FlagValue::Bool(false));
    m.insert("enable_modder_hooks".into(), FlagValue::Bool(true));
    m.insert("enable_webhooks".into(), FlagValue::Bool(true));
    m.insert("policy_gate_scheduler".into(), FlagValue::Bool(true));
    m.insert("policy_gate_assets".into(), FlagValue::Bool(false));
    m.insert("lazy_eviction".into(), FlagValue::Bool(false));
    m
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the flag store.
#[derive(Debug, thiserror::Error)]
pub enum FlagError {
    /// Persisting the document failed; the in-memory map was not changed.
    #[error("persist flags to {path}: {source}")]
    Persist {
        /// Target document path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The on-disk document could not be parsed.
    #[error("parse flags document: {0}")]
    Parse(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// FlagStore
// ---------------------------------------------------------------------------

/// Watcher callback: `(name, new_value, previous_value)`.
pub type FlagWatcher = Box<dyn Fn(&str, &FlagValue, Option<&FlagValue>) + Send + Sync>;

/// The process-wide flag store.
///
/// Clone freely; clones share state.
#[derive(Clone)]
pub struct FlagStore {
    inner: Arc<Inner>,
}

struct Inner {
    /// Current snapshot; readers clone the Arc and drop the lock immediately.
    snapshot: RwLock<Arc<BTreeMap<String, FlagValue>>>,
    /// Single serialization point for writes and persistence.
    write_lock: Mutex<()>,
    /// Persisted document path.
    path: PathBuf,
    /// Watchers, called after a durable write.
    watchers: Mutex<Vec<FlagWatcher>>,
    /// Names already warned about, to keep the unknown-flag log quiet.
    warned: Mutex<BTreeSet<String>>,
}

impl FlagStore {
    /// Open the store backed by `path`, overlaying any persisted overrides
    /// on the compile-time defaults. A missing file is not an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FlagError> {
        let path = path.into();
        let mut map = default_flags();
        match std::fs::read(&path) {
            Ok(bytes) => {
                let overrides: BTreeMap<String, FlagValue> = serde_json::from_slice(&bytes)?;
                map.extend(overrides);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(FlagError::Persist { path, source: e });
            }
        }
        Ok(Self {
            inner: Arc::new(Inner {
                snapshot: RwLock::new(Arc::new(map)),
                write_lock: Mutex::new(()),
                path,
                watchers: Mutex::new(Vec::new()),
                warned: Mutex::new(BTreeSet::new()),
            }),
        })
    }

    /// Read a flag. Unknown names read as `Bool(false)` and log one warning.
    pub fn get(&self, name: &str) -> FlagValue {
        let snap = self.snapshot();
        match snap.get(name) {
            Some(v) => v.clone(),
            None => {
                let mut warned = self.inner.warned.lock().expect("flag warn lock");
                if warned.insert(name.to_string()) {
                    warn!(flag = name, "unknown feature flag, defaulting to false");
                }
                FlagValue::Bool(false)
            }
        }
    }

    /// Whether a flag gates open. Unknown names gate closed.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).is_enabled()
    }

    /// Set a flag, returning the previous value.
    ///
    /// The new document is persisted before the in-memory snapshot swaps and
    /// before any watcher runs; a persist failure leaves everything as-is.
    pub fn set(
        &self,
        name: &str,
        value: FlagValue,
    ) -> Result<Option<FlagValue>, FlagError> {
        let _guard = self.inner.write_lock.lock().expect("flag write lock");

        let current = self.snapshot();
        let prev = current.get(name).cloned();

        let mut next = (*current).clone();
        next.insert(name.to_string(), value.clone());
        self.persist(&next)?;

        *self.inner.snapshot.write().expect("flag snapshot lock") = Arc::new(next);

        let watchers = self.inner.watchers.lock().expect("flag watcher lock");
        for w in watchers.iter() {
            w(name, &value, prev.as_ref());
        }
        Ok(prev)
    }

    /// Current full snapshot.
    pub fn snapshot(&self) -> Arc<BTreeMap<String, FlagValue>> {
        Arc::clone(&self.inner.snapshot.read().expect("flag snapshot lock"))
    }

    /// Register a watcher invoked after every durable `set`.
    pub fn subscribe(&self, watcher: FlagWatcher) {
        self.inner
            .watchers
            .lock()
            .expect("flag watcher lock")
            .push(watcher);
    }

    /// Path of the persisted document.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn persist(&self, map: &BTreeMap<String, FlagValue>) -> Result<(), FlagError> {
        let path = &self.inner.path;
        let persist_err = |source| FlagError::Persist {
            path: path.clone(),
            source,
        };

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(persist_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(map)?;
        {
            use std::io::Write as _;
            let mut f = std::fs::File::create(&tmp).map_err(persist_err)?;
            f.write_all(&bytes).map_err(persist_err)?;
            f.sync_all().map_err(persist_err)?;
        }
        std::fs::rename(&tmp, path).map_err(persist_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store(dir: &tempfile::TempDir) -> FlagStore {
        FlagStore::open(dir.path().join("flags.json")).unwrap()
    }

    #[test]
    fn defaults_are_visible() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        assert!(s.is_enabled("enable_compute"));
        assert!(!s.is_enabled("enable_worldlines"));
    }

    #[test]
    fn unknown_flag_reads_false() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        assert_eq!(s.get("no_such_flag"), FlagValue::Bool(false));
        assert!(!s.is_enabled("no_such_flag"));
    }

    #[test]
    fn set_returns_previous_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        let prev = s.set("enable_compute", FlagValue::Bool(false)).unwrap();
        assert_eq!(prev, Some(FlagValue::Bool(true)));

        // A fresh store over the same file sees the override.
        let s2 = store(&tmp);
        assert!(!s2.is_enabled("enable_compute"));
    }

    #[test]
    fn watchers_fire_after_set() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        s.subscribe(Box::new(move |name, value, prev| {
            assert_eq!(name, "enable_webhooks");
            assert_eq!(value, &FlagValue::Bool(false));
            assert_eq!(prev, Some(&FlagValue::Bool(true)));
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        s.set("enable_webhooks", FlagValue::Bool(false)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_persist_leaves_snapshot_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        // Point the document at a path whose parent is a file, so that
        // create_dir_all fails.
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let s = FlagStore::open(blocker.join("flags.json")).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        s.subscribe(Box::new(move |_, _, _| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(s.set("enable_compute", FlagValue::Bool(false)).is_err());
        assert!(s.is_enabled("enable_compute"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn number_and_text_values_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        s.set("scheduler_max_attempts", FlagValue::Number(5.0)).unwrap();
        s.set("render_backend", FlagValue::Text("comfyui".into())).unwrap();

        let s2 = store(&tmp);
        assert_eq!(s2.get("scheduler_max_attempts"), FlagValue::Number(5.0));
        assert_eq!(s2.get("render_backend"), FlagValue::Text("comfyui".into()));
        assert!(s2.is_enabled("render_backend"));
    }

    #[test]
    fn snapshot_is_stable_across_later_sets() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        let snap = s.snapshot();
        s.set("enable_compute", FlagValue::Bool(false)).unwrap();
        assert_eq!(snap.get("enable_compute"), Some(&FlagValue::Bool(true)));
    }
}
