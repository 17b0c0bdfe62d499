// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic sidecar serialization and atomic writes.
//!
//! A sidecar is `<path>.asset.json`: the canonical JSON of
//! `{uid, type, meta, provenance}` with sorted keys, a trailing newline,
//! UTF-8 throughout. Writes go through a temp file, fsync, and rename so a
//! crash never leaves a torn sidecar.

use cvn_core::{canonical_json, AssetRecord, ProvenanceRecord};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Suffix appended to the asset path.
pub const SIDECAR_SUFFIX: &str = ".asset.json";
/// Tombstone suffix used during removal.
pub const TOMBSTONE_SUFFIX: &str = ".asset.json.tombstone";

/// Sidecar path for an asset path.
pub fn sidecar_path(asset_path: &Path) -> PathBuf {
    let mut s = asset_path.as_os_str().to_os_string();
    s.push(SIDECAR_SUFFIX);
    PathBuf::from(s)
}

/// The asset path a sidecar belongs to, if `path` is a sidecar.
pub fn asset_path_of(sidecar: &Path) -> Option<PathBuf> {
    let s = sidecar.to_str()?;
    s.strip_suffix(SIDECAR_SUFFIX).map(PathBuf::from)
}

/// Render the deterministic sidecar document.
pub fn render(record: &AssetRecord, provenance: &ProvenanceRecord) -> Result<String, serde_json::Error> {
    let doc = json!({
        "uid": record.uid,
        "type": record.asset_type,
        "meta": record.meta,
        "provenance": provenance,
    });
    let body = canonical_json(&doc).map_err(|e| match e {
        cvn_core::CanonicalError::Serialize(inner) => inner,
    })?;
    Ok(format!("{body}\n"))
}

/// Atomically write `content` to `path` (temp file, fsync, rename).
pub fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(content.as_bytes())?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Remove a sidecar atomically: rename to a tombstone, then unlink.
///
/// A crash between the two steps leaves a tombstone, which `rebuild` prunes;
/// readers never observe a half-deleted sidecar.
pub fn remove_tombstoned(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut t = path.as_os_str().to_os_string();
    t.push(".tombstone");
    let tombstone = PathBuf::from(t);
    std::fs::rename(path, &tombstone)?;
    std::fs::remove_file(&tombstone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cvn_core::AssetType;
    use std::collections::BTreeMap;

    fn record(uid: &str, path: &Path) -> AssetRecord {
        AssetRecord {
            uid: uid.into(),
            asset_type: AssetType::Image,
            path: path.to_path_buf(),
            sidecar_path: sidecar_path(path),
            thumbnail_path: None,
            size_bytes: 3,
            created_at: Utc::now(),
            meta: BTreeMap::new(),
            provenance_id: 1,
        }
    }

    fn provenance(uid: &str) -> ProvenanceRecord {
        ProvenanceRecord {
            id: 1,
            asset_uid: uid.into(),
            source: "test".into(),
            workflow_hash: None,
            seed: None,
            inputs_json: BTreeMap::new(),
            tool: "studio".into(),
            version: "0.1.0".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn sidecar_path_appends_suffix() {
        let p = Path::new("/data/assets/image/a.png");
        assert_eq!(
            sidecar_path(p),
            PathBuf::from("/data/assets/image/a.png.asset.json")
        );
        assert_eq!(asset_path_of(&sidecar_path(p)).unwrap(), p);
    }

    #[test]
    fn render_is_deterministic_and_newline_terminated() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("a.png");
        let rec = record("u1", &p);
        let prov = provenance("u1");
        let a = render(&rec, &prov).unwrap();
        let b = render(&rec, &prov).unwrap();
        assert_eq!(a, b);
        assert!(a.ends_with('\n'));
        assert!(a.starts_with('{'));
    }

    #[test]
    fn write_atomic_then_parse() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("a.png");
        let rec = record("u1", &p);
        let content = render(&rec, &provenance("u1")).unwrap();
        write_atomic(&rec.sidecar_path, &content).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&rec.sidecar_path).unwrap()).unwrap();
        assert_eq!(parsed["uid"], "u1");
        assert_eq!(parsed["type"], "image");
        assert_eq!(parsed["provenance"]["tool"], "studio");
    }

    #[test]
    fn tombstone_removal_deletes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("a.png.asset.json");
        std::fs::write(&p, "{}").unwrap();
        remove_tombstoned(&p).unwrap();
        assert!(!p.exists());
        // Removing again is a no-op.
        remove_tombstoned(&p).unwrap();
    }
}
