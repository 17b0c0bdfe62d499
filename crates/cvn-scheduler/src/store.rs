// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable job store: a single-writer JSONL append log.
//!
//! Every state transition appends the full record and fsyncs before the
//! matching hook is published; replay takes the last line per job id. The
//! log is compacted on open so restarts do not accrete history forever.

use cvn_core::{JobId, JobRecord};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::warn;

/// Errors from the job store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("job store at {path}: {source}")]
    Io {
        /// Store path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Record serialization failure.
    #[error("job store serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Single-writer append log of job records.
pub struct JobStore {
    path: PathBuf,
    file: std::fs::File,
}

impl JobStore {
    /// Open the store, replaying surviving records (last line per id wins).
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, BTreeMap<JobId, JobRecord>), StoreError> {
        let path = path.into();
        let io = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io)?;
        }

        let mut jobs: BTreeMap<JobId, JobRecord> = BTreeMap::new();
        match std::fs::File::open(&path) {
            Ok(f) => {
                for line in std::io::BufReader::new(f).lines() {
                    let line = line.map_err(io)?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JobRecord>(&line) {
                        Ok(record) => {
                            jobs.insert(record.id.clone(), record);
                        }
                        Err(e) => warn!(error = %e, "skipping corrupt job store line"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io(e)),
        }

        // Compact: one line per surviving job.
        let mut out = Vec::new();
        for record in jobs.values() {
            serde_json::to_writer(&mut out, record)?;
            out.push(b'\n');
        }
        std::fs::write(&path, &out).map_err(io)?;

        let file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(io)?;
        Ok((Self { path, file }, jobs))
    }

    /// Append a record snapshot durably (write + fsync).
    pub fn append(&mut self, record: &JobRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let io = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.write_all(b"\n"))
            .and_then(|()| self.file.sync_data())
            .map_err(io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvn_core::{JobSpec, JobState, Target};

    fn spec() -> JobSpec {
        JobSpec {
            kind: "render".into(),
            priority: 0,
            target: Target::Local,
            device_hint: None,
            sticky_key: None,
            input: BTreeMap::new(),
            cost_hint: Default::default(),
            tags: Default::default(),
            provenance_inputs: BTreeMap::new(),
            deadline: None,
        }
    }

    #[test]
    fn replay_takes_last_line_per_job() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("jobs.db");

        let id = JobId::new();
        {
            let (mut store, jobs) = JobStore::open(&path).unwrap();
            assert!(jobs.is_empty());
            let mut record = JobRecord::new(id.clone(), spec(), 1);
            store.append(&record).unwrap();
            record.state = JobState::Queued;
            store.append(&record).unwrap();
        }

        let (_, jobs) = JobStore::open(&path).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[&id].state, JobState::Queued);
    }

    #[test]
    fn compaction_rewrites_to_one_line_per_job() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("jobs.db");
        {
            let (mut store, _) = JobStore::open(&path).unwrap();
            let mut record = JobRecord::new(JobId::new(), spec(), 1);
            for state in [JobState::Queued, JobState::Claimed, JobState::Running] {
                record.state = state;
                store.append(&record).unwrap();
            }
        }
        let _ = JobStore::open(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("jobs.db");
        let record = JobRecord::new(JobId::new(), spec(), 1);
        let good = serde_json::to_string(&record).unwrap();
        std::fs::write(&path, format!("{good}\nnot-json\n")).unwrap();

        let (_, jobs) = JobStore::open(&path).unwrap();
        assert_eq!(jobs.len(), 1);
    }
}
