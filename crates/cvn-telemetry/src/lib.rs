// SPDX-License-Identifier: MIT OR Apache-2.0
//! Logging setup and crash reporting.
//!
//! `init_logging` wires a `tracing-subscriber` with an env filter and an
//! optional file writer; `write_crash_report` dumps an unexpected failure to
//! `logs/crash/<ts>.json` with sensitive payload keys redacted before the
//! boundary returns `internal_error`.

#![deny(unsafe_code)]

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Payload keys whose values never reach a crash report.
const REDACTED_KEYS: &[&str] = &["secret", "token", "password", "authorization", "api_key"];

/// Errors from telemetry setup or crash dumping.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Filesystem failure.
    #[error("telemetry io at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Report serialization failure.
    #[error("crash report serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Initialise the global tracing subscriber.
///
/// `level` feeds the env filter (the `CVN_LOG` variable wins when set);
/// with `log_file` present, output is appended there instead of stderr.
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_env("CVN_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("cvn={level},studio={level}")));

    match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(|source| TelemetryError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| TelemetryError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        }
    }
    Ok(())
}

/// A crash report as written to disk.
#[derive(Debug, Serialize)]
struct CrashReport<'a> {
    at: String,
    kind: &'a str,
    message: &'a str,
    payload: serde_json::Value,
}

/// Write a crash report to `crash_dir/<ts>.json`, returning its path.
///
/// The payload is redacted first: any key containing a sensitive word (see
/// [`REDACTED_KEYS`]) has its value replaced with `"[redacted]"`, at any
/// nesting depth.
pub fn write_crash_report(
    crash_dir: &Path,
    kind: &str,
    message: &str,
    payload: serde_json::Value,
) -> Result<PathBuf, TelemetryError> {
    std::fs::create_dir_all(crash_dir).map_err(|source| TelemetryError::Io {
        path: crash_dir.to_path_buf(),
        source,
    })?;

    let now = Utc::now();
    let report = CrashReport {
        at: now.to_rfc3339(),
        kind,
        message,
        payload: redact(payload),
    };

    // Nanosecond stamp keeps concurrent crashes from colliding.
    let path = crash_dir.join(format!("{}.json", now.format("%Y%m%dT%H%M%S%.9f")));
    let bytes = serde_json::to_vec_pretty(&report)?;
    std::fs::write(&path, bytes).map_err(|source| TelemetryError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

fn redact(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let lower = k.to_lowercase();
                    if REDACTED_KEYS.iter().any(|r| lower.contains(r)) {
                        (k, serde_json::Value::String("[redacted]".into()))
                    } else {
                        (k, redact(v))
                    }
                })
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(redact).collect())
        }
        other => other,
    }
}
