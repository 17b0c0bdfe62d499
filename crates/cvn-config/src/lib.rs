// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and the on-disk layout for the
//! ComfyVN Studio control plane.
//!
//! This crate provides [`StudioConfig`] — the top-level runtime settings —
//! together with helpers for loading from TOML files, applying `CVN_*`
//! environment overrides, and producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use cvn_budget::BudgetConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The webhook retry ceiling is unusually high.
    ManyWebhookRetries {
        /// Configured attempt count.
        attempts: u32,
    },
    /// The hook history ring is very small; subscribers may miss events.
    TinyHookHistory {
        /// Configured ring size.
        capacity: usize,
    },
    /// A concurrency cap of zero makes the target unschedulable.
    ZeroConcurrency {
        /// Which target.
        target: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::ManyWebhookRetries { attempts } => {
                write!(f, "webhook retry count {attempts} is unusually high")
            }
            ConfigWarning::TinyHookHistory { capacity } => {
                write!(f, "hook history of {capacity} entries may drop context for modders")
            }
            ConfigWarning::ZeroConcurrency { target } => {
                write!(f, "{target} concurrency is 0, jobs there will never run")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Scheduler settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SchedulerSettings {
    /// Execution attempts before a failure is terminal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base retry backoff in milliseconds; doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Grace window for cooperative cancellation, in seconds.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_cancel_grace_secs() -> u64 {
    30
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HookSettings {
    /// Bounded history ring size.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Per-WebSocket-subscriber queue size.
    #[serde(default = "default_ws_queue_capacity")]
    pub ws_queue_capacity: usize,
    /// Webhook delivery attempts.
    #[serde(default = "default_webhook_attempts")]
    pub webhook_attempts: u32,
}

fn default_history_capacity() -> usize {
    10_000
}
fn default_ws_queue_capacity() -> usize {
    256
}
fn default_webhook_attempts() -> u32 {
    5
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            ws_queue_capacity: default_ws_queue_capacity(),
            webhook_attempts: default_webhook_attempts(),
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct StudioConfig {
    /// HTTP bind address.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Root directory for persisted state (`config/`, `data/`, `logs/`).
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Requests allowed per minute per client before `rate_limited`.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    /// Budget limits.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// Event bus settings.
    #[serde(default)]
    pub hooks: HookSettings,
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_root() -> PathBuf {
    PathBuf::from(".comfyvn")
}
fn default_rate_limit() -> u32 {
    600
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            root: default_root(),
            log_level: Some("info".into()),
            rate_limit_per_minute: default_rate_limit(),
            budget: BudgetConfig::default(),
            scheduler: SchedulerSettings::default(),
            hooks: HookSettings::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// On-disk layout
// ---------------------------------------------------------------------------

/// Resolved filesystem layout under the configured root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudioPaths {
    /// `config/flags.json` — persisted feature flags.
    pub flags: PathBuf,
    /// `data/jobs.db` — durable job log.
    pub jobs: PathBuf,
    /// `data/assets/` — media tree with sidecars.
    pub assets: PathBuf,
    /// `data/provenance.log` — append-only provenance rows.
    pub provenance: PathBuf,
    /// `data/hooks.log` — persisted hook history.
    pub hooks: PathBuf,
    /// `logs/server.log` — daemon log.
    pub server_log: PathBuf,
    /// `logs/crash/` — crash reports.
    pub crash_dir: PathBuf,
    /// `logs/playtest/` — playtest traces.
    pub playtest_dir: PathBuf,
}

impl StudioConfig {
    /// Resolve the on-disk layout under `self.root`.
    pub fn paths(&self) -> StudioPaths {
        StudioPaths {
            flags: self.root.join("config/flags.json"),
            jobs: self.root.join("data/jobs.db"),
            assets: self.root.join("data/assets"),
            provenance: self.root.join("data/provenance.log"),
            hooks: self.root.join("data/hooks.log"),
            server_log: self.root.join("logs/server.log"),
            crash_dir: self.root.join("logs/crash"),
            playtest_dir: self.root.join("logs/playtest"),
        }
    }

    /// Semantic validation; returns every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();
        if self.bind.parse::<std::net::SocketAddr>().is_err() {
            reasons.push(format!("bind '{}' is not a socket address", self.bind));
        }
        if let Some(level) = &self.log_level {
            if !VALID_LOG_LEVELS.contains(&level.as_str()) {
                reasons.push(format!("log_level '{level}' is not one of {VALID_LOG_LEVELS:?}"));
            }
        }
        if self.hooks.history_capacity == 0 {
            reasons.push("hooks.history_capacity must be at least 1".to_string());
        }
        if self.hooks.ws_queue_capacity == 0 {
            reasons.push("hooks.ws_queue_capacity must be at least 1".to_string());
        }
        if self.scheduler.max_attempts == 0 {
            reasons.push("scheduler.max_attempts must be at least 1".to_string());
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }

    /// Advisory warnings worth surfacing in `studio doctor`.
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut out = Vec::new();
        if self.hooks.webhook_attempts > 10 {
            out.push(ConfigWarning::ManyWebhookRetries {
                attempts: self.hooks.webhook_attempts,
            });
        }
        if self.hooks.history_capacity < 100 {
            out.push(ConfigWarning::TinyHookHistory {
                capacity: self.hooks.history_capacity,
            });
        }
        if self.budget.concurrent_local_max == 0 {
            out.push(ConfigWarning::ZeroConcurrency {
                target: "local".into(),
            });
        }
        if self.budget.concurrent_remote_max == 0 {
            out.push(ConfigWarning::ZeroConcurrency {
                target: "remote".into(),
            });
        }
        out
    }
}

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`StudioConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`StudioConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<StudioConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => StudioConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`StudioConfig`].
pub fn parse_toml(content: &str) -> Result<StudioConfig, ConfigError> {
    toml::from_str::<StudioConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `CVN_BIND`
/// - `CVN_ROOT`
/// - `CVN_LOG_LEVEL`
pub fn apply_env_overrides(config: &mut StudioConfig) {
    if let Ok(val) = std::env::var("CVN_BIND") {
        config.bind = val;
    }
    if let Ok(val) = std::env::var("CVN_ROOT") {
        config.root = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("CVN_LOG_LEVEL") {
        config.log_level = Some(val);
    }
}
