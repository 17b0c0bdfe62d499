// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable kinds for the ComfyVN Studio control
//! plane.
//!
//! Every boundary error carries an [`ErrorKind`] (a machine-readable, stable
//! string tag), a human-readable message, and optional JSON details. Kinds
//! map to HTTP status codes on the daemon and to exit codes on the CLI, so
//! the same value travels untranslated from component to wire to shell.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Stable, machine-readable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Schema or validation failure.
    InvalidInput,
    /// Job, asset, or provider missing.
    NotFound,
    /// Claim race, duplicate uid, concurrent modification.
    Conflict,
    /// Gated off by a feature flag.
    FeatureDisabled,
    /// An advisory block-level finding stopped the action.
    PolicyBlocked,
    /// Per-ip / per-token throttle tripped.
    RateLimited,
    /// Provider down or required component missing.
    DependencyUnavailable,
    /// Caught unexpected failure; a crash report was written.
    InternalError,
}

impl ErrorKind {
    /// HTTP status code for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::FeatureDisabled => 403,
            Self::PolicyBlocked => 423,
            Self::RateLimited => 429,
            Self::DependencyUnavailable => 503,
            Self::InternalError => 500,
        }
    }

    /// CLI process exit code for this kind.
    ///
    /// Usage errors exit 2 via clap before a `StudioError` ever exists.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::FeatureDisabled => 3,
            _ => 4,
        }
    }

    /// The stable wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::FeatureDisabled => "feature_disabled",
            Self::PolicyBlocked => "policy_blocked",
            Self::RateLimited => "rate_limited",
            Self::DependencyUnavailable => "dependency_unavailable",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StudioError
// ---------------------------------------------------------------------------

/// Boundary error: kind + message + optional structured details.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StudioError {
    /// Stable kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Structured context (e.g. the findings behind a policy block).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StudioError {
    /// Build an error with no details.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    // -- Convenience constructors, one per kind ------------------------------

    /// `invalid_input` (400).
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// `not_found` (404).
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// `conflict` (409).
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// `feature_disabled` (403). The message names the gating flag.
    pub fn feature_disabled(flag: &str) -> Self {
        Self::new(
            ErrorKind::FeatureDisabled,
            format!("feature disabled by flag '{flag}'"),
        )
    }

    /// `policy_blocked` (423).
    pub fn policy_blocked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PolicyBlocked, message)
    }

    /// `rate_limited` (429).
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    /// `dependency_unavailable` (503).
    pub fn dependency_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DependencyUnavailable, message)
    }

    /// `internal_error` (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }
}

/// Wire form: `{"error": {"kind": ..., "message": ..., "details": ...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ErrorBody {
    /// The error payload.
    pub error: StudioError,
}

impl From<StudioError> for ErrorBody {
    fn from(error: StudioError) -> Self {
        Self { error }
    }
}
