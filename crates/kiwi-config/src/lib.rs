// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the Kiwi runtime.
//!
//! This crate provides [`KiwiConfig`] — the runtime settings — together with
//! helpers for loading from TOML files, merging overlays, and producing
//! advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

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
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// The prune threshold keeps lockfiles for an unusually long time.
    LargePruneAge {
        /// Configured threshold in days.
        days: u32,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargePruneAge { days } => {
                write!(f, "prune_max_age_days is large ({days} days)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Where tools are fetched from.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistrySource {
    /// A remote HTTP registry.
    Http {
        /// Base URL, no trailing slash.
        url: String,
    },
    /// A local directory registry.
    Local {
        /// Directory path.
        path: String,
    },
}

/// How a lockfile drift is handled at execution time.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockfileMode {
    /// Log and surface the mismatch, then continue.
    #[default]
    Warn,
    /// Fail the call on any mismatch.
    Strict,
}

/// Top-level runtime configuration for Kiwi.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct KiwiConfig {
    /// Tool registry to resolve against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistrySource>,

    /// Project directory holding project-scope lockfiles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_dir: Option<String>,

    /// User config directory holding user-scope lockfiles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_dir: Option<String>,

    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Default lockfile drift handling.
    #[serde(default)]
    pub lockfile_mode: LockfileMode,

    /// Age threshold for `lockfiles prune`, in days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prune_max_age_days: Option<u32>,
}

impl Default for KiwiConfig {
    fn default() -> Self {
        Self {
            registry: None,
            project_dir: None,
            user_dir: None,
            log_level: Some("info".into()),
            lockfile_mode: LockfileMode::Warn,
            prune_max_age_days: Some(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Threshold above which a prune age generates a warning.
const LARGE_PRUNE_AGE_DAYS: u32 = 365;

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`KiwiConfig`] from an optional TOML file path.
///
/// `None` yields the defaults.
///
/// # Errors
///
/// Returns [`ConfigError::FileNotFound`] or [`ConfigError::ParseError`].
pub fn load_config(path: Option<&Path>) -> Result<KiwiConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(KiwiConfig::default());
    };
    let text = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.display().to_string(),
    })?;
    toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

impl KiwiConfig {
    /// Semantic validation: hard failures plus advisory warnings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] listing every problem.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();

        if let Some(level) = &self.log_level
            && !VALID_LOG_LEVELS.contains(&level.as_str())
        {
            reasons.push(format!("unknown log level: {level}"));
        }

        match &self.registry {
            Some(RegistrySource::Http { url }) => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    reasons.push(format!("registry url must be http(s): {url}"));
                }
            }
            Some(RegistrySource::Local { path }) => {
                if path.is_empty() {
                    reasons.push("registry path must not be empty".into());
                }
            }
            None => warnings.push(ConfigWarning::MissingOptionalField {
                field: "registry".into(),
                hint: "resolution will use the in-memory store only".into(),
            }),
        }

        match self.prune_max_age_days {
            Some(0) => reasons.push("prune_max_age_days must be positive".into()),
            Some(days) if days > LARGE_PRUNE_AGE_DAYS => {
                warnings.push(ConfigWarning::LargePruneAge { days });
            }
            _ => {}
        }

        if self.user_dir.is_none() {
            warnings.push(ConfigWarning::MissingOptionalField {
                field: "user_dir".into(),
                hint: "user-scope lockfiles will be unavailable".into(),
            });
        }

        if reasons.is_empty() {
            Ok(warnings)
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }

    /// Merge an overlay config: set fields in `overlay` win.
    #[must_use]
    pub fn merged_with(mut self, overlay: KiwiConfig) -> KiwiConfig {
        if overlay.registry.is_some() {
            self.registry = overlay.registry;
        }
        if overlay.project_dir.is_some() {
            self.project_dir = overlay.project_dir;
        }
        if overlay.user_dir.is_some() {
            self.user_dir = overlay.user_dir;
        }
        if overlay.log_level.is_some() {
            self.log_level = overlay.log_level;
        }
        if overlay.lockfile_mode != LockfileMode::default() {
            self.lockfile_mode = overlay.lockfile_mode;
        }
        if overlay.prune_max_age_days.is_some() {
            self.prune_max_age_days = overlay.prune_max_age_days;
        }
        self
    }
}
