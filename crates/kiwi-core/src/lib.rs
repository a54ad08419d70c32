// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for Kiwi.
//!
//! If you only take one dependency, take this one.

/// Resolved executor chains and their structural invariants.
pub mod chain;
/// Canonical JSON serialisation and package integrity hashing.
pub mod hash;
/// Manifest wrapper with typed accessors.
pub mod manifest;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use chain::{ChainIssue, ResolvedChain};
pub use hash::{canonical_json, integrity, sha256_hex};
pub use manifest::{ChildSchemaRule, Manifest, ParameterSpec, RetrySpec};

/// Tool id of the built-in subprocess primitive.
pub const SUBPROCESS_TOOL_ID: &str = "subprocess";

/// Tool id of the built-in HTTP client primitive.
pub const HTTP_CLIENT_TOOL_ID: &str = "http_client";

/// Error returned when a tool id fails the identifier pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid tool id {id:?}: must match ^[a-z][a-z0-9_]*$")]
pub struct InvalidToolId {
    /// The rejected identifier.
    pub id: String,
}

/// Logical tool identity.
///
/// Validated at construction: lowercase ASCII letter first, then lowercase
/// letters, digits, or underscores (`^[a-z][a-z0-9_]*$`).
///
/// # Examples
///
/// ```
/// use kiwi_core::ToolId;
///
/// let id = ToolId::new("python_runtime").unwrap();
/// assert_eq!(id.as_str(), "python_runtime");
/// assert!(ToolId::new("Bad-Id").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String", into = "String")]
pub struct ToolId(String);

impl ToolId {
    /// Validate and wrap a tool identifier.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidToolId`] when the string does not match the pattern.
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidToolId> {
        let id = id.into();
        let mut chars = id.chars();
        let valid = match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {
                chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            }
            _ => false,
        };
        if valid { Ok(Self(id)) } else { Err(InvalidToolId { id }) }
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ToolId {
    type Error = InvalidToolId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ToolId> for String {
    fn from(id: ToolId) -> Self {
        id.0
    }
}

impl std::str::FromStr for ToolId {
    type Err = InvalidToolId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of tool package.
///
/// Only [`ToolType::Primitive`] tools execute inside the runtime itself;
/// every other kind delegates to its executor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    /// Executed by the runtime itself (`subprocess` or `http_client`).
    Primitive,
    /// A language or framework runtime (e.g. a Python runner).
    Runtime,
    /// A script executed through a runtime.
    Script,
    /// A service-level API tool.
    Api,
    /// A plain HTTP tool.
    Http,
    /// A connector to an MCP server.
    McpConnector,
    /// A tool exposed by an MCP server.
    McpTool,
    /// A capability grant package.
    Capability,
    /// A loadable streaming sink.
    RuntimeSink,
}

impl ToolType {
    /// Returns `true` for [`ToolType::Primitive`].
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(self, Self::Primitive)
    }
}

/// A single payload file of a tool version: path plus content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FileEntry {
    /// Path of the file relative to the package root.
    pub path: String,
    /// Hex-encoded SHA-256 of the file contents.
    pub sha256: String,
    /// Whether the file carries the executable bit.
    #[serde(default)]
    pub is_executable: bool,
}

/// One immutable published version of a tool.
///
/// `(tool_id, version)` is the identity; `integrity` is the canonical SHA-256
/// over the manifest and file digests (see [`hash::integrity`]). Versions are
/// never mutated after publish — the verifier treats any drift between stored
/// and recomputed integrity as tampering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolVersion {
    /// Logical tool identity.
    pub tool_id: ToolId,

    /// SemVer version string.
    pub version: String,

    /// Kind of tool package.
    pub tool_type: ToolType,

    /// The tool this one delegates to; `None` iff `tool_type` is primitive.
    pub executor_id: Option<ToolId>,

    /// Free-form category used to group lockfiles.
    #[serde(default)]
    pub category: Option<String>,

    /// The declarative manifest document.
    pub manifest: Manifest,

    /// Payload file digests (`file_hashes` on the registry wire).
    #[serde(default, alias = "file_hashes")]
    pub files: Vec<FileEntry>,

    /// Legacy content hash (computed the same way as `integrity`).
    pub content_hash: String,

    /// Canonical package integrity (hex SHA-256).
    pub integrity: String,

    /// Publish timestamp.
    pub created_at: DateTime<Utc>,
}

impl ToolVersion {
    /// Recompute this version's integrity from its manifest and files.
    ///
    /// # Errors
    ///
    /// Returns [`hash::HashError`] if the manifest cannot be serialised.
    pub fn recompute_integrity(&self) -> Result<String, hash::HashError> {
        hash::integrity(&self.tool_id, &self.version, &self.manifest, &self.files)
    }
}

/// Builder for constructing [`ToolVersion`]s ergonomically.
///
/// Computes `integrity` and `content_hash` from the supplied manifest and
/// files, so tests and publishers cannot produce an inconsistent package by
/// accident.
///
/// # Examples
///
/// ```
/// use kiwi_core::{ToolType, ToolVersionBuilder};
///
/// let tv = ToolVersionBuilder::new("subprocess", "1.0.0", ToolType::Primitive)
///     .config(serde_json::json!({"timeout_ms": 300_000}))
///     .build()
///     .unwrap();
///
/// assert_eq!(tv.integrity, tv.recompute_integrity().unwrap());
/// assert_eq!(tv.content_hash, tv.integrity);
/// ```
#[derive(Debug)]
pub struct ToolVersionBuilder {
    tool_id: String,
    version: String,
    tool_type: ToolType,
    executor_id: Option<String>,
    category: Option<String>,
    manifest_extra: serde_json::Map<String, serde_json::Value>,
    config: serde_json::Value,
    files: Vec<FileEntry>,
}

impl ToolVersionBuilder {
    /// Start a builder for `(tool_id, version)` of the given type.
    #[must_use]
    pub fn new(tool_id: impl Into<String>, version: impl Into<String>, tool_type: ToolType) -> Self {
        Self {
            tool_id: tool_id.into(),
            version: version.into(),
            tool_type,
            executor_id: None,
            category: None,
            manifest_extra: serde_json::Map::new(),
            config: serde_json::Value::Object(serde_json::Map::new()),
            files: Vec::new(),
        }
    }

    /// Set the executor this tool delegates to.
    #[must_use]
    pub fn executor(mut self, executor_id: impl Into<String>) -> Self {
        self.executor_id = Some(executor_id.into());
        self
    }

    /// Set the lockfile category.
    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set the manifest `config` mapping.
    #[must_use]
    pub fn config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Insert an arbitrary top-level manifest field.
    #[must_use]
    pub fn manifest_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.manifest_extra.insert(key.into(), value);
        self
    }

    /// Append a payload file entry.
    #[must_use]
    pub fn file(mut self, path: impl Into<String>, sha256: impl Into<String>) -> Self {
        self.files.push(FileEntry {
            path: path.into(),
            sha256: sha256.into(),
            is_executable: false,
        });
        self
    }

    /// Append an executable payload file entry.
    #[must_use]
    pub fn executable_file(mut self, path: impl Into<String>, sha256: impl Into<String>) -> Self {
        self.files.push(FileEntry {
            path: path.into(),
            sha256: sha256.into(),
            is_executable: true,
        });
        self
    }

    /// Consume the builder and produce a [`ToolVersion`].
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvalidToolId`] for a malformed id and
    /// [`BuildError::Hash`] if the manifest cannot be serialised.
    pub fn build(self) -> Result<ToolVersion, BuildError> {
        let tool_id = ToolId::new(self.tool_id)?;
        let executor_id = self.executor_id.map(ToolId::new).transpose()?;

        let mut doc = self.manifest_extra;
        doc.insert("tool_id".into(), serde_json::Value::String(tool_id.to_string()));
        doc.insert("version".into(), serde_json::Value::String(self.version.clone()));
        doc.insert(
            "tool_type".into(),
            serde_json::to_value(self.tool_type).map_err(hash::HashError::Json)?,
        );
        doc.insert(
            "executor".into(),
            match &executor_id {
                Some(id) => serde_json::Value::String(id.to_string()),
                None => serde_json::Value::Null,
            },
        );
        doc.insert("config".into(), self.config);
        let manifest = Manifest::from(doc);

        let integrity = hash::integrity(&tool_id, &self.version, &manifest, &self.files)?;
        Ok(ToolVersion {
            tool_id,
            version: self.version,
            tool_type: self.tool_type,
            executor_id,
            category: self.category,
            manifest,
            files: self.files,
            content_hash: integrity.clone(),
            integrity,
            created_at: Utc::now(),
        })
    }
}

/// Errors from [`ToolVersionBuilder::build`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A tool or executor id failed validation.
    #[error(transparent)]
    InvalidToolId(#[from] InvalidToolId),

    /// The manifest could not be serialised for hashing.
    #[error(transparent)]
    Hash(#[from] hash::HashError),
}
