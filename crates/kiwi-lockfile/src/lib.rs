// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-lockfile
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Scoped lockfile storage and the `.index.json`.
pub mod manager;

use chrono::{DateTime, Utc};
use kiwi_core::{ResolvedChain, ToolId, sha256_hex};
use kiwi_error::ErrorCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use manager::{IndexEntry, LockfileIndex, LockfileManager, Scope};

/// The lockfile format version this crate writes.
pub const LOCKFILE_VERSION: u32 = 1;

/// Hex chars of the chain hash kept in names and indexes.
pub const CHAIN_HASH_LEN: usize = 12;

/// Errors from the lockfile subsystem.
#[derive(Debug, thiserror::Error)]
pub enum LockfileError {
    /// A lockfile on disk could not be parsed.
    #[error("lockfile corrupt at {path}: {reason}")]
    Corrupt {
        /// Path of the unreadable file.
        path: String,
        /// Parse failure detail.
        reason: String,
    },

    /// The fresh chain diverges from the pinned chain.
    #[error("lockfile mismatch: {}", .diffs.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Mismatch {
        /// Per-link divergences.
        diffs: Vec<ChainDiff>,
    },

    /// Filesystem access failed.
    #[error("lockfile I/O failed ({context}): {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// OS-level failure.
        #[source]
        source: std::io::Error,
    },
}

impl LockfileError {
    /// Map to the stable [`ErrorCode`] taxonomy.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Corrupt { .. } => ErrorCode::LockfileCorrupt,
            Self::Mismatch { .. } => ErrorCode::LockfileMismatch,
            Self::Io { .. } => ErrorCode::LockfileIo,
        }
    }
}

/// One divergence between a pinned link and the fresh chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainDiff {
    /// The pinned tool is absent from the fresh chain.
    MissingLink {
        /// The pinned tool.
        tool_id: ToolId,
    },
    /// The fresh chain carries a different version of the pinned tool.
    VersionChanged {
        /// The pinned tool.
        tool_id: ToolId,
        /// Version recorded in the lockfile.
        pinned: String,
        /// Version in the fresh chain.
        fresh: String,
    },
    /// Same version, different integrity — the package was republished.
    IntegrityChanged {
        /// The pinned tool.
        tool_id: ToolId,
        /// Integrity recorded in the lockfile.
        pinned: String,
        /// Integrity in the fresh chain.
        fresh: String,
    },
}

impl std::fmt::Display for ChainDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingLink { tool_id } => write!(f, "{tool_id} missing from fresh chain"),
            Self::VersionChanged {
                tool_id,
                pinned,
                fresh,
            } => write!(f, "{tool_id} version {pinned} -> {fresh}"),
            Self::IntegrityChanged {
                tool_id,
                pinned,
                fresh,
            } => write!(f, "{tool_id} integrity {pinned} -> {fresh}"),
        }
    }
}

/// The pinned root of a lockfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LockfileRoot {
    /// The requested leaf tool.
    pub tool_id: ToolId,
    /// Its pinned version.
    pub version: String,
    /// Its pinned integrity.
    pub integrity: String,
}

/// One pinned chain link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LockedTool {
    /// The link's tool id.
    pub tool_id: ToolId,
    /// Pinned version.
    pub version: String,
    /// Pinned integrity.
    pub integrity: String,
    /// The executor the link delegates to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ToolId>,
}

/// Where the pinned chain was resolved from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RegistryRef {
    /// Registry URL or local path.
    pub url: String,
    /// When the chain was fetched.
    pub fetched_at: DateTime<Utc>,
}

/// A pinned, verified snapshot of a resolved chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Lockfile {
    /// Format version; always [`LOCKFILE_VERSION`].
    pub lockfile_version: u32,
    /// When the lockfile was frozen (UTC, RFC 3339).
    pub generated_at: DateTime<Utc>,
    /// The pinned root tool.
    pub root: LockfileRoot,
    /// Every chain link, leaf first.
    pub resolved_chain: Vec<LockedTool>,
    /// Where the chain came from.
    pub registry: RegistryRef,
    /// First [`CHAIN_HASH_LEN`] hex chars of the chain digest.
    pub chain_hash: String,
}

impl Lockfile {
    /// Pin a freshly resolved chain.
    ///
    /// `generated_at` and `registry.fetched_at` are stamped now (UTC).
    ///
    /// # Panics
    ///
    /// Panics if the chain is empty — callers freeze only checked chains.
    #[must_use]
    pub fn from_chain(chain: &ResolvedChain, registry_url: impl Into<String>) -> Self {
        let leaf = chain.leaf().expect("cannot freeze an empty chain");
        let resolved_chain: Vec<LockedTool> = chain
            .iter()
            .map(|tv| LockedTool {
                tool_id: tv.tool_id.clone(),
                version: tv.version.clone(),
                integrity: tv.integrity.clone(),
                executor: tv.executor_id.clone(),
            })
            .collect();
        let now = Utc::now();

        Self {
            lockfile_version: LOCKFILE_VERSION,
            generated_at: now,
            root: LockfileRoot {
                tool_id: leaf.tool_id.clone(),
                version: leaf.version.clone(),
                integrity: leaf.integrity.clone(),
            },
            chain_hash: chain_hash(&resolved_chain),
            resolved_chain,
            registry: RegistryRef {
                url: registry_url.into(),
                fetched_at: now,
            },
        }
    }

    /// Require every pinned link to appear in the fresh chain with identical
    /// version and integrity.
    ///
    /// # Errors
    ///
    /// Returns [`LockfileError::Mismatch`] listing every divergence.
    pub fn validate_chain(&self, fresh: &ResolvedChain) -> Result<(), LockfileError> {
        let mut diffs = Vec::new();
        for pinned in &self.resolved_chain {
            match fresh.iter().find(|tv| tv.tool_id == pinned.tool_id) {
                None => diffs.push(ChainDiff::MissingLink {
                    tool_id: pinned.tool_id.clone(),
                }),
                Some(tv) if tv.version != pinned.version => diffs.push(ChainDiff::VersionChanged {
                    tool_id: pinned.tool_id.clone(),
                    pinned: pinned.version.clone(),
                    fresh: tv.version.clone(),
                }),
                Some(tv) if tv.integrity != pinned.integrity => {
                    diffs.push(ChainDiff::IntegrityChanged {
                        tool_id: pinned.tool_id.clone(),
                        pinned: pinned.integrity.clone(),
                        fresh: tv.integrity.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        if diffs.is_empty() {
            Ok(())
        } else {
            Err(LockfileError::Mismatch { diffs })
        }
    }
}

/// First [`CHAIN_HASH_LEN`] hex chars of the sha256 over the pipe-joined
/// `tool_id@version:integrity` of all links.
#[must_use]
pub fn chain_hash(links: &[LockedTool]) -> String {
    let joined = links
        .iter()
        .map(|l| format!("{}@{}:{}", l.tool_id, l.version, l.integrity))
        .collect::<Vec<_>>()
        .join("|");
    sha256_hex(joined.as_bytes())[..CHAIN_HASH_LEN].to_string()
}
