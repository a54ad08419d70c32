// SPDX-License-Identifier: MIT OR Apache-2.0

//! Canonical JSON serialisation and package integrity hashing.
//!
//! Integrity covers `{tool_id, version, manifest, files[]}` serialised as
//! canonical JSON: object keys sorted recursively, compact separators, UTF-8.
//! `files` are sorted by `path` before serialisation so the digest is stable
//! under any arrival order. No wall-clock or random input participates.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::manifest::Manifest;
use crate::{FileEntry, ToolId};

/// Errors from canonical serialisation.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// JSON serialisation failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Produce a deterministic JSON string for hashing.
///
/// This is not a full JCS implementation, but it is stable for our types:
/// - keys are sorted (serde_json `Map` is a `BTreeMap` by default)
/// - numbers are serialized consistently by serde_json
///
/// # Errors
///
/// Returns [`HashError::Json`] if the value cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, HashError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compute the canonical integrity of a tool version.
///
/// # Examples
///
/// ```
/// use kiwi_core::{integrity, Manifest, ToolId};
///
/// let id: ToolId = "weather".parse().unwrap();
/// let manifest = Manifest::from(serde_json::Map::new());
/// let a = integrity(&id, "1.0.0", &manifest, &[]).unwrap();
/// let b = integrity(&id, "1.0.0", &manifest, &[]).unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
///
/// # Errors
///
/// Returns [`HashError::Json`] if the manifest cannot be serialized.
pub fn integrity(
    tool_id: &ToolId,
    version: &str,
    manifest: &Manifest,
    files: &[FileEntry],
) -> Result<String, HashError> {
    let mut files: Vec<&FileEntry> = files.iter().collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let payload = serde_json::json!({
        "tool_id": tool_id,
        "version": version,
        "manifest": manifest,
        "files": files,
    });
    let json = serde_json::to_string(&payload)?;
    Ok(sha256_hex(json.as_bytes()))
}
