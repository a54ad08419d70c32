// SPDX-License-Identifier: MIT OR Apache-2.0
//! Local directory registry.
//!
//! Layout: `<root>/<tool_id>/<version>.json`, one registry document per
//! published version. Offline-first: the same wire contract as the HTTP
//! registry, read from disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kiwi_core::{ToolId, ToolVersion};
use tracing::debug;

use crate::{StoreError, ToolStore, pick_latest};

/// A registry rooted in a local directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a store rooted at the given directory.
    ///
    /// The directory does not have to exist yet; a missing root simply reads
    /// as an empty catalog.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Publish a version document to disk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RegistryUnavailable`] when the directory cannot
    /// be created or the file cannot be written.
    pub fn put(&self, version: &ToolVersion) -> Result<PathBuf, StoreError> {
        let dir = self.root.join(version.tool_id.as_str());
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::RegistryUnavailable {
            reason: format!("create {}: {e}", dir.display()),
        })?;
        let path = dir.join(format!("{}.json", version.version));
        let json =
            serde_json::to_string_pretty(version).map_err(|e| StoreError::Decode {
                tool_id: version.tool_id.clone(),
                reason: e.to_string(),
            })?;
        std::fs::write(&path, json).map_err(|e| StoreError::RegistryUnavailable {
            reason: format!("write {}: {e}", path.display()),
        })?;
        debug!(target: "kiwi.registry", tool = %version.tool_id, version = %version.version, "published to local store");
        Ok(path)
    }

    fn read_doc(&self, tool_id: &ToolId, path: &Path) -> Result<ToolVersion, StoreError> {
        let json = std::fs::read_to_string(path).map_err(|e| StoreError::RegistryUnavailable {
            reason: format!("read {}: {e}", path.display()),
        })?;
        serde_json::from_str(&json).map_err(|e| StoreError::Decode {
            tool_id: tool_id.clone(),
            reason: e.to_string(),
        })
    }

    fn list_versions(&self, tool_id: &ToolId) -> Result<Vec<(String, PathBuf)>, StoreError> {
        let dir = self.root.join(tool_id.as_str());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::RegistryUnavailable {
                    reason: format!("read {}: {e}", dir.display()),
                });
            }
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::RegistryUnavailable {
                reason: format!("read {}: {e}", dir.display()),
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                versions.push((stem.to_string(), path));
            }
        }
        Ok(versions)
    }
}

#[async_trait]
impl ToolStore for LocalStore {
    async fn latest(&self, tool_id: &ToolId) -> Result<Option<ToolVersion>, StoreError> {
        let versions = self.list_versions(tool_id)?;
        let Some(path) = pick_latest(versions) else {
            return Ok(None);
        };
        self.read_doc(tool_id, &path).map(Some)
    }

    async fn version(
        &self,
        tool_id: &ToolId,
        version: &str,
    ) -> Result<Option<ToolVersion>, StoreError> {
        let path = self
            .root
            .join(tool_id.as_str())
            .join(format!("{version}.json"));
        if !path.exists() {
            return Ok(None);
        }
        self.read_doc(tool_id, &path).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_core::{ToolType, ToolVersionBuilder};

    fn tool(id: &str, version: &str) -> ToolVersion {
        ToolVersionBuilder::new(id, version, ToolType::Primitive)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn put_then_latest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.put(&tool("subprocess", "1.0.0")).unwrap();
        store.put(&tool("subprocess", "1.4.0")).unwrap();

        let id: ToolId = "subprocess".parse().unwrap();
        let latest = store.latest(&id).await.unwrap().unwrap();
        assert_eq!(latest.version, "1.4.0");
        assert_eq!(latest.integrity, latest.recompute_integrity().unwrap());
    }

    #[tokio::test]
    async fn missing_root_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("does-not-exist"));
        let id: ToolId = "subprocess".parse().unwrap();
        assert!(store.latest(&id).await.unwrap().is_none());
        assert!(store.version(&id, "1.0.0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_document_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let tool_dir = dir.path().join("broken");
        std::fs::create_dir_all(&tool_dir).unwrap();
        std::fs::write(tool_dir.join("1.0.0.json"), "{not json").unwrap();

        let id: ToolId = "broken".parse().unwrap();
        let err = store.version(&id, "1.0.0").await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }

    #[tokio::test]
    async fn non_json_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.put(&tool("subprocess", "1.0.0")).unwrap();
        std::fs::write(dir.path().join("subprocess/README.txt"), "notes").unwrap();

        let id: ToolId = "subprocess".parse().unwrap();
        let latest = store.latest(&id).await.unwrap().unwrap();
        assert_eq!(latest.version, "1.0.0");
    }
}
