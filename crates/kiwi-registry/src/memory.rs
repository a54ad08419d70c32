// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory registry for tests and embedding.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use kiwi_core::{ToolId, ToolVersion};

use crate::{StoreError, ToolStore, pick_latest};

/// A `BTreeMap`-backed registry.
///
/// Useful for tests and for embedding a pre-seeded catalog. Publishing is an
/// inherent method (the [`ToolStore`] trait itself is read-only), and
/// [`MemoryStore::tamper`] exists so integrity tests can corrupt a stored
/// document the way a compromised registry would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tools: RwLock<BTreeMap<String, BTreeMap<String, ToolVersion>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a tool version, replacing any existing `(tool_id, version)`.
    pub fn publish(&self, version: ToolVersion) {
        let mut tools = self.tools.write().expect("memory store lock poisoned");
        tools
            .entry(version.tool_id.to_string())
            .or_default()
            .insert(version.version.clone(), version);
    }

    /// Mutate a stored version in place.
    ///
    /// Published versions are immutable by contract; this simulates registry
    /// tampering for integrity tests. Returns `false` when the entry does
    /// not exist.
    pub fn tamper(
        &self,
        tool_id: &ToolId,
        version: &str,
        mutate: impl FnOnce(&mut ToolVersion),
    ) -> bool {
        let mut tools = self.tools.write().expect("memory store lock poisoned");
        match tools
            .get_mut(tool_id.as_str())
            .and_then(|versions| versions.get_mut(version))
        {
            Some(tv) => {
                mutate(tv);
                true
            }
            None => false,
        }
    }

    /// Number of published `(tool_id, version)` entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let tools = self.tools.read().expect("memory store lock poisoned");
        tools.values().map(BTreeMap::len).sum()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ToolStore for MemoryStore {
    async fn latest(&self, tool_id: &ToolId) -> Result<Option<ToolVersion>, StoreError> {
        let tools = self.tools.read().expect("memory store lock poisoned");
        let Some(versions) = tools.get(tool_id.as_str()) else {
            return Ok(None);
        };
        let candidates = versions
            .iter()
            .map(|(v, tv)| (v.clone(), tv.clone()))
            .collect();
        Ok(pick_latest(candidates))
    }

    async fn version(
        &self,
        tool_id: &ToolId,
        version: &str,
    ) -> Result<Option<ToolVersion>, StoreError> {
        let tools = self.tools.read().expect("memory store lock poisoned");
        Ok(tools
            .get(tool_id.as_str())
            .and_then(|versions| versions.get(version))
            .cloned())
    }
}
