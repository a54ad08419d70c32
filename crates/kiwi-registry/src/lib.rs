// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-registry
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// HTTP registry client.
pub mod http;
/// Local directory registry.
pub mod local;
/// In-memory registry for tests and embedding.
pub mod memory;

use async_trait::async_trait;
use kiwi_core::{ToolId, ToolVersion};
use kiwi_error::ErrorCode;

pub use http::HttpRegistry;
pub use local::LocalStore;
pub use memory::MemoryStore;

/// Longest chain the raw stored walk will follow.
const MAX_RAW_WALK: usize = 16;

/// Errors from tool store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The tool (or the requested version of it) does not exist.
    #[error("tool not found: {tool_id}{}", .version.as_deref().map(|v| format!("@{v}")).unwrap_or_default())]
    ToolNotFound {
        /// The missing tool id.
        tool_id: ToolId,
        /// The specific version requested, if any.
        version: Option<String>,
    },

    /// The registry could not be reached.
    #[error("registry unavailable: {reason}")]
    RegistryUnavailable {
        /// Human-readable transport failure description.
        reason: String,
    },

    /// A stored document could not be decoded.
    #[error("failed to decode registry document for {tool_id}: {reason}")]
    Decode {
        /// The tool the document belongs to.
        tool_id: ToolId,
        /// Decode failure detail.
        reason: String,
    },
}

impl StoreError {
    /// Map to the stable [`ErrorCode`] taxonomy.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::ToolNotFound { .. } => ErrorCode::ToolNotFound,
            Self::RegistryUnavailable { .. } => ErrorCode::RegistryUnavailable,
            Self::Decode { .. } => ErrorCode::DecodeError,
        }
    }
}

/// Read access to published tool versions.
///
/// The registry contract: documents carry the manifest *and* the file digests
/// (`file_hashes` on the wire) so integrity can be recomputed offline.
/// Implementations never mutate published versions.
#[async_trait]
pub trait ToolStore: Send + Sync {
    /// Fetch the latest published version of a tool, or `None` if unknown.
    async fn latest(&self, tool_id: &ToolId) -> Result<Option<ToolVersion>, StoreError>;

    /// Fetch a specific published version, or `None` if unknown.
    async fn version(
        &self,
        tool_id: &ToolId,
        version: &str,
    ) -> Result<Option<ToolVersion>, StoreError>;

    /// The raw stored walk: follow `executor_id` links from `tool_id` using
    /// latest versions, without verification or cycle diagnostics.
    ///
    /// Stops at the first primitive or at a link with no executor. The chain
    /// resolver layers the full error taxonomy on top of this.
    async fn resolve_chain_raw(&self, tool_id: &ToolId) -> Result<Vec<ToolVersion>, StoreError> {
        let mut chain = Vec::new();
        let mut current = tool_id.clone();
        for _ in 0..MAX_RAW_WALK {
            let Some(tv) = self.latest(&current).await? else {
                return Err(StoreError::ToolNotFound {
                    tool_id: current,
                    version: None,
                });
            };
            let next = tv.executor_id.clone();
            let is_primitive = tv.tool_type.is_primitive();
            chain.push(tv);
            match next {
                Some(next) if !is_primitive => current = next,
                _ => break,
            }
        }
        Ok(chain)
    }
}

/// Pick the greatest SemVer version from `(version, value)` candidates.
///
/// Non-SemVer version strings are skipped; ties cannot occur because
/// versions are unique per tool.
pub(crate) fn pick_latest<T>(candidates: Vec<(String, T)>) -> Option<T> {
    candidates
        .into_iter()
        .filter_map(|(v, t)| semver::Version::parse(&v).ok().map(|sv| (sv, t)))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, t)| t)
}
