// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chain resolution with caching.
//!
//! Walks `executor_id` links leaf→primitive against the store's latest
//! versions. Resolved chains are cached per root tool id; publishing any tool
//! evicts every cached chain that contains it.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use kiwi_core::{ChainIssue, ResolvedChain, ToolId};
use kiwi_error::ErrorCode;
use kiwi_registry::{StoreError, ToolStore};
use tracing::{debug, warn};

/// Hard cap on executor chain length.
pub const MAX_CHAIN_DEPTH: usize = 16;

/// Errors from chain resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The store failed or the tool is unknown.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A non-primitive tool declares no executor.
    #[error("tool {tool_id} is a {tool_type:?} but declares no executor")]
    MissingExecutor {
        /// The offending tool.
        tool_id: ToolId,
        /// Its tool type.
        tool_type: kiwi_core::ToolType,
    },

    /// The executor graph loops back on itself.
    #[error("executor cycle detected at {tool_id}")]
    CycleDetected {
        /// The tool that was reached twice.
        tool_id: ToolId,
    },

    /// The chain exceeds [`MAX_CHAIN_DEPTH`].
    #[error("executor chain from {root} exceeds {MAX_CHAIN_DEPTH} links")]
    ChainTooDeep {
        /// The requested root tool.
        root: ToolId,
    },

    /// The resolved chain violates a structural invariant.
    #[error("resolved chain is malformed: {0}")]
    Malformed(#[from] ChainIssue),
}

impl ResolveError {
    /// Map to the stable [`ErrorCode`] taxonomy.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Store(e) => e.error_code(),
            Self::MissingExecutor { .. } => ErrorCode::MissingExecutor,
            Self::CycleDetected { .. } => ErrorCode::CycleDetected,
            Self::ChainTooDeep { .. } => ErrorCode::ChainTooDeep,
            Self::Malformed(issue) => issue.error_code(),
        }
    }
}

/// Resolves and caches executor chains.
pub struct ChainResolver {
    store: Arc<dyn ToolStore>,
    cache: RwLock<HashMap<ToolId, Arc<ResolvedChain>>>,
}

impl ChainResolver {
    /// Create a resolver over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ToolStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the executor chain for `tool_id`, leaf first.
    ///
    /// Cached per root: repeated calls return the same `Arc` until a publish
    /// of any chain member evicts the entry.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolveError`] when the walk cannot reach a primitive.
    pub async fn resolve(&self, tool_id: &ToolId) -> Result<Arc<ResolvedChain>, ResolveError> {
        if let Some(chain) = self
            .cache
            .read()
            .expect("resolver cache lock poisoned")
            .get(tool_id)
        {
            debug!(target: "kiwi.resolver", tool = %tool_id, "chain cache hit");
            return Ok(Arc::clone(chain));
        }

        let chain = self.resolve_uncached(tool_id).await?;
        let chain = Arc::new(chain);
        self.cache
            .write()
            .expect("resolver cache lock poisoned")
            .insert(tool_id.clone(), Arc::clone(&chain));
        Ok(chain)
    }

    async fn resolve_uncached(&self, root: &ToolId) -> Result<ResolvedChain, ResolveError> {
        let mut links = Vec::new();
        let mut visited: BTreeSet<ToolId> = BTreeSet::new();
        let mut current = root.clone();

        loop {
            if !visited.insert(current.clone()) {
                return Err(ResolveError::CycleDetected { tool_id: current });
            }
            if links.len() >= MAX_CHAIN_DEPTH {
                return Err(ResolveError::ChainTooDeep { root: root.clone() });
            }

            let tv = self.store.latest(&current).await?.ok_or_else(|| {
                StoreError::ToolNotFound {
                    tool_id: current.clone(),
                    version: None,
                }
            })?;

            let is_primitive = tv.tool_type.is_primitive();
            let next = tv.executor_id.clone();
            let tool_type = tv.tool_type;
            links.push(tv);

            if is_primitive {
                break;
            }
            match next {
                Some(next) => current = next,
                None => {
                    return Err(ResolveError::MissingExecutor {
                        tool_id: current,
                        tool_type,
                    });
                }
            }
        }

        let chain = ResolvedChain::new(links);
        chain.check()?;
        debug!(target: "kiwi.resolver", root = %root, chain = %chain.describe(), "resolved chain");
        Ok(chain)
    }

    /// Evict every cached chain that contains `tool_id`.
    ///
    /// Call on publish; returns the number of evicted entries.
    pub fn invalidate_published(&self, tool_id: &ToolId) -> usize {
        let mut cache = self.cache.write().expect("resolver cache lock poisoned");
        let before = cache.len();
        cache.retain(|_, chain| !chain.contains(tool_id));
        let evicted = before - cache.len();
        if evicted > 0 {
            warn!(target: "kiwi.resolver", tool = %tool_id, evicted, "invalidated cached chains");
        }
        evicted
    }

    /// Root tool ids with a cached chain, sorted.
    #[must_use]
    pub fn cached_roots(&self) -> Vec<ToolId> {
        let cache = self.cache.read().expect("resolver cache lock poisoned");
        let mut roots: Vec<ToolId> = cache.keys().cloned().collect();
        roots.sort();
        roots
    }

    /// Drop every cached chain.
    pub fn clear(&self) {
        self.cache
            .write()
            .expect("resolver cache lock poisoned")
            .clear();
    }
}
