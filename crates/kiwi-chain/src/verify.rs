// SPDX-License-Identifier: MIT OR Apache-2.0

//! Link integrity verification.
//!
//! Recomputes the canonical integrity of every chain link and compares it to
//! the stored value. Passing verdicts are memoised by the link's stored
//! `content_hash`, so a chain whose members were already verified costs one
//! set lookup per link.

use std::collections::HashSet;
use std::sync::RwLock;

use kiwi_core::{ResolvedChain, ToolId, ToolVersion, hash::HashError};
use kiwi_error::ErrorCode;
use tracing::{debug, warn};

/// Errors from integrity verification.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// A link's recomputed integrity differs from the stored value.
    #[error("integrity mismatch for {tool_id} at chain index {index}: expected {expected}, computed {computed}")]
    Mismatch {
        /// Position of the link in the chain (0 = leaf).
        index: usize,
        /// The offending tool.
        tool_id: ToolId,
        /// The integrity stored in the registry document.
        expected: String,
        /// The integrity recomputed from the manifest and files.
        computed: String,
    },

    /// A link's manifest could not be serialised for hashing.
    #[error("could not hash {tool_id} at chain index {index}: {source}")]
    Hash {
        /// Position of the link in the chain.
        index: usize,
        /// The offending tool.
        tool_id: ToolId,
        /// Underlying serialisation failure.
        source: HashError,
    },
}

impl VerifyError {
    /// Map to the stable [`ErrorCode`] taxonomy.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Mismatch { .. } => ErrorCode::IntegrityMismatch,
            Self::Hash { .. } => ErrorCode::Internal,
        }
    }
}

/// Verifies chain links against their stored integrity.
#[derive(Debug, Default)]
pub struct IntegrityVerifier {
    verified: RwLock<HashSet<String>>,
}

impl IntegrityVerifier {
    /// Create a verifier with an empty verdict cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify a single link.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Mismatch`] on drift, [`VerifyError::Hash`] when
    /// the manifest cannot be serialised.
    pub fn verify_link(&self, index: usize, link: &ToolVersion) -> Result<(), VerifyError> {
        {
            let verified = self.verified.read().expect("verifier cache lock poisoned");
            if verified.contains(&link.content_hash) {
                return Ok(());
            }
        }

        let computed = link.recompute_integrity().map_err(|source| VerifyError::Hash {
            index,
            tool_id: link.tool_id.clone(),
            source,
        })?;

        if computed != link.integrity {
            warn!(
                target: "kiwi.verify",
                tool = %link.tool_id,
                index,
                expected = %link.integrity,
                computed = %computed,
                "integrity mismatch"
            );
            return Err(VerifyError::Mismatch {
                index,
                tool_id: link.tool_id.clone(),
                expected: link.integrity.clone(),
                computed,
            });
        }

        self.verified
            .write()
            .expect("verifier cache lock poisoned")
            .insert(link.content_hash.clone());
        Ok(())
    }

    /// Verify every link of a chain, leaf first.
    ///
    /// # Errors
    ///
    /// Returns the first failing link's [`VerifyError`].
    pub fn verify_chain(&self, chain: &ResolvedChain) -> Result<(), VerifyError> {
        for (index, link) in chain.iter().enumerate() {
            self.verify_link(index, link)?;
        }
        debug!(target: "kiwi.verify", links = chain.len(), "chain verified");
        Ok(())
    }

    /// Number of memoised passing verdicts.
    #[must_use]
    pub fn cached_verdicts(&self) -> usize {
        self.verified
            .read()
            .expect("verifier cache lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_core::{ResolvedChain, ToolType, ToolVersionBuilder};

    fn chain() -> ResolvedChain {
        ResolvedChain::new(vec![
            ToolVersionBuilder::new("weather", "1.0.0", ToolType::Script)
                .executor("subprocess")
                .config(serde_json::json!({"script": "weather.py"}))
                .build()
                .unwrap(),
            ToolVersionBuilder::new("subprocess", "1.0.0", ToolType::Primitive)
                .build()
                .unwrap(),
        ])
    }

    #[test]
    fn clean_chain_verifies() {
        let verifier = IntegrityVerifier::new();
        verifier.verify_chain(&chain()).unwrap();
        assert_eq!(verifier.cached_verdicts(), 2);
    }

    #[test]
    fn tampered_manifest_is_detected_at_the_right_index() {
        let mut chain = chain();
        let mut links = chain.links().to_vec();
        // Mutate the stored manifest post-publish without re-hashing.
        let mut map = links[0].manifest.as_map().clone();
        map.insert("config".into(), serde_json::json!({"script": "evil.py"}));
        links[0].manifest = map.into();
        chain = ResolvedChain::new(links);

        let verifier = IntegrityVerifier::new();
        match verifier.verify_chain(&chain).unwrap_err() {
            VerifyError::Mismatch { index, tool_id, expected, computed } => {
                assert_eq!(index, 0);
                assert_eq!(tool_id.as_str(), "weather");
                assert_ne!(expected, computed);
            }
            other => panic!("expected Mismatch, got {other:?}"),
        }
        // The failing link must not be memoised as verified.
        assert!(verifier.cached_verdicts() <= 1);
    }

    #[test]
    fn tampered_integrity_field_is_detected() {
        let mut chain = chain();
        let mut links = chain.links().to_vec();
        links[1].integrity = "f".repeat(64);
        chain = ResolvedChain::new(links);

        let verifier = IntegrityVerifier::new();
        let err = verifier.verify_chain(&chain).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::IntegrityMismatch);
    }

    #[test]
    fn verdicts_are_memoised_by_content_hash() {
        let verifier = IntegrityVerifier::new();
        let chain = chain();
        verifier.verify_chain(&chain).unwrap();
        let after_first = verifier.cached_verdicts();
        verifier.verify_chain(&chain).unwrap();
        assert_eq!(verifier.cached_verdicts(), after_first);
    }
}
