// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parent→child schema validation.
//!
//! For each adjacent `(child, parent)` pair of a chain, the parent's
//! `validation.child_schemas` rules are matched in declaration order against
//! the child's top-level manifest fields; the first matching rule's draft-07
//! schema validates the child manifest.
//!
//! Policy split: a parent with no (or empty) `child_schemas` yields a warning
//! and permits execution; a non-empty rule list with no match is a hard
//! failure.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use jsonschema::{Draft, Validator};
use kiwi_core::{ResolvedChain, ToolId, ToolVersion, canonical_json, sha256_hex};
use kiwi_error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Errors from chain validation.
#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    /// The parent declares rules but none matched the child.
    #[error("no child schema of {parent} matched {child} (chain index {index})")]
    NoMatchingSchema {
        /// The parent tool.
        parent: ToolId,
        /// The rejected child.
        child: ToolId,
        /// Chain index of the child.
        index: usize,
    },

    /// The child manifest failed the matched schema.
    #[error("{child} failed validation against {parent}: {}", .issues.join("; "))]
    Failed {
        /// The parent tool.
        parent: ToolId,
        /// The failing child.
        child: ToolId,
        /// Chain index of the child.
        index: usize,
        /// Individual schema violations.
        issues: Vec<String>,
    },

    /// A declared schema does not compile.
    #[error("child schema of {parent} does not compile: {reason}")]
    SchemaCompile {
        /// The parent declaring the schema.
        parent: ToolId,
        /// Compiler diagnostic.
        reason: String,
    },
}

impl ValidateError {
    /// Map to the stable [`ErrorCode`] taxonomy.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NoMatchingSchema { .. } => ErrorCode::NoMatchingSchema,
            Self::Failed { .. } | Self::SchemaCompile { .. } => ErrorCode::ValidationFailed,
        }
    }
}

/// The warn-level outcome of a successful validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Advisory findings (parents with no child schemas).
    pub warnings: Vec<String>,
}

/// Cache of compiled draft-07 validators keyed by canonical schema hash.
#[derive(Default)]
pub struct SchemaCache {
    compiled: RwLock<HashMap<String, Arc<Validator>>>,
}

impl SchemaCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `schema` (or return the cached validator).
    ///
    /// # Errors
    ///
    /// Returns the compiler diagnostic when the schema is invalid.
    pub fn compile(&self, schema: &Value) -> Result<Arc<Validator>, String> {
        let key = sha256_hex(
            canonical_json(schema)
                .map_err(|e| e.to_string())?
                .as_bytes(),
        );

        if let Some(validator) = self
            .compiled
            .read()
            .expect("schema cache lock poisoned")
            .get(&key)
        {
            return Ok(Arc::clone(validator));
        }

        let validator = jsonschema::options()
            .with_draft(Draft::Draft7)
            .build(schema)
            .map_err(|e| e.to_string())?;
        let validator = Arc::new(validator);
        self.compiled
            .write()
            .expect("schema cache lock poisoned")
            .insert(key, Arc::clone(&validator));
        Ok(validator)
    }

    /// Number of compiled schemas held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.compiled
            .read()
            .expect("schema cache lock poisoned")
            .len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validates adjacent chain pairs against the parents' child schemas.
pub struct ChainValidator {
    schemas: Arc<SchemaCache>,
    pair_verdicts: RwLock<HashSet<(String, String)>>,
}

impl ChainValidator {
    /// Create a validator with its own schema cache.
    #[must_use]
    pub fn new() -> Self {
        Self::with_schema_cache(Arc::new(SchemaCache::new()))
    }

    /// Create a validator sharing an existing schema cache.
    #[must_use]
    pub fn with_schema_cache(schemas: Arc<SchemaCache>) -> Self {
        Self {
            schemas,
            pair_verdicts: RwLock::new(HashSet::new()),
        }
    }

    /// The shared compile cache.
    #[must_use]
    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        &self.schemas
    }

    /// Validate every adjacent `(child, parent)` pair of the chain.
    ///
    /// Passing pair verdicts are memoised by `(parent_integrity,
    /// child_integrity)`.
    ///
    /// # Errors
    ///
    /// Returns the first failing pair's [`ValidateError`].
    pub fn validate_chain(&self, chain: &ResolvedChain) -> Result<ValidationReport, ValidateError> {
        let mut report = ValidationReport::default();

        for (index, (child, parent)) in chain.pairs().enumerate() {
            let verdict_key = (parent.integrity.clone(), child.integrity.clone());
            {
                let verdicts = self
                    .pair_verdicts
                    .read()
                    .expect("validator cache lock poisoned");
                if verdicts.contains(&verdict_key) {
                    continue;
                }
            }

            match self.validate_pair(index, child, parent)? {
                Some(warning) => report.warnings.push(warning),
                None => {
                    self.pair_verdicts
                        .write()
                        .expect("validator cache lock poisoned")
                        .insert(verdict_key);
                }
            }
        }

        debug!(
            target: "kiwi.validate",
            links = chain.len(),
            warnings = report.warnings.len(),
            "chain validated"
        );
        Ok(report)
    }

    /// Validate one pair. `Ok(Some(_))` is the warn case (no rules declared).
    fn validate_pair(
        &self,
        index: usize,
        child: &ToolVersion,
        parent: &ToolVersion,
    ) -> Result<Option<String>, ValidateError> {
        let Some(rules) = parent.manifest.child_schemas() else {
            let warning = format!(
                "{} declares no child schemas; accepting {} unchecked",
                parent.tool_id, child.tool_id
            );
            warn!(target: "kiwi.validate", parent = %parent.tool_id, child = %child.tool_id, "no child schemas");
            return Ok(Some(warning));
        };
        if rules.is_empty() {
            let warning = format!(
                "{} declares an empty child schema list; accepting {} unchecked",
                parent.tool_id, child.tool_id
            );
            return Ok(Some(warning));
        }

        let child_doc = Value::Object(child.manifest.as_map().clone());

        for rule in &rules {
            let matches = rule
                .match_fields
                .iter()
                .all(|(k, v)| child.manifest.get(k) == Some(v));
            if !matches {
                continue;
            }

            let validator =
                self.schemas
                    .compile(&rule.schema)
                    .map_err(|reason| ValidateError::SchemaCompile {
                        parent: parent.tool_id.clone(),
                        reason,
                    })?;

            let issues: Vec<String> = validator
                .iter_errors(&child_doc)
                .map(|e| format!("{}: {e}", e.instance_path))
                .collect();
            if issues.is_empty() {
                return Ok(None);
            }
            return Err(ValidateError::Failed {
                parent: parent.tool_id.clone(),
                child: child.tool_id.clone(),
                index,
                issues,
            });
        }

        Err(ValidateError::NoMatchingSchema {
            parent: parent.tool_id.clone(),
            child: child.tool_id.clone(),
            index,
        })
    }
}

impl Default for ChainValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_core::{ToolType, ToolVersionBuilder};
    use serde_json::json;

    fn python_runtime() -> ToolVersion {
        ToolVersionBuilder::new("python_runtime", "2.0.0", ToolType::Runtime)
            .executor("subprocess")
            .manifest_field(
                "validation",
                json!({
                    "child_schemas": [{
                        "match": {"tool_type": "script"},
                        "schema": {
                            "type": "object",
                            "properties": {
                                "language": {"const": "python"},
                                "tool_id": {"type": "string", "pattern": "^[a-z][a-z0-9_]*$"}
                            },
                            "required": ["language"]
                        }
                    }]
                }),
            )
            .build()
            .unwrap()
    }

    fn script(id: &str, language: &str) -> ToolVersion {
        ToolVersionBuilder::new(id, "1.0.0", ToolType::Script)
            .executor("python_runtime")
            .manifest_field("language", json!(language))
            .build()
            .unwrap()
    }

    fn subprocess() -> ToolVersion {
        ToolVersionBuilder::new("subprocess", "1.0.0", ToolType::Primitive)
            .build()
            .unwrap()
    }

    #[test]
    fn matching_child_passes() {
        let chain = ResolvedChain::new(vec![
            script("weather", "python"),
            python_runtime(),
            subprocess(),
        ]);
        let validator = ChainValidator::new();
        let report = validator.validate_chain(&chain).unwrap();
        // python_runtime -> subprocess has no schemas: one warning expected.
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("subprocess"));
    }

    #[test]
    fn wrong_language_fails_with_offending_field() {
        let chain = ResolvedChain::new(vec![
            script("rbscript", "ruby"),
            python_runtime(),
            subprocess(),
        ]);
        let validator = ChainValidator::new();
        match validator.validate_chain(&chain).unwrap_err() {
            ValidateError::Failed { child, issues, index, .. } => {
                assert_eq!(child.as_str(), "rbscript");
                assert_eq!(index, 0);
                assert!(
                    issues.iter().any(|i| i.contains("language")),
                    "issues should name the offending field: {issues:?}"
                );
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn unmatched_child_is_a_hard_failure() {
        // Parent only matches scripts; an api child finds no rule.
        let api_child = ToolVersionBuilder::new("some_api", "1.0.0", ToolType::Api)
            .executor("python_runtime")
            .build()
            .unwrap();
        let chain = ResolvedChain::new(vec![api_child, python_runtime(), subprocess()]);
        let validator = ChainValidator::new();
        let err = validator.validate_chain(&chain).unwrap_err();
        assert!(matches!(err, ValidateError::NoMatchingSchema { .. }));
        assert_eq!(err.error_code(), ErrorCode::NoMatchingSchema);
    }

    #[test]
    fn absent_rules_warn_but_permit() {
        let bare_parent = ToolVersionBuilder::new("bare_runtime", "1.0.0", ToolType::Runtime)
            .executor("subprocess")
            .build()
            .unwrap();
        let child = ToolVersionBuilder::new("kid", "1.0.0", ToolType::Script)
            .executor("bare_runtime")
            .build()
            .unwrap();
        let chain = ResolvedChain::new(vec![child, bare_parent, subprocess()]);
        let validator = ChainValidator::new();
        let report = validator.validate_chain(&chain).unwrap();
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn first_matching_rule_wins() {
        let parent = ToolVersionBuilder::new("runtime", "1.0.0", ToolType::Runtime)
            .executor("subprocess")
            .manifest_field(
                "validation",
                json!({
                    "child_schemas": [
                        {"match": {"tool_type": "script"}, "schema": {"type": "object", "required": ["language"]}},
                        {"match": {}, "schema": {"type": "object"}}
                    ]
                }),
            )
            .build()
            .unwrap();
        // No language field: the first (matching) rule must apply and fail —
        // the permissive catch-all below it must not rescue the child.
        let child = ToolVersionBuilder::new("kid", "1.0.0", ToolType::Script)
            .executor("runtime")
            .build()
            .unwrap();
        let chain = ResolvedChain::new(vec![child, parent, subprocess()]);
        let validator = ChainValidator::new();
        let err = validator.validate_chain(&chain).unwrap_err();
        assert!(matches!(err, ValidateError::Failed { .. }));
    }

    #[test]
    fn pair_verdicts_are_memoised() {
        let chain = ResolvedChain::new(vec![
            script("weather", "python"),
            python_runtime(),
            subprocess(),
        ]);
        let validator = ChainValidator::new();
        validator.validate_chain(&chain).unwrap();
        let compiled_after_first = validator.schema_cache().len();
        validator.validate_chain(&chain).unwrap();
        assert_eq!(validator.schema_cache().len(), compiled_after_first);
    }

    #[test]
    fn schema_cache_deduplicates_identical_schemas() {
        let cache = SchemaCache::new();
        let a = json!({"type": "object", "required": ["x"]});
        // Same schema, different key insertion order.
        let b = json!({"required": ["x"], "type": "object"});
        cache.compile(&a).unwrap();
        cache.compile(&b).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalid_schema_is_a_compile_error() {
        let parent = ToolVersionBuilder::new("runtime", "1.0.0", ToolType::Runtime)
            .executor("subprocess")
            .manifest_field(
                "validation",
                json!({"child_schemas": [{"match": {}, "schema": {"type": "not_a_type"}}]}),
            )
            .build()
            .unwrap();
        let child = ToolVersionBuilder::new("kid", "1.0.0", ToolType::Script)
            .executor("runtime")
            .build()
            .unwrap();
        let chain = ResolvedChain::new(vec![child, parent, subprocess()]);
        let validator = ChainValidator::new();
        let err = validator.validate_chain(&chain).unwrap_err();
        assert!(matches!(err, ValidateError::SchemaCompile { .. }));
    }
}
