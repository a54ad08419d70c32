// SPDX-License-Identifier: MIT OR Apache-2.0

//! Manifest wrapper with typed accessors.
//!
//! A manifest is an opaque JSON object on the wire; this module layers typed
//! views (`config`, `parameters`, `validation.child_schemas`, `retry`) on top
//! without losing unknown fields, so integrity hashing always covers the full
//! document.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A declared runtime parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParameterSpec {
    /// Parameter name, referenced as `{name}` in config strings.
    pub name: String,
    /// Declared JSON type (informational).
    #[serde(rename = "type", default)]
    pub param_type: Option<String>,
    /// Whether the caller must supply the parameter.
    #[serde(default)]
    pub required: bool,
    /// Default value substituted when the caller omits the parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// One parent→child validation rule: a match map plus a JSON Schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChildSchemaRule {
    /// Top-level child manifest fields that must all equal these values.
    #[serde(rename = "match", default)]
    pub match_fields: Map<String, Value>,
    /// Draft-07 JSON Schema the matching child manifest must satisfy.
    pub schema: Value,
}

/// Retry policy declared in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetrySpec {
    /// Maximum number of attempts, including the first.
    #[serde(default = "RetrySpec::default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff schedule in milliseconds; the last entry repeats.
    #[serde(default)]
    pub backoff_ms: Vec<u64>,
    /// Error identifiers that are retryable (`"TIMEOUT"`, `"NETWORK"`, or an
    /// HTTP status code rendered as a string).
    #[serde(default)]
    pub retryable_errors: Vec<String>,
}

impl RetrySpec {
    fn default_max_attempts() -> u32 {
        1
    }
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            backoff_ms: Vec::new(),
            retryable_errors: Vec::new(),
        }
    }
}

/// The declarative document of a tool version.
///
/// Wraps the raw JSON object and exposes typed accessors. Unknown fields are
/// preserved verbatim; the wrapper serialises transparently as the object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Manifest(Map<String, Value>);

impl Manifest {
    /// The raw manifest object.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Fetch a top-level field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The `executor` field, when present and non-null.
    #[must_use]
    pub fn executor(&self) -> Option<&str> {
        self.0.get("executor").and_then(Value::as_str)
    }

    /// The `config` mapping used as execution defaults.
    ///
    /// Returns an empty object when the field is absent or not an object.
    #[must_use]
    pub fn config(&self) -> Map<String, Value> {
        match self.0.get("config") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    /// Declared parameters, decoded leniently (malformed entries skipped).
    #[must_use]
    pub fn parameters(&self) -> Vec<ParameterSpec> {
        match self.0.get("parameters") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether undeclared caller params are rejected.
    ///
    /// Read from `parameters_strict` at the top level (the declaration the
    /// runtime enforces as `parameters.strict`).
    #[must_use]
    pub fn parameters_strict(&self) -> bool {
        self.0
            .get("parameters_strict")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The `validation.child_schemas` rules, in declaration order.
    ///
    /// Returns `None` when the section is absent, `Some(vec![])` when it is
    /// declared but empty — the validator treats both as the warn case.
    #[must_use]
    pub fn child_schemas(&self) -> Option<Vec<ChildSchemaRule>> {
        let validation = self.0.get("validation")?.as_object()?;
        let rules = validation.get("child_schemas")?.as_array()?;
        Some(
            rules
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect(),
        )
    }

    /// The declared retry policy, if any.
    #[must_use]
    pub fn retry(&self) -> Option<RetrySpec> {
        let v = self.0.get("retry")?;
        serde_json::from_value(v.clone()).ok()
    }
}

impl From<Map<String, Value>> for Manifest {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
