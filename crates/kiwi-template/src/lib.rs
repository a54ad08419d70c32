// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-template
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;

use kiwi_core::{Manifest, ResolvedChain};
use kiwi_error::ErrorCode;
use serde_json::{Map, Value};
use tracing::debug;

/// Keys with this prefix are runtime plumbing (`__auth`, `__sinks`): they are
/// never templated, never checked against declared parameters, and pass to
/// the primitive unchanged.
pub const RESERVED_PARAM_PREFIX: &str = "__";

/// Errors from parameter handling and template resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// A declared required parameter was not supplied and has no default.
    #[error("missing required parameter: {name}")]
    MissingRequiredParam {
        /// The parameter name.
        name: String,
    },

    /// A caller parameter is not declared and the manifest is strict.
    #[error("unknown parameter: {name}")]
    UnknownParam {
        /// The undeclared parameter name.
        name: String,
    },

    /// An environment reference had no value and no default.
    #[error("unresolved environment variable: {var}")]
    UnresolvedEnv {
        /// The referenced variable name.
        var: String,
    },
}

impl TemplateError {
    /// Map to the stable [`ErrorCode`] taxonomy.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::MissingRequiredParam { .. } => ErrorCode::MissingRequiredParam,
            Self::UnknownParam { .. } => ErrorCode::UnknownParam,
            Self::UnresolvedEnv { .. } => ErrorCode::UnresolvedEnv,
        }
    }
}

/// Deep-merge `overlay` into `base`.
///
/// Mappings recurse; scalars and arrays replace; an explicit `null` in the
/// overlay deletes the key from the base.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match value {
            Value::Null => {
                base.remove(key);
            }
            Value::Object(overlay_child) => match base.get_mut(key) {
                Some(Value::Object(base_child)) => deep_merge(base_child, overlay_child),
                _ => {
                    base.insert(key.clone(), Value::Object(overlay_child.clone()));
                }
            },
            other => {
                base.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Fold the chain's configs into one mapping.
///
/// Starts from the primitive's defaults and merges each config moving toward
/// the leaf, so closer-to-leaf values override farther-from-leaf ones.
#[must_use]
pub fn merge_chain_config(chain: &ResolvedChain) -> Map<String, Value> {
    let mut merged = Map::new();
    for link in chain.iter().rev() {
        deep_merge(&mut merged, &link.manifest.config());
    }
    merged
}

/// Compute the effective parameter map for a leaf manifest.
///
/// Declared defaults are filled in for omitted parameters; required
/// parameters without a value fail; in strict mode, caller keys that are not
/// declared (and not `__`-reserved) fail.
///
/// # Errors
///
/// Returns [`TemplateError::MissingRequiredParam`] or
/// [`TemplateError::UnknownParam`].
pub fn effective_params(
    manifest: &Manifest,
    caller: &Map<String, Value>,
) -> Result<Map<String, Value>, TemplateError> {
    let declared = manifest.parameters();

    if manifest.parameters_strict() {
        for key in caller.keys() {
            if key.starts_with(RESERVED_PARAM_PREFIX) {
                continue;
            }
            if !declared.iter().any(|p| &p.name == key) {
                return Err(TemplateError::UnknownParam { name: key.clone() });
            }
        }
    }

    let mut effective = Map::new();
    for spec in &declared {
        match caller.get(&spec.name) {
            Some(value) => {
                effective.insert(spec.name.clone(), value.clone());
            }
            None => match &spec.default {
                Some(default) => {
                    effective.insert(spec.name.clone(), default.clone());
                }
                None if spec.required => {
                    return Err(TemplateError::MissingRequiredParam {
                        name: spec.name.clone(),
                    });
                }
                None => {}
            },
        }
    }

    // Undeclared (non-strict) caller params still participate in templating.
    for (key, value) in caller {
        if key.starts_with(RESERVED_PARAM_PREFIX) {
            continue;
        }
        effective.entry(key.clone()).or_insert_with(|| value.clone());
    }

    Ok(effective)
}

/// Substitute templates in every string leaf of `config`.
///
/// `{name}` takes the corresponding param; `${VAR}` takes the environment
/// value, `${VAR:-default}` falls back. A substituted value is not
/// re-scanned. Placeholders naming no known param stay verbatim.
///
/// # Errors
///
/// Returns [`TemplateError::UnresolvedEnv`] for `${VAR}` with no value and
/// no default.
pub fn render_config(
    config: Map<String, Value>,
    params: &Map<String, Value>,
    env: &BTreeMap<String, String>,
) -> Result<Map<String, Value>, TemplateError> {
    let mut out = Map::new();
    for (key, value) in config {
        out.insert(key, render_value(value, params, env)?);
    }
    Ok(out)
}

/// Merge the chain config and render it with the caller's params and env.
///
/// The complete C6 pipeline used by the executor facade.
///
/// # Errors
///
/// Returns any [`TemplateError`] from parameter handling or env resolution.
pub fn prepare(
    chain: &ResolvedChain,
    caller_params: &Map<String, Value>,
    env: &BTreeMap<String, String>,
) -> Result<Map<String, Value>, TemplateError> {
    let params = match chain.leaf() {
        Some(leaf) => effective_params(&leaf.manifest, caller_params)?,
        None => caller_params.clone(),
    };
    let merged = merge_chain_config(chain);
    let rendered = render_config(merged, &params, env)?;
    debug!(target: "kiwi.template", keys = rendered.len(), "prepared merged config");
    Ok(rendered)
}

fn render_value(
    value: Value,
    params: &Map<String, Value>,
    env: &BTreeMap<String, String>,
) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => render_string(&s, params, env),
        Value::Array(items) => {
            let rendered = items
                .into_iter()
                .map(|v| render_value(v, params, env))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(rendered))
        }
        Value::Object(map) => {
            let mut rendered = Map::new();
            for (k, v) in map {
                rendered.insert(k, render_value(v, params, env)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other),
    }
}

fn render_string(
    s: &str,
    params: &Map<String, Value>,
    env: &BTreeMap<String, String>,
) -> Result<Value, TemplateError> {
    // Whole-string param placeholder: substitute the typed value.
    if let Some(name) = s
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|name| is_param_name(name))
        && let Some(value) = params.get(name)
    {
        return Ok(value.clone());
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("${") {
            match after.find('}') {
                Some(end) => {
                    let reference = &after[..end];
                    out.push_str(&resolve_env(reference, env)?);
                    rest = &after[end + 1..];
                }
                None => {
                    // Unterminated reference: copy verbatim.
                    out.push_str(rest);
                    break;
                }
            }
        } else if let Some(after) = rest.strip_prefix('{') {
            match after.find('}') {
                Some(end) if is_param_name(&after[..end]) => {
                    let name = &after[..end];
                    match params.get(name) {
                        Some(value) => out.push_str(&param_as_text(value)),
                        None => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        } else {
            let next = rest
                .char_indices()
                .find(|(_, c)| *c == '{' || *c == '$')
                .map_or(rest.len(), |(i, _)| i.max(1));
            out.push_str(&rest[..next]);
            rest = &rest[next..];
        }
    }
    Ok(Value::String(out))
}

fn resolve_env(reference: &str, env: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    match reference.split_once(":-") {
        Some((var, default)) => Ok(env.get(var).cloned().unwrap_or_else(|| default.to_string())),
        None => env
            .get(reference)
            .cloned()
            .ok_or_else(|| TemplateError::UnresolvedEnv {
                var: reference.to_string(),
            }),
    }
}

fn is_param_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn param_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
