// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-exec
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Cooperative cancellation token for primitive runs.
pub mod cancel;
/// HTTP client primitive.
pub mod http;
/// Subprocess primitive.
pub mod subprocess;

pub use cancel::CancelToken;
pub use http::{HttpPrimitive, HttpPrimitiveError, HttpResult, StreamSpec};
pub use subprocess::{SubprocessError, SubprocessPrimitive, SubprocessResult};

use serde_json::{Map, Value};

/// Read a string config key.
pub(crate) fn str_key(config: &Map<String, Value>, key: &str) -> Option<String> {
    config.get(key).and_then(Value::as_str).map(String::from)
}

/// Read a u64 config key, tolerating JSON floats.
pub(crate) fn u64_key(config: &Map<String, Value>, key: &str) -> Option<u64> {
    match config.get(key) {
        Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        _ => None,
    }
}

/// Read a bool config key.
pub(crate) fn bool_key(config: &Map<String, Value>, key: &str) -> Option<bool> {
    config.get(key).and_then(Value::as_bool)
}

/// Read an array-of-strings config key; non-string items render compactly.
pub(crate) fn string_vec_key(config: &Map<String, Value>, key: &str) -> Vec<String> {
    match config.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}
