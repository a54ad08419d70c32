// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-sink
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// File-backed JSONL/raw sink.
pub mod file;
/// Reconnecting websocket sink.
pub mod ws;

use async_trait::async_trait;
use kiwi_error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub use file::{FileFormat, FileSink};
pub use ws::WebSocketSink;

/// Default cap on the `ReturnSink` buffer.
pub const DEFAULT_RETURN_BUFFER: usize = 1000;

/// A streaming event destination.
///
/// Sinks are created by the executor facade before streaming begins and
/// closed (in reverse construction order) when the call returns, on success
/// or failure. The HTTP primitive only ever calls `write` and `close`.
#[async_trait]
pub trait Sink: Send {
    /// Stable name for diagnostics (`"return"`, `"file:t.jsonl"`, ...).
    fn name(&self) -> &str;

    /// Deliver one event.
    async fn write(&mut self, event: &Value) -> Result<(), SinkError>;

    /// Flush and release the destination. Idempotent.
    async fn close(&mut self) -> Result<(), SinkError>;
}

impl std::fmt::Debug for dyn Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink").field("name", &self.name()).finish()
    }
}

/// Failure of a sink write or close.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sink {sink_name} failed: {cause}")]
pub struct SinkError {
    /// The sink's diagnostic name.
    pub sink_name: String,
    /// Human-readable failure cause.
    pub cause: String,
}

impl SinkError {
    /// Create a sink error.
    pub fn new(sink_name: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            sink_name: sink_name.into(),
            cause: cause.into(),
        }
    }

    /// The stable [`ErrorCode`] for sink failures.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::SinkFailure
    }
}

/// Declarative destination of a streaming call.
///
/// `type` selects the sink: `return`, `file`, `null`, `websocket`, or the
/// tool id of a loadable `runtime_sink` package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationSpec {
    /// Sink type or sink tool id.
    #[serde(rename = "type")]
    pub kind: String,

    /// Target path (file sinks).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Target URL (websocket sinks).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// File payload framing; defaults to JSONL.
    #[serde(default)]
    pub format: FileFormat,

    /// Flush cadence for file sinks (events per flush).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_every: Option<usize>,

    /// Buffer cap for return and websocket sinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_buffer_size: Option<usize>,
}

impl DestinationSpec {
    /// Shorthand for a `return` destination.
    #[must_use]
    pub fn return_buffer() -> Self {
        Self {
            kind: "return".into(),
            path: None,
            url: None,
            format: FileFormat::default(),
            flush_every: None,
            max_buffer_size: None,
        }
    }

    /// Shorthand for a `file` destination.
    #[must_use]
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: "file".into(),
            path: Some(path.into()),
            url: None,
            format: FileFormat::default(),
            flush_every: None,
            max_buffer_size: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ReturnSink
// ---------------------------------------------------------------------------

/// Shared read handle onto a [`ReturnSink`]'s buffer.
///
/// The facade keeps a handle so the buffered events survive the sink's close
/// and can be attached to the call result.
#[derive(Debug, Clone, Default)]
pub struct ReturnBuffer {
    events: Arc<Mutex<Vec<Value>>>,
    dropped: Arc<AtomicU64>,
}

impl ReturnBuffer {
    /// Snapshot of the buffered events.
    #[must_use]
    pub fn events(&self) -> Vec<Value> {
        self.events.lock().expect("return buffer lock poisoned").clone()
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().expect("return buffer lock poisoned").len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events silently dropped after the cap was reached.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Buffers events in memory up to a cap; excess is counted, not stored.
#[derive(Debug)]
pub struct ReturnSink {
    buffer: ReturnBuffer,
    max_size: usize,
    closed: bool,
}

impl ReturnSink {
    /// Create a sink buffering at most `max_size` events.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: ReturnBuffer::default(),
            max_size,
            closed: false,
        }
    }

    /// A shared handle onto the buffer.
    #[must_use]
    pub fn handle(&self) -> ReturnBuffer {
        self.buffer.clone()
    }
}

impl Default for ReturnSink {
    fn default() -> Self {
        Self::new(DEFAULT_RETURN_BUFFER)
    }
}

#[async_trait]
impl Sink for ReturnSink {
    fn name(&self) -> &str {
        "return"
    }

    async fn write(&mut self, event: &Value) -> Result<(), SinkError> {
        let mut events = self
            .buffer
            .events
            .lock()
            .expect("return buffer lock poisoned");
        if events.len() < self.max_size {
            events.push(event.clone());
        } else {
            self.buffer.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let dropped = self.buffer.dropped();
        if dropped > 0 {
            warn!(target: "kiwi.sink", dropped, cap = self.max_size, "return sink overflowed");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NullSink
// ---------------------------------------------------------------------------

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullSink {
    written: u64,
}

impl NullSink {
    /// Create a null sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events discarded so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }
}

#[async_trait]
impl Sink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    async fn write(&mut self, _event: &Value) -> Result<(), SinkError> {
        self.written += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Data-driven construction
// ---------------------------------------------------------------------------

/// Build a data-driven sink (`file`, `null`, `websocket`) from its spec.
///
/// `return` is not handled here: the facade constructs [`ReturnSink`]
/// directly so it can keep the buffer handle.
///
/// # Errors
///
/// Returns [`SinkError`] when the spec is incomplete or the sink cannot be
/// opened.
pub async fn build_sink(spec: &DestinationSpec) -> Result<Box<dyn Sink>, SinkError> {
    match spec.kind.as_str() {
        "null" => Ok(Box::new(NullSink::new())),
        "file" => {
            let path = spec
                .path
                .as_deref()
                .ok_or_else(|| SinkError::new("file", "destination has no path"))?;
            let sink =
                FileSink::create(path, spec.format, spec.flush_every.unwrap_or(file::DEFAULT_FLUSH_EVERY))
                    .await?;
            Ok(Box::new(sink))
        }
        "websocket" => {
            let url = spec
                .url
                .as_deref()
                .ok_or_else(|| SinkError::new("websocket", "destination has no url"))?;
            let sink = WebSocketSink::connect(url, spec.max_buffer_size.unwrap_or(ws::DEFAULT_WS_BUFFER)).await?;
            Ok(Box::new(sink))
        }
        other => Err(SinkError::new(
            other,
            "not a data-driven sink type (return sinks are built by the facade; sink tools load through the store)",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn return_sink_buffers_in_order() {
        let mut sink = ReturnSink::new(10);
        let handle = sink.handle();
        for i in 0..5 {
            sink.write(&json!({"seq": i})).await.unwrap();
        }
        sink.close().await.unwrap();

        let events = handle.events();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0]["seq"], json!(0));
        assert_eq!(events[4]["seq"], json!(4));
        assert_eq!(handle.dropped(), 0);
    }

    #[tokio::test]
    async fn return_sink_overflow_is_counted_not_stored() {
        let mut sink = ReturnSink::new(3);
        let handle = sink.handle();
        for i in 0..8 {
            sink.write(&json!(i)).await.unwrap();
        }
        sink.close().await.unwrap();

        assert_eq!(handle.len(), 3);
        assert_eq!(handle.dropped(), 5);
        // The retained events are the earliest ones.
        assert_eq!(handle.events(), vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn return_sink_close_is_idempotent() {
        let mut sink = ReturnSink::new(2);
        sink.write(&json!(1)).await.unwrap();
        sink.close().await.unwrap();
        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn null_sink_discards() {
        let mut sink = NullSink::new();
        sink.write(&json!({"x": 1})).await.unwrap();
        sink.write(&json!({"x": 2})).await.unwrap();
        assert_eq!(sink.written(), 2);
        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn build_sink_rejects_incomplete_specs() {
        let spec = DestinationSpec {
            kind: "file".into(),
            path: None,
            url: None,
            format: FileFormat::default(),
            flush_every: None,
            max_buffer_size: None,
        };
        let err = build_sink(&spec).await.unwrap_err();
        assert_eq!(err.sink_name, "file");
        assert_eq!(err.error_code(), ErrorCode::SinkFailure);
    }

    #[test]
    fn destination_spec_serde() {
        let spec: DestinationSpec =
            serde_json::from_value(json!({"type": "file", "path": "t.jsonl"})).unwrap();
        assert_eq!(spec.kind, "file");
        assert_eq!(spec.path.as_deref(), Some("t.jsonl"));
        assert_eq!(spec.format, FileFormat::Jsonl);

        let spec: DestinationSpec = serde_json::from_value(json!({"type": "return"})).unwrap();
        assert_eq!(spec, DestinationSpec::return_buffer());
    }
}
