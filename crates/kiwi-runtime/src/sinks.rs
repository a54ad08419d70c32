// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sink instantiation for streaming calls.
//!
//! The facade — never the HTTP primitive — turns destination specs into live
//! sinks: `return` becomes an in-memory buffer whose handle outlives the
//! sink, the data-driven types (`file`, `null`, `websocket`) build directly,
//! and any other type is treated as the tool id of a loadable `runtime_sink`
//! package whose manifest declares the actual destination under
//! `config.sink`.

use kiwi_core::{ToolId, ToolType};
use kiwi_sink::{DestinationSpec, ReturnBuffer, ReturnSink, Sink, SinkError};
use tracing::debug;

use crate::{ExecError, ExecutorContext};

impl ExecutorContext {
    /// Build every destination of a stream spec, in declaration order.
    ///
    /// Returns the sinks plus the `return` buffer handle when one was
    /// requested.
    pub(crate) async fn instantiate_sinks(
        &self,
        spec: &kiwi_exec::StreamSpec,
    ) -> Result<(Vec<Box<dyn Sink>>, Option<ReturnBuffer>), ExecError> {
        let mut destinations = spec.destinations.clone();
        if destinations.is_empty() && spec.buffer_events {
            destinations.push(DestinationSpec::return_buffer());
        }

        let mut sinks: Vec<Box<dyn Sink>> = Vec::with_capacity(destinations.len());
        let mut return_buffer = None;

        for dest in &destinations {
            match dest.kind.as_str() {
                "return" => {
                    let sink =
                        ReturnSink::new(dest.max_buffer_size.unwrap_or(spec.max_buffer_size));
                    // Keep one handle: multiple return destinations share the
                    // first buffer reported on the result.
                    if return_buffer.is_none() {
                        return_buffer = Some(sink.handle());
                    }
                    sinks.push(Box::new(sink));
                }
                "file" | "null" | "websocket" => {
                    sinks.push(kiwi_sink::build_sink(dest).await?);
                }
                tool => {
                    sinks.push(self.load_sink_tool(tool, dest).await?);
                }
            }
        }

        debug!(target: "kiwi.runtime", count = sinks.len(), "sinks instantiated");
        Ok((sinks, return_buffer))
    }

    /// Load a `runtime_sink` tool and wrap it behind the sink contract.
    ///
    /// The tool's manifest declares its transport under `config.sink` as a
    /// destination spec; the caller's destination may override `path` and
    /// `url`.
    async fn load_sink_tool(
        &self,
        tool: &str,
        dest: &DestinationSpec,
    ) -> Result<Box<dyn Sink>, ExecError> {
        let tool_id = ToolId::new(tool)
            .map_err(|e| SinkError::new(tool, format!("not a sink type or tool id: {e}")))?;
        let tv = self
            .store()
            .latest(&tool_id)
            .await
            .map_err(|e| SinkError::new(tool, e.to_string()))?
            .ok_or_else(|| SinkError::new(tool, "sink tool not found in registry"))?;

        if tv.tool_type != ToolType::RuntimeSink {
            return Err(SinkError::new(
                tool,
                format!("tool is a {:?}, not a runtime_sink", tv.tool_type),
            )
            .into());
        }

        let declared = tv.manifest.config().remove("sink").ok_or_else(|| {
            SinkError::new(tool, "runtime_sink manifest declares no config.sink")
        })?;
        let mut inner: DestinationSpec = serde_json::from_value(declared)
            .map_err(|e| SinkError::new(tool, format!("config.sink invalid: {e}")))?;

        if dest.path.is_some() {
            inner.path = dest.path.clone();
        }
        if dest.url.is_some() {
            inner.url = dest.url.clone();
        }

        debug!(target: "kiwi.runtime", sink_tool = %tool_id, kind = %inner.kind, "loading sink tool");
        Ok(kiwi_sink::build_sink(&inner).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecutorContext;
    use kiwi_core::ToolVersionBuilder;
    use kiwi_exec::StreamSpec;
    use kiwi_lockfile::LockfileManager;
    use kiwi_registry::MemoryStore;
    use std::sync::Arc;

    fn context(store: MemoryStore, dir: &tempfile::TempDir) -> ExecutorContext {
        ExecutorContext::new(
            Arc::new(store),
            "memory://test",
            LockfileManager::new(dir.path().join("project"), dir.path().join("user")),
        )
    }

    fn spec(v: serde_json::Value) -> StreamSpec {
        serde_json::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn return_and_file_destinations_build_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(MemoryStore::new(), &dir);
        let out = dir.path().join("events.jsonl");

        let (sinks, buffer) = ctx
            .instantiate_sinks(&spec(serde_json::json!({
                "destinations": [
                    {"type": "file", "path": out.to_str().unwrap()},
                    {"type": "return"}
                ]
            })))
            .await
            .unwrap();

        assert_eq!(sinks.len(), 2);
        assert!(sinks[0].name().starts_with("file:"));
        assert_eq!(sinks[1].name(), "return");
        assert!(buffer.is_some());
    }

    #[tokio::test]
    async fn buffer_events_implies_a_return_sink() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(MemoryStore::new(), &dir);
        let (sinks, buffer) = ctx
            .instantiate_sinks(&spec(serde_json::json!({"buffer_events": true})))
            .await
            .unwrap();
        assert_eq!(sinks.len(), 1);
        assert!(buffer.is_some());
    }

    #[tokio::test]
    async fn sink_tool_resolves_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let out = dir.path().join("tool-sink.jsonl");
        store.publish(
            ToolVersionBuilder::new("jsonl_recorder", "1.0.0", ToolType::RuntimeSink)
                .config(serde_json::json!({
                    "sink": {"type": "file", "path": out.to_str().unwrap()}
                }))
                .build()
                .unwrap(),
        );
        let ctx = context(store, &dir);

        let (sinks, _) = ctx
            .instantiate_sinks(&spec(serde_json::json!({
                "destinations": [{"type": "jsonl_recorder"}]
            })))
            .await
            .unwrap();
        assert_eq!(sinks.len(), 1);
        assert!(sinks[0].name().starts_with("file:"));
    }

    #[tokio::test]
    async fn unknown_sink_tool_is_a_sink_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(MemoryStore::new(), &dir);
        let err = ctx
            .instantiate_sinks(&spec(serde_json::json!({
                "destinations": [{"type": "ghost_sink"}]
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Sink(_)));
    }

    #[tokio::test]
    async fn non_sink_tool_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.publish(
            ToolVersionBuilder::new("not_a_sink", "1.0.0", ToolType::Script)
                .executor("subprocess")
                .build()
                .unwrap(),
        );
        let ctx = context(store, &dir);
        let err = ctx
            .instantiate_sinks(&spec(serde_json::json!({
                "destinations": [{"type": "not_a_sink"}]
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Sink(_)));
    }
}
