// SPDX-License-Identifier: MIT OR Apache-2.0
//! File-backed JSONL/raw sink.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{Sink, SinkError};

/// Flush after this many buffered events unless configured otherwise.
pub const DEFAULT_FLUSH_EVERY: usize = 16;

/// Payload framing for a [`FileSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    /// One compact JSON document per line.
    #[default]
    Jsonl,
    /// String payloads verbatim, others as compact JSON, no framing.
    Raw,
}

/// Appends streamed events to a file.
///
/// Parent directories are created on open. Writes are flushed every
/// `flush_every` events and at close.
pub struct FileSink {
    name: String,
    path: PathBuf,
    file: Option<File>,
    format: FileFormat,
    flush_every: usize,
    pending: usize,
    written: u64,
}

impl FileSink {
    /// Open (append) the sink at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the path cannot be opened.
    pub async fn create(
        path: impl AsRef<Path>,
        format: FileFormat,
        flush_every: usize,
    ) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let name = format!("file:{}", path.display());

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SinkError::new(&name, format!("create {}: {e}", parent.display())))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| SinkError::new(&name, format!("open {}: {e}", path.display())))?;

        Ok(Self {
            name,
            path,
            file: Some(file),
            format,
            flush_every: flush_every.max(1),
            pending: 0,
            written: 0,
        })
    }

    /// The sink's target path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total events written.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    fn frame(&self, event: &Value) -> Vec<u8> {
        match self.format {
            FileFormat::Jsonl => {
                let mut line = event.to_string().into_bytes();
                line.push(b'\n');
                line
            }
            FileFormat::Raw => match event {
                Value::String(s) => s.clone().into_bytes(),
                other => other.to_string().into_bytes(),
            },
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, event: &Value) -> Result<(), SinkError> {
        if self.file.is_none() {
            return Err(SinkError::new(&self.name, "write after close"));
        }

        let frame = self.frame(event);
        let file = self.file.as_mut().expect("checked for close above");
        file.write_all(&frame)
            .await
            .map_err(|e| SinkError::new(&self.name, e.to_string()))?;

        self.written += 1;
        self.pending += 1;
        if self.pending >= self.flush_every {
            file.flush()
                .await
                .map_err(|e| SinkError::new(&self.name, e.to_string()))?;
            self.pending = 0;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| SinkError::new(&self.name, e.to_string()))?;
            debug!(target: "kiwi.sink", path = %self.path.display(), written = self.written, "file sink closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn jsonl_lines_match_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut sink = FileSink::create(&path, FileFormat::Jsonl, 2).await.unwrap();

        for i in 0..5 {
            sink.write(&json!({"seq": i})).await.unwrap();
        }
        sink.close().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 5);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["seq"], json!(0));
        assert_eq!(sink.written(), 5);
    }

    #[tokio::test]
    async fn parents_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep/nested/out.jsonl");
        let mut sink = FileSink::create(&path, FileFormat::Jsonl, DEFAULT_FLUSH_EVERY)
            .await
            .unwrap();
        sink.write(&json!("x")).await.unwrap();
        sink.close().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn raw_format_writes_strings_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.txt");
        let mut sink = FileSink::create(&path, FileFormat::Raw, 1).await.unwrap();
        sink.write(&json!("hello ")).await.unwrap();
        sink.write(&json!("world")).await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello world");
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.jsonl");
        let mut sink = FileSink::create(&path, FileFormat::Jsonl, 1).await.unwrap();
        sink.close().await.unwrap();
        let err = sink.write(&json!(1)).await.unwrap_err();
        assert!(err.cause.contains("after close"));
    }

    #[tokio::test]
    async fn appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("append.jsonl");
        {
            let mut sink = FileSink::create(&path, FileFormat::Jsonl, 1).await.unwrap();
            sink.write(&json!(1)).await.unwrap();
            sink.close().await.unwrap();
        }
        {
            let mut sink = FileSink::create(&path, FileFormat::Jsonl, 1).await.unwrap();
            sink.write(&json!(2)).await.unwrap();
            sink.close().await.unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
