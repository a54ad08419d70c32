// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subprocess primitive.
//!
//! Spawns the merged config's command as an isolated child process: only the
//! three standard streams are shared, stdout/stderr capture is capped, and a
//! wall-clock timeout (or caller cancellation) terminates the child with a
//! grace period before the hard kill.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use kiwi_error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::{bool_key, str_key, string_vec_key, u64_key};

/// Default wall-clock timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// Cap on captured stdout/stderr, each.
pub const MAX_CAPTURE_BYTES: usize = 16 * 1024 * 1024;

/// Appended to captured output that hit [`MAX_CAPTURE_BYTES`].
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Grace between terminate and hard kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Errors from the subprocess primitive.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    /// The merged config is missing or mistypes a required key.
    #[error("subprocess config invalid: {reason}")]
    Config {
        /// What is wrong with the config.
        reason: String,
    },

    /// The command could not be spawned.
    #[error("failed to spawn {command}: {source}")]
    SpawnFailed {
        /// The command that failed to start.
        command: String,
        /// OS-level failure.
        source: std::io::Error,
    },

    /// The child exceeded its wall-clock timeout.
    #[error("subprocess timed out after {timeout_ms} ms")]
    Timeout {
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// The call was cancelled while the child was running.
    #[error("subprocess cancelled")]
    Cancelled,

    /// Stdio plumbing failed.
    #[error("subprocess I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl SubprocessError {
    /// Map to the stable [`ErrorCode`] taxonomy.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Config { .. } => ErrorCode::SubprocessSpawnFailed,
            Self::SpawnFailed { .. } => ErrorCode::SubprocessSpawnFailed,
            Self::Timeout { .. } => ErrorCode::SubprocessTimeout,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Io(_) => ErrorCode::Internal,
        }
    }
}

/// Outcome of a completed subprocess run.
///
/// A non-zero exit code is reported here, not raised as an error — the
/// caller decides what an exit status means.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessResult {
    /// `true` iff the child exited with status 0.
    pub success: bool,
    /// Exit code, when the child exited normally.
    pub exit_code: Option<i32>,
    /// Captured stdout (capped, lossy UTF-8).
    pub stdout: String,
    /// Captured stderr (capped, lossy UTF-8).
    pub stderr: String,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
}

#[derive(Debug)]
struct SubprocessConfig {
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<String>,
    timeout_ms: u64,
    input: Option<String>,
    capture_output: bool,
}

impl SubprocessConfig {
    fn decode(config: &Map<String, Value>) -> Result<Self, SubprocessError> {
        let command = str_key(config, "command").ok_or_else(|| SubprocessError::Config {
            reason: "missing required key: command".into(),
        })?;

        let mut env = BTreeMap::new();
        if let Some(Value::Object(map)) = config.get("env") {
            for (k, v) in map {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                env.insert(k.clone(), value);
            }
        }

        Ok(Self {
            command,
            args: string_vec_key(config, "args"),
            env,
            cwd: str_key(config, "cwd"),
            timeout_ms: u64_key(config, "timeout_ms").unwrap_or(DEFAULT_TIMEOUT_MS),
            input: str_key(config, "input"),
            capture_output: bool_key(config, "capture_output").unwrap_or(true),
        })
    }
}

/// The built-in `subprocess` primitive.
///
/// Stateless: one value per call site, owned only for the duration of the
/// call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubprocessPrimitive;

impl SubprocessPrimitive {
    /// Create the primitive.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Execute the merged config as a child process.
    ///
    /// # Errors
    ///
    /// Returns [`SubprocessError::SpawnFailed`] when the command cannot
    /// start, [`SubprocessError::Timeout`] when the wall clock expires, and
    /// [`SubprocessError::Cancelled`] when the token fires first. A child
    /// that runs to completion never errors, whatever its exit code.
    pub async fn execute(
        &self,
        config: &Map<String, Value>,
        cancel: &CancelToken,
    ) -> Result<SubprocessResult, SubprocessError> {
        let config = SubprocessConfig::decode(config)?;
        let started = Instant::now();

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(if config.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if config.capture_output {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(if config.capture_output {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &config.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|source| SubprocessError::SpawnFailed {
            command: config.command.clone(),
            source,
        })?;
        debug!(target: "kiwi.exec.subprocess", command = %config.command, "spawned");

        if let Some(input) = &config.input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await?;
            }
        }

        let stdout_task = spawn_capture(child.stdout.take());
        let stderr_task = spawn_capture(child.stderr.take());

        let timeout = Duration::from_millis(config.timeout_ms);
        let status = tokio::select! {
            status = child.wait() => status?,
            () = tokio::time::sleep(timeout) => {
                warn!(target: "kiwi.exec.subprocess", command = %config.command, timeout_ms = config.timeout_ms, "timeout; terminating");
                terminate(&mut child).await;
                return Err(SubprocessError::Timeout { timeout_ms: config.timeout_ms });
            }
            () = cancel.cancelled() => {
                warn!(target: "kiwi.exec.subprocess", command = %config.command, "cancelled; terminating");
                terminate(&mut child).await;
                return Err(SubprocessError::Cancelled);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let duration_ms = started.elapsed().as_millis() as u64;

        debug!(
            target: "kiwi.exec.subprocess",
            command = %config.command,
            exit = ?status.code(),
            duration_ms,
            "exited"
        );
        Ok(SubprocessResult {
            success: status.success(),
            exit_code: status.code(),
            stdout,
            stderr,
            duration_ms,
        })
    }
}

/// Terminate, give the child a grace period, then hard kill.
async fn terminate(child: &mut Child) {
    let _ = child.start_kill();
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
    let _ = child.wait().await;
}

/// Drain a stdio handle into a capped, lossy-UTF-8 string.
fn spawn_capture<R>(reader: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return String::new();
        };
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        let mut truncated = false;
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    if buf.len() < MAX_CAPTURE_BYTES {
                        let take = n.min(MAX_CAPTURE_BYTES - buf.len());
                        buf.extend_from_slice(&chunk[..take]);
                        if take < n {
                            truncated = true;
                        }
                    } else {
                        truncated = true;
                    }
                }
                Err(_) => break,
            }
        }
        let mut out = String::from_utf8_lossy(&buf).into_owned();
        if truncated {
            out.push_str(TRUNCATION_MARKER);
        }
        out
    })
}
