// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-runtime
//!
//! Orchestration layer.
//!
//! Responsibilities:
//! - resolve the requested tool's executor chain (fresh or lockfile-pinned)
//! - verify link integrity and validate parent→child compatibility
//! - merge configs and template runtime parameters
//! - instantiate sinks for streaming calls and route to the terminal primitive
//! - surface every warning on the outcome and release resources on all paths

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Sink instantiation for streaming calls.
mod sinks;

use std::collections::BTreeMap;
use std::sync::Arc;

use kiwi_chain::{
    ChainResolver, ChainValidator, IntegrityVerifier, ResolveError, SchemaCache, ValidateError,
    VerifyError,
};
use kiwi_config::LockfileMode;
use kiwi_core::{
    HTTP_CLIENT_TOOL_ID, ResolvedChain, SUBPROCESS_TOOL_ID, ToolId, ToolVersion,
};
use kiwi_error::{ErrorCode, KiwiError};
use kiwi_exec::{
    CancelToken, HttpPrimitive, HttpPrimitiveError, HttpResult, StreamSpec, SubprocessError,
    SubprocessPrimitive, SubprocessResult,
};
use kiwi_lockfile::{ChainDiff, Lockfile, LockfileError, LockfileManager, Scope};
use kiwi_registry::{StoreError, ToolStore};
use kiwi_sink::SinkError;
use kiwi_template::TemplateError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Default lockfile category when a tool declares none.
const DEFAULT_CATEGORY: &str = "tools";

/// Key carrying opaque harness credentials through `params`.
const AUTH_PARAM: &str = "__auth";

// ---------------------------------------------------------------------------
// Errors and stages
// ---------------------------------------------------------------------------

/// The stage a call was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Resolving the executor chain.
    Resolving,
    /// Verifying link integrity.
    Verifying,
    /// Validating parent→child schemas.
    Validating,
    /// Comparing the fresh chain against the lockfile.
    LockChecking,
    /// Merging configs and templating params.
    Merging,
    /// Running the terminal primitive.
    Executing,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Resolving => "resolving",
            Self::Verifying => "verifying",
            Self::Validating => "validating",
            Self::LockChecking => "lock_checking",
            Self::Merging => "merging",
            Self::Executing => "executing",
        };
        f.write_str(s)
    }
}

/// Errors from the executor facade.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The store failed or a tool is unknown.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Chain resolution failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// A link failed integrity verification.
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// A parent rejected its child.
    #[error(transparent)]
    Validate(#[from] ValidateError),

    /// Lockfile load, save, or drift check failed.
    #[error(transparent)]
    Lockfile(#[from] LockfileError),

    /// Config merging or parameter templating failed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The subprocess primitive failed.
    #[error(transparent)]
    Subprocess(#[from] SubprocessError),

    /// The HTTP primitive failed.
    #[error(transparent)]
    Http(#[from] HttpPrimitiveError),

    /// A sink could not be instantiated or closed.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The terminal link is not a primitive this runtime implements.
    #[error("unknown primitive: {tool_id}")]
    UnknownPrimitive {
        /// The unrecognised terminal tool.
        tool_id: ToolId,
    },

    /// The call was cancelled between stages.
    #[error("execution cancelled while {stage}")]
    Cancelled {
        /// The stage the cancellation interrupted.
        stage: Stage,
    },
}

impl ExecError {
    /// Map to the stable [`ErrorCode`] taxonomy.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Store(e) => e.error_code(),
            Self::Resolve(e) => e.error_code(),
            Self::Verify(e) => e.error_code(),
            Self::Validate(e) => e.error_code(),
            Self::Lockfile(e) => e.error_code(),
            Self::Template(e) => e.error_code(),
            Self::Subprocess(e) => e.error_code(),
            Self::Http(e) => e.error_code(),
            Self::Sink(e) => e.error_code(),
            Self::UnknownPrimitive { .. } => ErrorCode::ChainNotPrimitive,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
        }
    }

    /// The stage this error belongs to.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Store(_) | Self::Resolve(_) => Stage::Resolving,
            Self::Verify(_) => Stage::Verifying,
            Self::Validate(_) => Stage::Validating,
            Self::Lockfile(_) => Stage::LockChecking,
            Self::Template(_) => Stage::Merging,
            Self::Subprocess(_) | Self::Http(_) | Self::Sink(_) | Self::UnknownPrimitive { .. } => {
                Stage::Executing
            }
            Self::Cancelled { stage } => *stage,
        }
    }

    /// Convert into a structured [`KiwiError`] carrying the stage tag.
    #[must_use]
    pub fn into_kiwi_error(self) -> KiwiError {
        let code = self.error_code();
        let stage = self.stage();
        KiwiError::new(code, self.to_string()).with_context("stage", stage)
    }
}

// ---------------------------------------------------------------------------
// Options and outcome
// ---------------------------------------------------------------------------

/// Per-call options for [`ExecutorContext::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Pin versions from a saved lockfile and check drift.
    pub use_lockfile: bool,
    /// How lockfile drift is handled.
    pub lockfile_mode: LockfileMode,
    /// Skip integrity verification (test harnesses only).
    pub skip_verify_integrity: bool,
    /// Skip chain validation (test harnesses only).
    pub skip_validate_chain: bool,
    /// Lockfile category to search; defaults to the tool's own category.
    pub lockfile_category: Option<String>,
    /// Environment map for `${VAR}` template references.
    pub env: BTreeMap<String, String>,
    /// Cooperative cancellation token; a fresh one is used when absent.
    pub cancel: Option<CancelToken>,
}

/// Result of the terminal primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "primitive", rename_all = "snake_case")]
pub enum PrimitiveResult {
    /// The chain terminated in `subprocess`.
    Subprocess(SubprocessResult),
    /// The chain terminated in `http_client`.
    HttpClient(HttpResult),
}

impl PrimitiveResult {
    /// Whether the primitive reported success.
    #[must_use]
    pub fn success(&self) -> bool {
        match self {
            Self::Subprocess(r) => r.success,
            Self::HttpClient(r) => r.success,
        }
    }
}

/// Everything a completed call reports back to the harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// The requested leaf tool.
    pub tool_id: ToolId,
    /// `tool@version` of every chain link, leaf first.
    pub chain: Vec<String>,
    /// The primitive's result.
    pub result: PrimitiveResult,
    /// Advisory findings accumulated across stages; never swallowed.
    pub warnings: Vec<String>,
    /// Events fanned out in stream mode.
    pub stream_events_count: u64,
    /// Diagnostic names of the stream sinks.
    pub stream_destinations: Vec<String>,
}

// ---------------------------------------------------------------------------
// ExecutorContext
// ---------------------------------------------------------------------------

/// Central facade that owns the resolution, verification, validation, and
/// lockfile machinery and executes tools against the two primitives.
///
/// Shared and thread-safe: concurrent `execute` calls are supported; the
/// stage sequence is only ordered *within* a call.
pub struct ExecutorContext {
    store: Arc<dyn ToolStore>,
    registry_url: String,
    resolver: ChainResolver,
    verifier: IntegrityVerifier,
    validator: ChainValidator,
    schema_cache: Arc<SchemaCache>,
    lockfiles: LockfileManager,
    subprocess: SubprocessPrimitive,
    http: HttpPrimitive,
}

impl ExecutorContext {
    /// Create a context over a store, its registry URL (for lockfile
    /// provenance), and a lockfile manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn ToolStore>,
        registry_url: impl Into<String>,
        lockfiles: LockfileManager,
    ) -> Self {
        let schema_cache = Arc::new(SchemaCache::new());
        Self {
            resolver: ChainResolver::new(Arc::clone(&store)),
            verifier: IntegrityVerifier::new(),
            validator: ChainValidator::with_schema_cache(Arc::clone(&schema_cache)),
            schema_cache,
            store,
            registry_url: registry_url.into(),
            lockfiles,
            subprocess: SubprocessPrimitive::new(),
            http: HttpPrimitive::new(),
        }
    }

    /// The underlying tool store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ToolStore> {
        &self.store
    }

    /// The chain resolver (exposed for cache inspection).
    #[must_use]
    pub fn resolver(&self) -> &ChainResolver {
        &self.resolver
    }

    /// The shared schema compile cache.
    #[must_use]
    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        &self.schema_cache
    }

    /// The lockfile manager.
    #[must_use]
    pub fn lockfiles(&self) -> &LockfileManager {
        &self.lockfiles
    }

    /// Notify the context that `tool_id` was (re)published: evicts every
    /// cached chain containing it.
    pub fn invalidate_published(&self, tool_id: &ToolId) {
        self.resolver.invalidate_published(tool_id);
    }

    /// Resolve a tool's chain without executing.
    ///
    /// # Errors
    ///
    /// Returns the resolver's [`ExecError::Resolve`] taxonomy.
    pub async fn resolve(&self, tool_id: &ToolId) -> Result<Arc<ResolvedChain>, ExecError> {
        Ok(self.resolver.resolve(tool_id).await?)
    }

    /// Verify a tool's chain without executing.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Verify`] on the first tampered link.
    pub async fn verify(&self, tool_id: &ToolId) -> Result<Arc<ResolvedChain>, ExecError> {
        let chain = self.resolver.resolve(tool_id).await?;
        self.verifier.verify_chain(&chain)?;
        Ok(chain)
    }

    /// Freeze a tool's chain: resolve, verify, validate, pin.
    ///
    /// # Errors
    ///
    /// Any resolution, verification, or validation failure aborts the freeze.
    pub async fn freeze(&self, tool_id: &ToolId) -> Result<Lockfile, ExecError> {
        let chain = self.resolver.resolve(tool_id).await?;
        self.verifier.verify_chain(&chain)?;
        let report = self.validator.validate_chain(&chain)?;
        for warning in &report.warnings {
            warn!(target: "kiwi.runtime", %warning, "freeze warning");
        }
        info!(target: "kiwi.runtime", tool = %tool_id, chain = %chain.describe(), "chain frozen");
        Ok(Lockfile::from_chain(&chain, &self.registry_url))
    }

    /// Freeze and persist in one step; category comes from the leaf tool.
    ///
    /// # Errors
    ///
    /// Freeze errors plus [`ExecError::Lockfile`] on save failure.
    pub async fn freeze_and_save(
        &self,
        tool_id: &ToolId,
        scope: Scope,
    ) -> Result<(Lockfile, std::path::PathBuf), ExecError> {
        let lockfile = self.freeze(tool_id).await?;
        let category = self.category_of(tool_id).await;
        let path = self.lockfiles.save(&lockfile, &category, scope)?;
        Ok((lockfile, path))
    }

    /// Execute a tool: the full stage sequence of the runtime.
    ///
    /// # Errors
    ///
    /// Returns a stage-tagged [`ExecError`]; see [`ExecError::stage`].
    pub async fn execute(
        &self,
        tool_id: &ToolId,
        params: Map<String, Value>,
        options: ExecuteOptions,
    ) -> Result<ExecutionOutcome, ExecError> {
        let lockfile = if options.use_lockfile {
            let category = match &options.lockfile_category {
                Some(c) => Some(c.clone()),
                None => Some(self.category_of(tool_id).await),
            };
            self.lockfiles
                .load(tool_id.as_str(), None, category.as_deref())?
        } else {
            None
        };
        self.execute_inner(tool_id, params, options, lockfile).await
    }

    /// Execute against an explicit, already-loaded lockfile.
    ///
    /// # Errors
    ///
    /// As [`ExecutorContext::execute`].
    pub async fn execute_with_lockfile(
        &self,
        lockfile: &Lockfile,
        params: Map<String, Value>,
        options: ExecuteOptions,
    ) -> Result<ExecutionOutcome, ExecError> {
        let tool_id = lockfile.root.tool_id.clone();
        self.execute_inner(&tool_id, params, options, Some(lockfile.clone()))
            .await
    }

    async fn execute_inner(
        &self,
        tool_id: &ToolId,
        params: Map<String, Value>,
        options: ExecuteOptions,
        lockfile: Option<Lockfile>,
    ) -> Result<ExecutionOutcome, ExecError> {
        let cancel = options.cancel.clone().unwrap_or_default();
        let mut warnings = Vec::new();

        // Resolving.
        debug!(target: "kiwi.runtime", tool = %tool_id, stage = %Stage::Resolving, "stage");
        let chain: Arc<ResolvedChain> = match &lockfile {
            Some(lf) => Arc::new(
                self.pinned_chain(lf, options.lockfile_mode, &mut warnings)
                    .await?,
            ),
            None => {
                if options.use_lockfile {
                    warnings.push(format!("no lockfile found for {tool_id}; resolving fresh"));
                }
                self.resolver.resolve(tool_id).await?
            }
        };
        check_cancelled(&cancel, Stage::Verifying)?;

        // Verifying.
        if options.skip_verify_integrity {
            warnings.push("integrity verification skipped by caller".into());
        } else {
            debug!(target: "kiwi.runtime", tool = %tool_id, stage = %Stage::Verifying, "stage");
            self.verifier.verify_chain(&chain)?;
        }
        check_cancelled(&cancel, Stage::Validating)?;

        // Validating.
        if options.skip_validate_chain {
            warnings.push("chain validation skipped by caller".into());
        } else {
            debug!(target: "kiwi.runtime", tool = %tool_id, stage = %Stage::Validating, "stage");
            warnings.extend(self.validator.validate_chain(&chain)?.warnings);
        }
        check_cancelled(&cancel, Stage::LockChecking)?;

        // LockChecking: compare the fresh chain against the pin.
        if let Some(lf) = &lockfile {
            debug!(target: "kiwi.runtime", tool = %tool_id, stage = %Stage::LockChecking, "stage");
            let fresh = self.resolver.resolve(tool_id).await?;
            if let Err(e) = lf.validate_chain(&fresh) {
                match options.lockfile_mode {
                    LockfileMode::Strict => return Err(e.into()),
                    LockfileMode::Warn => {
                        warn!(target: "kiwi.runtime", tool = %tool_id, error = %e, "lockfile drift");
                        warnings.push(format!("lockfile drift: {e}"));
                    }
                }
            }
        }
        check_cancelled(&cancel, Stage::Merging)?;

        // Merging.
        debug!(target: "kiwi.runtime", tool = %tool_id, stage = %Stage::Merging, "stage");
        let mut merged = kiwi_template::prepare(&chain, &params, &options.env)?;
        if let Some(auth) = params.get(AUTH_PARAM) {
            // Opaque harness credentials: forwarded, never interpreted or logged.
            merged.insert(AUTH_PARAM.to_string(), auth.clone());
        }
        check_cancelled(&cancel, Stage::Executing)?;

        // Executing.
        debug!(target: "kiwi.runtime", tool = %tool_id, stage = %Stage::Executing, "stage");
        let primitive = chain
            .primitive()
            .expect("checked chains are never empty")
            .clone();
        let (result, stream_warnings) = self.run_primitive(&primitive, &merged, &cancel).await?;
        warnings.extend(stream_warnings);

        let outcome = ExecutionOutcome {
            tool_id: tool_id.clone(),
            chain: chain
                .iter()
                .map(|tv| format!("{}@{}", tv.tool_id, tv.version))
                .collect(),
            stream_events_count: match &result {
                PrimitiveResult::HttpClient(r) => r.stream_events_count,
                PrimitiveResult::Subprocess(_) => 0,
            },
            stream_destinations: match &result {
                PrimitiveResult::HttpClient(r) => r.stream_destinations.clone(),
                PrimitiveResult::Subprocess(_) => Vec::new(),
            },
            result,
            warnings,
        };
        info!(
            target: "kiwi.runtime",
            tool = %tool_id,
            success = outcome.result.success(),
            warnings = outcome.warnings.len(),
            "execution finished"
        );
        Ok(outcome)
    }

    async fn run_primitive(
        &self,
        primitive: &ToolVersion,
        merged: &Map<String, Value>,
        cancel: &CancelToken,
    ) -> Result<(PrimitiveResult, Vec<String>), ExecError> {
        match primitive.tool_id.as_str() {
            SUBPROCESS_TOOL_ID => {
                let result = self.subprocess.execute(merged, cancel).await?;
                Ok((PrimitiveResult::Subprocess(result), Vec::new()))
            }
            HTTP_CLIENT_TOOL_ID => {
                let stream_spec = StreamSpec::from_config(merged)?;
                let stream_mode = merged.get("mode").and_then(Value::as_str) == Some("stream")
                    || stream_spec.is_some();
                if stream_mode {
                    let spec = stream_spec.unwrap_or_else(|| {
                        serde_json::from_value(serde_json::json!({
                            "destinations": [{"type": "return"}]
                        }))
                        .expect("literal stream spec decodes")
                    });
                    self.run_http_stream(merged, &spec, cancel).await
                } else {
                    let result = self.http.execute(merged, cancel).await?;
                    Ok((PrimitiveResult::HttpClient(result), Vec::new()))
                }
            }
            _ => Err(ExecError::UnknownPrimitive {
                tool_id: primitive.tool_id.clone(),
            }),
        }
    }

    async fn run_http_stream(
        &self,
        merged: &Map<String, Value>,
        spec: &StreamSpec,
        cancel: &CancelToken,
    ) -> Result<(PrimitiveResult, Vec<String>), ExecError> {
        let mut warnings = Vec::new();
        let (mut sinks, return_buffer) = self.instantiate_sinks(spec).await?;

        let result = self.http.execute_stream(merged, &mut sinks, cancel).await;

        // Close in reverse construction order, on success and on error.
        let mut close_failure: Option<SinkError> = None;
        for sink in sinks.iter_mut().rev() {
            if let Err(e) = sink.close().await {
                warn!(target: "kiwi.runtime", sink = %e.sink_name, error = %e, "sink close failed");
                close_failure.get_or_insert(e);
            }
        }

        let mut http_result = result?;
        if let Some(e) = close_failure {
            return Err(ExecError::Sink(e));
        }

        if let Some(buffer) = return_buffer {
            if buffer.dropped() > 0 {
                warnings.push(format!(
                    "return sink dropped {} events over its {} cap",
                    buffer.dropped(),
                    spec.max_buffer_size
                ));
            }
            http_result.body = Some(Value::Array(buffer.events()));
        }
        warnings.extend(http_result.warnings.drain(..));
        Ok((PrimitiveResult::HttpClient(http_result), warnings))
    }

    /// Fetch the exact pinned versions, asserting registry integrity
    /// matches the pin.
    async fn pinned_chain(
        &self,
        lockfile: &Lockfile,
        mode: LockfileMode,
        warnings: &mut Vec<String>,
    ) -> Result<ResolvedChain, ExecError> {
        let mut links = Vec::new();
        for pinned in &lockfile.resolved_chain {
            let tv = self
                .store
                .version(&pinned.tool_id, &pinned.version)
                .await?
                .ok_or_else(|| StoreError::ToolNotFound {
                    tool_id: pinned.tool_id.clone(),
                    version: Some(pinned.version.clone()),
                })?;

            if tv.integrity != pinned.integrity {
                let diff = ChainDiff::IntegrityChanged {
                    tool_id: pinned.tool_id.clone(),
                    pinned: pinned.integrity.clone(),
                    fresh: tv.integrity.clone(),
                };
                match mode {
                    LockfileMode::Strict => {
                        return Err(LockfileError::Mismatch { diffs: vec![diff] }.into());
                    }
                    LockfileMode::Warn => {
                        warn!(target: "kiwi.runtime", tool = %pinned.tool_id, "pinned integrity drifted");
                        warnings.push(format!("lockfile drift: {diff}"));
                    }
                }
            }
            links.push(tv);
        }

        let chain = ResolvedChain::new(links);
        chain.check().map_err(ResolveError::Malformed)?;
        Ok(chain)
    }

    async fn category_of(&self, tool_id: &ToolId) -> String {
        match self.store.latest(tool_id).await {
            Ok(Some(tv)) => tv.category.unwrap_or_else(|| DEFAULT_CATEGORY.into()),
            _ => DEFAULT_CATEGORY.into(),
        }
    }
}

fn check_cancelled(cancel: &CancelToken, stage: Stage) -> Result<(), ExecError> {
    if cancel.is_cancelled() {
        Err(ExecError::Cancelled { stage })
    } else {
        Ok(())
    }
}
