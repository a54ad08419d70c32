// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The `kiwi` command-line driver.

mod output;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use kiwi_config::{KiwiConfig, LockfileMode, RegistrySource, load_config};
use kiwi_core::ToolId;
use kiwi_lockfile::{LockfileManager, Scope};
use kiwi_registry::{HttpRegistry, LocalStore, ToolStore};
use kiwi_runtime::{ExecuteOptions, ExecutorContext};
use tracing_subscriber::EnvFilter;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "kiwi", version, about = "Local-first execution runtime for composable tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a kiwi.toml config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Registry override: an http(s) URL or a local directory.
    #[arg(long, global = true)]
    registry: Option<String>,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a tool through its resolved chain.
    Run {
        /// Tool id to execute.
        tool: String,

        /// Runtime params as key=value (value parsed as JSON, else string).
        /// Can be repeated.
        #[arg(long = "param")]
        params: Vec<String>,

        /// Environment entries for `${VAR}` templates as KEY=VALUE.
        #[arg(long = "env")]
        env_vars: Vec<String>,

        /// Pin versions from a saved lockfile.
        #[arg(long)]
        use_lockfile: bool,

        /// Lockfile drift handling.
        #[arg(long, value_enum, default_value_t = ModeArg::Warn)]
        lockfile_mode: ModeArg,

        /// Print JSON instead of pretty output.
        #[arg(long)]
        json: bool,
    },

    /// Resolve and print a tool's executor chain.
    Resolve {
        /// Tool id to resolve.
        tool: String,

        /// Print JSON instead of pretty output.
        #[arg(long)]
        json: bool,
    },

    /// Resolve a chain and verify every link's integrity.
    Verify {
        /// Tool id to verify.
        tool: String,
    },

    /// Freeze a tool's chain into a lockfile.
    Freeze {
        /// Tool id to freeze.
        tool: String,

        /// Save under the user scope instead of the project scope.
        #[arg(long)]
        user: bool,
    },

    /// Inspect and manage saved lockfiles.
    Lockfiles {
        #[command(subcommand)]
        command: LockfileCommands,
    },

    /// Print a saved lockfile.
    Inspect {
        /// Tool id whose lockfile to print.
        tool: String,

        /// Specific pinned version (defaults to the latest pin).
        #[arg(long)]
        version: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum LockfileCommands {
    /// List indexed lockfiles per scope.
    List,

    /// Delete lockfiles older than the age threshold.
    Prune {
        /// Age threshold in days (defaults to the config value).
        #[arg(long)]
        max_age_days: Option<u32>,
    },
}

/// Lockfile mode argument.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Log drift and continue.
    Warn,
    /// Fail on drift.
    Strict,
}

impl From<ModeArg> for LockfileMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Warn => LockfileMode::Warn,
            ModeArg::Strict => LockfileMode::Strict,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(registry) = &cli.registry {
        config.registry = Some(if registry.starts_with("http") {
            RegistrySource::Http {
                url: registry.clone(),
            }
        } else {
            RegistrySource::Local {
                path: registry.clone(),
            }
        });
    }
    for warning in config.validate()? {
        tracing::warn!(target: "kiwi.cli", %warning, "config warning");
    }

    let ctx = build_context(&config)?;

    match cli.command {
        Commands::Run {
            tool,
            params,
            env_vars,
            use_lockfile,
            lockfile_mode,
            json,
        } => {
            let tool: ToolId = tool.parse()?;
            let params = parse_params(&params)?;
            let options = ExecuteOptions {
                use_lockfile,
                lockfile_mode: lockfile_mode.into(),
                env: parse_env(&env_vars)?,
                ..ExecuteOptions::default()
            };
            match ctx.execute(&tool, params, options).await {
                Ok(outcome) => output::print_outcome(&outcome, json)?,
                Err(e) => {
                    let structured = e.into_kiwi_error();
                    bail!("{structured}");
                }
            }
        }

        Commands::Resolve { tool, json } => {
            let tool: ToolId = tool.parse()?;
            let chain = ctx.resolve(&tool).await.map_err(|e| anyhow::anyhow!("{e}"))?;
            output::print_chain(&chain, json)?;
        }

        Commands::Verify { tool } => {
            let tool: ToolId = tool.parse()?;
            let chain = ctx.verify(&tool).await.map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("ok: {} links verified ({})", chain.len(), chain.describe());
        }

        Commands::Freeze { tool, user } => {
            let tool: ToolId = tool.parse()?;
            let scope = if user { Scope::User } else { Scope::Project };
            let (lockfile, path) = ctx
                .freeze_and_save(&tool, scope)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!(
                "frozen {}@{} (chain {}) -> {}",
                lockfile.root.tool_id,
                lockfile.root.version,
                lockfile.chain_hash,
                path.display()
            );
        }

        Commands::Lockfiles { command } => match command {
            LockfileCommands::List => {
                for scope in [Scope::Project, Scope::User] {
                    output::print_index(scope, &ctx.lockfiles().index(scope));
                }
            }
            LockfileCommands::Prune { max_age_days } => {
                let days = max_age_days
                    .or(config.prune_max_age_days)
                    .context("no prune age configured; pass --max-age-days")?;
                let removed = ctx.lockfiles().prune_stale(days, None)?;
                println!("pruned {removed} lockfile(s) older than {days} days");
            }
        },

        Commands::Inspect { tool, version } => {
            let lockfile = ctx
                .lockfiles()
                .load(&tool, version.as_deref(), None)?
                .with_context(|| format!("no lockfile found for {tool}"))?;
            println!("{}", serde_json::to_string_pretty(&lockfile)?);
        }
    }

    Ok(())
}

fn build_context(config: &KiwiConfig) -> Result<ExecutorContext> {
    let (store, registry_url): (Arc<dyn ToolStore>, String) = match &config.registry {
        Some(RegistrySource::Http { url }) => {
            (Arc::new(HttpRegistry::new(url)), url.clone())
        }
        Some(RegistrySource::Local { path }) => (
            Arc::new(LocalStore::new(path)),
            format!("file://{path}"),
        ),
        None => bail!("no registry configured; pass --registry or set one in kiwi.toml"),
    };

    let project_dir = config
        .project_dir
        .clone()
        .unwrap_or_else(|| ".kiwi".to_string());
    let user_dir = config.user_dir.clone().unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.kiwi")
    });

    Ok(ExecutorContext::new(
        store,
        registry_url,
        LockfileManager::new(project_dir, user_dir),
    ))
}

/// Parse repeated `key=value` params; values that parse as JSON stay typed.
fn parse_params(raw: &[String]) -> Result<serde_json::Map<String, serde_json::Value>> {
    let mut params = serde_json::Map::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("param must be key=value: {entry}"))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

fn parse_env(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("env must be KEY=VALUE: {entry}"))?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_parse_typed_json_with_string_fallback() {
        let params = parse_params(&[
            "count=3".to_string(),
            "city=wellington".to_string(),
            "flags=[1,2]".to_string(),
        ])
        .unwrap();
        assert_eq!(params["count"], serde_json::json!(3));
        assert_eq!(params["city"], serde_json::json!("wellington"));
        assert_eq!(params["flags"], serde_json::json!([1, 2]));
    }

    #[test]
    fn malformed_param_is_rejected() {
        assert!(parse_params(&["no-equals".to_string()]).is_err());
    }

    #[test]
    fn cli_parses_run_with_flags() {
        let cli = Cli::parse_from([
            "kiwi",
            "--registry",
            "https://registry.test",
            "run",
            "weather",
            "--param",
            "city=lima",
            "--use-lockfile",
            "--lockfile-mode",
            "strict",
        ]);
        match cli.command {
            Commands::Run {
                tool,
                params,
                use_lockfile,
                ..
            } => {
                assert_eq!(tool, "weather");
                assert_eq!(params, vec!["city=lima".to_string()]);
                assert!(use_lockfile);
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }
}
