// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pretty and JSON rendering for CLI results.

use anyhow::Result;
use kiwi_core::ResolvedChain;
use kiwi_lockfile::{LockfileIndex, Scope};
use kiwi_runtime::{ExecutionOutcome, PrimitiveResult};

/// Print an execution outcome, pretty by default.
pub fn print_outcome(outcome: &ExecutionOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    println!("tool:  {}", outcome.tool_id);
    println!("chain: {}", outcome.chain.join(" -> "));
    match &outcome.result {
        PrimitiveResult::Subprocess(r) => {
            println!(
                "exit:  {} ({} ms)",
                r.exit_code.map_or("signal".to_string(), |c| c.to_string()),
                r.duration_ms
            );
            if !r.stdout.is_empty() {
                println!("--- stdout ---");
                print!("{}", r.stdout);
                if !r.stdout.ends_with('\n') {
                    println!();
                }
            }
            if !r.stderr.is_empty() {
                println!("--- stderr ---");
                print!("{}", r.stderr);
                if !r.stderr.ends_with('\n') {
                    println!();
                }
            }
        }
        PrimitiveResult::HttpClient(r) => {
            println!(
                "http:  status {} {}",
                r.status.map_or("?".to_string(), |s| s.to_string()),
                if r.success { "ok" } else { "failed" }
            );
            if r.stream_events_count > 0 {
                println!(
                    "stream: {} events -> [{}]",
                    r.stream_events_count,
                    r.stream_destinations.join(", ")
                );
            }
            if let Some(body) = &r.body {
                println!("--- body ---");
                println!("{}", serde_json::to_string_pretty(body)?);
            }
        }
    }
    for warning in &outcome.warnings {
        println!("warning: {warning}");
    }
    Ok(())
}

/// Print a resolved chain, pretty by default.
pub fn print_chain(chain: &ResolvedChain, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(chain)?);
        return Ok(());
    }
    for (i, link) in chain.iter().enumerate() {
        let marker = if link.tool_type.is_primitive() {
            " (primitive)"
        } else {
            ""
        };
        println!(
            "{:indent$}{}@{}{marker}",
            "",
            link.tool_id,
            link.version,
            indent = i * 2
        );
    }
    Ok(())
}

/// Print one scope's lockfile index.
pub fn print_index(scope: Scope, index: &LockfileIndex) {
    let label = match scope {
        Scope::Project => "project",
        Scope::User => "user",
    };
    if index.entries.is_empty() {
        println!("{label}: (none)");
        return;
    }
    println!("{label}:");
    for (key, entry) in &index.entries {
        let latest = if entry.is_latest { " [latest]" } else { "" };
        println!(
            "  {key} chain={} frozen={}{latest}",
            entry.chain_hash,
            entry.generated_at.format("%Y-%m-%d")
        );
    }
}
