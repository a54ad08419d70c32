// SPDX-License-Identifier: MIT OR Apache-2.0
//! Smoke tests for the `kiwi` binary against a local directory registry.

use assert_cmd::Command;
use kiwi_core::{ToolType, ToolVersionBuilder};
use kiwi_registry::LocalStore;
use predicates::prelude::*;

fn seed_registry(dir: &std::path::Path) {
    let store = LocalStore::new(dir);
    store
        .put(
            &ToolVersionBuilder::new("hello", "1.0.0", ToolType::Script)
                .executor("subprocess")
                .config(serde_json::json!({"command": "sh", "args": ["-c", "echo hi there"]}))
                .build()
                .unwrap(),
        )
        .unwrap();
    store
        .put(
            &ToolVersionBuilder::new("subprocess", "1.0.0", ToolType::Primitive)
                .build()
                .unwrap(),
        )
        .unwrap();
}

fn kiwi() -> Command {
    Command::cargo_bin("kiwi").expect("kiwi binary builds")
}

#[test]
fn resolve_prints_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    seed_registry(dir.path());

    kiwi()
        .args(["--registry", dir.path().to_str().unwrap(), "resolve", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello@1.0.0"))
        .stdout(predicate::str::contains("subprocess@1.0.0 (primitive)"));
}

#[test]
fn run_executes_and_prints_stdout() {
    let dir = tempfile::tempdir().unwrap();
    seed_registry(dir.path());

    kiwi()
        .current_dir(dir.path())
        .args(["--registry", dir.path().to_str().unwrap(), "run", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hi there"));
}

#[test]
fn verify_reports_link_count() {
    let dir = tempfile::tempdir().unwrap();
    seed_registry(dir.path());

    kiwi()
        .args(["--registry", dir.path().to_str().unwrap(), "verify", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 links verified"));
}

#[test]
fn freeze_writes_a_lockfile() {
    let dir = tempfile::tempdir().unwrap();
    seed_registry(dir.path());

    kiwi()
        .current_dir(dir.path())
        .args(["--registry", dir.path().to_str().unwrap(), "freeze", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("frozen hello@1.0.0"));

    assert!(
        dir.path()
            .join(".kiwi/lockfiles/tools/hello@1.0.0.lock.json")
            .exists()
    );
}

#[test]
fn unknown_tool_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    seed_registry(dir.path());

    kiwi()
        .args(["--registry", dir.path().to_str().unwrap(), "resolve", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tool not found"));
}
