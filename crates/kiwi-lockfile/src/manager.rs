// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scoped lockfile storage and the `.index.json`.
//!
//! Layout per scope root:
//!
//! ```text
//! <root>/lockfiles/<category>/<tool>@<version>[.<chain_hash>].lock.json
//! <root>/lockfiles/.index.json
//! ```
//!
//! Project scope wins over user scope on lookup. The index is rewritten
//! atomically (temp file, fsync, rename) under an in-process lock; a missing
//! or stale index degrades to a directory scan, never to an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Lockfile, LockfileError};

const LOCKFILES_DIR: &str = "lockfiles";
const INDEX_FILE: &str = ".index.json";
const LOCK_SUFFIX: &str = ".lock.json";

/// Which root a lockfile lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The project directory; wins on lookup.
    Project,
    /// The user config directory.
    User,
}

/// Index metadata for one saved lockfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IndexEntry {
    /// Root tool id.
    pub tool_id: String,
    /// Pinned root version.
    pub version: String,
    /// Lockfile category.
    pub category: String,
    /// The pinned chain's hash.
    pub chain_hash: String,
    /// File path relative to the scope's `lockfiles/` directory.
    pub path: String,
    /// When the lockfile was frozen.
    pub generated_at: DateTime<Utc>,
    /// Whether this is the highest pinned version of the tool in its category.
    pub is_latest: bool,
}

/// The per-scope `.index.json`: logical key → file + metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LockfileIndex {
    /// Entries keyed by `<category>/<tool>@<version>`.
    #[serde(default)]
    pub entries: BTreeMap<String, IndexEntry>,
}

impl LockfileIndex {
    fn key(category: &str, tool_id: &str, version: &str) -> String {
        format!("{category}/{tool_id}@{version}")
    }

    /// Recompute `is_latest` across every `(category, tool_id)` group.
    fn restamp_latest(&mut self) {
        let mut best: BTreeMap<(String, String), (semver::Version, String)> = BTreeMap::new();
        for (key, entry) in &self.entries {
            let Ok(version) = semver::Version::parse(&entry.version) else {
                continue;
            };
            let group = (entry.category.clone(), entry.tool_id.clone());
            match best.get(&group) {
                Some((existing, _)) if *existing >= version => {}
                _ => {
                    best.insert(group, (version, key.clone()));
                }
            }
        }
        let winners: std::collections::BTreeSet<String> =
            best.into_values().map(|(_, key)| key).collect();
        for (key, entry) in &mut self.entries {
            entry.is_latest = winners.contains(key);
        }
    }
}

/// Scoped lockfile store with an atomically maintained index.
pub struct LockfileManager {
    project_root: PathBuf,
    user_root: PathBuf,
    index_guard: Mutex<()>,
}

impl LockfileManager {
    /// Create a manager over the two scope roots.
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>, user_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            user_root: user_root.into(),
            index_guard: Mutex::new(()),
        }
    }

    fn scope_dir(&self, scope: Scope) -> PathBuf {
        let root = match scope {
            Scope::Project => &self.project_root,
            Scope::User => &self.user_root,
        };
        root.join(LOCKFILES_DIR)
    }

    /// Persist a lockfile under the given category and scope.
    ///
    /// When a sibling with the same `(tool, version)` but a different chain
    /// already exists, the file name gains the chain hash instead of
    /// clobbering the sibling.
    ///
    /// # Errors
    ///
    /// Returns [`LockfileError::Io`] on filesystem failure.
    pub fn save(
        &self,
        lockfile: &Lockfile,
        category: &str,
        scope: Scope,
    ) -> Result<PathBuf, LockfileError> {
        let dir = self.scope_dir(scope).join(category);
        std::fs::create_dir_all(&dir).map_err(|source| LockfileError::Io {
            context: format!("create {}", dir.display()),
            source,
        })?;

        let base_name = format!("{}@{}{LOCK_SUFFIX}", lockfile.root.tool_id, lockfile.root.version);
        let base_path = dir.join(&base_name);
        let file_name = match read_lockfile(&base_path) {
            Ok(Some(existing)) if existing.chain_hash != lockfile.chain_hash => format!(
                "{}@{}.{}{LOCK_SUFFIX}",
                lockfile.root.tool_id, lockfile.root.version, lockfile.chain_hash
            ),
            _ => base_name,
        };
        let path = dir.join(&file_name);

        let json = serde_json::to_string_pretty(lockfile).map_err(|e| LockfileError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        std::fs::write(&path, json).map_err(|source| LockfileError::Io {
            context: format!("write {}", path.display()),
            source,
        })?;

        self.update_index(scope, |index| {
            let key = LockfileIndex::key(category, lockfile.root.tool_id.as_str(), &lockfile.root.version);
            index.entries.insert(
                key,
                IndexEntry {
                    tool_id: lockfile.root.tool_id.to_string(),
                    version: lockfile.root.version.clone(),
                    category: category.to_string(),
                    chain_hash: lockfile.chain_hash.clone(),
                    path: format!("{category}/{file_name}"),
                    generated_at: lockfile.generated_at,
                    is_latest: false,
                },
            );
            index.restamp_latest();
        })?;

        debug!(target: "kiwi.lockfile", path = %path.display(), "lockfile saved");
        Ok(path)
    }

    /// Load a lockfile, project scope first, then user scope.
    ///
    /// `version: None` selects the `is_latest` entry; `category: None`
    /// searches every category.
    ///
    /// # Errors
    ///
    /// Returns [`LockfileError::Corrupt`] when an indexed file cannot be
    /// parsed, [`LockfileError::Io`] on filesystem failure.
    pub fn load(
        &self,
        tool_id: &str,
        version: Option<&str>,
        category: Option<&str>,
    ) -> Result<Option<Lockfile>, LockfileError> {
        for scope in [Scope::Project, Scope::User] {
            if let Some(found) = self.load_in_scope(scope, tool_id, version, category)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn load_in_scope(
        &self,
        scope: Scope,
        tool_id: &str,
        version: Option<&str>,
        category: Option<&str>,
    ) -> Result<Option<Lockfile>, LockfileError> {
        let dir = self.scope_dir(scope);
        if !dir.exists() {
            return Ok(None);
        }

        // Fast path: the index.
        if let Some(index) = self.read_index(scope) {
            let entry = index
                .entries
                .values()
                .filter(|e| e.tool_id == tool_id)
                .filter(|e| category.is_none_or(|c| e.category == c))
                .find(|e| version.map_or(e.is_latest, |v| e.version == v));
            if let Some(entry) = entry {
                let path = dir.join(&entry.path);
                if let Some(lockfile) = read_lockfile(&path)? {
                    return Ok(Some(lockfile));
                }
                warn!(target: "kiwi.lockfile", path = %path.display(), "index points at a missing file; rescanning");
            }
        }

        // Fallback: scan the category directories.
        self.scan_scope(scope, tool_id, version, category)
    }

    fn scan_scope(
        &self,
        scope: Scope,
        tool_id: &str,
        version: Option<&str>,
        category: Option<&str>,
    ) -> Result<Option<Lockfile>, LockfileError> {
        let dir = self.scope_dir(scope);
        let mut best: Option<(semver::Version, Lockfile)> = None;

        for category_dir in list_dirs(&dir)? {
            if let Some(wanted) = category
                && category_dir.file_name().and_then(|n| n.to_str()) != Some(wanted)
            {
                continue;
            }
            for path in list_lockfiles(&category_dir)? {
                let Some(lockfile) = read_lockfile(&path).unwrap_or_else(|e| {
                    warn!(target: "kiwi.lockfile", path = %path.display(), error = %e, "skipping unreadable lockfile");
                    None
                }) else {
                    continue;
                };
                if lockfile.root.tool_id.as_str() != tool_id {
                    continue;
                }
                match version {
                    Some(v) => {
                        if lockfile.root.version == v {
                            return Ok(Some(lockfile));
                        }
                    }
                    None => {
                        if let Ok(parsed) = semver::Version::parse(&lockfile.root.version)
                            && best.as_ref().is_none_or(|(b, _)| parsed > *b)
                        {
                            best = Some((parsed, lockfile));
                        }
                    }
                }
            }
        }
        Ok(best.map(|(_, lf)| lf))
    }

    /// Delete lockfiles older than `max_age_days`; returns the count removed.
    ///
    /// `scope: None` prunes both scopes.
    ///
    /// # Errors
    ///
    /// Returns [`LockfileError::Io`] on filesystem failure.
    pub fn prune_stale(
        &self,
        max_age_days: u32,
        scope: Option<Scope>,
    ) -> Result<usize, LockfileError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_age_days));
        let scopes: &[Scope] = match scope {
            Some(s) => &[s][..],
            None => &[Scope::Project, Scope::User],
        };

        let mut removed = 0usize;
        for &scope in scopes {
            let dir = self.scope_dir(scope);
            for category_dir in list_dirs(&dir)? {
                for path in list_lockfiles(&category_dir)? {
                    let stamp = read_lockfile(&path)
                        .ok()
                        .flatten()
                        .map(|lf| lf.generated_at)
                        .or_else(|| file_mtime(&path));
                    let Some(stamp) = stamp else { continue };
                    if stamp < cutoff {
                        std::fs::remove_file(&path).map_err(|source| LockfileError::Io {
                            context: format!("remove {}", path.display()),
                            source,
                        })?;
                        removed += 1;
                        debug!(target: "kiwi.lockfile", path = %path.display(), "pruned stale lockfile");
                    }
                }
            }
            if removed > 0 {
                self.update_index(scope, |index| {
                    let root = self.scope_dir(scope);
                    index.entries.retain(|_, e| root.join(&e.path).exists());
                    index.restamp_latest();
                })?;
            }
        }
        Ok(removed)
    }

    /// Snapshot of a scope's index (empty when absent or unreadable).
    #[must_use]
    pub fn index(&self, scope: Scope) -> LockfileIndex {
        self.read_index(scope).unwrap_or_default()
    }

    fn read_index(&self, scope: Scope) -> Option<LockfileIndex> {
        let path = self.scope_dir(scope).join(INDEX_FILE);
        let json = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&json) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!(target: "kiwi.lockfile", path = %path.display(), error = %e, "index unreadable; ignoring");
                None
            }
        }
    }

    /// Rewrite a scope's index atomically: temp file, fsync, rename.
    fn update_index(
        &self,
        scope: Scope,
        mutate: impl FnOnce(&mut LockfileIndex),
    ) -> Result<(), LockfileError> {
        let _guard = self.index_guard.lock().expect("index lock poisoned");

        let dir = self.scope_dir(scope);
        std::fs::create_dir_all(&dir).map_err(|source| LockfileError::Io {
            context: format!("create {}", dir.display()),
            source,
        })?;

        let mut index = self.read_index(scope).unwrap_or_default();
        mutate(&mut index);

        let json = serde_json::to_string_pretty(&index).expect("index serialises");
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|source| LockfileError::Io {
            context: format!("create temp index in {}", dir.display()),
            source,
        })?;
        std::io::Write::write_all(tmp.as_file_mut(), json.as_bytes()).map_err(|source| {
            LockfileError::Io {
                context: "write temp index".into(),
                source,
            }
        })?;
        tmp.as_file().sync_all().map_err(|source| LockfileError::Io {
            context: "sync temp index".into(),
            source,
        })?;
        let path = dir.join(INDEX_FILE);
        tmp.persist(&path).map_err(|e| LockfileError::Io {
            context: format!("rename temp index to {}", path.display()),
            source: e.error,
        })?;
        Ok(())
    }
}

fn read_lockfile(path: &Path) -> Result<Option<Lockfile>, LockfileError> {
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LockfileError::Io {
                context: format!("read {}", path.display()),
                source,
            });
        }
    };
    serde_json::from_str(&json)
        .map(Some)
        .map_err(|e| LockfileError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

fn list_dirs(dir: &Path) -> Result<Vec<PathBuf>, LockfileError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(LockfileError::Io {
                context: format!("read {}", dir.display()),
                source,
            });
        }
    };
    let mut dirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn list_lockfiles(dir: &Path) -> Result<Vec<PathBuf>, LockfileError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(LockfileError::Io {
                context: format!("read {}", dir.display()),
                source,
            });
        }
    };
    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(LOCK_SUFFIX))
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_core::{ResolvedChain, ToolType, ToolVersionBuilder};

    fn chain(version: &str, marker: u64) -> ResolvedChain {
        ResolvedChain::new(vec![
            ToolVersionBuilder::new("weather", version, ToolType::Script)
                .executor("subprocess")
                .config(serde_json::json!({"marker": marker}))
                .build()
                .unwrap(),
            ToolVersionBuilder::new("subprocess", "1.0.0", ToolType::Primitive)
                .build()
                .unwrap(),
        ])
    }

    fn manager(dir: &tempfile::TempDir) -> LockfileManager {
        LockfileManager::new(dir.path().join("project"), dir.path().join("user"))
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let lf = Lockfile::from_chain(&chain("2.1.0", 1), "r");

        let path = mgr.save(&lf, "scripts", Scope::Project).unwrap();
        assert!(path.ends_with("scripts/weather@2.1.0.lock.json"));

        let loaded = mgr.load("weather", Some("2.1.0"), Some("scripts")).unwrap().unwrap();
        assert_eq!(loaded, lf);
    }

    #[test]
    fn project_scope_wins_over_user_scope() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let project_lf = Lockfile::from_chain(&chain("2.1.0", 1), "project-registry");
        let user_lf = Lockfile::from_chain(&chain("2.1.0", 2), "user-registry");

        mgr.save(&user_lf, "scripts", Scope::User).unwrap();
        mgr.save(&project_lf, "scripts", Scope::Project).unwrap();

        let loaded = mgr.load("weather", Some("2.1.0"), None).unwrap().unwrap();
        assert_eq!(loaded.registry.url, "project-registry");
    }

    #[test]
    fn load_without_version_picks_latest() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.save(&Lockfile::from_chain(&chain("1.9.0", 1), "r"), "scripts", Scope::Project)
            .unwrap();
        mgr.save(&Lockfile::from_chain(&chain("1.10.0", 2), "r"), "scripts", Scope::Project)
            .unwrap();

        let loaded = mgr.load("weather", None, None).unwrap().unwrap();
        assert_eq!(loaded.root.version, "1.10.0");
    }

    #[test]
    fn differing_chain_gets_a_hash_suffixed_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let first = Lockfile::from_chain(&chain("2.1.0", 1), "r");
        let second = Lockfile::from_chain(&chain("2.1.0", 2), "r");
        assert_ne!(first.chain_hash, second.chain_hash);

        let first_path = mgr.save(&first, "scripts", Scope::Project).unwrap();
        let second_path = mgr.save(&second, "scripts", Scope::Project).unwrap();

        assert_ne!(first_path, second_path);
        assert!(first_path.exists());
        assert!(
            second_path
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .contains(&second.chain_hash)
        );
    }

    #[test]
    fn index_tracks_is_latest() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.save(&Lockfile::from_chain(&chain("1.0.0", 1), "r"), "scripts", Scope::Project)
            .unwrap();
        mgr.save(&Lockfile::from_chain(&chain("2.0.0", 2), "r"), "scripts", Scope::Project)
            .unwrap();

        let index = mgr.index(Scope::Project);
        let latest: Vec<&IndexEntry> = index.entries.values().filter(|e| e.is_latest).collect();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, "2.0.0");
    }

    #[test]
    fn load_survives_a_deleted_index() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let lf = Lockfile::from_chain(&chain("2.1.0", 1), "r");
        mgr.save(&lf, "scripts", Scope::Project).unwrap();

        std::fs::remove_file(dir.path().join("project/lockfiles/.index.json")).unwrap();
        let loaded = mgr.load("weather", Some("2.1.0"), None).unwrap().unwrap();
        assert_eq!(loaded, lf);
    }

    #[test]
    fn corrupt_lockfile_is_reported_when_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let lf = Lockfile::from_chain(&chain("2.1.0", 1), "r");
        let path = mgr.save(&lf, "scripts", Scope::Project).unwrap();
        std::fs::write(&path, "{broken").unwrap();

        let err = mgr.load("weather", Some("2.1.0"), None).unwrap_err();
        assert!(matches!(err, LockfileError::Corrupt { .. }));
    }

    #[test]
    fn prune_removes_old_files_and_reindexes() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let mut old = Lockfile::from_chain(&chain("1.0.0", 1), "r");
        old.generated_at = Utc::now() - chrono::Duration::days(45);
        mgr.save(&old, "scripts", Scope::Project).unwrap();
        mgr.save(&Lockfile::from_chain(&chain("2.0.0", 2), "r"), "scripts", Scope::Project)
            .unwrap();

        let removed = mgr.prune_stale(30, Some(Scope::Project)).unwrap();
        assert_eq!(removed, 1);

        assert!(mgr.load("weather", Some("1.0.0"), None).unwrap().is_none());
        assert!(mgr.load("weather", Some("2.0.0"), None).unwrap().is_some());
        let index = mgr.index(Scope::Project);
        assert_eq!(index.entries.len(), 1);
    }

    #[test]
    fn missing_tool_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        assert!(mgr.load("ghost", None, None).unwrap().is_none());
    }
}
