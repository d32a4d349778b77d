//! Garbage collection: root tracking and the mark/sweep collector.
//!
//! Roots are symlinks registered in the gc-roots directory; the collector
//! walks from them through `runtime-dependencies` and `build.import`
//! edges, retains the transitive closure, and removes everything else.
//! Source cache entries are swept by their retention tag instead: a tag
//! policy of `forever` keeps an entry unconditionally, `days(n)` removes
//! unreferenced entries older than `n` days.
//!
//! Collection takes the store lock exclusively, so it never races an
//! in-flight build.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::build_spec::ArtifactId;
use crate::build_store::{BUILD_JSON, BuildStore, StoreError};
use crate::fileutil::{atomic_symlink, dir_size, silent_unlink};
use crate::source_cache::{RetentionTag, SourceCache, SourceError, SourceKey};
use crate::store_lock::{StoreLock, StoreLockError};

#[derive(Debug, Error)]
pub enum GcError {
  #[error("artifact {id} is not present in the store")]
  RootNotPresent { id: String },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Source(#[from] SourceError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error("{op} '{path}': {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> GcError + 'a {
  move |source| GcError::Io { op, path: path.to_path_buf(), source }
}

/// How long unreferenced source entries of a tag are retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
  Forever,
  Days(u64),
}

/// Per-tag retention policy; tags without an entry default to `Forever`.
pub type RetentionPolicy = BTreeMap<RetentionTag, Retention>;

#[derive(Debug, Default, Serialize)]
pub struct GcStats {
  pub artifacts_scanned: usize,
  pub artifacts_deleted: usize,
  pub artifacts_bytes_freed: u64,
  pub sources_scanned: usize,
  pub sources_deleted: usize,
  pub sources_bytes_freed: u64,
}

impl GcStats {
  pub fn total_deleted(&self) -> usize {
    self.artifacts_deleted + self.sources_deleted
  }

  pub fn total_bytes_freed(&self) -> u64 {
    self.artifacts_bytes_freed + self.sources_bytes_freed
  }
}

#[derive(Debug, Serialize)]
pub struct GcResult {
  pub stats: GcStats,
  pub deleted_paths: Vec<PathBuf>,
}

/// The directory of registered GC roots.
///
/// Each user-visible symlink (e.g. a profile link in a home directory) is
/// mirrored by an entry here named `_` + base64 of the link path, so roots
/// are registered and dropped explicitly; the collector never infers roots
/// from filesystem scans.
pub struct GcRoots {
  dir: PathBuf,
}

impl GcRoots {
  pub fn new(dir: &Path) -> Self {
    Self { dir: dir.to_path_buf() }
  }

  fn entry_for(&self, link_path: &Path) -> PathBuf {
    let encoded = URL_SAFE_NO_PAD.encode(link_path.as_os_str().as_encoded_bytes());
    self.dir.join(format!("_{}", encoded))
  }

  /// Create (or atomically replace) `link_path` pointing at the artifact,
  /// and register it as a GC root.
  pub fn add(
    &self,
    store: &BuildStore,
    id: &ArtifactId,
    link_path: &Path,
  ) -> Result<(), GcError> {
    let artifact_dir = store
      .resolve_id(id)?
      .ok_or_else(|| GcError::RootNotPresent { id: id.to_string() })?;
    fs::create_dir_all(&self.dir).map_err(io_err("mkdir", &self.dir))?;
    atomic_symlink(&artifact_dir, link_path).map_err(io_err("symlink", link_path))?;
    atomic_symlink(link_path, &self.entry_for(link_path)).map_err(io_err("symlink", &self.dir))?;
    info!(id = %id, link = %link_path.display(), "registered gc root");
    Ok(())
  }

  /// Drop the registration and the user-visible symlink.
  pub fn remove(&self, link_path: &Path) -> Result<(), GcError> {
    silent_unlink(&self.entry_for(link_path)).map_err(io_err("unlink", &self.dir))?;
    silent_unlink(link_path).map_err(io_err("unlink", link_path))?;
    info!(link = %link_path.display(), "removed gc root");
    Ok(())
  }

  /// The artifact directories the registered roots currently lead to.
  /// Dangling registrations are dropped with a warning.
  pub fn root_targets(&self) -> Result<Vec<PathBuf>, GcError> {
    let entries = match fs::read_dir(&self.dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(GcError::Io { op: "readdir", path: self.dir.clone(), source: e }),
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
      let path = entry.path();
      match fs::canonicalize(&path) {
        Ok(target) => out.push(target),
        Err(_) => {
          warn!(root = %path.display(), "gc root no longer leads to an artifact, dropping");
          silent_unlink(&path).map_err(io_err("unlink", &path))?;
        }
      }
    }
    out.sort();
    Ok(out)
  }
}

/// Run a collection over the store and source cache.
pub fn collect_garbage(
  store: &BuildStore,
  source_cache: &SourceCache,
  policy: &RetentionPolicy,
  dry_run: bool,
) -> Result<GcResult, GcError> {
  let _lock = StoreLock::exclusive(store.store_root(), "gc")?;

  let roots = GcRoots::new(store.gc_roots_dir());
  let (live_artifacts, live_sources) = mark(store, &roots)?;
  debug!(
    artifacts = live_artifacts.len(),
    sources = live_sources.len(),
    "mark phase complete"
  );

  let mut stats = GcStats::default();
  let mut deleted_paths = Vec::new();

  sweep_artifacts(store, &live_artifacts, dry_run, &mut stats, &mut deleted_paths)?;
  sweep_sources(
    source_cache,
    &live_sources,
    policy,
    dry_run,
    &mut stats,
    &mut deleted_paths,
  )?;

  info!(
    artifacts_deleted = stats.artifacts_deleted,
    sources_deleted = stats.sources_deleted,
    bytes_freed = stats.total_bytes_freed(),
    dry_run,
    "garbage collection complete"
  );
  Ok(GcResult { stats, deleted_paths })
}

/// Walk from the roots, accumulating reachable artifact ids and the source
/// keys their build specs reference.
fn mark(
  store: &BuildStore,
  roots: &GcRoots,
) -> Result<(BTreeSet<String>, BTreeSet<String>), GcError> {
  let mut live_artifacts: BTreeSet<String> = BTreeSet::new();
  let mut live_sources: BTreeSet<String> = BTreeSet::new();
  let mut queue: VecDeque<PathBuf> = roots.root_targets()?.into();

  while let Some(dir) = queue.pop_front() {
    let meta = match store.read_artifact_meta(&dir) {
      Ok(meta) => meta,
      Err(e) => {
        warn!(path = %dir.display(), error = %e, "skipping unreadable artifact during mark");
        continue;
      }
    };
    if !live_artifacts.insert(meta.id.clone()) {
      continue;
    }

    for dep in &meta.runtime_dependencies {
      if let Ok(dep) = dep.parse::<ArtifactId>() {
        if let Some(dep_dir) = store.resolve_id(&dep)? {
          queue.push_back(dep_dir);
        } else {
          live_artifacts.insert(dep.to_string());
        }
      }
    }

    // The build spec contributes import edges and the source keys that
    // would be needed to rebuild this artifact.
    if let Ok(content) = fs::read_to_string(dir.join(BUILD_JSON)) {
      if let Ok(doc) = serde_json::from_str::<Value>(&content) {
        for import in doc["build"]["import"].as_array().into_iter().flatten() {
          if let Some(id) = import["id"].as_str() {
            if let Ok(id) = id.parse::<ArtifactId>() {
              if let Some(dep_dir) = store.resolve_id(&id)? {
                queue.push_back(dep_dir);
              }
            }
          }
        }
        for source in doc["sources"].as_array().into_iter().flatten() {
          if let Some(key) = source["key"].as_str() {
            live_sources.insert(key.to_string());
          }
        }
      }
    }
  }
  Ok((live_artifacts, live_sources))
}

fn sweep_artifacts(
  store: &BuildStore,
  live: &BTreeSet<String>,
  dry_run: bool,
  stats: &mut GcStats,
  deleted_paths: &mut Vec<PathBuf>,
) -> Result<(), GcError> {
  for (id, dir) in store.iter_artifacts()? {
    stats.artifacts_scanned += 1;
    if live.contains(&id.to_string()) {
      debug!(id = %id.short_form(), "keeping");
      continue;
    }
    let size = dir_size(&dir);
    info!(id = %id.short_form(), "removing unreferenced artifact");
    if !dry_run {
      store.remove_artifact_dir(&dir)?;
    }
    stats.artifacts_deleted += 1;
    stats.artifacts_bytes_freed += size;
    deleted_paths.push(dir);
  }
  Ok(())
}

fn sweep_sources(
  source_cache: &SourceCache,
  live: &BTreeSet<String>,
  policy: &RetentionPolicy,
  dry_run: bool,
  stats: &mut GcStats,
  deleted_paths: &mut Vec<PathBuf>,
) -> Result<(), GcError> {
  for (key, path, tag) in source_cache.entries()? {
    stats.sources_scanned += 1;
    if live.contains(&key.to_string()) {
      continue;
    }
    let retention = policy.get(&tag).copied().unwrap_or(Retention::Forever);
    if !expired(&path, retention) {
      continue;
    }
    let size = if path.is_dir() { dir_size(&path) } else { entry_size(&path) };
    info!(key = %key, ?tag, "removing source cache entry");
    if !dry_run {
      remove_source_entry(source_cache, &key)?;
    }
    stats.sources_deleted += 1;
    stats.sources_bytes_freed += size;
    deleted_paths.push(path);
  }
  Ok(())
}

fn expired(path: &Path, retention: Retention) -> bool {
  let days = match retention {
    Retention::Forever => return false,
    Retention::Days(days) => days,
  };
  let age = fs::symlink_metadata(path)
    .and_then(|m| m.modified())
    .ok()
    .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
    .unwrap_or(Duration::ZERO);
  age >= Duration::from_secs(days * 24 * 60 * 60)
}

fn entry_size(path: &Path) -> u64 {
  fs::symlink_metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn remove_source_entry(source_cache: &SourceCache, key: &SourceKey) -> Result<(), GcError> {
  source_cache.remove_entry(key)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::build_spec::BuildSpec;
  use crate::build_store::KeepBuild;
  use crate::test_support::StoreFixture;
  use serde_json::json;

  fn transient_everything() -> RetentionPolicy {
    RetentionPolicy::from([
      (RetentionTag::Targz, Retention::Days(0)),
      (RetentionTag::Dir, Retention::Days(0)),
      (RetentionTag::File, Retention::Days(0)),
      (RetentionTag::Transient, Retention::Days(0)),
    ])
  }

  fn build_simple(fix: &StoreFixture, name: &str) -> ArtifactId {
    let key = fix.put_source_dir(&[(&format!("{}/data", name), "payload")]);
    let spec = BuildSpec::new(&json!({
      "name": name,
      "sources": [{"key": key.to_string(), "strip": 1}],
      "build": {
        "import": [{"ref": "unix", "id": "virtual:unix"}],
        "commands": [{"cmd": ["${unix}/bin/sh", "-c", "cp data $ARTIFACT/"]}]
      }
    }))
    .unwrap();
    fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap()
      .0
  }

  #[test]
  fn rooted_closure_survives_collection() {
    let fix = StoreFixture::new();
    let app = build_simple(&fix, "app");

    let roots = GcRoots::new(fix.store.gc_roots_dir());
    let link = fix.temp.path().join("current");
    roots.add(&fix.store, &app, &link).unwrap();

    let result =
      collect_garbage(&fix.store, &fix.cache, &RetentionPolicy::new(), false).unwrap();
    assert_eq!(result.stats.artifacts_deleted, 0);
    assert!(result.stats.artifacts_scanned >= 2);

    // Both the app and the unix tool it imports are still resolvable.
    assert!(fix.store.resolve_id(&app).unwrap().is_some());
    assert!(
      fix
        .store
        .resolve_id(&fix.virtuals["virtual:unix"])
        .unwrap()
        .is_some()
    );
  }

  #[test]
  fn removing_the_root_collects_the_closure() {
    let fix = StoreFixture::new();
    let app = build_simple(&fix, "app");
    let unix = fix.virtuals["virtual:unix"].clone();

    let roots = GcRoots::new(fix.store.gc_roots_dir());
    let link = fix.temp.path().join("current");
    roots.add(&fix.store, &app, &link).unwrap();
    roots.remove(&link).unwrap();

    let result =
      collect_garbage(&fix.store, &fix.cache, &RetentionPolicy::new(), false).unwrap();
    assert_eq!(result.stats.artifacts_deleted, 2);
    assert!(fix.store.resolve_id(&app).unwrap().is_none());
    assert!(fix.store.resolve_id(&unix).unwrap().is_none());
    assert!(!link.exists());
  }

  #[test]
  fn dry_run_reports_without_deleting() {
    let fix = StoreFixture::new();
    let app = build_simple(&fix, "app");

    let result =
      collect_garbage(&fix.store, &fix.cache, &RetentionPolicy::new(), true).unwrap();
    assert!(result.stats.artifacts_deleted >= 2);
    assert!(!result.deleted_paths.is_empty());
    assert!(fix.store.resolve_id(&app).unwrap().is_some());
  }

  #[test]
  fn sources_of_live_artifacts_are_retained() {
    let fix = StoreFixture::new();
    let app = build_simple(&fix, "app");

    let roots = GcRoots::new(fix.store.gc_roots_dir());
    roots.add(&fix.store, &app, &fix.temp.path().join("current")).unwrap();

    // Even with an expire-now policy, the key referenced by the rooted
    // artifact's build.json survives.
    let result =
      collect_garbage(&fix.store, &fix.cache, &transient_everything(), false).unwrap();
    assert_eq!(result.stats.sources_deleted, 0);
  }

  #[test]
  fn unreferenced_sources_follow_their_tag_policy() {
    let fix = StoreFixture::new();
    // An orphan entry nothing references.
    let orphan = fix.put_source_dir(&[("junk/file", "bytes")]);

    // Forever (the default) keeps it.
    let kept =
      collect_garbage(&fix.store, &fix.cache, &RetentionPolicy::new(), false).unwrap();
    assert_eq!(kept.stats.sources_deleted, 0);
    assert!(fix.cache.contains(&orphan));

    // An expire-now policy removes it.
    let swept =
      collect_garbage(&fix.store, &fix.cache, &transient_everything(), false).unwrap();
    assert_eq!(swept.stats.sources_deleted, 1);
    assert!(!fix.cache.contains(&orphan));
  }

  #[test]
  fn root_registration_is_explicit_and_encoded() {
    let fix = StoreFixture::new();
    let app = build_simple(&fix, "app");
    let roots = GcRoots::new(fix.store.gc_roots_dir());
    let link = fix.temp.path().join("current");

    roots.add(&fix.store, &app, &link).unwrap();
    assert!(link.is_symlink());
    let entries: Vec<_> = fs::read_dir(fix.store.gc_roots_dir()).unwrap().flatten().collect();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].file_name().to_string_lossy().starts_with('_'));

    roots.remove(&link).unwrap();
    assert!(fs::read_dir(fix.store.gc_roots_dir()).unwrap().next().is_none());
  }

  #[test]
  fn dangling_root_is_dropped_with_a_warning_not_an_error() {
    let fix = StoreFixture::new();
    let app = build_simple(&fix, "app");
    let roots = GcRoots::new(fix.store.gc_roots_dir());
    let link = fix.temp.path().join("current");
    roots.add(&fix.store, &app, &link).unwrap();

    // Delete the user-visible symlink behind the registry's back.
    fs::remove_file(&link).unwrap();

    let targets = roots.root_targets().unwrap();
    assert!(targets.is_empty());
    // The stale registration was cleaned up.
    assert!(fs::read_dir(fix.store.gc_roots_dir()).unwrap().next().is_none());
  }
}
