//! The build artifact store.
//!
//! Producing build artifacts identified by hash ids is the very core of the
//! system: canonicalize a spec, probe the store, and on a miss stage a
//! hermetic build and publish it with a single `rename`. Readers never see
//! a half-filled artifact; two processes racing on the same spec both
//! succeed and converge on one directory.
//!
//! # Layout
//!
//! ```text
//! <store_root>/
//! ├── opt/<name>/<version>/<short-hash>/   # published artifacts
//! │   ├── build.json                       # the exact spec that built this
//! │   ├── artifact.json                    # install metadata, runtime deps
//! │   ├── build.log.gz
//! │   ├── id                               # full artifact id marker
//! │   └── <user files: bin/, lib/, ...>
//! ├── opt/<name>/<version>/<full-hash> -> <short-hash>
//! └── bld/<name>/<version>/<short>-<k>[.art]   # staging
//! ```
//!
//! The short directory name starts at four hash characters and is
//! lengthened one character at a time when it collides with a different
//! artifact; the full-hash symlink always identifies the directory exactly.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::build_spec::{ArtifactId, BuildSpec, SHORT_HASH_LEN, SpecError, VIRTUAL_PREFIX};
use crate::config::StoreContext;
use crate::fileutil::{atomic_symlink, gzip_compress, silent_unlink, write_atomic};
use crate::run_job::{BUILD_LOG, JobError, JobSpec, run_job};
use crate::source_cache::{SourceCache, SourceError, SourceKey};
use crate::store_lock::{StoreLock, StoreLockError};

/// Marker file holding the full artifact id; its presence signals a
/// complete artifact.
pub const ID_FILENAME: &str = "id";
pub const BUILD_JSON: &str = "build.json";
pub const ARTIFACT_JSON: &str = "artifact.json";
pub const BUILD_LOG_GZ: &str = "build.log.gz";

#[derive(Debug, Error)]
pub enum StoreError {
  /// The store contains something structurally wrong: a dangling full-hash
  /// symlink, a missing or disagreeing id marker, an unreadable
  /// artifact.json. Reported loudly, never papered over.
  #[error("store integrity violation at '{path}': {message}")]
  Integrity { path: PathBuf, message: String },

  #[error("{op} '{path}': {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

impl StoreError {
  fn io<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> StoreError + 'a {
    move |source| StoreError::Io { op, path: path.to_path_buf(), source }
  }
}

#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Spec(#[from] SpecError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Source(#[from] SourceError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error("build of {id} failed during {stage}: {source}")]
  BuildFailed {
    id: String,
    stage: &'static str,
    log_path: Option<PathBuf>,
    #[source]
    source: Box<JobError>,
  },

  #[error("invalid 'files' entry: {0}")]
  BadFiles(String),
}

/// What to do with the staging build directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepBuild {
  /// Always remove it, even on failure.
  Never,
  /// Keep it when the build fails, for inspection.
  #[default]
  OnError,
  /// Keep it unconditionally.
  Always,
}

/// `artifact.json`: install metadata at the root of every artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactMeta {
  pub id: String,
  pub name: String,
  pub version: String,
  /// Artifact ids transitively required at use time; what GC follows.
  #[serde(rename = "runtime-dependencies", default)]
  pub runtime_dependencies: Vec<String>,
  /// The spec's `profile_install` sub-document, verbatim.
  #[serde(default, skip_serializing_if = "Value::is_null")]
  pub install: Value,
  /// Environment exported when this artifact is part of a profile.
  #[serde(
    rename = "profile-env-vars",
    default,
    skip_serializing_if = "BTreeMap::is_empty"
  )]
  pub profile_env_vars: BTreeMap<String, String>,
  /// The spec's `import_modify_env` sub-document, verbatim. Its presence
  /// puts this artifact's `bin/` on the PATH of builds importing it.
  #[serde(
    rename = "import-modify-env",
    default,
    skip_serializing_if = "Value::is_null"
  )]
  pub import_modify_env: Value,
}

impl ArtifactMeta {
  pub fn modifies_import_env(&self) -> bool {
    !self.import_modify_env.is_null()
  }
}

/// Manages the artifact directory tree; the entry point for kicking off
/// builds.
#[derive(Debug, Clone)]
pub struct BuildStore {
  store_root: PathBuf,
  gc_roots_dir: PathBuf,
}

impl BuildStore {
  /// Open the store of a context, creating the skeleton if needed.
  pub fn open(ctx: &StoreContext) -> Result<Self, StoreError> {
    Self::from_paths(ctx.store_root(), ctx.gc_roots_dir())
  }

  pub fn from_paths(store_root: &Path, gc_roots_dir: &Path) -> Result<Self, StoreError> {
    let store = BuildStore {
      store_root: store_root.to_path_buf(),
      gc_roots_dir: gc_roots_dir.to_path_buf(),
    };
    for dir in [store.artifact_root(), store.build_root(), store.gc_roots_dir.clone()] {
      fs::create_dir_all(&dir).map_err(StoreError::io("mkdir", &dir))?;
    }
    Ok(store)
  }

  pub fn store_root(&self) -> &Path {
    &self.store_root
  }

  pub fn artifact_root(&self) -> PathBuf {
    self.store_root.join("opt")
  }

  pub fn build_root(&self) -> PathBuf {
    self.store_root.join("bld")
  }

  pub fn gc_roots_dir(&self) -> &Path {
    &self.gc_roots_dir
  }

  fn version_dir(&self, id: &ArtifactId) -> PathBuf {
    self.artifact_root().join(&id.name).join(&id.version)
  }

  /// Path of the full-hash symlink identifying an artifact exactly.
  pub fn full_symlink_path(&self, id: &ArtifactId) -> PathBuf {
    self.version_dir(id).join(&id.hash)
  }

  /// Resolve an artifact id to its directory, or `None` if not built.
  ///
  /// The full-hash symlink is the source of truth; a symlink that dangles
  /// or whose target's id marker disagrees is an integrity violation.
  pub fn resolve_id(&self, id: &ArtifactId) -> Result<Option<PathBuf>, StoreError> {
    let link = self.full_symlink_path(id);
    let target = match fs::read_link(&link) {
      Ok(target) => target,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(StoreError::Io { op: "readlink", path: link, source: e }),
    };
    let dir = self.version_dir(id).join(&target);
    if !dir.is_dir() {
      return Err(StoreError::Integrity {
        path: link,
        message: format!("full-hash symlink dangles (target '{}')", target.display()),
      });
    }
    let present = read_id_file(&dir)?;
    if present != id.to_string() {
      return Err(StoreError::Integrity {
        path: dir,
        message: format!("id marker holds '{}', expected '{}'", present, id),
      });
    }
    Ok(Some(dir))
  }

  /// Resolve an id string; a hash shorter than the full digest is treated
  /// as an on-disk short form.
  pub fn resolve_str(&self, id: &str) -> Result<Option<PathBuf>, StoreError> {
    let parsed: ArtifactId = match id.parse() {
      Ok(parsed) => parsed,
      Err(_) => return Ok(None),
    };
    // 20 digest bytes encode to 27 base64 characters; anything shorter is
    // a short form.
    let full_len = crate::hash::DIGEST_BYTES.div_ceil(3) * 4 - 1;
    if parsed.hash.len() >= full_len {
      return self.resolve_id(&parsed);
    }
    // Short form: the hash is the directory name itself.
    let dir = self.version_dir(&parsed).join(&parsed.hash);
    if !dir.is_dir() {
      return Ok(None);
    }
    let present = read_id_file(&dir)?;
    let full: ArtifactId = present.parse().map_err(|_| StoreError::Integrity {
      path: dir.clone(),
      message: format!("id marker holds malformed id '{}'", present),
    })?;
    if !full.hash.starts_with(&parsed.hash) || full.name != parsed.name {
      return Err(StoreError::Integrity {
        path: dir,
        message: format!("id marker '{}' does not match short id '{}'", present, id),
      });
    }
    Ok(Some(dir))
  }

  pub fn is_present(&self, spec: &BuildSpec) -> Result<bool, StoreError> {
    Ok(self.resolve_id(&spec.id)?.is_some())
  }

  /// Read an artifact's `artifact.json`.
  pub fn read_artifact_meta(&self, artifact_dir: &Path) -> Result<ArtifactMeta, StoreError> {
    let path = artifact_dir.join(ARTIFACT_JSON);
    let content = fs::read_to_string(&path).map_err(|e| StoreError::Integrity {
      path: path.clone(),
      message: format!("cannot read artifact.json: {}", e),
    })?;
    serde_json::from_str(&content).map_err(|e| StoreError::Integrity {
      path,
      message: format!("malformed artifact.json: {}", e),
    })
  }

  /// Build an artifact if it is not already present.
  ///
  /// Dependencies are never built recursively: an import missing from the
  /// store fails the job with `UnresolvedImport`.
  pub fn ensure_present(
    &self,
    spec: &BuildSpec,
    source_cache: &SourceCache,
    virtuals: &BTreeMap<String, ArtifactId>,
    keep_build: KeepBuild,
  ) -> Result<(ArtifactId, PathBuf), BuildError> {
    if let Some(dir) = self.resolve_id(&spec.id)? {
      debug!(id = %spec.id, "artifact already present (cache hit)");
      return Ok((spec.id.clone(), dir));
    }
    let builder = ArtifactBuilder {
      store: self,
      spec,
      virtuals,
      keep_build,
    };
    let dir = builder.build(source_cache)?;
    Ok((spec.id.clone(), dir))
  }

  /// Every complete artifact in the store.
  pub fn iter_artifacts(&self) -> Result<Vec<(ArtifactId, PathBuf)>, StoreError> {
    let mut out = Vec::new();
    let root = self.artifact_root();
    for name_entry in read_dir_or_empty(&root)? {
      if !name_entry.is_dir() {
        continue;
      }
      for version_entry in read_dir_or_empty(&name_entry)? {
        if !version_entry.is_dir() {
          continue;
        }
        for dir in read_dir_or_empty(&version_entry)? {
          let meta = fs::symlink_metadata(&dir).map_err(StoreError::io("stat", &dir))?;
          if !meta.is_dir() {
            continue;
          }
          match read_id_file(&dir) {
            Ok(id) => match id.parse::<ArtifactId>() {
              Ok(id) => out.push((id, dir)),
              Err(_) => warn!(path = %dir.display(), "skipping directory with malformed id marker"),
            },
            // No id marker: an aborted publication, invisible to readers.
            Err(_) => debug!(path = %dir.display(), "skipping directory without id marker"),
          }
        }
      }
    }
    Ok(out)
  }

  /// Remove one artifact (the `hit purge` backend). Accepts full or short
  /// ids; returns the removed path, or `None` if nothing matched.
  pub fn delete(&self, id: &str) -> Result<Option<PathBuf>, StoreError> {
    let dir = match self.resolve_str(id) {
      Ok(Some(dir)) => dir,
      Ok(None) => return Ok(None),
      // Purging is exactly the remedy for a broken entry; locate the
      // directory without insisting on consistency.
      Err(StoreError::Integrity { path, .. }) => path,
      Err(e) => return Err(e),
    };
    self.remove_artifact_dir(&dir)?;
    Ok(Some(dir))
  }

  /// Remove a complete artifact directory and its full-hash symlink. The
  /// id marker goes first, unmarking the artifact before the tree vanishes.
  pub(crate) fn remove_artifact_dir(&self, dir: &Path) -> Result<(), StoreError> {
    if let Ok(id) = read_id_file(dir) {
      if let Ok(parsed) = id.parse::<ArtifactId>() {
        silent_unlink(&self.full_symlink_path(&parsed))
          .map_err(StoreError::io("unlink", dir))?;
      }
    }
    let meta = fs::symlink_metadata(dir).map_err(StoreError::io("stat", dir))?;
    if meta.is_symlink() {
      // Purging a broken entry may hand us the dangling symlink itself.
      return silent_unlink(dir).map_err(StoreError::io("unlink", dir));
    }
    silent_unlink(&dir.join(ID_FILENAME)).map_err(StoreError::io("unlink", dir))?;
    fs::remove_dir_all(dir).map_err(StoreError::io("rmdir", dir))?;
    Ok(())
  }

  /// Wipe every artifact and staging directory.
  pub fn delete_all(&self) -> Result<(), StoreError> {
    for root in [self.artifact_root(), self.build_root()] {
      for entry in read_dir_or_empty(&root)? {
        let meta = fs::symlink_metadata(&entry).map_err(StoreError::io("stat", &entry))?;
        if meta.is_dir() {
          fs::remove_dir_all(&entry).map_err(StoreError::io("rmdir", &entry))?;
        } else {
          fs::remove_file(&entry).map_err(StoreError::io("unlink", &entry))?;
        }
      }
    }
    Ok(())
  }

  /// Publish an artifact staging directory at its final path.
  ///
  /// The final name appears only through `rename`. Losing a race against
  /// a builder of the same artifact discards our staging (content is
  /// deterministic, so this is safe); colliding with a *different*
  /// artifact lengthens the short prefix.
  pub(crate) fn publish(&self, staging: &Path, id: &ArtifactId) -> Result<PathBuf, StoreError> {
    let version_dir = self.version_dir(id);
    fs::create_dir_all(&version_dir).map_err(StoreError::io("mkdir", &version_dir))?;

    let mut len = SHORT_HASH_LEN;
    loop {
      let short = &id.hash[..len.min(id.hash.len())];
      let final_path = version_dir.join(short);
      match fs::rename(staging, &final_path) {
        Ok(()) => {
          atomic_symlink(Path::new(short), &self.full_symlink_path(id))
            .map_err(StoreError::io("symlink", &final_path))?;
          info!(id = %id, path = %final_path.display(), "published artifact");
          return Ok(final_path);
        }
        Err(e)
          if matches!(
            e.kind(),
            io::ErrorKind::AlreadyExists | io::ErrorKind::DirectoryNotEmpty
          ) =>
        {
          match read_id_file(&final_path) {
            Ok(existing) if existing == id.to_string() => {
              // A concurrent build of the same spec won; ours is
              // byte-equivalent, discard it.
              info!(id = %id, "lost publication race, using existing artifact");
              fs::remove_dir_all(staging).map_err(StoreError::io("rmdir", staging))?;
              atomic_symlink(Path::new(short), &self.full_symlink_path(id))
                .map_err(StoreError::io("symlink", &final_path))?;
              return Ok(final_path);
            }
            _ => {
              if len >= id.hash.len() {
                return Err(StoreError::Integrity {
                  path: final_path,
                  message: "exhausted hash while resolving short-name collision".to_string(),
                });
              }
              debug!(id = %id, short, "short-hash collision, lengthening prefix");
              len += 1;
            }
          }
        }
        Err(e) => {
          return Err(StoreError::Io { op: "rename", path: final_path, source: e });
        }
      }
    }
  }
}

struct ArtifactBuilder<'a> {
  store: &'a BuildStore,
  spec: &'a BuildSpec,
  virtuals: &'a BTreeMap<String, ArtifactId>,
  keep_build: KeepBuild,
}

impl ArtifactBuilder<'_> {
  fn build(&self, source_cache: &SourceCache) -> Result<PathBuf, BuildError> {
    // Builds share the store lock; only GC takes it exclusively.
    let _lock = StoreLock::shared(&self.store.store_root)?;

    let job: JobSpec =
      serde_json::from_value(self.spec.doc["build"].clone()).map_err(|e| SpecError::BadField {
        field: "build",
        message: e.to_string(),
      })?;

    let (build_dir, artifact_staging) = self.make_staging_dirs()?;
    info!(
      id = %self.spec.id.short_form(),
      build_dir = %build_dir.display(),
      "building artifact"
    );

    match self.build_in(source_cache, &job, &build_dir, &artifact_staging) {
      Ok(()) => {
        let final_path = self.store.publish(&artifact_staging, &self.spec.id)?;
        if self.keep_build != KeepBuild::Always {
          remove_staging(&build_dir);
        }
        Ok(final_path)
      }
      Err(e) => {
        // Never promote anything; the artifact staging always goes, the
        // build dir stays for inspection unless told otherwise.
        remove_staging(&artifact_staging);
        if self.keep_build == KeepBuild::Never {
          remove_staging(&build_dir);
        } else {
          warn!(
            id = %self.spec.id.short_form(),
            build_dir = %build_dir.display(),
            "build failed, staging kept for inspection"
          );
        }
        Err(e)
      }
    }
  }

  fn build_in(
    &self,
    source_cache: &SourceCache,
    job: &JobSpec,
    build_dir: &Path,
    artifact_staging: &Path,
  ) -> Result<(), BuildError> {
    self.write_build_json(build_dir)?;
    self.write_build_json(artifact_staging)?;
    self.write_artifact_meta(artifact_staging)?;
    self.unpack_sources(source_cache, build_dir)?;
    self.write_files(build_dir)?;

    run_job(self.store, self.virtuals, job, build_dir, artifact_staging).map_err(|source| {
      BuildError::BuildFailed {
        id: self.spec.id.to_string(),
        stage: "build",
        log_path: Some(build_dir.join(BUILD_LOG)),
        source: Box::new(source),
      }
    })?;

    let log = build_dir.join(BUILD_LOG);
    if log.exists() {
      gzip_compress(&log, &artifact_staging.join(BUILD_LOG_GZ))
        .map_err(|e| StoreError::Io { op: "gzip", path: log, source: e })?;
    }
    write_atomic(
      &artifact_staging.join(ID_FILENAME),
      format!("{}\n", self.spec.id).as_bytes(),
    )
    .map_err(|e| StoreError::Io {
      op: "write",
      path: artifact_staging.join(ID_FILENAME),
      source: e,
    })?;
    Ok(())
  }

  /// Create the per-build staging pair under `bld/`. The `-<k>` counter
  /// claims a slot via `create_dir` exclusivity, so concurrent builders of
  /// the same spec never share staging.
  fn make_staging_dirs(&self) -> Result<(PathBuf, PathBuf), StoreError> {
    let parent = self
      .store
      .build_root()
      .join(&self.spec.id.name)
      .join(&self.spec.id.version);
    fs::create_dir_all(&parent).map_err(StoreError::io("mkdir", &parent))?;

    let mut k = 0u32;
    loop {
      let build_dir = parent.join(format!("{}-{}", self.spec.id.short_hash(), k));
      match fs::create_dir(&build_dir) {
        Ok(()) => {
          let artifact_staging = parent.join(format!("{}-{}.art", self.spec.id.short_hash(), k));
          let _ = fs::remove_dir_all(&artifact_staging);
          fs::create_dir(&artifact_staging).map_err(StoreError::io("mkdir", &artifact_staging))?;
          return Ok((build_dir, artifact_staging));
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => k += 1,
        Err(e) => return Err(StoreError::Io { op: "mkdir", path: build_dir, source: e }),
      }
    }
  }

  fn write_build_json(&self, dir: &Path) -> Result<(), StoreError> {
    let path = dir.join(BUILD_JSON);
    let content =
      serde_json::to_string_pretty(&self.spec.doc).expect("canonical spec serializes");
    write_atomic(&path, format!("{}\n", content).as_bytes())
      .map_err(StoreError::io("write", &path))?;
    Ok(())
  }

  fn write_artifact_meta(&self, dir: &Path) -> Result<(), BuildError> {
    let doc = &self.spec.doc;
    let install = doc.get("profile_install").cloned().unwrap_or(Value::Null);
    let profile_env_vars = install
      .get("env")
      .and_then(Value::as_object)
      .map(|map| {
        map
          .iter()
          .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
          .collect()
      })
      .unwrap_or_default();
    let meta = ArtifactMeta {
      id: self.spec.id.to_string(),
      name: self.spec.id.name.clone(),
      version: self.spec.id.version.clone(),
      runtime_dependencies: self.find_runtime_dependencies()?,
      install,
      profile_env_vars,
      import_modify_env: doc.get("import_modify_env").cloned().unwrap_or(Value::Null),
    };
    let path = dir.join(ARTIFACT_JSON);
    let content = serde_json::to_string_pretty(&meta).expect("artifact meta serializes");
    write_atomic(&path, format!("{}\n", content).as_bytes())
      .map_err(|e| StoreError::Io { op: "write", path, source: e })?;
    Ok(())
  }

  /// The complete dependency set recorded for garbage collection: every
  /// import (virtuals resolved to what actually backed them) plus the
  /// imports' own runtime dependencies.
  fn find_runtime_dependencies(&self) -> Result<Vec<String>, BuildError> {
    let mut deps: BTreeSet<String> = BTreeSet::new();
    let imports = self.spec.doc["build"]["import"]
      .as_array()
      .cloned()
      .unwrap_or_default();
    for import in &imports {
      let id_str = import["id"].as_str().unwrap_or_default();
      let concrete: ArtifactId = if id_str.starts_with(VIRTUAL_PREFIX) {
        match self.virtuals.get(id_str) {
          Some(concrete) => concrete.clone(),
          // Unresolved virtuals surface later, in env assembly, with a
          // proper error; GC metadata just skips them here.
          None => continue,
        }
      } else {
        match id_str.parse() {
          Ok(concrete) => concrete,
          Err(_) => continue,
        }
      };
      deps.insert(concrete.to_string());
      if let Some(dir) = self.store.resolve_id(&concrete)? {
        let meta = self.store.read_artifact_meta(&dir)?;
        deps.extend(meta.runtime_dependencies);
      }
    }
    Ok(deps.into_iter().collect())
  }

  fn unpack_sources(&self, source_cache: &SourceCache, build_dir: &Path) -> Result<(), BuildError> {
    for item in self.spec.sources() {
      let key: SourceKey = item.key.parse()?;
      let target = build_dir.join(&item.target);
      debug!(key = %key, target = %target.display(), "unpacking source");
      source_cache.unpack(&key, &target, item.strip)?;
    }
    Ok(())
  }

  /// Scatter the spec's inline `files` section into the build dir. Used by
  /// synthesized specs (profiles) to carry their parameter documents.
  fn write_files(&self, build_dir: &Path) -> Result<(), BuildError> {
    let files = match self.spec.doc.get("files").and_then(Value::as_array) {
      Some(files) => files,
      None => return Ok(()),
    };
    for entry in files {
      let target = entry
        .get("target")
        .and_then(Value::as_str)
        .ok_or_else(|| BuildError::BadFiles("missing 'target'".to_string()))?;
      if target.starts_with('/') || target.split('/').any(|c| c == "..") {
        return Err(BuildError::BadFiles(format!("target '{}' escapes the build dir", target)));
      }
      let path = build_dir.join(target);
      if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(StoreError::io("mkdir", parent))?;
      }
      let contents = match (entry.get("text"), entry.get("object")) {
        (Some(Value::Array(lines)), None) => {
          let mut text = lines
            .iter()
            .map(|l| l.as_str().unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n");
          text.push('\n');
          text
        }
        (None, Some(object)) => {
          format!("{}\n", serde_json::to_string_pretty(object).expect("plain JSON"))
        }
        _ => {
          return Err(BuildError::BadFiles(
            "each entry carries exactly one of 'text' or 'object'".to_string(),
          ));
        }
      };
      fs::write(&path, contents).map_err(StoreError::io("write", &path))?;
      if entry.get("executable").and_then(Value::as_bool).unwrap_or(false) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
          .map_err(StoreError::io("chmod", &path))?;
      }
    }
    Ok(())
  }
}

fn read_id_file(dir: &Path) -> Result<String, StoreError> {
  let path = dir.join(ID_FILENAME);
  let content = fs::read_to_string(&path).map_err(|e| StoreError::Integrity {
    path: path.clone(),
    message: format!("cannot read id marker: {}", e),
  })?;
  Ok(content.trim().to_string())
}

fn read_dir_or_empty(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
  match fs::read_dir(dir) {
    Ok(entries) => {
      let mut out: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
      out.sort();
      Ok(out)
    }
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
    Err(e) => Err(StoreError::Io { op: "readdir", path: dir.to_path_buf(), source: e }),
  }
}

fn remove_staging(dir: &Path) {
  if let Err(e) = fs::remove_dir_all(dir) {
    if e.kind() != io::ErrorKind::NotFound {
      warn!(path = %dir.display(), error = %e, "failed to remove staging directory");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::{StoreFixture, plant_tool_artifact};
  use serde_json::json;

  fn zlib_spec(source_key: &str, version: &str) -> BuildSpec {
    BuildSpec::new(&json!({
      "name": "zlib",
      "version": version,
      "sources": [{"key": source_key, "strip": 1}],
      "build": {
        "import": [{"ref": "unix", "id": "virtual:unix"}],
        "commands": [
          {"cmd": ["${unix}/bin/sh", "-c",
                   "mkdir -p $ARTIFACT/lib $ARTIFACT/include && cp libz.so $ARTIFACT/lib/ && cp zlib.h $ARTIFACT/include/ && echo built"]}
        ]
      },
      "profile_install": {"parameters": {"links": [
        {"action": "symlink", "select": "$ARTIFACT/**", "prefix": "$ARTIFACT", "target": "$PROFILE"}
      ]}}
    }))
    .unwrap()
  }

  fn zlib_source(fix: &StoreFixture) -> String {
    fix
      .put_source_dir(&[("zlib-1.2.7/libz.so", "elf-bytes"), ("zlib-1.2.7/zlib.h", "header")])
      .to_string()
  }

  #[test]
  fn build_miss_then_hit() {
    let fix = StoreFixture::new();
    let key = zlib_source(&fix);
    let spec = zlib_spec(&key, "1.2.7");

    let (id, dir) = fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();
    assert_eq!(id, spec.id);
    assert!(dir.join("lib/libz.so").is_file());
    assert!(dir.join("include/zlib.h").is_file());
    assert!(dir.join(BUILD_JSON).is_file());
    assert!(dir.join(ARTIFACT_JSON).is_file());
    assert!(dir.join(BUILD_LOG_GZ).is_file());
    assert_eq!(
      fs::read_to_string(dir.join(ID_FILENAME)).unwrap().trim(),
      id.to_string()
    );

    // Staging is gone after success.
    assert!(staging_entries(&fix).is_empty());

    // Re-invoking the same spec returns immediately with no new staging.
    let (_, dir2) = fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();
    assert_eq!(dir, dir2);
    assert!(staging_entries(&fix).is_empty());
  }

  #[test]
  fn resolve_roundtrips_build_json() {
    let fix = StoreFixture::new();
    let key = zlib_source(&fix);
    let spec = zlib_spec(&key, "1.2.7");
    let (id, dir) = fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();

    // The stored build.json re-hashes to the artifact's own id.
    let stored: Value =
      serde_json::from_str(&fs::read_to_string(dir.join(BUILD_JSON)).unwrap()).unwrap();
    let respec = BuildSpec::new(&stored).unwrap();
    assert_eq!(respec.id, id);

    // And building the stored spec is a cache hit.
    assert!(fix.store.is_present(&respec).unwrap());
  }

  #[test]
  fn version_change_builds_a_sibling() {
    let fix = StoreFixture::new();
    let key = zlib_source(&fix);
    let spec_a = zlib_spec(&key, "1.2.6");
    let spec_b = zlib_spec(&key, "1.2.7");

    let (_, dir_a) = fix
      .store
      .ensure_present(&spec_a, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();
    let (_, dir_b) = fix
      .store
      .ensure_present(&spec_b, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();
    assert_ne!(dir_a, dir_b);
    assert!(dir_a.exists(), "old artifact remains on disk");
    assert!(dir_b.exists());
  }

  #[test]
  fn env_nohash_is_observed_but_does_not_rebuild() {
    let fix = StoreFixture::new();
    let key = zlib_source(&fix);

    let mut doc = json!({
      "name": "probe",
      "version": "1",
      "sources": [{"key": key, "strip": 1}],
      "build": {
        "import": [{"ref": "unix", "id": "virtual:unix"}],
        "env_nohash": {"MAKEFLAGS": "-j4"},
        "commands": [
          {"cmd": ["${unix}/bin/sh", "-c", "echo flags=$MAKEFLAGS && touch $ARTIFACT/done"]}
        ]
      }
    });
    let spec = BuildSpec::new(&doc).unwrap();
    let (_, dir) = fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();

    // The nohash variable reached the build and the log.
    let log = fix.read_gz(&dir.join(BUILD_LOG_GZ));
    assert!(log.contains("flags=-j4"));

    // Changing it leaves the artifact id unchanged: instant cache hit.
    doc["build"]["env_nohash"]["MAKEFLAGS"] = json!("-j16");
    let respec = BuildSpec::new(&doc).unwrap();
    assert_eq!(respec.id, spec.id);
    let (_, dir2) = fix
      .store
      .ensure_present(&respec, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();
    assert_eq!(dir, dir2);
  }

  #[test]
  fn failed_build_promotes_nothing_and_keeps_the_build_dir() {
    let fix = StoreFixture::new();
    let spec = BuildSpec::new(&json!({
      "name": "broken",
      "build": {
        "import": [{"ref": "unix", "id": "virtual:unix"}],
        "commands": [{"cmd": ["${unix}/bin/sh", "-c", "echo doomed && exit 7"]}]
      }
    }))
    .unwrap();

    let result = fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::default());
    match result {
      Err(BuildError::BuildFailed { log_path, .. }) => {
        let log = fs::read_to_string(log_path.unwrap()).unwrap();
        assert!(log.contains("doomed"));
      }
      other => panic!("expected BuildFailed, got {:?}", other.map(|_| ())),
    }

    // Nothing published, no dangling symlink.
    assert!(fix.store.resolve_id(&spec.id).unwrap().is_none());
    // The build dir stays for inspection; the artifact staging is gone.
    let staging = staging_entries(&fix);
    assert_eq!(staging.len(), 1);
    assert!(!staging[0].to_string_lossy().ends_with(".art"));

    // Retrying after the failure is safe and uses a fresh staging slot.
    let fixed = BuildSpec::new(&json!({
      "name": "broken",
      "build": {
        "import": [{"ref": "unix", "id": "virtual:unix"}],
        "commands": [{"cmd": ["${unix}/bin/sh", "-c", "touch $ARTIFACT/ok"]}]
      }
    }))
    .unwrap();
    let (_, dir) = fix
      .store
      .ensure_present(&fixed, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();
    assert!(dir.join("ok").is_file());
  }

  #[test]
  fn keep_build_never_cleans_failed_staging() {
    let fix = StoreFixture::new();
    let spec = BuildSpec::new(&json!({
      "name": "broken",
      "build": {
        "import": [{"ref": "unix", "id": "virtual:unix"}],
        "commands": [{"cmd": ["${unix}/bin/sh", "-c", "exit 1"]}]
      }
    }))
    .unwrap();
    let _ = fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::Never);
    assert!(staging_entries(&fix).is_empty());
  }

  #[test]
  fn unresolved_import_fails_without_building() {
    let fix = StoreFixture::new();
    let spec = BuildSpec::new(&json!({
      "name": "needy",
      "build": {
        "import": [{"ref": "dep", "id": "missing/1.0/AAAAAAAAAAAAAAAAAAAAAAAAAAA"}],
        "commands": [{"cmd": ["${dep}/bin/tool"]}]
      }
    }))
    .unwrap();

    let result = fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::Never);
    assert!(matches!(
      result,
      Err(BuildError::BuildFailed { ref source, .. })
        if matches!(**source, JobError::UnresolvedImport { .. })
    ));
    assert!(fix.store.resolve_id(&spec.id).unwrap().is_none());
  }

  #[test]
  fn unprovided_virtual_is_an_error() {
    let fix = StoreFixture::new();
    let spec = BuildSpec::new(&json!({
      "name": "needy",
      "build": {
        "import": [{"ref": "m", "id": "virtual:make"}],
        "commands": [{"cmd": ["${m}/bin/make"]}]
      }
    }))
    .unwrap();
    // The fixture's virtuals table only provides virtual:unix.
    let result = fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::Never);
    assert!(matches!(
      result,
      Err(BuildError::BuildFailed { ref source, .. })
        if matches!(**source, JobError::UnresolvedVirtual { .. })
    ));
  }

  #[test]
  fn import_env_variables_are_exported() {
    let fix = StoreFixture::new();
    let unix_id = fix.virtuals["virtual:unix"].clone();
    let spec = BuildSpec::new(&json!({
      "name": "envdump",
      "build": {
        "import": [{"ref": "unix", "id": "virtual:unix"}],
        "commands": [
          {"cmd": ["${unix}/bin/sh", "-c",
                   "echo unix=$unix id=$unix_id rel=$unix_relpath path=$PATH virt=$HDIST_VIRTUALS"]}
        ]
      }
    }))
    .unwrap();
    let (_, dir) = fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();
    let log = fix.read_gz(&dir.join(BUILD_LOG_GZ));
    let unix_dir = fix.store.resolve_id(&unix_id).unwrap().unwrap();
    assert!(log.contains(&format!("unix={}", unix_dir.display())));
    assert!(log.contains(&format!("id={}", unix_id)));
    assert!(log.contains("rel=../"));
    // The tool artifact declares import_modify_env, so its bin is on PATH.
    assert!(log.contains(&format!("path={}", unix_dir.join("bin").display())));
    assert!(log.contains(&format!("virt=virtual:unix={}", unix_id)));
  }

  #[test]
  fn runtime_dependencies_recorded_transitively() {
    let fix = StoreFixture::new();
    let unix_id = fix.virtuals["virtual:unix"].clone();

    // liba imports unix; libb imports liba. libb's metadata must reach
    // through to unix.
    let liba = BuildSpec::new(&json!({
      "name": "liba",
      "build": {
        "import": [{"ref": "unix", "id": "virtual:unix"}],
        "commands": [{"cmd": ["${unix}/bin/sh", "-c", "touch $ARTIFACT/a"]}]
      }
    }))
    .unwrap();
    let (liba_id, _) = fix
      .store
      .ensure_present(&liba, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();

    let libb = BuildSpec::new(&json!({
      "name": "libb",
      "build": {
        "import": [
          {"ref": "unix", "id": "virtual:unix"},
          {"ref": "liba", "id": liba_id.to_string()}
        ],
        "commands": [{"cmd": ["${unix}/bin/sh", "-c", "touch $ARTIFACT/b"]}]
      }
    }))
    .unwrap();
    let (_, dir) = fix
      .store
      .ensure_present(&libb, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();

    let meta = fix.store.read_artifact_meta(&dir).unwrap();
    assert!(meta.runtime_dependencies.contains(&liba_id.to_string()));
    assert!(meta.runtime_dependencies.contains(&unix_id.to_string()));
  }

  #[test]
  fn corrupt_full_hash_symlink_is_an_integrity_error() {
    let fix = StoreFixture::new();
    let key = zlib_source(&fix);
    let spec = zlib_spec(&key, "1.2.7");
    let (id, _) = fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();

    // Point the full-hash symlink somewhere that does not exist.
    let link = fix.store.full_symlink_path(&id);
    fs::remove_file(&link).unwrap();
    std::os::unix::fs::symlink("nonexistent-dir", &link).unwrap();

    assert!(matches!(
      fix.store.resolve_id(&id),
      Err(StoreError::Integrity { .. })
    ));
  }

  #[test]
  fn missing_symlink_resolves_to_none() {
    let fix = StoreFixture::new();
    let id: ArtifactId = "ghost/1.0/AAAAAAAAAAAAAAAAAAAAAAAAAAA".parse().unwrap();
    assert!(fix.store.resolve_id(&id).unwrap().is_none());
  }

  #[test]
  fn short_form_resolution() {
    let fix = StoreFixture::new();
    let key = zlib_source(&fix);
    let spec = zlib_spec(&key, "1.2.7");
    let (id, dir) = fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();

    let short = format!("{}/{}/{}", id.name, id.version, id.short_hash());
    assert_eq!(fix.store.resolve_str(&short).unwrap().unwrap(), dir);
    assert_eq!(fix.store.resolve_str(&id.to_string()).unwrap().unwrap(), dir);
    assert!(fix.store.resolve_str("zlib/1.2.7/zzzz").unwrap().is_none());
  }

  #[test]
  fn publication_race_loser_discards_staging() {
    let fix = StoreFixture::new();
    let key = zlib_source(&fix);
    let spec = zlib_spec(&key, "1.2.7");
    let (id, dir) = fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();

    // Simulate the second builder arriving with its own staging.
    let staging = fix.store.build_root().join("race-staging");
    fs::create_dir_all(&staging).unwrap();
    fs::write(staging.join(ID_FILENAME), format!("{}\n", id)).unwrap();

    let published = fix.store.publish(&staging, &id).unwrap();
    assert_eq!(published, dir);
    assert!(!staging.exists(), "loser's staging is discarded");

    // Exactly one artifact directory exists.
    let version_dir = dir.parent().unwrap();
    let dirs: Vec<_> = fs::read_dir(version_dir)
      .unwrap()
      .flatten()
      .filter(|e| e.file_type().unwrap().is_dir())
      .collect();
    assert_eq!(dirs.len(), 1);
  }

  #[test]
  fn short_hash_collision_lengthens_the_later_arrival() {
    let fix = StoreFixture::new();

    // Two unrelated artifacts whose hashes share the first four chars.
    let id_a: ArtifactId = "pkg/1/abcdAAAAAAAAAAAAAAAAAAAAAAA".parse().unwrap();
    let id_b: ArtifactId = "pkg/1/abcdBBBBBBBBBBBBBBBBBBBBBBB".parse().unwrap();

    for id in [&id_a, &id_b] {
      let staging = fix.store.build_root().join(format!("stage-{}", &id.hash[4..8]));
      fs::create_dir_all(&staging).unwrap();
      fs::write(staging.join(ID_FILENAME), format!("{}\n", id)).unwrap();
      fix.store.publish(&staging, id).unwrap();
    }

    let dir_a = fix.store.resolve_id(&id_a).unwrap().unwrap();
    let dir_b = fix.store.resolve_id(&id_b).unwrap().unwrap();
    assert_ne!(dir_a, dir_b);
    assert_eq!(dir_a.file_name().unwrap().to_str().unwrap(), "abcd");
    assert_eq!(dir_b.file_name().unwrap().to_str().unwrap(), "abcdB");
  }

  #[test]
  fn interrupted_build_leaves_no_artifact_and_retry_succeeds() {
    let fix = StoreFixture::new();
    let key = zlib_source(&fix);
    let spec = zlib_spec(&key, "1.2.7");

    // Simulate a build killed mid-flight: staging dirs exist, nothing
    // was renamed into opt/.
    let parent = fix
      .store
      .build_root()
      .join(&spec.id.name)
      .join(&spec.id.version);
    fs::create_dir_all(parent.join(format!("{}-0", spec.id.short_hash()))).unwrap();
    fs::create_dir_all(parent.join(format!("{}-0.art", spec.id.short_hash()))).unwrap();

    assert!(fix.store.resolve_id(&spec.id).unwrap().is_none());

    let (_, dir) = fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();
    assert!(dir.join("lib/libz.so").is_file());
  }

  #[test]
  fn delete_removes_artifact_and_symlink() {
    let fix = StoreFixture::new();
    let key = zlib_source(&fix);
    let spec = zlib_spec(&key, "1.2.7");
    let (id, dir) = fix
      .store
      .ensure_present(&spec, &fix.cache, &fix.virtuals, KeepBuild::default())
      .unwrap();

    let removed = fix.store.delete(&id.to_string()).unwrap().unwrap();
    assert_eq!(removed, dir);
    assert!(!dir.exists());
    assert!(fs::symlink_metadata(fix.store.full_symlink_path(&id)).is_err());
    assert!(fix.store.delete(&id.to_string()).unwrap().is_none());
  }

  #[test]
  fn iter_artifacts_lists_complete_ones_only() {
    let fix = StoreFixture::new();
    let tool_id = plant_tool_artifact(&fix.store, "extra", "1");
    // An aborted publication: directory without id marker.
    let junk = fix.store.artifact_root().join("junk/1/aaaa");
    fs::create_dir_all(&junk).unwrap();

    let ids: Vec<String> = fix
      .store
      .iter_artifacts()
      .unwrap()
      .into_iter()
      .map(|(id, _)| id.to_string())
      .collect();
    assert!(ids.contains(&tool_id.to_string()));
    assert!(ids.contains(&fix.virtuals["virtual:unix"].to_string()));
    assert!(!ids.iter().any(|id| id.starts_with("junk/")));
  }

  fn staging_entries(fix: &StoreFixture) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for name in fs::read_dir(fix.store.build_root()).unwrap().flatten() {
      for version in fs::read_dir(name.path()).unwrap().flatten() {
        for entry in fs::read_dir(version.path()).unwrap().flatten() {
          out.push(entry.path());
        }
      }
    }
    out
  }
}
