//! Profile assembly.
//!
//! A profile is a prefix directory (`bin`, `lib`, `include`, ...) composed
//! from a set of artifacts. Each artifact's `install` block says how its
//! files enter the profile (the link DSL of [`crate::links`]); the
//! assembled directory also carries a `profile.json` aggregating every
//! artifact's exported environment variables.
//!
//! Profiles are themselves built as artifacts: [`profile_build_spec`]
//! synthesizes a build spec whose single command re-enters the in-tree
//! assembler (`hit build-profile`), which makes profiles content-addressed,
//! cacheable and visible to the garbage collector like everything else.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::build_spec::{ArtifactId, BuildSpec, SpecError};
use crate::build_store::{BuildStore, StoreError};
use crate::links::{LinkError, LinkRule, execute_links};

pub const PROFILE_JSON: &str = "profile.json";

#[derive(Debug, Error)]
pub enum ProfileError {
  #[error("artifact {id} is not present in the store")]
  NotPresent { id: String },

  #[error("profile target '{0}' exists and is not empty")]
  TargetNotEmpty(PathBuf),

  #[error("artifacts disagree on profile variable '{variable}': '{a}' vs '{b}'")]
  EnvConflict {
    variable: String,
    a: String,
    b: String,
  },

  #[error("artifact {id} carries a malformed install document: {message}")]
  BadInstallDoc { id: String, message: String },

  #[error(transparent)]
  Link(#[from] LinkError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Spec(#[from] SpecError),

  #[error("{op} '{path}': {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// `profile.json` written at the root of every assembled profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileManifest {
  /// Every artifact in the profile, dependencies included, in assembly
  /// order.
  pub artifacts: Vec<String>,
  /// Merged `profile-env-vars` of all artifacts.
  #[serde(default)]
  pub env: BTreeMap<String, String>,
}

/// The transitive `runtime-dependencies` closure of `roots`, roots first,
/// deterministic for a given store.
pub fn runtime_closure(
  store: &BuildStore,
  roots: &[ArtifactId],
) -> Result<Vec<ArtifactId>, ProfileError> {
  let mut seen: BTreeSet<String> = BTreeSet::new();
  let mut order: Vec<ArtifactId> = Vec::new();
  let mut queue: VecDeque<ArtifactId> = roots.iter().cloned().collect();

  while let Some(id) = queue.pop_front() {
    if !seen.insert(id.to_string()) {
      continue;
    }
    let dir = store
      .resolve_id(&id)?
      .ok_or_else(|| ProfileError::NotPresent { id: id.to_string() })?;
    let meta = store.read_artifact_meta(&dir)?;
    for dep in &meta.runtime_dependencies {
      if let Ok(dep) = dep.parse::<ArtifactId>() {
        queue.push_back(dep);
      }
    }
    order.push(id);
  }
  Ok(order)
}

/// Assemble a profile from `roots` into `target_dir` (which must not exist
/// or be empty). Returns the written manifest.
pub fn make_profile(
  store: &BuildStore,
  roots: &[ArtifactId],
  target_dir: &Path,
) -> Result<ProfileManifest, ProfileError> {
  ensure_empty_dir(target_dir)?;
  assemble_into(store, roots, target_dir)
}

/// Assembly without the empty-target check: the path used when a profile
/// is built as an artifact and the target is the build's staging dir
/// (which already carries `build.json` and `artifact.json`).
pub fn assemble_into(
  store: &BuildStore,
  roots: &[ArtifactId],
  target_dir: &Path,
) -> Result<ProfileManifest, ProfileError> {
  let artifacts = runtime_closure(store, roots)?;

  let mut env: BTreeMap<String, String> = BTreeMap::new();
  for id in &artifacts {
    let dir = store
      .resolve_id(id)?
      .ok_or_else(|| ProfileError::NotPresent { id: id.to_string() })?;
    let meta = store.read_artifact_meta(&dir)?;

    install_artifact(id, &dir, &meta.install, target_dir)?;

    for (key, value) in &meta.profile_env_vars {
      match env.get(key) {
        Some(existing) if existing != value => {
          return Err(ProfileError::EnvConflict {
            variable: key.clone(),
            a: existing.clone(),
            b: value.clone(),
          });
        }
        _ => {
          env.insert(key.clone(), value.clone());
        }
      }
    }
  }

  let manifest = ProfileManifest {
    artifacts: artifacts.iter().map(ArtifactId::to_string).collect(),
    env,
  };
  let path = target_dir.join(PROFILE_JSON);
  let content = serde_json::to_string_pretty(&manifest).expect("manifest serializes");
  fs::write(&path, format!("{}\n", content)).map_err(|source| ProfileError::Io {
    op: "write",
    path,
    source,
  })?;
  info!(target = %target_dir.display(), artifacts = manifest.artifacts.len(), "assembled profile");
  Ok(manifest)
}

fn install_artifact(
  id: &ArtifactId,
  artifact_dir: &Path,
  install: &Value,
  target_dir: &Path,
) -> Result<(), ProfileError> {
  if install.is_null() {
    debug!(id = %id.short_form(), "no install block, nothing to do");
    return Ok(());
  }
  let rules = match install.get("parameters").and_then(|p| p.get("links")) {
    Some(rules) => rules,
    None => {
      debug!(id = %id.short_form(), "install block carries no link rules");
      return Ok(());
    }
  };
  let rules: Vec<LinkRule> =
    serde_json::from_value(rules.clone()).map_err(|e| ProfileError::BadInstallDoc {
      id: id.to_string(),
      message: e.to_string(),
    })?;

  let env = BTreeMap::from([
    (
      "ARTIFACT".to_string(),
      artifact_dir.to_string_lossy().into_owned(),
    ),
    (
      "PROFILE".to_string(),
      target_dir.to_string_lossy().into_owned(),
    ),
  ]);
  debug!(id = %id.short_form(), rules = rules.len(), "linking into profile");
  execute_links(&rules, &env)?;
  Ok(())
}

/// Synthesize the build spec that produces a profile artifact over `roots`.
///
/// The spec imports every root (so the profile's hash covers them and GC
/// sees the edges) and runs the in-tree assembler against a manifest
/// carried in the spec's `files` section.
pub fn profile_build_spec(name: &str, roots: &[ArtifactId]) -> Result<BuildSpec, SpecError> {
  let imports: Vec<Value> = roots
    .iter()
    .enumerate()
    .map(|(i, id)| json!({"ref": format!("profile_dep_{}", i), "id": id.to_string()}))
    .collect();
  let manifest = json!({
    "artifacts": roots.iter().map(ArtifactId::to_string).collect::<Vec<_>>()
  });
  BuildSpec::new(&json!({
    "name": name,
    "version": "n",
    "build": {
      "import": imports,
      "commands": [
        {"cmd": ["hit", "build-profile", "profile.json"]}
      ]
    },
    "files": [
      {"target": "profile.json", "object": manifest}
    ]
  }))
}

fn ensure_empty_dir(dir: &Path) -> Result<(), ProfileError> {
  match fs::read_dir(dir) {
    Ok(mut entries) => {
      if entries.next().is_some() {
        return Err(ProfileError::TargetNotEmpty(dir.to_path_buf()));
      }
      Ok(())
    }
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      fs::create_dir_all(dir).map_err(|source| ProfileError::Io {
        op: "mkdir",
        path: dir.to_path_buf(),
        source,
      })
    }
    Err(source) => Err(ProfileError::Io {
      op: "readdir",
      path: dir.to_path_buf(),
      source,
    }),
  }
}
