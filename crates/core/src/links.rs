//! The link/copy DSL used to install artifact files into profiles.
//!
//! A rule list is applied in order. Each rule either names an exact
//! `source` file or a `select` glob evaluated under `prefix`; matching
//! paths are recreated beneath `target` with the prefix stripped. `exclude`
//! rules remove paths from every later selection. `$VAR` substitution
//! (typically `$ARTIFACT` and `$PROFILE`) is performed on `select`,
//! `prefix`, `source` and `target`.
//!
//! Conflicts are errors: a destination that already exists must be the
//! identical symlink (same link target) or an identical file, unless the
//! rule sets `force`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::fileutil::{silent_makedirs, silent_unlink};
use crate::glob::{GlobError, ant_glob};
use crate::run_job::{SubstError, substitute};

#[derive(Debug, Error)]
pub enum LinkError {
  #[error("link rule with 'select' must also carry 'prefix'")]
  MissingPrefix,

  #[error("link rule must carry either 'select' or 'source'")]
  MissingSelection,

  #[error("link rule action '{0}' requires a 'target'")]
  MissingTarget(String),

  #[error("'{path}' does not start with prefix '{prefix}'")]
  PrefixMismatch { path: PathBuf, prefix: PathBuf },

  #[error("conflicting writes to '{path}'")]
  Conflict { path: PathBuf },

  #[error(transparent)]
  Glob(#[from] GlobError),

  #[error(transparent)]
  Subst(#[from] SubstError),

  #[error("{op} '{path}': {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkAction {
  Symlink,
  Copy,
  /// Like copy, but dereferences the source first: a symlinked file is
  /// materialized into the destination.
  Absorb,
  Exclude,
}

/// One rule of the install DSL, as found in
/// `artifact.json: install.parameters.links`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkRule {
  pub action: LinkAction,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub select: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub prefix: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target: Option<String>,
  /// Include directories in glob selection.
  #[serde(default)]
  pub dirs: bool,
  /// Overwrite instead of raising a conflict.
  #[serde(default)]
  pub force: bool,
}

/// A planned operation; the plan can be inspected without touching the
/// filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
  Makedirs(PathBuf),
  Symlink { source: PathBuf, dest: PathBuf, force: bool },
  Copy { source: PathBuf, dest: PathBuf, deref: bool, force: bool },
}

/// Expand rules into a plan of operations.
pub fn dry_run_links(
  rules: &[LinkRule],
  env: &BTreeMap<String, String>,
) -> Result<Vec<LinkOp>, LinkError> {
  let mut ops = Vec::new();
  let mut excluded: BTreeSet<PathBuf> = BTreeSet::new();
  let mut made_dirs: BTreeSet<PathBuf> = BTreeSet::new();

  for rule in rules {
    if let Some(select) = &rule.select {
      glob_rule(rule, select, env, &mut excluded, &mut made_dirs, &mut ops)?;
    } else if let Some(source) = &rule.source {
      single_rule(rule, source, env, &mut excluded, &mut made_dirs, &mut ops)?;
    } else {
      return Err(LinkError::MissingSelection);
    }
  }
  Ok(ops)
}

/// Execute the rules against the filesystem.
pub fn execute_links(
  rules: &[LinkRule],
  env: &BTreeMap<String, String>,
) -> Result<(), LinkError> {
  for op in dry_run_links(rules, env)? {
    apply_op(&op)?;
  }
  Ok(())
}

fn glob_rule(
  rule: &LinkRule,
  select: &str,
  env: &BTreeMap<String, String>,
  excluded: &mut BTreeSet<PathBuf>,
  made_dirs: &mut BTreeSet<PathBuf>,
  ops: &mut Vec<LinkOp>,
) -> Result<(), LinkError> {
  let prefix = match &rule.prefix {
    Some(p) => PathBuf::from(substitute(p, env)?),
    None => return Err(LinkError::MissingPrefix),
  };
  let select = substitute(select, env)?;

  // A 'select' is evaluated under its prefix.
  let (glob_root, pattern) = split_select(&select, &prefix);
  let matches = ant_glob(&glob_root, &pattern, rule.dirs)?;
  let selected: BTreeSet<PathBuf> = matches.iter().map(|m| glob_root.join(m)).collect();

  if rule.action == LinkAction::Exclude {
    excluded.extend(selected);
    return Ok(());
  }

  let target_prefix = rule
    .target
    .as_deref()
    .ok_or_else(|| LinkError::MissingTarget(format!("{:?}", rule.action)))?;
  let target_prefix = PathBuf::from(substitute(target_prefix, env)?);

  for path in selected {
    if excluded.contains(&path) {
      continue;
    }
    let rel = path
      .strip_prefix(&glob_root)
      .map_err(|_| LinkError::PrefixMismatch {
        path: path.clone(),
        prefix: glob_root.clone(),
      })?;
    let dest = target_prefix.join(rel);
    push_op(rule, path, dest, made_dirs, ops);
  }
  Ok(())
}

fn single_rule(
  rule: &LinkRule,
  source: &str,
  env: &BTreeMap<String, String>,
  excluded: &mut BTreeSet<PathBuf>,
  made_dirs: &mut BTreeSet<PathBuf>,
  ops: &mut Vec<LinkOp>,
) -> Result<(), LinkError> {
  let source = PathBuf::from(substitute(source, env)?);
  if rule.action == LinkAction::Exclude {
    excluded.insert(source);
    return Ok(());
  }
  if excluded.contains(&source) {
    return Ok(());
  }
  let target = rule
    .target
    .as_deref()
    .ok_or_else(|| LinkError::MissingTarget(format!("{:?}", rule.action)))?;
  let dest = PathBuf::from(substitute(target, env)?);
  push_op(rule, source, dest, made_dirs, ops);
  Ok(())
}

fn split_select(select: &str, prefix: &Path) -> (PathBuf, String) {
  let pattern = select
    .strip_prefix(&*prefix.to_string_lossy())
    .map(|rest| rest.trim_start_matches('/').to_string())
    .unwrap_or_else(|| select.trim_start_matches('/').to_string());
  (prefix.to_path_buf(), pattern)
}

fn push_op(
  rule: &LinkRule,
  source: PathBuf,
  dest: PathBuf,
  made_dirs: &mut BTreeSet<PathBuf>,
  ops: &mut Vec<LinkOp>,
) {
  if let Some(parent) = dest.parent() {
    if !parent.as_os_str().is_empty() && !made_dirs.contains(parent) {
      ops.push(LinkOp::Makedirs(parent.to_path_buf()));
      made_dirs.insert(parent.to_path_buf());
    }
  }
  match rule.action {
    LinkAction::Symlink => ops.push(LinkOp::Symlink { source, dest, force: rule.force }),
    LinkAction::Copy => ops.push(LinkOp::Copy {
      source,
      dest,
      deref: false,
      force: rule.force,
    }),
    LinkAction::Absorb => ops.push(LinkOp::Copy {
      source,
      dest,
      deref: true,
      force: rule.force,
    }),
    LinkAction::Exclude => unreachable!("exclude handled by callers"),
  }
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> LinkError + 'a {
  move |source: io::Error| LinkError::Io {
    op,
    path: path.to_path_buf(),
    source,
  }
}

fn apply_op(op: &LinkOp) -> Result<(), LinkError> {
  match op {
    LinkOp::Makedirs(path) => {
      silent_makedirs(path).map_err(io_err("mkdir", path))?;
    }
    LinkOp::Symlink { source, dest, force } => {
      debug!(source = %source.display(), dest = %dest.display(), "symlink");
      match fs::symlink_metadata(dest) {
        Ok(_) => {
          let existing = fs::read_link(dest).ok();
          if existing.as_deref() == Some(source.as_path()) {
            return Ok(());
          }
          if !force {
            return Err(LinkError::Conflict { path: dest.clone() });
          }
          silent_unlink(dest).map_err(io_err("unlink", dest))?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_err("stat", dest)(e)),
      }
      symlink(source, dest).map_err(io_err("symlink", dest))?;
    }
    LinkOp::Copy { source, dest, deref, force } => {
      debug!(source = %source.display(), dest = %dest.display(), deref, "copy");
      if fs::symlink_metadata(dest).is_ok() {
        if identical_contents(source, dest) {
          return Ok(());
        }
        if !force {
          return Err(LinkError::Conflict { path: dest.clone() });
        }
        silent_unlink(dest).map_err(io_err("unlink", dest))?;
      }
      if !deref && fs::symlink_metadata(source).map(|m| m.is_symlink()).unwrap_or(false) {
        let link = fs::read_link(source).map_err(io_err("readlink", source))?;
        symlink(&link, dest).map_err(io_err("symlink", dest))?;
      } else {
        // fs::copy follows symlinks, which is exactly what absorb wants.
        fs::copy(source, dest).map_err(io_err("copy", source))?;
      }
    }
  }
  Ok(())
}

fn identical_contents(a: &Path, b: &Path) -> bool {
  match (fs::read(a), fs::read(b)) {
    (Ok(x), Ok(y)) => x == y,
    _ => false,
  }
}
