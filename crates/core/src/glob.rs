//! Ant-style globbing for the link DSL.
//!
//! Supported syntax: `*` matches any run of characters within one path
//! segment, `**` matches zero or more whole segments. `**` may not be mixed
//! with other characters inside a segment.
//!
//! ```text
//! *.txt          matches  a.txt, b.txt
//! foo/**/bar     matches  foo/bar, foo/a/b/bar
//! lib/**         matches  everything under lib/, recursively
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GlobError {
  #[error("empty glob pattern")]
  EmptyPattern,

  #[error("'**' cannot be combined with other characters in a path segment: '{0}'")]
  MixedDoubleStar(String),

  #[error("failed to read directory '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Collect paths under `root` matching `pattern`, relative to `root`,
/// sorted. Directories are included only when `include_dirs` is set;
/// symlinks always match as leaves.
pub fn ant_glob(root: &Path, pattern: &str, include_dirs: bool) -> Result<Vec<PathBuf>, GlobError> {
  let parts: Vec<&str> = pattern.trim_matches('/').split('/').collect();
  if parts.is_empty() || parts.iter().all(|p| p.is_empty()) {
    return Err(GlobError::EmptyPattern);
  }
  for part in &parts {
    if part.contains("**") && *part != "**" {
      return Err(GlobError::MixedDoubleStar(part.to_string()));
    }
  }
  let mut out = Vec::new();
  walk(root, Path::new(""), &parts, include_dirs, &mut out)?;
  out.sort();
  out.dedup();
  Ok(out)
}

fn walk(
  dir: &Path,
  rel: &Path,
  parts: &[&str],
  include_dirs: bool,
  out: &mut Vec<PathBuf>,
) -> Result<(), GlobError> {
  let (part, rest) = match parts.split_first() {
    Some(split) => split,
    None => return Ok(()),
  };

  if *part == "**" {
    if rest.is_empty() {
      // Trailing '**': everything below, recursively. An empty directory
      // yields an empty (but valid) selection.
      collect_all(dir, rel, include_dirs, out)?;
      return Ok(());
    }
    // Zero directories consumed.
    walk(dir, rel, rest, include_dirs, out)?;
    // Or descend one level and keep the '**'.
    for entry in read_dir(dir)? {
      let (name, path, is_dir) = entry;
      if is_dir {
        walk(&path, &rel.join(&name), parts, include_dirs, out)?;
      }
    }
    return Ok(());
  }

  for (name, path, is_dir) in read_dir(dir)? {
    if !wildcard_match(part, &name) {
      continue;
    }
    let rel_path = rel.join(&name);
    if rest.is_empty() {
      if !is_dir || include_dirs {
        out.push(rel_path);
      }
    } else if is_dir {
      walk(&path, &rel_path, rest, include_dirs, out)?;
    }
  }
  Ok(())
}

fn collect_all(
  dir: &Path,
  rel: &Path,
  include_dirs: bool,
  out: &mut Vec<PathBuf>,
) -> Result<(), GlobError> {
  for (name, path, is_dir) in read_dir(dir)? {
    let rel_path = rel.join(&name);
    if is_dir {
      if include_dirs {
        out.push(rel_path.clone());
      }
      collect_all(&path, &rel_path, include_dirs, out)?;
    } else {
      out.push(rel_path);
    }
  }
  Ok(())
}

/// Directory listing as (name, path, is_dir). Symlinks count as leaves even
/// when they point at directories, so globs never escape the root.
fn read_dir(dir: &Path) -> Result<Vec<(String, PathBuf, bool)>, GlobError> {
  let entries = fs::read_dir(dir).map_err(|source| GlobError::Io {
    path: dir.to_path_buf(),
    source,
  })?;
  let mut out = Vec::new();
  for entry in entries {
    let entry = entry.map_err(|source| GlobError::Io {
      path: dir.to_path_buf(),
      source,
    })?;
    let name = match entry.file_name().into_string() {
      Ok(name) => name,
      Err(_) => continue,
    };
    let ftype = entry.file_type().map_err(|source| GlobError::Io {
      path: entry.path(),
      source,
    })?;
    let is_dir = ftype.is_dir() && !ftype.is_symlink();
    out.push((name, entry.path(), is_dir));
  }
  out.sort_by(|a, b| a.0.cmp(&b.0));
  Ok(out)
}

/// `*`-only wildcard match over a single segment.
fn wildcard_match(pattern: &str, name: &str) -> bool {
  let pieces: Vec<&str> = pattern.split('*').collect();
  if pieces.len() == 1 {
    return pattern == name;
  }
  let mut pos = 0usize;
  for (i, piece) in pieces.iter().enumerate() {
    if piece.is_empty() {
      continue;
    }
    if i == 0 {
      if !name.starts_with(piece) {
        return false;
      }
      pos = piece.len();
    } else if i == pieces.len() - 1 {
      return name.len() >= pos + piece.len() && name.ends_with(piece);
    } else {
      match name[pos..].find(piece) {
        Some(found) => pos = pos + found + piece.len(),
        None => return false,
      }
    }
  }
  // Pattern ends with '*' (or is all '*'s): any tail matches.
  true
}
