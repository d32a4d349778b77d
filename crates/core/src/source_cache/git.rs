//! Git fetches for the source cache.
//!
//! One clone per remote lives under `<cache_root>/git/`; gix handles
//! cloning, incremental fetches and revision resolution. Keys carry the
//! full commit SHA, so any cached clone that already contains a commit can
//! satisfy a fetch or an unpack regardless of which remote it came from.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use gix::remote::Direction;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::hash::hash_bytes;

#[derive(Debug, Error)]
pub enum GitError {
  #[error("failed to create git cache directory '{0}': {1}")]
  CreateCacheDir(PathBuf, #[source] io::Error),

  #[error("failed to clone repository '{url}': {source}")]
  Clone {
    url: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("failed to open repository at '{path}': {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: Box<gix::open::Error>,
  },

  #[error("failed to fetch from '{url}': {source}")]
  Fetch {
    url: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("failed to connect to remote '{url}': {source}")]
  Connect {
    url: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("no remote configured for repository")]
  NoRemote,

  #[error("revision '{rev}' not found in repository")]
  RevisionNotFound { rev: String },

  #[error("commit '{sha}' not present in any cached repository")]
  CommitNotFound { sha: String },

  #[error("failed to read object '{oid}': {message}")]
  ReadObject { oid: String, message: String },

  #[error("{op} '{path}': {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> GitError + 'a {
  move |source| GitError::Io { op, path: path.to_path_buf(), source }
}

/// Whether any cached clone contains the commit.
pub(super) fn contains(git_dir: &Path, sha: &str) -> bool {
  find_commit_repo(git_dir, sha).is_some()
}

/// Fetch `rev` from `url`, returning the full commit SHA.
///
/// An exact 40-hex commit already present in a cached clone short-circuits
/// without network access.
pub(super) fn fetch(git_dir: &Path, url: &str, rev: &str) -> Result<String, GitError> {
  if !git_dir.exists() {
    fs::create_dir_all(git_dir).map_err(|e| GitError::CreateCacheDir(git_dir.to_path_buf(), e))?;
  }

  if is_full_sha(rev) && contains(git_dir, rev) {
    debug!(rev, "commit already cached, skipping fetch");
    return Ok(rev.to_lowercase());
  }

  let repo_path = git_dir.join(remote_slug(url));
  let repo = if repo_path.join(".git").exists() || repo_path.join("HEAD").exists() {
    debug!(url, path = %repo_path.display(), "opening existing repository");
    let repo = gix::open(&repo_path).map_err(|e| GitError::Open {
      path: repo_path.clone(),
      source: Box::new(e),
    })?;
    fetch_updates(&repo, url)?;
    repo
  } else {
    info!(url, path = %repo_path.display(), "cloning repository");
    clone_repo(url, &repo_path)?
  };

  let sha = resolve_revision(&repo, rev)?;
  debug!(url, rev, sha = %sha, "resolved revision");
  Ok(sha)
}

/// Extract the tree of `sha` into `target`, applying `strip`.
pub(super) fn unpack(
  git_dir: &Path,
  sha: &str,
  target: &Path,
  strip: u32,
) -> Result<(), GitError> {
  let repo = find_commit_repo(git_dir, sha).ok_or_else(|| GitError::CommitNotFound {
    sha: sha.to_string(),
  })?;
  let oid = parse_oid(sha)?;
  let object = repo.find_object(oid).map_err(|e| GitError::ReadObject {
    oid: sha.to_string(),
    message: e.to_string(),
  })?;
  let commit = object
    .peel_tags_to_end()
    .map_err(|e| GitError::ReadObject {
      oid: sha.to_string(),
      message: e.to_string(),
    })?
    .try_into_commit()
    .map_err(|e| GitError::ReadObject {
      oid: sha.to_string(),
      message: e.to_string(),
    })?;
  let tree = commit.tree().map_err(|e| GitError::ReadObject {
    oid: sha.to_string(),
    message: e.to_string(),
  })?;
  extract_tree(&tree, target, Path::new(""), strip)
}

fn clone_repo(url: &str, dest: &Path) -> Result<gix::Repository, GitError> {
  let mut prepared = gix::prepare_clone(url, dest).map_err(|e| GitError::Clone {
    url: url.to_string(),
    source: Box::new(e),
  })?;

  let (mut checkout, _outcome) = prepared
    .fetch_then_checkout(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| GitError::Clone {
      url: url.to_string(),
      source: Box::new(e),
    })?;

  let (repo, _outcome) = checkout
    .main_worktree(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| GitError::Clone {
      url: url.to_string(),
      source: Box::new(e),
    })?;

  Ok(repo)
}

fn fetch_updates(repo: &gix::Repository, url: &str) -> Result<(), GitError> {
  debug!(url, "fetching updates");

  let remote = repo
    .find_default_remote(Direction::Fetch)
    .ok_or(GitError::NoRemote)?
    .map_err(|e| GitError::Connect {
      url: url.to_string(),
      source: Box::new(e),
    })?;

  let connection = remote.connect(Direction::Fetch).map_err(|e| GitError::Connect {
    url: url.to_string(),
    source: Box::new(e),
  })?;

  connection
    .prepare_fetch(gix::progress::Discard, Default::default())
    .map_err(|e| GitError::Fetch {
      url: url.to_string(),
      source: Box::new(e),
    })?
    .receive(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| GitError::Fetch {
      url: url.to_string(),
      source: Box::new(e),
    })?;

  Ok(())
}

/// Resolve a commit, tag or branch name to a full commit SHA. Annotated
/// tags are peeled to the commit they point at.
fn resolve_revision(repo: &gix::Repository, rev: &str) -> Result<String, GitError> {
  let not_found = || GitError::RevisionNotFound { rev: rev.to_string() };

  let spec = repo.rev_parse(rev).map_err(|_| not_found())?;
  let id = spec.single().ok_or_else(|| GitError::RevisionNotFound {
    rev: format!("{} (ambiguous)", rev),
  })?;
  let object = id.object().map_err(|_| not_found())?;
  let commit = object
    .peel_tags_to_end()
    .map_err(|_| not_found())?;
  Ok(commit.id.to_string())
}

fn extract_tree(
  tree: &gix::Tree<'_>,
  target: &Path,
  rel: &Path,
  strip: u32,
) -> Result<(), GitError> {
  for entry in tree.iter() {
    let entry = entry.map_err(|e| GitError::ReadObject {
      oid: tree.id.to_string(),
      message: e.to_string(),
    })?;
    let name = entry.filename().to_string();
    let rel_child = rel.join(&name);
    let read_err = |e: String| GitError::ReadObject {
      oid: entry.id().to_string(),
      message: e,
    };

    use gix::objs::tree::EntryKind;
    match entry.mode().kind() {
      EntryKind::Tree => {
        let object = entry.object().map_err(|e| read_err(e.to_string()))?;
        let subtree = object
          .try_into_tree()
          .map_err(|e| read_err(e.to_string()))?;
        if let Some(dest) = strip_dest(target, &rel_child, strip) {
          fs::create_dir_all(&dest).map_err(io_err("mkdir", &dest))?;
        }
        extract_tree(&subtree, target, &rel_child, strip)?;
      }
      EntryKind::Blob | EntryKind::BlobExecutable => {
        if let Some(dest) = strip_dest(target, &rel_child, strip) {
          let object = entry.object().map_err(|e| read_err(e.to_string()))?;
          if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_err("mkdir", parent))?;
          }
          fs::write(&dest, &object.data).map_err(io_err("write", &dest))?;
          use std::os::unix::fs::PermissionsExt;
          let mode = if entry.mode().kind() == EntryKind::BlobExecutable {
            0o755
          } else {
            0o644
          };
          fs::set_permissions(&dest, fs::Permissions::from_mode(mode))
            .map_err(io_err("chmod", &dest))?;
        }
      }
      EntryKind::Link => {
        if let Some(dest) = strip_dest(target, &rel_child, strip) {
          let object = entry.object().map_err(|e| read_err(e.to_string()))?;
          let link = String::from_utf8_lossy(&object.data).into_owned();
          if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_err("mkdir", parent))?;
          }
          let _ = fs::remove_file(&dest);
          std::os::unix::fs::symlink(&link, &dest).map_err(io_err("symlink", &dest))?;
        }
      }
      EntryKind::Commit => {
        warn!(path = %rel_child.display(), "skipping submodule entry");
      }
    }
  }
  Ok(())
}

fn strip_dest(target: &Path, rel: &Path, strip: u32) -> Option<PathBuf> {
  let parts: Vec<_> = rel.components().collect();
  if parts.len() <= strip as usize {
    return None;
  }
  let mut out = target.to_path_buf();
  for part in &parts[strip as usize..] {
    out.push(part);
  }
  Some(out)
}

fn find_commit_repo(git_dir: &Path, sha: &str) -> Option<gix::Repository> {
  let oid = parse_oid(sha).ok()?;
  let entries = fs::read_dir(git_dir).ok()?;
  for entry in entries.flatten() {
    if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
      continue;
    }
    if let Ok(repo) = gix::open(entry.path()) {
      let found = repo.try_find_object(oid).ok().flatten().is_some();
      if found {
        return Some(repo);
      }
    }
  }
  None
}

fn parse_oid(sha: &str) -> Result<gix::ObjectId, GitError> {
  gix::ObjectId::from_hex(sha.as_bytes()).map_err(|_| GitError::CommitNotFound {
    sha: sha.to_string(),
  })
}

fn is_full_sha(rev: &str) -> bool {
  rev.len() == 40 && rev.chars().all(|c| c.is_ascii_hexdigit())
}

/// Stable directory name for a remote: a sanitized tail of the URL plus a
/// short hash of the whole URL.
fn remote_slug(url: &str) -> String {
  let tail = url
    .trim_end_matches('/')
    .trim_end_matches(".git")
    .rsplit('/')
    .next()
    .unwrap_or("repo");
  let sanitized: String = tail
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
    .collect();
  format!("{}-{}", sanitized, &hash_bytes(url.as_bytes())[..8])
}
