//! Content-addressed source cache.
//!
//! Tarballs, zip archives, git commits, plain files and directory snapshots
//! are stored under keys of the form `<scheme>:<digest>` and verified
//! against their key on every unpack. Re-fetching existing content is a
//! no-op; distinct schemes never collide because the scheme is part of the
//! key.
//!
//! # Layout
//!
//! ```text
//! <cache_root>/
//! ├── index.json          # url → key map, key → retention tag map
//! ├── tar.gz/<digest>     # archive bytes
//! ├── tar.bz2/<digest>
//! ├── zip/<digest>
//! ├── file/<digest>       # raw bytes (+ <digest>.name sidecar)
//! ├── dir/<digest>/       # directory snapshot
//! └── git/<slug>/         # one clone per remote, managed by gix
//! ```
//!
//! # Keys
//!
//! `git:` keys carry the full commit SHA. `file:` keys hash the raw bytes.
//! Archive and `dir:` keys carry the canonical *tree hash*: the document
//! hash of the sorted entry manifest (path, content digest, executable
//! flag / symlink target), so the key is independent of compression
//! metadata and timestamps.

mod archive;
mod git;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::fileutil::{copy_tree, silent_makedirs, write_atomic};
use crate::hash::{format_digest, hash_document};

pub use git::GitError;

const INDEX_FILENAME: &str = "index.json";
const INDEX_VERSION: u32 = 1;

/// Retrieval/unpack scheme of a source key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SourceScheme {
  TarGz,
  TarBz2,
  Zip,
  Git,
  Dir,
  File,
}

impl SourceScheme {
  pub fn as_str(&self) -> &'static str {
    match self {
      SourceScheme::TarGz => "tar.gz",
      SourceScheme::TarBz2 => "tar.bz2",
      SourceScheme::Zip => "zip",
      SourceScheme::Git => "git",
      SourceScheme::Dir => "dir",
      SourceScheme::File => "file",
    }
  }

  /// Default retention tag for entries of this scheme.
  pub fn retention_tag(&self) -> RetentionTag {
    match self {
      SourceScheme::TarGz | SourceScheme::TarBz2 | SourceScheme::Zip => RetentionTag::Targz,
      SourceScheme::Git => RetentionTag::Git,
      SourceScheme::Dir => RetentionTag::Dir,
      SourceScheme::File => RetentionTag::File,
    }
  }

  /// Guess the archive scheme from a URL or filename.
  pub fn guess_from_url(url: &str) -> Option<SourceScheme> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
      Some(SourceScheme::TarGz)
    } else if path.ends_with(".tar.bz2") || path.ends_with(".tbz2") {
      Some(SourceScheme::TarBz2)
    } else if path.ends_with(".zip") {
      Some(SourceScheme::Zip)
    } else {
      None
    }
  }
}

impl FromStr for SourceScheme {
  type Err = SourceError;

  fn from_str(s: &str) -> Result<Self, SourceError> {
    match s {
      "tar.gz" => Ok(SourceScheme::TarGz),
      "tar.bz2" => Ok(SourceScheme::TarBz2),
      "zip" => Ok(SourceScheme::Zip),
      "git" => Ok(SourceScheme::Git),
      "dir" => Ok(SourceScheme::Dir),
      "file" => Ok(SourceScheme::File),
      other => Err(SourceError::UnknownScheme(other.to_string())),
    }
  }
}

impl fmt::Display for SourceScheme {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Content-addressed identifier of a source item: `<scheme>:<digest>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceKey {
  pub scheme: SourceScheme,
  pub digest: String,
}

impl SourceKey {
  pub fn new(scheme: SourceScheme, digest: String) -> Self {
    Self { scheme, digest }
  }
}

impl fmt::Display for SourceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.scheme, self.digest)
  }
}

impl FromStr for SourceKey {
  type Err = SourceError;

  fn from_str(s: &str) -> Result<Self, SourceError> {
    let (scheme, digest) = s.split_once(':').ok_or_else(|| SourceError::BadKey(s.to_string()))?;
    if digest.is_empty() {
      return Err(SourceError::BadKey(s.to_string()));
    }
    Ok(SourceKey {
      scheme: scheme.parse()?,
      digest: digest.to_string(),
    })
  }
}

/// Retention class, consumed by the garbage collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionTag {
  Transient,
  Targz,
  Git,
  File,
  Dir,
}

#[derive(Debug, Error)]
pub enum SourceError {
  #[error("source key '{0}' must have the form '<scheme>:<digest>'")]
  BadKey(String),

  #[error("unknown source scheme '{0}'")]
  UnknownScheme(String),

  #[error("cannot guess archive type of '{0}'; pass an explicit type")]
  CannotGuessType(String),

  #[error("sources for key '{0}' not found")]
  NotFound(String),

  /// Retryable: the network or the remote failed, not the cache.
  #[error("failed to fetch '{url}': {message}")]
  Fetch { url: String, message: String },

  #[error(
    "source cache entry for '{key}' is corrupt (content hashes to {actual}); entry quarantined"
  )]
  Corrupt { key: String, actual: String },

  #[error("url '{url}' is recorded as {recorded} but its content now hashes to {actual}; pass refresh to accept the new content")]
  UrlContentChanged {
    url: String,
    recorded: String,
    actual: String,
  },

  #[error("'{0}' exists but is not a {1}")]
  WrongKind(PathBuf, &'static str),

  #[error(transparent)]
  Git(#[from] GitError),

  #[error(transparent)]
  Hash(#[from] crate::hash::HashError),

  #[error("{op} '{path}': {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

impl SourceError {
  fn io<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> SourceError + 'a {
    move |source| SourceError::Io { op, path: path.to_path_buf(), source }
  }
}

/// The URL map and retention tags, persisted next to the entries.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
  version: u32,
  urls: BTreeMap<String, String>,
  tags: BTreeMap<String, RetentionTag>,
}

/// A source cache rooted at one directory.
pub struct SourceCache {
  root: PathBuf,
}

impl SourceCache {
  /// Open a cache, creating the directory skeleton if needed.
  pub fn open(root: &Path) -> Result<Self, SourceError> {
    silent_makedirs(root).map_err(SourceError::io("mkdir", root))?;
    Ok(Self { root: root.to_path_buf() })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// On-disk location of a key's entry.
  pub fn entry_path(&self, key: &SourceKey) -> PathBuf {
    self.root.join(key.scheme.as_str()).join(&key.digest)
  }

  pub fn contains(&self, key: &SourceKey) -> bool {
    match key.scheme {
      SourceScheme::Git => git::contains(&self.git_dir(), &key.digest),
      _ => self.entry_path(key).exists(),
    }
  }

  fn git_dir(&self) -> PathBuf {
    self.root.join("git")
  }

  /// Fetch a URL into the cache.
  ///
  /// Idempotent: a URL already recorded in the index whose entry is present
  /// returns its key without touching the network. Changed content under a
  /// known URL is an error unless `refresh` is set.
  pub fn fetch(
    &self,
    url: &str,
    scheme: Option<SourceScheme>,
    refresh: bool,
  ) -> Result<SourceKey, SourceError> {
    let mut index = self.load_index()?;
    if !refresh {
      if let Some(recorded) = index.urls.get(url) {
        let key: SourceKey = recorded.parse()?;
        if self.contains(&key) {
          debug!(url, key = %key, "url already fetched");
          return Ok(key);
        }
      }
    }

    let scheme = scheme
      .or_else(|| SourceScheme::guess_from_url(url))
      .ok_or_else(|| SourceError::CannotGuessType(url.to_string()))?;

    info!(url, scheme = %scheme, "fetching");
    let scheme_dir = self.root.join(scheme.as_str());
    silent_makedirs(&scheme_dir).map_err(SourceError::io("mkdir", &scheme_dir))?;
    let temp = scheme_dir.join(format!(".downloading-{}", std::process::id()));
    archive::download(url, &temp)?;

    let digest = match archive::tree_digest(&temp, scheme) {
      Ok(digest) => digest,
      Err(e) => {
        let _ = fs::remove_file(&temp);
        return Err(e);
      }
    };
    let key = SourceKey::new(scheme, digest);

    if let Some(recorded) = index.urls.get(url) {
      if !refresh && recorded != &key.to_string() {
        let _ = fs::remove_file(&temp);
        return Err(SourceError::UrlContentChanged {
          url: url.to_string(),
          recorded: recorded.clone(),
          actual: key.to_string(),
        });
      }
    }

    // Identical content racing into place is harmless; the rename target is
    // keyed by digest.
    let dest = self.entry_path(&key);
    fs::rename(&temp, &dest).map_err(SourceError::io("rename", &dest))?;

    index.urls.insert(url.to_string(), key.to_string());
    index.tags.entry(key.to_string()).or_insert(scheme.retention_tag());
    self.save_index(&index)?;
    info!(url, key = %key, "fetched");
    Ok(key)
  }

  /// Fetch a git commit, branch or tag, returning `git:<commit-sha>`.
  ///
  /// Exact 40-hex commits already present in any cached clone resolve
  /// without network access, so remotes sharing history deduplicate.
  pub fn fetch_git(&self, repo_url: &str, rev: &str) -> Result<SourceKey, SourceError> {
    let sha = git::fetch(&self.git_dir(), repo_url, rev)?;
    let key = SourceKey::new(SourceScheme::Git, sha);
    let mut index = self.load_index()?;
    index
      .tags
      .entry(key.to_string())
      .or_insert(RetentionTag::Git);
    self.save_index(&index)?;
    Ok(key)
  }

  /// Store a local file, keyed by the digest of its raw bytes. The original
  /// filename is kept so `unpack` can materialize it.
  pub fn put_file(&self, path: &Path) -> Result<SourceKey, SourceError> {
    let meta = fs::symlink_metadata(path).map_err(SourceError::io("stat", path))?;
    if !meta.is_file() {
      return Err(SourceError::WrongKind(path.to_path_buf(), "file"));
    }
    let digest = file_content_digest(path)?;
    let key = SourceKey::new(SourceScheme::File, digest);

    let dest = self.entry_path(&key);
    if !dest.exists() {
      silent_makedirs(dest.parent().unwrap()).map_err(SourceError::io("mkdir", &dest))?;
      fs::copy(path, &dest).map_err(SourceError::io("copy", path))?;
      let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
      write_atomic(&dest.with_extension("name"), name.as_bytes())
        .map_err(SourceError::io("write", &dest))?;
    }
    self.record_tag(&key, RetentionTag::File)?;
    Ok(key)
  }

  /// Store a directory snapshot, keyed by its canonical tree hash.
  pub fn put_dir(&self, path: &Path) -> Result<SourceKey, SourceError> {
    if !path.is_dir() {
      return Err(SourceError::WrongKind(path.to_path_buf(), "directory"));
    }
    let digest = tree_digest_of_dir(path)?;
    let key = SourceKey::new(SourceScheme::Dir, digest);

    let dest = self.entry_path(&key);
    if !dest.exists() {
      let staging = dest.with_extension("tmp");
      let _ = fs::remove_dir_all(&staging);
      copy_tree(path, &staging).map_err(SourceError::io("copy", path))?;
      fs::rename(&staging, &dest).map_err(SourceError::io("rename", &dest))?;
    }
    self.record_tag(&key, RetentionTag::Dir)?;
    Ok(key)
  }

  /// Unpack the sources identified by `key` into `target`, dropping `strip`
  /// leading path components.
  ///
  /// Content is re-verified against the key while extracting; a mismatch
  /// quarantines the cache entry and fails. `target` should be a fresh
  /// directory the caller is prepared to discard on error.
  pub fn unpack(&self, key: &SourceKey, target: &Path, strip: u32) -> Result<(), SourceError> {
    silent_makedirs(target).map_err(SourceError::io("mkdir", target))?;
    debug!(key = %key, target = %target.display(), strip, "unpacking");
    match key.scheme {
      SourceScheme::TarGz | SourceScheme::TarBz2 | SourceScheme::Zip => {
        let pack = self.entry_path(key);
        if !pack.exists() {
          return Err(SourceError::NotFound(key.to_string()));
        }
        let digest = archive::unpack(&pack, key.scheme, target, strip)?;
        if digest != key.digest {
          self.quarantine(key)?;
          return Err(SourceError::Corrupt {
            key: key.to_string(),
            actual: digest,
          });
        }
        Ok(())
      }
      SourceScheme::Git => {
        git::unpack(&self.git_dir(), &key.digest, target, strip).map_err(SourceError::from)
      }
      SourceScheme::Dir => {
        let entry = self.entry_path(key);
        if !entry.is_dir() {
          return Err(SourceError::NotFound(key.to_string()));
        }
        let digest = tree_digest_of_dir(&entry)?;
        if digest != key.digest {
          self.quarantine(key)?;
          return Err(SourceError::Corrupt {
            key: key.to_string(),
            actual: digest,
          });
        }
        unpack_dir_with_strip(&entry, target, strip)
      }
      SourceScheme::File => {
        let entry = self.entry_path(key);
        if !entry.exists() {
          return Err(SourceError::NotFound(key.to_string()));
        }
        let digest = file_content_digest(&entry)?;
        if digest != key.digest {
          self.quarantine(key)?;
          return Err(SourceError::Corrupt {
            key: key.to_string(),
            actual: digest,
          });
        }
        let name = fs::read_to_string(entry.with_extension("name"))
          .unwrap_or_else(|_| key.digest.clone());
        let dest = target.join(name.trim());
        fs::copy(&entry, &dest).map_err(SourceError::io("copy", &dest))?;
        Ok(())
      }
    }
  }

  /// Assign a retention tag (e.g. mark a key `transient`).
  pub fn set_tag(&self, key: &SourceKey, tag: RetentionTag) -> Result<(), SourceError> {
    let mut index = self.load_index()?;
    index.tags.insert(key.to_string(), tag);
    self.save_index(&index)
  }

  /// Every non-git entry with its tag and location, for the collector.
  pub fn entries(&self) -> Result<Vec<(SourceKey, PathBuf, RetentionTag)>, SourceError> {
    let index = self.load_index()?;
    let mut out = Vec::new();
    for scheme in [
      SourceScheme::TarGz,
      SourceScheme::TarBz2,
      SourceScheme::Zip,
      SourceScheme::Dir,
      SourceScheme::File,
    ] {
      let dir = self.root.join(scheme.as_str());
      if !dir.is_dir() {
        continue;
      }
      let listing = fs::read_dir(&dir).map_err(SourceError::io("readdir", &dir))?;
      for entry in listing.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.')
          || name.ends_with(".name")
          || name.ends_with(".corrupt")
          || name.ends_with(".tmp")
        {
          continue;
        }
        let key = SourceKey::new(scheme, name);
        let tag = index
          .tags
          .get(&key.to_string())
          .copied()
          .unwrap_or(scheme.retention_tag());
        out.push((key.clone(), self.entry_path(&key), tag));
      }
    }
    Ok(out)
  }

  /// Remove an entry (collector only).
  pub fn remove_entry(&self, key: &SourceKey) -> Result<(), SourceError> {
    let path = self.entry_path(key);
    if path.is_dir() {
      fs::remove_dir_all(&path).map_err(SourceError::io("rmdir", &path))?;
    } else if path.exists() {
      fs::remove_file(&path).map_err(SourceError::io("unlink", &path))?;
      let _ = fs::remove_file(path.with_extension("name"));
    }
    let mut index = self.load_index()?;
    index.tags.remove(&key.to_string());
    index.urls.retain(|_, v| v != &key.to_string());
    self.save_index(&index)
  }

  fn quarantine(&self, key: &SourceKey) -> Result<(), SourceError> {
    let path = self.entry_path(key);
    let quarantined = path.with_extension("corrupt");
    warn!(key = %key, "quarantining corrupt source cache entry");
    fs::rename(&path, &quarantined).map_err(SourceError::io("rename", &path))
  }

  fn record_tag(&self, key: &SourceKey, tag: RetentionTag) -> Result<(), SourceError> {
    let mut index = self.load_index()?;
    index.tags.entry(key.to_string()).or_insert(tag);
    self.save_index(&index)
  }

  fn load_index(&self) -> Result<Index, SourceError> {
    let path = self.root.join(INDEX_FILENAME);
    let content = match fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        return Ok(Index { version: INDEX_VERSION, ..Index::default() });
      }
      Err(e) => return Err(SourceError::Io { op: "read", path, source: e }),
    };
    serde_json::from_str(&content).map_err(|e| SourceError::Io {
      op: "parse",
      path,
      source: io::Error::other(e),
    })
  }

  fn save_index(&self, index: &Index) -> Result<(), SourceError> {
    let path = self.root.join(INDEX_FILENAME);
    let content = serde_json::to_string_pretty(index).expect("index serialization is infallible");
    write_atomic(&path, content.as_bytes()).map_err(SourceError::io("write", &path))
  }
}

/// Accumulates the canonical entry manifest of a file tree.
///
/// Entries: `["f", path, content_digest, executable]` for files,
/// `["l", path, link_target]` for symlinks. Directories are implied by the
/// paths. The digest is the document hash (doctype `source-tree`) of the
/// path-sorted entry list.
pub(crate) struct TreeHasher {
  entries: Vec<(String, Value)>,
}

impl TreeHasher {
  pub fn new() -> Self {
    Self { entries: Vec::new() }
  }

  pub fn add_file(&mut self, path: &str, content_digest: &str, executable: bool) {
    self
      .entries
      .push((path.to_string(), json!(["f", path, content_digest, executable])));
  }

  pub fn add_link(&mut self, path: &str, target: &str) {
    self.entries.push((path.to_string(), json!(["l", path, target])));
  }

  pub fn finish(mut self) -> String {
    self.entries.sort_by(|a, b| a.0.cmp(&b.0));
    let doc = Value::Array(self.entries.into_iter().map(|(_, v)| v).collect());
    hash_document("source-tree", &doc).expect("tree manifest contains no floats")
  }
}

/// Canonical tree hash of an on-disk directory.
pub(crate) fn tree_digest_of_dir(root: &Path) -> Result<String, SourceError> {
  let mut tree = TreeHasher::new();
  for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
    let entry = entry.map_err(|e| SourceError::Io {
      op: "walk",
      path: root.to_path_buf(),
      source: io::Error::other(e),
    })?;
    let rel = entry
      .path()
      .strip_prefix(root)
      .expect("walkdir stays under root")
      .to_string_lossy()
      .into_owned();
    let ftype = entry.file_type();
    if ftype.is_symlink() {
      let target = fs::read_link(entry.path()).map_err(SourceError::io("readlink", entry.path()))?;
      tree.add_link(&rel, &target.to_string_lossy());
    } else if ftype.is_file() {
      let executable = is_executable(entry.path());
      tree.add_file(&rel, &file_content_digest(entry.path())?, executable);
    }
  }
  Ok(tree.finish())
}

/// Digest of a file's raw bytes, streaming, in the standard encoding. The
/// same digest is produced for an identical entry inside an archive, so
/// `dir:` snapshots and archives of one tree agree.
pub(crate) fn file_content_digest(path: &Path) -> Result<String, SourceError> {
  use sha2::Digest;
  use std::io::Read;
  let file = fs::File::open(path).map_err(SourceError::io("open", path))?;
  let mut reader = io::BufReader::new(file);
  let mut hasher = sha2::Sha256::new();
  let mut buf = [0u8; 8192];
  loop {
    let n = reader.read(&mut buf).map_err(SourceError::io("read", path))?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
  }
  Ok(format_digest(&hasher.finalize()))
}

fn unpack_dir_with_strip(src: &Path, target: &Path, strip: u32) -> Result<(), SourceError> {
  if strip == 0 {
    return copy_tree(src, target).map_err(SourceError::io("copy", src));
  }
  for entry in fs::read_dir(src).map_err(SourceError::io("readdir", src))?.flatten() {
    // Each top-level directory loses `strip` components; files at stripped
    // depth vanish, matching archive semantics.
    if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
      unpack_dir_with_strip(&entry.path(), target, strip - 1)?;
    }
  }
  Ok(())
}

pub(crate) fn is_executable(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;
  fs::metadata(path)
    .map(|m| m.permissions().mode() & 0o111 != 0)
    .unwrap_or(false)
}
