//! Small filesystem helpers shared across the crate.
//!
//! Everything here follows one rule: state that other processes may observe
//! appears only through `rename`, so readers never see a half-written file
//! or a dangling intermediate.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use walkdir::WalkDir;

/// Create `dir` and all parents, tolerating a directory that already exists.
pub fn silent_makedirs(dir: &Path) -> io::Result<()> {
  fs::create_dir_all(dir)
}

/// Remove a file or symlink, tolerating its absence.
pub fn silent_unlink(path: &Path) -> io::Result<()> {
  match fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

/// Create or replace a symlink atomically.
///
/// The link is created under a temporary name next to `link` and renamed
/// into place; readers see either the old target or the new one.
pub fn atomic_symlink(target: &Path, link: &Path) -> io::Result<()> {
  let parent = link.parent().unwrap_or_else(|| Path::new("."));
  let tmp = parent.join(format!(
    ".{}.tmp-{}",
    link.file_name().and_then(|n| n.to_str()).unwrap_or("link"),
    std::process::id()
  ));
  let _ = fs::remove_file(&tmp);
  symlink(target, &tmp)?;
  fs::rename(&tmp, link)
}

/// Write `contents` to `path` atomically (temp file + rename).
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
  let parent = path.parent().unwrap_or_else(|| Path::new("."));
  let tmp = parent.join(format!(
    ".{}.tmp-{}",
    path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
    std::process::id()
  ));
  fs::write(&tmp, contents)?;
  fs::rename(&tmp, path)
}

/// Gzip-compress `src` into `dest`.
pub fn gzip_compress(src: &Path, dest: &Path) -> io::Result<()> {
  let data = fs::read(src)?;
  let file = fs::File::create(dest)?;
  let mut encoder = GzEncoder::new(file, Compression::default());
  encoder.write_all(&data)?;
  encoder.finish()?;
  Ok(())
}

/// Recursively copy a directory tree, preserving symlinks and permissions.
pub fn copy_tree(src: &Path, dest: &Path) -> io::Result<()> {
  fs::create_dir_all(dest)?;
  for entry in WalkDir::new(src).min_depth(1) {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry
      .path()
      .strip_prefix(src)
      .map_err(io::Error::other)?;
    let target = dest.join(rel);
    let ftype = entry.file_type();
    if ftype.is_dir() {
      fs::create_dir_all(&target)?;
    } else if ftype.is_symlink() {
      let link = fs::read_link(entry.path())?;
      silent_unlink(&target)?;
      symlink(&link, &target)?;
    } else {
      if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
      }
      fs::copy(entry.path(), &target)?;
    }
  }
  Ok(())
}

/// Total size in bytes of all regular files under `path`.
pub fn dir_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

/// Relative path from `from` (a directory) to `to`.
///
/// Both paths must be absolute. Produced paths use `..` segments, never
/// touching the filesystem.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
  let from: Vec<_> = from.components().collect();
  let to_parts: Vec<_> = to.components().collect();
  let common = from
    .iter()
    .zip(to_parts.iter())
    .take_while(|(a, b)| a == b)
    .count();
  let mut out = PathBuf::new();
  for _ in common..from.len() {
    out.push("..");
  }
  for part in &to_parts[common..] {
    out.push(part);
  }
  if out.as_os_str().is_empty() {
    out.push(".");
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn atomic_symlink_replaces_existing() {
    let temp = TempDir::new().unwrap();
    let link = temp.path().join("link");
    atomic_symlink(Path::new("/a"), &link).unwrap();
    atomic_symlink(Path::new("/b"), &link).unwrap();
    assert_eq!(fs::read_link(&link).unwrap(), Path::new("/b"));
  }

  #[test]
  fn silent_unlink_tolerates_missing() {
    let temp = TempDir::new().unwrap();
    silent_unlink(&temp.path().join("nope")).unwrap();
  }

  #[test]
  fn copy_tree_preserves_structure_and_symlinks() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    fs::create_dir_all(src.join("sub")).unwrap();
    fs::write(src.join("sub/file.txt"), "hello").unwrap();
    symlink(Path::new("sub/file.txt"), src.join("alias")).unwrap();

    let dest = temp.path().join("dest");
    copy_tree(&src, &dest).unwrap();

    assert_eq!(fs::read_to_string(dest.join("sub/file.txt")).unwrap(), "hello");
    assert_eq!(
      fs::read_link(dest.join("alias")).unwrap(),
      Path::new("sub/file.txt")
    );
  }

  #[test]
  fn relative_path_walks_up_and_down() {
    assert_eq!(
      relative_path(Path::new("/a/b/c"), Path::new("/a/x/y")),
      Path::new("../../x/y")
    );
    assert_eq!(
      relative_path(Path::new("/a/b"), Path::new("/a/b")),
      Path::new(".")
    );
  }

  #[test]
  fn gzip_roundtrip() {
    use std::io::Read;
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("log");
    let dest = temp.path().join("log.gz");
    fs::write(&src, "line one\nline two\n").unwrap();
    gzip_compress(&src, &dest).unwrap();

    let mut decoder = flate2::read::GzDecoder::new(fs::File::open(&dest).unwrap());
    let mut out = String::new();
    decoder.read_to_string(&mut out).unwrap();
    assert_eq!(out, "line one\nline two\n");
  }
}
