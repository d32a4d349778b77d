//! Archive download, extraction and tree hashing.
//!
//! Extraction does three things in a single pass over the archive: it
//! hashes every entry into the canonical tree manifest (with unstripped
//! paths), writes the entry to disk at its stripped path, and skips entries
//! consumed entirely by `strip`. Fetching reuses the same pass with no
//! target to learn an archive's key before committing it to the cache.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::hash::format_digest;

use super::{SourceError, SourceScheme, TreeHasher};

/// Download `url` to `dest`. `http(s)` goes through reqwest; `file:` URLs
/// and bare paths are copied from the local filesystem.
pub(super) fn download(url: &str, dest: &Path) -> Result<(), SourceError> {
  let fetch_err = |message: String| SourceError::Fetch { url: url.to_string(), message };

  if url.starts_with("http://") || url.starts_with("https://") {
    let mut response = reqwest::blocking::get(url).map_err(|e| fetch_err(e.to_string()))?;
    if !response.status().is_success() {
      return Err(fetch_err(format!("HTTP {}", response.status())));
    }
    let mut file = File::create(dest).map_err(SourceError::io("create", dest))?;
    response
      .copy_to(&mut file)
      .map_err(|e| fetch_err(e.to_string()))?;
    file.flush().map_err(SourceError::io("write", dest))?;
    debug!(url, dest = %dest.display(), "downloaded");
    Ok(())
  } else {
    let path = url.strip_prefix("file://").unwrap_or(url);
    fs::copy(path, dest)
      .map(|_| ())
      .map_err(|e| fetch_err(format!("local copy from '{}': {}", path, e)))
  }
}

/// Tree digest of an archive without extracting it anywhere.
pub(super) fn tree_digest(pack: &Path, scheme: SourceScheme) -> Result<String, SourceError> {
  extract(pack, scheme, None, 0)
}

/// Extract an archive into `target` (with `strip`) and return the tree
/// digest observed while extracting.
pub(super) fn unpack(
  pack: &Path,
  scheme: SourceScheme,
  target: &Path,
  strip: u32,
) -> Result<String, SourceError> {
  extract(pack, scheme, Some(target), strip)
}

fn extract(
  pack: &Path,
  scheme: SourceScheme,
  target: Option<&Path>,
  strip: u32,
) -> Result<String, SourceError> {
  let file = File::open(pack).map_err(SourceError::io("open", pack))?;
  match scheme {
    SourceScheme::TarGz => extract_tar(GzDecoder::new(file), pack, target, strip),
    SourceScheme::TarBz2 => extract_tar(BzDecoder::new(file), pack, target, strip),
    SourceScheme::Zip => extract_zip(file, pack, target, strip),
    _ => unreachable!("extract only handles archive schemes"),
  }
}

fn extract_tar<R: Read>(
  reader: R,
  pack: &Path,
  target: Option<&Path>,
  strip: u32,
) -> Result<String, SourceError> {
  let mut archive = tar::Archive::new(reader);
  let mut tree = TreeHasher::new();

  let entries = archive.entries().map_err(SourceError::io("read", pack))?;
  for entry in entries {
    let mut entry = entry.map_err(SourceError::io("read", pack))?;
    let raw_path = entry.path().map_err(SourceError::io("read", pack))?.into_owned();
    let rel = match normalize_entry_path(&raw_path) {
      Some(rel) => rel,
      None => continue,
    };
    let dest = dest_path(target, &rel, strip);

    use tar::EntryType;
    match entry.header().entry_type() {
      EntryType::Directory => {
        if let Some(dest) = dest {
          fs::create_dir_all(&dest).map_err(SourceError::io("mkdir", &dest))?;
        }
      }
      EntryType::Symlink => {
        let link = entry
          .link_name()
          .map_err(SourceError::io("read", pack))?
          .map(|l| l.to_string_lossy().into_owned())
          .unwrap_or_default();
        tree.add_link(&rel, &link);
        if let Some(dest) = dest {
          write_symlink(&link, &dest)?;
        }
      }
      EntryType::Regular => {
        let executable = entry.header().mode().map(|m| m & 0o111 != 0).unwrap_or(false);
        let digest = write_entry(&mut entry, dest.as_deref(), executable)
          .map_err(SourceError::io("write", pack))?;
        tree.add_file(&rel, &digest, executable);
      }
      other => {
        warn!(path = %rel, kind = ?other, "skipping unsupported tar entry");
      }
    }
  }
  Ok(tree.finish())
}

fn extract_zip(
  file: File,
  pack: &Path,
  target: Option<&Path>,
  strip: u32,
) -> Result<String, SourceError> {
  let zip_err = |e: zip::result::ZipError| SourceError::Io {
    op: "read",
    path: pack.to_path_buf(),
    source: io::Error::other(e),
  };
  let mut archive = zip::ZipArchive::new(file).map_err(zip_err)?;
  let mut tree = TreeHasher::new();

  for i in 0..archive.len() {
    let mut entry = archive.by_index(i).map_err(zip_err)?;
    let raw_path = match entry.enclosed_name() {
      Some(path) => path,
      None => {
        warn!(name = entry.name(), "skipping zip entry with unsafe path");
        continue;
      }
    };
    let rel = match normalize_entry_path(&raw_path) {
      Some(rel) => rel,
      None => continue,
    };
    let dest = dest_path(target, &rel, strip);

    if entry.is_dir() {
      if let Some(dest) = dest {
        fs::create_dir_all(&dest).map_err(SourceError::io("mkdir", &dest))?;
      }
      continue;
    }
    let executable = entry.unix_mode().map(|m| m & 0o111 != 0).unwrap_or(false);
    let digest = write_entry(&mut entry, dest.as_deref(), executable)
      .map_err(SourceError::io("write", pack))?;
    tree.add_file(&rel, &digest, executable);
  }
  Ok(tree.finish())
}

/// In-archive path as a `/`-separated string, with `.` components dropped.
/// Absolute paths and `..` are rejected.
fn normalize_entry_path(path: &Path) -> Option<String> {
  use std::path::Component;
  let mut parts = Vec::new();
  for comp in path.components() {
    match comp {
      Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
      Component::CurDir => {}
      _ => {
        warn!(path = %path.display(), "skipping archive entry with unsafe path");
        return None;
      }
    }
  }
  if parts.is_empty() {
    None
  } else {
    Some(parts.join("/"))
  }
}

/// The on-disk destination after applying `strip`, or `None` when the entry
/// is hash-only (no target) or entirely consumed by `strip`.
fn dest_path(target: Option<&Path>, rel: &str, strip: u32) -> Option<PathBuf> {
  let target = target?;
  let parts: Vec<&str> = rel.split('/').collect();
  if parts.len() <= strip as usize {
    return None;
  }
  let mut out = target.to_path_buf();
  for part in &parts[strip as usize..] {
    out.push(part);
  }
  Some(out)
}

/// Stream an entry to disk (if a destination is given) while hashing its
/// contents; returns the content digest.
fn write_entry<R: Read>(
  reader: &mut R,
  dest: Option<&Path>,
  executable: bool,
) -> io::Result<String> {
  let mut hasher = Sha256::new();
  let mut writer = match dest {
    Some(dest) => {
      if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
      }
      Some(File::create(dest)?)
    }
    None => None,
  };
  let mut buf = [0u8; 8192];
  loop {
    let n = reader.read(&mut buf)?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
    if let Some(writer) = writer.as_mut() {
      writer.write_all(&buf[..n])?;
    }
  }
  if let Some(dest) = dest {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(dest, fs::Permissions::from_mode(mode))?;
  }
  Ok(format_digest(&hasher.finalize()))
}

fn write_symlink(link: &str, dest: &Path) -> Result<(), SourceError> {
  if let Some(parent) = dest.parent() {
    fs::create_dir_all(parent).map_err(SourceError::io("mkdir", parent))?;
  }
  let _ = fs::remove_file(dest);
  std::os::unix::fs::symlink(link, dest).map_err(SourceError::io("symlink", dest))
}
