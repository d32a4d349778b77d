//! Post-processing helpers for relocatable artifacts.
//!
//! Most build systems bake absolute interpreter paths into installed
//! scripts. [`patch_shebangs`] rewrites such shebangs into a multi-line
//! `/bin/sh` trampoline that resolves the interpreter next to the script
//! (i.e. through the profile) at runtime, falling back to the original
//! path. [`scan_store_paths`] reports files that embed the absolute store
//! root; rewriting RPATHs themselves is left to an external
//! patchelf-style tool invoked from build commands.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ToolsError {
  #[error("{op} '{path}': {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> ToolsError + 'a {
  move |source| ToolsError::Io { op, path: path.to_path_buf(), source }
}

/// Rewrite absolute-interpreter shebangs of executable scripts under
/// `dir`, recursively. Returns the files that were patched.
pub fn patch_shebangs(dir: &Path) -> Result<Vec<PathBuf>, ToolsError> {
  let mut patched = Vec::new();
  for entry in WalkDir::new(dir) {
    let entry = entry.map_err(|e| ToolsError::Io {
      op: "walk",
      path: dir.to_path_buf(),
      source: io::Error::other(e),
    })?;
    if !entry.file_type().is_file() {
      continue;
    }
    if patch_shebang_file(entry.path())? {
      patched.push(entry.path().to_path_buf());
    }
  }
  info!(dir = %dir.display(), patched = patched.len(), "shebang patching complete");
  Ok(patched)
}

/// Patch a single file; returns whether it was modified.
pub fn patch_shebang_file(path: &Path) -> Result<bool, ToolsError> {
  let meta = fs::symlink_metadata(path).map_err(io_err("stat", path))?;
  if !meta.is_file() || !is_executable_mode(&meta) {
    return Ok(false);
  }
  let contents = fs::read(path).map_err(io_err("read", path))?;
  if !contents.starts_with(b"#!") {
    return Ok(false);
  }
  let text = match String::from_utf8(contents) {
    Ok(text) => text,
    Err(_) => return Ok(false),
  };
  let (first_line, rest) = match text.split_once('\n') {
    Some(split) => split,
    None => return Ok(false),
  };

  let mut words = first_line[2..].split_whitespace();
  let interpreter = match words.next() {
    Some(interpreter) => interpreter,
    None => return Ok(false),
  };
  let extra_args: Vec<&str> = words.collect();

  // Only absolute interpreters need relocating; `env`-style shebangs and
  // the shell itself already resolve at runtime.
  if !interpreter.starts_with('/')
    || interpreter == "/bin/sh"
    || interpreter.ends_with("/env")
  {
    return Ok(false);
  }
  let base = match Path::new(interpreter).file_name().and_then(|n| n.to_str()) {
    Some(base) => base,
    None => return Ok(false),
  };

  let args = if extra_args.is_empty() {
    String::new()
  } else {
    format!(" {}", extra_args.join(" "))
  };
  // The quoted-string line is a no-op for sh but a harmless expression for
  // the scripting language the rest of the file is written in, so one file
  // parses under both.
  let trampoline = format!(
    "#!/bin/sh\n\
     \"true\" '''\\'\n\
     interp=\"$(dirname \"$0\")/{base}\"\n\
     test -x \"$interp\" || interp=\"{interpreter}\"\n\
     exec \"$interp\"{args} \"$0\" \"$@\"\n\
     '''\n"
  );
  let patched = format!("{}{}", trampoline, rest);
  fs::write(path, patched).map_err(io_err("write", path))?;
  debug!(path = %path.display(), interpreter, "patched shebang");
  Ok(true)
}

/// Files under `dir` that embed the absolute `store_root` path in their
/// raw bytes (scripts, RPATHs, configuration baked by build systems).
pub fn scan_store_paths(dir: &Path, store_root: &Path) -> Result<Vec<PathBuf>, ToolsError> {
  let needle = store_root.as_os_str().as_encoded_bytes();
  let mut hits = Vec::new();
  for entry in WalkDir::new(dir) {
    let entry = entry.map_err(|e| ToolsError::Io {
      op: "walk",
      path: dir.to_path_buf(),
      source: io::Error::other(e),
    })?;
    if !entry.file_type().is_file() {
      continue;
    }
    let contents = fs::read(entry.path()).map_err(io_err("read", entry.path()))?;
    if contains_bytes(&contents, needle) {
      hits.push(entry.path().to_path_buf());
    }
  }
  hits.sort();
  Ok(hits)
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
  !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn is_executable_mode(meta: &fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  meta.permissions().mode() & 0o111 != 0
}
