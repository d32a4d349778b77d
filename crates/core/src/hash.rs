//! Canonical document hashing.
//!
//! Every hashing site in the crate (source keys, build-spec digests, profile
//! manifests) goes through [`Hasher`]: a stable serialization of JSON-like
//! document trees into a SHA-256 stream. Each node is prefixed with a
//! one-byte type tag and a length envelope, mappings are emitted with keys
//! in sorted order, lists preserve order and strings are UTF-8
//! length-prefixed. The stream is deliberately trivial to reimplement in
//! another language.
//!
//! # Digest format
//!
//! The first 20 bytes of the SHA-256 digest, URL-safe base64 encoded without
//! padding (27 characters).

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Number of digest bytes kept before encoding.
pub const DIGEST_BYTES: usize = 20;

/// Errors from canonical hashing.
#[derive(Debug, Error)]
pub enum HashError {
  /// Floating-point numbers have multiple representations and are rejected.
  #[error("floating-point number not allowed in hashed document")]
  InvalidHashInput,

  #[error("failed to read {path}: {source}")]
  Io {
    path: std::path::PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Incremental canonical hasher over documents, bytes and files.
pub struct Hasher {
  inner: Sha256,
}

impl Hasher {
  pub fn new() -> Self {
    Self { inner: Sha256::new() }
  }

  /// Feed raw bytes into the stream without an envelope.
  ///
  /// Only used for doctype seeds; document content must go through the
  /// typed update methods.
  fn emit(&mut self, bytes: &[u8]) {
    self.inner.update(bytes);
  }

  /// Hash a byte string with the `B{len}:` envelope.
  pub fn update_bytes(&mut self, bytes: &[u8]) {
    self.emit(format!("B{}:", bytes.len()).as_bytes());
    self.emit(bytes);
  }

  /// Hash a string (UTF-8 bytes, same envelope as raw bytes).
  pub fn update_str(&mut self, s: &str) {
    self.update_bytes(s.as_bytes());
  }

  /// Hash a JSON document tree.
  ///
  /// Mappings sort their keys bytewise, lists keep their order, integers
  /// are written as decimal strings. Floats are rejected.
  pub fn update_value(&mut self, value: &Value) -> Result<(), HashError> {
    match value {
      Value::Null => self.emit(b"N"),
      Value::Bool(true) => self.emit(b"T"),
      Value::Bool(false) => self.emit(b"F"),
      Value::Number(n) => {
        let s = if let Some(i) = n.as_i64() {
          i.to_string()
        } else if let Some(u) = n.as_u64() {
          u.to_string()
        } else {
          return Err(HashError::InvalidHashInput);
        };
        self.emit(format!("I{}:", s.len()).as_bytes());
        self.emit(s.as_bytes());
      }
      Value::String(s) => self.update_str(s),
      Value::Array(items) => {
        self.emit(format!("L{}:", items.len()).as_bytes());
        for item in items {
          self.update_value(item)?;
        }
      }
      Value::Object(map) => {
        self.emit(format!("D{}:", map.len()).as_bytes());
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        for key in keys {
          self.update_str(key);
          self.update_value(&map[key])?;
        }
      }
    }
    Ok(())
  }

  /// Hash the contents of a file, streaming, with the byte envelope.
  pub fn update_file(&mut self, path: &Path) -> Result<(), HashError> {
    let file = File::open(path).map_err(|source| HashError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let len = file.metadata().map_err(|source| HashError::Io {
      path: path.to_path_buf(),
      source,
    })?.len();
    self.emit(format!("B{}:", len).as_bytes());
    let mut reader = BufReader::new(file);
    let mut buf = [0u8; 8192];
    loop {
      let n = reader.read(&mut buf).map_err(|source| HashError::Io {
        path: path.to_path_buf(),
        source,
      })?;
      if n == 0 {
        break;
      }
      self.emit(&buf[..n]);
    }
    Ok(())
  }

  /// Finish and return the formatted digest.
  pub fn format_digest(self) -> String {
    format_digest(&self.inner.finalize())
  }
}

impl Default for Hasher {
  fn default() -> Self {
    Self::new()
  }
}

/// The standard digest encoding: first [`DIGEST_BYTES`] bytes, URL-safe
/// base64 without padding.
pub fn format_digest(digest: &[u8]) -> String {
  URL_SAFE_NO_PAD.encode(&digest[..DIGEST_BYTES])
}

/// Hash a document with a doctype seed.
///
/// The string `{doctype}|` is fed into the stream first so that different
/// kinds of documents never collide even when structurally identical.
pub fn hash_document(doctype: &str, doc: &Value) -> Result<String, HashError> {
  let mut hasher = Hasher::new();
  hasher.emit(doctype.as_bytes());
  hasher.emit(b"|");
  hasher.update_value(doc)?;
  Ok(hasher.format_digest())
}

/// Digest of a plain byte buffer (no envelope), in the standard encoding.
pub fn hash_bytes(bytes: &[u8]) -> String {
  let mut h = Sha256::new();
  h.update(bytes);
  format_digest(&h.finalize())
}

/// Returns a copy of `doc` with every key ending in `_nohash` removed,
/// recursively.
///
/// Such fields pass through to the build environment but never enter a
/// hash: they control how to build, not what.
pub fn prune_nohash(doc: &Value) -> Value {
  match doc {
    Value::Object(map) => {
      let mut out = serde_json::Map::new();
      for (key, value) in map {
        if !key.ends_with("_nohash") {
          out.insert(key.clone(), prune_nohash(value));
        }
      }
      Value::Object(out)
    }
    Value::Array(items) => Value::Array(items.iter().map(prune_nohash).collect()),
    other => other.clone(),
  }
}
