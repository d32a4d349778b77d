//! Build specifications and artifact identity.
//!
//! A build spec is a JSON document; if you know the spec you know the
//! artifact id, since the latter is the hash of the former. Canonicalization
//! fills defaults and sorts whatever must not depend on declaration order,
//! so the same logical spec always hashes identically, on any host.
//!
//! The hash input is the canonical document with `profile_install`,
//! `import_modify_env` and every `*_nohash` key removed: those fields travel
//! with the artifact but do not define what is built.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::hash::{HashError, hash_document, prune_nohash};

/// Length of the on-disk short hash prefix. Collisions lengthen it one
/// character at a time.
pub const SHORT_HASH_LEN: usize = 4;

/// Default version when a spec declares none.
pub const DEFAULT_VERSION: &str = "n";

/// Prefix marking virtual import ids (`virtual:<alias>`).
pub const VIRTUAL_PREFIX: &str = "virtual:";

#[derive(Debug, Error)]
pub enum SpecError {
  #[error("build spec is not a JSON object")]
  NotAnObject,

  #[error("build spec is missing required field '{0}'")]
  MissingField(&'static str),

  #[error("invalid {what} '{value}': must match {pattern}")]
  BadName {
    what: &'static str,
    value: String,
    pattern: &'static str,
  },

  #[error("source target '{0}' escapes the build directory")]
  TargetEscapes(String),

  #[error("first build command must invoke an imported artifact (a '${{ref}}' path) or the 'hit' tool")]
  FirstCommandNotSandboxed,

  #[error("invalid field '{field}': {message}")]
  BadField { field: &'static str, message: String },

  #[error("'{0}' is not a valid artifact id (expected name/version/hash)")]
  BadArtifactId(String),

  #[error(transparent)]
  Hash(#[from] HashError),
}

/// Canonical identifier of a built artifact: `name/version/hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactId {
  pub name: String,
  pub version: String,
  pub hash: String,
}

impl ArtifactId {
  /// The on-disk short form of the hash (prefix only; may be lengthened on
  /// collision by the store).
  pub fn short_hash(&self) -> &str {
    &self.hash[..SHORT_HASH_LEN.min(self.hash.len())]
  }

  pub fn short_form(&self) -> String {
    format!("{}/{}/{}", self.name, self.version, self.short_hash())
  }
}

impl fmt::Display for ArtifactId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.name, self.version, self.hash)
  }
}

impl FromStr for ArtifactId {
  type Err = SpecError;

  fn from_str(s: &str) -> Result<Self, SpecError> {
    let mut parts = s.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
      (Some(name), Some(version), Some(hash), None)
        if is_safe_name(name) && is_safe_version(version) && !hash.is_empty() =>
      {
        Ok(ArtifactId {
          name: name.to_string(),
          version: version.to_string(),
          hash: hash.to_string(),
        })
      }
      _ => Err(SpecError::BadArtifactId(s.to_string())),
    }
  }
}

/// A canonicalized build spec with its derived identity.
#[derive(Debug, Clone)]
pub struct BuildSpec {
  /// The canonical document, as serialized into `build.json`.
  pub doc: Value,
  pub id: ArtifactId,
}

impl BuildSpec {
  /// Canonicalize, validate and hash a spec document.
  pub fn new(spec: &Value) -> Result<Self, SpecError> {
    let doc = canonicalize(spec)?;
    let digest = hash_document("build-spec", &reduced_for_hashing(&doc))?;
    let name = doc["name"].as_str().expect("canonical spec has name").to_string();
    let version = doc["version"]
      .as_str()
      .expect("canonical spec has version")
      .to_string();
    Ok(BuildSpec {
      doc,
      id: ArtifactId { name, version, hash: digest },
    })
  }

  pub fn name(&self) -> &str {
    &self.id.name
  }

  pub fn version(&self) -> &str {
    &self.id.version
  }

  /// The `sources` section (canonical: every entry has key/target/strip).
  pub fn sources(&self) -> Vec<SourceItem> {
    self.doc["sources"]
      .as_array()
      .map(|items| {
        items
          .iter()
          .filter_map(|item| serde_json::from_value(item.clone()).ok())
          .collect()
      })
      .unwrap_or_default()
  }
}

/// One entry of the `sources` list.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SourceItem {
  pub key: String,
  pub target: String,
  pub strip: u32,
}

/// `[A-Za-z0-9_+-]+`
pub fn is_safe_name(s: &str) -> bool {
  !s.is_empty()
    && s.chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+'))
}

/// `[A-Za-z0-9_+.-]*`
pub fn is_safe_version(s: &str) -> bool {
  s.chars()
    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '.'))
}

fn canonicalize(spec: &Value) -> Result<Value, SpecError> {
  let map = spec.as_object().ok_or(SpecError::NotAnObject)?;
  let mut out = map.clone();

  let name = map
    .get("name")
    .and_then(Value::as_str)
    .ok_or(SpecError::MissingField("name"))?;
  if !is_safe_name(name) {
    return Err(SpecError::BadName {
      what: "name",
      value: name.to_string(),
      pattern: "[A-Za-z0-9_+-]+",
    });
  }

  let version = map
    .get("version")
    .and_then(Value::as_str)
    .unwrap_or(DEFAULT_VERSION);
  if !is_safe_version(version) {
    return Err(SpecError::BadName {
      what: "version",
      value: version.to_string(),
      pattern: "[A-Za-z0-9_+.-]*",
    });
  }
  out.insert("version".to_string(), Value::String(version.to_string()));

  if let Some(sources) = map.get("sources") {
    out.insert("sources".to_string(), canonicalize_sources(sources)?);
  }

  let build = map.get("build").ok_or(SpecError::MissingField("build"))?;
  out.insert("build".to_string(), canonicalize_job(build)?);

  Ok(Value::Object(out))
}

fn canonicalize_sources(sources: &Value) -> Result<Value, SpecError> {
  let items = sources.as_array().ok_or(SpecError::BadField {
    field: "sources",
    message: "expected a list".to_string(),
  })?;
  let mut canonical = Vec::with_capacity(items.len());
  for item in items {
    let map = item.as_object().ok_or(SpecError::BadField {
      field: "sources",
      message: "expected a list of objects".to_string(),
    })?;
    let mut map = map.clone();
    if !map.contains_key("key") {
      return Err(SpecError::MissingField("sources[].key"));
    }
    map
      .entry("target".to_string())
      .or_insert_with(|| Value::String(".".to_string()));
    map
      .entry("strip".to_string())
      .or_insert_with(|| Value::Number(0.into()));
    let target = map["target"].as_str().unwrap_or(".");
    if target.starts_with('/') || target.split('/').any(|c| c == "..") {
      return Err(SpecError::TargetEscapes(target.to_string()));
    }
    canonical.push(Value::Object(map));
  }
  canonical.sort_by(|a, b| {
    let ka = a["key"].as_str().unwrap_or("");
    let kb = b["key"].as_str().unwrap_or("");
    ka.cmp(kb)
  });
  Ok(Value::Array(canonical))
}

fn canonicalize_job(build: &Value) -> Result<Value, SpecError> {
  let map = build.as_object().ok_or(SpecError::BadField {
    field: "build",
    message: "expected an object".to_string(),
  })?;
  let mut out = map.clone();

  let mut imports: Vec<Value> = match map.get("import") {
    Some(Value::Array(items)) => items.clone(),
    Some(_) => {
      return Err(SpecError::BadField {
        field: "build.import",
        message: "expected a list".to_string(),
      });
    }
    None => Vec::new(),
  };
  let mut refs = Vec::new();
  for import in imports.iter_mut() {
    let map = import.as_object_mut().ok_or(SpecError::BadField {
      field: "build.import",
      message: "expected a list of objects".to_string(),
    })?;
    let r = map
      .get("ref")
      .and_then(Value::as_str)
      .ok_or(SpecError::MissingField("build.import[].ref"))?;
    if !is_safe_name(r) {
      return Err(SpecError::BadName {
        what: "import ref",
        value: r.to_string(),
        pattern: "[A-Za-z0-9_+-]+",
      });
    }
    refs.push(r.to_string());
    if !map.contains_key("id") {
      return Err(SpecError::MissingField("build.import[].id"));
    }
    if let Some(before) = map.get_mut("before") {
      let list = before.as_array().cloned().unwrap_or_default();
      let mut sorted: Vec<String> = list
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
      sorted.sort();
      *before = Value::Array(sorted.into_iter().map(Value::String).collect());
    }
  }
  imports.sort_by(|a, b| {
    let ka = a["id"].as_str().unwrap_or("");
    let kb = b["id"].as_str().unwrap_or("");
    ka.cmp(kb)
  });
  out.insert("import".to_string(), Value::Array(imports));

  for key in ["env", "env_nohash"] {
    out
      .entry(key.to_string())
      .or_insert_with(|| Value::Object(Map::new()));
  }
  out
    .entry("commands".to_string())
    .or_insert_with(|| Value::Array(Vec::new()));

  check_commands(&out["commands"], &refs)?;
  Ok(Value::Object(out))
}

/// Validate the command list: every command carries a non-empty `cmd` list
/// of strings, and the first command launches a process image from inside
/// the sandbox (a path through an imported artifact, or the in-tree `hit`
/// tool).
fn check_commands(commands: &Value, refs: &[String]) -> Result<(), SpecError> {
  let commands = commands.as_array().ok_or(SpecError::BadField {
    field: "build.commands",
    message: "expected a list".to_string(),
  })?;
  for (index, command) in commands.iter().enumerate() {
    let cmd = command
      .get("cmd")
      .and_then(Value::as_array)
      .ok_or_else(|| SpecError::BadField {
        field: "build.commands",
        message: format!("command {} needs a 'cmd' list", index),
      })?;
    if !cmd.iter().all(Value::is_string) {
      return Err(SpecError::BadField {
        field: "build.commands",
        message: format!("command {} has non-string 'cmd' entries", index),
      });
    }
    let token = cmd.first().and_then(Value::as_str).ok_or_else(|| SpecError::BadField {
      field: "build.commands",
      message: format!("command {} has an empty 'cmd' list", index),
    })?;
    if index == 0 {
      check_sandboxed_token(token, refs)?;
    }
  }
  Ok(())
}

fn check_sandboxed_token(token: &str, refs: &[String]) -> Result<(), SpecError> {
  if token == "hit" {
    return Ok(());
  }
  for r in refs {
    for pat in [format!("${{{}}}", r), format!("${}", r)] {
      if let Some(rest) = token.strip_prefix(&pat) {
        if rest.is_empty() || rest.starts_with('/') {
          return Ok(());
        }
      }
    }
  }
  Err(SpecError::FirstCommandNotSandboxed)
}

/// The document that actually enters the hash.
fn reduced_for_hashing(doc: &Value) -> Value {
  let mut reduced = doc.clone();
  if let Some(map) = reduced.as_object_mut() {
    map.remove("profile_install");
    map.remove("import_modify_env");
  }
  prune_nohash(&reduced)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn minimal_spec() -> Value {
    json!({
      "name": "zlib",
      "version": "1.2.7",
      "build": {
        "import": [{"ref": "unix", "id": "virtual:unix"}],
        "commands": [{"cmd": ["${unix}/bin/sh", "build.sh"]}]
      }
    })
  }

  #[test]
  fn artifact_id_roundtrip() {
    let id: ArtifactId = "zlib/1.2.7/4niostz3iktlg67najtxuwwgss5".parse().unwrap();
    assert_eq!(id.name, "zlib");
    assert_eq!(id.version, "1.2.7");
    assert_eq!(id.short_hash(), "4nio");
    assert_eq!(id.to_string(), "zlib/1.2.7/4niostz3iktlg67najtxuwwgss5");
  }

  #[test]
  fn artifact_id_rejects_garbage() {
    assert!("zlib".parse::<ArtifactId>().is_err());
    assert!("a/b/c/d".parse::<ArtifactId>().is_err());
    assert!("sp ace/1/abcd".parse::<ArtifactId>().is_err());
  }

  #[test]
  fn id_is_stable_under_key_reordering() {
    let a = BuildSpec::new(&minimal_spec()).unwrap();
    let b = BuildSpec::new(&json!({
      "build": {
        "commands": [{"cmd": ["${unix}/bin/sh", "build.sh"]}],
        "import": [{"id": "virtual:unix", "ref": "unix"}]
      },
      "version": "1.2.7",
      "name": "zlib"
    }))
    .unwrap();
    assert_eq!(a.id, b.id);
  }

  #[test]
  fn version_change_changes_id() {
    let mut spec = minimal_spec();
    let a = BuildSpec::new(&spec).unwrap();
    spec["version"] = json!("1.2.8");
    let b = BuildSpec::new(&spec).unwrap();
    assert_ne!(a.id.hash, b.id.hash);
    assert_eq!(a.id.name, b.id.name);
  }

  #[test]
  fn env_nohash_does_not_change_id() {
    let mut spec = minimal_spec();
    let a = BuildSpec::new(&spec).unwrap();
    spec["build"]["env_nohash"] = json!({"MAKEFLAGS": "-j4"});
    let b = BuildSpec::new(&spec).unwrap();
    assert_eq!(a.id, b.id);
  }

  #[test]
  fn profile_metadata_does_not_change_id() {
    let mut spec = minimal_spec();
    let a = BuildSpec::new(&spec).unwrap();
    spec["profile_install"] = json!({"parameters": {"links": []}});
    spec["import_modify_env"] = json!({"PATH": ["bin"]});
    let b = BuildSpec::new(&spec).unwrap();
    assert_eq!(a.id, b.id);
  }

  #[test]
  fn version_defaults_to_n() {
    let spec = json!({"name": "tool", "build": {}});
    let parsed = BuildSpec::new(&spec).unwrap();
    assert_eq!(parsed.version(), "n");
  }

  #[test]
  fn missing_name_is_invalid() {
    let spec = json!({"build": {}});
    assert!(matches!(
      BuildSpec::new(&spec),
      Err(SpecError::MissingField("name"))
    ));
  }

  #[test]
  fn bad_name_is_invalid() {
    let spec = json!({"name": "no/slash", "build": {}});
    assert!(matches!(BuildSpec::new(&spec), Err(SpecError::BadName { .. })));
  }

  #[test]
  fn sources_sort_by_key_and_get_defaults() {
    let spec = json!({
      "name": "x",
      "build": {},
      "sources": [
        {"key": "tar.gz:zzz"},
        {"key": "git:aaa", "target": "src", "strip": 1}
      ]
    });
    let parsed = BuildSpec::new(&spec).unwrap();
    let sources = parsed.sources();
    assert_eq!(sources[0].key, "git:aaa");
    assert_eq!(sources[1].key, "tar.gz:zzz");
    assert_eq!(sources[1].target, ".");
    assert_eq!(sources[1].strip, 0);
  }

  #[test]
  fn source_order_does_not_change_id() {
    let a = BuildSpec::new(&json!({
      "name": "x", "build": {},
      "sources": [{"key": "tar.gz:zzz"}, {"key": "git:aaa"}]
    }))
    .unwrap();
    let b = BuildSpec::new(&json!({
      "name": "x", "build": {},
      "sources": [{"key": "git:aaa"}, {"key": "tar.gz:zzz"}]
    }))
    .unwrap();
    assert_eq!(a.id, b.id);
  }

  #[test]
  fn escaping_source_target_is_rejected() {
    let spec = json!({
      "name": "x", "build": {},
      "sources": [{"key": "tar.gz:abc", "target": "../outside"}]
    });
    assert!(matches!(
      BuildSpec::new(&spec),
      Err(SpecError::TargetEscapes(_))
    ));
  }

  #[test]
  fn first_command_must_be_sandboxed() {
    let spec = json!({
      "name": "x",
      "build": {
        "import": [{"ref": "unix", "id": "virtual:unix"}],
        "commands": [{"cmd": ["/bin/sh", "-c", "true"]}]
      }
    });
    assert!(matches!(
      BuildSpec::new(&spec),
      Err(SpecError::FirstCommandNotSandboxed)
    ));
  }

  #[test]
  fn empty_cmd_is_rejected_on_any_command() {
    // The first command is fine; the second is empty and must not hash.
    let spec = json!({
      "name": "x",
      "build": {
        "import": [{"ref": "unix", "id": "virtual:unix"}],
        "commands": [
          {"cmd": ["${unix}/bin/sh", "-c", "true"]},
          {"cmd": []}
        ]
      }
    });
    assert!(matches!(
      BuildSpec::new(&spec),
      Err(SpecError::BadField { field: "build.commands", .. })
    ));
  }

  #[test]
  fn missing_and_non_string_cmd_entries_are_rejected() {
    let missing = json!({
      "name": "x",
      "build": {"commands": [{"to_var": "OUT"}]}
    });
    assert!(matches!(
      BuildSpec::new(&missing),
      Err(SpecError::BadField { field: "build.commands", .. })
    ));

    let non_string = json!({
      "name": "x",
      "build": {"commands": [{"cmd": ["hit", 42]}]}
    });
    assert!(matches!(
      BuildSpec::new(&non_string),
      Err(SpecError::BadField { field: "build.commands", .. })
    ));
  }

  #[test]
  fn hit_bootstrap_is_allowed_as_first_command() {
    let spec = json!({
      "name": "profile",
      "build": {"commands": [{"cmd": ["hit", "build-profile", "profile.json"]}]}
    });
    assert!(BuildSpec::new(&spec).is_ok());
  }

  #[test]
  fn import_order_does_not_change_id() {
    let a = BuildSpec::new(&json!({
      "name": "x",
      "build": {
        "import": [
          {"ref": "a", "id": "virtual:a"},
          {"ref": "b", "id": "virtual:b"}
        ],
        "commands": [{"cmd": ["${a}/bin/sh"]}]
      }
    }))
    .unwrap();
    let b = BuildSpec::new(&json!({
      "name": "x",
      "build": {
        "import": [
          {"ref": "b", "id": "virtual:b"},
          {"ref": "a", "id": "virtual:a"}
        ],
        "commands": [{"cmd": ["${a}/bin/sh"]}]
      }
    }))
    .unwrap();
    assert_eq!(a.id, b.id);
  }
}
