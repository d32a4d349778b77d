//! Shared fixtures for store-level tests.
//!
//! `StoreFixture` stands up a full hashdist home in a temp dir and plants a
//! `unix` tool artifact whose `bin/sh` is a symlink to the host shell, so
//! specs can honor the sandboxed-first-command rule without building a
//! bootstrap toolchain.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use serde_json::json;
use tempfile::TempDir;

use crate::build_spec::ArtifactId;
use crate::build_store::{ARTIFACT_JSON, ArtifactMeta, BuildStore, ID_FILENAME};
use crate::config::{StoreContext, init_home};
use crate::hash::{hash_bytes, hash_document};
use crate::source_cache::{SourceCache, SourceKey};

pub struct StoreFixture {
  pub temp: TempDir,
  pub ctx: StoreContext,
  pub store: BuildStore,
  pub cache: SourceCache,
  pub virtuals: BTreeMap<String, ArtifactId>,
}

impl StoreFixture {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let ctx = init_home(&temp.path().join("hashdist")).unwrap();
    let store = BuildStore::open(&ctx).unwrap();
    let cache = SourceCache::open(ctx.source_cache_root()).unwrap();
    let unix_id = plant_tool_artifact(&store, "unix", "host");
    let virtuals = BTreeMap::from([("virtual:unix".to_string(), unix_id)]);
    StoreFixture { temp, ctx, store, cache, virtuals }
  }

  /// Store a small directory snapshot in the source cache and return its
  /// key.
  pub fn put_source_dir(&self, files: &[(&str, &str)]) -> SourceKey {
    let stamp = hash_bytes(format!("{:?}", files).as_bytes());
    let dir = self.temp.path().join(format!("src-{}", &stamp[..8]));
    for (path, contents) in files {
      let full = dir.join(path);
      fs::create_dir_all(full.parent().unwrap()).unwrap();
      fs::write(&full, contents).unwrap();
    }
    self.cache.put_dir(&dir).unwrap()
  }

  /// Read a gzip-compressed text file (such as `build.log.gz`).
  pub fn read_gz(&self, path: &Path) -> String {
    let mut decoder = flate2::read::GzDecoder::new(fs::File::open(path).unwrap());
    let mut out = String::new();
    decoder.read_to_string(&mut out).unwrap();
    out
  }
}

/// Publish a minimal tool artifact providing `bin/sh` (a symlink to the
/// host shell) with `import-modify-env` set, so importing it places its
/// `bin/` on the sandbox PATH.
pub fn plant_tool_artifact(store: &BuildStore, name: &str, version: &str) -> ArtifactId {
  let hash = hash_document("test-tool", &json!({"name": name, "version": version})).unwrap();
  let id = ArtifactId {
    name: name.to_string(),
    version: version.to_string(),
    hash,
  };
  if let Ok(Some(_)) = store.resolve_id(&id) {
    return id;
  }

  let staging = store.build_root().join(format!("plant-{}-{}", name, version));
  fs::create_dir_all(staging.join("bin")).unwrap();
  std::os::unix::fs::symlink("/bin/sh", staging.join("bin/sh")).unwrap();

  let meta = ArtifactMeta {
    id: id.to_string(),
    name: name.to_string(),
    version: version.to_string(),
    import_modify_env: json!({"PATH": ["bin"]}),
    ..ArtifactMeta::default()
  };
  fs::write(
    staging.join(ARTIFACT_JSON),
    serde_json::to_string_pretty(&meta).unwrap(),
  )
  .unwrap();
  fs::write(staging.join(ID_FILENAME), format!("{}\n", id)).unwrap();

  store.publish(&staging, &id).unwrap();
  id
}
