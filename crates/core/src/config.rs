//! Configuration loading and the store context.
//!
//! What used to be a module-scope `~/.hashdist/...` convention is an
//! explicit [`StoreContext`] threaded into every operation: store root,
//! source-cache root, GC-roots directory, transient cache. The context is
//! built from `config.yaml`, whose location comes from `HDIST_CONFIG` or
//! defaults to `~/.hashdist/config.yaml`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Environment variable overriding the config file location. This is the
/// only variable the core consumes; everything else is scrubbed inside the
/// build sandbox.
pub const CONFIG_ENV_VAR: &str = "HDIST_CONFIG";

const DEFAULT_HOME_DIR: &str = ".hashdist";
const CONFIG_FILENAME: &str = "config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// Unknown keys are rejected, so a typo never silently falls back to a
  /// default path.
  #[error("failed to parse config file '{path}': {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("config declares no build store")]
  NoBuildStore,

  #[error("config declares no source cache")]
  NoSourceCache,

  #[error("HOME is not set and no config path was given")]
  NoHome,

  #[error("failed to create directory '{path}': {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write '{path}': {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Parsed `config.yaml`. Only the first build store and source cache are
/// written to; the rest are read-only lookup locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  pub build_stores: Vec<PathBuf>,
  pub source_caches: Vec<PathBuf>,
  pub gc_roots: PathBuf,
  pub cache: PathBuf,
}

impl Config {
  /// Load a config file, expanding `~` in every path.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let mut config: Config =
      serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
      })?;
    for p in config
      .build_stores
      .iter_mut()
      .chain(config.source_caches.iter_mut())
    {
      *p = expand_tilde(p)?;
    }
    config.gc_roots = expand_tilde(&config.gc_roots)?;
    config.cache = expand_tilde(&config.cache)?;
    config.validate()?;
    Ok(config)
  }

  /// Resolve the config path: `HDIST_CONFIG` if set, the default home
  /// location otherwise.
  pub fn default_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
      return Ok(PathBuf::from(path));
    }
    Ok(home_dir()?.join(DEFAULT_HOME_DIR).join(CONFIG_FILENAME))
  }

  /// The default layout under a hashdist home directory.
  pub fn default_for_home(home: &Path) -> Self {
    Config {
      build_stores: vec![home.join("store")],
      source_caches: vec![home.join("source")],
      gc_roots: home.join("gcroots"),
      cache: home.join("cache"),
    }
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if self.build_stores.is_empty() {
      return Err(ConfigError::NoBuildStore);
    }
    if self.source_caches.is_empty() {
      return Err(ConfigError::NoSourceCache);
    }
    Ok(())
  }
}

/// Resolved paths for one store universe.
///
/// The store root holds `opt/` (published artifacts) and `bld/` (staging);
/// both must live on the same filesystem so publication stays a single
/// `rename`.
#[derive(Debug, Clone)]
pub struct StoreContext {
  config: Config,
}

impl StoreContext {
  pub fn new(config: Config) -> Result<Self, ConfigError> {
    config.validate()?;
    Ok(Self { config })
  }

  /// Load from the default (or `HDIST_CONFIG`-overridden) config file.
  pub fn from_default_config() -> Result<Self, ConfigError> {
    let path = Config::default_path()?;
    Ok(Self { config: Config::load(&path)? })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// The writable store root (first entry of `build_stores`).
  pub fn store_root(&self) -> &Path {
    &self.config.build_stores[0]
  }

  /// Published artifacts live here, under `<name>/<version>/<short-hash>`.
  pub fn artifact_root(&self) -> PathBuf {
    self.store_root().join("opt")
  }

  /// Staging area for in-progress builds.
  pub fn build_root(&self) -> PathBuf {
    self.store_root().join("bld")
  }

  /// The writable source cache (first entry of `source_caches`).
  pub fn source_cache_root(&self) -> &Path {
    &self.config.source_caches[0]
  }

  pub fn gc_roots_dir(&self) -> &Path {
    &self.config.gc_roots
  }

  pub fn cache_dir(&self) -> &Path {
    &self.config.cache
  }
}

/// Create the directory skeleton for a hashdist home and write a default
/// `config.yaml` if none exists. Returns the resulting context.
pub fn init_home(home: &Path) -> Result<StoreContext, ConfigError> {
  let config = Config::default_for_home(home);
  let dirs = [
    home.to_path_buf(),
    config.build_stores[0].join("opt"),
    config.build_stores[0].join("bld"),
    config.source_caches[0].clone(),
    config.gc_roots.clone(),
    config.cache.clone(),
  ];
  for dir in &dirs {
    fs::create_dir_all(dir).map_err(|source| ConfigError::CreateDir {
      path: dir.clone(),
      source,
    })?;
  }
  let config_path = home.join(CONFIG_FILENAME);
  if !config_path.exists() {
    let yaml = serde_yaml::to_string(&config).expect("config serialization is infallible");
    fs::write(&config_path, yaml).map_err(|source| ConfigError::Write {
      path: config_path.clone(),
      source,
    })?;
    info!(path = %config_path.display(), "wrote default config");
  }
  info!(home = %home.display(), "initialized hashdist home");
  StoreContext::new(config)
}

fn home_dir() -> Result<PathBuf, ConfigError> {
  std::env::var("HOME")
    .map(PathBuf::from)
    .map_err(|_| ConfigError::NoHome)
}

fn expand_tilde(path: &Path) -> Result<PathBuf, ConfigError> {
  if let Ok(rest) = path.strip_prefix("~") {
    Ok(home_dir()?.join(rest))
  } else {
    Ok(path.to_path_buf())
  }
}
