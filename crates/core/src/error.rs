//! Top-level error type and exit-code mapping.
//!
//! Every subsystem keeps its own error enum; this aggregate exists for
//! callers (the `hit` tool foremost) that need one type and the process
//! exit-code convention: 0 success, 1 build failure, 2 usage error, 3
//! store I/O error, 4 integrity failure.

use thiserror::Error;

use crate::build_spec::SpecError;
use crate::build_store::{BuildError, StoreError};
use crate::config::ConfigError;
use crate::gc::GcError;
use crate::glob::GlobError;
use crate::hash::HashError;
use crate::links::LinkError;
use crate::profile::ProfileError;
use crate::run_job::JobError;
use crate::source_cache::SourceError;
use crate::store_lock::StoreLockError;
use crate::tools::ToolsError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error(transparent)]
  Spec(#[from] SpecError),

  #[error(transparent)]
  Source(#[from] SourceError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error(transparent)]
  Job(#[from] JobError),

  #[error(transparent)]
  Profile(#[from] ProfileError),

  #[error(transparent)]
  Gc(#[from] GcError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error(transparent)]
  Link(#[from] LinkError),

  #[error(transparent)]
  Glob(#[from] GlobError),

  #[error(transparent)]
  Tools(#[from] ToolsError),
}

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_BUILD_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_STORE_IO: i32 = 3;
pub const EXIT_INTEGRITY: i32 = 4;

impl Error {
  pub fn exit_code(&self) -> i32 {
    match self {
      Error::Build(e) => build_exit_code(e),
      Error::Job(e) => job_exit_code(e),
      Error::Store(e) => store_exit_code(e),
      Error::Source(e) => source_exit_code(e),
      Error::Profile(e) => profile_exit_code(e),
      Error::Gc(GcError::Store(e)) => store_exit_code(e),
      Error::Gc(GcError::Source(e)) => source_exit_code(e),
      Error::Gc(_) => EXIT_STORE_IO,
      Error::Lock(_) => EXIT_STORE_IO,
      Error::Config(_) | Error::Spec(_) | Error::Hash(_) | Error::Glob(_) => EXIT_USAGE,
      Error::Link(LinkError::Conflict { .. }) => EXIT_INTEGRITY,
      Error::Link(_) => EXIT_USAGE,
      Error::Tools(_) => EXIT_STORE_IO,
    }
  }
}

fn build_exit_code(e: &BuildError) -> i32 {
  match e {
    BuildError::BuildFailed { .. } => EXIT_BUILD_FAILURE,
    BuildError::Spec(_) | BuildError::BadFiles(_) => EXIT_USAGE,
    BuildError::Store(e) => store_exit_code(e),
    BuildError::Source(e) => source_exit_code(e),
    BuildError::Lock(_) => EXIT_STORE_IO,
  }
}

fn job_exit_code(e: &JobError) -> i32 {
  match e {
    JobError::CommandFailed { .. } | JobError::Timeout { .. } | JobError::Spawn { .. } => {
      EXIT_BUILD_FAILURE
    }
    JobError::Store(e) => store_exit_code(e),
    JobError::Io { .. } => EXIT_STORE_IO,
    _ => EXIT_USAGE,
  }
}

fn store_exit_code(e: &StoreError) -> i32 {
  match e {
    StoreError::Integrity { .. } => EXIT_INTEGRITY,
    StoreError::Io { .. } => EXIT_STORE_IO,
  }
}

fn source_exit_code(e: &SourceError) -> i32 {
  match e {
    SourceError::Corrupt { .. } => EXIT_INTEGRITY,
    SourceError::Io { .. } | SourceError::Fetch { .. } | SourceError::Git(_) => EXIT_STORE_IO,
    _ => EXIT_USAGE,
  }
}

fn profile_exit_code(e: &ProfileError) -> i32 {
  match e {
    ProfileError::EnvConflict { .. } | ProfileError::Link(LinkError::Conflict { .. }) => {
      EXIT_INTEGRITY
    }
    ProfileError::Store(e) => store_exit_code(e),
    ProfileError::Io { .. } => EXIT_STORE_IO,
    _ => EXIT_USAGE,
  }
}
