//! hdist-core: a content-addressed build cache and profile composer.
//!
//! Every artifact is identified by a hash of its entire build
//! specification: sources, commands, environment and the hashes of all
//! transitively imported artifacts. Identical specs resolve instantly to
//! cached artifacts; any change rebuilds only what it affects. There is no
//! imperative install state to mutate, so "uninstall" is removing an entry
//! from the spec and rebuilding.
//!
//! The crate is organized around four subsystems:
//!
//! - [`source_cache`] fetches and stores tarballs, git commits, files and
//!   directory snapshots under content-addressed keys, verifying them on
//!   every unpack.
//! - [`build_store`] canonicalizes build specs ([`build_spec`]), stages
//!   hermetic builds ([`run_job`]) and publishes artifacts atomically.
//! - [`profile`] composes sets of artifacts into Unix-style prefix
//!   directories via a small link/copy DSL ([`links`], [`glob`]).
//! - [`gc`] tracks named roots and removes everything outside their
//!   transitive closure.
//!
//! All operations are synchronous and take their paths from an explicit
//! [`config::StoreContext`]; concurrency across processes is coordinated
//! purely through the filesystem (atomic renames, `mkdir` exclusivity and
//! the flock-based [`store_lock`]).

pub mod build_spec;
pub mod build_store;
pub mod config;
pub mod error;
pub mod fileutil;
pub mod gc;
pub mod glob;
pub mod hash;
pub mod links;
pub mod profile;
pub mod run_job;
pub mod source_cache;
pub mod store_lock;
pub mod tools;

#[cfg(test)]
mod test_support;

pub use build_spec::{ArtifactId, BuildSpec};
pub use build_store::{ArtifactMeta, BuildStore, KeepBuild};
pub use config::{Config, StoreContext, init_home};
pub use error::{Error, Result};
pub use gc::{GcRoots, Retention, RetentionPolicy, collect_garbage};
pub use profile::{assemble_into, make_profile, profile_build_spec};
pub use source_cache::{RetentionTag, SourceCache, SourceKey, SourceScheme};
