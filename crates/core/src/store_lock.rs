//! Store locking.
//!
//! Builders hold the store lock shared for the duration of a build; the
//! garbage collector takes it exclusively, so a sweep never observes a
//! build in flight. The lock is flock(2) on a `.lock` file at the store
//! root: advisory, shared-capable, and released by the kernel when the
//! holding process dies, which is exactly the crash behavior an
//! append-only store wants.
//!
//! An exclusive holder announces itself in a `.lock.holder` sidecar so
//! that a blocked process can say who is in the way. The sidecar is
//! advisory only: it is written atomically, removed on release, and never
//! consulted for correctness.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rustix::fs::{FlockOperation, flock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::fileutil::{silent_unlink, write_atomic};

const LOCK_FILENAME: &str = ".lock";
const HOLDER_FILENAME: &str = ".lock.holder";

/// The exclusive holder's self-description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
  pub pid: u32,
  pub operation: String,
  pub since_unix: u64,
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error(
    "store is busy: '{operation}' is running as pid {pid}; \
     if that process is gone, remove '{lock_path}' and retry"
  )]
  Busy {
    operation: String,
    pid: u32,
    lock_path: PathBuf,
  },

  #[error("store is busy (no holder recorded); retry once '{lock_path}' is released")]
  BusyUnknown { lock_path: PathBuf },

  #[error("{op} '{path}': {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Holds the flock for its lifetime; dropping releases it and clears the
/// holder sidecar if one was written.
pub struct StoreLock {
  _file: File,
  lock_path: PathBuf,
  holder_path: Option<PathBuf>,
}

impl StoreLock {
  /// Shared lock: many builds may hold it at once.
  pub fn shared(store_root: &Path) -> Result<Self, StoreLockError> {
    Self::acquire(store_root, FlockOperation::NonBlockingLockShared, None)
  }

  /// Exclusive lock for operations that must not race builds (GC, bulk
  /// deletion). `operation` is recorded for contention messages.
  pub fn exclusive(store_root: &Path, operation: &str) -> Result<Self, StoreLockError> {
    Self::acquire(
      store_root,
      FlockOperation::NonBlockingLockExclusive,
      Some(operation),
    )
  }

  fn acquire(
    store_root: &Path,
    op: FlockOperation,
    operation: Option<&str>,
  ) -> Result<Self, StoreLockError> {
    std::fs::create_dir_all(store_root).map_err(|source| StoreLockError::Io {
      op: "mkdir",
      path: store_root.to_path_buf(),
      source,
    })?;
    let lock_path = store_root.join(LOCK_FILENAME);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(|source| StoreLockError::Io {
        op: "open",
        path: lock_path.clone(),
        source,
      })?;

    if let Err(errno) = flock(file.as_fd(), op) {
      if errno == rustix::io::Errno::WOULDBLOCK {
        return Err(Self::busy(store_root, &lock_path));
      }
      return Err(StoreLockError::Io {
        op: "flock",
        path: lock_path,
        source: io::Error::from_raw_os_error(errno.raw_os_error()),
      });
    }

    let holder_path = match operation {
      Some(operation) => {
        let path = store_root.join(HOLDER_FILENAME);
        let holder = LockHolder {
          pid: std::process::id(),
          operation: operation.to_string(),
          since_unix: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        };
        let doc = serde_json::to_vec(&holder).expect("holder record serializes");
        write_atomic(&path, &doc).map_err(|source| StoreLockError::Io {
          op: "write",
          path: path.clone(),
          source,
        })?;
        Some(path)
      }
      None => None,
    };

    debug!(
      lock = %lock_path.display(),
      exclusive = holder_path.is_some(),
      "acquired store lock"
    );
    Ok(StoreLock { _file: file, lock_path, holder_path })
  }

  fn busy(store_root: &Path, lock_path: &Path) -> StoreLockError {
    match Self::holder(store_root) {
      Some(holder) => StoreLockError::Busy {
        operation: holder.operation,
        pid: holder.pid,
        lock_path: lock_path.to_path_buf(),
      },
      None => StoreLockError::BusyUnknown {
        lock_path: lock_path.to_path_buf(),
      },
    }
  }

  /// The recorded exclusive holder, if any. Shared holders (builds) leave
  /// no record.
  pub fn holder(store_root: &Path) -> Option<LockHolder> {
    let doc = std::fs::read(store_root.join(HOLDER_FILENAME)).ok()?;
    serde_json::from_slice(&doc).ok()
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

impl Drop for StoreLock {
  fn drop(&mut self) {
    if let Some(path) = &self.holder_path {
      let _ = silent_unlink(path);
    }
  }
}
