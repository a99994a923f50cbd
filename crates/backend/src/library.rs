//! Library scanning and change detection.
//!
//! A scan walks the library root, runs a digest pass over every file and
//! removes records for files that disappeared. Files whose content changed
//! since their `file-hash` digest get a full reset first.

use std::{
  collections::HashSet,
  path::{Component, Path, PathBuf},
  sync::Arc,
  time::Instant,
};

use ignore::WalkBuilder;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{
  db::{DbError, DigestStore},
  digest::{
    CoordinatorError, DigestCoordinator, ProcessOptions, ProcessOutcome,
    builtin::{FileHash, hash_file},
  },
  domain::{config::LibraryConfig, digest::DigestStatus, file::FileDescriptor},
};

#[derive(Error, Debug)]
pub enum LibraryError {
  #[error("Store error: {0}")]
  Store(#[from] DbError),
  #[error("Coordinator error: {0}")]
  Coordinator(#[from] CoordinatorError),
  #[error("Library walk failed: {0}")]
  Walk(String),
}

pub type Result<T> = std::result::Result<T, LibraryError>;

/// What a scan did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
  /// Files found on disk
  pub files: usize,
  /// Files whose content changed and were reset before processing
  pub changed: usize,
  /// Files whose pass wrote something
  pub processed: usize,
  /// Files skipped because another pass held the lock
  pub busy: usize,
  /// Paths whose records were removed because the file is gone
  pub removed: usize,
  /// Files whose pass returned an infrastructure error
  pub errors: usize,
  pub elapsed_ms: u64,
}

/// The directory tree whose files are digested
#[derive(Debug, Clone)]
pub struct Library {
  root: PathBuf,
  max_file_size: u64,
  include_hidden: bool,
}

impl Library {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    let defaults = LibraryConfig::default();
    Self {
      root: root.into(),
      max_file_size: defaults.max_file_size,
      include_hidden: defaults.include_hidden,
    }
  }

  /// `None` when no root is configured
  pub fn from_config(config: &LibraryConfig) -> Option<Self> {
    let root = config.root.clone()?;
    Some(Self {
      root,
      max_file_size: config.max_file_size,
      include_hidden: config.include_hidden,
    })
  }

  pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
    self.max_file_size = max_file_size;
    self
  }

  pub fn with_hidden(mut self, include_hidden: bool) -> Self {
    self.include_hidden = include_hidden;
    self
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Relative keys of every eligible file, sorted.
  ///
  /// Honors `.gitignore` files inside the library even when it is not a git
  /// repository. Unreadable entries are logged and skipped.
  pub fn walk(&self) -> Vec<String> {
    let walker = WalkBuilder::new(&self.root)
      .hidden(!self.include_hidden)
      .git_ignore(true)
      .git_global(false)
      .git_exclude(true)
      .require_git(false)
      .max_filesize(Some(self.max_file_size))
      .build();

    let mut keys = Vec::new();
    for entry in walker {
      let entry = match entry {
        Ok(entry) => entry,
        Err(e) => {
          warn!(err = %e, "Skipping unreadable library entry");
          continue;
        }
      };
      if !entry.file_type().is_some_and(|t| t.is_file()) {
        continue;
      }
      if let Some(key) = relative_key(&self.root, entry.path()) {
        keys.push(key);
      }
    }
    keys.sort();
    keys
  }

  /// Whether `file` differs from what its digests were computed from.
  ///
  /// With a completed `file-hash` fingerprint, size and mtime are compared
  /// first and the SHA-256 is only recomputed when either moved. Without one
  /// (never hashed, or hashing failed) the file counts as changed when it was
  /// modified after the newest completed digest. Files with no completed
  /// digests need no reset.
  pub async fn has_changed(&self, store: &dyn DigestStore, file: &FileDescriptor) -> Result<bool> {
    let records = store.list(&file.path).await?;
    let fingerprint = records
      .iter()
      .find(|r| r.digester == FileHash::NAME && r.status == DigestStatus::Completed)
      .and_then(|r| r.content.as_ref())
      .and_then(|c| c.as_structured());

    let Some(fingerprint) = fingerprint else {
      let newest = records
        .iter()
        .filter(|r| r.status == DigestStatus::Completed)
        .map(|r| r.updated_at)
        .max();
      return Ok(newest.is_some_and(|at| file.modified_at > at));
    };

    let size = fingerprint.get("size").and_then(|v| v.as_u64());
    let modified_at = fingerprint.get("modified_at").and_then(|v| v.as_i64());
    if size == Some(file.size) && modified_at == Some(file.modified_at.timestamp_millis()) {
      return Ok(false);
    }

    let Some(recorded) = fingerprint.get("sha256").and_then(|v| v.as_str()) else {
      return Ok(true);
    };
    match hash_file(&file.location).await {
      Ok(current) => Ok(current != recorded),
      Err(e) => {
        debug!(path = %file.path, err = %e, "Could not hash file, treating as changed");
        Ok(true)
      }
    }
  }

  /// Digest every file under the root and drop records of vanished files
  pub async fn scan(&self, coordinator: &DigestCoordinator, concurrency: usize) -> Result<ScanReport> {
    let start = Instant::now();
    let library = self.clone();
    let keys = tokio::task::spawn_blocking(move || library.walk())
      .await
      .map_err(|e| LibraryError::Walk(e.to_string()))?;

    let mut report = ScanReport {
      files: keys.len(),
      ..Default::default()
    };
    debug!(root = %self.root.display(), files = keys.len(), "Scanning library");

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let passes = keys.iter().map(|key| {
      let permit = semaphore.clone();
      async move {
        let _permit = permit.acquire().await.ok();
        self.scan_one(coordinator, key).await
      }
    });

    for result in futures::future::join_all(passes).await {
      match result {
        Ok(FileScan { changed, outcome }) => {
          if changed {
            report.changed += 1;
          }
          match outcome {
            ProcessOutcome::Busy => report.busy += 1,
            ProcessOutcome::Processed(summary) if !summary.is_noop() => report.processed += 1,
            ProcessOutcome::Removed(_) => report.removed += 1,
            _ => {}
          }
        }
        Err(e) => {
          warn!(err = %e, "Scan pass failed");
          report.errors += 1;
        }
      }
    }

    let on_disk: HashSet<&str> = keys.iter().map(String::as_str).collect();
    for path in coordinator.store().list_paths().await? {
      if on_disk.contains(path.as_str()) || self.root.join(&path).is_file() {
        continue;
      }
      match coordinator.remove_file(&path).await {
        Ok(ProcessOutcome::Busy) => report.busy += 1,
        Ok(_) => report.removed += 1,
        Err(e) => {
          warn!(path = %path, err = %e, "Failed to remove digests of vanished file");
          report.errors += 1;
        }
      }
    }

    report.elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
      files = report.files,
      changed = report.changed,
      processed = report.processed,
      removed = report.removed,
      busy = report.busy,
      errors = report.errors,
      elapsed_ms = report.elapsed_ms,
      "Library scan complete"
    );
    Ok(report)
  }

  async fn scan_one(&self, coordinator: &DigestCoordinator, key: &str) -> Result<FileScan> {
    let file = match FileDescriptor::from_path(&self.root, key) {
      Ok(file) => file,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        let outcome = coordinator.remove_file(key).await?;
        return Ok(FileScan { changed: false, outcome });
      }
      Err(e) => return Err(CoordinatorError::File(e).into()),
    };

    let changed = self.has_changed(coordinator.store().as_ref(), &file).await?;
    let options = if changed {
      debug!(path = %key, "Content changed, resetting digests");
      ProcessOptions::reset()
    } else {
      ProcessOptions::default()
    };
    let outcome = coordinator.process_file(&file, options).await?;
    Ok(FileScan { changed, outcome })
  }
}

struct FileScan {
  changed: bool,
  outcome: ProcessOutcome,
}

/// `/`-separated key of `path` under `root`
fn relative_key(root: &Path, path: &Path) -> Option<String> {
  let relative = path.strip_prefix(root).ok()?;
  let mut parts = Vec::new();
  for component in relative.components() {
    match component {
      Component::Normal(part) => parts.push(part.to_str()?.to_string()),
      _ => return None,
    }
  }
  if parts.is_empty() {
    return None;
  }
  Some(parts.join("/"))
}
