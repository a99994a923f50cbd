//! The digest pipeline.
//!
//! A [`Digester`] turns a file into one or more named digest records. The
//! [`DigestCoordinator`] runs every registered digester over a path in
//! registry order, under a per-path lock, persisting state transitions as it
//! goes and resetting downstream records through the [`CascadeTable`].

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{
  digest::{DigestOutput, DigestRecord, DigestStatus},
  file::FileDescriptor,
};

pub mod builtin;
mod cascade;
mod coordinator;
mod events;
mod lock;
mod reclaimer;
mod registry;
mod retry;

#[cfg(test)]
mod __tests__;

pub use cascade::CascadeTable;
pub use coordinator::{CoordinatorError, DigestCoordinator, PassSummary, ProcessOptions, ProcessOutcome};
pub use events::DigestEvent;
pub use lock::{FileLockManager, LockError, LockGuard, LockInfo, LockManager, MemoryLockManager};
pub use reclaimer::{ReclaimReport, StaleReclaimer};
pub use registry::{DigesterRegistry, RegistryBuilder, RegistryError};
pub use retry::RetryPolicy;

/// Errors a digester raises from `produce`.
///
/// Every variant is retryable: the coordinator records it as `failed` and
/// tries again on a later pass until the attempt bound is reached.
#[derive(Error, Debug)]
pub enum DigestError {
  #[error("{digester} is waiting on {dependency}")]
  NotReady { digester: String, dependency: String },
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Extraction failed: {0}")]
  Extraction(String),
  #[error("Invalid output: {0}")]
  InvalidOutput(String),
}

impl DigestError {
  pub fn not_ready(digester: &str, dependency: &str) -> Self {
    DigestError::NotReady {
      digester: digester.to_string(),
      dependency: dependency.to_string(),
    }
  }
}

/// A processing unit that may apply to a file and produce digest records.
#[async_trait]
pub trait Digester: Send + Sync {
  /// Unique digester name
  fn name(&self) -> &str;

  /// Record names this digester writes. Defaults to its own name.
  fn output_names(&self) -> Vec<String> {
    vec![self.name().to_string()]
  }

  /// Whether this digester applies to the file.
  ///
  /// Must depend on file type facts only (MIME type, extension, shape), never
  /// on digest state, so a `skipped` outcome stays valid forever.
  fn can_apply(&self, file: &FileDescriptor) -> bool;

  /// Do the work.
  ///
  /// Return one output per declared name, or raise. An unmet dependency must
  /// raise (usually [`DigestError::NotReady`]) so the record stays retryable.
  async fn produce(&self, file: &FileDescriptor, records: &DigestRecords) -> Result<Vec<DigestOutput>, DigestError>;
}

/// Snapshot of every record for one path, read fresh before each digester
#[derive(Debug, Clone, Default)]
pub struct DigestRecords {
  records: HashMap<String, DigestRecord>,
  max_attempts: u32,
}

impl DigestRecords {
  pub fn new(records: Vec<DigestRecord>, max_attempts: u32) -> Self {
    Self {
      records: records.into_iter().map(|r| (r.digester.clone(), r)).collect(),
      max_attempts,
    }
  }

  pub fn get(&self, name: &str) -> Option<&DigestRecord> {
    self.records.get(name)
  }

  pub fn status(&self, name: &str) -> Option<DigestStatus> {
    self.records.get(name).map(|r| r.status)
  }

  /// True when the record exists and will not change without a reset
  pub fn is_terminal(&self, name: &str) -> bool {
    self
      .records
      .get(name)
      .is_some_and(|r| r.is_terminal(self.max_attempts))
  }

  /// The record for `dependency`, or `NotReady` unless it has completed
  pub fn require_completed(&self, requester: &str, dependency: &str) -> Result<&DigestRecord, DigestError> {
    match self.records.get(dependency) {
      Some(record) if record.status == DigestStatus::Completed => Ok(record),
      _ => Err(DigestError::not_ready(requester, dependency)),
    }
  }

  /// Text content of a completed record
  pub fn text(&self, name: &str) -> Option<&str> {
    self
      .records
      .get(name)
      .filter(|r| r.status == DigestStatus::Completed)
      .and_then(DigestRecord::text)
  }

  pub fn max_attempts(&self) -> u32 {
    self.max_attempts
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &DigestRecord> {
    self.records.values()
  }
}
