use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::{
  db::Result,
  domain::digest::{DigestRecord, DigestStatus},
};

/// Persistence for digest records.
///
/// Each operation is atomic per record and a caller always reads its own
/// writes. Cross-caller mutual exclusion is not provided here; the path lock
/// serializes writers of one path.
#[async_trait]
pub trait DigestStore: Send + Sync {
  async fn get(&self, path: &str, digester: &str) -> Result<Option<DigestRecord>>;

  /// All records for a path, in no particular order
  async fn list(&self, path: &str) -> Result<Vec<DigestRecord>>;

  /// Insert or replace the record keyed by `(record.path, record.digester)`
  async fn upsert(&self, record: &DigestRecord) -> Result<()>;

  /// Delete every record for a path, returning how many were removed
  async fn delete_all(&self, path: &str) -> Result<usize>;

  async fn list_by_status(&self, status: DigestStatus) -> Result<Vec<DigestRecord>>;

  async fn list_by_digester(&self, digester: &str) -> Result<Vec<DigestRecord>>;

  /// Distinct paths that have at least one record
  async fn list_paths(&self) -> Result<Vec<String>>;

  /// Re-key every record of `from` to `to`, returning how many moved
  async fn rename_path(&self, from: &str, to: &str) -> Result<usize>;

  async fn status_counts(&self) -> Result<StatusCounts> {
    let mut counts = StatusCounts::default();
    for status in DigestStatus::ALL {
      let n = self.list_by_status(status).await?.len();
      counts.by_status.insert(status.as_str().to_string(), n);
      counts.total += n;
    }
    counts.paths = self.list_paths().await?.len();
    Ok(counts)
  }
}

/// Record counts across the whole store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
  pub total: usize,
  pub paths: usize,
  pub by_status: BTreeMap<String, usize>,
}

impl StatusCounts {
  pub fn get(&self, status: DigestStatus) -> usize {
    self.by_status.get(status.as_str()).copied().unwrap_or(0)
  }
}
