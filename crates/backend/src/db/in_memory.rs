use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
  db::{Result, store::DigestStore},
  domain::digest::{DigestRecord, DigestStatus},
};

type Key = (String, String);

/// In-process digest store for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryStore {
  records: DashMap<Key, DigestRecord>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  /// Every record, sorted by key
  pub fn snapshot(&self) -> Vec<DigestRecord> {
    let mut all: Vec<DigestRecord> = self.records.iter().map(|e| e.value().clone()).collect();
    all.sort_by(|a, b| (&a.path, &a.digester).cmp(&(&b.path, &b.digester)));
    all
  }

  fn collect(&self, predicate: impl Fn(&DigestRecord) -> bool) -> Vec<DigestRecord> {
    self
      .records
      .iter()
      .filter(|e| predicate(e.value()))
      .map(|e| e.value().clone())
      .collect()
  }
}

#[async_trait]
impl DigestStore for MemoryStore {
  async fn get(&self, path: &str, digester: &str) -> Result<Option<DigestRecord>> {
    Ok(
      self
        .records
        .get(&(path.to_string(), digester.to_string()))
        .map(|r| r.value().clone()),
    )
  }

  async fn list(&self, path: &str) -> Result<Vec<DigestRecord>> {
    Ok(self.collect(|r| r.path == path))
  }

  async fn upsert(&self, record: &DigestRecord) -> Result<()> {
    self
      .records
      .insert((record.path.clone(), record.digester.clone()), record.clone());
    Ok(())
  }

  async fn delete_all(&self, path: &str) -> Result<usize> {
    let before = self.records.len();
    self.records.retain(|(p, _), _| p != path);
    Ok(before - self.records.len())
  }

  async fn list_by_status(&self, status: DigestStatus) -> Result<Vec<DigestRecord>> {
    Ok(self.collect(|r| r.status == status))
  }

  async fn list_by_digester(&self, digester: &str) -> Result<Vec<DigestRecord>> {
    Ok(self.collect(|r| r.digester == digester))
  }

  async fn list_paths(&self) -> Result<Vec<String>> {
    let paths: BTreeSet<String> = self.records.iter().map(|e| e.key().0.clone()).collect();
    Ok(paths.into_iter().collect())
  }

  async fn rename_path(&self, from: &str, to: &str) -> Result<usize> {
    let moved = self.collect(|r| r.path == from);
    if moved.is_empty() {
      return Ok(0);
    }

    self.records.retain(|(p, _), _| p != from && p != to);
    for mut record in moved.iter().cloned() {
      record.path = to.to_string();
      self.records.insert((record.path.clone(), record.digester.clone()), record);
    }
    Ok(moved.len())
  }
}
