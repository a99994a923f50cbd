use std::collections::HashMap;

use tracing::{debug, warn};

use crate::db::{BlobStore, DigestStore, Result};

/// Upstream output name -> downstream records invalidated when it produces content
#[derive(Debug, Clone, Default)]
pub struct CascadeTable {
  rules: HashMap<String, Vec<String>>,
}

impl CascadeTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_rule<I, S>(mut self, upstream: &str, downstream: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self
      .rules
      .entry(upstream.to_string())
      .or_default()
      .extend(downstream.into_iter().map(Into::into));
    self
  }

  pub fn downstream(&self, upstream: &str) -> &[String] {
    self.rules.get(upstream).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  /// Reset downstream records of `upstream` for `path`.
  ///
  /// Only `completed`, `skipped` and `failed` records are reset; `todo` and
  /// `in_progress` records are left alone. Owned blobs are deleted.
  /// Returns the names that were reset.
  pub async fn apply(&self, store: &dyn DigestStore, blobs: &BlobStore, path: &str, upstream: &str) -> Result<Vec<String>> {
    let mut reset = Vec::new();

    for name in self.downstream(upstream) {
      let Some(mut record) = store.get(path, name).await? else {
        continue;
      };
      if !record.status.is_cascade_resettable() {
        debug!(path = %path, upstream = %upstream, digester = %name, status = %record.status, "Cascade leaves active record");
        continue;
      }

      let blob = record.reset();
      store.upsert(&record).await?;
      if let Some(key) = blob
        && let Err(e) = blobs.delete(&key).await
      {
        warn!(path = %path, digester = %name, key = %key, err = %e, "Failed to delete blob on cascade");
      }

      debug!(path = %path, upstream = %upstream, digester = %name, "Cascade reset");
      reset.push(name.clone());
    }

    Ok(reset)
  }
}
