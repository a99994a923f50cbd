// Out-of-band binary payloads referenced by `DigestRecord::binary_ref`

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
  db::{DbError, Result},
  domain::digest::BinaryPayload,
};

#[derive(Debug, Clone)]
pub struct BlobStore {
  root: PathBuf,
}

impl BlobStore {
  /// Blob store under `<data_dir>/blobs`
  pub fn open(data_dir: &Path) -> Self {
    Self::at(data_dir.join("blobs"))
  }

  pub fn at(root: PathBuf) -> Self {
    Self { root }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Fresh key for a record's blob: `<hash16>/<digester>-<uuid>.<ext>`
  ///
  /// Every write gets its own key, so a blob belongs to exactly one record
  /// even after that record is renamed to another path.
  pub fn new_key(path: &str, digester: &str, extension: &str) -> String {
    let digest = hex::encode(Sha256::digest(path.as_bytes()));
    let id = uuid::Uuid::new_v4().simple();
    let extension = extension.trim_start_matches('.');
    if extension.is_empty() {
      format!("{}/{}-{}", &digest[..16], digester, id)
    } else {
      format!("{}/{}-{}.{}", &digest[..16], digester, id, extension)
    }
  }

  /// Write a payload for `(path, digester)` and return its key
  pub async fn put(&self, path: &str, digester: &str, payload: &BinaryPayload) -> Result<String> {
    let key = Self::new_key(path, digester, &payload.extension);
    let target = self.resolve(&key)?;
    if let Some(parent) = target.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }

    // Write aside then rename so readers never see a partial blob
    let tmp = target.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, &payload.bytes).await?;
    tokio::fs::rename(&tmp, &target).await?;

    debug!(key = %key, bytes = payload.bytes.len(), "Stored blob");
    Ok(key)
  }

  pub async fn read(&self, key: &str) -> Result<Vec<u8>> {
    let target = self.resolve(key)?;
    match tokio::fs::read(&target).await {
      Ok(bytes) => Ok(bytes),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DbError::NotFound(format!("blob {}", key))),
      Err(e) => Err(e.into()),
    }
  }

  /// Delete a blob. Missing blobs are not an error.
  pub async fn delete(&self, key: &str) -> Result<()> {
    let target = self.resolve(key)?;
    match tokio::fs::remove_file(&target).await {
      Ok(()) => {
        debug!(key = %key, "Deleted blob");
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => return Err(e.into()),
    }

    // Drop the per-path directory once it is empty
    if let Some(parent) = target.parent()
      && parent != self.root
      && let Err(e) = tokio::fs::remove_dir(parent).await
      && e.kind() != std::io::ErrorKind::NotFound
      && e.kind() != std::io::ErrorKind::DirectoryNotEmpty
    {
      warn!(dir = %parent.display(), err = %e, "Failed to remove blob directory");
    }
    Ok(())
  }

  pub async fn exists(&self, key: &str) -> bool {
    match self.resolve(key) {
      Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
      Err(_) => false,
    }
  }

  fn resolve(&self, key: &str) -> Result<PathBuf> {
    let relative = Path::new(key);
    let safe = !key.is_empty() && relative.components().all(|c| matches!(c, Component::Normal(_)));
    if !safe {
      return Err(DbError::InvalidInput(format!("invalid blob key: {}", key)));
    }
    Ok(self.root.join(relative))
  }
}
