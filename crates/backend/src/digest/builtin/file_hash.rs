use std::path::Path;

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::{
  digest::{DigestError, DigestRecords, Digester},
  domain::{
    digest::{DigestContent, DigestOutput},
    file::FileDescriptor,
  },
};

/// Content fingerprint of every file, used for change detection
pub struct FileHash;

impl FileHash {
  pub const NAME: &'static str = "file-hash";
}

#[async_trait]
impl Digester for FileHash {
  fn name(&self) -> &str {
    Self::NAME
  }

  fn can_apply(&self, _file: &FileDescriptor) -> bool {
    true
  }

  async fn produce(&self, file: &FileDescriptor, _records: &DigestRecords) -> Result<Vec<DigestOutput>, DigestError> {
    let sha256 = hash_file(&file.location).await?;
    let content = json!({
      "sha256": sha256,
      "size": file.size,
      "modified_at": file.modified_at.timestamp_millis(),
    });
    Ok(vec![DigestOutput::completed(
      Self::NAME,
      Some(DigestContent::Structured(content)),
    )])
  }
}

/// Hex SHA-256 of a file, streamed in chunks
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
  let mut file = tokio::fs::File::open(path).await?;
  let mut hasher = Sha256::new();
  let mut buf = vec![0u8; 64 * 1024];
  loop {
    let n = file.read(&mut buf).await?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
  }
  Ok(hex::encode(hasher.finalize()))
}
