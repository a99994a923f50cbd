//! Digest records and the values that flow through them.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a single digest record.
///
/// `Completed` and `Skipped` are terminal. `Failed` is terminal only once the
/// attempt bound is reached; below it the record is retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestStatus {
  Todo,
  InProgress,
  Completed,
  Skipped,
  Failed,
}

impl DigestStatus {
  pub const ALL: [DigestStatus; 5] = [
    DigestStatus::Todo,
    DigestStatus::InProgress,
    DigestStatus::Completed,
    DigestStatus::Skipped,
    DigestStatus::Failed,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      DigestStatus::Todo => "todo",
      DigestStatus::InProgress => "in_progress",
      DigestStatus::Completed => "completed",
      DigestStatus::Skipped => "skipped",
      DigestStatus::Failed => "failed",
    }
  }

  /// Whether a cascade from an upstream digester may reset a record in this state.
  ///
  /// Active work (`Todo`, `InProgress`) is never clobbered.
  pub fn is_cascade_resettable(&self) -> bool {
    matches!(
      self,
      DigestStatus::Completed | DigestStatus::Skipped | DigestStatus::Failed
    )
  }
}

impl fmt::Display for DigestStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown digest status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for DigestStatus {
  type Err = ParseStatusError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "todo" => Ok(DigestStatus::Todo),
      "in_progress" => Ok(DigestStatus::InProgress),
      "completed" => Ok(DigestStatus::Completed),
      "skipped" => Ok(DigestStatus::Skipped),
      "failed" => Ok(DigestStatus::Failed),
      other => Err(ParseStatusError(other.to_string())),
    }
  }
}

/// Typed payload of a digest record.
///
/// Persisted as an opaque string plus a kind marker so storage stays
/// schema-agnostic while producers and consumers keep their shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DigestContent {
  /// Plain or markdown text
  Text(String),
  /// Structured payload (tags, metadata, keyword lists)
  Structured(serde_json::Value),
}

impl DigestContent {
  pub fn text(value: impl Into<String>) -> Self {
    DigestContent::Text(value.into())
  }

  /// Storage marker written next to the encoded payload.
  pub fn kind(&self) -> &'static str {
    match self {
      DigestContent::Text(_) => "text",
      DigestContent::Structured(_) => "json",
    }
  }

  /// Encode into the opaque string stored in the `content` column.
  pub fn encode(&self) -> String {
    match self {
      DigestContent::Text(text) => text.clone(),
      DigestContent::Structured(value) => value.to_string(),
    }
  }

  /// Decode a stored payload. Unknown or missing kinds are treated as text.
  pub fn decode(kind: Option<&str>, raw: &str) -> Result<Self, serde_json::Error> {
    match kind {
      Some("json") => Ok(DigestContent::Structured(serde_json::from_str(raw)?)),
      _ => Ok(DigestContent::Text(raw.to_string())),
    }
  }

  pub fn as_text(&self) -> Option<&str> {
    match self {
      DigestContent::Text(text) => Some(text),
      DigestContent::Structured(_) => None,
    }
  }

  pub fn as_structured(&self) -> Option<&serde_json::Value> {
    match self {
      DigestContent::Structured(value) => Some(value),
      DigestContent::Text(_) => None,
    }
  }
}

/// One unit of pipeline state, keyed by `(path, digester)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestRecord {
  /// Library-relative path of the source file
  pub path: String,
  /// Output name of the producing digester
  pub digester: String,
  pub status: DigestStatus,
  pub content: Option<DigestContent>,
  /// Key of an out-of-band blob owned by this record
  pub binary_ref: Option<String>,
  /// Set only while `status == Failed`
  pub error: Option<String>,
  pub attempts: u32,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl DigestRecord {
  /// A fresh `todo` record with no attempts.
  pub fn new(path: impl Into<String>, digester: impl Into<String>) -> Self {
    let now = Utc::now();
    Self {
      path: path.into(),
      digester: digester.into(),
      status: DigestStatus::Todo,
      content: None,
      binary_ref: None,
      error: None,
      attempts: 0,
      created_at: now,
      updated_at: now,
    }
  }

  /// Eligible for (re)processing under the given attempt bound.
  pub fn is_pending(&self, max_attempts: u32) -> bool {
    match self.status {
      DigestStatus::Todo => true,
      DigestStatus::Failed => self.attempts < max_attempts,
      _ => false,
    }
  }

  /// No further automatic mutation will happen.
  pub fn is_terminal(&self, max_attempts: u32) -> bool {
    match self.status {
      DigestStatus::Completed | DigestStatus::Skipped => true,
      DigestStatus::Failed => self.attempts >= max_attempts,
      DigestStatus::Todo | DigestStatus::InProgress => false,
    }
  }

  /// Clear back to `todo`, zeroing attempts and payloads.
  ///
  /// Returns the blob key the record owned, if any, so the caller can delete it.
  pub fn reset(&mut self) -> Option<String> {
    self.status = DigestStatus::Todo;
    self.attempts = 0;
    self.content = None;
    self.error = None;
    self.updated_at = Utc::now();
    self.binary_ref.take()
  }

  pub fn text(&self) -> Option<&str> {
    self.content.as_ref().and_then(DigestContent::as_text)
  }
}

/// Status a digester may report for one of its outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStatus {
  Completed,
  Skipped,
}

/// A single output unit returned by `Digester::produce`.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestOutput {
  pub name: String,
  pub status: OutputStatus,
  pub content: Option<DigestContent>,
  pub binary: Option<BinaryPayload>,
}

impl DigestOutput {
  pub fn completed(name: impl Into<String>, content: Option<DigestContent>) -> Self {
    Self {
      name: name.into(),
      status: OutputStatus::Completed,
      content,
      binary: None,
    }
  }

  pub fn skipped(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      status: OutputStatus::Skipped,
      content: None,
      binary: None,
    }
  }

  pub fn with_binary(mut self, binary: BinaryPayload) -> Self {
    self.binary = Some(binary);
    self
  }
}

/// Raw bytes destined for the blob store (e.g. a rendered screenshot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryPayload {
  pub bytes: Vec<u8>,
  /// File extension used for the stored blob, without the dot
  pub extension: String,
}
