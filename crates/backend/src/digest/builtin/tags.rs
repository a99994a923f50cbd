use async_trait::async_trait;
use serde_json::Value;

use crate::{
  digest::{
    DigestError, DigestRecords, Digester,
    builtin::{DocToMarkdown, is_stopword, ranked_terms, tokenize},
  },
  domain::{
    digest::{DigestContent, DigestOutput},
    file::FileDescriptor,
  },
};

const DEFAULT_LIMIT: usize = 10;

/// Most frequent terms across the text produced by source digesters
pub struct Tags {
  sources: Vec<String>,
  limit: usize,
}

impl Tags {
  pub const NAME: &'static str = "tags";

  pub fn new(sources: Vec<String>, limit: usize) -> Self {
    Self { sources, limit }
  }
}

impl Default for Tags {
  fn default() -> Self {
    Self::new(vec![DocToMarkdown::NAME.to_string()], DEFAULT_LIMIT)
  }
}

#[async_trait]
impl Digester for Tags {
  fn name(&self) -> &str {
    Self::NAME
  }

  fn can_apply(&self, file: &FileDescriptor) -> bool {
    file.is_text()
  }

  async fn produce(&self, _file: &FileDescriptor, records: &DigestRecords) -> Result<Vec<DigestOutput>, DigestError> {
    // Wait for every source to settle so tags reflect all available text
    if let Some(source) = self.sources.iter().find(|s| !records.is_terminal(s)) {
      return Err(DigestError::not_ready(Self::NAME, source));
    }

    let text: Vec<&str> = self.sources.iter().filter_map(|s| records.text(s)).collect();
    if text.iter().all(|t| t.trim().is_empty()) {
      return Ok(vec![DigestOutput::skipped(Self::NAME)]);
    }

    let tokens: Vec<String> = text.iter().copied().flat_map(tokenize).collect();
    let tags: Vec<Value> = ranked_terms(
      tokens
        .iter()
        .map(String::as_str)
        .filter(|t| !is_stopword(t) && !t.chars().all(|c| c.is_ascii_digit())),
    )
    .into_iter()
    .take(self.limit)
    .map(|(term, _)| Value::String(term))
    .collect();

    Ok(vec![DigestOutput::completed(
      Self::NAME,
      Some(DigestContent::Structured(Value::Array(tags))),
    )])
  }
}
