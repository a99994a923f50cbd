use async_trait::async_trait;
use serde_json::json;

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

const DEFAULT_MAX_TERMS: usize = 256;

/// Keyword terms for the search index, derived from the markdown text
pub struct SearchKeyword {
  max_terms: usize,
}

impl SearchKeyword {
  pub const NAME: &'static str = "search-keyword";

  pub fn new(max_terms: usize) -> Self {
    Self { max_terms }
  }
}

impl Default for SearchKeyword {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_TERMS)
  }
}

#[async_trait]
impl Digester for SearchKeyword {
  fn name(&self) -> &str {
    Self::NAME
  }

  fn can_apply(&self, file: &FileDescriptor) -> bool {
    file.is_text()
  }

  async fn produce(&self, _file: &FileDescriptor, records: &DigestRecords) -> Result<Vec<DigestOutput>, DigestError> {
    let source = records.require_completed(Self::NAME, DocToMarkdown::NAME)?;
    let text = source.text().unwrap_or_default();

    let tokens: Vec<String> = tokenize(text).collect();
    let terms: Vec<String> = ranked_terms(tokens.iter().map(String::as_str).filter(|t| !is_stopword(t)))
      .into_iter()
      .take(self.max_terms)
      .map(|(term, _)| term)
      .collect();

    let content = json!({
      "terms": terms,
      "token_count": tokens.len(),
    });
    Ok(vec![DigestOutput::completed(
      Self::NAME,
      Some(DigestContent::Structured(content)),
    )])
  }
}
