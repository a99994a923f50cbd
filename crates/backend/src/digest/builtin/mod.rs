//! Local digesters shipped with the daemon.
//!
//! Extraction services (OCR, transcription, crawling) live outside this
//! crate; these units only need the file bytes and earlier records.

use std::collections::HashMap;

use crate::digest::{CascadeTable, DigesterRegistry, RegistryError};

mod doc_to_markdown;
mod file_hash;
mod search_keyword;
mod tags;

pub use doc_to_markdown::DocToMarkdown;
pub use file_hash::{FileHash, hash_file};
pub use search_keyword::SearchKeyword;
pub use tags::Tags;

/// Built-in digesters in dependency order
pub fn default_registry() -> Result<DigesterRegistry, RegistryError> {
  DigesterRegistry::builder()
    .register(FileHash)
    .register(DocToMarkdown)
    .register(Tags::default())
    .register(SearchKeyword::default())
    .build()
}

/// New markdown invalidates everything derived from it
pub fn default_cascades() -> CascadeTable {
  CascadeTable::new().with_rule(DocToMarkdown::NAME, [Tags::NAME, SearchKeyword::NAME])
}

const STOPWORDS: &[&str] = &[
  "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been", "but", "by", "can", "could",
  "did", "do", "does", "for", "from", "had", "has", "have", "he", "her", "his", "how", "if", "in", "into", "is", "it",
  "its", "just", "more", "no", "not", "of", "on", "one", "or", "our", "out", "she", "so", "some", "than", "that", "the",
  "their", "them", "then", "there", "these", "they", "this", "to", "up", "was", "we", "were", "what", "when", "which",
  "who", "will", "with", "would", "you", "your",
];

/// Lowercased word tokens of at least two characters
pub(crate) fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
  text
    .split(|c: char| !c.is_alphanumeric())
    .filter(|w| w.chars().count() >= 2)
    .map(str::to_lowercase)
}

pub(crate) fn is_stopword(word: &str) -> bool {
  STOPWORDS.binary_search(&word).is_ok()
}

/// Terms ranked by frequency, ties broken alphabetically
pub(crate) fn ranked_terms<'a>(tokens: impl Iterator<Item = &'a str>) -> Vec<(String, usize)> {
  let mut counts: HashMap<&str, usize> = HashMap::new();
  for token in tokens {
    *counts.entry(token).or_default() += 1;
  }

  let mut ranked: Vec<(String, usize)> = counts.into_iter().map(|(t, n)| (t.to_string(), n)).collect();
  ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
  ranked
}
