use async_trait::async_trait;

use crate::{
  digest::{DigestError, DigestRecords, Digester},
  domain::{
    digest::{DigestContent, DigestOutput},
    file::FileDescriptor,
  },
};

/// Normalised UTF-8 text of text-like documents
pub struct DocToMarkdown;

impl DocToMarkdown {
  pub const NAME: &'static str = "doc-to-markdown";
}

#[async_trait]
impl Digester for DocToMarkdown {
  fn name(&self) -> &str {
    Self::NAME
  }

  fn can_apply(&self, file: &FileDescriptor) -> bool {
    file.is_text()
  }

  async fn produce(&self, file: &FileDescriptor, _records: &DigestRecords) -> Result<Vec<DigestOutput>, DigestError> {
    let bytes = tokio::fs::read(&file.location).await?;
    let raw = String::from_utf8(bytes)
      .map_err(|e| DigestError::Extraction(format!("{} is not valid UTF-8: {}", file.path, e.utf8_error())))?;

    let is_html = matches!(file.extension.as_deref(), Some("html" | "htm")) || file.mime_type == "text/html";
    let text = if is_html { strip_html(&raw) } else { raw };
    let text = normalize(&text);

    let content = (!text.is_empty()).then(|| DigestContent::Text(text));
    Ok(vec![DigestOutput::completed(Self::NAME, content)])
  }
}

/// Unify line endings, trim line ends, collapse runs of blank lines
fn normalize(text: &str) -> String {
  let text = text.trim_start_matches('\u{feff}').replace("\r\n", "\n").replace('\r', "\n");

  let mut out = String::with_capacity(text.len());
  let mut blank_run = 0;
  for line in text.lines() {
    let line = line.trim_end();
    if line.is_empty() {
      blank_run += 1;
      if blank_run > 1 {
        continue;
      }
    } else {
      blank_run = 0;
    }
    out.push_str(line);
    out.push('\n');
  }

  out.trim().to_string()
}

/// Drop markup, keeping text and block boundaries
fn strip_html(html: &str) -> String {
  let mut out = String::with_capacity(html.len());
  let mut rest = html;

  while let Some(start) = rest.find('<') {
    out.push_str(&rest[..start]);
    let after = &rest[start..];
    let Some(end) = after.find('>') else {
      rest = "";
      break;
    };
    let tag = after[1..end].trim().to_ascii_lowercase();
    rest = &after[end + 1..];

    // Skip the bodies of non-content elements entirely
    for skipped in ["script", "style"] {
      if tag == skipped || tag.starts_with(&format!("{} ", skipped)) {
        let close = format!("</{}", skipped);
        match rest.to_ascii_lowercase().find(&close) {
          Some(pos) => {
            rest = &rest[pos..];
            if let Some(gt) = rest.find('>') {
              rest = &rest[gt + 1..];
            }
          }
          None => rest = "",
        }
      }
    }

    let name = tag.trim_start_matches('/').split(|c: char| c.is_whitespace() || c == '/').next().unwrap_or("");
    if matches!(
      name,
      "p" | "br" | "div" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "section" | "article"
    ) {
      out.push('\n');
    }
  }
  out.push_str(rest);

  decode_entities(&out)
}

fn decode_entities(text: &str) -> String {
  text
    .replace("&nbsp;", " ")
    .replace("&lt;", "<")
    .replace("&gt;", ">")
    .replace("&quot;", "\"")
    .replace("&#39;", "'")
    .replace("&amp;", "&")
}
