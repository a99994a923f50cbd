//! File descriptors handed to digesters.
//!
//! A descriptor is a snapshot of file *type* facts (MIME type, extension,
//! size, modification time). Digester applicability is decided from these
//! fields alone, never from digest state.

use std::{
  io::Read,
  path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of header bytes sniffed for magic-byte MIME detection
const SNIFF_LEN: usize = 8192;

/// Extensions treated as text-like documents regardless of sniffed type.
pub const TEXT_EXTENSIONS: &[&str] = &[
  "md", "markdown", "txt", "text", "rst", "org", "csv", "tsv", "log", "json", "yaml", "yml", "toml", "html", "htm",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
  /// Library-relative path, used as the record key
  pub path: String,
  /// Absolute on-disk location for digesters that read bytes
  pub location: PathBuf,
  pub mime_type: String,
  /// Lowercased extension without the dot
  pub extension: Option<String>,
  pub size: u64,
  pub modified_at: DateTime<Utc>,
}

impl FileDescriptor {
  /// Build a descriptor by inspecting `root/relative` on disk.
  pub fn from_path(root: &Path, relative: &str) -> std::io::Result<Self> {
    let location = root.join(relative);
    let metadata = std::fs::metadata(&location)?;
    if !metadata.is_file() {
      return Err(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("not a regular file: {}", location.display()),
      ));
    }

    let extension = extension_of(&location);
    let header = read_header(&location)?;
    let mime_type = detect_mime(&header, extension.as_deref());
    let modified_at = metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());

    Ok(Self {
      path: relative.to_string(),
      location,
      mime_type,
      extension,
      size: metadata.len(),
      modified_at,
    })
  }

  pub fn is_image(&self) -> bool {
    self.mime_type.starts_with("image/")
  }

  pub fn is_audio(&self) -> bool {
    self.mime_type.starts_with("audio/")
  }

  pub fn is_video(&self) -> bool {
    self.mime_type.starts_with("video/")
  }

  /// Text-like documents: `text/*` MIME or a known text extension.
  pub fn is_text(&self) -> bool {
    if self.mime_type.starts_with("text/") {
      return true;
    }
    self
      .extension
      .as_deref()
      .map(|ext| TEXT_EXTENSIONS.contains(&ext))
      .unwrap_or(false)
  }

  /// Whether the file is a saved URL reference (`.url` / `.webloc`).
  pub fn is_url_reference(&self) -> bool {
    matches!(self.extension.as_deref(), Some("url") | Some("webloc"))
  }
}

fn extension_of(path: &Path) -> Option<String> {
  path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase())
}

fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
  let mut file = std::fs::File::open(path)?;
  let mut header = Vec::with_capacity(SNIFF_LEN);
  file.by_ref().take(SNIFF_LEN as u64).read_to_end(&mut header)?;
  Ok(header)
}

/// Detect a MIME type from magic bytes, falling back to the extension.
pub fn detect_mime(header: &[u8], extension: Option<&str>) -> String {
  if let Some(kind) = infer::get(header) {
    return kind.mime_type().to_string();
  }
  extension
    .and_then(mime_from_extension)
    .unwrap_or("application/octet-stream")
    .to_string()
}

fn mime_from_extension(ext: &str) -> Option<&'static str> {
  let mime = match ext {
    "md" | "markdown" => "text/markdown",
    "txt" | "text" | "log" => "text/plain",
    "rst" => "text/x-rst",
    "org" => "text/x-org",
    "csv" => "text/csv",
    "tsv" => "text/tab-separated-values",
    "html" | "htm" => "text/html",
    "json" => "application/json",
    "yaml" | "yml" => "application/yaml",
    "toml" => "application/toml",
    "url" => "text/uri-list",
    "webloc" => "application/x-webloc",
    "svg" => "image/svg+xml",
    _ => return None,
  };
  Some(mime)
}
