use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema};

/// Schema for the digests table
///
/// One row per `(path, digester)`; `upsert` merges on that pair.
pub fn digests_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("path", DataType::Utf8, false), // Library-relative file path
    Field::new("digester", DataType::Utf8, false), // Producing output name
    Field::new("status", DataType::Utf8, false), // todo, in_progress, completed, skipped, failed
    Field::new("content", DataType::Utf8, true), // Opaque encoded payload
    Field::new("content_kind", DataType::Utf8, true), // text, json
    Field::new("binary_ref", DataType::Utf8, true), // Blob store key
    Field::new("error", DataType::Utf8, true),
    Field::new("attempts", DataType::UInt32, false),
    Field::new("created_at", DataType::Int64, false), // Unix timestamp ms
    Field::new("updated_at", DataType::Int64, false),
  ]))
}
