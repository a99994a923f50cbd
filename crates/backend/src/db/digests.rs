// Digest record operations on the LanceDB `digests` table
//
// Rows are keyed by (path, digester). Writes go through merge_insert on that
// pair so a record is replaced in a single commit and never duplicated.

use std::{collections::BTreeSet, sync::Arc};

use arrow_array::{Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};

use crate::{
  db::{
    connection::{DbError, DigestDb, Result},
    schema::digests_schema,
    store::DigestStore,
  },
  domain::digest::{DigestContent, DigestRecord, DigestStatus},
};

impl DigestDb {
  async fn query_records(&self, filter: String) -> Result<Vec<DigestRecord>> {
    let table = self.digests_table().await?;

    let results: Vec<RecordBatch> = table.query().only_if(filter).execute().await?.try_collect().await?;

    let mut records = Vec::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        records.push(batch_to_record(&batch, i)?);
      }
    }

    Ok(records)
  }
}

#[async_trait]
impl DigestStore for DigestDb {
  #[tracing::instrument(level = "trace", skip(self))]
  async fn get(&self, path: &str, digester: &str) -> Result<Option<DigestRecord>> {
    let mut records = self
      .query_records(format!(
        "path = '{}' AND digester = '{}'",
        escape_sql(path),
        escape_sql(digester)
      ))
      .await?;
    Ok(records.pop())
  }

  #[tracing::instrument(level = "trace", skip(self))]
  async fn list(&self, path: &str) -> Result<Vec<DigestRecord>> {
    self.query_records(format!("path = '{}'", escape_sql(path))).await
  }

  #[tracing::instrument(level = "trace", skip(self, record), fields(path = %record.path, digester = %record.digester, status = %record.status))]
  async fn upsert(&self, record: &DigestRecord) -> Result<()> {
    let table = self.digests_table().await?;

    let batch = records_to_batch(std::slice::from_ref(record))?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], digests_schema());

    let mut merge = table.merge_insert(&["path", "digester"]);
    merge.when_matched_update_all(None).when_not_matched_insert_all();
    merge.execute(Box::new(batches)).await?;
    Ok(())
  }

  #[tracing::instrument(level = "trace", skip(self))]
  async fn delete_all(&self, path: &str) -> Result<usize> {
    let table = self.digests_table().await?;
    let filter = format!("path = '{}'", escape_sql(path));

    let count = table.count_rows(Some(filter.clone())).await?;
    if count > 0 {
      table.delete(&filter).await?;
    }
    Ok(count)
  }

  #[tracing::instrument(level = "trace", skip(self))]
  async fn list_by_status(&self, status: DigestStatus) -> Result<Vec<DigestRecord>> {
    self.query_records(format!("status = '{}'", status.as_str())).await
  }

  #[tracing::instrument(level = "trace", skip(self))]
  async fn list_by_digester(&self, digester: &str) -> Result<Vec<DigestRecord>> {
    self
      .query_records(format!("digester = '{}'", escape_sql(digester)))
      .await
  }

  #[tracing::instrument(level = "trace", skip(self))]
  async fn list_paths(&self) -> Result<Vec<String>> {
    let table = self.digests_table().await?;
    let results: Vec<RecordBatch> = table.query().execute().await?.try_collect().await?;

    let mut paths = BTreeSet::new();
    for batch in results {
      let column = string_column(&batch, "path")?;
      for i in 0..batch.num_rows() {
        paths.insert(column.value(i).to_string());
      }
    }
    Ok(paths.into_iter().collect())
  }

  #[tracing::instrument(level = "trace", skip(self))]
  async fn rename_path(&self, from: &str, to: &str) -> Result<usize> {
    let table = self.digests_table().await?;

    let filter = format!("path = '{}'", escape_sql(from));
    let count = table.count_rows(Some(filter.clone())).await?;
    if count == 0 {
      return Ok(0);
    }

    // Records already keyed under the destination would collide
    table.delete(&format!("path = '{}'", escape_sql(to))).await?;

    table
      .update()
      .only_if(filter)
      .column("path", format!("'{}'", escape_sql(to)))
      .execute()
      .await?;

    Ok(count)
  }
}

/// Escape single quotes in SQL strings
fn escape_sql(s: &str) -> String {
  s.replace('\'', "''")
}

/// Convert digest records to an Arrow RecordBatch
fn records_to_batch(records: &[DigestRecord]) -> Result<RecordBatch> {
  let paths: Vec<String> = records.iter().map(|r| r.path.clone()).collect();
  let digesters: Vec<String> = records.iter().map(|r| r.digester.clone()).collect();
  let statuses: Vec<String> = records.iter().map(|r| r.status.as_str().to_string()).collect();
  let contents: Vec<Option<String>> = records
    .iter()
    .map(|r| r.content.as_ref().map(DigestContent::encode))
    .collect();
  let content_kinds: Vec<Option<String>> = records
    .iter()
    .map(|r| r.content.as_ref().map(|c| c.kind().to_string()))
    .collect();
  let binary_refs: Vec<Option<String>> = records.iter().map(|r| r.binary_ref.clone()).collect();
  let errors: Vec<Option<String>> = records.iter().map(|r| r.error.clone()).collect();
  let attempts: Vec<u32> = records.iter().map(|r| r.attempts).collect();
  let created_ats: Vec<i64> = records.iter().map(|r| r.created_at.timestamp_millis()).collect();
  let updated_ats: Vec<i64> = records.iter().map(|r| r.updated_at.timestamp_millis()).collect();

  let batch = RecordBatch::try_new(
    digests_schema(),
    vec![
      Arc::new(StringArray::from(paths)),
      Arc::new(StringArray::from(digesters)),
      Arc::new(StringArray::from(statuses)),
      Arc::new(StringArray::from(contents)),
      Arc::new(StringArray::from(content_kinds)),
      Arc::new(StringArray::from(binary_refs)),
      Arc::new(StringArray::from(errors)),
      Arc::new(UInt32Array::from(attempts)),
      Arc::new(Int64Array::from(created_ats)),
      Arc::new(Int64Array::from(updated_ats)),
    ],
  )?;

  Ok(batch)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    .ok_or_else(|| DbError::NotFound(format!("{} column", name)))
}

fn i64_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .ok_or_else(|| DbError::NotFound(format!("{} column", name)))
}

fn optional_string(array: &StringArray, row: usize) -> Option<String> {
  if array.is_null(row) {
    None
  } else {
    Some(array.value(row).to_string())
  }
}

fn timestamp(ms: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Convert a RecordBatch row to a DigestRecord
fn batch_to_record(batch: &RecordBatch, row: usize) -> Result<DigestRecord> {
  let path = string_column(batch, "path")?.value(row).to_string();
  let digester = string_column(batch, "digester")?.value(row).to_string();

  let status_raw = string_column(batch, "status")?.value(row);
  let status = status_raw
    .parse::<DigestStatus>()
    .map_err(|e| DbError::InvalidInput(e.to_string()))?;

  let content_kind = optional_string(string_column(batch, "content_kind")?, row);
  let content = match optional_string(string_column(batch, "content")?, row) {
    Some(raw) => Some(DigestContent::decode(content_kind.as_deref(), &raw)?),
    None => None,
  };

  let binary_ref = optional_string(string_column(batch, "binary_ref")?, row);
  let error = optional_string(string_column(batch, "error")?, row);

  let attempts = batch
    .column_by_name("attempts")
    .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("attempts column".to_string()))?;

  let created_at = timestamp(i64_column(batch, "created_at")?.value(row));
  let updated_at = timestamp(i64_column(batch, "updated_at")?.value(row));

  Ok(DigestRecord {
    path,
    digester,
    status,
    content,
    binary_ref,
    error,
    attempts,
    created_at,
    updated_at,
  })
}
