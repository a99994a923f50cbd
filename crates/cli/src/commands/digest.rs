//! Digest commands (process, status, reset, rename, scan, reclaim)
//!
//! These open the runtime directly. Path locks live on disk, so they are safe
//! to run next to a daemon working on the same data directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use mylifedb::{
  Runtime, RuntimeConfig,
  digest::{PassSummary, ProcessOptions, ProcessOutcome},
  domain::digest::{DigestContent, DigestRecord},
};

/// Run the pipeline over one file
pub async fn cmd_process(runtime_config: RuntimeConfig, path: &str, reset: bool) -> Result<()> {
  let runtime = open_runtime(runtime_config).await?;
  let key = library_key(&runtime, path)?;

  let options = if reset {
    ProcessOptions::reset()
  } else {
    ProcessOptions::default()
  };
  let outcome = runtime
    .coordinator
    .process_path(&key, options)
    .await
    .with_context(|| format!("Failed to process {}", key))?;

  print_outcome(&key, &outcome);
  Ok(())
}

/// Show the digest records of one file
pub async fn cmd_status(runtime_config: RuntimeConfig, path: &str, json: bool) -> Result<()> {
  let runtime = open_runtime(runtime_config).await?;
  let key = library_key(&runtime, path)?;
  let records = runtime
    .coordinator
    .records(&key)
    .await
    .context("Failed to read digest records")?;

  if json {
    println!("{}", serde_json::to_string_pretty(&records)?);
    return Ok(());
  }

  if records.is_empty() {
    println!("No digests for {}", key);
    return Ok(());
  }

  println!("{}", key);
  println!();
  println!("{:<20} {:<12} {:>8}  {}", "DIGESTER", "STATUS", "ATTEMPTS", "DETAIL");
  for record in &records {
    println!(
      "{:<20} {:<12} {:>8}  {}",
      record.digester,
      record.status,
      record.attempts,
      detail(record)
    );
  }
  Ok(())
}

/// Reset one digester, or every digest of the file followed by a pass
pub async fn cmd_reset(runtime_config: RuntimeConfig, path: &str, digester: Option<&str>) -> Result<()> {
  let runtime = open_runtime(runtime_config).await?;
  let key = library_key(&runtime, path)?;

  let outcome = match digester {
    Some(name) => runtime
      .coordinator
      .reset_digester(&key, name)
      .await
      .with_context(|| format!("Failed to reset {} for {}", name, key))?,
    None => runtime
      .coordinator
      .process_path(&key, ProcessOptions::reset())
      .await
      .with_context(|| format!("Failed to reprocess {}", key))?,
  };

  print_outcome(&key, &outcome);
  Ok(())
}

/// Move the digests of a file that was renamed or moved
pub async fn cmd_rename(runtime_config: RuntimeConfig, from: &str, to: &str) -> Result<()> {
  let runtime = open_runtime(runtime_config).await?;
  let from = library_key(&runtime, from)?;
  let to = library_key(&runtime, to)?;

  let outcome = runtime
    .coordinator
    .rename_file(&from, &to)
    .await
    .with_context(|| format!("Failed to move digests from {} to {}", from, to))?;

  print_outcome(&from, &outcome);
  Ok(())
}

/// Scan the library once
pub async fn cmd_scan(runtime_config: RuntimeConfig) -> Result<()> {
  let concurrency = runtime_config.config.scan.concurrency;
  let runtime = open_runtime(runtime_config).await?;
  let Some(library) = runtime.library.as_ref() else {
    bail!("No library root configured (set [library] root in the config file)");
  };

  println!("Scanning {:?}...", library.root());
  let report = library
    .scan(&runtime.coordinator, concurrency)
    .await
    .context("Library scan failed")?;

  println!("Files:      {}", report.files);
  println!("Processed:  {}", report.processed);
  println!("Changed:    {}", report.changed);
  println!("Removed:    {}", report.removed);
  if report.busy > 0 {
    println!("Busy:       {} (locked by another pass)", report.busy);
  }
  if report.errors > 0 {
    println!("Errors:     {} (see log output)", report.errors);
  }
  println!("Elapsed:    {} ms", report.elapsed_ms);
  Ok(())
}

/// Reclaim abandoned locks and in-progress digests
pub async fn cmd_reclaim(runtime_config: RuntimeConfig) -> Result<()> {
  let runtime = open_runtime(runtime_config).await?;
  let report = runtime.reclaimer.sweep().await.context("Reclaim sweep failed")?;

  println!("Records reset:  {}", report.records_reset);
  println!("Locks removed:  {}", report.locks_removed);
  Ok(())
}

pub(crate) async fn open_runtime(runtime_config: RuntimeConfig) -> Result<Runtime> {
  let RuntimeConfig { data_dir, config, .. } = runtime_config;
  Runtime::open(config, &data_dir)
    .await
    .with_context(|| format!("Failed to open data directory {:?}", data_dir))
}

/// Record key for a command-line path
fn library_key(runtime: &Runtime, path: &str) -> Result<String> {
  let root = runtime.library.as_ref().map(|l| l.root());
  resolve_key(root, path)
}

fn resolve_key(root: Option<&Path>, path: &str) -> Result<String> {
  let candidate = PathBuf::from(path);
  if !candidate.is_absolute() {
    return Ok(path.trim_start_matches("./").to_string());
  }

  let Some(root) = root else {
    bail!("No library root configured; pass a library-relative path");
  };
  let relative = candidate
    .strip_prefix(root)
    .with_context(|| format!("{} is outside the library root {:?}", path, root))?;
  let parts: Vec<_> = relative
    .components()
    .map(|c| c.as_os_str().to_string_lossy().into_owned())
    .collect();
  Ok(parts.join("/"))
}

fn print_outcome(key: &str, outcome: &ProcessOutcome) {
  match outcome {
    ProcessOutcome::Busy => println!("{} is being processed elsewhere, try again later", key),
    ProcessOutcome::Processed(summary) => print_summary(key, summary),
    ProcessOutcome::Removed(n) => println!("{} no longer exists, removed {} records", key, n),
    ProcessOutcome::Renamed(n) => println!("Moved {} records", n),
    ProcessOutcome::Reset(n) => println!("Reset {} records of {}", n, key),
  }
}

fn print_summary(key: &str, summary: &PassSummary) {
  if summary.is_noop() {
    println!("{}: up to date", key);
    return;
  }
  println!(
    "{}: {} completed, {} skipped, {} failed ({} digesters run, {} cascaded, {} deferred)",
    key,
    summary.completed,
    summary.skipped,
    summary.failed,
    summary.invoked,
    summary.cascaded,
    summary.deferred
  );
}

/// One-line detail for the status table
fn detail(record: &DigestRecord) -> String {
  if let Some(error) = &record.error {
    return error.clone();
  }
  let mut detail = match &record.content {
    Some(DigestContent::Text(text)) => preview(text, 48),
    Some(DigestContent::Structured(value)) => preview(&value.to_string(), 48),
    None => String::new(),
  };
  if let Some(blob) = &record.binary_ref {
    if !detail.is_empty() {
      detail.push(' ');
    }
    detail.push_str(&format!("[blob {}]", blob));
  }
  detail
}

fn preview(text: &str, max_chars: usize) -> String {
  let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
  if flat.chars().count() <= max_chars {
    return flat;
  }
  let cut: String = flat.chars().take(max_chars).collect();
  format!("{}...", cut)
}
