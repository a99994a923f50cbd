// Digest coordinator - the per-file state machine
//
// A pass over one path:
// 1. Take the path lock (no-op if someone else holds it)
// 2. Optionally reset every record for the path
// 3. For each digester in registry order: reload records, pick pending
//    outputs, skip / mark in_progress / produce / persist, apply cascades
// 4. Release the lock, whatever happened

use std::{
  any::Any,
  collections::HashSet,
  panic::AssertUnwindSafe,
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn};

use crate::{
  db::{BlobStore, DbError, DigestStore},
  digest::{
    CascadeTable, DigestRecords, Digester, DigesterRegistry,
    events::DigestEvent,
    lock::{LockError, LockGuard, LockManager},
  },
  domain::{
    digest::{DigestOutput, DigestRecord, DigestStatus, OutputStatus},
    file::FileDescriptor,
  },
};

const EVENT_CAPACITY: usize = 1024;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum CoordinatorError {
  #[error("Store error: {0}")]
  Store(#[from] DbError),
  #[error("Lock error: {0}")]
  Lock(#[from] LockError),
  #[error("File error: {0}")]
  File(#[from] std::io::Error),
  #[error("No library root configured")]
  NoLibraryRoot,
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOptions {
  /// Zero every record for the path before the pass
  pub reset: bool,
}

impl ProcessOptions {
  pub fn reset() -> Self {
    Self { reset: true }
  }
}

/// What a single pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
  /// Digesters whose `produce` was called
  pub invoked: usize,
  pub completed: usize,
  pub skipped: usize,
  pub failed: usize,
  /// Downstream records reset by cascades
  pub cascaded: usize,
  /// Digesters passed over because an output was in progress
  pub deferred: usize,
}

impl PassSummary {
  /// Nothing was written
  pub fn is_noop(&self) -> bool {
    self.completed == 0 && self.skipped == 0 && self.failed == 0 && self.cascaded == 0
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
  /// Another owner holds the path lock; nothing was touched
  Busy,
  Processed(PassSummary),
  /// Records deleted because the file is gone
  Removed(usize),
  Renamed(usize),
  Reset(usize),
}

/// Runs digesters over files. Construct once and share.
pub struct DigestCoordinator {
  store: Arc<dyn DigestStore>,
  locks: Arc<dyn LockManager>,
  blobs: BlobStore,
  registry: Arc<DigesterRegistry>,
  cascades: Arc<CascadeTable>,
  max_attempts: u32,
  heartbeat_interval: Duration,
  library_root: Option<PathBuf>,
  instance_id: String,
  events: broadcast::Sender<DigestEvent>,
}

impl DigestCoordinator {
  pub fn new(
    store: Arc<dyn DigestStore>,
    locks: Arc<dyn LockManager>,
    blobs: BlobStore,
    registry: Arc<DigesterRegistry>,
    cascades: Arc<CascadeTable>,
  ) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      store,
      locks,
      blobs,
      registry,
      cascades,
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      heartbeat_interval: DEFAULT_HEARTBEAT,
      library_root: None,
      instance_id: format!("pid-{}", std::process::id()),
      events,
    }
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }

  pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
    self.heartbeat_interval = interval;
    self
  }

  pub fn with_library_root(mut self, root: PathBuf) -> Self {
    self.library_root = Some(root);
    self
  }

  pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
    self.instance_id = instance_id.into();
    self
  }

  pub fn store(&self) -> &Arc<dyn DigestStore> {
    &self.store
  }

  pub fn locks(&self) -> &Arc<dyn LockManager> {
    &self.locks
  }

  pub fn blobs(&self) -> &BlobStore {
    &self.blobs
  }

  pub fn registry(&self) -> &DigesterRegistry {
    &self.registry
  }

  pub fn max_attempts(&self) -> u32 {
    self.max_attempts
  }

  pub fn library_root(&self) -> Option<&Path> {
    self.library_root.as_deref()
  }

  /// Completion notices, one per output after each digester finishes
  pub fn subscribe(&self) -> broadcast::Receiver<DigestEvent> {
    self.events.subscribe()
  }

  /// Fresh owner id per call so concurrent calls in one process exclude each other
  fn new_owner_id(&self) -> String {
    format!("{}:{}", self.instance_id, uuid::Uuid::new_v4())
  }

  /// Run the pipeline over one file
  pub async fn process_file(&self, file: &FileDescriptor, options: ProcessOptions) -> Result<ProcessOutcome> {
    let owner = self.new_owner_id();
    let Some(guard) = LockGuard::acquire(self.locks.clone(), &file.path, &owner)? else {
      debug!(path = %file.path, "Path is locked, skipping pass");
      return Ok(ProcessOutcome::Busy);
    };

    let heartbeat = Heartbeat::start(self.locks.clone(), &file.path, &owner, self.heartbeat_interval);
    let result = self.run_pass(file, options).await;
    heartbeat.stop().await;
    guard.release()?;

    let summary = result?;
    if summary.is_noop() {
      trace!(path = %file.path, "Pass made no changes");
    } else {
      info!(
        path = %file.path,
        completed = summary.completed,
        skipped = summary.skipped,
        failed = summary.failed,
        cascaded = summary.cascaded,
        "Digest pass finished"
      );
    }
    Ok(ProcessOutcome::Processed(summary))
  }

  /// Process a library-relative path, removing its records if the file is gone
  pub async fn process_path(&self, path: &str, options: ProcessOptions) -> Result<ProcessOutcome> {
    let root = self.library_root.as_deref().ok_or(CoordinatorError::NoLibraryRoot)?;
    match FileDescriptor::from_path(root, path) {
      Ok(file) => self.process_file(&file, options).await,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!(path = %path, "File no longer exists");
        self.remove_file(path).await
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Delete every record for a deleted file, with their blobs
  pub async fn remove_file(&self, path: &str) -> Result<ProcessOutcome> {
    let owner = self.new_owner_id();
    let Some(guard) = LockGuard::acquire(self.locks.clone(), path, &owner)? else {
      return Ok(ProcessOutcome::Busy);
    };

    for record in self.store.list(path).await? {
      if let Some(key) = record.binary_ref {
        self.delete_blob(path, &record.digester, &key).await;
      }
    }
    let removed = self.store.delete_all(path).await?;
    guard.release()?;

    if removed > 0 {
      info!(path = %path, records = removed, "Removed digests for deleted file");
    }
    Ok(ProcessOutcome::Removed(removed))
  }

  /// Move every record of `from` to `to`
  pub async fn rename_file(&self, from: &str, to: &str) -> Result<ProcessOutcome> {
    if from == to {
      return Ok(ProcessOutcome::Renamed(0));
    }

    let owner = self.new_owner_id();
    let Some(source) = LockGuard::acquire(self.locks.clone(), from, &owner)? else {
      return Ok(ProcessOutcome::Busy);
    };
    let Some(target) = LockGuard::acquire(self.locks.clone(), to, &owner)? else {
      return Ok(ProcessOutcome::Busy);
    };

    // Rows already at `to` are replaced, so their blobs go with them
    if !self.store.list(from).await?.is_empty() {
      for record in self.store.list(to).await? {
        if let Some(key) = record.binary_ref {
          self.delete_blob(to, &record.digester, &key).await;
        }
      }
    }

    let moved = self.store.rename_path(from, to).await?;
    target.release()?;
    source.release()?;

    info!(from = %from, to = %to, records = moved, "Renamed digests");
    Ok(ProcessOutcome::Renamed(moved))
  }

  /// Explicitly reset one digester's records for a path.
  ///
  /// `name` may be a digester name (all its outputs) or a single output name.
  pub async fn reset_digester(&self, path: &str, name: &str) -> Result<ProcessOutcome> {
    let owner = self.new_owner_id();
    let Some(guard) = LockGuard::acquire(self.locks.clone(), path, &owner)? else {
      return Ok(ProcessOutcome::Busy);
    };

    let names = match self.registry.get(name) {
      Some(digester) => digester.output_names(),
      None => vec![name.to_string()],
    };

    let mut reset = 0;
    for output in names {
      if let Some(mut record) = self.store.get(path, &output).await? {
        let blob = record.reset();
        self.store.upsert(&record).await?;
        if let Some(key) = blob {
          self.delete_blob(path, &output, &key).await;
        }
        reset += 1;
      }
    }
    guard.release()?;

    info!(path = %path, digester = %name, records = reset, "Reset digester");
    Ok(ProcessOutcome::Reset(reset))
  }

  /// Records for a path in registry output order, unknown names last
  pub async fn records(&self, path: &str) -> Result<Vec<DigestRecord>> {
    let mut records = self.store.list(path).await?;
    records.sort_by(|a, b| {
      let pa = self.registry.output_position(&a.digester).unwrap_or(usize::MAX);
      let pb = self.registry.output_position(&b.digester).unwrap_or(usize::MAX);
      pa.cmp(&pb).then_with(|| a.digester.cmp(&b.digester))
    });
    Ok(records)
  }

  async fn run_pass(&self, file: &FileDescriptor, options: ProcessOptions) -> Result<PassSummary> {
    let path = file.path.as_str();
    let mut summary = PassSummary::default();

    if options.reset {
      let reset = self.reset_all(path).await?;
      debug!(path = %path, records = reset, "Reset all records before pass");
    }

    for digester in self.registry.iter() {
      self.run_digester(digester.as_ref(), file, &mut summary).await?;
    }

    Ok(summary)
  }

  async fn reset_all(&self, path: &str) -> Result<usize> {
    let records = self.store.list(path).await?;
    let count = records.len();
    for mut record in records {
      let blob = record.reset();
      self.store.upsert(&record).await?;
      if let Some(key) = blob {
        self.delete_blob(path, &record.digester, &key).await;
      }
    }
    Ok(count)
  }

  async fn run_digester(&self, digester: &dyn Digester, file: &FileDescriptor, summary: &mut PassSummary) -> Result<()> {
    let path = file.path.as_str();

    // Fresh view: earlier digesters in this pass must be visible
    let records = DigestRecords::new(self.store.list(path).await?, self.max_attempts);
    let outputs = digester.output_names();

    if outputs
      .iter()
      .any(|name| records.status(name) == Some(DigestStatus::InProgress))
    {
      debug!(path = %path, digester = %digester.name(), "Output in progress, deferring");
      summary.deferred += 1;
      return Ok(());
    }

    let mut pending: Vec<DigestRecord> = outputs
      .iter()
      .filter_map(|name| match records.get(name) {
        None => Some(DigestRecord::new(path, name.as_str())),
        Some(record) if record.is_pending(self.max_attempts) => Some(record.clone()),
        Some(_) => None,
      })
      .collect();

    if pending.is_empty() {
      trace!(path = %path, digester = %digester.name(), "Digester is terminal");
      return Ok(());
    }

    if !digester.can_apply(file) {
      for record in &mut pending {
        record.status = DigestStatus::Skipped;
        record.error = None;
        record.updated_at = Utc::now();
        self.store.upsert(record).await?;
        self.emit(record);
        summary.skipped += 1;
      }
      trace!(path = %path, digester = %digester.name(), "Digester does not apply");
      return Ok(());
    }

    // Persist the attempt before running so a crash leaves reclaimable state
    for record in &mut pending {
      record.status = DigestStatus::InProgress;
      record.attempts += 1;
      record.error = None;
      record.updated_at = Utc::now();
      self.store.upsert(record).await?;
    }

    summary.invoked += 1;
    debug!(path = %path, digester = %digester.name(), outputs = pending.len(), "Running digester");

    let produced = AssertUnwindSafe(digester.produce(file, &records)).catch_unwind().await;
    let outputs = match produced {
      Ok(Ok(outputs)) => outputs,
      Ok(Err(e)) => {
        self.fail_all(digester, path, &mut pending, e.to_string(), summary).await?;
        return Ok(());
      }
      Err(panic) => {
        let message = format!("digester panicked: {}", panic_message(panic.as_ref()));
        self.fail_all(digester, path, &mut pending, message, summary).await?;
        return Ok(());
      }
    };

    self.persist_outputs(digester, path, pending, outputs, summary).await
  }

  async fn fail_all(
    &self,
    digester: &dyn Digester,
    path: &str,
    pending: &mut [DigestRecord],
    message: String,
    summary: &mut PassSummary,
  ) -> Result<()> {
    for record in pending.iter_mut() {
      record.status = DigestStatus::Failed;
      record.error = Some(message.clone());
      record.updated_at = Utc::now();
      self.store.upsert(record).await?;
      self.emit(record);
      summary.failed += 1;
    }

    let attempts = pending.first().map(|r| r.attempts).unwrap_or_default();
    if attempts >= self.max_attempts {
      warn!(path = %path, digester = %digester.name(), attempts, err = %message, "Digester failed permanently");
    } else {
      warn!(path = %path, digester = %digester.name(), attempts, err = %message, "Digester failed, will retry");
    }
    Ok(())
  }

  async fn persist_outputs(
    &self,
    digester: &dyn Digester,
    path: &str,
    pending: Vec<DigestRecord>,
    outputs: Vec<DigestOutput>,
    summary: &mut PassSummary,
  ) -> Result<()> {
    let mut remaining = pending;
    let mut cascade_from: Vec<String> = Vec::new();
    let mut seen = HashSet::new();

    for output in outputs {
      let Some(index) = remaining.iter().position(|r| r.digester == output.name) else {
        if seen.contains(&output.name) {
          warn!(path = %path, digester = %digester.name(), output = %output.name, "Duplicate output ignored");
        } else {
          warn!(path = %path, digester = %digester.name(), output = %output.name, "Output not pending or not declared, ignored");
        }
        continue;
      };
      let mut record = remaining.swap_remove(index);
      seen.insert(output.name.clone());

      record.error = None;
      record.updated_at = Utc::now();
      match output.status {
        OutputStatus::Completed => {
          record.status = DigestStatus::Completed;
          record.content = output.content;
        }
        OutputStatus::Skipped => {
          record.status = DigestStatus::Skipped;
          record.content = None;
        }
      }

      let previous_blob = record.binary_ref.take();
      if let Some(binary) = output.binary.as_ref() {
        match self.blobs.put(path, &record.digester, binary).await {
          Ok(key) => record.binary_ref = Some(key),
          Err(e) => {
            record.status = DigestStatus::Failed;
            record.content = None;
            record.error = Some(format!("failed to store binary output: {}", e));
          }
        }
      }
      if let Some(old) = previous_blob
        && record.binary_ref.as_deref() != Some(old.as_str())
      {
        self.delete_blob(path, &record.digester, &old).await;
      }

      self.store.upsert(&record).await?;
      self.emit(&record);

      match record.status {
        DigestStatus::Completed => {
          summary.completed += 1;
          if record.content.is_some() {
            cascade_from.push(record.digester.clone());
          }
        }
        DigestStatus::Skipped => summary.skipped += 1,
        _ => summary.failed += 1,
      }
    }

    // Declared outputs the digester did not return
    for mut record in remaining {
      warn!(path = %path, digester = %digester.name(), output = %record.digester, "Output not produced, marking skipped");
      record.status = DigestStatus::Skipped;
      record.content = None;
      record.error = None;
      record.updated_at = Utc::now();
      self.store.upsert(&record).await?;
      self.emit(&record);
      summary.skipped += 1;
    }

    if !cascade_from.is_empty() && !cascade_from.iter().any(|n| n == digester.name()) {
      cascade_from.push(digester.name().to_string());
    }
    for upstream in cascade_from {
      let reset = self.cascades.apply(&*self.store, &self.blobs, path, &upstream).await?;
      if !reset.is_empty() {
        debug!(path = %path, upstream = %upstream, reset = ?reset, "Applied cascade");
        summary.cascaded += reset.len();
      }
    }

    Ok(())
  }

  fn emit(&self, record: &DigestRecord) {
    // No subscribers is fine
    let _ = self.events.send(DigestEvent {
      path: record.path.clone(),
      digester: record.digester.clone(),
      status: record.status,
    });
  }

  async fn delete_blob(&self, path: &str, digester: &str, key: &str) {
    if let Err(e) = self.blobs.delete(key).await {
      warn!(path = %path, digester = %digester, key = %key, err = %e, "Failed to delete blob");
    }
  }
}

/// Renews a path lock in the background for the duration of a pass
struct Heartbeat {
  handle: JoinHandle<()>,
  _cancel: DropGuard,
}

impl Heartbeat {
  fn start(locks: Arc<dyn LockManager>, path: &str, owner: &str, period: Duration) -> Self {
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let path = path.to_string();
    let owner = owner.to_string();

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
      ticker.tick().await;

      loop {
        tokio::select! {
          biased;

          _ = cancelled.cancelled() => break,

          _ = ticker.tick() => match locks.renew(&path, &owner) {
            Ok(true) => trace!(path = %path, "Renewed path lock"),
            Ok(false) => {
              warn!(path = %path, owner = %owner, "Path lock lost during pass");
              break;
            }
            Err(e) => warn!(path = %path, err = %e, "Failed to renew path lock"),
          },
        }
      }
    });

    Self {
      handle,
      _cancel: token.drop_guard(),
    }
  }

  /// Stop renewing and wait, so no renewal can land after release
  async fn stop(self) {
    let Heartbeat { handle, _cancel } = self;
    drop(_cancel);
    let _ = handle.await;
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
