//! Test helpers for digest pipeline tests.
//!
//! Provides `DigestTestContext` (temporary library and data directories, an
//! in-memory store and a spying lock manager) and `Scripted`, a digester whose
//! applicability and output are supplied by the test.

use std::{
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::{
  db::{BlobStore, DigestStore, MemoryStore},
  digest::{
    CascadeTable, DigestCoordinator, DigestError, DigestRecords, Digester, DigesterRegistry, LockError, LockInfo,
    LockManager, MemoryLockManager, PassSummary, ProcessOutcome,
  },
  domain::{
    digest::{DigestContent, DigestOutput, DigestRecord},
    file::FileDescriptor,
  },
};

pub const MAX_ATTEMPTS: u32 = 3;
pub const STALE_AFTER: Duration = Duration::from_secs(600);

// ============================================================================
// Context
// ============================================================================

pub struct DigestTestContext {
  /// Library root holding source files
  pub library: TempDir,
  /// Data directory (blobs)
  pub data: TempDir,
  pub store: Arc<MemoryStore>,
  pub locks: Arc<SpyLocks>,
  pub blobs: BlobStore,
}

impl DigestTestContext {
  pub fn new() -> Self {
    let library = TempDir::new().expect("create library temp dir");
    let data = TempDir::new().expect("create data temp dir");
    let blobs = BlobStore::open(data.path());

    Self {
      library,
      data,
      store: Arc::new(MemoryStore::new()),
      locks: Arc::new(SpyLocks::new(STALE_AFTER)),
      blobs,
    }
  }

  pub fn coordinator(&self, registry: DigesterRegistry, cascades: CascadeTable) -> DigestCoordinator {
    DigestCoordinator::new(
      self.store.clone(),
      self.locks.clone(),
      self.blobs.clone(),
      Arc::new(registry),
      Arc::new(cascades),
    )
    .with_max_attempts(MAX_ATTEMPTS)
    .with_heartbeat_interval(Duration::from_millis(50))
    .with_library_root(self.library.path().to_path_buf())
  }

  /// Write a library file and describe it
  pub fn write_file(&self, path: &str, content: &[u8]) -> FileDescriptor {
    let full_path = self.library.path().join(path);
    if let Some(parent) = full_path.parent() {
      std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(&full_path, content).expect("write file");
    FileDescriptor::from_path(self.library.path(), path).expect("describe file")
  }

  pub async fn record(&self, path: &str, name: &str) -> DigestRecord {
    self
      .store
      .get(path, name)
      .await
      .expect("store get")
      .unwrap_or_else(|| panic!("missing record {} for {}", name, path))
  }

  pub async fn seed(&self, record: DigestRecord) {
    self.store.upsert(&record).await.expect("seed record");
  }

  pub fn snapshot(&self) -> Vec<DigestRecord> {
    self.store.snapshot()
  }
}

/// Unwrap a pass summary
pub fn summary(outcome: ProcessOutcome) -> PassSummary {
  match outcome {
    ProcessOutcome::Processed(summary) => summary,
    other => panic!("expected a processed pass, got {:?}", other),
  }
}

pub fn registry(digesters: Vec<Scripted>) -> DigesterRegistry {
  digesters
    .into_iter()
    .fold(DigesterRegistry::builder(), |b, d| b.register(d))
    .build()
    .expect("build registry")
}

// ============================================================================
// Scripted digester
// ============================================================================

type ProduceFn = dyn Fn(&FileDescriptor, &DigestRecords) -> Result<Vec<DigestOutput>, DigestError> + Send + Sync;
type AppliesFn = dyn Fn(&FileDescriptor) -> bool + Send + Sync;

/// Pauses `produce` until the test lets it continue
#[derive(Default)]
pub struct Gate {
  entered: Notify,
  release: Notify,
}

impl Gate {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Wait until a produce call is parked at the gate
  pub async fn wait_entered(&self) {
    self.entered.notified().await;
  }

  pub fn open(&self) {
    self.release.notify_one();
  }
}

pub struct Scripted {
  name: String,
  outputs: Vec<String>,
  applies: Arc<AppliesFn>,
  produce: Arc<ProduceFn>,
  calls: Arc<AtomicUsize>,
  gate: Option<Arc<Gate>>,
}

impl Scripted {
  /// Applies to everything and completes with `"<name> output"`
  pub fn new(name: &str) -> Self {
    let owned = name.to_string();
    Self {
      name: name.to_string(),
      outputs: vec![name.to_string()],
      applies: Arc::new(|_| true),
      produce: Arc::new(move |_, _| {
        Ok(vec![DigestOutput::completed(
          owned.clone(),
          Some(DigestContent::text(format!("{} output", owned))),
        )])
      }),
      calls: Arc::new(AtomicUsize::new(0)),
      gate: None,
    }
  }

  pub fn outputs(mut self, outputs: &[&str]) -> Self {
    self.outputs = outputs.iter().map(|s| s.to_string()).collect();
    self
  }

  pub fn applies_when(mut self, f: impl Fn(&FileDescriptor) -> bool + Send + Sync + 'static) -> Self {
    self.applies = Arc::new(f);
    self
  }

  pub fn produces(
    mut self,
    f: impl Fn(&FileDescriptor, &DigestRecords) -> Result<Vec<DigestOutput>, DigestError> + Send + Sync + 'static,
  ) -> Self {
    self.produce = Arc::new(f);
    self
  }

  /// Always raise
  pub fn failing(self, message: &'static str) -> Self {
    self.produces(move |_, _| Err(DigestError::Extraction(message.to_string())))
  }

  pub fn gated(mut self, gate: Arc<Gate>) -> Self {
    self.gate = Some(gate);
    self
  }

  /// Shared counter of `produce` invocations
  pub fn calls(&self) -> Arc<AtomicUsize> {
    self.calls.clone()
  }
}

#[async_trait]
impl Digester for Scripted {
  fn name(&self) -> &str {
    &self.name
  }

  fn output_names(&self) -> Vec<String> {
    self.outputs.clone()
  }

  fn can_apply(&self, file: &FileDescriptor) -> bool {
    (self.applies)(file)
  }

  async fn produce(&self, file: &FileDescriptor, records: &DigestRecords) -> Result<Vec<DigestOutput>, DigestError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(gate) = &self.gate {
      gate.entered.notify_one();
      gate.release.notified().await;
    }
    (self.produce)(file, records)
  }
}

// ============================================================================
// Lock spy
// ============================================================================

/// In-memory locks that count acquisition attempts
pub struct SpyLocks {
  inner: MemoryLockManager,
  pub attempts: AtomicUsize,
  pub acquired: AtomicUsize,
  pub rejected: AtomicUsize,
}

impl SpyLocks {
  pub fn new(stale_after: Duration) -> Self {
    Self {
      inner: MemoryLockManager::new(stale_after),
      attempts: AtomicUsize::new(0),
      acquired: AtomicUsize::new(0),
      rejected: AtomicUsize::new(0),
    }
  }

  pub fn insert(&self, lock: LockInfo) {
    self.inner.insert(lock);
  }

  pub fn rejected(&self) -> usize {
    self.rejected.load(Ordering::SeqCst)
  }

  pub fn acquired(&self) -> usize {
    self.acquired.load(Ordering::SeqCst)
  }
}

impl LockManager for SpyLocks {
  fn try_acquire(&self, path: &str, owner: &str) -> Result<bool, LockError> {
    self.attempts.fetch_add(1, Ordering::SeqCst);
    let ok = self.inner.try_acquire(path, owner)?;
    if ok {
      self.acquired.fetch_add(1, Ordering::SeqCst);
    } else {
      self.rejected.fetch_add(1, Ordering::SeqCst);
    }
    Ok(ok)
  }

  fn renew(&self, path: &str, owner: &str) -> Result<bool, LockError> {
    self.inner.renew(path, owner)
  }

  fn release(&self, path: &str, owner: &str) -> Result<bool, LockError> {
    self.inner.release(path, owner)
  }

  fn info(&self, path: &str) -> Result<Option<LockInfo>, LockError> {
    self.inner.info(path)
  }

  fn list(&self) -> Result<Vec<LockInfo>, LockError> {
    self.inner.list()
  }

  fn remove_stale(&self, threshold: Duration) -> Result<Vec<String>, LockError> {
    self.inner.remove_stale(threshold)
  }

  fn stale_after(&self) -> Duration {
    self.inner.stale_after()
  }
}

/// A lock left behind `secs` ago by a holder that never came back
pub fn abandoned_lock(path: &str, secs: i64) -> LockInfo {
  let mut lock = LockInfo::new(path, "crashed-worker");
  lock.acquired_at -= chrono::Duration::seconds(secs);
  lock.updated_at = lock.acquired_at;
  lock
}
