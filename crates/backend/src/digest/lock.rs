// Per-path locks serializing digest passes
//
// One lock per library path, held by an owner id for the duration of a pass:
// - Lock files at <data_dir>/locks/<hash>.lock, created with O_EXCL
// - Freshness tracked by a heartbeat (`updated_at`)
// - Locks older than the staleness threshold may be reclaimed by anyone
// - Check-then-act on a lock file runs under an advisory OS lock on
//   <data_dir>/locks/locks.mutex

use std::{
  fs::{self, File, OpenOptions},
  io::Write,
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum LockError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
  #[error("Lock file corrupted: {0}")]
  CorruptedLock(String),
}

/// Lock contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
  pub path: String,
  pub owner_id: String,
  pub acquired_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub pid: u32,
}

impl LockInfo {
  pub fn new(path: &str, owner_id: &str) -> Self {
    let now = Utc::now();
    Self {
      path: path.to_string(),
      owner_id: owner_id.to_string(),
      acquired_at: now,
      updated_at: now,
      pid: std::process::id(),
    }
  }

  pub fn age(&self) -> Duration {
    (Utc::now() - self.updated_at).to_std().unwrap_or_default()
  }

  pub fn is_stale(&self, threshold: Duration) -> bool {
    self.age() > threshold
  }
}

/// Cross-caller mutual exclusion per library path.
///
/// Methods are synchronous so a guard can release from `Drop`.
pub trait LockManager: Send + Sync {
  /// Take the lock for `owner`. Returns false while a fresh lock is held by
  /// someone else. Re-acquiring an owned lock renews it.
  fn try_acquire(&self, path: &str, owner: &str) -> Result<bool, LockError>;

  /// Refresh the heartbeat. Returns false if `owner` no longer holds the lock.
  fn renew(&self, path: &str, owner: &str) -> Result<bool, LockError>;

  /// Drop the lock if `owner` holds it. Returns whether anything was removed.
  fn release(&self, path: &str, owner: &str) -> Result<bool, LockError>;

  fn info(&self, path: &str) -> Result<Option<LockInfo>, LockError>;

  fn list(&self) -> Result<Vec<LockInfo>, LockError>;

  /// Delete every lock older than `threshold`, returning the freed paths
  fn remove_stale(&self, threshold: Duration) -> Result<Vec<String>, LockError>;

  /// Threshold after which `try_acquire` reclaims a lock
  fn stale_after(&self) -> Duration;

  /// Whether a fresh lock is currently held by anyone
  fn is_held(&self, path: &str) -> Result<bool, LockError> {
    Ok(
      self
        .info(path)?
        .map(|l| !l.is_stale(self.stale_after()))
        .unwrap_or(false),
    )
  }
}

// ============================================================================
// Lock guard
// ============================================================================

/// Holds a path lock until dropped
pub struct LockGuard {
  locks: Arc<dyn LockManager>,
  path: String,
  owner: String,
  released: bool,
}

impl LockGuard {
  /// Try to take the lock; `None` means another owner holds it
  pub fn acquire(locks: Arc<dyn LockManager>, path: &str, owner: &str) -> Result<Option<Self>, LockError> {
    if !locks.try_acquire(path, owner)? {
      return Ok(None);
    }
    Ok(Some(Self {
      locks,
      path: path.to_string(),
      owner: owner.to_string(),
      released: false,
    }))
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn owner(&self) -> &str {
    &self.owner
  }

  pub fn release(mut self) -> Result<(), LockError> {
    self.released = true;
    self.locks.release(&self.path, &self.owner)?;
    Ok(())
  }
}

impl Drop for LockGuard {
  fn drop(&mut self) {
    if self.released {
      return;
    }
    if let Err(e) = self.locks.release(&self.path, &self.owner) {
      warn!(path = %self.path, owner = %self.owner, err = %e, "Failed to release path lock");
    }
  }
}

// ============================================================================
// File-backed locks
// ============================================================================

const MUTEX_FILE: &str = "locks.mutex";

/// Lock files shared by every process using the same data directory
pub struct FileLockManager {
  locks_dir: PathBuf,
  stale_after: Duration,
}

/// Advisory OS lock on `<locks_dir>/locks.mutex`, held while a lock file is
/// inspected and changed. Closing the handle releases it, so a crashed holder
/// never wedges the directory.
struct CriticalSection {
  _file: File,
}

impl FileLockManager {
  /// Locks under `<data_dir>/locks`
  pub fn open(data_dir: &Path, stale_after: Duration) -> Self {
    Self::with_locks_dir(data_dir.join("locks"), stale_after)
  }

  pub fn with_locks_dir(locks_dir: PathBuf, stale_after: Duration) -> Self {
    Self { locks_dir, stale_after }
  }

  pub fn locks_dir(&self) -> &Path {
    &self.locks_dir
  }

  /// Get the lock file path for a library path
  pub fn lock_path(&self, path: &str) -> PathBuf {
    self.locks_dir.join(format!("{}.lock", path_hash(path)))
  }

  /// Enter the directory-wide critical section.
  ///
  /// Every read-compare-write on a lock file happens inside one, so a release
  /// can never delete a lock installed by a takeover, and a takeover can never
  /// remove a lock that was renewed after it was judged stale.
  fn critical(&self) -> Result<CriticalSection, LockError> {
    fs::create_dir_all(&self.locks_dir)?;
    let file = OpenOptions::new()
      .create(true)
      .truncate(false)
      .write(true)
      .open(self.locks_dir.join(MUTEX_FILE))?;
    file.lock()?;
    Ok(CriticalSection { _file: file })
  }

  fn read_lock(&self, lock_path: &Path) -> Result<LockInfo, LockError> {
    let content = fs::read_to_string(lock_path)?;
    serde_json::from_str(&content).map_err(|e| LockError::CorruptedLock(e.to_string()))
  }

  /// Write the lock only if no lock file exists
  fn create_lock(&self, lock_path: &Path, lock: &LockInfo) -> Result<bool, LockError> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(lock_path) {
      Ok(f) => f,
      Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
      Err(e) => return Err(e.into()),
    };
    file.write_all(serde_json::to_string_pretty(lock)?.as_bytes())?;
    file.sync_all()?;
    Ok(true)
  }

  /// Replace an existing lock file in one rename
  fn overwrite_lock(&self, lock_path: &Path, lock: &LockInfo) -> Result<(), LockError> {
    let tmp = lock_path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, serde_json::to_string_pretty(lock)?)?;
    if let Err(e) = fs::rename(&tmp, lock_path) {
      let _ = fs::remove_file(&tmp);
      return Err(e.into());
    }
    Ok(())
  }

  /// Current lock at `lock_path` and whether it is stale, `None` if absent.
  ///
  /// An unreadable lock falls back to its mtime.
  fn inspect(&self, lock_path: &Path, threshold: Duration) -> Result<Option<(bool, Option<LockInfo>)>, LockError> {
    match self.read_lock(lock_path) {
      Ok(lock) => Ok(Some((lock.is_stale(threshold), Some(lock)))),
      Err(LockError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(LockError::CorruptedLock(reason)) => {
        let modified = match fs::metadata(lock_path) {
          Ok(meta) => meta.modified()?,
          Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
          Err(e) => return Err(e.into()),
        };
        let age = modified.elapsed().unwrap_or_default();
        debug!(lock = %lock_path.display(), reason = %reason, "Unreadable lock file");
        Ok(Some((age > threshold, None)))
      }
      Err(e) => Err(e),
    }
  }

  /// Delete a stale lock. Caller holds the critical section.
  fn remove_lock(&self, lock_path: &Path, stale: Option<&LockInfo>) -> Result<(), LockError> {
    match fs::remove_file(lock_path) {
      Ok(()) => {}
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => return Err(e.into()),
    }
    if let Some(lock) = stale {
      info!(path = %lock.path, owner = %lock.owner_id, age_secs = lock.age().as_secs(), "Reclaimed stale lock");
    }
    Ok(())
  }

  fn renew_locked(&self, lock_path: &Path, owner: &str) -> Result<bool, LockError> {
    let mut lock = match self.read_lock(lock_path) {
      Ok(lock) => lock,
      Err(LockError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
      Err(e) => return Err(e),
    };
    if lock.owner_id != owner {
      return Ok(false);
    }

    lock.updated_at = Utc::now();
    self.overwrite_lock(lock_path, &lock)?;
    Ok(true)
  }
}

impl LockManager for FileLockManager {
  fn try_acquire(&self, path: &str, owner: &str) -> Result<bool, LockError> {
    let _section = self.critical()?;
    let lock_path = self.lock_path(path);

    match self.inspect(&lock_path, self.stale_after)? {
      None => {}
      Some((_, Some(lock))) if lock.owner_id == owner => return self.renew_locked(&lock_path, owner),
      Some((false, existing)) => {
        if let Some(lock) = existing {
          debug!(path = %path, holder = %lock.owner_id, pid = lock.pid, "Path lock held");
        }
        return Ok(false);
      }
      Some((true, existing)) => self.remove_lock(&lock_path, existing.as_ref())?,
    }

    let acquired = self.create_lock(&lock_path, &LockInfo::new(path, owner))?;
    if acquired {
      debug!(path = %path, owner = %owner, "Acquired path lock");
    }
    Ok(acquired)
  }

  fn renew(&self, path: &str, owner: &str) -> Result<bool, LockError> {
    let _section = self.critical()?;
    self.renew_locked(&self.lock_path(path), owner)
  }

  fn release(&self, path: &str, owner: &str) -> Result<bool, LockError> {
    let _section = self.critical()?;
    let lock_path = self.lock_path(path);
    match self.read_lock(&lock_path) {
      Ok(lock) if lock.owner_id == owner => match fs::remove_file(&lock_path) {
        Ok(()) => {
          debug!(path = %path, owner = %owner, "Released path lock");
          Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
      },
      Ok(lock) => {
        warn!(path = %path, owner = %owner, holder = %lock.owner_id, "Not releasing lock held by another owner");
        Ok(false)
      }
      Err(LockError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(e),
    }
  }

  fn info(&self, path: &str) -> Result<Option<LockInfo>, LockError> {
    match self.read_lock(&self.lock_path(path)) {
      Ok(lock) => Ok(Some(lock)),
      Err(LockError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e),
    }
  }

  fn list(&self) -> Result<Vec<LockInfo>, LockError> {
    let entries = match fs::read_dir(&self.locks_dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
    };

    let mut locks = Vec::new();
    for entry in entries.flatten() {
      let path = entry.path();
      if path.extension().is_some_and(|e| e == "lock")
        && let Ok(lock) = self.read_lock(&path)
      {
        locks.push(lock);
      }
    }
    Ok(locks)
  }

  fn remove_stale(&self, threshold: Duration) -> Result<Vec<String>, LockError> {
    let entries = match fs::read_dir(&self.locks_dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
    };

    let mut removed = Vec::new();
    for entry in entries.flatten() {
      let lock_path = entry.path();
      if !lock_path.extension().is_some_and(|e| e == "lock") {
        continue;
      }

      // One section per file keeps acquirers from waiting on the whole sweep
      let _section = self.critical()?;
      let existing = match self.inspect(&lock_path, threshold) {
        Ok(Some((true, existing))) => existing,
        Ok(_) => continue,
        Err(e) => {
          warn!(lock = %lock_path.display(), err = %e, "Skipping unreadable lock");
          continue;
        }
      };
      self.remove_lock(&lock_path, existing.as_ref())?;
      removed.push(
        existing
          .map(|l| l.path)
          .unwrap_or_else(|| lock_path.to_string_lossy().into_owned()),
      );
    }
    Ok(removed)
  }

  fn stale_after(&self) -> Duration {
    self.stale_after
  }
}

/// Stable short hash of a library path for lock file names
fn path_hash(path: &str) -> String {
  let digest = hex::encode(Sha256::digest(path.as_bytes()));
  digest[..16].to_string()
}

// ============================================================================
// In-process locks
// ============================================================================

/// Same contract as [`FileLockManager`] within a single process
pub struct MemoryLockManager {
  locks: DashMap<String, LockInfo>,
  stale_after: Duration,
}

impl MemoryLockManager {
  pub fn new(stale_after: Duration) -> Self {
    Self {
      locks: DashMap::new(),
      stale_after,
    }
  }

  /// Install a lock as-is, e.g. one left behind by a crashed holder
  pub fn insert(&self, lock: LockInfo) {
    self.locks.insert(lock.path.clone(), lock);
  }
}

impl LockManager for MemoryLockManager {
  fn try_acquire(&self, path: &str, owner: &str) -> Result<bool, LockError> {
    match self.locks.entry(path.to_string()) {
      Entry::Occupied(mut entry) => {
        if entry.get().owner_id == owner {
          entry.get_mut().updated_at = Utc::now();
          Ok(true)
        } else if entry.get().is_stale(self.stale_after) {
          info!(path = %path, owner = %entry.get().owner_id, "Reclaimed stale lock");
          entry.insert(LockInfo::new(path, owner));
          Ok(true)
        } else {
          Ok(false)
        }
      }
      Entry::Vacant(entry) => {
        entry.insert(LockInfo::new(path, owner));
        Ok(true)
      }
    }
  }

  fn renew(&self, path: &str, owner: &str) -> Result<bool, LockError> {
    match self.locks.get_mut(path) {
      Some(mut lock) if lock.owner_id == owner => {
        lock.updated_at = Utc::now();
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  fn release(&self, path: &str, owner: &str) -> Result<bool, LockError> {
    Ok(self.locks.remove_if(path, |_, lock| lock.owner_id == owner).is_some())
  }

  fn info(&self, path: &str) -> Result<Option<LockInfo>, LockError> {
    Ok(self.locks.get(path).map(|l| l.value().clone()))
  }

  fn list(&self) -> Result<Vec<LockInfo>, LockError> {
    Ok(self.locks.iter().map(|l| l.value().clone()).collect())
  }

  fn remove_stale(&self, threshold: Duration) -> Result<Vec<String>, LockError> {
    let stale: Vec<String> = self
      .locks
      .iter()
      .filter(|l| l.is_stale(threshold))
      .map(|l| l.key().clone())
      .collect();

    let mut removed = Vec::new();
    for path in stale {
      if self.locks.remove_if(&path, |_, lock| lock.is_stale(threshold)).is_some() {
        removed.push(path);
      }
    }
    Ok(removed)
  }

  fn stale_after(&self) -> Duration {
    self.stale_after
  }
}
