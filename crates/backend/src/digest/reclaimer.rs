// Stale-work reclamation
//
// Recovers from crashed or killed passes without operator intervention:
// - Locks whose heartbeat stopped are deleted so the path is acquirable again
// - `in_progress` records older than the threshold go back to `todo`

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
  db::DigestStore,
  digest::{
    coordinator::Result,
    lock::{LockGuard, LockManager},
  },
  domain::digest::DigestStatus,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
  pub records_reset: usize,
  pub locks_removed: usize,
}

pub struct StaleReclaimer {
  store: Arc<dyn DigestStore>,
  locks: Arc<dyn LockManager>,
  stale_after: Duration,
  owner_id: String,
}

impl StaleReclaimer {
  pub fn new(store: Arc<dyn DigestStore>, locks: Arc<dyn LockManager>, stale_after: Duration) -> Self {
    Self {
      store,
      locks,
      stale_after,
      owner_id: format!("reclaimer-{}", std::process::id()),
    }
  }

  pub fn stale_after(&self) -> Duration {
    self.stale_after
  }

  /// One reclamation sweep
  pub async fn sweep(&self) -> Result<ReclaimReport> {
    let mut report = ReclaimReport {
      locks_removed: self.locks.remove_stale(self.stale_after)?.len(),
      ..Default::default()
    };

    let threshold = chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX);
    let Some(cutoff) = Utc::now().checked_sub_signed(threshold) else {
      return Ok(report);
    };

    for mut record in self.store.list_by_status(DigestStatus::InProgress).await? {
      if record.updated_at > cutoff {
        continue;
      }

      // A live pass still heartbeats its lock; leave its records alone
      let Some(guard) = LockGuard::acquire(self.locks.clone(), &record.path, &self.owner_id)? else {
        debug!(path = %record.path, digester = %record.digester, "Stale record under a live lock, skipping");
        continue;
      };

      // Re-read under the lock; a pass may have finished meanwhile
      if let Some(current) = self.store.get(&record.path, &record.digester).await?
        && current.status == DigestStatus::InProgress
        && current.updated_at <= cutoff
      {
        record = current;
        record.status = DigestStatus::Todo;
        record.updated_at = Utc::now();
        self.store.upsert(&record).await?;
        report.records_reset += 1;
        debug!(path = %record.path, digester = %record.digester, attempts = record.attempts, "Reset stale in-progress record");
      }
      guard.release()?;
    }

    if report.records_reset > 0 || report.locks_removed > 0 {
      info!(
        records_reset = report.records_reset,
        locks_removed = report.locks_removed,
        "Reclaimed stale work"
      );
    }
    Ok(report)
  }
}
