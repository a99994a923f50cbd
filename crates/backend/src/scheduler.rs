//! Background task scheduler for the daemon.
//!
//! Handles:
//! - Stale-work reclamation (abandoned locks and in-progress records)
//! - Retry sweep for failed digests whose backoff has elapsed
//! - Periodic library scan
//! - Log file cleanup

use std::{
  path::PathBuf,
  sync::Arc,
  time::{Duration, SystemTime},
};

use chrono::Utc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
  digest::{DigestCoordinator, ProcessOptions, ProcessOutcome, ReclaimReport, RetryPolicy, StaleReclaimer},
  dirs::LOG_FILE_NAME,
  domain::config::Config,
  library::{Library, ScanReport},
};

const LOG_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 3600);
/// Placeholder period for the scan timer when periodic scans are disabled
const IDLE_TIMER: Duration = Duration::from_secs(24 * 3600);

/// Scheduler configuration.
///
/// Periods come straight from the config sections; a zero scan interval
/// disables periodic scans.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  pub reclaim_interval: Duration,
  pub retry_interval: Duration,
  pub scan_interval: Option<Duration>,
  pub scan_concurrency: usize,
  pub log_retention_days: u64,
  /// Where rotated log files live
  pub log_dir: PathBuf,
}

impl SchedulerConfig {
  pub fn from_config(config: &Config, log_dir: PathBuf) -> Self {
    Self {
      reclaim_interval: Duration::from_secs(config.reclaim.interval_secs.max(1)),
      retry_interval: Duration::from_secs(config.retry.interval_secs.max(1)),
      scan_interval: (config.scan.interval_secs > 0).then(|| Duration::from_secs(config.scan.interval_secs)),
      scan_concurrency: config.scan.concurrency.max(1),
      log_retention_days: config.daemon.log_retention_days,
      log_dir,
    }
  }
}

pub struct Scheduler {
  coordinator: Arc<DigestCoordinator>,
  reclaimer: StaleReclaimer,
  retry: RetryPolicy,
  library: Option<Library>,
  config: SchedulerConfig,
}

impl Scheduler {
  pub fn new(
    coordinator: Arc<DigestCoordinator>,
    reclaimer: StaleReclaimer,
    retry: RetryPolicy,
    library: Option<Library>,
    config: SchedulerConfig,
  ) -> Self {
    Self {
      coordinator,
      reclaimer,
      retry,
      library,
      config,
    }
  }

  /// Run the scheduler until cancelled.
  pub async fn run(self, cancel: CancellationToken) {
    let mut reclaim_timer = interval(self.config.reclaim_interval);
    let mut retry_timer = interval(self.config.retry_interval);
    let mut scan_timer = interval(self.config.scan_interval.unwrap_or(IDLE_TIMER));
    let mut log_cleanup_timer = interval(LOG_CLEANUP_INTERVAL);
    for timer in [&mut reclaim_timer, &mut retry_timer, &mut scan_timer, &mut log_cleanup_timer] {
      timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    // Skip the immediate ticks
    reclaim_timer.tick().await;
    retry_timer.tick().await;
    scan_timer.tick().await;
    log_cleanup_timer.tick().await;

    // Recover anything a previous run left behind, then catch up on changes
    self.reclaim().await;
    if self.config.log_retention_days > 0 {
      let deleted = self.cleanup_old_logs();
      if deleted > 0 {
        info!("Cleaned up {} old log files at startup", deleted);
      }
    }
    tokio::select! {
      biased;
      _ = cancel.cancelled() => {
        info!("Scheduler cancelled during startup scan");
        return;
      }
      _ = self.scan() => {}
    }

    info!("Scheduler started");

    loop {
      tokio::select! {
          biased;

          _ = cancel.cancelled() => {
              info!("Scheduler shutting down (cancelled)");
              break;
          }

          _ = reclaim_timer.tick() => {
              self.reclaim().await;
          }

          _ = retry_timer.tick() => {
              self.retry_failed().await;
          }

          _ = scan_timer.tick(), if self.config.scan_interval.is_some() => {
              debug!("Running scheduled library scan");
              self.scan().await;
          }

          _ = log_cleanup_timer.tick() => {
              if self.config.log_retention_days > 0 {
                  let deleted = self.cleanup_old_logs();
                  if deleted > 0 {
                      info!("Cleaned up {} old log files", deleted);
                  }
              }
          }
      }
    }

    info!("Scheduler stopped");
  }

  /// Reset abandoned work so the next pass picks it up again.
  pub async fn reclaim(&self) -> Option<ReclaimReport> {
    // The reclaimer logs what it reset
    match self.reclaimer.sweep().await {
      Ok(report) => Some(report),
      Err(e) => {
        warn!(error = %e, "Reclaim sweep failed");
        None
      }
    }
  }

  /// Re-run paths holding failed digests whose backoff has elapsed.
  ///
  /// Returns how many paths were processed.
  pub async fn retry_failed(&self) -> usize {
    let paths = match self.retry.due_paths(self.coordinator.store().as_ref(), Utc::now()).await {
      Ok(paths) => paths,
      Err(e) => {
        warn!(error = %e, "Failed to list retryable digests");
        return 0;
      }
    };
    if paths.is_empty() {
      return 0;
    }

    debug!(paths = paths.len(), "Retrying failed digests");
    let mut retried = 0;
    for path in paths {
      match self.coordinator.process_path(&path, ProcessOptions::default()).await {
        Ok(ProcessOutcome::Busy) => tracing::trace!(path = %path, "Path busy, retry deferred"),
        Ok(_) => retried += 1,
        Err(e) => warn!(path = %path, error = %e, "Retry pass failed"),
      }
    }
    retried
  }

  /// Scan the library, if one is configured.
  pub async fn scan(&self) -> Option<ScanReport> {
    let library = self.library.as_ref()?;
    match library.scan(&self.coordinator, self.config.scan_concurrency).await {
      Ok(report) => Some(report),
      Err(e) => {
        warn!(error = %e, "Library scan failed");
        None
      }
    }
  }

  /// Delete rotated log files older than the retention period.
  fn cleanup_old_logs(&self) -> usize {
    let retention_secs = self.config.log_retention_days * 24 * 3600;
    let now = SystemTime::now();
    let mut deleted = 0;

    let entries = match std::fs::read_dir(&self.config.log_dir) {
      Ok(e) => e,
      Err(e) => {
        debug!("Failed to read log directory {:?}: {}", self.config.log_dir, e);
        return 0;
      }
    };

    for entry in entries.flatten() {
      let path = entry.path();
      if path.is_dir() {
        continue;
      }

      let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        continue;
      };
      if !file_name.starts_with(LOG_FILE_NAME) {
        continue;
      }

      let Some(age) = entry
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
      else {
        continue;
      };

      if age.as_secs() > retention_secs {
        if let Err(e) = std::fs::remove_file(&path) {
          warn!("Failed to delete old log file {:?}: {}", path, e);
        } else {
          debug!("Deleted old log file: {:?}", path);
          deleted += 1;
        }
      }
    }

    deleted
  }
}
