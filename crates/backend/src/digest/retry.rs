// Backoff for failed digests
//
// The coordinator never sleeps. A failed record below the attempt bound is
// picked up again by the retry sweep once its backoff has elapsed.

use std::{
  collections::BTreeSet,
  hash::{DefaultHasher, Hash, Hasher},
  time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::{
  db::{DigestStore, Result},
  domain::{
    config::RetryConfig,
    digest::{DigestRecord, DigestStatus},
  },
};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
  pub backoff_multiplier: f64,
  /// Add up to 25% jitter
  pub add_jitter: bool,
  pub max_attempts: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from_config(&RetryConfig::default(), 3)
  }
}

impl RetryPolicy {
  pub fn from_config(config: &RetryConfig, max_attempts: u32) -> Self {
    let default_multiplier = RetryConfig::default().backoff_multiplier;
    let backoff_multiplier = if config.backoff_multiplier.is_finite() && config.backoff_multiplier > 0.0 {
      config.backoff_multiplier
    } else {
      warn!(
        multiplier = config.backoff_multiplier,
        fallback = default_multiplier,
        "Invalid retry backoff multiplier, using default"
      );
      default_multiplier
    };

    Self {
      initial_backoff: Duration::from_secs(config.initial_backoff_secs),
      max_backoff: Duration::from_secs(config.max_backoff_secs),
      backoff_multiplier,
      add_jitter: config.jitter,
      max_attempts,
    }
  }

  /// Backoff after the given number of failed attempts (1-based)
  pub fn backoff_for_attempt(&self, attempts: u32, seed: u64) -> Duration {
    let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
    let cap = self.max_backoff.as_secs_f64();
    let base = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
    // NaN only comes from a hand-built policy; treat it as the cap
    let base = if base.is_nan() { cap } else { base.clamp(0.0, cap) };
    let mut backoff = Duration::from_secs_f64(base);

    if self.add_jitter {
      // Stable per record so repeated sweeps agree on the due time
      let jitter_factor = 1.0 + (unit_f64(seed) * 0.25);
      backoff = Duration::from_secs_f64(backoff.as_secs_f64() * jitter_factor);
    }

    backoff.min(self.max_backoff)
  }

  /// When a failed record becomes eligible again, `None` if it never will
  pub fn next_attempt_at(&self, record: &DigestRecord) -> Option<DateTime<Utc>> {
    if record.status != DigestStatus::Failed || record.attempts >= self.max_attempts {
      return None;
    }
    let backoff = self.backoff_for_attempt(record.attempts, record_seed(record));
    let backoff = chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::MAX);
    record.updated_at.checked_add_signed(backoff)
  }

  pub fn is_due(&self, record: &DigestRecord, now: DateTime<Utc>) -> bool {
    self.next_attempt_at(record).is_some_and(|at| at <= now)
  }

  /// Distinct paths with at least one failed record whose backoff elapsed
  pub async fn due_paths(&self, store: &dyn DigestStore, now: DateTime<Utc>) -> Result<Vec<String>> {
    let failed = store.list_by_status(DigestStatus::Failed).await?;
    let paths: BTreeSet<String> = failed
      .into_iter()
      .filter(|r| self.is_due(r, now))
      .map(|r| r.path)
      .collect();
    Ok(paths.into_iter().collect())
  }
}

fn record_seed(record: &DigestRecord) -> u64 {
  let mut hasher = DefaultHasher::new();
  record.path.hash(&mut hasher);
  record.digester.hash(&mut hasher);
  record.attempts.hash(&mut hasher);
  hasher.finish()
}

fn unit_f64(seed: u64) -> f64 {
  (seed >> 11) as f64 / (1u64 << 53) as f64
}
