//! Configuration system for MyLifeDB.
//!
//! Config priority: explicit path > `$CONFIG_DIR/config.toml` >
//! `$XDG_CONFIG_HOME/mylifedb/config.toml` > platform config dir.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ============================================================================
// Library Configuration
// ============================================================================

/// Where source files live and which of them the scanner picks up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
  /// Directory whose files are digested
  #[serde(skip_serializing_if = "Option::is_none")]
  pub root: Option<PathBuf>,

  /// Files larger than this are ignored by the scanner (default: 100 MiB)
  pub max_file_size: u64,

  /// Scan dot-files and dot-directories (default: false)
  pub include_hidden: bool,
}

impl Default for LibraryConfig {
  fn default() -> Self {
    Self {
      root: None,
      max_file_size: 100 * 1024 * 1024,
      include_hidden: false,
    }
  }
}

// ============================================================================
// Digest Configuration
// ============================================================================

/// Digest coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
  /// Attempts before a failure becomes permanent (default: 3)
  pub max_attempts: u32,

  /// How often a running pass renews its path lock (default: 30)
  pub heartbeat_interval_secs: u64,
}

impl Default for DigestConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      heartbeat_interval_secs: 30,
    }
  }
}

impl DigestConfig {
  pub fn heartbeat_interval(&self) -> Duration {
    Duration::from_secs(self.heartbeat_interval_secs.max(1))
  }
}

// ============================================================================
// Reclaim Configuration
// ============================================================================

/// Stale-work reclamation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
  /// Sweep period in seconds (default: 60)
  pub interval_secs: u64,

  /// Age after which in-progress records and locks count as abandoned (default: 600)
  pub stale_after_secs: u64,
}

impl Default for ReclaimConfig {
  fn default() -> Self {
    Self {
      interval_secs: 60,
      stale_after_secs: 600,
    }
  }
}

impl ReclaimConfig {
  pub fn stale_after(&self) -> Duration {
    Duration::from_secs(self.stale_after_secs)
  }
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Backoff applied before failed digests are retried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Retry sweep period in seconds (default: 60)
  pub interval_secs: u64,

  /// Backoff before the second attempt (default: 30)
  pub initial_backoff_secs: u64,

  /// Upper bound on backoff (default: 3600)
  pub max_backoff_secs: u64,

  /// Exponential factor (default: 2.0)
  pub backoff_multiplier: f64,

  /// Add up to 25% jitter (default: true)
  pub jitter: bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      interval_secs: 60,
      initial_backoff_secs: 30,
      max_backoff_secs: 3600,
      backoff_multiplier: 2.0,
      jitter: true,
    }
  }
}

// ============================================================================
// Scan Configuration
// ============================================================================

/// Periodic library scan settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
  /// Scan period in seconds, 0 disables periodic scans (default: 300)
  pub interval_secs: u64,

  /// Concurrent file passes during a scan (default: number of CPUs)
  pub concurrency: usize,
}

impl Default for ScanConfig {
  fn default() -> Self {
    Self {
      interval_secs: 300,
      concurrency: num_cpus::get(),
    }
  }
}

// ============================================================================
// Daemon Configuration
// ============================================================================

/// Daemon lifecycle and logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
  /// Default log level: off, error, warn, info, debug, trace (default: info)
  pub log_level: String,

  /// Log file rotation: daily, hourly, never (default: daily)
  pub log_rotation: String,

  /// Days to keep rotated log files, 0 keeps everything (default: 7)
  pub log_retention_days: u64,
}

impl Default for DaemonConfig {
  fn default() -> Self {
    Self {
      log_level: "info".to_string(),
      log_rotation: "daily".to_string(),
      log_retention_days: 7,
    }
  }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// MyLifeDB configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub library: LibraryConfig,
  pub digest: DigestConfig,
  pub reclaim: ReclaimConfig,
  pub retry: RetryConfig,
  pub scan: ScanConfig,
  pub daemon: DaemonConfig,
}

impl Config {
  /// Load from an explicit file, or the user config when `path` is `None`.
  ///
  /// Missing or unparsable files fall back to defaults.
  pub async fn load(path: Option<&Path>) -> Self {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => match Self::user_config_path() {
        Some(p) => p,
        None => return Self::default(),
      },
    };

    match tokio::fs::read_to_string(&path).await {
      Ok(content) => match toml::from_str(&content) {
        Ok(config) => {
          debug!(path = %path.display(), "Loaded config");
          config
        }
        Err(e) => {
          warn!(path = %path.display(), err = %e, "Invalid config file, using defaults");
          Self::default()
        }
      },
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
      Err(e) => {
        warn!(path = %path.display(), err = %e, "Failed to read config file, using defaults");
        Self::default()
      }
    }
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }

    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("mylifedb").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("mylifedb").join("config.toml"))
  }

  /// Generate a default config file as a string
  pub fn generate_template() -> String {
    let defaults = Self::default();
    format!(
      r#"# MyLifeDB Configuration
# Place in ~/.config/mylifedb/config.toml or pass --config <file>

[library]
# Directory whose files are digested
# root = "/home/me/life"
max_file_size = {max_file_size}
include_hidden = false

[digest]
# Attempts before a failed digest stays failed
max_attempts = {max_attempts}
# Lock renewal period while a file is being processed
heartbeat_interval_secs = {heartbeat}

[reclaim]
interval_secs = {reclaim_interval}
# In-progress records and locks older than this are reclaimed
stale_after_secs = {stale_after}

[retry]
interval_secs = {retry_interval}
initial_backoff_secs = {initial_backoff}
max_backoff_secs = {max_backoff}
backoff_multiplier = 2.0
jitter = true

[scan]
# 0 disables periodic scans
interval_secs = {scan_interval}
concurrency = {concurrency}

[daemon]
log_level = "info"
# daily, hourly or never
log_rotation = "daily"
log_retention_days = {retention}
"#,
      max_file_size = defaults.library.max_file_size,
      max_attempts = defaults.digest.max_attempts,
      heartbeat = defaults.digest.heartbeat_interval_secs,
      reclaim_interval = defaults.reclaim.interval_secs,
      stale_after = defaults.reclaim.stale_after_secs,
      retry_interval = defaults.retry.interval_secs,
      initial_backoff = defaults.retry.initial_backoff_secs,
      max_backoff = defaults.retry.max_backoff_secs,
      scan_interval = defaults.scan.interval_secs,
      concurrency = defaults.scan.concurrency,
      retention = defaults.daemon.log_retention_days,
    )
  }
}
