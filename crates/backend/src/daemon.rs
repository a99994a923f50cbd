//! Daemon lifecycle management.
//!
//! The daemon is the long-running MyLifeDB process. It wires every component
//! explicitly (no globals) and runs the scheduler until shutdown.
//!
//! # Architecture
//!
//! ```text
//! Daemon
//!   └── Scheduler (reclaim, retry, library scan, log cleanup)
//!         └── Runtime
//!               ├── DigestCoordinator (registry, cascades, store, locks, blobs)
//!               ├── StaleReclaimer
//!               └── Library
//! ```
//!
//! # Lifecycle
//!
//! 1. Load `RuntimeConfig` (creating the user config on first run)
//! 2. Open the `Runtime`: LanceDB store, lock directory, blob store
//! 3. Spawn the `Scheduler` with a child `CancellationToken`
//! 4. Wait for ctrl-c or cancellation
//! 5. Cancel and join the scheduler

use std::{path::PathBuf, sync::Arc};

use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
  db::{BlobStore, DbError, DigestDb, DigestStore},
  digest::{
    DigestCoordinator, FileLockManager, LockManager, RegistryError, RetryPolicy, StaleReclaimer,
    builtin::{default_cascades, default_registry},
  },
  dirs,
  domain::config::Config,
  library::Library,
  scheduler::{Scheduler, SchedulerConfig},
};

#[derive(Error, Debug)]
pub enum DaemonError {
  #[error("Database error: {0}")]
  Database(#[from] DbError),
  #[error("Registry error: {0}")]
  Registry(#[from] RegistryError),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

// ============================================================================
// Configuration
// ============================================================================

/// Daemon runtime configuration.
///
/// Everything needed to open the runtime, built from the config file with
/// optional overrides.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
  /// Base directory for the database, locks, blobs and logs
  pub data_dir: PathBuf,
  /// Config file the settings were read from (`None` for the user config)
  pub config_path: Option<PathBuf>,
  /// Run in foreground mode (console logging)
  pub foreground: bool,
  pub config: Config,
}

impl RuntimeConfig {
  pub async fn load(config_path: Option<PathBuf>) -> Self {
    // Auto-create user config on first run if it doesn't exist
    if config_path.is_none() {
      Self::ensure_user_config().await;
    }

    let config = Config::load(config_path.as_deref()).await;

    Self {
      data_dir: dirs::default_data_dir(),
      config_path,
      foreground: false,
      config,
    }
  }

  pub fn log_dir(&self) -> PathBuf {
    self.data_dir.join("logs")
  }

  /// Ensure user config file exists, creating it with defaults if not.
  async fn ensure_user_config() {
    let Some(user_config_path) = Config::user_config_path() else {
      return;
    };

    if user_config_path.exists() {
      return;
    }

    if let Some(parent) = user_config_path.parent()
      && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
      warn!("Failed to create config directory: {}", e);
      return;
    }

    let template = Config::generate_template();
    match tokio::fs::write(&user_config_path, &template).await {
      Ok(()) => info!("Created user config: {:?}", user_config_path),
      Err(e) => warn!("Failed to create user config: {}", e),
    }
  }
}

// ============================================================================
// Runtime
// ============================================================================

/// Fully wired pipeline components, shared by the daemon and CLI commands
pub struct Runtime {
  pub config: Config,
  pub coordinator: Arc<DigestCoordinator>,
  pub reclaimer: StaleReclaimer,
  pub retry: RetryPolicy,
  pub library: Option<Library>,
}

impl Runtime {
  /// Open the store, lock directory and blob store under `data_dir`
  pub async fn open(config: Config, data_dir: &std::path::Path) -> Result<Self, DaemonError> {
    tokio::fs::create_dir_all(data_dir).await?;

    let store: Arc<dyn DigestStore> = Arc::new(DigestDb::open(data_dir).await?);
    let stale_after = config.reclaim.stale_after();
    let locks: Arc<dyn LockManager> = Arc::new(FileLockManager::open(data_dir, stale_after));
    let blobs = BlobStore::open(data_dir);

    let mut coordinator = DigestCoordinator::new(
      store.clone(),
      locks.clone(),
      blobs,
      Arc::new(default_registry()?),
      Arc::new(default_cascades()),
    )
    .with_max_attempts(config.digest.max_attempts)
    .with_heartbeat_interval(config.digest.heartbeat_interval());

    let library = Library::from_config(&config.library);
    if let Some(library) = &library {
      coordinator = coordinator.with_library_root(library.root().to_path_buf());
    }

    let reclaimer = StaleReclaimer::new(store, locks, stale_after);
    let retry = RetryPolicy::from_config(&config.retry, config.digest.max_attempts);

    Ok(Self {
      config,
      coordinator: Arc::new(coordinator),
      reclaimer,
      retry,
      library,
    })
  }

  pub fn into_scheduler(self, log_dir: PathBuf) -> Scheduler {
    let config = SchedulerConfig::from_config(&self.config, log_dir);
    Scheduler::new(self.coordinator, self.reclaimer, self.retry, self.library, config)
  }
}

// ============================================================================
// Daemon
// ============================================================================

/// The MyLifeDB daemon - owns the runtime and the background scheduler.
pub struct Daemon {
  runtime_config: RuntimeConfig,
}

impl Daemon {
  pub fn new(runtime_config: RuntimeConfig) -> Self {
    Self { runtime_config }
  }

  /// Run until ctrl-c.
  pub async fn run(self) -> Result<(), DaemonError> {
    let cancel = CancellationToken::new();

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
      if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        return;
      }
      info!("Received ctrl-c, shutting down...");
      cancel_for_signal.cancel();
    });

    self.run_until(cancel).await
  }

  /// Run until `cancel` fires.
  pub async fn run_until(self, cancel: CancellationToken) -> Result<(), DaemonError> {
    let log_dir = self.runtime_config.log_dir();
    let RuntimeConfig {
      data_dir,
      config,
      foreground,
      ..
    } = self.runtime_config;

    info!(data_dir = %data_dir.display(), foreground, "Starting MyLifeDB daemon");
    match &config.library.root {
      Some(root) => info!(root = %root.display(), "Library root"),
      None => warn!("No library root configured, periodic scans disabled"),
    }

    let runtime = Runtime::open(config, &data_dir).await?;
    let scheduler = runtime.into_scheduler(log_dir);

    let scheduler_handle = {
      let cancel = cancel.child_token();
      tokio::spawn(async move {
        scheduler.run(cancel).await;
      })
    };
    info!("Started background scheduler");

    cancel.cancelled().await;
    info!("Shutting down...");

    if let Err(e) = scheduler_handle.await {
      warn!("Scheduler task failed: {}", e);
    }

    info!("Daemon shutdown complete");
    Ok(())
  }
}
