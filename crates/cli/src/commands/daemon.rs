//! Daemon command

use anyhow::{Context, Result};
use mylifedb::{Daemon, RuntimeConfig};
use tracing::info;

/// Start the daemon and block until ctrl-c
pub async fn cmd_daemon(runtime_config: RuntimeConfig) -> Result<()> {
  info!(foreground = runtime_config.foreground, "Starting MyLifeDB daemon");
  Daemon::new(runtime_config).run().await.context("Failed to run daemon")?;
  Ok(())
}
