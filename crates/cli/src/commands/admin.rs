//! Administrative commands (stats, config)

use std::path::Path;

use anyhow::{Context, Result, bail};
use mylifedb::{RuntimeConfig, config::Config, domain::digest::DigestStatus};

use super::digest::open_runtime;

/// Show record counts by status
pub async fn cmd_stats(runtime_config: RuntimeConfig) -> Result<()> {
  let data_dir = runtime_config.data_dir.clone();
  let library_root = runtime_config.config.library.root.clone();
  let runtime = open_runtime(runtime_config).await?;
  let counts = runtime
    .coordinator
    .store()
    .status_counts()
    .await
    .context("Failed to count digest records")?;

  println!("MyLifeDB Statistics");
  println!("===================\n");
  println!("Data dir:       {:?}", data_dir);
  match library_root {
    Some(root) => println!("Library:        {:?}", root),
    None => println!("Library:        (not configured)"),
  }
  println!("Files:          {}", counts.paths);
  println!("Records:        {}", counts.total);

  println!("\n--- By Status ---");
  for status in DigestStatus::ALL {
    println!("{:<15} {}", format!("{}:", status), counts.get(status));
  }

  Ok(())
}

/// Show current effective configuration
pub async fn cmd_config_show(runtime_config: RuntimeConfig) -> Result<()> {
  let path = runtime_config.config_path.clone().or_else(Config::user_config_path);

  match path {
    Some(ref path) if path.exists() => println!("Using config: {:?}", path),
    _ => println!("Using default configuration (no config file found)"),
  }
  println!();

  let toml_str = toml::to_string_pretty(&runtime_config.config)?;
  println!("{}", toml_str);

  Ok(())
}

/// Write the default configuration file
pub async fn cmd_config_init(config_path: Option<&Path>, force: bool) -> Result<()> {
  let Some(config_path) = config_path.map(Path::to_path_buf).or_else(Config::user_config_path) else {
    bail!("Could not determine user config path");
  };

  if config_path.exists() && !force {
    bail!("Config file already exists: {:?} (use --force to overwrite)", config_path);
  }

  if let Some(parent) = config_path.parent() {
    std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
  }
  std::fs::write(&config_path, Config::generate_template())
    .with_context(|| format!("Failed to write {:?}", config_path))?;

  println!("Created config: {:?}", config_path);
  println!("Set [library] root to the directory you want digested.");
  Ok(())
}
