//! MyLifeDB CLI - digest pipeline for a personal data library

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mylifedb::RuntimeConfig;

mod commands;
mod logging;

use commands::{
  cmd_config_init, cmd_config_show, cmd_daemon, cmd_process, cmd_reclaim, cmd_rename, cmd_reset, cmd_scan, cmd_stats,
  cmd_status,
};
use logging::{init_cli_logging, init_daemon_logging};

#[derive(Parser)]
#[command(name = "mylifedb")]
#[command(about = "Per-file digest pipeline for a personal data library")]
#[command(after_help = "\
QUICK START:
  mylifedb config init            # Write ~/.config/mylifedb/config.toml
  mylifedb daemon --foreground    # Scan, digest, retry and reclaim until ctrl-c

ONE-OFF COMMANDS:
  mylifedb process notes/a.md     # Run the pipeline over one file
  mylifedb status notes/a.md      # Show its digest records
  mylifedb rename a.md b.md       # Keep digests across a rename
  mylifedb scan                   # Digest the whole library once")]
struct Cli {
  /// Config file (default: user config)
  #[arg(long, global = true, value_name = "FILE")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

/// Subcommands for `mylifedb config`
#[derive(Subcommand)]
pub enum ConfigCommand {
  /// Show current effective configuration
  Show,

  /// Write the default configuration file
  #[command(long_about = "Write the commented default configuration.\n\n\
    Targets --config when given, otherwise ~/.config/mylifedb/config.toml.")]
  Init {
    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
  },
}

#[derive(Subcommand)]
enum Commands {
  /// Start the daemon
  Daemon {
    /// Log to the console instead of the rolling log file
    #[arg(long)]
    foreground: bool,
  },
  /// Run the digest pipeline over one file
  Process {
    /// Library-relative or absolute path
    path: String,
    /// Reset every digest of the file first
    #[arg(long)]
    reset: bool,
  },
  /// Show the digest records of one file
  Status {
    /// Library-relative or absolute path
    path: String,
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
  /// Reset digests of one file so they run again
  #[command(after_help = "\
EXAMPLES:
  mylifedb reset notes/a.md                    # Reset everything and re-run
  mylifedb reset notes/a.md --digester tags    # Reset one digester only")]
  Reset {
    /// Library-relative or absolute path
    path: String,
    /// Digester or output name to reset (default: all, followed by a pass)
    #[arg(long)]
    digester: Option<String>,
  },
  /// Move the digests of a renamed file instead of recomputing them
  Rename {
    /// Previous library-relative or absolute path
    from: String,
    /// New library-relative or absolute path
    to: String,
  },
  /// Scan the library once
  Scan,
  /// Reclaim abandoned locks and in-progress digests
  Reclaim,
  /// Show record counts by status
  Stats,
  /// Manage configuration
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  // Before loading, which would write the default user config itself
  if let Commands::Config {
    command: ConfigCommand::Init { force },
  } = &cli.command
  {
    init_cli_logging();
    return cmd_config_init(cli.config.as_deref(), *force).await;
  }

  let mut runtime_config = RuntimeConfig::load(cli.config.clone()).await;

  // File logging for the background daemon, console for everything else
  let _guard = match &cli.command {
    Commands::Daemon { foreground } => {
      runtime_config.foreground = *foreground;
      init_daemon_logging(&runtime_config)
    }
    _ => {
      init_cli_logging();
      None
    }
  };

  match cli.command {
    Commands::Daemon { .. } => cmd_daemon(runtime_config).await,
    Commands::Process { path, reset } => cmd_process(runtime_config, &path, reset).await,
    Commands::Status { path, json } => cmd_status(runtime_config, &path, json).await,
    Commands::Reset { path, digester } => cmd_reset(runtime_config, &path, digester.as_deref()).await,
    Commands::Rename { from, to } => cmd_rename(runtime_config, &from, &to).await,
    Commands::Scan => cmd_scan(runtime_config).await,
    Commands::Reclaim => cmd_reclaim(runtime_config).await,
    Commands::Stats => cmd_stats(runtime_config).await,
    Commands::Config { command } => match command {
      ConfigCommand::Show => cmd_config_show(runtime_config).await,
      ConfigCommand::Init { force } => cmd_config_init(cli.config.as_deref(), force).await,
    },
  }
}
