//! CLI command implementations

mod admin;
mod daemon;
mod digest;

pub use admin::{cmd_config_init, cmd_config_show, cmd_stats};
pub use daemon::cmd_daemon;
pub use digest::{cmd_process, cmd_reclaim, cmd_rename, cmd_reset, cmd_scan, cmd_status};
