mod db;
pub use db::{BlobStore, DbError, DigestDb, DigestStore, MemoryStore, StatusCounts};

pub mod digest;
pub mod domain;
pub use domain::config;

pub mod library;
pub mod scheduler;

pub mod dirs;

mod daemon;
pub use daemon::{Daemon, DaemonError, Runtime, RuntimeConfig};
