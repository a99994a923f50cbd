mod blobs;
mod connection;
mod digests;
mod in_memory;
mod schema;
mod store;

pub(crate) use connection::Result;
pub use blobs::BlobStore;
pub use connection::{DbError, DigestDb};
pub use in_memory::MemoryStore;
pub use store::{DigestStore, StatusCounts};
