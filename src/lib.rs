//! CrabShard - Chunk Migration Engine for a Sharded Document Store
//!
//! A modern implementation of online chunk migration written in Rust:
//! a contiguous range of a sharded collection is moved from a donor
//! shard to a recipient shard while the collection keeps accepting
//! reads and writes, with an atomic ownership hand-off against the
//! cluster metadata authority.

pub mod cleanup;
pub mod config;
pub mod doc;
pub mod error;
pub mod keys;
pub mod meta;
pub mod migrate;
pub mod protocol;
pub mod repl;
pub mod routing;
pub mod runtime;
pub mod store;
pub mod telemetry;
pub mod version;

pub use config::Config;
pub use error::{MigrateError, Result};

/// CrabShard version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Process exit code used when a migration commit diverged from the
/// metadata authority and no runtime recovery is safe.
pub const EXIT_SHARDING_ERROR: i32 = 14;
