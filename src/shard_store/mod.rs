//! Shard store: run and shard documents with conditional writes.
//!
//! The store is the only coordination point between workers. Every shard
//! transition is a compare-and-swap against the document's current state,
//! expressed as a list of [`Precondition`]s that must all hold.
//!
//! Backends:
//! - [`InMemoryShardStore`] for tests and single-process runs
//! - [`SqliteShardStore`] for multiple processes sharing one database file

mod backend;
mod memory;
mod sqlite;

pub use backend::{Precondition, ShardStore, StoreError, StoreResult};
pub use memory::InMemoryShardStore;
pub use sqlite::SqliteShardStore;

use std::sync::Arc;

/// Type alias for a shared shard store.
pub type BoxedShardStore = Arc<dyn ShardStore>;
