//! Persisted scored items and sentiment rollups.
//!
//! Raw items are kept so every rollup can be recomputed from scratch.
//! Rollups are keyed by `(bucket kind, bucket start, topic key)`; the
//! `current` snapshot is replaced wholesale on each refresh.

mod backend;
mod memory;
mod sqlite;

pub use backend::{ItemStore, RollupError, RollupResult, RollupStore};
pub use memory::InMemoryRollupStore;
pub use sqlite::SqliteRollupStore;

use std::sync::Arc;

/// Type alias for a shared rollup store.
pub type BoxedRollupStore = Arc<dyn RollupStore>;

/// Type alias for a shared item store.
pub type BoxedItemStore = Arc<dyn ItemStore>;
