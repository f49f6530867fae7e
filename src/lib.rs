//! redditmeter - Reddit emotion scoring and sentiment rollups.
//!
//! Workers claim shards of an annotation run through time-bounded leases,
//! score them with an emotion classifier and write per-attempt outputs.
//! Merged outputs feed a weighted aggregation engine whose day, week and
//! month rollups are served by a small read-only HTTP API.

pub mod aggregate;
pub mod blob;
pub mod cli;
pub mod clock;
pub mod config;
pub mod export;
pub mod lease;
pub mod models;
pub mod repository;
pub mod rollup;
pub mod rollup_store;
pub mod scoring;
pub mod server;
pub mod shard_store;
pub mod worker;
