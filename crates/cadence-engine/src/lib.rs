//! The cadence engine: a cache-first scheduler for spaced-repetition reviews.
//!
//! Reads are served from a score-ordered [`cache::CacheIndex`], rehydrated
//! lazily from the durable [`cadence_core::store::ReviewStore`] and backed by
//! a throttled degraded mode when the cache is gone. Writes update the cache
//! synchronously and reach the durable store through a retrying worker pool.
//! Background jobs reconcile the two stores and archive retired partitions.

pub mod alert;
pub mod archive;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod health;
pub mod idempotency;
pub mod partition;
pub mod pending;
pub mod queue;
pub mod ratelimit;
pub mod reconcile;
pub mod scheduler;
pub mod worker;

pub use config::EngineConfig;
pub use engine::{CacheStatus, DueItems, Engine, EngineBuilder, RebuildProgress, Submission};
pub use error::{Error, Result};

#[cfg(test)]
mod tests;
