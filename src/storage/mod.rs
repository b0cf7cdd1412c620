//! Storage Layer
//!
//! A sharded, thread-safe in-memory map with TTL support and a
//! background sweeper that reclaims expired keys nobody reads.
//!
//! - **Sharded locks**: 256 shards, each behind its own `RwLock`, so
//!   handlers for different keys almost never contend.
//! - **Lazy + active expiry**: expired keys die on access, and the
//!   [`Sweeper`] mops up the ones access never reaches.

pub mod engine;
pub mod sweeper;

pub use engine::{Item, ShardedStore, StoreStats, SHARD_COUNT};
pub use sweeper::{Sweeper, SweeperConfig};
