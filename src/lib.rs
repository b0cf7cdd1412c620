//! # MeshKV - A Distributed In-Memory Key-Value Store
//!
//! MeshKV shards string keys over a fleet of storage nodes. Each node
//! keeps its slice of the key space in a sharded in-memory map,
//! journals every mutation to an append-only file for crash recovery,
//! and publishes every mutation to an AMQP fan-out exchange so
//! downstream consumers can follow the change stream.
//!
//! Nodes find each other through etcd: a node registers a leased key
//! under `/services/<name>/`, and routing clients watch that prefix,
//! holding one persistent connection per live node and electing a
//! target per request by round-robin or by consistent hash.
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!                 │              storage node                │
//!   KvClient ───▶ │  server ─▶ KvNode ─▶ ShardedStore (256)  │
//!   (pool+ring)   │               │  ├──▶ AofWriter ─▶ disk  │
//!        │        │               │  └──▶ EventBus ─▶ AMQP   │
//!        │        └───────────────┼──────────────────────────┘
//!        │                        │ register (lease)
//!        └── watch ──▶  etcd  ◀───┘
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: sharded store with lazy + active TTL expiry
//! - [`aof`]: append-only durability log and its replay
//! - [`events`]: CDC event bus and the AMQP publisher
//! - [`node`]: composition of the three planes behind Set/Get/Del
//! - [`protocol`]: length-prefixed JSON wire frames
//! - [`server`]: TCP accept loop and per-connection handlers
//! - [`registry`]: etcd registration, heartbeat, and prefix watch
//! - [`ring`]: consistent hash ring (FNV-1a, 20 virtual nodes)
//! - [`hash`]: the FNV-1a everything routes by
//! - [`client`]: routing client with pool, ring, and dispatch policies
//! - [`config`]: defaults < toml file < environment

pub mod aof;
pub mod client;
pub mod config;
pub mod events;
pub mod hash;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod ring;
pub mod server;
pub mod storage;

pub use client::{KvClient, Policy};
pub use config::Config;
pub use node::KvNode;
pub use ring::HashRing;
pub use storage::ShardedStore;

/// Version of MeshKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
