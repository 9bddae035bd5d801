//! # distd-cache
//!
//! A distributed, eventually-consistent, in-memory key-value cache that
//! replicates a small working set across a cluster of long-lived processes,
//! using one shared Redis instance as both the authoritative store and the
//! transport for invalidation messages.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Write path                           │
//! │  set/del → Redis bucket hash → PUBLISH → local bucket       │
//! │          → on_change notification                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Replication fan-in                      │
//! │  • One subscriber per process on DistdCache:Channel         │
//! │  • Messages filtered by freshness (larger time wins)        │
//! │  • Bounded queues; drops repaired by the reconciler         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Reconciler                           │
//! │  • Tick-aligned MD5 ETag per bucket                         │
//! │  • Compares against the server ETag hash each interval      │
//! │  • Pulls only divergent buckets; GCs tombstones             │
//! │  • Cluster-wide Redis mutex: one reconciler at a time       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads are purely local (a bucket read-lock away); any node may write; and
//! the reconciler guarantees all nodes converge within about three sync
//! intervals even under dropped messages, crashed nodes, or direct Redis
//! tampering. Cluster clocks are assumed synchronized to within a fraction of
//! the sync interval — that is a prerequisite, not a nicety.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use distd_cache::{CacheManager, CacheOptions, ManagerConfig};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct User {
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), distd_cache::CacheError> {
//!     let manager = CacheManager::connect(
//!         Some("node-a"),
//!         "redis://localhost:6379",
//!         ManagerConfig::default(),
//!     )
//!     .await?;
//!
//!     let users = manager
//!         .new_cache::<User>(
//!             "users",
//!             CacheOptions::new().on_change(|op, key, _entry, source| {
//!                 println!("{op} {key} (from {source})");
//!             }),
//!         )
//!         .await?;
//!     users.start().await?;
//!
//!     users.set("user:1", User { name: "alice".into() }).await?;
//!     if let Some(user) = users.data("user:1").await {
//!         println!("found {user:?}");
//!     }
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Consistency model
//!
//! - Writes go to Redis first; a node that cannot reach Redis mutates nothing.
//! - Within one bucket, updates serialize under the bucket write-lock; across
//!   buckets there is no ordering.
//! - Concurrent writes to one key resolve by timestamp, ties to the later
//!   arrival; out-of-order delivery can never regress an entry.
//! - Deletes leave a tombstone for two sync intervals so late messages can
//!   still be ordered against them.
//!
//! ## Modules
//!
//! - [`manager`]: the per-process [`CacheManager`] singleton
//! - [`cache`]: the named, typed [`Cache`] and its edit/sync pipelines
//! - [`message`]: the pub/sub wire protocol
//! - [`codec`]: the value-serialization boundary
//! - [`lock`]: the Redis-backed distributed mutex
//! - [`retry`]: backoff presets for connect and reconnect

pub mod codec;
pub mod config;
pub mod entry;
pub mod errors;
pub mod lock;
pub mod message;
pub mod options;
pub mod retry;

pub mod cache;
pub mod manager;

mod bucket;
mod metrics;
mod queue;

pub use cache::Cache;
pub use codec::{JsonCodec, ValueCodec};
pub use config::ManagerConfig;
pub use entry::{CacheValue, Entry};
pub use errors::CacheError;
pub use lock::RedisMutex;
pub use manager::CacheManager;
pub use message::{ChangeMessage, Op, CHANNEL, SOURCE_SYNC};
pub use options::CacheOptions;
pub use retry::RetryConfig;
