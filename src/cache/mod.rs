//! A named logical cache.
//!
//! A [`Cache`] keeps the full dataset resident in memory, partitioned into a
//! fixed number of buckets by a CRC32 of the key. Reads are local and take
//! only a bucket read-lock; writes go through the edit pipeline — Redis
//! first, then a broadcast, then the local bucket. The reconciler keeps
//! nodes convergent even when broadcasts are lost.
//!
//! Bucket count is fixed at creation and must agree across every node
//! sharing the cache name, since it determines both key routing and the
//! Redis key layout.

mod edit;
mod sync;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::warn;

use crate::bucket::Bucket;
use crate::codec::{JsonCodec, ValueCodec};
use crate::entry::{epoch_ms, CacheValue, Entry};
use crate::errors::CacheError;
use crate::manager::ManagerShared;
use crate::message::Op;
use crate::options::CacheOptions;

/// A named, replicated key-value cache over values of type `T`.
///
/// Create instances through
/// [`CacheManager::new_cache`](crate::CacheManager::new_cache); call
/// [`start`](Cache::start) before use.
pub struct Cache<T: CacheValue> {
    name: String,
    /// `DistdCache:<name>` with colons in the name replaced.
    key_prefix: String,
    /// Name of the cluster-wide reconciliation mutex.
    sync_lock_name: String,
    options: CacheOptions<T>,
    codec: Arc<dyn ValueCodec<T>>,
    buckets: Vec<RwLock<Bucket<T>>>,
    started: AtomicBool,
    pub(crate) shared: Arc<ManagerShared>,
}

impl<T: CacheValue> Cache<T> {
    pub(crate) fn new(name: &str, options: CacheOptions<T>, shared: Arc<ManagerShared>) -> Self {
        let mut options = options.normalized();
        let codec = options
            .codec
            .take()
            .unwrap_or_else(|| Arc::new(JsonCodec) as Arc<dyn ValueCodec<T>>);

        let safe_name = name.replace(':', "-");
        let buckets = (0..options.bucket_count)
            .map(|_| RwLock::new(Bucket::new()))
            .collect();

        Self {
            name: name.to_string(),
            key_prefix: format!("DistdCache:{safe_name}"),
            sync_lock_name: format!("DistdCache.{safe_name}"),
            options,
            codec,
            buckets,
            started: AtomicBool::new(false),
            shared,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning manager's client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start the cache: bring up the manager's replication machinery if
    /// needed, then run one synchronous full sync so local state matches
    /// Redis before the first read. Idempotent.
    pub async fn start(&self) -> Result<(), CacheError> {
        if self.is_started() {
            return Ok(());
        }
        Arc::clone(&self.shared).ensure_start().await?;
        self.started.store(true, Ordering::Release);

        // If something replaced the ETag hash with another type, drop it;
        // the full sync below rewrites it from scratch.
        let mut conn = self.shared.conn.clone();
        let key_type: String = redis::cmd("TYPE")
            .arg(self.etag_key())
            .query_async(&mut conn)
            .await?;
        if key_type != "none" && key_type != "hash" {
            warn!(cache = %self.name, key_type = %key_type, "server etag key has wrong type, resetting");
            let _: () = conn.del(self.etag_key()).await?;
        }

        if let Err(err) = self.sync_all().await {
            self.started.store(false, Ordering::Release);
            return Err(err);
        }
        Ok(())
    }

    /// Number of locally held entries, tombstones included.
    pub async fn size(&self) -> usize {
        let mut total = 0;
        for bucket in &self.buckets {
            total += bucket.read().await.entries.len();
        }
        total
    }

    /// Sorted snapshot of all live keys. Tombstoned keys are not listed,
    /// although [`size`](Cache::size) still counts them until GC.
    pub async fn all_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read().await;
            keys.extend(
                bucket
                    .entries
                    .iter()
                    .filter(|(_, entry)| entry.is_live())
                    .map(|(key, _)| key.clone()),
            );
        }
        keys.sort_unstable();
        keys
    }

    /// The live entry for `key`, or `None` when the key is absent or
    /// tombstoned. Purely local; takes the bucket read-lock.
    pub async fn get(&self, key: &str) -> Option<Entry<T>> {
        let bucket = self.buckets[self.bucket_index(key)].read().await;
        bucket.entries.get(key).filter(|entry| entry.is_live()).cloned()
    }

    /// The live value for `key`.
    pub async fn data(&self, key: &str) -> Option<T> {
        self.get(key).await.and_then(|entry| entry.data)
    }

    /// Snapshot of all live entries; tombstones excluded.
    pub async fn get_all(&self) -> HashMap<String, Entry<T>> {
        let mut all = HashMap::new();
        for bucket in &self.buckets {
            let bucket = bucket.read().await;
            for (key, entry) in &bucket.entries {
                if entry.is_live() {
                    all.insert(key.clone(), entry.clone());
                }
            }
        }
        all
    }

    /// Write a value: Redis hash first, then a broadcast, then the local
    /// bucket. On a Redis failure nothing changes locally.
    pub async fn set(&self, key: &str, value: T) -> Result<(), CacheError> {
        let entry = Entry::new(value, epoch_ms());
        self.do_edit(Op::Set, key, entry, &self.shared.client_id).await
    }

    /// Delete a key: removes the Redis hash field and tombstones the local
    /// entry. Deleting an absent key is a no-op that still clears Redis.
    pub async fn del(&self, key: &str) -> Result<(), CacheError> {
        let entry = Entry::tombstone(epoch_ms());
        self.do_edit(Op::Del, key, entry, &self.shared.client_id).await
    }

    /// Drop every Redis key belonging to this cache, then resynchronize all
    /// buckets (emptying the local side). Other nodes follow within two sync
    /// intervals.
    pub async fn clear(&self) -> Result<(), CacheError> {
        if !self.is_started() {
            return Err(CacheError::NotStarted(self.name.clone()));
        }

        let mut conn = self.shared.conn.clone();
        let data_keys: Vec<String> = conn.keys(format!("{}:Data:*", self.key_prefix)).await?;
        if !data_keys.is_empty() {
            let _: () = conn.del(data_keys).await?;
        }
        let _: () = conn.del(self.etag_key()).await?;

        for index in 0..self.buckets.len() {
            if let Err(err) = self.sync_bucket(index).await {
                warn!(cache = %self.name, bucket = index, error = %err, "post-clear sync failed");
                break;
            }
        }
        Ok(())
    }

    /// Synchronize every bucket from Redis immediately, instead of waiting
    /// for the next reconciliation tick. Starts the cache if needed.
    pub async fn force_sync(&self) -> Result<(), CacheError> {
        if !self.is_started() {
            return self.start().await;
        }
        self.sync_all().await
    }

    pub(crate) fn bucket_index(&self, key: &str) -> usize {
        let code = match &self.options.key_code {
            Some(key_code) => key_code(key),
            None => crc32_key_code(key),
        };
        code as usize % self.buckets.len()
    }

    pub(crate) fn bucket_data_key(&self, index: usize) -> String {
        format!("{}:Data:{:02}", self.key_prefix, index)
    }

    pub(crate) fn etag_key(&self) -> String {
        format!("{}:ETag", self.key_prefix)
    }
}

/// Default key hash: CRC32/IEEE over the key's UTF-8 bytes.
fn crc32_key_code(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_crc32_ieee_check_value() {
        // The CRC-32/IEEE reference check value
        assert_eq!(crc32_key_code("123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_key_layout() {
        let safe = "ns:users".replace(':', "-");
        assert_eq!(format!("DistdCache:{safe}:Data:{:02}", 7), "DistdCache:ns-users:Data:07");
        assert_eq!(format!("DistdCache:{safe}:Data:{:02}", 123), "DistdCache:ns-users:Data:123");
        assert_eq!(format!("DistdCache:{safe}:ETag"), "DistdCache:ns-users:ETag");
    }

    proptest! {
        /// Routing is deterministic and always lands inside the bucket range.
        #[test]
        fn prop_routing_stable_and_bounded(key in ".*", count in 1usize..4096) {
            let index = crc32_key_code(&key) as usize % count;
            let again = crc32_key_code(&key) as usize % count;
            prop_assert_eq!(index, again);
            prop_assert!(index < count);
        }
    }
}
