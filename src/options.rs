// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-cache options.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::ValueCodec;
use crate::entry::Entry;
use crate::message::Op;

pub(crate) const DEFAULT_BUCKET_COUNT: usize = 100;
pub(crate) const MAX_BUCKET_COUNT: usize = 4096;

/// Change-event callback.
///
/// Invoked off the replication path (from the notification worker) for every
/// observable state change. `source` is the originating client id, or the
/// literal `"sync"` when the reconciler applied the change.
pub type OnChange<T> = Arc<dyn Fn(Op, &str, &Entry<T>, &str) + Send + Sync>;

/// Override for the key hash; the bucket index is `key_code(key) % bucket_count`.
pub type KeyCode = Arc<dyn Fn(&str) -> u32 + Send + Sync>;

/// Options for one named cache. Fixed at creation; a second `new_cache` call
/// with the same name returns the existing instance and ignores these.
pub struct CacheOptions<T> {
    /// Number of buckets the keyspace is partitioned into (default 100,
    /// capped at 4096). Must agree across all nodes sharing the cache.
    pub bucket_count: usize,
    /// Optional TTL applied to the Redis bucket hashes after every write.
    pub expire: Option<Duration>,
    pub(crate) on_change: Option<OnChange<T>>,
    pub(crate) key_code: Option<KeyCode>,
    pub(crate) codec: Option<Arc<dyn ValueCodec<T>>>,
}

impl<T> CacheOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket_count(mut self, count: usize) -> Self {
        self.bucket_count = count;
        self
    }

    pub fn expire(mut self, ttl: Duration) -> Self {
        self.expire = Some(ttl);
        self
    }

    /// Register a change-event callback. Callbacks run on the notification
    /// worker; a slow or panicking callback never blocks replication.
    pub fn on_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(Op, &str, &Entry<T>, &str) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(callback));
        self
    }

    /// Replace the default CRC32/IEEE key hash.
    pub fn key_code<F>(mut self, hash: F) -> Self
    where
        F: Fn(&str) -> u32 + Send + Sync + 'static,
    {
        self.key_code = Some(Arc::new(hash));
        self
    }

    /// Replace the default JSON value codec.
    pub fn codec(mut self, codec: impl ValueCodec<T> + 'static) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    pub(crate) fn normalized(mut self) -> Self {
        if self.bucket_count == 0 {
            self.bucket_count = DEFAULT_BUCKET_COUNT;
        } else if self.bucket_count > MAX_BUCKET_COUNT {
            self.bucket_count = MAX_BUCKET_COUNT;
        }
        self
    }
}

impl<T> Default for CacheOptions<T> {
    fn default() -> Self {
        Self {
            bucket_count: DEFAULT_BUCKET_COUNT,
            expire: None,
            on_change: None,
            key_code: None,
            codec: None,
        }
    }
}

impl<T> Clone for CacheOptions<T> {
    fn clone(&self) -> Self {
        Self {
            bucket_count: self.bucket_count,
            expire: self.expire,
            on_change: self.on_change.clone(),
            key_code: self.key_code.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<T> fmt::Debug for CacheOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("bucket_count", &self.bucket_count)
            .field("expire", &self.expire)
            .field("on_change", &self.on_change.is_some())
            .field("key_code", &self.key_code.is_some())
            .field("codec", &self.codec.is_some())
            .finish()
    }
}
