// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The reconciler — the safety net under the pub/sub fast path.
//!
//! On every manager tick each cache compares its per-bucket ETags against the
//! server hash and pulls any bucket that disagrees. A cluster-wide mutex
//! (`DistdCache.<name>`) serializes reconciliation so only one node at a time
//! writes ETags; everyone else skips the tick. Divergence from any cause —
//! dropped broadcasts, a crashed node, direct Redis tampering — heals within
//! three sync intervals.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::entry::{epoch_ms, CacheValue, Entry};
use crate::errors::CacheError;
use crate::manager::ReplicaCache;
use crate::message::{ChangeMessage, Op, SOURCE_SYNC};
use crate::metrics;

use super::Cache;

/// How long to wait on the sync mutex before conceding the tick.
const LOCK_WAIT: Duration = Duration::from_secs(3);

/// One field of the server ETag hash: `"<md5hex>-<tick-ms>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerEtag {
    pub(crate) etag: String,
    pub(crate) time: i64,
}

impl<T: CacheValue> Cache<T> {
    /// Ticker entry point: reconcile under the cluster-wide sync mutex, or
    /// skip quietly if another node is already at it.
    async fn reconcile(&self) -> Result<(), CacheError> {
        let interval = self.shared.config.sync_check_interval();
        if !self
            .shared
            .lock
            .try_lock(&self.sync_lock_name, interval, LOCK_WAIT)
            .await?
        {
            debug!(cache = %self.name(), "sync mutex held elsewhere, skipping tick");
            return Ok(());
        }

        let result = self.reconcile_buckets().await;
        if let Err(err) = self.shared.lock.unlock(&self.sync_lock_name).await {
            warn!(cache = %self.name(), error = %err, "failed to release sync mutex; TTL will");
        }
        result
    }

    async fn reconcile_buckets(&self) -> Result<(), CacheError> {
        let server = self.fetch_server_etags().await?;
        let interval_ms = self.shared.config.sync_check_interval_ms as i64;

        for index in 0..self.buckets.len() {
            let local_etag = {
                let mut bucket = self.buckets[index].write().await;
                bucket.recompute_etag(epoch_ms(), interval_ms);
                bucket.etag.clone()
            };

            match server.get(&index) {
                None if local_etag.is_empty() => continue,
                Some(remote) if remote.etag == local_etag => continue,
                remote => {
                    debug!(
                        cache = %self.name(),
                        bucket = index,
                        local = %local_etag,
                        server = ?remote.map(|r| (r.etag.as_str(), r.time)),
                        "bucket diverged"
                    );
                    self.sync_bucket(index).await?;
                }
            }
        }
        Ok(())
    }

    /// Synchronize every bucket, used by `start`, `force_sync`, and `clear`.
    /// Takes the sync mutex if it can, but proceeds regardless: only the
    /// ETag writes race, and the ETag protocol corrects those on the next
    /// mismatch.
    pub(crate) async fn sync_all(&self) -> Result<(), CacheError> {
        let interval = self.shared.config.sync_check_interval();
        let locked = self
            .shared
            .lock
            .try_lock(&self.sync_lock_name, interval, LOCK_WAIT)
            .await?;

        let mut result = Ok(());
        for index in 0..self.buckets.len() {
            if let Err(err) = self.sync_bucket(index).await {
                result = Err(err);
                break;
            }
        }

        if locked {
            if let Err(err) = self.shared.lock.unlock(&self.sync_lock_name).await {
                warn!(cache = %self.name(), error = %err, "failed to release sync mutex; TTL will");
            }
        }
        result
    }

    async fn fetch_server_etags(&self) -> Result<HashMap<usize, ServerEtag>, CacheError> {
        let mut conn = self.shared.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(self.etag_key()).await?;
        let (parsed, malformed) = parse_server_etags(&raw, self.buckets.len());
        if !malformed.is_empty() {
            warn!(
                cache = %self.name(),
                count = malformed.len(),
                "deleting malformed server etag fields"
            );
            let _: () = conn.hdel(self.etag_key(), malformed).await?;
        }
        Ok(parsed)
    }

    /// The convergence primitive: make one local bucket match the server
    /// hash, emitting `"sync"`-sourced change events for every difference,
    /// then publish the bucket's ETag.
    ///
    /// Holds the bucket write-lock for the whole pass, including the
    /// `HGETALL` — conservative, but a half-synced bucket is never visible.
    pub(crate) async fn sync_bucket(&self, index: usize) -> Result<(), CacheError> {
        metrics::record_bucket_sync(self.name());
        let now = epoch_ms();
        let interval_ms = self.shared.config.sync_check_interval_ms as i64;
        let data_key = self.bucket_data_key(index);

        let mut bucket = self.buckets[index].write().await;
        let mut conn = self.shared.conn.clone();
        let server: HashMap<String, String> = conn.hgetall(&data_key).await?;

        // Keys deleted elsewhere: live locally but gone from the server.
        for (key, entry) in bucket.entries.iter_mut() {
            if entry.data.is_some() && !server.contains_key(key) {
                entry.data = None;
                entry.time = now;
                self.emit_change(Op::Del, key, Entry::tombstone(now), SOURCE_SYNC);
            }
        }

        // Server-side entries that are new or differ from ours.
        for (key, raw) in &server {
            let wire: Entry<serde_json::Value> = match serde_json::from_str(raw) {
                Ok(wire) => wire,
                Err(err) => {
                    warn!(cache = %self.name(), key = %key, error = %err, "skipping undecodable server entry");
                    continue;
                }
            };
            let data = match wire.data {
                Some(value) => match self.codec.decode(&value.to_string()) {
                    Ok(data) => Some(data),
                    Err(err) => {
                        warn!(cache = %self.name(), key = %key, error = %err, "skipping undecodable server value");
                        continue;
                    }
                },
                None => None,
            };
            let incoming = Entry { data, time: wire.time };

            let differs = match bucket.entries.get(key) {
                None => true,
                Some(local) => local.data != incoming.data,
            };
            if differs {
                let op = if incoming.is_live() { Op::Set } else { Op::Del };
                bucket.entries.insert(key.clone(), incoming.clone());
                self.emit_change(op, key, incoming, SOURCE_SYNC);
            }
        }

        // Republish this bucket's ETag so the next comparison runs against
        // what we now hold.
        bucket.recompute_etag(now, interval_ms);
        let etag_key = self.etag_key();
        if bucket.etag.is_empty() {
            let _: () = conn.hdel(&etag_key, index.to_string()).await?;
        } else {
            let value = format!("{}-{}", bucket.etag, bucket.etag_time);
            let _: () = conn.hset(&etag_key, index.to_string(), value).await?;
        }

        Ok(())
    }
}

/// Split the raw ETag hash into well-formed entries and the field names to
/// delete. A field is malformed when its index does not parse, is out of
/// range, or its value is not `"<etag>-<time>"`.
fn parse_server_etags(
    raw: &HashMap<String, String>,
    bucket_count: usize,
) -> (HashMap<usize, ServerEtag>, Vec<String>) {
    let mut parsed = HashMap::with_capacity(raw.len());
    let mut malformed = Vec::new();

    for (field, value) in raw {
        let index = match field.parse::<usize>() {
            Ok(index) if index < bucket_count => index,
            _ => {
                malformed.push(field.clone());
                continue;
            }
        };
        let segments: Vec<&str> = value.split('-').collect();
        let (etag, time) = match segments.as_slice() {
            [etag, time] => (*etag, *time),
            _ => {
                malformed.push(field.clone());
                continue;
            }
        };
        match time.parse::<i64>() {
            Ok(time) => {
                parsed.insert(
                    index,
                    ServerEtag {
                        etag: etag.to_string(),
                        time,
                    },
                );
            }
            Err(_) => malformed.push(field.clone()),
        }
    }

    (parsed, malformed)
}

#[async_trait]
impl<T: CacheValue> ReplicaCache for Cache<T> {
    fn cache_name(&self) -> &str {
        self.name()
    }

    fn is_started(&self) -> bool {
        Cache::is_started(self)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    async fn apply_message(&self, msg: ChangeMessage) {
        let entry = match msg.op {
            Op::Set => {
                let Some(raw) = msg.value.as_deref() else {
                    metrics::record_malformed_message();
                    warn!(cache = %self.name(), key = %msg.key, "set message without value dropped");
                    return;
                };
                match self.codec.decode(raw) {
                    Ok(data) => Entry::new(data, msg.time),
                    Err(err) => {
                        metrics::record_malformed_message();
                        warn!(
                            cache = %self.name(),
                            key = %msg.key,
                            error = %err,
                            "message value failed to decode, dropped"
                        );
                        return;
                    }
                }
            }
            Op::Del => Entry::tombstone(msg.time),
        };

        if let Err(err) = self.do_edit(msg.op, &msg.key, entry, &msg.client_id).await {
            warn!(cache = %self.name(), key = %msg.key, error = %err, "remote edit failed");
        }
    }

    async fn check_sync(&self) -> Result<(), CacheError> {
        self.reconcile().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_well_formed_etags() {
        let input = raw(&[
            ("0", "d41d8cd98f00b204e9800998ecf8427e-60000"),
            ("7", "abc123-120000"),
        ]);
        let (parsed, malformed) = parse_server_etags(&input, 100);

        assert!(malformed.is_empty());
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[&0].etag, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(parsed[&0].time, 60_000);
        assert_eq!(parsed[&7].time, 120_000);
    }

    #[test]
    fn test_parse_rejects_bad_indexes() {
        let input = raw(&[
            ("not-a-number", "abc-1"),
            ("-3", "abc-1"),
            ("100", "abc-1"), // out of range for 100 buckets
            ("5", "abc-1"),
        ]);
        let (parsed, mut malformed) = parse_server_etags(&input, 100);

        malformed.sort();
        assert_eq!(malformed, vec!["-3", "100", "not-a-number"]);
        assert_eq!(parsed.len(), 1);
        assert!(parsed.contains_key(&5));
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        let input = raw(&[
            ("1", "no-separator-here-at-all"),
            ("2", "etagonly"),
            ("3", "abc-notatime"),
            ("4", "abc-42"),
        ]);
        let (parsed, mut malformed) = parse_server_etags(&input, 100);

        malformed.sort();
        assert_eq!(malformed, vec!["1", "2", "3"]);
        assert_eq!(parsed[&4], ServerEtag { etag: "abc".into(), time: 42 });
    }
}
