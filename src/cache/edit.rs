// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The edit pipeline — every mutation funnels through [`Cache::do_edit`],
//! whether it came from a local `set`/`del`, a remote broadcast, or the
//! reconciler.

use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::entry::{CacheValue, Entry};
use crate::errors::CacheError;
use crate::manager::Notification;
use crate::message::{ChangeMessage, Op, CHANNEL, SOURCE_SYNC};
use crate::metrics;

use super::Cache;

impl<T: CacheValue> Cache<T> {
    /// Apply one mutation.
    ///
    /// `source` identifies the origin: this node's client id (a local
    /// `set`/`del`, which also persists and broadcasts), a remote node's
    /// client id (a pub/sub message, subject to the freshness filter), or
    /// [`SOURCE_SYNC`] (the reconciler, which bypasses both).
    pub(crate) async fn do_edit(
        &self,
        op: Op,
        key: &str,
        incoming: Entry<T>,
        source: &str,
    ) -> Result<(), CacheError> {
        if !self.is_started() {
            return Err(CacheError::NotStarted(self.name().to_string()));
        }

        let index = self.bucket_index(key);
        let is_local = source == self.shared.client_id;

        // Freshness filter: a remote message older than what we already hold
        // lost the race. Equal timestamps apply — last writer wins the tie.
        if !is_local && source != SOURCE_SYNC {
            let bucket = self.buckets[index].read().await;
            if let Some(local) = bucket.entries.get(key) {
                if incoming.time < local.time {
                    debug!(cache = %self.name(), key, "stale remote message filtered");
                    return Ok(());
                }
            }
        }

        if is_local {
            self.persist_and_broadcast(op, key, &incoming, index).await?;
        }

        let reported = {
            let mut bucket = self.buckets[index].write().await;
            bucket.apply(op, key, &incoming)
        };

        if let Some(entry) = reported {
            let source_kind = if is_local {
                "local"
            } else if source == SOURCE_SYNC {
                "sync"
            } else {
                "remote"
            };
            metrics::record_edit(self.name(), &op.to_string(), source_kind);
            self.emit_change(op, key, entry, source);
        }
        Ok(())
    }

    /// Redis write plus broadcast, for locally originated mutations only.
    ///
    /// The broadcast goes out before the local apply: Redis already holds the
    /// new value at that point, so a remote node racing a read against the
    /// message can only see data at least as fresh as the broadcast.
    async fn persist_and_broadcast(
        &self,
        op: Op,
        key: &str,
        entry: &Entry<T>,
        index: usize,
    ) -> Result<(), CacheError> {
        let data_key = self.bucket_data_key(index);
        let mut conn = self.shared.conn.clone();

        let encoded = match (op, entry.data.as_ref()) {
            (Op::Set, Some(data)) => Some(self.codec.encode(data)?),
            _ => None,
        };

        match (op, encoded.as_deref()) {
            (Op::Set, Some(encoded)) => {
                // Hash field value is `{"data":…,"time":…}` with the codec
                // output embedded as the data value.
                let data_value: serde_json::Value = serde_json::from_str(encoded)?;
                let payload = serde_json::to_string(&Entry {
                    data: Some(data_value),
                    time: entry.time,
                })?;
                let _: () = conn.hset(&data_key, key, payload).await?;
            }
            _ => {
                let _: () = conn.hdel(&data_key, key).await?;
            }
        }

        if let Some(ttl) = self.options.expire {
            if let Err(err) = conn.expire::<_, ()>(&data_key, ttl.as_secs() as i64).await {
                warn!(cache = %self.name(), key = %data_key, error = %err, "failed to set bucket TTL");
            }
        }

        let message = ChangeMessage {
            client_id: self.shared.client_id.clone(),
            cache: self.name().to_string(),
            op,
            key: key.to_string(),
            value: encoded,
            time: entry.time,
        };
        let payload = serde_json::to_string(&message)?;
        if let Err(err) = conn.publish::<_, _, ()>(CHANNEL, payload).await {
            // Not surfaced: Redis already has the value, so the reconciler
            // delivers this change to any node that misses the broadcast.
            metrics::record_publish_failure(self.name());
            warn!(cache = %self.name(), key, error = %err, "publish failed; reconciler will repair");
        }

        Ok(())
    }

    /// Queue an `on_change` invocation; never calls the callback inline.
    pub(crate) fn emit_change(&self, op: Op, key: &str, entry: Entry<T>, source: &str) {
        let Some(callback) = self.options.on_change.clone() else {
            return;
        };
        let key = key.to_string();
        let source = source.to_string();
        let job: Notification = Box::new(move || callback(op, &key, &entry, &source));
        if !self.shared.enqueue_notification(job) {
            metrics::record_queue_drop("notify");
            warn!(cache = %self.name(), "change notification dropped");
        }
    }
}
