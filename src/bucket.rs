// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One shard of a cache: the entry map plus its ETag.
//!
//! The ETag is an MD5 over the bucket's live entries, computed only at
//! **tick boundaries** — integer multiples of the sync-check interval.
//! Entries mutated after the current tick are left out, so a node that has
//! consumed every message up to tick T digests exactly the same set as every
//! other such node, even while newer writes are still propagating. That is
//! what makes ETags comparable across nodes without first quiescing writes.
//!
//! Tombstone garbage collection piggybacks on recomputation: a tombstone
//! older than two intervals can no longer order any in-flight message and is
//! dropped.

use std::collections::HashMap;

use md5::{Digest, Md5};
use serde::Serialize;
use tracing::warn;

use crate::entry::Entry;
use crate::message::Op;

pub(crate) struct Bucket<T> {
    pub(crate) entries: HashMap<String, Entry<T>>,
    /// Hex MD5 of the live entry set at `etag_time`; empty when that set is empty.
    pub(crate) etag: String,
    /// The tick boundary the ETag was computed at (epoch millis).
    pub(crate) etag_time: i64,
}

impl<T> Bucket<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            etag: String::new(),
            etag_time: 0,
        }
    }
}

impl<T: Clone + PartialEq> Bucket<T> {
    /// Apply a mutation to the local map. Returns the entry to report to the
    /// change callback, or `None` when nothing observable changed:
    /// a `set` carrying data deep-equal to the current value, or a `del` of a
    /// key that is absent or already tombstoned.
    ///
    /// On delete, the reported entry carries the removed value with the
    /// deletion timestamp.
    pub(crate) fn apply(&mut self, op: Op, key: &str, incoming: &Entry<T>) -> Option<Entry<T>> {
        match op {
            Op::Set => match self.entries.get_mut(key) {
                None => {
                    self.entries.insert(key.to_string(), incoming.clone());
                    Some(incoming.clone())
                }
                Some(local) if local.data != incoming.data => {
                    *local = incoming.clone();
                    Some(incoming.clone())
                }
                Some(_) => None,
            },
            Op::Del => match self.entries.get_mut(key) {
                Some(local) if local.data.is_some() => {
                    let removed = local.data.take();
                    local.time = incoming.time;
                    Some(Entry {
                        data: removed,
                        time: incoming.time,
                    })
                }
                _ => None,
            },
        }
    }
}

impl<T: Serialize> Bucket<T> {
    /// Recompute the ETag if a new tick boundary has passed, collecting
    /// expired tombstones along the way. No-op within a tick. Returns whether
    /// the stored ETag changed.
    ///
    /// Callers must hold the bucket's write lock.
    pub(crate) fn recompute_etag(&mut self, now_ms: i64, interval_ms: i64) -> bool {
        let tick = (now_ms / interval_ms) * interval_ms;
        if tick == self.etag_time {
            return false;
        }

        let gc_before = now_ms - interval_ms * 2;
        let mut lines = Vec::with_capacity(self.entries.len());
        let mut expired = Vec::new();

        for (key, entry) in &self.entries {
            if entry.time > tick {
                // Not yet stable at this tick; other nodes may not have seen it.
                continue;
            }
            if entry.data.is_some() {
                match serde_json::to_string(entry) {
                    Ok(serialized) => lines.push(format!("{key}={serialized}")),
                    Err(err) => warn!(key = %key, error = %err, "entry not serializable, left out of etag"),
                }
            } else if entry.time < gc_before {
                expired.push(key.clone());
            }
        }

        for key in &expired {
            self.entries.remove(key);
        }

        let etag = if lines.is_empty() {
            String::new()
        } else {
            lines.sort_unstable();
            hex::encode(Md5::digest(lines.join("\n")))
        };

        let changed = etag != self.etag;
        self.etag = etag;
        self.etag_time = tick;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const INTERVAL: i64 = 1_000;

    fn live(data: &str, time: i64) -> Entry<String> {
        Entry::new(data.to_string(), time)
    }

    #[test]
    fn test_apply_set_insert_update_noop() {
        let mut bucket = Bucket::new();

        let reported = bucket.apply(Op::Set, "k", &live("v1", 100));
        assert_eq!(reported.unwrap().data.as_deref(), Some("v1"));

        // Same data again: suppressed, timestamp untouched
        assert!(bucket.apply(Op::Set, "k", &live("v1", 200)).is_none());
        assert_eq!(bucket.entries["k"].time, 100);

        // New data: reported
        let reported = bucket.apply(Op::Set, "k", &live("v2", 300));
        assert_eq!(reported.unwrap().data.as_deref(), Some("v2"));
        assert_eq!(bucket.entries["k"].time, 300);
    }

    #[test]
    fn test_apply_del_reports_removed_value() {
        let mut bucket = Bucket::new();
        bucket.apply(Op::Set, "k", &live("v1", 100));

        let reported = bucket.apply(Op::Del, "k", &Entry::tombstone(200)).unwrap();
        assert_eq!(reported.data.as_deref(), Some("v1"));
        assert_eq!(reported.time, 200);

        // Tombstone stays in the map until GC
        assert!(!bucket.entries["k"].is_live());

        // Deleting again, or deleting an unknown key, reports nothing
        assert!(bucket.apply(Op::Del, "k", &Entry::tombstone(300)).is_none());
        assert!(bucket.apply(Op::Del, "ghost", &Entry::tombstone(300)).is_none());
    }

    #[test]
    fn test_etag_empty_for_empty_bucket() {
        let mut bucket: Bucket<String> = Bucket::new();
        bucket.recompute_etag(10_500, INTERVAL);
        assert_eq!(bucket.etag, "");
        assert_eq!(bucket.etag_time, 10_000);
    }

    #[test]
    fn test_etag_identical_across_nodes_with_same_stable_set() {
        let mut a = Bucket::new();
        let mut b = Bucket::new();

        // Same stable entries, inserted in different orders
        a.apply(Op::Set, "x", &live("1", 9_100));
        a.apply(Op::Set, "y", &live("2", 9_200));
        b.apply(Op::Set, "y", &live("2", 9_200));
        b.apply(Op::Set, "x", &live("1", 9_100));

        // Node a also has a write from the current (unfinished) tick
        a.apply(Op::Set, "z", &live("3", 10_400));

        a.recompute_etag(10_500, INTERVAL);
        b.recompute_etag(10_500, INTERVAL);
        assert_eq!(a.etag, b.etag);
        assert!(!a.etag.is_empty());
    }

    #[test]
    fn test_etag_noop_within_same_tick() {
        let mut bucket = Bucket::new();
        bucket.apply(Op::Set, "k", &live("v", 9_000));
        assert!(bucket.recompute_etag(10_100, INTERVAL));
        let etag = bucket.etag.clone();

        // Entry arrives mid-tick; digest must not move until the next boundary
        bucket.apply(Op::Set, "k2", &live("v2", 10_200));
        assert!(!bucket.recompute_etag(10_300, INTERVAL));
        assert_eq!(bucket.etag, etag);

        assert!(bucket.recompute_etag(11_100, INTERVAL));
        assert_ne!(bucket.etag, etag);
    }

    #[test]
    fn test_etag_changes_when_data_changes() {
        let mut bucket = Bucket::new();
        bucket.apply(Op::Set, "k", &live("v1", 9_000));
        bucket.recompute_etag(10_100, INTERVAL);
        let first = bucket.etag.clone();

        bucket.apply(Op::Set, "k", &live("v2", 10_900));
        bucket.recompute_etag(11_100, INTERVAL);
        assert_ne!(bucket.etag, first);
    }

    #[test]
    fn test_tombstone_gc_after_two_intervals() {
        let mut bucket = Bucket::new();
        bucket.apply(Op::Set, "k", &live("v", 1_000));
        bucket.apply(Op::Del, "k", &Entry::tombstone(2_000));
        assert_eq!(bucket.entries.len(), 1);

        // One interval later: still inside the ordering window
        bucket.recompute_etag(3_500, INTERVAL);
        assert_eq!(bucket.entries.len(), 1);

        // Past two intervals: collected
        bucket.recompute_etag(4_500, INTERVAL);
        assert!(bucket.entries.is_empty());
        assert_eq!(bucket.etag, "");
    }

    #[test]
    fn test_tombstones_excluded_from_digest() {
        let mut with_tombstone = Bucket::new();
        with_tombstone.apply(Op::Set, "a", &live("1", 9_000));
        with_tombstone.apply(Op::Set, "b", &live("2", 9_000));
        with_tombstone.apply(Op::Del, "b", &Entry::tombstone(9_500));

        let mut without = Bucket::new();
        without.apply(Op::Set, "a", &live("1", 9_000));

        with_tombstone.recompute_etag(10_100, INTERVAL);
        without.recompute_etag(10_100, INTERVAL);
        assert_eq!(with_tombstone.etag, without.etag);
    }

    #[test]
    fn test_etag_is_md5_of_sorted_lines() {
        let mut bucket = Bucket::new();
        bucket.apply(Op::Set, "b", &live("2", 500));
        bucket.apply(Op::Set, "a", &live("1", 400));
        bucket.recompute_etag(1_100, INTERVAL);

        let expected = hex::encode(Md5::digest(
            "a={\"data\":\"1\",\"time\":400}\nb={\"data\":\"2\",\"time\":500}",
        ));
        assert_eq!(bucket.etag, expected);
    }

    proptest! {
        /// Insertion order never affects the digest.
        #[test]
        fn prop_etag_order_independent(
            mut pairs in proptest::collection::vec(("[a-z]{1,8}", "[a-z0-9]{0,16}"), 0..32),
        ) {
            let time = 5_000i64;
            let mut forward = Bucket::new();
            for (k, v) in &pairs {
                forward.apply(Op::Set, k, &live(v, time));
            }
            pairs.reverse();
            let mut backward = Bucket::new();
            for (k, v) in &pairs {
                backward.apply(Op::Set, k, &live(v, time));
            }

            forward.recompute_etag(10_500, INTERVAL);
            backward.recompute_etag(10_500, INTERVAL);
            prop_assert_eq!(forward.etag, backward.etag);
        }

        /// Entries newer than the tick never leak into the digest.
        #[test]
        fn prop_unstable_entries_excluded(offset in 1i64..INTERVAL) {
            let mut stable_only = Bucket::new();
            stable_only.apply(Op::Set, "old", &live("v", 9_000));

            let mut with_fresh = Bucket::new();
            with_fresh.apply(Op::Set, "old", &live("v", 9_000));
            with_fresh.apply(Op::Set, "fresh", &live("w", 10_000 + offset));

            stable_only.recompute_etag(10_000 + offset, INTERVAL);
            with_fresh.recompute_etag(10_000 + offset, INTERVAL);
            prop_assert_eq!(stable_only.etag, with_fresh.etag);
        }
    }
}
