// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replication wire protocol.
//!
//! Every mutation is broadcast on a single shared pub/sub channel as a small
//! fixed record. Field names are single characters to keep the payload tight;
//! `v` is omitted on deletes. Receivers drop anything that does not parse
//! cleanly — there is no partial recovery, the reconciler repairs whatever a
//! dropped message would have delivered.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The shared pub/sub channel all caches publish invalidations on.
pub const CHANNEL: &str = "DistdCache:Channel";

/// Event source marker for changes applied by the reconciler rather than by
/// a node's `set`/`del` or a remote broadcast.
pub const SOURCE_SYNC: &str = "sync";

/// Mutation operator. Unknown operators fail deserialization, which drops
/// the whole message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Set,
    Del,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set => write!(f, "set"),
            Self::Del => write!(f, "del"),
        }
    }
}

/// One invalidation record as carried on [`CHANNEL`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeMessage {
    /// Sender client id; receivers ignore their own broadcasts.
    #[serde(rename = "c")]
    pub client_id: String,
    /// Target cache name.
    #[serde(rename = "n")]
    pub cache: String,
    #[serde(rename = "opr")]
    pub op: Op,
    #[serde(rename = "k")]
    pub key: String,
    /// Encoded value; present on `set`, omitted on `del`.
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Mutation time (epoch millis) on the originating node.
    #[serde(rename = "t")]
    pub time: i64,
}

impl ChangeMessage {
    /// Shape checks beyond what serde enforces: a message without a cache
    /// name, key, or timestamp cannot be routed or ordered.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        !self.cache.is_empty() && !self.key.is_empty() && self.time != 0
    }
}
