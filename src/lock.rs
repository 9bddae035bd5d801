// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed distributed mutex.
//!
//! Acquisition is a single `SET key "" NX PX ttl`; release is a `DEL`. The
//! TTL is the safety net: a holder that crashes or loses its network never
//! deadlocks the cluster, Redis expires the key. That cuts both ways — pick a
//! TTL comfortably above the critical section's worst case, or call
//! [`RedisMutex::refresh`] from inside long-running sections before the lease
//! runs out.
//!
//! The reconciler uses this with the sync-check interval as the TTL, so a
//! node that dies mid-reconciliation blocks its peers for at most one tick.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::time::{sleep, Instant};

use crate::errors::CacheError;

/// Leases below this are raised to it; a shorter lease expires faster than a
/// slow Redis round-trip can be trusted to complete.
const MIN_TTL: Duration = Duration::from_secs(3);
const WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// A handle on one lock namespace. Cloning shares the connection; locks are
/// identified by `(group, key)` and live at `RedisLock:<group>:<key>`.
#[derive(Clone)]
pub struct RedisMutex {
    conn: ConnectionManager,
    group: String,
}

impl RedisMutex {
    /// Create a mutex namespace. The group keeps different subsystems'
    /// lock keys from colliding; an empty group becomes `Default`.
    pub fn new(conn: ConnectionManager, group: &str) -> Self {
        let group = group.trim();
        let group = if group.is_empty() { "Default" } else { group };
        Self {
            conn,
            group: group.to_string(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    fn redis_key(&self, key: &str) -> String {
        lock_key(&self.group, key)
    }

    async fn acquire_once(&self, redis_key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(redis_key)
            .arg("")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    /// Try to take the lock, waiting up to `wait` for the current holder to
    /// release it. Returns whether the lock was acquired; contention is a
    /// normal outcome, not an error.
    pub async fn try_lock(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<bool, CacheError> {
        let ttl = ttl.max(MIN_TTL);
        let redis_key = self.redis_key(key);

        if self.acquire_once(&redis_key, ttl).await? {
            return Ok(true);
        }

        if !wait.is_zero() {
            let deadline = Instant::now() + wait;
            loop {
                sleep(WAIT_INTERVAL).await;
                if self.acquire_once(&redis_key, ttl).await.unwrap_or(false) {
                    return Ok(true);
                }
                if Instant::now() >= deadline {
                    break;
                }
            }
        }

        Ok(false)
    }

    /// Release the lock. Releasing a lock that already expired is a no-op.
    pub async fn unlock(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Extend the lease of a held lock. Call well before the previous TTL
    /// expires — clock skew and round-trip time both eat into the margin.
    pub async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let ttl = ttl.max(MIN_TTL);
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PEXPIRE")
            .arg(self.redis_key(key))
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Full Redis key for a lock: `RedisLock:<group>:<key>`, with colons inside
/// the key replaced so they cannot fake extra layout segments.
fn lock_key(group: &str, key: &str) -> String {
    let key = key.replace(':', "-");
    let key = key.trim();
    let key = if key.is_empty() { "default" } else { key };
    format!("RedisLock:{group}:{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    // Key-shaping logic is testable without a server; acquisition semantics
    // are covered by the Redis-backed integration tests.

    #[test]
    fn test_key_layout() {
        assert_eq!(lock_key("DistdCache", "users"), "RedisLock:DistdCache:users");
    }

    #[test]
    fn test_key_sanitization() {
        assert_eq!(lock_key("DistdCache", "ns:users"), "RedisLock:DistdCache:ns-users");
        assert_eq!(lock_key("DistdCache", ""), "RedisLock:DistdCache:default");
        assert_eq!(lock_key("DistdCache", "   "), "RedisLock:DistdCache:default");
    }
}
