// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error type for the cache library.
//!
//! User-facing operations (`set`, `del`, `clear`, `force_sync`, `start`)
//! surface these errors. Background workers never do — they log and rely on
//! the reconciler to repair any resulting divergence.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The cache was used before `start()` completed.
    #[error("cache {0:?} is not started; call start() first")]
    NotStarted(String),

    /// A cache name was empty or whitespace.
    #[error("cache name must not be empty")]
    EmptyName,

    /// `new_cache` was called twice with the same name but a different value type.
    #[error("cache {0:?} already exists with a different value type")]
    TypeMismatch(String),

    /// Redis transport failure on a critical path. A `nil` reply is never an
    /// error — the client maps it to an empty result.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Value or wire-record (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::NotStarted("users".into());
        assert_eq!(err.to_string(), "cache \"users\" is not started; call start() first");

        let err = CacheError::TypeMismatch("users".into());
        assert!(err.to_string().contains("different value type"));
    }

    #[test]
    fn test_serde_error_converts() {
        let parse_err = serde_json::from_str::<i64>("not a number").unwrap_err();
        let err: CacheError = parse_err.into();
        assert!(matches!(err, CacheError::Serde(_)));
    }
}
