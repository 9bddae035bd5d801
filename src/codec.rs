//! The value-serialization boundary.
//!
//! A [`Cache`](crate::Cache) never assumes anything about its value type
//! beyond what [`ValueCodec`] provides: a pair of functions between the typed
//! value and the string form stored in Redis hash fields and carried in the
//! pub/sub `v` field. The default [`JsonCodec`] covers any
//! `Serialize + DeserializeOwned` type; supply a custom codec at cache
//! creation for anything else.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::CacheError;

pub trait ValueCodec<T>: Send + Sync {
    /// Encode a value into the string form shared with other nodes.
    ///
    /// The output must be valid JSON: it travels verbatim in the pub/sub
    /// message and is embedded as the `data` value of the Redis hash
    /// document. Wrap binary formats in a JSON string.
    fn encode(&self, value: &T) -> Result<String, CacheError>;

    /// Decode a value from the string form received from Redis or pub/sub.
    fn decode(&self, raw: &str) -> Result<T, CacheError>;
}

/// JSON codec via `serde_json`. Every node must agree on the codec for a
/// given cache name, since the encoded form feeds the bucket ETags.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<T> ValueCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &T) -> Result<String, CacheError> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(&self, raw: &str) -> Result<T, CacheError> {
        Ok(serde_json::from_str(raw)?)
    }
}
