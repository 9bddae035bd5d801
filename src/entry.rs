//! Cache entry: a value plus the wall-clock time of its last mutation.
//!
//! The [`Entry`] is both the in-memory representation and the wire form: the
//! JSON `{"data": …, "time": …}` stored in Redis bucket hash fields. `data`
//! is omitted when absent, which marks a **tombstone** — a deleted key kept
//! around for roughly two sync periods so late-arriving messages can still be
//! ordered against the deletion.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Bounds a cache value type must satisfy.
///
/// `PartialEq` backs the deep-equality comparison that suppresses no-op
/// change events; `Serialize`/`DeserializeOwned` back the default JSON codec
/// and the ETag input.
pub trait CacheValue:
    Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
}

impl<T> CacheValue for T where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
}

/// One cached value with its last-modified timestamp (epoch millis).
///
/// `data: None` is a tombstone. Timestamps come from the originating node's
/// wall clock; the protocol assumes cluster clocks agree to within a fraction
/// of the sync interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default)]
    pub time: i64,
}

impl<T> Entry<T> {
    /// A live entry stamped with the given mutation time.
    pub fn new(data: T, time: i64) -> Self {
        Self { data: Some(data), time }
    }

    /// A tombstone recording when the key was deleted.
    pub fn tombstone(time: i64) -> Self {
        Self { data: None, time }
    }

    /// Whether the entry carries a value (i.e. is not a tombstone).
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.data.is_some()
    }
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_entry_wire_format() {
        let entry = Entry::new("v1".to_string(), 1000);
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"data":"v1","time":1000}"#);

        let back: Entry<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
        assert!(back.is_live());
    }

    #[test]
    fn test_tombstone_omits_data() {
        let entry: Entry<String> = Entry::tombstone(2000);
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"time":2000}"#);

        let back: Entry<String> = serde_json::from_str(&json).unwrap();
        assert!(!back.is_live());
        assert_eq!(back.time, 2000);
    }

    #[test]
    fn test_struct_values_round_trip() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
        struct User {
            name: String,
            age: u32,
        }

        let entry = Entry::new(User { name: "alice".into(), age: 30 }, 1234);
        let json = serde_json::to_string(&entry).unwrap();
        let back: Entry<User> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_epoch_ms_is_sane() {
        // 2020-01-01 in millis; anything earlier means a broken clock source
        assert!(epoch_ms() > 1_577_836_800_000);
    }
}
