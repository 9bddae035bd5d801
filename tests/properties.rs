//! Property-based tests (fuzzing) for the wire surface.
//!
//! Generates random and malformed inputs and verifies that parsing never
//! panics and that well-formed records survive a round trip intact.
//!
//! Run with: `cargo test --test properties`

use proptest::prelude::*;

use distd_cache::{ChangeMessage, Entry, Op};

// =============================================================================
// Strategies
// =============================================================================

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Set), Just(Op::Del)]
}

fn message_strategy() -> impl Strategy<Value = ChangeMessage> {
    (
        "[a-zA-Z0-9-]{1,16}",              // client id
        "[a-zA-Z0-9:_-]{1,24}",            // cache name
        op_strategy(),
        ".{1,64}",                         // key: arbitrary unicode
        proptest::option::of(".{0,128}"),  // encoded value
        1i64..=i64::MAX,
    )
        .prop_map(|(client_id, cache, op, key, value, time)| ChangeMessage {
            client_id,
            cache,
            op,
            key,
            value,
            time,
        })
}

// =============================================================================
// Fuzzing: parsing must never panic
// =============================================================================

proptest! {
    #[test]
    fn fuzz_message_from_random_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..4096)) {
        // Either parses or fails cleanly; never panics
        let _ = serde_json::from_slice::<ChangeMessage>(&bytes);
    }

    #[test]
    fn fuzz_message_from_random_strings(payload in ".*") {
        let _ = serde_json::from_str::<ChangeMessage>(&payload);
    }

    #[test]
    fn fuzz_entry_from_random_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let _ = serde_json::from_slice::<Entry<serde_json::Value>>(&bytes);
    }
}

// =============================================================================
// Round trips
// =============================================================================

proptest! {
    #[test]
    fn prop_message_round_trip(msg in message_strategy()) {
        let json = serde_json::to_string(&msg).expect("encode");
        let back: ChangeMessage = serde_json::from_str(&json).expect("decode");

        prop_assert_eq!(back.client_id, msg.client_id);
        prop_assert_eq!(back.cache, msg.cache);
        prop_assert_eq!(back.op, msg.op);
        prop_assert_eq!(back.key, msg.key);
        prop_assert_eq!(back.value, msg.value);
        prop_assert_eq!(back.time, msg.time);
    }

    #[test]
    fn prop_absent_value_stays_absent(key in ".{1,32}", time in 1i64..=i64::MAX) {
        let msg = ChangeMessage {
            client_id: "c".into(),
            cache: "n".into(),
            op: Op::Del,
            key,
            value: None,
            time,
        };
        let json = serde_json::to_string(&msg).expect("encode");
        prop_assert!(!json.contains("\"v\":"));
    }

    #[test]
    fn prop_entry_round_trip(data in proptest::option::of(".{0,64}"), time in any::<i64>()) {
        let entry = Entry { data, time };
        let json = serde_json::to_string(&entry).expect("encode");
        let back: Entry<String> = serde_json::from_str(&json).expect("decode");
        prop_assert_eq!(back, entry);
    }
}

// =============================================================================
// Validation
// =============================================================================

proptest! {
    /// Whatever else the payload contains, an empty cache name, empty key,
    /// or zero time always fails the shape check.
    #[test]
    fn prop_shape_check_rejects_missing_routing_fields(mut msg in message_strategy()) {
        msg.cache = String::new();
        prop_assert!(!msg.is_well_formed());
    }

    #[test]
    fn prop_shape_check_rejects_zero_time(mut msg in message_strategy()) {
        msg.time = 0;
        prop_assert!(!msg.is_well_formed());
    }

    #[test]
    fn prop_well_formed_messages_pass(msg in message_strategy()) {
        // The strategy only builds routable messages
        prop_assert!(msg.is_well_formed());
    }
}
