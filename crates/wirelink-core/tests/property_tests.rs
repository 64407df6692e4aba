//! Property-based tests for compression, backoff and deduplication

use proptest::prelude::*;
use serde_json::{json, Value};
use wirelink_core::middleware::compression::COMPRESSION_THRESHOLD;
use wirelink_core::middleware::deduplication::BoundedFifoSet;
use wirelink_core::{
    CompressionMiddleware, DeduplicationMiddleware, Message, MessageMiddleware, ReconnectConfig,
    ReconnectPolicy,
};

use test_utils::incoming;

/// Generate arbitrary JSON payloads of mixed shape and size
fn arb_payload() -> impl Strategy<Value = Value> {
    (
        prop::string::string_regex("[a-zA-Z0-9 <>/é中]{0,3000}").unwrap(),
        prop::collection::vec(any::<i64>(), 0..200),
        any::<bool>(),
    )
        .prop_map(|(text, numbers, flag)| json!({ "text": text, "numbers": numbers, "flag": flag }))
}

fn arb_reconnect_config() -> impl Strategy<Value = ReconnectConfig> {
    (1u64..5_000, 1u64..120_000, 1.0f64..4.0).prop_map(|(initial, extra, factor)| {
        ReconnectConfig {
            enabled: true,
            max_attempts: 20,
            initial_delay_ms: initial,
            max_delay_ms: initial + extra,
            backoff_factor: factor,
            jitter: false,
            jitter_factor: 0.0,
        }
    })
}

proptest! {
    /// Property: decompress(compress(m)) == m for every payload
    #[test]
    fn compression_round_trip(payload in arb_payload()) {
        let mut compression = CompressionMiddleware::default();
        let original = Message::new("document_change", payload).with_id("p");

        let wire = compression.outgoing(original.clone()).unwrap().unwrap();
        prop_assert_eq!(
            wire.metadata_flag("compressed"),
            original.payload_size() > COMPRESSION_THRESHOLD
        );

        let restored = compression.incoming(wire).unwrap().unwrap();
        prop_assert_eq!(restored, original);
    }

    /// Property: backoff delays never decrease and never exceed the cap
    #[test]
    fn backoff_is_monotonic(config in arb_reconnect_config()) {
        let max = config.max_delay_ms;
        let policy = ReconnectPolicy::new(config);

        let mut previous = 0;
        for attempt in 0..30 {
            let delay = policy.base_delay(attempt).as_millis() as u64;
            prop_assert!(delay >= previous);
            prop_assert!(delay <= max);
            previous = delay;
        }
    }

    /// Property: the set keeps exactly the most recent `capacity` distinct keys
    #[test]
    fn fifo_set_keeps_newest(capacity in 1usize..50, count in 0usize..200) {
        let mut set = BoundedFifoSet::new(capacity);
        for n in 0..count {
            set.insert(n.to_string());
        }

        prop_assert_eq!(set.len(), count.min(capacity));
        for n in 0..count {
            let expected = n + capacity >= count;
            prop_assert_eq!(set.contains(&n.to_string()), expected);
        }
    }

    /// Property: a repeated message is dropped while its key is cached
    #[test]
    fn duplicate_dropped_until_evicted(capacity in 1usize..20, gap in 0usize..40) {
        let mut dedup = DeduplicationMiddleware::new(capacity);
        prop_assert!(dedup.incoming(incoming("notification", "x", 1)).unwrap().is_some());

        for n in 0..gap {
            let id = format!("filler-{}", n);
            dedup.incoming(incoming("notification", &id, 1)).unwrap();
        }

        let repeated = dedup.incoming(incoming("notification", "x", 1)).unwrap();
        prop_assert_eq!(repeated.is_none(), gap < capacity);
    }
}
