//! End-to-end tests of the default middleware stack

use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wirelink_core::{
    Batch, BatchHandler, BatchingConfig, BatchingMiddleware, CompressionMiddleware,
    DeduplicationMiddleware, FlushReason, LogLevel, LoggingMiddleware, Message, MiddlewareChain,
    Priority, RateLimitMiddleware, TransformConfig, TransformMiddleware,
};

use test_utils::{incoming, TestClock};

fn batch_sink() -> (BatchHandler, Arc<Mutex<Vec<Batch>>>) {
    let batches: Arc<Mutex<Vec<Batch>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    let handler: BatchHandler = Arc::new(move |batch: Batch| sink.lock().push(batch));
    (handler, batches)
}

#[tokio::test(start_paused = true)]
async fn two_notifications_flush_together_after_max_wait() {
    let clock = TestClock::at(0);
    let (handler, batches) = batch_sink();
    let batching = BatchingMiddleware::new(
        &BatchingConfig {
            max_size: 3,
            max_wait_ms: 100,
        },
        clock.shared(),
    )
    .with_handler(handler);

    let mut chain = MiddlewareChain::new();
    chain.add(Box::new(DeduplicationMiddleware::default()));
    chain.add(Box::new(batching));

    assert!(chain.process_incoming(incoming("notification", "n1", 1)).is_none());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(chain.process_incoming(incoming("notification", "n2", 2)).is_none());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(batches.lock().is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let delivered = batches.lock();
    assert_eq!(delivered.len(), 1);

    let batch = &delivered[0];
    assert_eq!(batch.reason, FlushReason::Timeout);
    assert_eq!(batch.key.priority, Priority::Low);
    let ids: Vec<&str> = batch.messages.iter().filter_map(|m| m.id.as_deref()).collect();
    assert_eq!(ids, ["n1", "n2"]);
}

#[test]
fn default_stack_round_trip() {
    let clock = TestClock::at(1_000);
    let mut sender = MiddlewareChain::new();
    sender.add(Box::new(CompressionMiddleware::default()));
    sender.add(Box::new(TransformMiddleware::new(
        TransformConfig::default(),
        clock.shared(),
    )));
    sender.add(Box::new(RateLimitMiddleware::new(
        100,
        Duration::from_secs(1),
        clock.shared(),
    )));
    sender.add(Box::new(LoggingMiddleware::new(LogLevel::Debug)));

    let mut receiver = MiddlewareChain::new();
    receiver.add(Box::new(CompressionMiddleware::default()));
    receiver.add(Box::new(TransformMiddleware::new(
        TransformConfig::default(),
        clock.shared(),
    )));
    receiver.add(Box::new(DeduplicationMiddleware::default()));

    let payload = json!({ "body": "x".repeat(4_096) });
    let wire = sender
        .process_outgoing(Message::new("document_change", payload.clone()))
        .unwrap();
    assert!(wire.metadata_flag("compressed"));

    let raw = wire.encode().unwrap();
    let decoded = Message::decode(&raw).unwrap();
    let delivered = receiver.process_incoming(decoded.clone()).unwrap();

    assert_eq!(delivered.data, Some(payload));
    assert_eq!(delivered.version.as_deref(), Some("1.0"));
    assert!(delivered.metadata.contains_key("clientReceived"));
    assert!(!delivered.metadata.contains_key("compressed"));

    // The same frame again is a duplicate
    assert!(receiver.process_incoming(decoded).is_none());
}

#[test]
fn rate_limited_sends_are_dropped_not_errors() {
    let clock = TestClock::at(0);
    let mut chain = MiddlewareChain::new();
    chain.add(Box::new(RateLimitMiddleware::new(
        2,
        Duration::from_millis(500),
        clock.shared(),
    )));

    let results: Vec<bool> = (0..4)
        .map(|_| {
            chain
                .process_outgoing(Message::new("notification", json!({})))
                .is_some()
        })
        .collect();
    assert_eq!(results, [true, true, false, false]);

    clock.advance(500);
    assert!(chain
        .process_outgoing(Message::new("notification", json!({})))
        .is_some());

    let stats = chain.stats();
    assert_eq!(stats[0].1.dropped, 2);
}
