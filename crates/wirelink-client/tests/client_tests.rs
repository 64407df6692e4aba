//! Connection manager behaviour against an in-memory transport


use core::time::Duration;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use test_utils::{eventually, server_message, MockTransport};
use tokio::time::Instant;
use tokio_test::assert_ok;
use wirelink_client::{
    token_provider_fn, AuthToken, ClientBuilder, ClientErrorEvent, ConnectionStatus, Message,
    SendOutcome, WirelinkClient, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL,
};
use wirelink_core::{
    AuthConfig, AuthError, AuthTokenType, Batch, BatchingConfig, ClientConfig, FlushReason,
    HeartbeatConfig, WirelinkError,
};

const URL: &str = "ws://mock.test/socket";

fn client_with(config: ClientConfig, transport: &MockTransport) -> WirelinkClient {
    ClientBuilder::new(config)
        .with_transport(transport.clone())
        .build()
        .unwrap()
}

fn batching_client(transport: &MockTransport) -> (WirelinkClient, Arc<Mutex<Vec<Batch>>>) {
    let mut config = ClientConfig::testing(URL);
    config.middleware.batching = Some(BatchingConfig {
        max_size: 10,
        max_wait_ms: 500,
    });

    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    let client = ClientBuilder::new(config)
        .with_transport(transport.clone())
        .on_batch(move |batch| sink.lock().push(batch.clone()))
        .build()
        .unwrap();
    (client, batches)
}

fn heartbeat_config(max_missed: u32) -> ClientConfig {
    let mut config = ClientConfig::testing(URL);
    config.heartbeat = HeartbeatConfig {
        enabled: true,
        interval_ms: 1_000,
        timeout_ms: 200,
        max_missed,
    };
    config
}

// ----------------------------------------------------------------------------
// Connecting and Sending
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn messages_queued_offline_are_flushed_on_connect() {
    let transport = MockTransport::new();
    let client = client_with(ClientConfig::testing(URL), &transport);

    let outcome = client
        .send_data("notification", json!({ "text": "early" }))
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Queued);
    assert_eq!(client.queue_len().await.unwrap(), 1);

    assert_ok!(client.connect().await);
    assert_eq!(client.status(), ConnectionStatus::Connected);
    assert!(eventually(|| transport.sent_kinds() == vec!["notification"]).await);

    let outcome = client
        .send_data("presence_update", json!({ "online": true }))
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Sent);
    assert_eq!(client.queue_len().await.unwrap(), 0);

    let sent = transport.sent();
    assert!(sent.iter().all(|message| message.id.is_some() && message.timestamp.is_some()));

    let metrics = client.metrics().await.unwrap();
    assert_eq!(metrics.messages_sent, 2);
    assert_eq!(metrics.queue_depth, 0);
}

#[tokio::test(start_paused = true)]
async fn connect_while_connected_is_a_no_op() {
    let transport = MockTransport::new();
    let client = client_with(ClientConfig::testing(URL), &transport);

    assert_ok!(client.connect().await);
    assert_ok!(client.connect().await);
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn message_without_type_is_never_written() {
    let transport = MockTransport::new();
    let client = client_with(ClientConfig::testing(URL), &transport);
    assert_ok!(client.connect().await);

    let outcome = client.send(Message::new("", json!({}))).await.unwrap();
    assert_eq!(outcome, SendOutcome::Dropped);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(transport.sent().is_empty());
    assert_eq!(client.metrics().await.unwrap().messages_sent, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_write_requeues_and_reconnects() {
    let transport = MockTransport::new();
    let client = client_with(ClientConfig::testing(URL), &transport);
    assert_ok!(client.connect().await);

    transport.fail_sends(true);
    let outcome = client
        .send_data("notification", json!({ "text": "lost?" }))
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Queued);
    assert_eq!(client.status(), ConnectionStatus::Reconnecting);

    transport.fail_sends(false);
    client
        .wait_for_status(ConnectionStatus::Connected)
        .await
        .unwrap();
    assert!(eventually(|| transport.sent_kinds() == vec!["notification"]).await);
    assert_eq!(client.metrics().await.unwrap().reconnections, 1);
}

// ----------------------------------------------------------------------------
// Reconnection
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retries_back_off_then_fail() {
    let transport = MockTransport::new();
    transport.fail_opens(usize::MAX);

    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = errors.clone();
    let client = ClientBuilder::new(ClientConfig::testing(URL))
        .with_transport(transport.clone())
        .on_error(move |event| seen.lock().push(event.clone()))
        .build()
        .unwrap();

    let started = Instant::now();
    let result = client.connect().await;
    assert!(matches!(result, Err(WirelinkError::Transport(_))));
    assert_eq!(client.status(), ConnectionStatus::Reconnecting);

    let state = client
        .wait_for_status(ConnectionStatus::Failed)
        .await
        .unwrap();

    // One initial attempt plus three retries at 100ms, 200ms and 400ms
    assert_eq!(transport.open_count(), 4);
    assert!(started.elapsed() >= Duration::from_millis(700));
    assert_eq!(state.reconnect_attempts, 3);
    assert!(errors
        .lock()
        .contains(&ClientErrorEvent::RetriesExhausted { attempts: 3 }));
}

#[tokio::test(start_paused = true)]
async fn explicit_connect_after_failure_starts_over() {
    let transport = MockTransport::new();
    transport.fail_opens(4);
    let client = client_with(ClientConfig::testing(URL), &transport);

    let _ = client.connect().await;
    client
        .wait_for_status(ConnectionStatus::Failed)
        .await
        .unwrap();

    assert_ok!(client.connect().await);
    assert_eq!(client.status(), ConnectionStatus::Connected);
    assert_eq!(client.state().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn server_close_triggers_reconnect() {
    let transport = MockTransport::new();
    let client = client_with(ClientConfig::testing(URL), &transport);
    assert_ok!(client.connect().await);

    assert!(transport.drop_connection(Some(1006), "abnormal closure"));
    client
        .wait_for_status(ConnectionStatus::Reconnecting)
        .await
        .unwrap();
    client
        .wait_for_status(ConnectionStatus::Connected)
        .await
        .unwrap();

    assert_eq!(transport.open_count(), 2);
    let metrics = client.metrics().await.unwrap();
    assert_eq!(metrics.reconnections, 1);
    assert!(metrics.recent_errors.iter().all(|error| error.recovered));
}

#[tokio::test(start_paused = true)]
async fn disabled_reconnect_abandons_connection() {
    let transport = MockTransport::new();
    let mut config = ClientConfig::testing(URL);
    config.reconnect.enabled = false;
    let client = client_with(config, &transport);
    assert_ok!(client.connect().await);

    transport.drop_connection(None, "gone");
    client
        .wait_for_status(ConnectionStatus::Disconnected)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.open_count(), 1);
}

// ----------------------------------------------------------------------------
// Heartbeat
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn heartbeat_reply_updates_latency() {
    let transport = MockTransport::new();
    let client = client_with(heartbeat_config(3), &transport);
    assert_ok!(client.connect().await);

    tokio::time::sleep(Duration::from_millis(1_050)).await;
    assert_eq!(transport.sent_kinds(), vec!["heartbeat"]);
    transport.push_message(&Message::new("heartbeat_ack", json!({})));

    assert!(eventually(|| client.state().latency_ms.is_some()).await);
    assert_eq!(client.state().latency_ms, Some(50.0));
    assert_eq!(client.metrics().await.unwrap().average_latency_ms, 50.0);
}

#[tokio::test(start_paused = true)]
async fn missed_heartbeats_force_reconnect() {
    let transport = MockTransport::new();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = errors.clone();
    let client = ClientBuilder::new(heartbeat_config(1))
        .with_transport(transport.clone())
        .on_error(move |event| seen.lock().push(event.clone()))
        .build()
        .unwrap();
    assert_ok!(client.connect().await);

    client
        .wait_for_status(ConnectionStatus::Reconnecting)
        .await
        .unwrap();
    assert_eq!(
        transport.closes(),
        vec![(Some(CLOSE_HEARTBEAT_TIMEOUT), Some("heartbeat timeout".to_string()))]
    );
    assert!(errors
        .lock()
        .contains(&ClientErrorEvent::HeartbeatMissed { consecutive: 1 }));

    client
        .wait_for_status(ConnectionStatus::Connected)
        .await
        .unwrap();
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn unanswered_heartbeat_is_detected_when_timeout_exceeds_interval() {
    let transport = MockTransport::new();
    let mut config = ClientConfig::testing(URL);
    config.heartbeat = HeartbeatConfig {
        enabled: true,
        interval_ms: 1_000,
        timeout_ms: 2_500,
        max_missed: 1,
    };
    assert_ok!(config.validate());
    let client = client_with(config, &transport);
    assert_ok!(client.connect().await);

    let started = Instant::now();
    let state = tokio::time::timeout(
        Duration::from_secs(10),
        client.wait_for_status(ConnectionStatus::Reconnecting),
    )
    .await;
    assert!(state.is_ok(), "dead server was never detected");

    // Ticks while the first heartbeat is outstanding send nothing
    let heartbeats = transport
        .sent_kinds()
        .iter()
        .filter(|kind| kind.as_str() == "heartbeat")
        .count();
    assert_eq!(heartbeats, 1);
    assert!(started.elapsed() >= Duration::from_millis(3_500));
    assert_eq!(
        transport.closes(),
        vec![(Some(CLOSE_HEARTBEAT_TIMEOUT), Some("heartbeat timeout".to_string()))]
    );
}

// ----------------------------------------------------------------------------
// Incoming Messages
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn invalid_and_duplicate_messages_are_not_delivered() {
    let transport = MockTransport::new();
    let received = Arc::new(Mutex::new(Vec::<Message>::new()));
    let sink = received.clone();
    let client = ClientBuilder::new(ClientConfig::testing(URL))
        .with_transport(transport.clone())
        .on_message(move |message| sink.lock().push(message.clone()))
        .build()
        .unwrap();
    assert_ok!(client.connect().await);

    let update = server_message("workflow_update", "m-1", json!({ "step": 2 }));
    transport.push_message(&update);
    transport.push_message(&update);
    transport.push_message(&server_message("bogus_kind", "m-2", json!({})));
    transport.inject(wirelink_client::TransportEvent::Message("not json".into()));
    transport.push_message(&server_message(
        "notification",
        "m-3",
        json!({ "html": "<b>hi</b><script>alert(1)</script>", "__proto__": {} }),
    ));

    assert!(eventually(|| received.lock().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Only delivered messages count as received
    assert_eq!(client.metrics().await.unwrap().messages_received, 2);

    let received = received.lock();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].id.as_deref(), Some("m-1"));
    assert_eq!(
        received[1].data,
        Some(json!({ "html": "<b>hi</b>" }))
    );
}

#[tokio::test(start_paused = true)]
async fn batches_are_delivered_after_max_wait() {
    let transport = MockTransport::new();
    let (client, batches) = batching_client(&transport);
    assert_ok!(client.connect().await);

    transport.push_message(&server_message("notification", "n-1", json!({ "n": 1 })));
    transport.push_message(&server_message("notification", "n-2", json!({ "n": 2 })));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(batches.lock().is_empty());

    assert!(eventually(|| batches.lock().len() == 1).await);
    {
        let batches = batches.lock();
        assert_eq!(batches[0].reason, FlushReason::Timeout);
        let ids: Vec<_> = batches[0].messages.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![Some("n-1".to_string()), Some("n-2".to_string())]);
    }
    assert_eq!(client.metrics().await.unwrap().messages_received, 2);
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_does_not_stop_the_client() {
    let transport = MockTransport::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let client = ClientBuilder::new(ClientConfig::testing(URL))
        .with_transport(transport.clone())
        .on_message(|_| panic!("handler bug"))
        .on_message(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    assert_ok!(client.connect().await);

    transport.push_message(&server_message("notification", "a", json!({})));
    transport.push_message(&server_message("notification", "b", json!({})));

    assert!(eventually(|| calls.load(Ordering::SeqCst) == 2).await);
    assert_eq!(client.status(), ConnectionStatus::Connected);
}

// ----------------------------------------------------------------------------
// Server Control Messages
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn server_rate_limit_holds_sends_until_cleared() {
    let transport = MockTransport::new();
    let client = client_with(ClientConfig::testing(URL), &transport);
    assert_ok!(client.connect().await);

    transport.push_message(&Message::new("rate_limited", json!({})));
    client
        .wait_for_status(ConnectionStatus::RateLimited)
        .await
        .unwrap();

    let outcome = client
        .send_data("document_change", json!({ "doc": 7 }))
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Queued);
    assert!(transport.sent().is_empty());

    transport.push_message(&Message::new("rate_limit_cleared", json!({})));
    client
        .wait_for_status(ConnectionStatus::Connected)
        .await
        .unwrap();
    assert!(eventually(|| transport.sent_kinds() == vec!["document_change"]).await);
}

// ----------------------------------------------------------------------------
// Authentication
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn provider_failure_leaves_client_disconnected() {
    let transport = MockTransport::new();
    let mut config = ClientConfig::testing(URL);
    config.authentication = Some(AuthConfig::default());

    let client = ClientBuilder::new(config)
        .with_transport(transport.clone())
        .with_shared_token_provider(token_provider_fn(|| async {
            Err(AuthError::ProviderRejected {
                reason: "session expired".into(),
            })
        }))
        .build()
        .unwrap();

    let result = client.connect().await;
    assert!(matches!(result, Err(ref e) if e.is_auth()));
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(transport.open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn token_is_attached_and_refetched_on_auth_required() {
    let transport = MockTransport::new();
    let mut config = ClientConfig::testing(URL);
    config.authentication = Some(AuthConfig::default());

    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = fetches.clone();
    let client = ClientBuilder::new(config)
        .with_transport(transport.clone())
        .with_shared_token_provider(token_provider_fn(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(AuthToken::new(format!("token-{}", n))) }
        }))
        .build()
        .unwrap();
    assert_ok!(client.connect().await);
    assert_eq!(
        transport.requests()[0].header("authorization"),
        Some("Bearer token-1")
    );

    transport.push_message(&Message::new("auth_required", json!({ "reason": "expired" })));
    assert!(eventually(|| transport.open_count() == 2).await);
    client
        .wait_for_status(ConnectionStatus::Connected)
        .await
        .unwrap();

    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(
        transport.requests()[1].header("authorization"),
        Some("Bearer token-2")
    );
}

#[tokio::test(start_paused = true)]
async fn query_tokens_go_in_the_url() {
    let transport = MockTransport::new();
    let mut config = ClientConfig::testing(URL);
    config.authentication = Some(AuthConfig {
        token_type: AuthTokenType::Query,
        ..AuthConfig::default()
    });

    let client = ClientBuilder::new(config)
        .with_transport(transport.clone())
        .with_shared_token_provider(token_provider_fn(|| async { Ok(AuthToken::new("abc")) }))
        .build()
        .unwrap();
    assert_ok!(client.connect().await);

    let request = &transport.requests()[0];
    assert!(request.url.ends_with("?token=abc"));
    assert_eq!(request.header("authorization"), None);
}

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn invalid_config_update_is_rejected() {
    let transport = MockTransport::new();
    let client = client_with(ClientConfig::testing(URL), &transport);

    let mut bad = ClientConfig::testing(URL);
    bad.url.clear();
    assert!(matches!(
        client.update_config(bad).await,
        Err(WirelinkError::Configuration(_))
    ));

    let mut smaller = ClientConfig::testing(URL);
    smaller.message_queue.max_size = 2;
    client.update_config(smaller).await.unwrap();
    for n in 0..4 {
        client
            .send_data("notification", json!({ "n": n }))
            .await
            .unwrap();
    }
    assert_eq!(client.queue_len().await.unwrap(), 2);
    assert_eq!(client.metrics().await.unwrap().queue_dropped, 2);
}

// ----------------------------------------------------------------------------
// Teardown
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn disconnect_stops_reconnecting() {
    let transport = MockTransport::new();
    let client = client_with(ClientConfig::testing(URL), &transport);
    assert_ok!(client.connect().await);

    client.disconnect().await.unwrap();
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(
        transport.closes(),
        vec![(Some(CLOSE_NORMAL), Some("client disconnect".to_string()))]
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.open_count(), 1);
    client.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn destroyed_client_rejects_calls_and_fires_nothing() {
    let transport = MockTransport::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let client = ClientBuilder::new(heartbeat_config(1))
        .with_transport(transport.clone())
        .on_state_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    assert_ok!(client.connect().await);
    let before = calls.load(Ordering::SeqCst);

    client.destroy().await.unwrap();
    assert!(client.is_closed());
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert!(matches!(
        client.send(Message::new("notification", json!({}))).await,
        Err(WirelinkError::ClientClosed)
    ));
    client.destroy().await.unwrap();

    // Heartbeat timers would have fired by now
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), before);
    assert!(!transport.inject(wirelink_client::TransportEvent::Opened));
    assert!(transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_closes_the_connection() {
    let transport = MockTransport::new();
    let client = client_with(ClientConfig::testing(URL), &transport);
    assert_ok!(client.connect().await);

    let observer = client.subscribe();
    drop(client);

    assert!(eventually(|| transport.closes().len() == 1).await);
    assert!(observer.has_changed().is_err());
}

#[tokio::test(start_paused = true)]
async fn destroy_discards_pending_batches() {
    let transport = MockTransport::new();
    let (client, batches) = batching_client(&transport);
    assert_ok!(client.connect().await);

    transport.push_message(&server_message("notification", "n-1", json!({})));
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.destroy().await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(batches.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn destroy_while_reconnecting_cancels_the_retry() {
    let transport = MockTransport::new();
    transport.fail_opens(usize::MAX);
    let client = client_with(ClientConfig::testing(URL), &transport);

    assert!(client.connect().await.is_err());
    assert_eq!(client.status(), ConnectionStatus::Reconnecting);
    let opens = transport.open_count();

    client.destroy().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.open_count(), opens);
}
