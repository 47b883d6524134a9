//! Batch publisher integration tests
//!
//! End-to-end tests of the publisher lifecycle and batch loop against the
//! in-memory broker. Covers batch sizing, linger, failure handling, drain
//! on stop, idempotent start, retries, dead letters, and overflow.

use actionlog::{
    ActionEvent, ActionLogError, BatchPublisher, BrokerOp, DeadLetterHandler, MemoryBroker,
    MemoryDeadLetters, OverflowPolicy, PublisherConfig, PublisherEvent, PublisherState,
};
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn config(linger_ms: u64, max_batch_size: usize) -> PublisherConfig {
    PublisherConfig {
        topic: "action_log".to_string(),
        linger_ms,
        max_batch_size,
        max_batch_bytes: 0,
        ..Default::default()
    }
}

fn publisher(config: PublisherConfig) -> (BatchPublisher, MemoryBroker) {
    init_tracing();
    let broker = MemoryBroker::new();
    let publisher = BatchPublisher::new(config, broker.clone()).unwrap();
    (publisher, broker)
}

fn event(action: &str) -> ActionEvent {
    ActionEvent::new(action).unwrap()
}

fn sent_actions(broker: &MemoryBroker) -> Vec<String> {
    broker
        .sent()
        .iter()
        .map(|m| m.json()["action"].as_str().unwrap_or_default().to_string())
        .collect()
}

/// Next `BatchFlushed` as (size, sent, failed), or `None` after `within`
async fn try_next_flush(
    rx: &mut broadcast::Receiver<PublisherEvent>,
    within: Duration,
) -> Option<(usize, usize, usize)> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(PublisherEvent::BatchFlushed { size, sent, failed })) => {
                return Some((size, sent, failed))
            }
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => panic!("event stream broke: {}", e),
            Err(_) => return None,
        }
    }
}

async fn next_flush(rx: &mut broadcast::Receiver<PublisherEvent>) -> (usize, usize, usize) {
    try_next_flush(rx, Duration::from_secs(5))
        .await
        .expect("no batch flushed within 5s")
}

// ─── Batching ────────────────────────────────────────────────────

#[tokio::test]
async fn test_small_burst_flushes_once_after_linger() {
    let (publisher, broker) = publisher(config(50, 100));
    let mut rx = publisher.subscribe();
    assert_ok!(publisher.start().await);

    for name in ["create_rate", "get_rate", "get_insurance"] {
        publisher.publish(event(name)).unwrap();
    }

    assert_eq!(next_flush(&mut rx).await, (3, 3, 0));
    assert!(try_next_flush(&mut rx, Duration::from_millis(200)).await.is_none());

    // Memory broker acks in poll order, which is collection order
    assert_eq!(
        sent_actions(&broker),
        vec!["create_rate", "get_rate", "get_insurance"]
    );
    assert!(broker.sent().iter().all(|m| m.topic == "action_log"));

    publisher.stop().await.unwrap();
}

#[tokio::test]
async fn test_backlog_splits_into_max_size_batches() {
    let (publisher, broker) = publisher(config(50, 100));
    let mut rx = publisher.subscribe();

    for i in 0..250 {
        publisher.publish(event(&format!("action-{}", i))).unwrap();
    }
    assert_eq!(publisher.queued(), 250);

    publisher.start().await.unwrap();
    assert_eq!(next_flush(&mut rx).await, (100, 100, 0));
    assert_eq!(next_flush(&mut rx).await, (100, 100, 0));
    assert_eq!(next_flush(&mut rx).await, (50, 50, 0));
    assert!(try_next_flush(&mut rx, Duration::from_millis(200)).await.is_none());

    assert_eq!(broker.sent_count(), 250);
    assert_eq!(publisher.stats().batches, 3);
    publisher.stop().await.unwrap();
}

#[tokio::test]
async fn test_no_batch_exceeds_max_size() {
    let (publisher, broker) = publisher(config(20, 37));
    let mut rx = publisher.subscribe();
    for i in 0..1000 {
        publisher.publish(event(&format!("e{}", i))).unwrap();
    }
    publisher.start().await.unwrap();

    let mut total = 0;
    while total < 1000 {
        let (size, sent, _) = next_flush(&mut rx).await;
        assert!(size <= 37, "batch of {} exceeds max", size);
        total += sent;
    }
    assert_eq!(broker.sent_count(), 1000);
    publisher.stop().await.unwrap();
}

#[tokio::test]
async fn test_queue_order_preserved_into_sends() {
    let (publisher, broker) = publisher(config(20, 64));
    let expected: Vec<String> = (0..500).map(|i| format!("e{}", i)).collect();
    for name in &expected {
        publisher.publish(event(name)).unwrap();
    }

    publisher.start().await.unwrap();
    publisher.stop().await.unwrap();

    assert_eq!(sent_actions(&broker), expected);
}

#[tokio::test(start_paused = true)]
async fn test_lone_event_flushed_within_linger() {
    let (publisher, _broker) = publisher(config(100, 100));
    publisher.start().await.unwrap();
    let mut rx = publisher.subscribe();

    let published_at = tokio::time::Instant::now();
    publisher.publish(event("get_rate")).unwrap();
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }

    // Still lingering just short of one window
    tokio::time::advance(Duration::from_millis(99)).await;
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
    assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));

    tokio::time::advance(Duration::from_millis(2)).await;
    assert_eq!(next_flush(&mut rx).await, (1, 1, 0));
    assert!(published_at.elapsed() <= Duration::from_millis(101));
    assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));

    publisher.stop().await.unwrap();
}

#[tokio::test]
async fn test_byte_budget_caps_batches() {
    let ts = Utc.with_ymd_and_hms(2024, 11, 22, 18, 22, 0).unwrap();
    let make = |i: usize| event(&format!("e{}", i)).at(ts);
    let one = make(0).to_serialized().unwrap().len();

    let (publisher, broker) = publisher(PublisherConfig {
        max_batch_bytes: one * 2 + 1,
        ..config(20, 100)
    });
    let mut rx = publisher.subscribe();
    for i in 0..5 {
        publisher.publish(make(i)).unwrap();
    }
    publisher.start().await.unwrap();

    assert_eq!(next_flush(&mut rx).await, (2, 2, 0));
    assert_eq!(next_flush(&mut rx).await, (2, 2, 0));
    assert_eq!(next_flush(&mut rx).await, (1, 1, 0));
    assert_eq!(sent_actions(&broker), vec!["e0", "e1", "e2", "e3", "e4"]);
    publisher.stop().await.unwrap();
}

#[tokio::test]
async fn test_batch_members_sent_concurrently() {
    let (publisher, broker) = publisher(config(20, 100));
    broker.set_send_delay(Duration::from_millis(100));
    let mut rx = publisher.subscribe();
    for i in 0..10 {
        publisher.publish(event(&format!("e{}", i))).unwrap();
    }

    publisher.start().await.unwrap();
    let started = Instant::now();
    assert_eq!(next_flush(&mut rx).await, (10, 10, 0));
    // Sequential sends would take at least a second
    assert!(started.elapsed() < Duration::from_millis(700));
    publisher.stop().await.unwrap();
}

// ─── Failures ────────────────────────────────────────────────────

#[tokio::test]
async fn test_one_failed_send_does_not_stop_batch_or_loop() {
    let (publisher, broker) = publisher(config(30, 100));
    broker.fail_when(|payload| {
        serde_json::from_slice::<serde_json::Value>(payload)
            .map(|v| v["action"] == "boom")
            .unwrap_or(false)
    });
    let mut rx = publisher.subscribe();
    publisher.start().await.unwrap();

    for name in ["a", "b", "boom", "c", "d"] {
        publisher.publish(event(name)).unwrap();
    }
    assert_eq!(next_flush(&mut rx).await, (5, 4, 1));
    assert_eq!(sent_actions(&broker), vec!["a", "b", "c", "d"]);

    // Loop keeps going
    publisher.publish(event("e")).unwrap();
    publisher.publish(event("f")).unwrap();
    assert_eq!(next_flush(&mut rx).await, (2, 2, 0));

    let stats = publisher.stats();
    assert_eq!(stats.sent, 6);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retried, 0);
    assert_eq!(publisher.state(), PublisherState::Running);
    publisher.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_send_goes_to_dead_letters() {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.fail_when(|_| true);
    let dlq = Arc::new(MemoryDeadLetters::default());
    let publisher = BatchPublisher::new(config(20, 100), broker.clone())
        .unwrap()
        .with_dead_letters(dlq.clone());
    let mut rx = publisher.subscribe();

    publisher.publish(event("post_rates").with_user_id("u-1")).unwrap();
    publisher.publish(event("get_rate")).unwrap();
    publisher.start().await.unwrap();

    assert_eq!(next_flush(&mut rx).await, (2, 0, 2));
    publisher.stop().await.unwrap();

    assert_eq!(dlq.count().await.unwrap(), 2);
    let letters = dlq.list(10).await.unwrap();
    assert!(letters.iter().all(|l| l.topic == "action_log"));
    assert!(letters[0].reason.contains("rejected"));
    assert_eq!(letters[0].message.attempts(), 1);
    assert_eq!(publisher.stats().failed, 2);
}

#[tokio::test]
async fn test_retry_budget_resends_failed_event() {
    let (publisher, broker) = publisher(PublisherConfig {
        max_send_retries: 2,
        ..config(20, 100)
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    broker.fail_when(move |_| counter.fetch_add(1, Ordering::SeqCst) < 2);
    let mut rx = publisher.subscribe();

    publisher.publish(event("post_rates")).unwrap();
    publisher.start().await.unwrap();

    assert_eq!(next_flush(&mut rx).await, (1, 0, 1));
    assert_eq!(next_flush(&mut rx).await, (1, 0, 1));
    assert_eq!(next_flush(&mut rx).await, (1, 1, 0));

    let stats = publisher.stats();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.failed, 0);

    // Same message id on every attempt
    let ids: Vec<_> = broker
        .operations()
        .into_iter()
        .filter_map(|op| match op {
            BrokerOp::Send { message_id, .. } | BrokerOp::SendFailed { message_id, .. } => {
                Some(message_id)
            }
            _ => None,
        })
        .collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| *id == ids[0]));
    publisher.stop().await.unwrap();
}

#[tokio::test]
async fn test_retry_into_full_queue_goes_to_dead_letters() {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.fail_when(|_| true);
    broker.set_send_delay(Duration::from_millis(150));
    let dlq = Arc::new(MemoryDeadLetters::default());
    let publisher = BatchPublisher::new(
        PublisherConfig {
            queue_capacity: 1,
            overflow: OverflowPolicy::Reject,
            max_send_retries: 1,
            ..config(10, 100)
        },
        broker.clone(),
    )
    .unwrap()
    .with_dead_letters(dlq.clone());

    publisher.publish(event("a")).unwrap();
    publisher.start().await.unwrap();

    // "a" is in flight; "b" takes the only slot its retry would need
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(publisher.queued(), 0);
    publisher.publish(event("b")).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while dlq.count().await.unwrap() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both events should reach dead letters");
    publisher.stop().await.unwrap();

    let stats = publisher.stats();
    assert_eq!(stats.enqueued, 2);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.failed, 2);

    let mut lost: Vec<String> = dlq
        .list(10)
        .await
        .unwrap()
        .iter()
        .map(|l| {
            let json: serde_json::Value = serde_json::from_slice(&l.message.payload()).unwrap();
            json["action"].as_str().unwrap().to_string()
        })
        .collect();
    lost.sort();
    assert_eq!(lost, vec!["a", "b"]);

    let letters = dlq.list(10).await.unwrap();
    let a = letters
        .iter()
        .find(|l| l.message.attempts() == 1)
        .expect("the unretried event");
    assert!(a.reason.contains("queue full"));
}

// ─── Lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_drains_queued_events_before_disconnect() {
    let (publisher, broker) = publisher(config(30, 100));
    publisher.start().await.unwrap();

    publisher.publish(event("post_rates")).unwrap();
    publisher.publish(event("get_rate")).unwrap();
    publisher.stop().await.unwrap();

    assert_eq!(broker.sent_count(), 2);
    let ops = broker.operations();
    assert_eq!(ops.first(), Some(&BrokerOp::Connect));
    assert_eq!(ops.last(), Some(&BrokerOp::Disconnect));
    assert_eq!(
        ops.iter()
            .filter(|op| matches!(op, BrokerOp::Send { .. }))
            .count(),
        2
    );
    assert_eq!(publisher.queued(), 0);
    assert_eq!(publisher.state(), PublisherState::Stopped);
}

#[tokio::test]
async fn test_in_flight_flush_completes_before_disconnect() {
    let (publisher, broker) = publisher(config(10, 100));
    broker.set_send_delay(Duration::from_millis(150));
    let mut rx = publisher.subscribe();
    publisher.start().await.unwrap();

    for i in 0..5 {
        publisher.publish(event(&format!("e{}", i))).unwrap();
    }
    // Let the loop collect and begin sending
    tokio::time::sleep(Duration::from_millis(60)).await;
    publisher.stop().await.unwrap();

    assert_eq!(broker.sent_count(), 5);
    assert_eq!(broker.operations().last(), Some(&BrokerOp::Disconnect));
    assert_eq!(next_flush(&mut rx).await, (5, 5, 0));
}

#[tokio::test]
async fn test_no_sends_after_stop_and_restart_resumes() {
    let (publisher, broker) = publisher(config(20, 100));
    publisher.start().await.unwrap();
    publisher.publish(event("before")).unwrap();
    publisher.stop().await.unwrap();
    assert_eq!(broker.sent_count(), 1);

    for i in 0..3 {
        publisher.publish(event(&format!("after-{}", i))).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.sent_count(), 1);
    assert_eq!(publisher.queued(), 3);
    assert_eq!(publisher.state(), PublisherState::Stopped);

    publisher.start().await.unwrap();
    publisher.stop().await.unwrap();
    assert_eq!(broker.sent_count(), 4);
    assert_eq!(broker.connect_count(), 2);
    assert_eq!(broker.disconnect_count(), 2);
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let (publisher, broker) = publisher(config(20, 100));
    let mut flushes = publisher.subscribe();
    let mut lifecycle = publisher.subscribe();

    assert_ok!(publisher.start().await);
    assert_ok!(publisher.start().await);
    let (a, b) = tokio::join!(publisher.start(), publisher.start());
    assert_ok!(a);
    assert_ok!(b);
    assert_eq!(broker.connect_count(), 1);

    // One loop: each event is sent exactly once
    for i in 0..10 {
        publisher.publish(event(&format!("e{}", i))).unwrap();
    }
    assert_eq!(next_flush(&mut flushes).await, (10, 10, 0));
    publisher.stop().await.unwrap();
    assert_eq!(broker.sent_count(), 10);

    let started = std::iter::from_fn(|| lifecycle.try_recv().ok())
        .filter(|e| *e == PublisherEvent::Started)
        .count();
    assert_eq!(started, 1);
}

#[tokio::test]
async fn test_connection_failure_leaves_publisher_stopped() {
    let (publisher, broker) = publisher(config(20, 100));
    broker.refuse_connections(true);
    publisher.publish(event("queued_while_down")).unwrap();

    let err = assert_err!(publisher.start().await);
    assert!(matches!(err, ActionLogError::Connection(_)));
    assert_eq!(publisher.state(), PublisherState::Stopped);
    assert_eq!(publisher.queued(), 1);

    broker.refuse_connections(false);
    assert_ok!(publisher.start().await);
    assert_eq!(publisher.state(), PublisherState::Running);
    publisher.stop().await.unwrap();
    assert_eq!(sent_actions(&broker), vec!["queued_while_down"]);
}

#[tokio::test]
async fn test_lifecycle_events_broadcast() {
    let (publisher, _broker) = publisher(config(10, 100));
    let mut rx = publisher.subscribe();

    publisher.start().await.unwrap();
    publisher.stop().await.unwrap();

    assert_eq!(rx.recv().await.unwrap(), PublisherEvent::Started);
    assert_eq!(rx.recv().await.unwrap(), PublisherEvent::Stopped);
}

#[tokio::test]
async fn test_dropped_publisher_drains_and_disconnects() {
    let (publisher, broker) = publisher(config(20, 100));
    publisher.start().await.unwrap();
    publisher.publish(event("post_rates")).unwrap();
    drop(publisher);

    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.disconnect_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("loop should disconnect after the publisher is dropped");

    assert_eq!(sent_actions(&broker), vec!["post_rates"]);
    assert!(!broker.is_connected());
    assert!(matches!(broker.operations().last(), Some(BrokerOp::Disconnect)));
}

// ─── Overflow ────────────────────────────────────────────────────

#[tokio::test]
async fn test_bounded_queue_reject() {
    let (publisher, _broker) = publisher(PublisherConfig {
        queue_capacity: 2,
        overflow: OverflowPolicy::Reject,
        ..config(20, 100)
    });

    publisher.publish(event("a")).unwrap();
    publisher.publish(event("b")).unwrap();
    let err = publisher.publish(event("c")).unwrap_err();
    assert!(matches!(err, ActionLogError::QueueFull { capacity: 2 }));
    assert_eq!(publisher.stats().enqueued, 2);
}

#[tokio::test]
async fn test_bounded_queue_drop_oldest() {
    let (publisher, broker) = publisher(PublisherConfig {
        queue_capacity: 2,
        overflow: OverflowPolicy::DropOldest,
        ..config(20, 100)
    });

    for name in ["a", "b", "c"] {
        publisher.publish(event(name)).unwrap();
    }
    assert_eq!(publisher.stats().dropped, 1);

    publisher.start().await.unwrap();
    publisher.stop().await.unwrap();
    assert_eq!(sent_actions(&broker), vec!["b", "c"]);
}

#[tokio::test]
async fn test_bounded_queue_drop_newest_counts_only_stored() {
    let (publisher, broker) = publisher(PublisherConfig {
        queue_capacity: 2,
        overflow: OverflowPolicy::DropNewest,
        ..config(20, 100)
    });

    for name in ["a", "b", "c"] {
        assert_ok!(publisher.publish(event(name)));
    }
    let stats = publisher.stats();
    assert_eq!(stats.enqueued, 2);
    assert_eq!(stats.dropped, 1);

    publisher.start().await.unwrap();
    publisher.stop().await.unwrap();
    assert_eq!(sent_actions(&broker), vec!["a", "b"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishers() {
    let (publisher, broker) = publisher(config(20, 50));
    let publisher = Arc::new(publisher);
    publisher.start().await.unwrap();

    let mut handles = Vec::new();
    for t in 0..8 {
        let publisher = publisher.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..50 {
                publisher
                    .publish(event(&format!("t{}-{}", t, i)).with_user_id(format!("u{}", t)))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    publisher.stop().await.unwrap();
    assert_eq!(broker.sent_count(), 400);
    assert_eq!(publisher.stats().enqueued, 400);
}
