//! End-to-end delivery tests against a containerized Redis.

use backstage_broker::{
    BackoffPolicy, Continuation, DedupeOptions, EnqueueOptions, HandlerOutcome, HandlerRegistry,
    Payload, Priority, Producer, Worker, WorkerConfig,
};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamPendingCountReply, StreamRangeReply};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use test_utils::TestRedis;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

fn test_config(prefix: &str, worker_id: &str) -> WorkerConfig {
    WorkerConfig::new()
        .with_prefix(prefix)
        .with_worker_id(worker_id)
        .with_block_timeout(Duration::from_millis(200))
        .with_reclaimer_interval(Duration::from_secs(5))
        .with_grace_period(Duration::from_secs(5))
}

fn unique_prefix() -> String {
    format!("bs{}", uuid::Uuid::new_v4().simple())
}

async fn pending_count(conn: &mut ConnectionManager, stream: &str, group: &str) -> usize {
    let reply: StreamPendingCountReply = redis::cmd("XPENDING")
        .arg(stream)
        .arg(group)
        .arg("-")
        .arg("+")
        .arg(100)
        .query_async(conn)
        .await
        .unwrap();
    reply.ids.len()
}

async fn wait_for_empty_pel(conn: &mut ConnectionManager, stream: &str, group: &str) {
    for _ in 0..50 {
        if pending_count(conn, stream, group).await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("pending entries were not drained for {stream}");
}

#[tokio::test]
async fn test_enqueue_round_trip() {
    let redis = TestRedis::new().await;
    let cm = backstage_broker::connect(redis.connection_string())
        .await
        .unwrap();
    let prefix = unique_prefix();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("email.send", move |payload: Payload| {
        let tx = tx.clone();
        async move {
            let email: serde_json::Value = payload.decode()?;
            tx.send(email).unwrap();
            Ok(HandlerOutcome::Complete)
        }
    });

    let config = test_config(&prefix, "worker-a");
    let group = config.consumer_group.clone();
    let worker = Worker::new(cm.clone(), config, registry);
    let producer = Producer::new(cm.clone(), prefix.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let outcome = producer
        .enqueue("email.send", &json!({"to": "a@b"}), EnqueueOptions::new())
        .await
        .unwrap();
    assert!(outcome.id().is_some());

    let received = timeout(Duration::from_secs(15), rx.recv())
        .await
        .expect("handler was not invoked")
        .unwrap();
    assert_eq!(received, json!({"to": "a@b"}));

    // Post-invocation the pending list for the default stream is drained.
    let mut conn = cm.clone();
    let stream = format!("{prefix}:default");
    wait_for_empty_pel(&mut conn, &stream, &group).await;

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_dedupe_window_produces_one_message() {
    let redis = TestRedis::new().await;
    let cm = redis.connection_manager().await;
    let prefix = unique_prefix();
    let producer = Producer::new(cm.clone(), prefix.clone());

    let options = || {
        EnqueueOptions::new()
            .with_dedupe(DedupeOptions::new("order-7").with_ttl(Duration::from_millis(60_000)))
    };

    let first = producer
        .enqueue("order.create", &json!({"id": "7"}), options())
        .await
        .unwrap();
    assert!(first.id().is_some());
    assert!(!first.is_deduplicated());

    let second = producer
        .enqueue("order.create", &json!({"id": "7"}), options())
        .await
        .unwrap();
    assert!(second.is_deduplicated());
    assert_eq!(second.id(), None);

    let mut conn = cm.clone();
    let len: usize = conn.xlen(format!("{prefix}:default")).await.unwrap();
    assert_eq!(len, 1);
}

#[tokio::test]
async fn test_dedupe_guard_expires() {
    let redis = TestRedis::new().await;
    let cm = redis.connection_manager().await;
    let prefix = unique_prefix();
    let producer = Producer::new(cm.clone(), prefix.clone());

    let options = || {
        EnqueueOptions::new()
            .with_dedupe(DedupeOptions::new("blip").with_ttl(Duration::from_millis(200)))
    };

    let first = producer.enqueue("t", &(), options()).await.unwrap();
    assert!(!first.is_deduplicated());

    tokio::time::sleep(Duration::from_millis(400)).await;

    let second = producer.enqueue("t", &(), options()).await.unwrap();
    assert!(!second.is_deduplicated());

    let mut conn = cm.clone();
    let len: usize = conn.xlen(format!("{prefix}:default")).await.unwrap();
    assert_eq!(len, 2);
}

#[tokio::test]
async fn test_metadata_fields_ride_the_wire() {
    let redis = TestRedis::new().await;
    let cm = redis.connection_manager().await;
    let prefix = unique_prefix();
    let producer = Producer::new(cm.clone(), prefix.clone());

    producer
        .enqueue(
            "video.encode",
            &json!({"id": 3}),
            EnqueueOptions::new()
                .with_attempts(4)
                .with_backoff(BackoffPolicy::exponential(1_000, 60_000))
                .with_timeout(Duration::from_secs(30)),
        )
        .await
        .unwrap();

    let mut conn = cm.clone();
    let range: StreamRangeReply = redis::cmd("XRANGE")
        .arg(format!("{prefix}:default"))
        .arg("-")
        .arg("+")
        .query_async(&mut conn)
        .await
        .unwrap();
    let entry = &range.ids[0];

    assert_eq!(entry.get::<String>("taskName").unwrap(), "video.encode");
    assert_eq!(entry.get::<String>("payload").unwrap(), r#"{"id":3}"#);
    assert_eq!(entry.get::<String>("attempts").unwrap(), "4");
    assert_eq!(entry.get::<String>("timeout").unwrap(), "30000");

    let backoff: BackoffPolicy =
        serde_json::from_str(&entry.get::<String>("backoff").unwrap()).unwrap();
    assert_eq!(backoff, BackoffPolicy::exponential(1_000, 60_000));
}

#[tokio::test]
async fn test_priority_preemption() {
    let redis = TestRedis::new().await;
    let cm = redis.connection_manager().await;
    let prefix = unique_prefix();
    let producer = Producer::new(cm.clone(), prefix.clone());

    // Fill the low tier first, then one urgent task, all before any worker
    // is running.
    for i in 0..5 {
        producer
            .enqueue(
                "probe",
                &json!({"tier": "low", "i": i}),
                EnqueueOptions::new().with_priority(Priority::Low),
            )
            .await
            .unwrap();
    }
    producer
        .enqueue(
            "probe",
            &json!({"tier": "urgent"}),
            EnqueueOptions::new().with_priority(Priority::Urgent),
        )
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("probe", move |payload: Payload| {
        let tx = tx.clone();
        async move {
            let value: serde_json::Value = payload.decode()?;
            tx.send(value["tier"].as_str().unwrap().to_string()).unwrap();
            Ok(HandlerOutcome::Complete)
        }
    });

    // A single-slot worker so observation order is delivery order.
    let config = test_config(&prefix, "worker-a")
        .with_concurrency(1)
        .with_prefetch(1);
    let worker = Worker::new(cm.clone(), config, registry);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let first = timeout(Duration::from_secs(15), rx.recv())
        .await
        .expect("no task observed")
        .unwrap();
    assert_eq!(first, "urgent");

    // The rest are the low-tier tasks.
    for _ in 0..5 {
        let tier = timeout(Duration::from_secs(15), rx.recv())
            .await
            .expect("low task missing")
            .unwrap();
        assert_eq!(tier, "low");
    }

    shutdown_tx.send(true).unwrap();
    let _ = timeout(Duration::from_secs(10), handle).await.unwrap();
}

#[tokio::test]
async fn test_custom_queue_routing() {
    let redis = TestRedis::new().await;
    let cm = redis.connection_manager().await;
    let prefix = unique_prefix();
    let producer = Producer::new(cm.clone(), prefix.clone());

    producer
        .enqueue(
            "report.render",
            &json!({"id": 1}),
            EnqueueOptions::new().with_queue("reports"),
        )
        .await
        .unwrap();

    let mut conn = cm.clone();
    let queue_len: usize = conn.xlen(format!("{prefix}:reports")).await.unwrap();
    assert_eq!(queue_len, 1);
    let default_len: usize = conn.xlen(format!("{prefix}:default")).await.unwrap();
    assert_eq!(default_len, 0);

    // A worker serving the custom queue picks it up.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("report.render", move |payload: Payload| {
        let tx = tx.clone();
        async move {
            let value: serde_json::Value = payload.decode()?;
            tx.send(value).unwrap();
            Ok(HandlerOutcome::Complete)
        }
    });

    let config = test_config(&prefix, "worker-a").with_custom_queue("reports", 10);
    let worker = Worker::new(cm.clone(), config, registry);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let received = timeout(Duration::from_secs(15), rx.recv())
        .await
        .expect("custom queue task was not delivered")
        .unwrap();
    assert_eq!(received, json!({"id": 1}));

    shutdown_tx.send(true).unwrap();
    let _ = timeout(Duration::from_secs(10), handle).await.unwrap();
}

#[tokio::test]
async fn test_workflow_chain_continuation() {
    let redis = TestRedis::new().await;
    let cm = redis.connection_manager().await;
    let prefix = unique_prefix();
    let producer = Producer::new(cm.clone(), prefix.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut registry = HandlerRegistry::new();

    registry.register_fn("step.one", |payload: Payload| async move {
        let value: serde_json::Value = payload.decode()?;
        Ok(HandlerOutcome::Chain(
            Continuation::new("step.two").with_payload(json!({"from": value["n"]})),
        ))
    });

    let tx2 = tx.clone();
    registry.register_fn("step.two", move |payload: Payload| {
        let tx = tx2.clone();
        async move {
            let value: serde_json::Value = payload.decode()?;
            tx.send(value).unwrap();
            Ok(HandlerOutcome::Complete)
        }
    });

    let config = test_config(&prefix, "worker-a");
    let worker = Worker::new(cm.clone(), config, registry);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    producer
        .enqueue("step.one", &json!({"n": 1}), EnqueueOptions::new())
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(15), rx.recv())
        .await
        .expect("chain continuation never ran")
        .unwrap();
    assert_eq!(received, json!({"from": 1}));

    shutdown_tx.send(true).unwrap();
    let _ = timeout(Duration::from_secs(10), handle).await.unwrap();
}

#[tokio::test]
async fn test_unknown_task_is_discarded() {
    let redis = TestRedis::new().await;
    let cm = redis.connection_manager().await;
    let prefix = unique_prefix();
    let producer = Producer::new(cm.clone(), prefix.clone());

    // Worker with no handler for this task name.
    let config = test_config(&prefix, "worker-a");
    let group = config.consumer_group.clone();
    let worker = Worker::new(cm.clone(), config, HandlerRegistry::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    producer
        .enqueue("nobody.home", &(), EnqueueOptions::new())
        .await
        .unwrap();

    // The message is acked (discarded), not left pending.
    let mut conn = cm.clone();
    let stream = format!("{prefix}:default");
    wait_for_empty_pel(&mut conn, &stream, &group).await;

    shutdown_tx.send(true).unwrap();
    let _ = timeout(Duration::from_secs(10), handle).await.unwrap();
}

#[tokio::test]
async fn test_concurrency_cap_is_respected() {
    let redis = TestRedis::new().await;
    let cm = redis.connection_manager().await;
    let prefix = unique_prefix();
    let producer = Producer::new(cm.clone(), prefix.clone());

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut registry = HandlerRegistry::new();
    {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        registry.register_fn("slow.task", move |_payload: Payload| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let tx = tx.clone();
            async move {
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).unwrap();
                Ok(HandlerOutcome::Complete)
            }
        });
    }

    for _ in 0..6 {
        producer
            .enqueue("slow.task", &(), EnqueueOptions::new())
            .await
            .unwrap();
    }

    let config = test_config(&prefix, "worker-a").with_concurrency(2);
    let worker = Worker::new(cm.clone(), config, registry);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    for _ in 0..6 {
        timeout(Duration::from_secs(20), rx.recv())
            .await
            .expect("task did not complete")
            .unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2, "in-flight exceeded the cap");

    shutdown_tx.send(true).unwrap();
    let _ = timeout(Duration::from_secs(10), handle).await.unwrap();
}
