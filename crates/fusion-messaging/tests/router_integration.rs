//! Router ordering and concurrency guarantees.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use fusion_core::topics;
use fusion_messaging::MessageRouter;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn per_topic_order_is_publish_order() {
    let router = MessageRouter::new();
    let task = Uuid::new_v4();
    let mut sub = router.subscribe(&topics::task_all(task)).unwrap();

    for kind in [topics::QUEUED, topics::ASSIGNED, topics::RUNNING, topics::COMPLETED] {
        router.publish(&topics::task(task, kind), json!(null)).unwrap();
    }

    let mut kinds = Vec::new();
    for _ in 0..4 {
        let event = sub.recv().await.unwrap();
        kinds.push(event.kind().unwrap().to_string());
    }
    assert_eq!(kinds, vec!["queued", "assigned", "running", "completed"]);
}

#[tokio::test]
async fn concurrent_publishers_are_seen_in_one_order_by_all_subscribers() {
    let router = Arc::new(MessageRouter::new());
    let mut first = router.subscribe("task.#").unwrap();
    let mut second = router.subscribe("task.*.queued").unwrap();

    let mut handles = Vec::new();
    for worker in 0..8 {
        let router = Arc::clone(&router);
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                router
                    .publish(&format!("task.w{worker}-{i}.queued"), json!(worker))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let a: Vec<u64> = first.drain().iter().map(|e| e.sequence).collect();
    let b: Vec<u64> = second.drain().iter().map(|e| e.sequence).collect();
    assert_eq!(a.len(), 200);
    assert_eq!(a, b);
    assert!(a.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn subscriber_waits_without_busy_looping() {
    let router = MessageRouter::new();
    let mut sub = router.subscribe(&topics::any(topics::AGENT, "idle")).unwrap();

    let publisher = router.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        publisher.publish("agent.a7.idle", json!({"from": "working", "to": "idle"})).unwrap();
    });

    let event = tokio::time::timeout(std::time::Duration::from_secs(2), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.entity_id(), Some("a7"));
    handle.await.unwrap();
}
