#![cfg(feature = "database")]

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{database_queue, Journal, SendWelcomeEmail};
use relay_queue::{ManualClock, QueueBackend, QueueHandle, SystemClock};
use serde_json::json;

#[tokio::test]
async fn test_push_then_pop_returns_same_payload() {
    let queue = database_queue(Arc::new(SystemClock)).await;
    let journal = Journal::new();
    let payload = json!({"userId": 7, "journal": journal.id()});

    let id = queue.push("SendWelcomeEmail", payload.clone(), "emails").await.unwrap();
    let handle = queue.pop("emails").await.unwrap().unwrap();

    assert_eq!(handle.id(), &id);
    assert_eq!(handle.job_name(), "SendWelcomeEmail");
    assert_eq!(handle.queue(), "emails");
    assert_eq!(handle.payload(), &payload);
    assert_eq!(handle.attempts(), 0);
}

#[tokio::test]
async fn test_pop_on_empty_queue_returns_none() {
    let queue = database_queue(Arc::new(SystemClock)).await;
    assert!(queue.pop("default").await.unwrap().is_none());
}

#[tokio::test]
async fn test_queues_are_isolated() {
    let queue = database_queue(Arc::new(SystemClock)).await;
    queue.push("a", json!(null), "emails").await.unwrap();

    assert!(queue.pop("reports").await.unwrap().is_none());
    assert_eq!(queue.size("reports").await.unwrap(), 0);
    assert_eq!(queue.size("emails").await.unwrap(), 1);
}

#[tokio::test]
async fn test_size_excludes_claimed_records() {
    let queue = database_queue(Arc::new(SystemClock)).await;
    for _ in 0..3 {
        queue.push("a", json!(null), "default").await.unwrap();
    }

    let _claimed = queue.pop("default").await.unwrap().unwrap();
    assert_eq!(queue.size("default").await.unwrap(), 2);
}

#[tokio::test]
async fn test_concurrent_pops_claim_each_record_once() {
    const RECORDS: usize = 40;
    const POPPERS: usize = 8;

    let queue = database_queue(Arc::new(SystemClock)).await;
    for n in 0..RECORDS {
        queue.push("a", json!({ "n": n }), "default").await.unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..POPPERS {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(handle) = queue.pop("default").await.unwrap() {
                claimed.push(handle.id().clone());
            }
            claimed
        }));
    }

    let all: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .flat_map(|claimed| claimed.unwrap())
        .collect();

    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), RECORDS);
    assert_eq!(unique.len(), RECORDS);
}

#[tokio::test]
async fn test_release_back_delays_and_counts_attempt() {
    let clock = Arc::new(ManualClock::new());
    let queue = database_queue(clock.clone()).await;
    let id = queue.push("a", json!({"x": 1}), "default").await.unwrap();

    let handle = queue.pop("default").await.unwrap().unwrap();
    assert_eq!(handle.id(), &id);
    handle.release_back(Duration::from_secs(10)).await.unwrap();
    assert!(handle.state().released);

    assert!(queue.pop("default").await.unwrap().is_none());
    assert_eq!(queue.size("default").await.unwrap(), 0);

    clock.advance(Duration::from_secs(9));
    assert!(queue.pop("default").await.unwrap().is_none());

    clock.advance(Duration::from_secs(1));
    let retried = queue.pop("default").await.unwrap().unwrap();
    assert_eq!(retried.attempts(), 1);
    assert_eq!(retried.payload(), &json!({"x": 1}));
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let queue = database_queue(Arc::new(SystemClock)).await;
    queue.push("a", json!(null), "default").await.unwrap();

    let handle = queue.pop("default").await.unwrap().unwrap();
    handle.delete().await.unwrap();
    handle.delete().await.unwrap();

    assert!(handle.state().deleted);
    assert!(queue.pop("default").await.unwrap().is_none());
}

#[tokio::test]
async fn test_clear_discards_claimed_and_unclaimed() {
    let queue = database_queue(Arc::new(SystemClock)).await;
    queue.push("a", json!(null), "default").await.unwrap();
    queue.push("b", json!(null), "default").await.unwrap();
    let claimed = queue.pop("default").await.unwrap().unwrap();

    queue.clear("default").await.unwrap();
    assert_eq!(queue.size("default").await.unwrap(), 0);

    // The row is gone, so the old claim acknowledges nothing
    claimed.delete().await.unwrap();
    assert!(queue.pop("default").await.unwrap().is_none());
}

#[tokio::test]
async fn test_fired_job_runs_and_stays_claimed_until_deleted() {
    let queue = database_queue(Arc::new(SystemClock)).await;
    let journal = Journal::new();
    queue
        .push("SendWelcomeEmail", json!({"userId": 42, "journal": journal.id()}), "emails")
        .await
        .unwrap();

    let handle = queue.pop("emails").await.unwrap().unwrap();
    handle.fire().await.unwrap();

    assert_eq!(journal.entries(), vec!["sent:42".to_string()]);
    assert!(!handle.state().is_terminal());
    assert_eq!(queue.size("emails").await.unwrap(), 0);

    handle.delete().await.unwrap();
    assert!(queue.pop("emails").await.unwrap().is_none());
}

#[tokio::test]
async fn test_payload_from_dispatchable_type_round_trips() {
    let queue = database_queue(Arc::new(SystemClock)).await;
    let job = SendWelcomeEmail {
        user_id: 9,
        journal: "p".to_string(),
    };

    queue
        .push("SendWelcomeEmail", serde_json::to_value(&job).unwrap(), "emails")
        .await
        .unwrap();
    let handle = queue.pop("emails").await.unwrap().unwrap();

    let decoded: SendWelcomeEmail = serde_json::from_value(handle.payload().clone()).unwrap();
    assert_eq!(decoded, job);
}
