#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use claims::{assert_none, assert_some};
use tempfile::TempDir;

use telebridge::message::{now_millis, NewMessage};
use telebridge::stats::{Counters, StatsRecorder};
use telebridge::store::{FailDisposition, Store};
use telebridge::{DataType, Destination, Priority, Source, Status};

struct TmpStore {
    store: Store,
    _tmpdir: TempDir,
}

impl std::ops::Deref for TmpStore {
    type Target = Store;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

async fn setup() -> TmpStore {
    let tmpdir = tempfile::tempdir().unwrap();
    let store = Store::open(tmpdir.path().join("buffer.db")).await.unwrap();
    TmpStore {
        store,
        _tmpdir: tmpdir,
    }
}

fn new_message(topic: &str, priority: Priority) -> NewMessage {
    NewMessage {
        source: Source::Mqtt,
        destination: Destination::Opcua,
        topic_or_node: topic.to_owned(),
        value: "22.5".to_owned(),
        data_type: DataType::Float,
        priority,
        max_retries: 5,
    }
}

/// Insert with explicit timestamps so ordering is deterministic.
async fn insert_at(store: &Store, message: &NewMessage, created_at: i64) -> i64 {
    store
        .insert(message, created_at, created_at + 3_600_000)
        .await
        .unwrap()
}

#[tokio::test]
async fn claim_leases_and_complete_finishes() {
    let store = setup().await;
    let id = insert_at(&store, &new_message("plant/temp", Priority::Normal), now_millis()).await;

    let claimed = store
        .claim(10, "worker-1", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
    assert_eq!(claimed[0].status, Status::Processing);
    assert_eq!(claimed[0].lease_owner.as_deref(), Some("worker-1"));
    assert_some!(claimed[0].lease_deadline);

    // A second claim must not hand out the leased row.
    let second = store
        .claim(10, "worker-2", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(second.is_empty());

    assert!(store.complete(id).await.unwrap());
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, Status::Completed);
    assert_some!(row.processed_at);
    assert_none!(row.lease_owner);

    // At most one transition into completed.
    assert!(!store.complete(id).await.unwrap());
}

#[tokio::test]
async fn claims_order_by_priority_then_age() {
    let store = setup().await;
    let base = now_millis();

    // Interleave 10 critical and 10 low messages, oldest first.
    for i in 0..10 {
        insert_at(
            &store,
            &new_message(&format!("low/{i}"), Priority::Low),
            base + i * 2,
        )
        .await;
        insert_at(
            &store,
            &new_message(&format!("critical/{i}"), Priority::Critical),
            base + i * 2 + 1,
        )
        .await;
    }

    let first = store
        .claim(10, "worker-1", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(first.len(), 10);
    assert!(first.iter().all(|m| m.priority == Priority::Critical));

    // Within a priority, FIFO by age.
    let ages: Vec<i64> = first.iter().map(|m| m.created_at).collect();
    let mut sorted = ages.clone();
    sorted.sort_unstable();
    assert_eq!(ages, sorted);

    let second = store
        .claim(10, "worker-1", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(second.iter().all(|m| m.priority == Priority::Low));
}

#[tokio::test]
async fn requeued_messages_wait_for_their_backoff() {
    let store = setup().await;
    let id = insert_at(&store, &new_message("plant/temp", Priority::Normal), now_millis()).await;

    store.claim(1, "worker-1", Duration::from_secs(60)).await.unwrap();
    let disposition = store
        .fail_retry(id, "broker unreachable", Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(matches!(
        disposition,
        FailDisposition::Requeued { attempt: 1, .. }
    ));

    // Not eligible again until the backoff elapses.
    let claimed = store
        .claim(10, "worker-1", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(claimed.is_empty());

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, Status::Pending);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("broker unreachable"));
}

#[tokio::test]
async fn exhausted_retry_budget_archives() {
    let store = setup().await;
    let mut message = new_message("plant/temp", Priority::Normal);
    message.max_retries = 2;
    let id = insert_at(&store, &message, now_millis()).await;

    for expected_attempt in 1..=2 {
        store.claim(1, "worker-1", Duration::from_secs(60)).await.unwrap();
        let disposition = store
            .fail_retry(id, "transient", Duration::ZERO)
            .await
            .unwrap();
        assert!(matches!(
            disposition,
            FailDisposition::Requeued { attempt, .. } if attempt == expected_attempt
        ));
    }

    store.claim(1, "worker-1", Duration::from_secs(60)).await.unwrap();
    let disposition = store
        .fail_retry(id, "still broken", Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(disposition, FailDisposition::Archived);

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, Status::Failed);
    assert_eq!(row.retry_count, 2);

    let archive = store.failed_archive(10).await.unwrap();
    assert_eq!(archive.len(), 1);
    assert_eq!(archive[0].original_id, id);
    assert_eq!(archive[0].error_message, "still broken");
    assert_eq!(archive[0].retry_count, 2);
}

#[tokio::test]
async fn permanent_failure_bypasses_the_budget() {
    let store = setup().await;
    let id = insert_at(&store, &new_message("plant/temp", Priority::Normal), now_millis()).await;

    store.claim(1, "worker-1", Duration::from_secs(60)).await.unwrap();
    assert!(store.fail_permanent(id, "type mismatch").await.unwrap());

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, Status::Failed);
    assert_eq!(row.retry_count, 0);

    let archive = store.failed_archive(10).await.unwrap();
    assert_eq!(archive.len(), 1);
    assert_eq!(archive[0].retry_count, 0);

    // Terminal rows cannot be failed again.
    assert!(!store.fail_permanent(id, "again").await.unwrap());
}

#[tokio::test]
async fn expiry_archives_with_the_ttl_tag() {
    let store = setup().await;
    let now = now_millis();
    let message = new_message("plant/temp", Priority::Normal);
    let id = store.insert(&message, now, now + 10).await.unwrap();
    let keeper = store.insert(&message, now, now + 3_600_000).await.unwrap();

    let expired = store.expire_due(now + 1000).await.unwrap();
    assert_eq!(expired, 1);

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, Status::Expired);

    let kept = store.get(keeper).await.unwrap().unwrap();
    assert_eq!(kept.status, Status::Pending);

    let archive = store.failed_archive(10).await.unwrap();
    assert_eq!(archive.len(), 1);
    assert_eq!(archive[0].original_id, id);
    assert_eq!(archive[0].error_message, "ttl");

    // Expired rows are never claimed.
    let claimed = store
        .claim(10, "worker-1", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, keeper);
}

#[tokio::test]
async fn stuck_leases_are_reclaimed_with_a_retry_charge() {
    let store = setup().await;
    let id = insert_at(&store, &new_message("plant/temp", Priority::Normal), now_millis()).await;

    store.claim(1, "worker-1", Duration::ZERO).await.unwrap();
    let reclaimed = store.reclaim_stuck(now_millis() + 10).await.unwrap();
    assert_eq!(reclaimed, 1);

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, Status::Pending);
    assert_eq!(row.retry_count, 1);
    assert_none!(row.lease_owner);

    // A live lease is not touched.
    store.claim(1, "worker-1", Duration::from_secs(60)).await.unwrap();
    assert_eq!(store.reclaim_stuck(now_millis()).await.unwrap(), 0);
}

#[tokio::test]
async fn startup_recovery_ignores_lease_deadlines() {
    let tmpdir = tempfile::tempdir().unwrap();
    let path = tmpdir.path().join("buffer.db");

    {
        let store = Store::open(&path).await.unwrap();
        for i in 0..5 {
            let message = new_message(&format!("plant/{i}"), Priority::Normal);
            store
                .insert(&message, now_millis(), now_millis() + 3_600_000)
                .await
                .unwrap();
        }
        let claimed = store
            .claim(10, "worker-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 5);
        store.close().await;
        // Dropped with leases still held, as after kill -9.
    }

    let store = Store::open(&path).await.unwrap();
    assert_eq!(store.recover_abandoned().await.unwrap(), 5);

    let pending = store.pending_messages(10).await.unwrap();
    assert_eq!(pending.len(), 5);
    assert!(pending.iter().all(|m| m.retry_count == 1));
    assert!(pending.iter().all(|m| m.retry_count <= m.max_retries));
}

#[tokio::test]
async fn reset_keeps_retry_count_and_last_error() {
    let store = setup().await;
    let id = insert_at(&store, &new_message("plant/temp", Priority::Normal), now_millis()).await;

    store.claim(1, "worker-1", Duration::from_secs(60)).await.unwrap();
    store
        .fail_retry(id, "first failure", Duration::ZERO)
        .await
        .unwrap();
    store.claim(1, "worker-1", Duration::from_secs(60)).await.unwrap();

    assert_eq!(store.reset_processing().await.unwrap(), 1);

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, Status::Pending);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("first failure"));
}

#[tokio::test]
async fn cleanup_is_idempotent() {
    let store = setup().await;
    let message = new_message("plant/temp", Priority::Normal);

    for _ in 0..3 {
        let id = insert_at(&store, &message, now_millis()).await;
        store.claim(1, "worker-1", Duration::from_secs(60)).await.unwrap();
        store.complete(id).await.unwrap();
    }
    let survivor = insert_at(&store, &message, now_millis()).await;

    let cutoff = now_millis() + 1000;
    assert_eq!(store.cleanup(cutoff).await.unwrap(), 3);
    assert_eq!(store.cleanup(cutoff).await.unwrap(), 0);

    let row = store.get(survivor).await.unwrap().unwrap();
    assert_eq!(row.status, Status::Pending);
}

#[tokio::test]
async fn coalescing_replaces_the_pending_row() {
    let store = setup().await;
    let now = now_millis();
    let message = new_message("plant/temp", Priority::Normal);
    let id = store.insert(&message, now, now + 1000).await.unwrap();

    let mut update = message.clone();
    update.value = "23.1".to_owned();
    let coalesced = store
        .coalesce_pending(&update, now + 500, now + 1500)
        .await
        .unwrap();
    assert_eq!(coalesced, Some(id));

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.value, "23.1");
    assert_eq!(row.created_at, now + 500);
    assert_eq!(row.expire_at, now + 1500);

    // Coalescing only applies within the same priority stream.
    let mut other_priority = update.clone();
    other_priority.priority = Priority::High;
    let miss = store
        .coalesce_pending(&other_priority, now, now + 1000)
        .await
        .unwrap();
    assert_none!(miss);

    // Claimed rows are never replaced.
    store.claim(1, "worker-1", Duration::from_secs(60)).await.unwrap();
    let miss = store
        .coalesce_pending(&update, now, now + 1000)
        .await
        .unwrap();
    assert_none!(miss);
}

#[tokio::test]
async fn sidecar_lock_rejects_a_second_bridge() {
    let tmpdir = tempfile::tempdir().unwrap();
    let path = tmpdir.path().join("buffer.db");

    let first = Store::open_exclusive(&path).await.unwrap();
    let second = Store::open_exclusive(&path).await;
    assert!(second.is_err());

    // The CLI's non-exclusive open still works alongside the bridge.
    let reader = Store::open(&path).await.unwrap();
    reader.close().await;

    first.close().await;
    drop(first);

    let third = Store::open_exclusive(&path).await.unwrap();
    third.close().await;
}

#[tokio::test]
async fn snapshots_record_the_closed_metric_set() {
    let store = setup().await;
    let counters = Arc::new(Counters::default());
    counters.enqueued();
    counters.enqueued();
    counters.retried(3);

    let store = Arc::new(store.store);
    let recorder = StatsRecorder::new(Arc::clone(&store), Arc::clone(&counters));
    recorder.flush().await.unwrap();

    let snapshot = store.latest_snapshot().await.unwrap();
    let names: Vec<&str> = snapshot.iter().map(|m| m.metric_name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "completed",
            "enqueued",
            "expired",
            "failed",
            "pending_current",
            "processing_current",
            "retried",
            "throughput_per_minute",
        ]
    );

    let enqueued = snapshot
        .iter()
        .find(|m| m.metric_name == "enqueued")
        .unwrap();
    assert_eq!(enqueued.metric_value, 2.0);

    // Counters drain on flush.
    recorder.flush().await.unwrap();
    let snapshot = store.latest_snapshot().await.unwrap();
    let enqueued = snapshot
        .iter()
        .find(|m| m.metric_name == "enqueued")
        .unwrap();
    assert_eq!(enqueued.metric_value, 0.0);
}

#[tokio::test]
async fn integrity_check_passes_on_a_healthy_store() {
    let store = setup().await;
    insert_at(&store, &new_message("plant/temp", Priority::Normal), now_millis()).await;
    store.integrity_check().await.unwrap();
}
