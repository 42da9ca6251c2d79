#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use telebridge::buffer::{Buffer, BufferOptions, EnqueueRequest};
use telebridge::stats::Counters;
use telebridge::store::Store;
use telebridge::{BridgeError, DataType, Destination, Priority, Source};

async fn setup(max_size: i64) -> (Arc<Store>, Buffer, TempDir) {
    let tmpdir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(tmpdir.path().join("buffer.db")).await.unwrap());
    let buffer = Buffer::new(
        Arc::clone(&store),
        BufferOptions {
            max_size,
            default_ttl: Duration::from_secs(60),
            default_max_retries: 5,
        },
        Arc::new(Counters::default()),
    );
    (store, buffer, tmpdir)
}

fn request(topic: &str, priority: Priority) -> EnqueueRequest {
    EnqueueRequest {
        source: Source::Mqtt,
        destination: Destination::Opcua,
        topic_or_node: topic.to_owned(),
        value: "22.5".to_owned(),
        data_type: DataType::Float,
        priority,
        max_retries: None,
        ttl: None,
        coalesce: false,
    }
}

#[tokio::test]
async fn enqueue_applies_defaults() {
    let (store, buffer, _tmpdir) = setup(100).await;

    let id = buffer.enqueue(request("plant/temp", Priority::Normal)).await.unwrap();
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.max_retries, 5);
    assert_eq!(row.expire_at, row.created_at + 60_000);
    assert_eq!(row.next_attempt_at, row.created_at);
}

#[tokio::test]
async fn empty_routing_key_is_rejected() {
    let (_store, buffer, _tmpdir) = setup(100).await;

    let result = buffer.enqueue(request("  ", Priority::Normal)).await;
    assert!(matches!(result, Err(BridgeError::Configuration(_))));
}

#[tokio::test]
async fn soft_cap_rejects_non_critical_but_admits_critical() {
    let (_store, buffer, _tmpdir) = setup(2).await;

    buffer.enqueue(request("a", Priority::Normal)).await.unwrap();
    buffer.enqueue(request("b", Priority::Low)).await.unwrap();

    let overflow = buffer.enqueue(request("c", Priority::Normal)).await;
    assert!(matches!(overflow, Err(BridgeError::BufferFull)));

    // Critical traffic bypasses the soft cap.
    buffer.enqueue(request("d", Priority::Critical)).await.unwrap();
}

#[tokio::test]
async fn coalescing_enqueue_updates_in_place() {
    let (store, buffer, _tmpdir) = setup(100).await;

    let mut first = request("plant/temp", Priority::Normal);
    first.coalesce = true;
    let id = buffer.enqueue(first.clone()).await.unwrap();

    let mut second = first.clone();
    second.value = "23.0".to_owned();
    let coalesced = buffer.enqueue(second).await.unwrap();
    assert_eq!(coalesced, id);

    assert_eq!(store.pending_count().await.unwrap(), 1);
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.value, "23.0");

    // Without the flag a duplicate row is inserted.
    let separate = buffer.enqueue(first).await.unwrap();
    assert_ne!(separate, id);
    assert_eq!(store.pending_count().await.unwrap(), 2);
}

#[tokio::test]
async fn per_message_overrides_beat_defaults() {
    let (store, buffer, _tmpdir) = setup(100).await;

    let mut req = request("plant/temp", Priority::Normal);
    req.max_retries = Some(1);
    req.ttl = Some(Duration::from_secs(3));
    let id = buffer.enqueue(req).await.unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.max_retries, 1);
    assert_eq!(row.expire_at, row.created_at + 3_000);
}
