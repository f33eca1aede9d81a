//! Integration tests for single-writer enforcement across instances.

mod common;

use std::time::Duration;

use bytes::Bytes;
use rivulet_storage::{ErrorKind, StreamStorage};

use common::{channel, open_in, test_schema};

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_second_instance_takes_over_schema() {
    let schema = test_schema();
    let mut first = open_in(&schema, "instance-a").await;
    let s = channel(1);
    first
        .store
        .create_stream_storage(&s, Bytes::from_static(b"g"))
        .await
        .unwrap();

    let second = open_in(&schema, "instance-b").await;

    let lost = tokio::time::timeout(Duration::from_secs(5), first.exit_rx.recv())
        .await
        .expect("first instance was not notified")
        .expect("exit channel closed");
    assert_eq!(lost.kind(), ErrorKind::ResourceExhausted);

    // Writes from the superseded instance are rejected before commit.
    let err = first
        .store
        .write_event(&s, 1, 0, Bytes::from_static(b"late"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

    // The new leader reads and writes normally.
    assert_eq!(
        second.store.read_miniblocks(&s, 0, 1).await.unwrap(),
        vec![Bytes::from_static(b"g")]
    );
    second
        .store
        .write_event(&s, 1, 0, Bytes::from_static(b"e0"))
        .await
        .unwrap();

    first.store.close().await;
    second.store.close().await;
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_close_releases_identity() {
    let schema = test_schema();
    let first = open_in(&schema, "instance-a").await;
    first.store.close().await;

    let pool = common::raw_pool(&schema).await;
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instance_leadership")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);

    let mut second = open_in(&schema, "instance-b").await;
    second
        .store
        .create_stream_storage(&channel(2), Bytes::from_static(b"g"))
        .await
        .unwrap();
    assert!(second.exit_rx.try_recv().is_err());

    second.store.close().await;
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_recent_transactions_buffer() {
    let schema = test_schema();
    let (exit_tx, _exit_rx) = tokio::sync::mpsc::channel(1);
    let mut config = common::test_config(&schema);
    config.tx_debug_buffer_size = 16;
    let store = rivulet_storage::PostgresStreamStore::open(config, "instance-a", exit_tx)
        .await
        .unwrap();

    store
        .create_stream_storage(&channel(3), Bytes::from_static(b"g"))
        .await
        .unwrap();
    let events = store.recent_transactions();
    assert!(events.iter().any(|e| e.name == "create_stream_storage"));

    store.close().await;
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_other_schema_does_not_supersede() {
    let mut first = open_in(&test_schema(), "instance-a").await;
    let second = open_in(&test_schema(), "instance-b").await;

    let received = tokio::time::timeout(Duration::from_millis(500), first.exit_rx.recv()).await;
    assert!(received.is_err(), "instance on another schema fired the exit signal");

    // Still the leader of its own schema.
    first
        .store
        .create_stream_storage(&channel(4), Bytes::from_static(b"g"))
        .await
        .unwrap();

    first.store.close().await;
    second.store.close().await;
}
