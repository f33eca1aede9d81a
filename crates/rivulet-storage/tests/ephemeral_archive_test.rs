//! Integration tests for ephemeral streams and archive storage.

mod common;

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use rivulet_storage::{
    ArchiveStreamStorage, EphemeralStreamStorage, ErrorKind, GenesisInspector,
    JsonGenesisInspector, MiniblockData, StreamStorage,
};

use common::{channel, media, open};

fn genesis(chunk_count: i64) -> Bytes {
    Bytes::from(format!(r#"{{"chunk_count": {}}}"#, chunk_count))
}

fn chunk(n: i64) -> MiniblockData {
    MiniblockData::new(n, format!("chunk-{}", n).into_bytes())
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_ephemeral_normalization_round_trip() {
    let t = open().await;
    let store = &t.store;
    let s = media(1);

    store.create_ephemeral_stream_storage(&s, genesis(3)).await.unwrap();
    assert!(store.monitor().contains(&s));
    assert!(store.is_stream_ephemeral(&s).await.unwrap());

    for n in [3, 1, 2] {
        store.write_ephemeral_miniblock(&s, chunk(n)).await.unwrap();
    }
    // Rewriting a chunk replaces it.
    store.write_ephemeral_miniblock(&s, chunk(2)).await.unwrap();
    assert_eq!(
        store.read_ephemeral_miniblock_nums(&s).await.unwrap(),
        vec![0, 1, 2, 3]
    );

    let hash = store.normalize_ephemeral_stream(&s).await.unwrap();
    let expected = JsonGenesisInspector.inspect(&genesis(3)).unwrap().hash;
    assert_eq!(hash, expected);

    assert!(!store.is_stream_ephemeral(&s).await.unwrap());
    assert!(!store.monitor().contains(&s));

    // Normalized streams behave like regular streams.
    let result = store.read_stream_from_last_snapshot(&s, 10).await.unwrap();
    assert_eq!(result.miniblocks.len(), 4);
    store.write_event(&s, 4, 0, Bytes::from_static(b"e0")).await.unwrap();

    let err = store.read_ephemeral_miniblock_nums(&s).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    t.store.close().await;
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_normalize_with_missing_chunk_fails() {
    let t = open().await;
    let store = &t.store;
    let s = media(2);

    store.create_ephemeral_stream_storage(&s, genesis(3)).await.unwrap();
    store.write_ephemeral_miniblock(&s, chunk(1)).await.unwrap();
    store.write_ephemeral_miniblock(&s, chunk(3)).await.unwrap();

    let err = store.normalize_ephemeral_stream(&s).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.message().contains("missing chunks"));

    assert!(store.is_stream_ephemeral(&s).await.unwrap());
    assert!(store.monitor().contains(&s));

    t.store.close().await;
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_chunk_before_create_registers_stream() {
    let t = open().await;
    let store = &t.store;
    let s = media(3);

    store.write_ephemeral_miniblock(&s, chunk(1)).await.unwrap();
    assert!(store.is_stream_ephemeral(&s).await.unwrap());
    assert!(store.monitor().contains(&s));
    assert_eq!(store.read_ephemeral_miniblock_nums(&s).await.unwrap(), vec![1]);

    // The late create finds the record already there.
    let err = store
        .create_ephemeral_stream_storage(&s, genesis(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    // Chunks for a regular stream are rejected.
    let regular = channel(3);
    store
        .create_stream_storage(&regular, Bytes::from_static(b"g"))
        .await
        .unwrap();
    let err = store
        .write_ephemeral_miniblock(&regular, chunk(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let err = store.is_stream_ephemeral(&media(99)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    t.store.close().await;
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_monitor_deletes_expired_streams() {
    let t = open().await;
    let store = &t.store;
    let expired = media(4);
    let sealed = media(5);

    store.create_ephemeral_stream_storage(&expired, genesis(0)).await.unwrap();
    store.create_ephemeral_stream_storage(&sealed, genesis(0)).await.unwrap();
    store.normalize_ephemeral_stream(&sealed).await.unwrap();

    let later = Utc::now() + chrono::Duration::hours(1);
    assert_eq!(store.monitor().sweep_at(later).await, 1);

    let err = store.is_stream_ephemeral(&expired).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!store.is_stream_ephemeral(&sealed).await.unwrap());
    assert_eq!(store.get_streams().await.unwrap(), vec![sealed]);

    t.store.close().await;
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_monitor_reloads_ephemeral_streams_on_open() {
    let schema = common::test_schema();
    let first = common::open_in(&schema, "instance-a").await;
    let s = media(6);
    first
        .store
        .create_ephemeral_stream_storage(&s, genesis(2))
        .await
        .unwrap();
    first.store.close().await;

    let second = common::open_in(&schema, "instance-b").await;
    let mut loaded = false;
    for _ in 0..50 {
        if second.store.monitor().contains(&s) {
            loaded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(loaded, "monitor did not load the persisted ephemeral stream");

    second.store.close().await;
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_archive_storage() {
    let t = open().await;
    let store = &t.store;
    let s = channel(20);

    let err = store.get_max_archived_miniblock_number(&s).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    store.create_stream_archive_storage(&s).await.unwrap();
    assert_eq!(store.get_max_archived_miniblock_number(&s).await.unwrap(), -1);

    let err = store.create_stream_archive_storage(&s).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let blocks = |range: std::ops::Range<i64>| -> Vec<Bytes> {
        range.map(|n| Bytes::from(format!("mb{}", n))).collect()
    };

    store.write_archive_miniblocks(&s, 0, blocks(0..3)).await.unwrap();
    assert_eq!(store.get_max_archived_miniblock_number(&s).await.unwrap(), 2);

    let err = store
        .write_archive_miniblocks(&s, 5, blocks(5..6))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadBlock);
    assert_eq!(err.tag_value("ExpectedBlockNumber"), Some("3"));

    let err = store
        .write_archive_miniblocks(&s, 2, blocks(2..4))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadBlock);

    store.write_archive_miniblocks(&s, 3, blocks(3..5)).await.unwrap();
    assert_eq!(store.get_max_archived_miniblock_number(&s).await.unwrap(), 4);
    assert_eq!(store.read_miniblocks(&s, 0, 5).await.unwrap(), blocks(0..5));

    t.store.close().await;
}
