//! Archive Store
//!
//! Read-only mirrors keep an append-only copy of finalized miniblocks. An
//! archived stream has a stream record with snapshot `-1` and only a
//! miniblocks partition: no minipool, no candidates.

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::PgConnection;

use crate::error::{ErrorKind, Result, StorageError};
use crate::partition::{create_stream_partitions, LogicalTable};
use crate::store::{insert_miniblocks, last_miniblock_number, lock_stream, stream_tags, PostgresStreamStore};
use crate::stream_id::StreamId;
use crate::tx_runner::{AccessMode, RunOpts};
use crate::ArchiveStreamStorage;

async fn create_stream_archive_storage_tx(conn: &mut PgConnection, stream_id: StreamId) -> Result<()> {
    sqlx::query("INSERT INTO es (stream_id, latest_snapshot_miniblock, ephemeral) VALUES ($1, -1, FALSE)")
        .bind(stream_id.to_hex())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            StorageError::from(e)
                .duplicate_as_already_exists()
                .tag("stream_id", stream_id)
        })?;
    create_stream_partitions(conn, &stream_id, &[LogicalTable::Miniblocks]).await
}

async fn get_max_archived_miniblock_number_tx(conn: &mut PgConnection, stream_id: StreamId) -> Result<i64> {
    let exists = sqlx::query("SELECT 1 FROM es WHERE stream_id = $1")
        .bind(stream_id.to_hex())
        .fetch_optional(&mut *conn)
        .await?
        .is_some();
    if !exists {
        return Err(StorageError::not_found("Stream not found").tag("stream_id", stream_id));
    }
    Ok(last_miniblock_number(conn, &stream_id).await?.unwrap_or(-1))
}

async fn write_archive_miniblocks_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
    start: i64,
    miniblocks: Vec<Bytes>,
) -> Result<()> {
    lock_stream(conn, &stream_id, true).await?;

    let max_archived = last_miniblock_number(conn, &stream_id).await?.unwrap_or(-1);
    if start != max_archived + 1 {
        return Err(StorageError::new(ErrorKind::BadBlock, "Miniblock number mismatch")
            .tag("ExpectedBlockNumber", max_archived + 1)
            .tag("ActualBlockNumber", start)
            .tag("stream_id", stream_id));
    }

    let numbers: Vec<i64> = (start..start + miniblocks.len() as i64).collect();
    let data: Vec<Vec<u8>> = miniblocks.iter().map(|mb| mb.to_vec()).collect();
    insert_miniblocks(conn, &stream_id, numbers, data).await
}

#[async_trait]
impl ArchiveStreamStorage for PostgresStreamStore {
    async fn create_stream_archive_storage(&self, stream_id: &StreamId) -> Result<()> {
        let id = *stream_id;
        self.runner()
            .run(
                "create_stream_archive_storage",
                AccessMode::ReadWrite,
                self.write_opts(),
                stream_tags(stream_id),
                move |conn| Box::pin(create_stream_archive_storage_tx(conn, id)),
            )
            .await
    }

    async fn get_max_archived_miniblock_number(&self, stream_id: &StreamId) -> Result<i64> {
        let id = *stream_id;
        self.runner()
            .run(
                "get_max_archived_miniblock_number",
                AccessMode::ReadOnly,
                RunOpts::expect_not_found(),
                stream_tags(stream_id),
                move |conn| Box::pin(get_max_archived_miniblock_number_tx(conn, id)),
            )
            .await
    }

    async fn write_archive_miniblocks(
        &self,
        stream_id: &StreamId,
        start: i64,
        miniblocks: Vec<Bytes>,
    ) -> Result<()> {
        if miniblocks.is_empty() {
            return Ok(());
        }
        let id = *stream_id;
        let mut tags = stream_tags(stream_id);
        tags.push(("start", start.to_string()));
        tags.push(("count", miniblocks.len().to_string()));
        self.runner()
            .run(
                "write_archive_miniblocks",
                AccessMode::ReadWrite,
                self.write_opts(),
                tags,
                move |conn| Box::pin(write_archive_miniblocks_tx(conn, id, start, miniblocks.clone())),
            )
            .await
    }
}
