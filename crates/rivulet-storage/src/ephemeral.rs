//! Ephemeral Stream Store
//!
//! Ephemeral streams (large media uploads) are written as independent chunks
//! in any order. Chunk 0 is the genesis and declares how many chunks follow.
//! Once all chunks are present the stream is **normalized**: the ephemeral
//! flag is cleared and a minipool is seeded so it behaves like any other
//! stream from then on.
//!
//! ```text
//! create(genesis) ──▶ write(chunk n)* ──▶ normalize ──▶ regular stream
//!        │                                     │
//!   monitor.on_created                    monitor.on_sealed
//! ```
//!
//! Streams never normalized are deleted by the [`EphemeralStreamMonitor`]
//! once their TTL expires.
//!
//! [`EphemeralStreamMonitor`]: crate::monitor::EphemeralStreamMonitor

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::{PgConnection, Row};
use tracing::debug;

use crate::consistency::check_ephemeral_chunks;
use crate::error::{ErrorKind, Result, StorageError};
use crate::monitor::EphemeralStreamCleaner;
use crate::partition::{drop_stream_partitions, sql_for_stream};
use crate::store::{
    create_stream_rows, insert_minipool_sentinel, stream_tags, PostgresStreamStore, StoreCore,
};
use crate::stream_id::{BlockHash, StreamId};
use crate::tx_runner::{AccessMode, RunOpts, Tags};
use crate::types::MiniblockData;
use crate::EphemeralStreamStorage;

/// What the store needs to know about an ephemeral genesis chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenesisInfo {
    pub chunk_count: i64,
    pub hash: BlockHash,
}

/// Decodes the inception metadata carried by chunk 0. Payloads are opaque
/// to the rest of the store.
pub trait GenesisInspector: Send + Sync {
    fn inspect(&self, genesis: &[u8]) -> Result<GenesisInfo>;
}

/// Reads a JSON header `{"chunk_count": N, ...}` and hashes the whole chunk
/// with SHA-256.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonGenesisInspector;

#[derive(Deserialize)]
struct JsonInception {
    chunk_count: i64,
}

impl GenesisInspector for JsonGenesisInspector {
    fn inspect(&self, genesis: &[u8]) -> Result<GenesisInfo> {
        let inception: JsonInception = serde_json::from_slice(genesis).map_err(|e| {
            StorageError::internal(format!("Failed to decode genesis miniblock: {}", e))
        })?;
        if inception.chunk_count < 0 {
            return Err(StorageError::internal("Negative chunk count in genesis miniblock")
                .tag("ChunkCount", inception.chunk_count));
        }
        let digest: [u8; 32] = Sha256::digest(genesis).into();
        Ok(GenesisInfo {
            chunk_count: inception.chunk_count,
            hash: BlockHash::new(digest),
        })
    }
}

async fn lock_ephemeral_stream(
    conn: &mut PgConnection,
    stream_id: &StreamId,
    write: bool,
) -> Result<()> {
    let sql = if write {
        "SELECT 1 FROM es WHERE stream_id = $1 AND ephemeral IS TRUE FOR UPDATE"
    } else {
        "SELECT 1 FROM es WHERE stream_id = $1 AND ephemeral IS TRUE"
    };
    let row = sqlx::query(sql)
        .bind(stream_id.to_hex())
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(_) => Ok(()),
        None => Err(StorageError::not_found("Ephemeral stream not found").tag("stream_id", stream_id)),
    }
}

async fn upsert_chunk(
    conn: &mut PgConnection,
    stream_id: &StreamId,
    number: i64,
    data: &[u8],
) -> Result<()> {
    sqlx::query(&sql_for_stream(
        "INSERT INTO {{miniblocks}} (stream_id, seq_num, blockdata) VALUES ($1, $2, $3) \
         ON CONFLICT (stream_id, seq_num) DO UPDATE SET blockdata = EXCLUDED.blockdata",
        stream_id,
    ))
    .bind(stream_id.to_hex())
    .bind(number)
    .bind(data)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_ephemeral_stream_storage_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
    genesis: Bytes,
) -> Result<()> {
    create_stream_rows(conn, &stream_id, true).await?;
    upsert_chunk(conn, &stream_id, 0, &genesis).await
}

/// Returns true when the stream record had to be created.
async fn write_ephemeral_miniblock_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
    chunk: MiniblockData,
) -> Result<bool> {
    let created = match lock_ephemeral_stream(conn, &stream_id, true).await {
        Ok(()) => false,
        Err(e) if e.is(ErrorKind::NotFound) => {
            // Chunk raced ahead of create; a non-ephemeral stream fails here as AlreadyExists.
            create_stream_rows(conn, &stream_id, true).await?;
            true
        }
        Err(e) => return Err(e),
    };
    upsert_chunk(conn, &stream_id, chunk.number, &chunk.data).await?;
    Ok(created)
}

async fn read_chunk_numbers(conn: &mut PgConnection, stream_id: &StreamId) -> Result<Vec<i64>> {
    let rows = sqlx::query(&sql_for_stream(
        "SELECT seq_num FROM {{miniblocks}} WHERE stream_id = $1 ORDER BY seq_num",
        stream_id,
    ))
    .bind(stream_id.to_hex())
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.iter().map(|r| r.get("seq_num")).collect())
}

async fn read_ephemeral_miniblock_nums_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
) -> Result<Vec<i64>> {
    lock_ephemeral_stream(conn, &stream_id, false).await?;
    read_chunk_numbers(conn, &stream_id).await
}

async fn normalize_ephemeral_stream_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
    inspector: Arc<dyn GenesisInspector>,
) -> Result<BlockHash> {
    lock_ephemeral_stream(conn, &stream_id, true).await?;

    let genesis: Vec<u8> = sqlx::query(&sql_for_stream(
        "SELECT blockdata FROM {{miniblocks}} WHERE stream_id = $1 AND seq_num = 0",
        &stream_id,
    ))
    .bind(stream_id.to_hex())
    .fetch_optional(&mut *conn)
    .await?
    .map(|r| r.get("blockdata"))
    .ok_or_else(|| {
        StorageError::not_found("Genesis miniblock of the ephemeral stream not found")
            .tag("stream_id", stream_id)
    })?;

    let info = inspector.inspect(&genesis)?;
    let nums = read_chunk_numbers(conn, &stream_id).await?;
    check_ephemeral_chunks(&nums, info.chunk_count).map_err(|e| e.tag("stream_id", stream_id))?;

    sqlx::query("UPDATE es SET ephemeral = FALSE WHERE stream_id = $1")
        .bind(stream_id.to_hex())
        .execute(&mut *conn)
        .await?;
    insert_minipool_sentinel(conn, &stream_id, info.chunk_count + 1).await?;

    Ok(info.hash)
}

async fn is_stream_ephemeral_tx(conn: &mut PgConnection, stream_id: StreamId) -> Result<bool> {
    let row = sqlx::query("SELECT ephemeral FROM es WHERE stream_id = $1")
        .bind(stream_id.to_hex())
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(row.get("ephemeral")),
        None => Err(StorageError::not_found("Stream not found").tag("stream_id", stream_id)),
    }
}

async fn load_ephemeral_streams_tx(
    conn: &mut PgConnection,
) -> Result<Vec<(StreamId, DateTime<Utc>)>> {
    let rows = sqlx::query("SELECT stream_id, created_at FROM es WHERE ephemeral IS TRUE")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|r| {
            let id = StreamId::from_hex(r.get::<&str, _>("stream_id"))?;
            Ok((id, r.get("created_at")))
        })
        .collect()
}

async fn delete_ephemeral_stream_tx(conn: &mut PgConnection, stream_id: StreamId) -> Result<()> {
    lock_ephemeral_stream(conn, &stream_id, true).await?;
    drop_stream_partitions(conn, &stream_id).await?;
    sqlx::query("DELETE FROM es WHERE stream_id = $1")
        .bind(stream_id.to_hex())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait]
impl EphemeralStreamStorage for PostgresStreamStore {
    async fn create_ephemeral_stream_storage(
        &self,
        stream_id: &StreamId,
        genesis: Bytes,
    ) -> Result<()> {
        let id = *stream_id;
        self.runner()
            .run(
                "create_ephemeral_stream_storage",
                AccessMode::ReadWrite,
                self.write_opts(),
                stream_tags(stream_id),
                move |conn| Box::pin(create_ephemeral_stream_storage_tx(conn, id, genesis.clone())),
            )
            .await?;
        self.monitor.on_created(*stream_id);
        Ok(())
    }

    async fn write_ephemeral_miniblock(
        &self,
        stream_id: &StreamId,
        chunk: MiniblockData,
    ) -> Result<()> {
        let id = *stream_id;
        let mut tags = stream_tags(stream_id);
        tags.push(("number", chunk.number.to_string()));
        let created = self
            .runner()
            .run(
                "write_ephemeral_miniblock",
                AccessMode::ReadWrite,
                self.write_opts(),
                tags,
                move |conn| Box::pin(write_ephemeral_miniblock_tx(conn, id, chunk.clone())),
            )
            .await?;
        if created {
            debug!(stream_id = %stream_id, "Ephemeral stream created by chunk write");
            self.monitor.on_created(*stream_id);
        }
        Ok(())
    }

    async fn read_ephemeral_miniblock_nums(&self, stream_id: &StreamId) -> Result<Vec<i64>> {
        let id = *stream_id;
        self.runner()
            .run(
                "read_ephemeral_miniblock_nums",
                AccessMode::ReadOnly,
                RunOpts::default(),
                stream_tags(stream_id),
                move |conn| Box::pin(read_ephemeral_miniblock_nums_tx(conn, id)),
            )
            .await
    }

    async fn normalize_ephemeral_stream(&self, stream_id: &StreamId) -> Result<BlockHash> {
        let id = *stream_id;
        let inspector = self.inspector.clone();
        let hash = self
            .runner()
            .run(
                "normalize_ephemeral_stream",
                AccessMode::ReadWrite,
                self.write_opts(),
                stream_tags(stream_id),
                move |conn| Box::pin(normalize_ephemeral_stream_tx(conn, id, inspector.clone())),
            )
            .await?;
        self.monitor.on_sealed(stream_id);
        Ok(hash)
    }

    async fn is_stream_ephemeral(&self, stream_id: &StreamId) -> Result<bool> {
        let id = *stream_id;
        self.runner()
            .run(
                "is_stream_ephemeral",
                AccessMode::ReadOnly,
                RunOpts::default().with_timeout(self.core.config.write_timeout()),
                stream_tags(stream_id),
                move |conn| Box::pin(is_stream_ephemeral_tx(conn, id)),
            )
            .await
    }
}

#[async_trait]
impl EphemeralStreamCleaner for StoreCore {
    async fn load_ephemeral_streams(&self) -> Result<Vec<(StreamId, DateTime<Utc>)>> {
        self.runner
            .run(
                "load_ephemeral_streams",
                AccessMode::ReadOnly,
                RunOpts::default(),
                Tags::new(),
                |conn| Box::pin(load_ephemeral_streams_tx(conn)),
            )
            .await
    }

    async fn delete_ephemeral_stream(&self, stream_id: &StreamId) -> Result<()> {
        let id = *stream_id;
        self.runner
            .run(
                "delete_ephemeral_stream",
                AccessMode::ReadWrite,
                RunOpts::expect_not_found().with_timeout(self.config.write_timeout()),
                stream_tags(stream_id),
                move |conn| Box::pin(delete_ephemeral_stream_tx(conn, id)),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_inspector_reads_chunk_count() {
        let genesis = br#"{"chunk_count": 3, "content_type": "image/png"}"#;
        let info = JsonGenesisInspector.inspect(genesis).unwrap();
        assert_eq!(info.chunk_count, 3);

        let digest: [u8; 32] = Sha256::digest(genesis).into();
        assert_eq!(info.hash, BlockHash::new(digest));
    }

    #[test]
    fn test_json_inspector_rejects_garbage() {
        let err = JsonGenesisInspector.inspect(b"\x00\x01").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        let err = JsonGenesisInspector
            .inspect(br#"{"chunk_count": -1}"#)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
