//! PostgreSQL Stream Store
//!
//! Implements [`StreamStorage`] on top of sqlx and Postgres 14+.
//!
//! ## Tables
//!
//! | Table | Key | Contents |
//! |-------|-----|----------|
//! | `es` | `stream_id` | snapshot pointer, ephemeral flag |
//! | `miniblocks_<sfx>` | `stream_id, seq_num` | committed miniblocks |
//! | `minipools_<sfx>` | `stream_id, generation, slot_num` | pending envelopes + `-1` sentinel |
//! | `miniblock_candidates_<sfx>` | `stream_id, seq_num, block_hash` | proposals |
//! | `instance_leadership` | `identity` | current writer |
//!
//! Queries go through [`sql_for_stream`] so they hit the stream's child
//! tables directly.
//!
//! ## Startup
//!
//! [`PostgresStreamStore::open`]:
//!
//! 1. builds the regular and streaming pools with `search_path` set to the schema
//! 2. creates the schema and runs the embedded migrations
//! 3. takes over the schema with a [`LeadershipGuard`]
//! 4. starts the [`EphemeralStreamMonitor`]
//!
//! ## Runtime Queries
//!
//! Table names depend on the stream, so all statements use `sqlx::query`
//! with `Row::get` instead of the compile-time checked macros.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool, Row};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::consistency::{
    check_gapless, check_minipool_for_append, check_minipool_for_read, snapshot_offset,
};
use crate::ephemeral::{GenesisInspector, JsonGenesisInspector};
use crate::error::{ErrorKind, Result, StorageError};
use crate::leadership::LeadershipGuard;
use crate::monitor::{EphemeralStreamCleaner, EphemeralStreamMonitor};
use crate::partition::{create_stream_partitions, drop_stream_partitions, sql_for_stream, LogicalTable};
use crate::stream_id::{BlockHash, StreamId};
use crate::tx_runner::{split_connections, AccessMode, RunOpts, Tags, TxEvent, TxRunner};
use crate::types::*;
use crate::StreamStorage;

const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn stream_tags(stream_id: &StreamId) -> Tags {
    vec![("stream_id", stream_id.to_hex())]
}

/// State shared between the store handle and the ephemeral stream monitor.
pub(crate) struct StoreCore {
    pub(crate) runner: TxRunner,
    pub(crate) guard: Arc<LeadershipGuard>,
    pub(crate) config: DatabaseConfig,
}

impl StoreCore {
    /// Options for read-write transactions, bounded by the configured write timeout.
    pub(crate) fn write_opts(&self) -> RunOpts {
        RunOpts::default().with_timeout(self.config.write_timeout())
    }
}

#[derive(Clone)]
pub struct PostgresStreamStore {
    pub(crate) core: Arc<StoreCore>,
    pub(crate) monitor: Arc<EphemeralStreamMonitor>,
    pub(crate) inspector: Arc<dyn GenesisInspector>,
}

impl PostgresStreamStore {
    /// Connect, migrate, take over the schema and start background tasks.
    ///
    /// `exit_tx` receives a `ResourceExhausted` error if another instance
    /// later takes over the same schema; the owning process should shut down.
    pub async fn open(
        config: DatabaseConfig,
        instance_id: impl Into<String>,
        exit_tx: mpsc::Sender<StorageError>,
    ) -> Result<Self> {
        config.validate()?;
        rivulet_observability::metrics::init();
        let instance_id = instance_id.into();

        let connect_options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| {
                StorageError::new(ErrorKind::Config, format!("invalid database url: {}", e))
            })?
            .options([("search_path", config.schema.as_str())]);

        let (regular_size, streaming_size) =
            split_connections(config.max_connections, config.streaming_ratio());

        let regular = PgPoolOptions::new()
            .max_connections(regular_size)
            .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
            .connect_with(connect_options.clone())
            .await?;
        let streaming = PgPoolOptions::new()
            .max_connections(streaming_size)
            .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
            .connect_with(connect_options)
            .await
            .map_err(StorageError::from);
        let streaming = close_on_err(&[&regular], streaming).await?;

        close_on_err(&[&regular, &streaming], prepare_schema(&regular, &config.schema).await)
            .await?;

        info!(
            schema = %config.schema,
            regular_connections = regular_size,
            streaming_connections = streaming_size,
            isolation = config.isolation_level.as_sql(),
            "Storage schema ready"
        );

        let runner = TxRunner::new(
            regular,
            streaming,
            &config.schema,
            config.isolation_level,
            config.tx_debug_buffer_size,
        );
        let guard = close_on_err(
            &[runner.regular_pool(), runner.streaming_pool()],
            LeadershipGuard::acquire(&runner, &instance_id, config.startup_delay(), exit_tx).await,
        )
        .await?;
        let runner = runner.with_guard(guard.clone());

        let monitor_config = config.ephemeral_monitor.clone();
        let core = Arc::new(StoreCore {
            runner,
            guard,
            config,
        });
        let cleaner: Arc<dyn EphemeralStreamCleaner> = core.clone();
        let monitor = EphemeralStreamMonitor::start(cleaner, monitor_config);

        Ok(Self {
            core,
            monitor,
            inspector: Arc::new(JsonGenesisInspector),
        })
    }

    /// Replace the decoder used to read ephemeral genesis chunks.
    pub fn with_genesis_inspector(mut self, inspector: Arc<dyn GenesisInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn schema(&self) -> &str {
        &self.core.config.schema
    }

    pub fn instance_id(&self) -> &str {
        self.core.guard.instance_id()
    }

    pub fn monitor(&self) -> &EphemeralStreamMonitor {
        &self.monitor
    }

    pub(crate) fn runner(&self) -> &TxRunner {
        &self.core.runner
    }

    pub(crate) fn write_opts(&self) -> RunOpts {
        self.core.write_opts()
    }

    /// Recent transaction events when the debug buffer is enabled.
    pub fn recent_transactions(&self) -> Vec<TxEvent> {
        self.core.runner.recent_transactions()
    }

    /// Remove this instance's identity record. Errors are logged.
    pub async fn cleanup_leadership(&self) {
        self.core.guard.cleanup().await;
    }

    /// Pool, version and stream-count snapshot for diagnostics.
    pub async fn status(&self) -> Result<PostgresStatus> {
        let runner = self.runner();
        let (version, total_streams, ephemeral_streams) = runner
            .run(
                "status",
                AccessMode::ReadOnly,
                RunOpts::default(),
                Tags::new(),
                |conn| Box::pin(status_tx(conn)),
            )
            .await?;

        let pool_status = |pool: &PgPool| PoolStatus {
            size: pool.size(),
            idle: pool.num_idle(),
            max_connections: pool.options().get_max_connections(),
        };

        Ok(PostgresStatus {
            schema: self.schema().to_string(),
            version,
            regular_pool: pool_status(runner.regular_pool()),
            streaming_pool: pool_status(runner.streaming_pool()),
            total_streams,
            ephemeral_streams,
            checked_at: Utc::now(),
        })
    }

    /// Stop the monitor, release leadership and close both pools.
    pub async fn close(&self) {
        self.monitor.stop().await;
        self.core.guard.release().await;
        self.core.runner.regular_pool().close().await;
        self.core.runner.streaming_pool().close().await;
        info!(schema = %self.schema(), "Storage closed");
    }
}

#[async_trait]
impl StreamStorage for PostgresStreamStore {
    async fn create_stream_storage(&self, stream_id: &StreamId, genesis: Bytes) -> Result<()> {
        let id = *stream_id;
        self.runner()
            .run(
                "create_stream_storage",
                AccessMode::ReadWrite,
                self.write_opts(),
                stream_tags(stream_id),
                move |conn| Box::pin(create_stream_storage_tx(conn, id, genesis.clone())),
            )
            .await
    }

    async fn read_stream_from_last_snapshot(
        &self,
        stream_id: &StreamId,
        min_to_read: usize,
    ) -> Result<ReadStreamFromLastSnapshotResult> {
        let id = *stream_id;
        self.runner()
            .run(
                "read_stream_from_last_snapshot",
                AccessMode::ReadOnly,
                RunOpts::default(),
                stream_tags(stream_id),
                move |conn| Box::pin(read_stream_from_last_snapshot_tx(conn, id, min_to_read)),
            )
            .await
    }

    async fn read_miniblocks(
        &self,
        stream_id: &StreamId,
        from_inclusive: i64,
        to_exclusive: i64,
    ) -> Result<Vec<Bytes>> {
        let id = *stream_id;
        let mut tags = stream_tags(stream_id);
        tags.push(("from_inclusive", from_inclusive.to_string()));
        tags.push(("to_exclusive", to_exclusive.to_string()));
        self.runner()
            .run(
                "read_miniblocks",
                AccessMode::ReadOnly,
                RunOpts::default(),
                tags,
                move |conn| Box::pin(read_miniblocks_tx(conn, id, from_inclusive, to_exclusive)),
            )
            .await
    }

    async fn read_miniblocks_by_stream(
        &self,
        stream_id: &StreamId,
        on_each: &mut (dyn FnMut(i64, Bytes) -> Result<()> + Send),
    ) -> Result<()> {
        let id = *stream_id;
        let miniblocks = self
            .runner()
            .run(
                "read_miniblocks_by_stream",
                AccessMode::ReadOnly,
                RunOpts::streaming(),
                stream_tags(stream_id),
                move |conn| Box::pin(read_miniblocks_by_stream_tx(conn, id)),
            )
            .await?;

        for mb in miniblocks {
            on_each(mb.number, mb.data)?;
        }
        Ok(())
    }

    async fn write_event(
        &self,
        stream_id: &StreamId,
        generation: i64,
        slot: i64,
        envelope: Bytes,
    ) -> Result<()> {
        let id = *stream_id;
        let mut tags = stream_tags(stream_id);
        tags.push(("generation", generation.to_string()));
        tags.push(("slot", slot.to_string()));
        self.runner()
            .run(
                "write_event",
                AccessMode::ReadWrite,
                self.write_opts(),
                tags,
                move |conn| Box::pin(write_event_tx(conn, id, generation, slot, envelope.clone())),
            )
            .await
    }

    async fn write_miniblock_candidate(
        &self,
        stream_id: &StreamId,
        hash: &BlockHash,
        number: i64,
        data: Bytes,
    ) -> Result<()> {
        let id = *stream_id;
        let hash = *hash;
        let mut tags = stream_tags(stream_id);
        tags.push(("hash", hash.to_hex()));
        tags.push(("number", number.to_string()));
        self.runner()
            .run(
                "write_miniblock_candidate",
                AccessMode::ReadWrite,
                self.write_opts(),
                tags,
                move |conn| Box::pin(write_miniblock_candidate_tx(conn, id, hash, number, data.clone())),
            )
            .await
    }

    async fn read_miniblock_candidate(
        &self,
        stream_id: &StreamId,
        hash: &BlockHash,
        number: i64,
    ) -> Result<Bytes> {
        let id = *stream_id;
        let hash = *hash;
        let mut tags = stream_tags(stream_id);
        tags.push(("hash", hash.to_hex()));
        tags.push(("number", number.to_string()));
        self.runner()
            .run(
                "read_miniblock_candidate",
                AccessMode::ReadOnly,
                RunOpts::default(),
                tags,
                move |conn| Box::pin(read_miniblock_candidate_tx(conn, id, hash, number)),
            )
            .await
    }

    async fn promote_miniblock_candidate(
        &self,
        stream_id: &StreamId,
        generation: i64,
        hash: &BlockHash,
        is_snapshot: bool,
        envelopes: Vec<Bytes>,
    ) -> Result<()> {
        let id = *stream_id;
        let hash = *hash;
        let mut tags = stream_tags(stream_id);
        tags.push(("generation", generation.to_string()));
        tags.push(("hash", hash.to_hex()));
        self.runner()
            .run(
                "promote_miniblock_candidate",
                AccessMode::ReadWrite,
                self.write_opts(),
                tags,
                move |conn| {
                    Box::pin(promote_miniblock_candidate_tx(
                        conn,
                        id,
                        generation,
                        hash,
                        is_snapshot,
                        envelopes.clone(),
                    ))
                },
            )
            .await
    }

    async fn import_miniblocks(
        &self,
        stream_id: &StreamId,
        miniblocks: Vec<MiniblockData>,
    ) -> Result<()> {
        if miniblocks.is_empty() {
            return Ok(());
        }
        let id = *stream_id;
        let mut tags = stream_tags(stream_id);
        tags.push(("first", miniblocks[0].number.to_string()));
        tags.push(("count", miniblocks.len().to_string()));
        self.runner()
            .run(
                "import_miniblocks",
                AccessMode::ReadWrite,
                self.write_opts(),
                tags,
                move |conn| Box::pin(import_miniblocks_tx(conn, id, miniblocks.clone())),
            )
            .await
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> Result<()> {
        let id = *stream_id;
        self.runner()
            .run(
                "delete_stream",
                AccessMode::ReadWrite,
                self.write_opts(),
                stream_tags(stream_id),
                move |conn| Box::pin(delete_stream_tx(conn, id)),
            )
            .await
    }

    async fn get_streams(&self) -> Result<Vec<StreamId>> {
        self.runner()
            .run(
                "get_streams",
                AccessMode::ReadOnly,
                RunOpts::default(),
                Tags::new(),
                |conn| Box::pin(get_streams_tx(conn)),
            )
            .await
    }

    async fn get_streams_number(&self) -> Result<i64> {
        self.runner()
            .run(
                "get_streams_number",
                AccessMode::ReadOnly,
                RunOpts::default(),
                Tags::new(),
                |conn| Box::pin(get_streams_number_tx(conn)),
            )
            .await
    }

    async fn stream_last_miniblock(&self, stream_id: &StreamId) -> Result<MiniblockData> {
        let id = *stream_id;
        self.runner()
            .run(
                "stream_last_miniblock",
                AccessMode::ReadOnly,
                RunOpts::default(),
                stream_tags(stream_id),
                move |conn| Box::pin(stream_last_miniblock_tx(conn, id)),
            )
            .await
    }

    async fn debug_read_stream_data(
        &self,
        stream_id: &StreamId,
    ) -> Result<DebugReadStreamDataResult> {
        let id = *stream_id;
        self.runner()
            .run(
                "debug_read_stream_data",
                AccessMode::ReadOnly,
                RunOpts::streaming(),
                stream_tags(stream_id),
                move |conn| Box::pin(debug_read_stream_data_tx(conn, id)),
            )
            .await
    }

    async fn debug_read_stream_statistics(
        &self,
        stream_id: &StreamId,
    ) -> Result<DebugReadStreamStatisticsResult> {
        let id = *stream_id;
        self.runner()
            .run(
                "debug_read_stream_statistics",
                AccessMode::ReadOnly,
                RunOpts::default(),
                stream_tags(stream_id),
                move |conn| Box::pin(debug_read_stream_statistics_tx(conn, id)),
            )
            .await
    }
}

// ============================================================================
// Transaction bodies
// ============================================================================

/// Return the snapshot pointer, locking the stream row for writes.
///
/// Read-only transactions cannot take row locks; their serializable
/// snapshot already gives a consistent view.
pub(crate) async fn lock_stream(
    conn: &mut PgConnection,
    stream_id: &StreamId,
    write: bool,
) -> Result<i64> {
    let sql = if write {
        "SELECT latest_snapshot_miniblock FROM es WHERE stream_id = $1 FOR UPDATE"
    } else {
        "SELECT latest_snapshot_miniblock FROM es WHERE stream_id = $1"
    };
    let row = sqlx::query(sql)
        .bind(stream_id.to_hex())
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(row.get("latest_snapshot_miniblock")),
        None => Err(StorageError::not_found("Stream not found").tag("stream_id", stream_id)),
    }
}

pub(crate) async fn last_miniblock_number(
    conn: &mut PgConnection,
    stream_id: &StreamId,
) -> Result<Option<i64>> {
    let row = sqlx::query(&sql_for_stream(
        "SELECT MAX(seq_num) AS last FROM {{miniblocks}} WHERE stream_id = $1",
        stream_id,
    ))
    .bind(stream_id.to_hex())
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.get::<Option<i64>, _>("last"))
}

async fn require_last_miniblock_number(conn: &mut PgConnection, stream_id: &StreamId) -> Result<i64> {
    last_miniblock_number(conn, stream_id).await?.ok_or_else(|| {
        StorageError::internal("Stream exists in es table, but no miniblocks in DB")
            .tag("stream_id", stream_id)
    })
}

async fn insert_stream_record(
    conn: &mut PgConnection,
    stream_id: &StreamId,
    snapshot: i64,
    ephemeral: bool,
) -> Result<()> {
    sqlx::query("INSERT INTO es (stream_id, latest_snapshot_miniblock, ephemeral) VALUES ($1, $2, $3)")
        .bind(stream_id.to_hex())
        .bind(snapshot)
        .bind(ephemeral)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            StorageError::from(e)
                .duplicate_as_already_exists()
                .tag("stream_id", stream_id)
        })?;
    Ok(())
}

pub(crate) async fn insert_minipool_sentinel(
    conn: &mut PgConnection,
    stream_id: &StreamId,
    generation: i64,
) -> Result<()> {
    sqlx::query(&sql_for_stream(
        "INSERT INTO {{minipools}} (stream_id, generation, slot_num) VALUES ($1, $2, -1)",
        stream_id,
    ))
    .bind(stream_id.to_hex())
    .bind(generation)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert `miniblocks` in one statement.
pub(crate) async fn insert_miniblocks(
    conn: &mut PgConnection,
    stream_id: &StreamId,
    numbers: Vec<i64>,
    data: Vec<Vec<u8>>,
) -> Result<()> {
    sqlx::query(&sql_for_stream(
        "INSERT INTO {{miniblocks}} (stream_id, seq_num, blockdata) \
         SELECT $1, t.seq_num, t.blockdata FROM UNNEST($2::BIGINT[], $3::BYTEA[]) AS t(seq_num, blockdata)",
        stream_id,
    ))
    .bind(stream_id.to_hex())
    .bind(numbers)
    .bind(data)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Create the stream record and all partitions for a regular or ephemeral stream.
pub(crate) async fn create_stream_rows(
    conn: &mut PgConnection,
    stream_id: &StreamId,
    ephemeral: bool,
) -> Result<()> {
    insert_stream_record(conn, stream_id, 0, ephemeral).await?;
    create_stream_partitions(conn, stream_id, &LogicalTable::ALL).await
}

async fn create_stream_storage_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
    genesis: Bytes,
) -> Result<()> {
    create_stream_rows(conn, &stream_id, false).await?;
    insert_miniblocks(conn, &stream_id, vec![0], vec![genesis.to_vec()]).await?;
    insert_minipool_sentinel(conn, &stream_id, 1).await
}

async fn read_minipool_rows(
    conn: &mut PgConnection,
    stream_id: &StreamId,
) -> Result<Vec<(i64, i64, Option<Vec<u8>>)>> {
    let rows = sqlx::query(&sql_for_stream(
        "SELECT generation, slot_num, envelope FROM {{minipools}} WHERE stream_id = $1 ORDER BY generation, slot_num",
        stream_id,
    ))
    .bind(stream_id.to_hex())
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get("generation"), r.get("slot_num"), r.get("envelope")))
        .collect())
}

/// Close `pools` when `result` is an error, so a failed open leaves no connections behind.
async fn close_on_err<T>(pools: &[&PgPool], result: Result<T>) -> Result<T> {
    if result.is_err() {
        for pool in pools {
            pool.close().await;
        }
    }
    result
}

async fn prepare_schema(pool: &PgPool, schema: &str) -> Result<()> {
    // Schema name was validated, so interpolation is safe.
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(pool)
        .await?;
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// First miniblock to return: at least `min_to_read` blocks back from `last`,
/// never past the latest snapshot.
fn read_window_start(last: i64, snapshot: i64, min_to_read: usize) -> i64 {
    let min_to_read = i64::try_from(min_to_read.max(1)).unwrap_or(i64::MAX);
    last.saturating_sub(min_to_read - 1).max(0).min(snapshot)
}

async fn read_stream_from_last_snapshot_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
    min_to_read: usize,
) -> Result<ReadStreamFromLastSnapshotResult> {
    let snapshot = lock_stream(conn, &stream_id, false).await?;
    let last = require_last_miniblock_number(conn, &stream_id).await?;

    let start = read_window_start(last, snapshot, min_to_read);

    let rows = sqlx::query(&sql_for_stream(
        "SELECT seq_num, blockdata FROM {{miniblocks}} WHERE stream_id = $1 AND seq_num >= $2 ORDER BY seq_num",
        &stream_id,
    ))
    .bind(stream_id.to_hex())
    .bind(start)
    .fetch_all(&mut *conn)
    .await?;

    let numbers: Vec<i64> = rows.iter().map(|r| r.get("seq_num")).collect();
    let first_read = numbers.first().copied().unwrap_or(-1);
    let last_read = numbers.last().copied().unwrap_or(-1);
    check_gapless(numbers.iter().copied(), first_read, ErrorKind::Internal)?;
    let offset = snapshot_offset(first_read, last_read, snapshot)?;

    let minipool = read_minipool_rows(conn, &stream_id).await?;
    let keys: Vec<(i64, i64)> = minipool.iter().map(|(g, s, _)| (*g, *s)).collect();
    check_minipool_for_read(&keys, last_read + 1)?;

    Ok(ReadStreamFromLastSnapshotResult {
        start_miniblock_number: first_read,
        snapshot_miniblock_offset: offset,
        miniblocks: rows
            .iter()
            .map(|r| Bytes::from(r.get::<Vec<u8>, _>("blockdata")))
            .collect(),
        minipool_envelopes: minipool
            .into_iter()
            .filter(|(_, slot, _)| *slot >= 0)
            .map(|(_, _, envelope)| Bytes::from(envelope.unwrap_or_default()))
            .collect(),
    })
}

async fn select_miniblocks(
    conn: &mut PgConnection,
    stream_id: &StreamId,
    from_inclusive: i64,
    to_exclusive: i64,
) -> Result<Vec<MiniblockData>> {
    let rows = sqlx::query(&sql_for_stream(
        "SELECT seq_num, blockdata FROM {{miniblocks}} WHERE stream_id = $1 AND seq_num >= $2 AND seq_num < $3 ORDER BY seq_num",
        stream_id,
    ))
    .bind(stream_id.to_hex())
    .bind(from_inclusive)
    .bind(to_exclusive)
    .fetch_all(&mut *conn)
    .await?;

    let miniblocks: Vec<MiniblockData> = rows
        .iter()
        .map(|r| MiniblockData::new(r.get("seq_num"), r.get::<Vec<u8>, _>("blockdata")))
        .collect();

    if let Some(first) = miniblocks.first() {
        check_gapless(
            miniblocks.iter().map(|mb| mb.number),
            first.number,
            ErrorKind::MiniblocksStorageFailure,
        )
        .map_err(|e| e.tag("stream_id", stream_id))?;
    }
    Ok(miniblocks)
}

async fn read_miniblocks_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
    from_inclusive: i64,
    to_exclusive: i64,
) -> Result<Vec<Bytes>> {
    lock_stream(conn, &stream_id, false).await?;
    let miniblocks = select_miniblocks(conn, &stream_id, from_inclusive, to_exclusive).await?;
    Ok(miniblocks.into_iter().map(|mb| mb.data).collect())
}

async fn read_miniblocks_by_stream_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
) -> Result<Vec<MiniblockData>> {
    lock_stream(conn, &stream_id, false).await?;
    select_miniblocks(conn, &stream_id, 0, i64::MAX).await
}

async fn write_event_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
    generation: i64,
    slot: i64,
    envelope: Bytes,
) -> Result<()> {
    lock_stream(conn, &stream_id, true).await?;

    // Ordering by generation, slot_num keeps this an index-only scan.
    let rows = sqlx::query(&sql_for_stream(
        "SELECT generation, slot_num FROM {{minipools}} WHERE stream_id = $1 ORDER BY generation, slot_num",
        &stream_id,
    ))
    .bind(stream_id.to_hex())
    .fetch_all(&mut *conn)
    .await?;
    let keys: Vec<(i64, i64)> = rows
        .iter()
        .map(|r| (r.get("generation"), r.get("slot_num")))
        .collect();
    check_minipool_for_append(&keys, generation, slot)?;

    sqlx::query(&sql_for_stream(
        "INSERT INTO {{minipools}} (stream_id, generation, slot_num, envelope) VALUES ($1, $2, $3, $4)",
        &stream_id,
    ))
    .bind(stream_id.to_hex())
    .bind(generation)
    .bind(slot)
    .bind(envelope.as_ref())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_miniblock_candidate_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
    hash: BlockHash,
    number: i64,
    data: Bytes,
) -> Result<()> {
    lock_stream(conn, &stream_id, true).await?;
    let last = require_last_miniblock_number(conn, &stream_id).await?;

    if number < last + 1 {
        return Err(StorageError::new(
            ErrorKind::MiniblocksStorageFailure,
            "Miniblock proposal blockNumber mismatch",
        )
        .tag("ExpectedBlockNumber", last + 1)
        .tag("ActualBlockNumber", number));
    }

    // Competing proposers may submit the identical candidate.
    sqlx::query(&sql_for_stream(
        "INSERT INTO {{miniblock_candidates}} (stream_id, seq_num, block_hash, blockdata) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (stream_id, seq_num, block_hash) DO NOTHING",
        &stream_id,
    ))
    .bind(stream_id.to_hex())
    .bind(number)
    .bind(hash.to_hex())
    .bind(data.as_ref())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn read_miniblock_candidate_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
    hash: BlockHash,
    number: i64,
) -> Result<Bytes> {
    lock_stream(conn, &stream_id, false).await?;

    let row = sqlx::query(&sql_for_stream(
        "SELECT blockdata FROM {{miniblock_candidates}} WHERE stream_id = $1 AND seq_num = $2 AND block_hash = $3",
        &stream_id,
    ))
    .bind(stream_id.to_hex())
    .bind(number)
    .bind(hash.to_hex())
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(Bytes::from(row.get::<Vec<u8>, _>("blockdata"))),
        None => Err(StorageError::not_found("Miniblock candidate not found")
            .tag("number", number)
            .tag("hash", hash)),
    }
}

async fn promote_miniblock_candidate_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
    generation: i64,
    hash: BlockHash,
    is_snapshot: bool,
    envelopes: Vec<Bytes>,
) -> Result<()> {
    lock_stream(conn, &stream_id, true).await?;
    let last = require_last_miniblock_number(conn, &stream_id).await?;

    if generation != last + 1 {
        return Err(StorageError::new(
            ErrorKind::MiniblocksStorageFailure,
            "Minipool generation mismatch",
        )
        .tag("ExpectedGeneration", last + 1)
        .tag("ActualGeneration", generation));
    }

    let hex_id = stream_id.to_hex();

    sqlx::query(&sql_for_stream(
        "DELETE FROM {{minipools}} WHERE stream_id = $1 AND slot_num <> -1",
        &stream_id,
    ))
    .bind(&hex_id)
    .execute(&mut *conn)
    .await?;

    let rotated = sqlx::query(&sql_for_stream(
        "UPDATE {{minipools}} SET generation = $2 WHERE stream_id = $1 AND slot_num = -1",
        &stream_id,
    ))
    .bind(&hex_id)
    .bind(generation + 1)
    .execute(&mut *conn)
    .await?;
    if rotated.rows_affected() != 1 {
        return Err(StorageError::internal("Minipool sentinel is missing")
            .tag("rows", rotated.rows_affected()));
    }

    if is_snapshot {
        sqlx::query("UPDATE es SET latest_snapshot_miniblock = $2 WHERE stream_id = $1")
            .bind(&hex_id)
            .bind(generation)
            .execute(&mut *conn)
            .await?;
    }

    if !envelopes.is_empty() {
        let envelopes: Vec<Vec<u8>> = envelopes.iter().map(|e| e.to_vec()).collect();
        sqlx::query(&sql_for_stream(
            "INSERT INTO {{minipools}} (stream_id, generation, slot_num, envelope) \
             SELECT $1, $2, t.ord - 1, t.envelope FROM UNNEST($3::BYTEA[]) WITH ORDINALITY AS t(envelope, ord)",
            &stream_id,
        ))
        .bind(&hex_id)
        .bind(generation + 1)
        .bind(envelopes)
        .execute(&mut *conn)
        .await?;
    }

    let copied = sqlx::query(&sql_for_stream(
        "INSERT INTO {{miniblocks}} (stream_id, seq_num, blockdata) \
         SELECT stream_id, seq_num, blockdata FROM {{miniblock_candidates}} \
         WHERE stream_id = $1 AND seq_num = $2 AND block_hash = $3",
        &stream_id,
    ))
    .bind(&hex_id)
    .bind(generation)
    .bind(hash.to_hex())
    .execute(&mut *conn)
    .await?;
    if copied.rows_affected() == 0 {
        return Err(StorageError::not_found("No candidate block found")
            .tag("number", generation)
            .tag("hash", hash));
    }

    sqlx::query(&sql_for_stream(
        "DELETE FROM {{miniblock_candidates}} WHERE stream_id = $1 AND seq_num <= $2",
        &stream_id,
    ))
    .bind(&hex_id)
    .bind(generation)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn import_miniblocks_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
    miniblocks: Vec<MiniblockData>,
) -> Result<()> {
    let first = miniblocks[0].number;
    let creating = first == 0;

    let expected_first = if creating {
        create_stream_rows(conn, &stream_id, false).await?;
        0
    } else {
        lock_stream(conn, &stream_id, true).await?;
        require_last_miniblock_number(conn, &stream_id).await? + 1
    };

    check_gapless(
        miniblocks.iter().map(|mb| mb.number),
        expected_first,
        ErrorKind::BadBlock,
    )
    .map_err(|e| e.tag("stream_id", stream_id))?;

    let last_imported = expected_first + miniblocks.len() as i64 - 1;
    let snapshot = miniblocks
        .iter()
        .filter(|mb| mb.snapshot)
        .map(|mb| mb.number)
        .max();

    let (numbers, data): (Vec<i64>, Vec<Vec<u8>>) = miniblocks
        .into_iter()
        .map(|mb| (mb.number, mb.data.to_vec()))
        .unzip();
    insert_miniblocks(conn, &stream_id, numbers, data).await?;

    if !creating {
        sqlx::query(&sql_for_stream(
            "DELETE FROM {{minipools}} WHERE stream_id = $1",
            &stream_id,
        ))
        .bind(stream_id.to_hex())
        .execute(&mut *conn)
        .await?;
    }
    insert_minipool_sentinel(conn, &stream_id, last_imported + 1).await?;

    if let Some(snapshot) = snapshot {
        sqlx::query("UPDATE es SET latest_snapshot_miniblock = $2 WHERE stream_id = $1")
            .bind(stream_id.to_hex())
            .bind(snapshot)
            .execute(&mut *conn)
            .await?;
    }

    // TODO: purge candidates at or below `last_imported`; which ones are stale
    // after a catch-up import is not decided yet.
    Ok(())
}

pub(crate) async fn delete_stream_tx(conn: &mut PgConnection, stream_id: StreamId) -> Result<()> {
    lock_stream(conn, &stream_id, true).await?;
    drop_stream_partitions(conn, &stream_id).await?;
    sqlx::query("DELETE FROM es WHERE stream_id = $1")
        .bind(stream_id.to_hex())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn get_streams_tx(conn: &mut PgConnection) -> Result<Vec<StreamId>> {
    let rows = sqlx::query("SELECT stream_id FROM es ORDER BY stream_id")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|r| StreamId::from_hex(r.get::<&str, _>("stream_id")))
        .collect()
}

async fn get_streams_number_tx(conn: &mut PgConnection) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM es")
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.get("n"))
}

async fn stream_last_miniblock_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
) -> Result<MiniblockData> {
    lock_stream(conn, &stream_id, false).await?;
    let row = sqlx::query(&sql_for_stream(
        "SELECT seq_num, blockdata FROM {{miniblocks}} WHERE stream_id = $1 ORDER BY seq_num DESC LIMIT 1",
        &stream_id,
    ))
    .bind(stream_id.to_hex())
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(MiniblockData::new(
            row.get("seq_num"),
            row.get::<Vec<u8>, _>("blockdata"),
        )),
        None => Err(
            StorageError::internal("Stream exists in es table, but no miniblocks in DB")
                .tag("stream_id", stream_id),
        ),
    }
}

async fn debug_read_stream_data_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
) -> Result<DebugReadStreamDataResult> {
    let row = sqlx::query("SELECT latest_snapshot_miniblock, ephemeral FROM es WHERE stream_id = $1")
        .bind(stream_id.to_hex())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StorageError::not_found("Stream not found").tag("stream_id", stream_id))?;

    let miniblocks: Vec<MiniblockDescriptor> = sqlx::query(&sql_for_stream(
        "SELECT seq_num, blockdata FROM {{miniblocks}} WHERE stream_id = $1 ORDER BY seq_num",
        &stream_id,
    ))
    .bind(stream_id.to_hex())
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(|r| MiniblockDescriptor {
        number: r.get("seq_num"),
        data: Bytes::from(r.get::<Vec<u8>, _>("blockdata")),
    })
    .collect();

    let events: Vec<EventDescriptor> = read_minipool_rows(conn, &stream_id)
        .await?
        .into_iter()
        .map(|(generation, slot, envelope)| EventDescriptor {
            generation,
            slot,
            envelope: Bytes::from(envelope.unwrap_or_default()),
        })
        .collect();

    let candidate_rows = sqlx::query(&sql_for_stream(
        "SELECT seq_num, block_hash, blockdata FROM {{miniblock_candidates}} WHERE stream_id = $1 ORDER BY seq_num, block_hash",
        &stream_id,
    ))
    .bind(stream_id.to_hex())
    .fetch_all(&mut *conn)
    .await?;
    let candidates = candidate_rows
        .iter()
        .map(|r| {
            Ok(CandidateDescriptor {
                number: r.get("seq_num"),
                hash: BlockHash::from_hex(r.get::<&str, _>("block_hash"))?,
                data: Bytes::from(r.get::<Vec<u8>, _>("blockdata")),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(DebugReadStreamDataResult {
        stream_id,
        latest_snapshot_miniblock: row.get("latest_snapshot_miniblock"),
        ephemeral: row.get("ephemeral"),
        miniblocks,
        events,
        candidates,
    })
}

async fn debug_read_stream_statistics_tx(
    conn: &mut PgConnection,
    stream_id: StreamId,
) -> Result<DebugReadStreamStatisticsResult> {
    let latest_snapshot_miniblock = lock_stream(conn, &stream_id, false).await?;
    let last_miniblock_number = last_miniblock_number(conn, &stream_id).await?.unwrap_or(-1);

    let minipool = read_minipool_rows(conn, &stream_id).await?;
    let current_minipool_generation = minipool
        .iter()
        .find(|(_, slot, _)| *slot == -1)
        .map(|(generation, _, _)| *generation)
        .unwrap_or(-1);
    let num_minipool_events = minipool.iter().filter(|(_, slot, _)| *slot >= 0).count() as i64;

    let rows = sqlx::query(&sql_for_stream(
        "SELECT seq_num, block_hash FROM {{miniblock_candidates}} WHERE stream_id = $1 ORDER BY seq_num, block_hash",
        &stream_id,
    ))
    .bind(stream_id.to_hex())
    .fetch_all(&mut *conn)
    .await?;
    let candidates = rows
        .iter()
        .map(|r| {
            Ok(CandidateRef {
                number: r.get("seq_num"),
                hash: BlockHash::from_hex(r.get::<&str, _>("block_hash"))?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(DebugReadStreamStatisticsResult {
        stream_id,
        latest_snapshot_miniblock,
        last_miniblock_number,
        current_minipool_generation,
        num_minipool_events,
        candidates,
    })
}

async fn status_tx(conn: &mut PgConnection) -> Result<(String, i64, i64)> {
    let version: String = sqlx::query("SELECT version() AS v")
        .fetch_one(&mut *conn)
        .await?
        .get("v");
    let row = sqlx::query(
        "SELECT COUNT(*) AS total, COUNT(*) FILTER (WHERE ephemeral) AS ephemeral FROM es",
    )
    .fetch_one(&mut *conn)
    .await?;
    Ok((version, row.get("total"), row.get("ephemeral")))
}
