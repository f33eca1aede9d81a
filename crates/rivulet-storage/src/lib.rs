//! Rivulet Storage
//!
//! Postgres persistence layer for replicated, append-only streams.
//!
//! ## Data Model
//!
//! A stream is a gapless sequence of immutable **miniblocks** (0 is the
//! genesis) plus a mutable **minipool** staging the events that will go into
//! the next miniblock. Proposed next miniblocks are stored as **candidates**
//! and one of them is **promoted** to commit it:
//!
//! ```text
//!             write_event                 write_miniblock_candidate
//!                  │                                  │
//!                  ▼                                  ▼
//!   ┌──────────────────────────┐      ┌──────────────────────────────┐
//!   │ minipool (generation g)  │      │ candidates (g, hash_a), ...  │
//!   │ -1 sentinel, 0, 1, ...   │      └──────────────┬───────────────┘
//!   └────────────┬─────────────┘                     │
//!                │  promote_miniblock_candidate(g, hash_a)
//!                ▼                                   ▼
//!   minipool rotated to g+1           miniblock g committed,
//!                                     candidates <= g deleted
//! ```
//!
//! Invariant: the minipool generation always equals the last committed
//! miniblock number plus one.
//!
//! ## Physical Layout
//!
//! Every stream gets its own child table in each partitioned table (see
//! [`partition`]), so deleting a stream is a `DROP TABLE` and hot streams
//! never share index pages.
//!
//! ## Concurrency
//!
//! Every operation is one transaction run by the [`TxRunner`] under
//! serializable isolation, retried on serialization failures. Only one
//! process may write a schema at a time; the [`LeadershipGuard`] enforces
//! this and reports loss of leadership on the channel passed to
//! [`PostgresStreamStore::open`].
//!
//! ## Example
//!
//! ```no_run
//! use rivulet_storage::{DatabaseConfig, PostgresStreamStore, StreamId, StreamStorage, StreamType};
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> rivulet_storage::Result<()> {
//! let (exit_tx, mut exit_rx) = mpsc::channel(1);
//! let store = PostgresStreamStore::open(DatabaseConfig::from_env()?, "instance-1", exit_tx).await?;
//!
//! let stream = StreamId::with_type(StreamType::Channel, b"general");
//! store.create_stream_storage(&stream, b"genesis".to_vec().into()).await?;
//! store.write_event(&stream, 1, 0, b"hello".to_vec().into()).await?;
//!
//! tokio::select! {
//!     Some(err) = exit_rx.recv() => eprintln!("shutting down: {}", err),
//!     _ = tokio::signal::ctrl_c() => {}
//! }
//! store.close().await;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;

pub mod archive;
pub mod config;
pub mod consistency;
pub mod ephemeral;
pub mod error;
pub mod leadership;
pub mod monitor;
pub mod partition;
pub mod store;
pub mod stream_id;
pub mod tx_runner;
pub mod types;

pub use config::{DatabaseConfig, EphemeralMonitorConfig, IsolationLevel};
pub use ephemeral::{GenesisInfo, GenesisInspector, JsonGenesisInspector};
pub use error::{ErrorKind, Result, StorageError};
pub use leadership::LeadershipGuard;
pub use monitor::{EphemeralStreamCleaner, EphemeralStreamMonitor};
pub use store::PostgresStreamStore;
pub use stream_id::{BlockHash, StreamId, StreamType};
pub use tx_runner::{AccessMode, RunOpts, TxEvent, TxRunner};
pub use types::*;

/// Regular stream lifecycle: creation, event append, candidate proposal,
/// promotion, range reads, bulk import and deletion.
#[async_trait]
pub trait StreamStorage: Send + Sync {
    /// Create a stream with its genesis miniblock and an empty minipool at
    /// generation 1.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists`: the stream id is taken
    async fn create_stream_storage(&self, stream_id: &StreamId, genesis: Bytes) -> Result<()>;

    /// Read the miniblocks from the last snapshot (or at least the last
    /// `min_to_read`, whichever starts earlier) up to the last committed one,
    /// together with the current minipool.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no such stream
    /// - `Internal`: the window has gaps or does not contain the snapshot
    async fn read_stream_from_last_snapshot(
        &self,
        stream_id: &StreamId,
        min_to_read: usize,
    ) -> Result<ReadStreamFromLastSnapshotResult>;

    /// Miniblocks in `[from_inclusive, to_exclusive)`, in order.
    ///
    /// # Errors
    ///
    /// - `MiniblocksStorageFailure`: a gap was detected, tagged with
    ///   `ActualBlockNumber` and `ExpectedBlockNumber`
    async fn read_miniblocks(
        &self,
        stream_id: &StreamId,
        from_inclusive: i64,
        to_exclusive: i64,
    ) -> Result<Vec<Bytes>>;

    /// Scan the whole stream on the streaming pool, calling `on_each` with
    /// `(number, data)` for every miniblock in order.
    async fn read_miniblocks_by_stream(
        &self,
        stream_id: &StreamId,
        on_each: &mut (dyn FnMut(i64, Bytes) -> Result<()> + Send),
    ) -> Result<()>;

    /// Append one envelope at `slot` of the minipool of `generation`.
    ///
    /// # Errors
    ///
    /// - `MiniblocksStorageFailure`: the minipool is not exactly the sentinel
    ///   plus slots `0..slot` of `generation`
    async fn write_event(
        &self,
        stream_id: &StreamId,
        generation: i64,
        slot: i64,
        envelope: Bytes,
    ) -> Result<()>;

    /// Store a proposed miniblock. Writing the same candidate twice is a no-op.
    ///
    /// # Errors
    ///
    /// - `MiniblocksStorageFailure`: `number` is already committed
    async fn write_miniblock_candidate(
        &self,
        stream_id: &StreamId,
        hash: &BlockHash,
        number: i64,
        data: Bytes,
    ) -> Result<()>;

    /// # Errors
    ///
    /// - `NotFound`: no such candidate
    async fn read_miniblock_candidate(
        &self,
        stream_id: &StreamId,
        hash: &BlockHash,
        number: i64,
    ) -> Result<Bytes>;

    /// Commit candidate `(generation, hash)` and rotate the minipool to
    /// `generation + 1` holding `envelopes`. All or nothing.
    ///
    /// # Errors
    ///
    /// - `MiniblocksStorageFailure`: `generation` is not last committed + 1
    /// - `NotFound`: no candidate block found
    async fn promote_miniblock_candidate(
        &self,
        stream_id: &StreamId,
        generation: i64,
        hash: &BlockHash,
        is_snapshot: bool,
        envelopes: Vec<Bytes>,
    ) -> Result<()>;

    /// Bulk-load committed miniblocks. Starting at 0 creates the stream,
    /// otherwise the run must continue right after the last committed block.
    ///
    /// # Errors
    ///
    /// - `BadBlock`: the run does not line up or has gaps
    /// - `AlreadyExists`: starting at 0 for an existing stream
    async fn import_miniblocks(&self, stream_id: &StreamId, miniblocks: Vec<MiniblockData>)
        -> Result<()>;

    async fn delete_stream(&self, stream_id: &StreamId) -> Result<()>;

    async fn get_streams(&self) -> Result<Vec<StreamId>>;

    async fn get_streams_number(&self) -> Result<i64>;

    /// The last committed miniblock.
    async fn stream_last_miniblock(&self, stream_id: &StreamId) -> Result<MiniblockData>;

    /// Full dump of the stream's rows, for diagnostics.
    async fn debug_read_stream_data(&self, stream_id: &StreamId)
        -> Result<DebugReadStreamDataResult>;

    async fn debug_read_stream_statistics(
        &self,
        stream_id: &StreamId,
    ) -> Result<DebugReadStreamStatisticsResult>;
}

/// Streams assembled from independently written chunks, later normalized
/// into regular streams.
#[async_trait]
pub trait EphemeralStreamStorage: Send + Sync {
    async fn create_ephemeral_stream_storage(&self, stream_id: &StreamId, genesis: Bytes)
        -> Result<()>;

    /// Upsert a chunk. Creates the stream record if it is not there yet.
    async fn write_ephemeral_miniblock(&self, stream_id: &StreamId, chunk: MiniblockData)
        -> Result<()>;

    /// Stored chunk numbers, ascending.
    async fn read_ephemeral_miniblock_nums(&self, stream_id: &StreamId) -> Result<Vec<i64>>;

    /// Seal the stream once every declared chunk is present. Returns the
    /// genesis hash.
    ///
    /// # Errors
    ///
    /// - `Internal`: chunks are missing
    async fn normalize_ephemeral_stream(&self, stream_id: &StreamId) -> Result<BlockHash>;

    /// # Errors
    ///
    /// - `NotFound`: no such stream
    async fn is_stream_ephemeral(&self, stream_id: &StreamId) -> Result<bool>;
}

/// Append-only mirror of finalized miniblocks.
#[async_trait]
pub trait ArchiveStreamStorage: Send + Sync {
    async fn create_stream_archive_storage(&self, stream_id: &StreamId) -> Result<()>;

    /// Highest archived number, `-1` when nothing is archived yet.
    async fn get_max_archived_miniblock_number(&self, stream_id: &StreamId) -> Result<i64>;

    /// # Errors
    ///
    /// - `BadBlock`: `start` is not the highest archived number + 1
    async fn write_archive_miniblocks(
        &self,
        stream_id: &StreamId,
        start: i64,
        miniblocks: Vec<Bytes>,
    ) -> Result<()>;
}
