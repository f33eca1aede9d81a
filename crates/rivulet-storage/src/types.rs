//! Value types returned by the store.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::stream_id::{BlockHash, StreamId};

/// One committed miniblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiniblockData {
    pub number: i64,
    pub data: Bytes,
    /// Only meaningful on import/archive input; reads leave it `false`.
    pub snapshot: bool,
}

impl MiniblockData {
    pub fn new(number: i64, data: impl Into<Bytes>) -> Self {
        Self {
            number,
            data: data.into(),
            snapshot: false,
        }
    }

    pub fn snapshot(mut self) -> Self {
        self.snapshot = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStreamFromLastSnapshotResult {
    pub start_miniblock_number: i64,
    /// Offset of the snapshot miniblock within `miniblocks`.
    pub snapshot_miniblock_offset: usize,
    pub miniblocks: Vec<Bytes>,
    pub minipool_envelopes: Vec<Bytes>,
}

/// A row of the miniblocks table as dumped by the debug reads.
#[derive(Debug, Clone, Serialize)]
pub struct MiniblockDescriptor {
    pub number: i64,
    #[serde(with = "bytes_len")]
    pub data: Bytes,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventDescriptor {
    pub generation: i64,
    pub slot: i64,
    #[serde(with = "bytes_len")]
    pub envelope: Bytes,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateDescriptor {
    pub number: i64,
    pub hash: BlockHash,
    #[serde(with = "bytes_len")]
    pub data: Bytes,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugReadStreamDataResult {
    pub stream_id: StreamId,
    pub latest_snapshot_miniblock: i64,
    pub ephemeral: bool,
    pub miniblocks: Vec<MiniblockDescriptor>,
    pub events: Vec<EventDescriptor>,
    pub candidates: Vec<CandidateDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateRef {
    pub number: i64,
    pub hash: BlockHash,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugReadStreamStatisticsResult {
    pub stream_id: StreamId,
    pub latest_snapshot_miniblock: i64,
    pub last_miniblock_number: i64,
    pub current_minipool_generation: i64,
    pub num_minipool_events: i64,
    pub candidates: Vec<CandidateRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub size: u32,
    pub idle: usize,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostgresStatus {
    pub schema: String,
    pub version: String,
    pub regular_pool: PoolStatus,
    pub streaming_pool: PoolStatus,
    pub total_streams: i64,
    pub ephemeral_streams: i64,
    pub checked_at: DateTime<Utc>,
}

/// Serialize payloads as their length; dumps are for humans, not replay.
mod bytes_len {
    use bytes::Bytes;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(b: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(b.len() as u64)
    }
}
