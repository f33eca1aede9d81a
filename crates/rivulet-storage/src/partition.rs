//! Partition Manager
//!
//! Every stream owns one physical child table per logical table:
//!
//! | Logical table | Child table |
//! |---------------|-------------|
//! | `miniblocks` | `miniblocks_<suffix>` |
//! | `minipools` | `minipools_<suffix>` |
//! | `miniblock_candidates` | `miniblock_candidates_<suffix>` |
//!
//! The suffix is the first 16 bytes of `sha256(hex(stream_id))`, hex encoded.
//! Hashing the hex form (which is what the database stores) means the suffix
//! can be recomputed in SQL with `encode(sha256(...), 'hex')` when debugging.
//!
//! Queries are written against `{{miniblocks}}`, `{{minipools}}` and
//! `{{miniblock_candidates}}` placeholders and routed with [`sql_for_stream`].

use sha2::{Digest, Sha256};
use sqlx::PgConnection;
use tracing::debug;

use crate::error::Result;
use crate::stream_id::StreamId;

const SUFFIX_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalTable {
    Miniblocks,
    Minipools,
    MiniblockCandidates,
}

impl LogicalTable {
    pub const ALL: [LogicalTable; 3] = [
        LogicalTable::Miniblocks,
        LogicalTable::Minipools,
        LogicalTable::MiniblockCandidates,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LogicalTable::Miniblocks => "miniblocks",
            LogicalTable::Minipools => "minipools",
            LogicalTable::MiniblockCandidates => "miniblock_candidates",
        }
    }

    fn placeholder(&self) -> &'static str {
        match self {
            LogicalTable::Miniblocks => "{{miniblocks}}",
            LogicalTable::Minipools => "{{minipools}}",
            LogicalTable::MiniblockCandidates => "{{miniblock_candidates}}",
        }
    }
}

/// Deterministic per-stream table suffix.
pub fn partition_suffix(stream_id: &StreamId) -> String {
    let digest = Sha256::digest(stream_id.to_hex().as_bytes());
    hex::encode(&digest[..SUFFIX_BYTES])
}

pub fn partition_table_name(table: LogicalTable, stream_id: &StreamId) -> String {
    format!("{}_{}", table.name(), partition_suffix(stream_id))
}

/// Rewrite logical-table placeholders in `template` into the stream's child tables.
pub fn sql_for_stream(template: &str, stream_id: &StreamId) -> String {
    let suffix = partition_suffix(stream_id);
    LogicalTable::ALL
        .iter()
        .fold(template.to_string(), |sql, table| {
            sql.replace(table.placeholder(), &format!("{}_{}", table.name(), suffix))
        })
}

fn create_partition_sql(table: LogicalTable, stream_id: &StreamId) -> String {
    format!(
        "CREATE TABLE {} PARTITION OF {} FOR VALUES IN ('{}')",
        partition_table_name(table, stream_id),
        table.name(),
        stream_id.to_hex()
    )
}

fn drop_partition_sql(table: LogicalTable, stream_id: &StreamId) -> String {
    format!(
        "DROP TABLE IF EXISTS {}",
        partition_table_name(table, stream_id)
    )
}

/// Create child tables for `tables`. A collision surfaces as `AlreadyExists`.
pub async fn create_stream_partitions(
    conn: &mut PgConnection,
    stream_id: &StreamId,
    tables: &[LogicalTable],
) -> Result<()> {
    for table in tables {
        sqlx::query(&create_partition_sql(*table, stream_id))
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                crate::error::StorageError::from(e)
                    .duplicate_as_already_exists()
                    .tag("stream_id", stream_id)
                    .tag("table", table.name())
            })?;
    }
    debug!(stream_id = %stream_id, count = tables.len(), "Created stream partitions");
    Ok(())
}

/// Drop every child table the stream may own.
pub async fn drop_stream_partitions(conn: &mut PgConnection, stream_id: &StreamId) -> Result<()> {
    for table in LogicalTable::ALL {
        sqlx::query(&drop_partition_sql(table, stream_id))
            .execute(&mut *conn)
            .await?;
    }
    debug!(stream_id = %stream_id, "Dropped stream partitions");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_id::StreamType;

    fn stream(n: u8) -> StreamId {
        StreamId::with_type(StreamType::Channel, &[n; 31])
    }

    #[test]
    fn test_suffix_is_stable_and_short() {
        let a = partition_suffix(&stream(1));
        assert_eq!(a, partition_suffix(&stream(1)));
        assert_eq!(a.len(), SUFFIX_BYTES * 2);
        assert_ne!(a, partition_suffix(&stream(2)));
    }

    #[test]
    fn test_suffix_hashes_hex_form() {
        let id = stream(7);
        let digest = Sha256::digest(id.to_hex().as_bytes());
        assert_eq!(partition_suffix(&id), hex::encode(&digest[..16]));
    }

    #[test]
    fn test_sql_for_stream_replaces_all_placeholders() {
        let id = stream(3);
        let sfx = partition_suffix(&id);
        let sql = sql_for_stream(
            "INSERT INTO {{miniblocks}} SELECT * FROM {{miniblock_candidates}}; DELETE FROM {{minipools}}; DELETE FROM {{minipools}}",
            &id,
        );
        assert_eq!(
            sql,
            format!(
                "INSERT INTO miniblocks_{0} SELECT * FROM miniblock_candidates_{0}; DELETE FROM minipools_{0}; DELETE FROM minipools_{0}",
                sfx
            )
        );
        assert!(!sql.contains("{{"));
    }

    #[test]
    fn test_table_names_fit_identifier_limit() {
        let id = stream(9);
        for table in LogicalTable::ALL {
            assert!(partition_table_name(table, &id).len() <= 63);
        }
    }

    #[test]
    fn test_ddl() {
        let id = stream(4);
        let sql = create_partition_sql(LogicalTable::Minipools, &id);
        assert!(sql.starts_with("CREATE TABLE minipools_"));
        assert!(sql.ends_with(&format!("PARTITION OF minipools FOR VALUES IN ('{}')", id.to_hex())));
        assert!(drop_partition_sql(LogicalTable::Miniblocks, &id).starts_with("DROP TABLE IF EXISTS miniblocks_"));
    }
}
