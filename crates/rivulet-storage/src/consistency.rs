//! Row-level consistency checks.
//!
//! Pure validators applied to rows read inside a transaction, before the
//! transaction is allowed to write or return anything.

use crate::error::{ErrorKind, Result, StorageError};

/// Sequence numbers must be `start, start+1, ...` with no gaps. A violation
/// is reported with the given kind.
pub fn check_gapless<I>(numbers: I, start: i64, kind: ErrorKind) -> Result<()>
where
    I: IntoIterator<Item = i64>,
{
    for (i, actual) in numbers.into_iter().enumerate() {
        let expected = start + i as i64;
        if actual != expected {
            return Err(StorageError::new(kind, "Miniblocks consistency violation")
                .tag("ActualBlockNumber", actual)
                .tag("ExpectedBlockNumber", expected));
        }
    }
    Ok(())
}

/// Before appending at `slot`, the pool must hold exactly the sentinel (`-1`)
/// plus slots `0..slot`, all of `generation`. Rows are `(generation, slot)`
/// ordered by generation, slot.
pub fn check_minipool_for_append(rows: &[(i64, i64)], generation: i64, slot: i64) -> Result<()> {
    for (i, (row_generation, row_slot)) in rows.iter().enumerate() {
        if *row_generation != generation {
            return Err(StorageError::new(
                ErrorKind::MiniblocksStorageFailure,
                "Wrong event generation in minipool",
            )
            .tag("ExpectedGeneration", generation)
            .tag("ActualGeneration", row_generation)
            .tag("SlotNumber", row_slot));
        }
        let expected_slot = i as i64 - 1;
        if *row_slot != expected_slot {
            return Err(StorageError::new(
                ErrorKind::MiniblocksStorageFailure,
                "Wrong slot number in minipool",
            )
            .tag("ExpectedSlotNumber", expected_slot)
            .tag("ActualSlotNumber", row_slot));
        }
    }
    if rows.len() as i64 != slot + 1 {
        return Err(StorageError::new(
            ErrorKind::MiniblocksStorageFailure,
            "Wrong number of records in minipool",
        )
        .tag("ActualRecordsNumber", rows.len())
        .tag("ExpectedRecordsNumber", slot + 1));
    }
    Ok(())
}

/// Minipool rows read alongside miniblocks must all belong to `generation`
/// with slots `-1, 0, 1, ...`.
pub fn check_minipool_for_read(rows: &[(i64, i64)], generation: i64) -> Result<()> {
    if rows.is_empty() {
        return Err(StorageError::new(
            ErrorKind::MiniblocksStorageFailure,
            "Minipool sentinel is missing",
        )
        .tag("ExpectedGeneration", generation));
    }
    for (i, (row_generation, row_slot)) in rows.iter().enumerate() {
        let expected_slot = i as i64 - 1;
        if *row_generation != generation || *row_slot != expected_slot {
            return Err(StorageError::new(
                ErrorKind::MiniblocksStorageFailure,
                "Minipool consistency violation",
            )
            .tag("ExpectedGeneration", generation)
            .tag("ActualGeneration", row_generation)
            .tag("ExpectedSlotNumber", expected_slot)
            .tag("ActualSlotNumber", row_slot));
        }
    }
    Ok(())
}

/// Offset of `snapshot` within the window `[first, last]`.
pub fn snapshot_offset(first: i64, last: i64, snapshot: i64) -> Result<usize> {
    if snapshot < first || snapshot > last {
        return Err(StorageError::internal("Snapshot miniblock is outside the read window")
            .tag("SnapshotMiniblock", snapshot)
            .tag("FirstMiniblock", first)
            .tag("LastMiniblock", last));
    }
    Ok((snapshot - first) as usize)
}

/// Chunks `0..=chunk_count` must all be present, and nothing beyond.
/// `nums` must be sorted ascending.
pub fn check_ephemeral_chunks(nums: &[i64], chunk_count: i64) -> Result<()> {
    let last = nums.last().copied().unwrap_or(-1);
    let complete = last == chunk_count
        && nums.len() as i64 == chunk_count + 1
        && nums.iter().enumerate().all(|(i, n)| *n == i as i64);
    if !complete {
        return Err(StorageError::internal("Cannot normalize ephemeral stream: missing chunks")
            .tag("ChunkCount", chunk_count)
            .tag("StoredChunks", nums.len())
            .tag("LastChunk", last));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gapless_ok() {
        let kind = ErrorKind::MiniblocksStorageFailure;
        assert!(check_gapless(vec![3, 4, 5], 3, kind).is_ok());
        assert!(check_gapless(Vec::<i64>::new(), 0, kind).is_ok());
    }

    #[test]
    fn test_gap_is_tagged() {
        let err = check_gapless(vec![0, 1, 3], 0, ErrorKind::MiniblocksStorageFailure).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MiniblocksStorageFailure);
        assert_eq!(err.tag_value("ActualBlockNumber"), Some("3"));
        assert_eq!(err.tag_value("ExpectedBlockNumber"), Some("2"));
    }

    #[test]
    fn test_wrong_first_block() {
        let err = check_gapless(vec![1, 2], 0, ErrorKind::BadBlock).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadBlock);
        assert_eq!(err.tag_value("ActualBlockNumber"), Some("1"));
    }

    #[test]
    fn test_minipool_append_ok() {
        assert!(check_minipool_for_append(&[(4, -1)], 4, 0).is_ok());
        assert!(check_minipool_for_append(&[(4, -1), (4, 0), (4, 1)], 4, 2).is_ok());
    }

    #[test]
    fn test_minipool_append_wrong_generation() {
        let err = check_minipool_for_append(&[(3, -1)], 4, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MiniblocksStorageFailure);
        assert_eq!(err.tag_value("ActualGeneration"), Some("3"));
    }

    #[test]
    fn test_minipool_append_wrong_count() {
        let err = check_minipool_for_append(&[(4, -1), (4, 0)], 4, 5).unwrap_err();
        assert_eq!(err.message(), "Wrong number of records in minipool");
        assert_eq!(err.tag_value("ExpectedRecordsNumber"), Some("6"));

        let err = check_minipool_for_append(&[(4, -1), (4, 1)], 4, 2).unwrap_err();
        assert_eq!(err.message(), "Wrong slot number in minipool");
    }

    #[test]
    fn test_minipool_read() {
        assert!(check_minipool_for_read(&[(2, -1), (2, 0)], 2).is_ok());
        assert!(check_minipool_for_read(&[], 2).is_err());
        let err = check_minipool_for_read(&[(2, -1), (3, 0)], 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MiniblocksStorageFailure);
    }

    #[test]
    fn test_snapshot_offset() {
        assert_eq!(snapshot_offset(5, 10, 5).unwrap(), 0);
        assert_eq!(snapshot_offset(5, 10, 8).unwrap(), 3);
        assert_eq!(snapshot_offset(5, 10, 11).unwrap_err().kind(), ErrorKind::Internal);
        assert!(snapshot_offset(5, 10, 4).is_err());
    }

    #[test]
    fn test_ephemeral_chunks() {
        assert!(check_ephemeral_chunks(&[0, 1, 2, 3], 3).is_ok());
        assert!(check_ephemeral_chunks(&[0], 0).is_ok());
        let err = check_ephemeral_chunks(&[0, 1, 3], 3).unwrap_err();
        assert!(err.message().contains("missing chunks"));
        assert!(check_ephemeral_chunks(&[0, 1, 2, 3, 4], 3).is_err());
        assert!(check_ephemeral_chunks(&[], 0).is_err());
    }
}
