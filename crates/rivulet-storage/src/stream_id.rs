//! Stream and block identifiers.
//!
//! A [`StreamId`] is 32 bytes whose first byte tags the stream type. In the
//! database it is stored as 64 lowercase hex characters; block hashes are
//! stored the same way, without a `0x` prefix.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ErrorKind, Result, StorageError};

pub const STREAM_ID_LEN: usize = 32;
pub const HASH_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Space,
    Channel,
    GroupDm,
    Dm,
    UserInbox,
    UserSettings,
    User,
    UserDeviceKey,
    Metadata,
    Media,
    Unknown(u8),
}

impl StreamType {
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0x10 => StreamType::Space,
            0x20 => StreamType::Channel,
            0x77 => StreamType::GroupDm,
            0x88 => StreamType::Dm,
            0xa1 => StreamType::UserInbox,
            0xa5 => StreamType::UserSettings,
            0xa8 => StreamType::User,
            0xad => StreamType::UserDeviceKey,
            0xdd => StreamType::Metadata,
            0xff => StreamType::Media,
            other => StreamType::Unknown(other),
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            StreamType::Space => 0x10,
            StreamType::Channel => 0x20,
            StreamType::GroupDm => 0x77,
            StreamType::Dm => 0x88,
            StreamType::UserInbox => 0xa1,
            StreamType::UserSettings => 0xa5,
            StreamType::User => 0xa8,
            StreamType::UserDeviceKey => 0xad,
            StreamType::Metadata => 0xdd,
            StreamType::Media => 0xff,
            StreamType::Unknown(tag) => *tag,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId([u8; STREAM_ID_LEN]);

impl StreamId {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; STREAM_ID_LEN] = bytes.try_into().map_err(|_| {
            StorageError::new(ErrorKind::BadStreamId, "stream id must be 32 bytes")
                .tag("len", bytes.len())
        })?;
        Ok(StreamId(arr))
    }

    /// Build an id of the given type with the remaining bytes taken from `body`.
    pub fn with_type(stream_type: StreamType, body: &[u8]) -> Self {
        let mut arr = [0u8; STREAM_ID_LEN];
        arr[0] = stream_type.tag();
        let n = body.len().min(STREAM_ID_LEN - 1);
        arr[1..1 + n].copy_from_slice(&body[..n]);
        StreamId(arr)
    }

    pub fn as_bytes(&self) -> &[u8; STREAM_ID_LEN] {
        &self.0
    }

    pub fn stream_type(&self) -> StreamType {
        StreamType::from_tag(self.0[0])
    }

    /// Database representation: lowercase hex, no prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| {
            StorageError::new(ErrorKind::BadStreamId, format!("invalid stream id hex: {}", e))
                .tag("stream_id", s)
        })?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.to_hex())
    }
}

impl FromStr for StreamId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for StreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        StreamId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Content hash of a miniblock.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHash([u8; HASH_LEN]);

impl BlockHash {
    pub const fn new(bytes: [u8; HASH_LEN]) -> Self {
        BlockHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim().strip_prefix("0x").unwrap_or(s.trim());
        let mut arr = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut arr).map_err(|e| {
            StorageError::internal(format!("invalid block hash: {}", e)).tag("hash", s)
        })?;
        Ok(BlockHash(arr))
    }
}

impl From<[u8; HASH_LEN]> for BlockHash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        BlockHash(bytes)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BlockHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_and_type() {
        let id = StreamId::with_type(StreamType::Channel, &[1, 2, 3]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("20010203"));
        assert_eq!(StreamId::from_hex(&hex).unwrap(), id);
        assert_eq!(StreamId::from_hex(&format!("0x{}", hex)).unwrap(), id);
        assert_eq!(id.stream_type(), StreamType::Channel);
    }

    #[test]
    fn test_bad_length() {
        let err = StreamId::from_bytes(&[0u8; 5]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadStreamId);
        assert!(StreamId::from_hex("zz").is_err());
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(StreamType::from_tag(0x01), StreamType::Unknown(0x01));
        assert_eq!(StreamType::from_tag(0xad), StreamType::UserDeviceKey);
        assert_eq!(StreamType::Media.tag(), 0xff);
    }

    #[test]
    fn test_block_hash_hex() {
        let h = BlockHash::new([0xab; 32]);
        assert_eq!(BlockHash::from_hex(&h.to_hex()).unwrap(), h);
        assert!(BlockHash::from_hex("abcd").is_err());
    }
}
