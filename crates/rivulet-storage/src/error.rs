//! Storage Error Types
//!
//! Every storage operation returns [`Result<T>`], aliased to
//! `Result<T, StorageError>`.
//!
//! ## Error Kinds
//!
//! | Kind | Raised when |
//! |------|-------------|
//! | `NotFound` | stream, candidate or record is absent |
//! | `AlreadyExists` | stream or partition creation collides |
//! | `MiniblocksStorageFailure` | sequence gap, generation or slot mismatch |
//! | `Internal` | invariant breach the caller cannot retry around |
//! | `ResourceExhausted` | this instance lost exclusive write access |
//! | `BadBlock` | import/archive sequence mismatch |
//! | `DbOperationFailure` | any unclassified driver error |
//! | `DeadlineExceeded` | an explicit operation timeout fired |
//! | `BadStreamId` | a stream id could not be parsed |
//! | `Config` | invalid configuration |
//!
//! ## Tags
//!
//! Errors carry ordered key/value tags (stream id, sequence numbers, hashes)
//! so callers can log or alert without re-deriving the root cause:
//!
//! ```ignore
//! use rivulet_storage::{ErrorKind, StorageError};
//!
//! let err = StorageError::new(ErrorKind::MiniblocksStorageFailure, "Miniblock proposal blockNumber mismatch")
//!     .tag("ExpectedBlockNumber", 4)
//!     .tag("ActualBlockNumber", 2);
//! assert_eq!(err.tag_value("ExpectedBlockNumber"), Some("4"));
//! ```

use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

/// SQLSTATE codes the storage layer reacts to.
pub mod sqlstate {
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const DUPLICATE_TABLE: &str = "42P07";
    pub const UNDEFINED_TABLE: &str = "42P01";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    MiniblocksStorageFailure,
    Internal,
    ResourceExhausted,
    BadBlock,
    DbOperationFailure,
    DeadlineExceeded,
    BadStreamId,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::MiniblocksStorageFailure => "MINIBLOCKS_STORAGE_FAILURE",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorKind::BadBlock => "BAD_BLOCK",
            ErrorKind::DbOperationFailure => "DB_OPERATION_FAILURE",
            ErrorKind::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorKind::BadStreamId => "BAD_STREAM_ID",
            ErrorKind::Config => "CONFIG",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}{}", render_context(.func, .tags))]
pub struct StorageError {
    kind: ErrorKind,
    message: String,
    func: Option<&'static str>,
    tags: Vec<(&'static str, String)>,
    db_code: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

fn render_context(func: &Option<&'static str>, tags: &[(&'static str, String)]) -> String {
    let mut out = String::new();
    if let Some(func) = func {
        out.push_str(" func=");
        out.push_str(func);
    }
    for (k, v) in tags {
        out.push(' ');
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            func: None,
            tags: Vec::new(),
            db_code: None,
            source: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Append a tag. Existing tags with the same key are kept; first wins on lookup.
    pub fn tag(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.tags.push((key, value.to_string()));
        self
    }

    pub fn tags<I, V>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, V)>,
        V: fmt::Display,
    {
        for (k, v) in tags {
            self.tags.push((k, v.to_string()));
        }
        self
    }

    /// Record the operation that produced the error, unless one is already set.
    pub fn func(mut self, func: &'static str) -> Self {
        if self.func.is_none() {
            self.func = Some(func);
        }
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn function(&self) -> Option<&'static str> {
        self.func
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn tag_list(&self) -> &[(&'static str, String)] {
        &self.tags
    }

    /// SQLSTATE of the underlying driver error, if any.
    pub fn db_code(&self) -> Option<&str> {
        self.db_code.as_deref()
    }

    /// True for serialization failures and deadlocks.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.db_code(),
            Some(sqlstate::SERIALIZATION_FAILURE) | Some(sqlstate::DEADLOCK_DETECTED)
        )
    }

    /// True when the driver reported a duplicate key or duplicate table.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self.db_code(),
            Some(sqlstate::UNIQUE_VIOLATION) | Some(sqlstate::DUPLICATE_TABLE)
        )
    }

    /// Re-kind a duplicate key/table error as `AlreadyExists`.
    pub(crate) fn duplicate_as_already_exists(mut self) -> Self {
        if self.kind == ErrorKind::DbOperationFailure && self.is_duplicate() {
            self.kind = ErrorKind::AlreadyExists;
            self.message = format!("stream already exists: {}", self.message);
        }
        self
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        let (kind, db_code) = match &e {
            sqlx::Error::RowNotFound => (ErrorKind::NotFound, None),
            sqlx::Error::PoolTimedOut => (ErrorKind::DeadlineExceeded, None),
            sqlx::Error::Database(db) => (
                ErrorKind::DbOperationFailure,
                db.code().map(|c| c.into_owned()),
            ),
            _ => (ErrorKind::DbOperationFailure, None),
        };
        let mut err = StorageError::new(kind, e.to_string());
        err.db_code = db_code;
        err.with_source(e)
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StorageError::new(ErrorKind::DbOperationFailure, format!("migration failed: {}", e))
    }
}

impl From<tokio::time::error::Elapsed> for StorageError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StorageError::new(ErrorKind::DeadlineExceeded, "operation timed out")
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::new(ErrorKind::Internal, format!("serialization error: {}", e))
    }
}
