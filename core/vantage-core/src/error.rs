//! Error types for the vantage engine.
//!
//! All public APIs return `DbResult<T>` — no panics in library code.

use thiserror::Error;

/// Unified error type for all engine operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Schema with the same name is already defined
    #[error("schema '{0}' already exists")]
    SchemaAlreadyExists(String),

    /// Requested schema does not exist
    #[error("schema '{0}' does not exist")]
    SchemaNotFound(String),

    /// Entity with the same name is already defined
    #[error("entity '{0}' already exists")]
    EntityAlreadyExists(String),

    /// Requested entity does not exist
    #[error("entity '{0}' does not exist")]
    EntityNotFound(String),

    /// Requested column does not exist
    #[error("column '{0}' does not exist")]
    ColumnNotFound(String),

    /// Index with the same name is already defined
    #[error("index '{0}' already exists")]
    IndexAlreadyExists(String),

    /// Requested index does not exist
    #[error("index '{0}' does not exist")]
    IndexNotFound(String),

    /// On-disk data is missing or has an unexpected shape; fatal for the DBO
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// On-disk version does not match the engine version; no auto-migration
    #[error("version mismatch: on-disk version {found}, engine version {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Storage environment exists where a fresh one was requested (or vice versa)
    #[error("invalid file: {0}")]
    InvalidFile(String),

    /// Application value collides with the reserved null sentinel for its type
    #[error("reserved value: {0}")]
    ReservedValue(String),

    /// Operation on a closed database object
    #[error("database object '{0}' is closed")]
    Closed(String),

    /// Operation not permitted in the transaction's current state
    #[error("transaction {txid} is in state {state}, operation requires {required}")]
    WrongTransactionState {
        txid: u64,
        state: &'static str,
        required: &'static str,
    },

    /// Lock acquisition would deadlock; this transaction was chosen as victim
    #[error("transaction {txid} aborted: deadlock on '{resource}'")]
    Deadlock { txid: u64, resource: String },

    /// Transaction was killed; execution observed the flag and aborted
    #[error("transaction {txid} cancelled")]
    Cancellation { txid: u64 },

    /// Constraint violation (nullability, type, unique index duplicate)
    #[error("validation failed: {0}")]
    Validation(String),

    /// The given index cannot process this predicate
    #[error("unsupported predicate: {0}")]
    UnsupportedPredicate(String),

    /// No executable physical plan could be produced
    #[error("planning failed: {0}")]
    PlanningFailure(String),

    /// Name resolution or type binding failed
    #[error("bind error: {0}")]
    Bind(String),

    /// Unexpected runtime failure during operator execution
    #[error("execution error: {0}")]
    Execution(String),

    /// Substrate error (redb)
    #[error("storage error: {source}")]
    Storage {
        #[from]
        source: redb::Error,
    },

    /// Standard I/O error
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Result type alias for all engine operations.
pub type DbResult<T> = Result<T, DbError>;

impl From<redb::DatabaseError> for DbError {
    fn from(err: redb::DatabaseError) -> Self {
        DbError::Storage {
            source: redb::Error::from(err),
        }
    }
}

impl From<redb::TransactionError> for DbError {
    fn from(err: redb::TransactionError) -> Self {
        DbError::Storage {
            source: redb::Error::from(err),
        }
    }
}

impl From<redb::TableError> for DbError {
    fn from(err: redb::TableError) -> Self {
        DbError::Storage {
            source: redb::Error::from(err),
        }
    }
}

impl From<redb::StorageError> for DbError {
    fn from(err: redb::StorageError) -> Self {
        DbError::Storage {
            source: redb::Error::from(err),
        }
    }
}

impl From<redb::CommitError> for DbError {
    fn from(err: redb::CommitError) -> Self {
        DbError::Storage {
            source: redb::Error::from(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_schema_exists() {
        let err = DbError::SchemaAlreadyExists("warehouse".to_string());
        assert_eq!(err.to_string(), "schema 'warehouse' already exists");
    }

    #[test]
    fn error_display_version_mismatch() {
        let err = DbError::VersionMismatch {
            expected: 1,
            found: 7,
        };
        assert!(err.to_string().contains("on-disk version 7"));
        assert!(err.to_string().contains("engine version 1"));
    }

    #[test]
    fn error_display_deadlock() {
        let err = DbError::Deadlock {
            txid: 42,
            resource: "warehouse.items".to_string(),
        };
        assert!(err.to_string().contains("42"));
        assert!(err.to_string().contains("warehouse.items"));
    }

    #[test]
    fn error_display_wrong_state() {
        let err = DbError::WrongTransactionState {
            txid: 3,
            state: "COMMITTED",
            required: "READY",
        };
        assert!(err.to_string().contains("COMMITTED"));
        assert!(err.to_string().contains("READY"));
    }

    #[test]
    fn db_result_round_trip() {
        let ok: DbResult<u64> = Ok(9);
        assert_eq!(ok.unwrap(), 9);
        let err: DbResult<u64> = Err(DbError::Validation("null in non-nullable column".into()));
        assert!(err.is_err());
    }
}
