//! Error taxonomy for the database layer.
//!
//! Every fallible operation in resilite returns [`DbResult`]. Variants follow
//! the failure classes the layer reacts to: transient connection problems are
//! retried locally, corruption and consistency problems are routed to recovery,
//! and everything else is surfaced to the caller unchanged.

use std::time::Duration;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type for database layer operations
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur in the database layer
#[derive(Error, Debug)]
pub enum DbError {
    /// Opening or probing a connection failed
    #[error("Connection failed: {0}")]
    Connection(String),

    /// No pooled connection became available in time
    #[error("Timed out after {waited:?} waiting for a pooled connection (max: {max})")]
    PoolTimeout { waited: Duration, max: usize },

    /// The pool has been shut down
    #[error("Connection pool is closed")]
    PoolClosed,

    /// A schema migration failed to apply or roll back
    #[error("Migration {version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// The declared migration set is malformed
    #[error("Invalid migration set: {}", .0.join("; "))]
    MigrationValidation(Vec<String>),

    /// Work inside a transaction failed, or commit failed
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// A transaction exceeded its deadline and was rolled back
    #[error("Transaction timed out after {0:?}")]
    TransactionTimeout(Duration),

    /// Engine-level integrity failure
    #[error("Database corruption detected: {0}")]
    Corruption(String),

    /// Application-level invariant broken
    #[error("Consistency violation: {found} inconsistencies ({details})")]
    ConsistencyViolation { found: usize, details: String },

    /// Every recovery tier failed
    #[error("Recovery exhausted after {attempts} attempts: {details}")]
    RecoveryExhausted { attempts: usize, details: String },

    /// Another recovery is already running
    #[error("A recovery operation is already in progress")]
    RecoveryInProgress,

    /// Creating, validating or restoring a backup failed
    #[error("Backup failed: {0}")]
    Backup(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A table or column name failed validation
    #[error("Invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by SQLite
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used to pick a propagation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Likely to succeed if retried later
    Transient,
    /// Structural damage to the database file
    Corruption,
    /// Application-level data problem
    Consistency,
    /// Not recoverable by retrying
    Fatal,
}

impl DbError {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            DbError::Connection(_)
            | DbError::PoolTimeout { .. }
            | DbError::TransactionTimeout(_)
            | DbError::RecoveryInProgress => ErrorClass::Transient,
            DbError::Corruption(_) | DbError::RecoveryExhausted { .. } => ErrorClass::Corruption,
            DbError::ConsistencyViolation { .. } => ErrorClass::Consistency,
            DbError::Sqlite(e) => match e.sqlite_error_code() {
                Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                    ErrorClass::Corruption
                }
                Some(ErrorCode::DatabaseBusy)
                | Some(ErrorCode::DatabaseLocked)
                | Some(ErrorCode::CannotOpen)
                | Some(ErrorCode::OperationInterrupted) => ErrorClass::Transient,
                _ => ErrorClass::Fatal,
            },
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether this error signals a damaged database file
    pub fn is_corruption(&self) -> bool {
        self.class() == ErrorClass::Corruption
    }

    /// Operator-facing message that separates "retry later" from "data at risk"
    pub fn user_message(&self) -> String {
        match self.class() {
            ErrorClass::Transient => format!(
                "The database is temporarily unavailable ({}). This is usually temporary, retry later.",
                self
            ),
            ErrorClass::Corruption => format!(
                "The database file is damaged ({}). There is a risk of data loss; check the backups directory before continuing.",
                self
            ),
            ErrorClass::Consistency => format!(
                "Stored data violates application rules ({}). Review the consistency report; automatic correction may be needed.",
                self
            ),
            ErrorClass::Fatal => format!("The database operation failed: {}", self),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        DbError::Config(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sqlite_failure(code: i32) -> DbError {
        DbError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            None,
        ))
    }

    #[rstest]
    #[case(DbError::Connection("refused".into()), ErrorClass::Transient)]
    #[case(DbError::PoolTimeout { waited: Duration::from_millis(50), max: 5 }, ErrorClass::Transient)]
    #[case(DbError::Corruption("bad page".into()), ErrorClass::Corruption)]
    #[case(DbError::ConsistencyViolation { found: 3, details: "orphans".into() }, ErrorClass::Consistency)]
    #[case(DbError::Migration { version: 2, reason: "syntax".into() }, ErrorClass::Fatal)]
    #[case(sqlite_failure(rusqlite::ffi::SQLITE_CORRUPT), ErrorClass::Corruption)]
    #[case(sqlite_failure(rusqlite::ffi::SQLITE_NOTADB), ErrorClass::Corruption)]
    #[case(sqlite_failure(rusqlite::ffi::SQLITE_BUSY), ErrorClass::Transient)]
    #[case(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT), ErrorClass::Fatal)]
    fn classifies_errors(#[case] error: DbError, #[case] expected: ErrorClass) {
        assert_eq!(error.class(), expected);
    }

    #[test]
    fn user_message_distinguishes_transient_from_data_loss() {
        let transient = DbError::Connection("locked".into()).user_message();
        assert!(transient.contains("retry later"));

        let exhausted = DbError::RecoveryExhausted {
            attempts: 5,
            details: "all tiers failed".into(),
        }
        .user_message();
        assert!(exhausted.contains("check the backups"));
    }

    #[test]
    fn validation_errors_are_joined() {
        let err = DbError::MigrationValidation(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Invalid migration set: a; b");
    }
}
