//! # resilite core
//!
//! Backend-agnostic building blocks for the resilite database layer:
//!
//! - [`error`]: the [`DbError`] taxonomy and its classification
//! - [`config`]: validated, serde-backed configuration
//! - [`health`]: health samples, issues, check results and trends
//! - [`retry`]: one retry-with-backoff utility for every retry loop
//! - [`identifier`]: SQL identifier validation for generated statements

pub mod config;
pub mod error;
pub mod health;
pub mod identifier;
pub mod retry;

pub use config::{
    BackupConfig, DatabaseConfig, JournalMode, MonitorConfig, PoolConfig, PragmaConfig,
    RecoveryConfig, SynchronousMode, TempStore, TransactionConfig,
};
pub use error::{DbError, DbResult, ErrorClass};
pub use health::{
    ConnectionStatus, HealthCheckResult, HealthIssue, HealthMetrics, HealthTrends, IssueSeverity,
    IssueType, Trend,
};
pub use identifier::SqlIdentifier;
pub use retry::{Backoff, RetryOutcome, RetryPolicy, retry, retry_with};
