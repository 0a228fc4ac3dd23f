//! # Resilite
//!
//! Resilite is a resilient data layer over an embedded SQLite file. It keeps
//! a single-file database usable through connection churn, failed
//! transactions, schema upgrades and on-disk damage, and always reports
//! what it did to get there.
//!
//! ## Core Components
//!
//! - **[ConnectionPool]**: bounded pool of configured connections
//! - **[MigrationRunner]**: ordered, transactional schema migrations
//! - **[TransactionManager]**: deadlines, retries, batches and savepoints
//! - **[ErrorRecoveryManager]**: reconnect, repair, restore, recreate, reset
//! - **[DatabaseHealthMonitor]**: periodic checks, trends and auto-recovery
//! - **[DatabaseManager]**: the explicit handle collaborators are given
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resilite::{DatabaseConfig, DatabaseManager, Migration};
//!
//! # fn main() -> resilite::DbResult<()> {
//! let db = DatabaseManager::builder(DatabaseConfig::new("data", "app.db"))
//!     .migration(Migration::sql(
//!         1,
//!         "create notes",
//!         "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)",
//!         "DROP TABLE notes",
//!     ))
//!     .initialize()?;
//!
//! db.run_transaction(|tx| Ok(tx.execute("INSERT INTO notes (body) VALUES ('hello')", [])?))
//!     .into_result()?;
//!
//! let health = db.health_check();
//! assert!(health.healthy);
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Module aliases for namespaced access
// ============================================================================

pub use resilite_core as core;
pub use resilite_sqlite as sqlite;

// ============================================================================
// Flat re-exports of the everyday API
// ============================================================================

pub use resilite_core::{
    Backoff, BackupConfig, ConnectionStatus, DatabaseConfig, DbError, DbResult, ErrorClass,
    HealthCheckResult, HealthIssue, HealthMetrics, HealthTrends, IssueSeverity, IssueType,
    JournalMode, MonitorConfig, PoolConfig, PragmaConfig, RecoveryConfig, RetryOutcome,
    RetryPolicy, SqlIdentifier, SynchronousMode, TempStore, TransactionConfig, Trend, retry,
    retry_with,
};

pub use resilite_sqlite::{
    AppliedMigration, BackupInfo, BackupManager, ConnectionPool, ConsistencyReport,
    ConsistencyRules, CorruptionReport, DatabaseHealthMonitor, DatabaseManager,
    DatabaseManagerBuilder, DuplicatePolicy, ErrorRecoveryManager, HealthEvent, IntegrityReport,
    InvalidRowAction, Migration, MigrationReport, MigrationRunner, MigrationStatus, MigrationStep,
    NestedOutcome, NestedStep, OnError, OrphanRule, PoolStats, PooledConnection, RangeRule,
    RecoveryAction, RecoveryReport, RecoveryResult, SnapshotSource, StartupReport, StepResult,
    TimestampFormat, TimestampRule, TransactionManager, TransactionOptions, TransactionOutcome,
    UniqueRule, rusqlite,
};
