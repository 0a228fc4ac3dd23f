//! # resilite SQLite backend
//!
//! A resilient access layer over an embedded SQLite file.
//!
//! ## Components
//!
//! - **[ConnectionPool]**: bounded pool of configured connections with RAII handles
//! - **[MigrationRunner]**: ordered, transactional schema migrations
//! - **[TransactionManager]**: transactions with deadlines, retries, batches and savepoints
//! - **[ErrorRecoveryManager]**: reconnect, repair, consistency correction and tiered recovery
//! - **[BackupManager]**: timestamped snapshots with manifests, pruning and restore
//! - **[DatabaseHealthMonitor]**: periodic checks, trends and automatic recovery
//! - **[DatabaseManager]**: the handle that wires everything together
//!
//! ## Example
//!
//! ```rust,no_run
//! use resilite_core::config::DatabaseConfig;
//! use resilite_sqlite::{DatabaseManager, Migration};
//!
//! # fn main() -> resilite_core::DbResult<()> {
//! let db = DatabaseManager::builder(DatabaseConfig::new("data", "app.db"))
//!     .migration(Migration::sql(
//!         1,
//!         "create users",
//!         "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT UNIQUE)",
//!         "DROP TABLE users",
//!     ))
//!     .initialize()?;
//!
//! let health = db.health_check();
//! println!("healthy: {}", health.healthy);
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod connection;
pub mod events;
pub mod manager;
pub mod migration;
pub mod monitor;
pub mod pool;
pub mod recovery;
pub mod timeout;
pub mod transaction;

pub use backup::{BackupFile, BackupInfo, BackupManager, BackupManifest};
pub use events::{EventBus, HealthEvent};
pub use manager::{DatabaseManager, DatabaseManagerBuilder, StartupReport};
pub use migration::{
    AppliedMigration, Migration, MigrationReport, MigrationRunner, MigrationStatus, MigrationStep,
    ValidationReport,
};
pub use monitor::DatabaseHealthMonitor;
pub use pool::{ConnectionInfo, ConnectionPool, PoolStats, PooledConnection};
pub use recovery::consistency::{
    ConsistencyReport, ConsistencyRules, DuplicatePolicy, InconsistencyKind, InvalidRowAction,
    OrphanRule, RangeRule, TimestampFormat, TimestampRule, UniqueRule,
};
pub use recovery::corruption::{CorruptionReport, IntegrityReport};
pub use recovery::{
    ErrorRecoveryManager, RecoveryAction, RecoveryReport, RecoveryResult, SnapshotSource,
};
pub use transaction::{
    NestedOutcome, NestedStep, OnError, StepResult, TransactionManager, TransactionOptions,
    TransactionOutcome,
};

// The engine crate, for callers writing closures against `&Connection`
pub use rusqlite;
