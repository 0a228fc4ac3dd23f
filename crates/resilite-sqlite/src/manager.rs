//! The database service handle
//!
//! [`DatabaseManager`] wires the pool, migrations, transactions, recovery,
//! backups and the health monitor together behind one explicit handle.
//! Collaborators receive the handle (usually in an `Arc`) at construction;
//! there is no process-wide instance, so tests can run any number of
//! isolated databases side by side.
//!
//! # Example
//!
//! ```rust,no_run
//! use resilite_core::config::DatabaseConfig;
//! use resilite_sqlite::manager::DatabaseManager;
//! use resilite_sqlite::migration::Migration;
//!
//! # fn main() -> resilite_core::DbResult<()> {
//! let db = DatabaseManager::builder(DatabaseConfig::new("/var/lib/app", "app.db"))
//!     .migrations(vec![Migration::sql(
//!         1,
//!         "create notes",
//!         "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)",
//!         "DROP TABLE notes",
//!     )])
//!     .initialize()?;
//!
//! db.run_transaction(|tx| Ok(tx.execute("INSERT INTO notes (body) VALUES ('hello')", [])?))
//!     .into_result()?;
//! db.shutdown()?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::broadcast;

use resilite_core::config::DatabaseConfig;
use resilite_core::error::{DbError, DbResult};
use resilite_core::health::{HealthCheckResult, HealthTrends};
use resilite_core::retry::{RetryPolicy, retry_with};

use crate::backup::{BackupInfo, BackupManager};
use crate::connection::{open_connection, open_existing, probe};
use crate::events::{EventBus, HealthEvent};
use crate::migration::{AppliedMigration, Migration, MigrationReport, MigrationRunner, MigrationStatus};
use crate::monitor::DatabaseHealthMonitor;
use crate::pool::{ConnectionPool, PoolStats};
use crate::recovery::consistency::{ConsistencyReport, ConsistencyRules};
use crate::recovery::corruption::{self, IntegrityReport};
use crate::recovery::{ErrorRecoveryManager, RecoveryReport, SnapshotSource};
use crate::transaction::{TransactionManager, TransactionOptions, TransactionOutcome};

/// What happened while the database was brought up
#[derive(Debug, Clone)]
pub struct StartupReport {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Set when the file needed recovery before it could be used
    pub recovery: Option<RecoveryReport>,
    /// Backup taken before pending migrations were applied
    pub pre_migration_backup: Option<PathBuf>,
    pub migrations: MigrationReport,
    /// Result of the startup consistency sweep, if one ran
    pub consistency: Option<ConsistencyReport>,
}

/// Collects migrations and collaborators before initialization
pub struct DatabaseManagerBuilder {
    config: DatabaseConfig,
    migrations: Vec<Migration>,
    migration_timeout: Option<Duration>,
    rules: ConsistencyRules,
    snapshot_source: Option<Arc<dyn SnapshotSource>>,
    manage_schema: bool,
    startup_recovery: bool,
}

impl DatabaseManagerBuilder {
    pub fn migrations(mut self, migrations: Vec<Migration>) -> Self {
        self.migrations.extend(migrations);
        self
    }

    pub fn migration(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }

    /// Interrupt any single migration that runs longer than `timeout`
    pub fn migration_timeout(mut self, timeout: Duration) -> Self {
        self.migration_timeout = Some(timeout);
        self
    }

    pub fn consistency_rules(mut self, rules: ConsistencyRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn snapshot_source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.snapshot_source = Some(source);
        self
    }

    /// Leave the schema alone: no migrations are applied and the recorded
    /// version is reported as found. For tools that inspect a database
    /// owned by another process.
    pub fn unmanaged_schema(mut self) -> Self {
        self.manage_schema = false;
        self
    }

    /// When disabled, a damaged file fails startup with the error that was
    /// found instead of running the recovery tiers
    pub fn startup_recovery(mut self, enabled: bool) -> Self {
        self.startup_recovery = enabled;
        self
    }

    /// Open, recover if needed, migrate and start monitoring
    pub fn initialize(self) -> DbResult<DatabaseManager> {
        DatabaseManager::initialize(self)
    }
}

/// Handle to one managed database
pub struct DatabaseManager {
    config: DatabaseConfig,
    pool: Arc<ConnectionPool>,
    migrations: Arc<MigrationRunner>,
    backups: Arc<BackupManager>,
    recovery: Arc<ErrorRecoveryManager>,
    transactions: TransactionManager,
    monitor: DatabaseHealthMonitor,
    events: EventBus,
    manage_schema: bool,
    startup: StartupReport,
}

impl std::fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseManager")
            .field("path", &self.pool.path())
            .field("monitoring", &self.monitor.is_monitoring())
            .finish_non_exhaustive()
    }
}

impl DatabaseManager {
    pub fn builder(config: DatabaseConfig) -> DatabaseManagerBuilder {
        DatabaseManagerBuilder {
            config,
            migrations: Vec::new(),
            migration_timeout: None,
            rules: ConsistencyRules::default(),
            snapshot_source: None,
            manage_schema: true,
            startup_recovery: true,
        }
    }

    fn initialize(builder: DatabaseManagerBuilder) -> DbResult<Self> {
        let started = Instant::now();
        let started_at = Utc::now();
        let DatabaseManagerBuilder {
            config,
            migrations,
            migration_timeout,
            rules,
            snapshot_source,
            manage_schema,
            startup_recovery,
        } = builder;

        config.validate()?;
        let validation = MigrationRunner::validate_set(&migrations);
        if !validation.valid {
            return Err(DbError::MigrationValidation(validation.errors));
        }
        let mut runner = MigrationRunner::new(migrations);
        if let Some(timeout) = migration_timeout {
            runner = runner.with_timeout(timeout);
        }
        let runner = Arc::new(runner);

        std::fs::create_dir_all(&config.directory)?;
        let path = config.database_path();
        tracing::info!(path = %path.display(), "initializing database");

        let pool = Arc::new(ConnectionPool::new(&path, config.pool.clone(), config.pragmas.clone())?);
        let backups = Arc::new(BackupManager::new(
            config.backup_directory(),
            &path,
            config.backup.max_backups,
        ));
        let mut recovery = ErrorRecoveryManager::new(Arc::clone(&pool), Arc::clone(&backups), config.recovery.clone())
            .with_rules(rules)
            .with_migrations(Arc::clone(&runner));
        if let Some(source) = snapshot_source {
            recovery = recovery.with_snapshot_source(source);
        }
        let recovery = Arc::new(recovery);

        let (conn, recovery_report) = bootstrap(&config, &recovery, startup_recovery)?;

        let mut pre_migration_backup = None;
        if manage_schema {
            let current = runner.ensure_compatible(&conn)?;
            if current < runner.latest_version() && current > 0 && config.backup.before_migrations {
                let info = backups.create(&conn, "pre-migration")?;
                pre_migration_backup = Some(info.database_path());
            }
        }
        let migration_report = sync_schema(&runner, &conn, config.schema_version, manage_schema)?;
        drop(conn);

        pool.initialize()?;

        let consistency = if config.consistency_sweep_on_start && !recovery.rules().is_empty() {
            let conn = pool.acquire()?;
            let report = if config.recovery.auto_correct {
                recovery.verify_and_correct(&conn)?
            } else {
                recovery.verify_consistency(&conn)
            };
            tracing::info!(
                found = report.found,
                corrected = report.corrected,
                errors = report.errors.len(),
                "startup consistency sweep finished"
            );
            Some(report)
        } else {
            None
        };

        let events = EventBus::default();
        let monitor = DatabaseHealthMonitor::new(
            Arc::clone(&pool),
            Arc::clone(&recovery),
            config.monitor.clone(),
            events.clone(),
        );
        if config.monitor.enabled {
            monitor.start()?;
        }

        let transactions = TransactionManager::new(TransactionOptions::from(&config.transactions))
            .with_recovery(Arc::clone(&recovery));

        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            path = %path.display(),
            schema_version = migration_report.current_version,
            applied = migration_report.applied_count,
            recovered = recovery_report.is_some(),
            elapsed_ms,
            "database ready"
        );

        Ok(Self {
            config,
            pool,
            migrations: runner,
            backups,
            recovery,
            transactions,
            monitor,
            events,
            manage_schema,
            startup: StartupReport {
                started_at,
                elapsed_ms,
                recovery: recovery_report,
                pre_migration_backup,
                migrations: migration_report,
                consistency,
            },
        })
    }

    /// Stop monitoring and close every pooled connection. Idempotent.
    pub fn shutdown(&self) -> DbResult<()> {
        self.monitor.stop()?;
        self.pool.close_all()?;
        tracing::info!(path = %self.pool.path().display(), "database shut down");
        Ok(())
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        self.pool.path()
    }

    pub fn startup_report(&self) -> &StartupReport {
        &self.startup
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn recovery(&self) -> &Arc<ErrorRecoveryManager> {
        &self.recovery
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Run `f` with a pooled connection, released on every exit path
    pub fn with_connection<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Connection) -> DbResult<T>,
    {
        self.pool.with_connection(f)
    }

    /// Run `work` in a transaction with the configured defaults
    pub fn run_transaction<T, F>(&self, work: F) -> TransactionOutcome<T>
    where
        F: FnMut(&Connection) -> DbResult<T>,
    {
        self.run_transaction_with(self.transactions.defaults(), work)
    }

    pub fn run_transaction_with<T, F>(&self, options: &TransactionOptions, work: F) -> TransactionOutcome<T>
    where
        F: FnMut(&Connection) -> DbResult<T>,
    {
        match self.pool.acquire() {
            Ok(conn) => self.transactions.execute(&conn, options, work),
            Err(e) => TransactionOutcome {
                success: false,
                value: None,
                error: Some(e),
                attempts: 0,
                recovery_attempted: false,
                recovery_result: None,
            },
        }
    }

    pub fn current_schema_version(&self) -> DbResult<u32> {
        self.with_connection(|conn| self.migrations.current_version(conn))
    }

    pub fn applied_migrations(&self) -> DbResult<Vec<AppliedMigration>> {
        self.with_connection(|conn| self.migrations.applied(conn))
    }

    pub fn migration_status(&self) -> DbResult<MigrationStatus> {
        self.with_connection(|conn| self.migrations.status(conn))
    }

    /// Snapshot the database; returns the path of the backup file
    pub fn backup(&self) -> DbResult<PathBuf> {
        let info = self.with_connection(|conn| self.backups.create(conn, "manual"))?;
        Ok(info.database_path())
    }

    pub fn list_backups(&self) -> DbResult<Vec<BackupInfo>> {
        self.backups.list()
    }

    /// Replace the database with the backup at `path`, then bring it back to
    /// the declared schema
    pub fn restore(&self, path: &Path) -> DbResult<()> {
        self.paused(|| {
            self.pool.close_all()?;
            let restored = self.backups.restore(path);
            // reopen even when the restore failed; the old file is still in place
            self.pool.initialize()?;
            restored?;
            let report = self.with_connection(|conn| sync_schema(&self.migrations, conn, self.config.schema_version, self.manage_schema))?;
            tracing::info!(from = %path.display(), schema_version = report.current_version, "restore complete");
            Ok(())
        })
    }

    /// Run every recovery tier until one succeeds.
    ///
    /// When recovery replaced or emptied the file, pending migrations are
    /// applied again so the schema matches the declared set.
    pub fn recover(&self) -> DbResult<RecoveryReport> {
        self.paused(|| {
            let report = self.recovery.comprehensive_recovery()?;
            if report.success && report.requires_reinitialization() {
                self.with_connection(|conn| sync_schema(&self.migrations, conn, self.config.schema_version, self.manage_schema))?;
            }
            Ok(report)
        })
    }

    /// Check consistency rules, correcting violations when `correct` is set
    pub fn verify_consistency(&self, correct: bool) -> DbResult<ConsistencyReport> {
        self.with_connection(|conn| {
            if correct {
                self.recovery.verify_and_correct(conn)
            } else {
                Ok(self.recovery.verify_consistency(conn))
            }
        })
    }

    pub fn integrity_report(&self) -> DbResult<IntegrityReport> {
        self.with_connection(corruption::integrity_report)
    }

    /// Run a health check now; also recorded in the trend history
    pub fn health_check(&self) -> HealthCheckResult {
        self.monitor.health_check()
    }

    pub fn health_trends(&self) -> HealthTrends {
        self.monitor.get_health_trends()
    }

    pub fn recent_health_trends(&self, samples: usize) -> HealthTrends {
        self.monitor.recent_trends(samples)
    }

    pub fn pool_stats(&self) -> DbResult<PoolStats> {
        self.pool.stats()
    }

    /// Receive health events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_monitoring()
    }

    pub fn start_monitoring(&self) -> DbResult<()> {
        self.monitor.start()
    }

    pub fn stop_monitoring(&self) -> DbResult<()> {
        self.monitor.stop()
    }

    /// Run `f` with the monitor stopped, restarting it afterwards if it was running
    fn paused<T>(&self, f: impl FnOnce() -> DbResult<T>) -> DbResult<T> {
        let was_monitoring = self.monitor.is_monitoring();
        self.monitor.stop()?;
        let result = f();
        if was_monitoring {
            self.monitor.start()?;
        }
        result
    }
}

impl Drop for DatabaseManager {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "error while shutting down database");
        }
    }
}

/// Open the first connection, retrying transient failures and escalating
/// to comprehensive recovery when the file is damaged
fn bootstrap(
    config: &DatabaseConfig,
    recovery: &ErrorRecoveryManager,
    recover: bool,
) -> DbResult<(Connection, Option<RecoveryReport>)> {
    let path = config.database_path();
    let policy = RetryPolicy::exponential(
        config.recovery.max_retries,
        Duration::from_millis(config.recovery.retry_delay_ms),
        config.recovery.backoff_multiplier,
    );
    let opened = retry_with(
        &policy,
        |attempt| {
            let conn = open_connection(&path, &config.pragmas)?;
            probe(&conn).map_err(|e| {
                tracing::warn!(attempt, error = %e, "bootstrap probe failed");
                e
            })?;
            Ok(conn)
        },
        |e: &DbError, _| e.is_transient(),
    );

    let damage = match opened.result {
        Ok(conn) => {
            let report = corruption::check(&conn)?;
            if !report.is_corrupted {
                return Ok((conn, None));
            }
            corruption::corruption_error(&report)
        }
        Err(e) if e.is_corruption() => e,
        Err(e) if file_is_damaged(&path) => DbError::Corruption(e.to_string()),
        Err(e) => {
            tracing::error!(attempts = opened.attempts, error = %e, "could not open database");
            return Err(e);
        }
    };

    if !recover {
        tracing::error!(path = %path.display(), error = %damage, "database unusable, startup recovery disabled");
        return Err(damage);
    }
    tracing::error!(path = %path.display(), error = %damage, "database unusable, starting recovery");
    let report = recovery.comprehensive_recovery()?;
    if !report.success {
        return Err(report.into_error());
    }
    tracing::warn!(action = ?report.final_action, "database recovered during startup");
    let conn = open_connection(&path, &config.pragmas)?;
    Ok((conn, Some(report)))
}

/// Whether an existing file fails the engine checks when opened bare
fn file_is_damaged(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    match open_existing(path).and_then(|conn| corruption::check(&conn)) {
        Ok(report) => report.is_corrupted,
        Err(e) => e.is_corruption(),
    }
}

/// Bring `conn` up to the declared schema, or only read its version when
/// the schema is not managed here
fn sync_schema(
    runner: &MigrationRunner,
    conn: &Connection,
    expected: Option<u32>,
    managed: bool,
) -> DbResult<MigrationReport> {
    if managed {
        return migrate(runner, conn, expected);
    }
    Ok(MigrationReport {
        success: true,
        applied_count: 0,
        errors: Vec::new(),
        current_version: runner.current_version(conn)?,
    })
}

/// Any migration failure is fatal
fn migrate(runner: &MigrationRunner, conn: &Connection, expected: Option<u32>) -> DbResult<MigrationReport> {
    runner.ensure_compatible(conn)?;
    let report = runner.run_pending(conn)?;
    if !report.success {
        return Err(DbError::Migration {
            version: report.current_version + 1,
            reason: report.errors.join("; "),
        });
    }
    if let Some(expected) = expected {
        if report.current_version != expected {
            return Err(DbError::Migration {
                version: expected,
                reason: format!(
                    "schema version {} required but migrations end at {}",
                    expected, report.current_version
                ),
            });
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use resilite_core::config::MonitorConfig;
    use tempfile::tempdir;

    fn config(dir: &Path) -> DatabaseConfig {
        let mut config = DatabaseConfig::new(dir, "app.db");
        config.monitor = MonitorConfig {
            enabled: false,
            ..MonitorConfig::default()
        };
        config.recovery.retry_delay_ms = 1;
        config
    }

    fn migrations() -> Vec<Migration> {
        vec![
            Migration::sql(
                1,
                "create notes",
                "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)",
                "DROP TABLE notes",
            ),
            Migration::sql(
                2,
                "add created_at",
                "ALTER TABLE notes ADD COLUMN created_at TEXT",
                "ALTER TABLE notes DROP COLUMN created_at",
            ),
        ]
    }

    #[test]
    fn initializes_and_migrates() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::builder(config(dir.path()))
            .migrations(migrations())
            .initialize()
            .unwrap();

        assert_eq!(db.current_schema_version().unwrap(), 2);
        assert_eq!(db.applied_migrations().unwrap().len(), 2);
        assert_eq!(db.startup_report().migrations.applied_count, 2);
        assert!(db.startup_report().recovery.is_none());
        // a fresh database has nothing worth backing up
        assert!(db.startup_report().pre_migration_backup.is_none());
        assert!(!db.is_monitoring());
        db.shutdown().unwrap();
        db.shutdown().unwrap();
    }

    #[test]
    fn rejects_invalid_migration_set() {
        let dir = tempdir().unwrap();
        let mut set = migrations();
        set[1].version = 3;
        let err = DatabaseManager::builder(config(dir.path()))
            .migrations(set)
            .initialize()
            .unwrap_err();
        assert!(matches!(err, DbError::MigrationValidation(_)));
    }

    #[test]
    fn backs_up_before_pending_migrations() {
        let dir = tempdir().unwrap();
        let first = migrations().into_iter().take(1).collect::<Vec<_>>();
        DatabaseManager::builder(config(dir.path()))
            .migrations(first)
            .initialize()
            .unwrap()
            .shutdown()
            .unwrap();

        let db = DatabaseManager::builder(config(dir.path()))
            .migrations(migrations())
            .initialize()
            .unwrap();
        let backup = db.startup_report().pre_migration_backup.clone().unwrap();
        assert!(backup.is_file());
        assert_eq!(db.list_backups().unwrap()[0].manifest.reason, "pre-migration");
        assert_eq!(db.list_backups().unwrap()[0].manifest.schema_version, Some(1));
    }

    #[test]
    fn schema_version_mismatch_is_fatal() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.schema_version = Some(3);
        let err = DatabaseManager::builder(config)
            .migrations(migrations())
            .initialize()
            .unwrap_err();
        assert!(matches!(err, DbError::Migration { version: 3, .. }));
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::builder(config(dir.path()))
            .migrations(migrations())
            .initialize()
            .unwrap();

        db.run_transaction(|tx| Ok(tx.execute("INSERT INTO notes (body) VALUES ('kept')", [])?))
            .into_result()
            .unwrap();
        let backup = db.backup().unwrap();
        db.run_transaction(|tx| Ok(tx.execute("DELETE FROM notes", [])?))
            .into_result()
            .unwrap();

        db.restore(&backup).unwrap();
        let count: i64 = db
            .with_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(db.current_schema_version().unwrap(), 2);
    }

    #[test]
    fn restore_of_missing_backup_keeps_database_usable() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::builder(config(dir.path()))
            .migrations(migrations())
            .initialize()
            .unwrap();

        assert!(db.restore(&dir.path().join("nope.db")).is_err());
        assert_eq!(db.current_schema_version().unwrap(), 2);
    }

    #[test]
    fn pool_stats_and_health() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::builder(config(dir.path()))
            .migrations(migrations())
            .initialize()
            .unwrap();

        let stats = db.pool_stats().unwrap();
        assert_eq!(stats.available + stats.in_use, stats.total);
        assert!(db.health_check().healthy);
        assert_eq!(db.health_trends().sample_count, 1);
    }

    #[test]
    fn unmanaged_schema_opens_newer_database_untouched() {
        let dir = tempdir().unwrap();
        DatabaseManager::builder(config(dir.path()))
            .migrations(migrations())
            .initialize()
            .unwrap()
            .shutdown()
            .unwrap();

        let db = DatabaseManager::builder(config(dir.path()))
            .unmanaged_schema()
            .initialize()
            .unwrap();
        assert_eq!(db.startup_report().migrations.current_version, 2);
        assert_eq!(db.startup_report().migrations.applied_count, 0);
        assert_eq!(db.current_schema_version().unwrap(), 2);
    }

    #[test]
    fn damaged_file_is_reported_when_startup_recovery_is_off() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::builder(config(dir.path()))
            .migrations(migrations())
            .initialize()
            .unwrap();
        db.backup().unwrap();
        let path = db.path().to_path_buf();
        db.shutdown().unwrap();
        drop(db);
        std::fs::write(&path, vec![0x5Au8; 16 * 1024]).unwrap();
        let garbage = std::fs::read(&path).unwrap();

        let err = DatabaseManager::builder(config(dir.path()))
            .migrations(migrations())
            .startup_recovery(false)
            .initialize()
            .unwrap_err();
        assert!(err.is_corruption(), "{:?}", err);
        // nothing was restored or removed
        assert_eq!(std::fs::read(&path).unwrap(), garbage);
    }
}
