//! Versioned schema migrations
//!
//! Applied versions are recorded in `schema_migrations`. Each migration runs in
//! its own transaction together with the insert of its record, so a migration
//! is either fully applied and recorded or not at all.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};

use resilite_core::error::{DbError, DbResult};

use crate::timeout::{Watchdog, is_interrupt};

pub const MIGRATIONS_TABLE: &str = "schema_migrations";

/// Closure form of a migration step
pub type MigrationFn = Arc<dyn Fn(&Connection) -> DbResult<()> + Send + Sync>;

/// One direction of a migration
#[derive(Clone)]
pub enum MigrationStep {
    /// SQL text executed as a batch
    Sql(String),
    /// Arbitrary Rust code run against the migrating connection
    Function(MigrationFn),
}

impl MigrationStep {
    pub fn sql(sql: impl Into<String>) -> Self {
        MigrationStep::Sql(sql.into())
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&Connection) -> DbResult<()> + Send + Sync + 'static,
    {
        MigrationStep::Function(Arc::new(f))
    }

    fn is_empty(&self) -> bool {
        matches!(self, MigrationStep::Sql(sql) if sql.trim().is_empty())
    }

    fn run(&self, conn: &Connection) -> DbResult<()> {
        match self {
            MigrationStep::Sql(sql) => conn.execute_batch(sql).map_err(DbError::from),
            MigrationStep::Function(f) => f(conn),
        }
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStep::Sql(sql) => f.debug_tuple("Sql").field(sql).finish(),
            MigrationStep::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// A declared schema change
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub name: String,
    pub up: MigrationStep,
    pub down: Option<MigrationStep>,
}

impl Migration {
    pub fn new(version: u32, name: impl Into<String>, up: MigrationStep, down: Option<MigrationStep>) -> Self {
        Self {
            version,
            name: name.into(),
            up,
            down,
        }
    }

    /// Migration with SQL in both directions
    pub fn sql(version: u32, name: impl Into<String>, up: impl Into<String>, down: impl Into<String>) -> Self {
        Self::new(
            version,
            name,
            MigrationStep::sql(up),
            Some(MigrationStep::sql(down)),
        )
    }
}

/// A row of `schema_migrations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// Findings from [`MigrationRunner::validate`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Outcome of [`MigrationRunner::run_pending`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub success: bool,
    pub applied_count: usize,
    pub errors: Vec<String>,
    pub current_version: u32,
}

/// Where the database stands relative to the declared migrations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub current_version: u32,
    pub latest_version: u32,
    pub pending: Vec<u32>,
    pub applied: Vec<AppliedMigration>,
}

/// Applies a declared, ordered set of migrations
#[derive(Debug, Clone, Default)]
pub struct MigrationRunner {
    migrations: Vec<Migration>,
    timeout: Option<Duration>,
}

impl MigrationRunner {
    pub fn new(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        Self {
            migrations,
            timeout: None,
        }
    }

    /// Interrupt any single migration that runs longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Highest declared version, 0 when nothing is declared
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }

    /// Check the declared set; findings are reported, never raised
    pub fn validate(&self) -> ValidationReport {
        Self::validate_set(&self.migrations)
    }

    /// Validate any migration set: unique versions, no gaps starting from 1,
    /// a name and both directions on every migration
    pub fn validate_set(migrations: &[Migration]) -> ValidationReport {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for m in migrations {
            if !seen.insert(m.version) {
                errors.push(format!("duplicate migration version {}", m.version));
            }
            if m.version == 0 {
                errors.push("migration versions start at 1".to_string());
            }
            if m.name.trim().is_empty() {
                errors.push(format!("migration {} has no name", m.version));
            }
            if m.up.is_empty() {
                errors.push(format!("migration {} has no up procedure", m.version));
            }
            match &m.down {
                None => errors.push(format!("migration {} has no down procedure", m.version)),
                Some(down) if down.is_empty() => {
                    errors.push(format!("migration {} has an empty down procedure", m.version))
                }
                Some(_) => {}
            }
        }

        let mut versions: Vec<u32> = seen.into_iter().filter(|v| *v > 0).collect();
        versions.sort_unstable();
        let mut expected = 1;
        for version in versions {
            if version != expected {
                errors.push(format!(
                    "gap in migration versions: expected {}, found {}",
                    expected, version
                ));
            }
            expected = version + 1;
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }

    fn ensure_table(conn: &Connection) -> DbResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at DATETIME NOT NULL
            )",
        )?;
        Ok(())
    }

    /// Highest applied version; 0 on a fresh database
    pub fn current_version(&self, conn: &Connection) -> DbResult<u32> {
        Self::ensure_table(conn)?;
        let version: u32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Every recorded migration, oldest first
    pub fn applied(&self, conn: &Connection) -> DbResult<Vec<AppliedMigration>> {
        Self::ensure_table(conn)?;
        let mut stmt =
            conn.prepare("SELECT version, name, applied_at FROM schema_migrations ORDER BY version")?;
        let rows = stmt.query_map([], |row| {
            Ok(AppliedMigration {
                version: row.get(0)?,
                name: row.get(1)?,
                applied_at: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn status(&self, conn: &Connection) -> DbResult<MigrationStatus> {
        let current_version = self.current_version(conn)?;
        let applied = self.applied(conn)?;
        let applied_versions: HashSet<u32> = applied.iter().map(|m| m.version).collect();
        Ok(MigrationStatus {
            current_version,
            latest_version: self.latest_version(),
            pending: self
                .migrations
                .iter()
                .map(|m| m.version)
                .filter(|v| !applied_versions.contains(v))
                .collect(),
            applied,
        })
    }

    /// Fail if the database carries a schema newer than anything declared
    pub fn ensure_compatible(&self, conn: &Connection) -> DbResult<u32> {
        let current = self.current_version(conn)?;
        let latest = self.latest_version();
        if current > latest {
            return Err(DbError::Migration {
                version: current,
                reason: format!(
                    "database schema version {} is newer than the latest known migration {}",
                    current, latest
                ),
            });
        }
        Ok(current)
    }

    /// Apply every migration above the current version, in ascending order,
    /// stopping at the first failure
    pub fn run_pending(&self, conn: &Connection) -> DbResult<MigrationReport> {
        let validation = self.validate();
        let current = self.current_version(conn)?;
        if !validation.valid {
            return Ok(MigrationReport {
                success: false,
                applied_count: 0,
                errors: validation.errors,
                current_version: current,
            });
        }

        let mut report = MigrationReport {
            success: true,
            applied_count: 0,
            errors: Vec::new(),
            current_version: current,
        };

        for migration in self.migrations.iter().filter(|m| m.version > current) {
            let started = std::time::Instant::now();
            match self.apply(conn, migration) {
                Ok(()) => {
                    report.applied_count += 1;
                    report.current_version = migration.version;
                    tracing::info!(
                        version = migration.version,
                        name = %migration.name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "applied migration"
                    );
                }
                Err(e) => {
                    tracing::error!(version = migration.version, name = %migration.name, error = %e, "migration failed");
                    report.success = false;
                    report.errors.push(e.to_string());
                    break;
                }
            }
        }

        Ok(report)
    }

    fn apply(&self, conn: &Connection, migration: &Migration) -> DbResult<()> {
        let watchdog = self.timeout.map(|t| Watchdog::arm(conn, t));
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(|e| migration_error(migration.version, "failed to begin", e))?;

        let result = migration.up.run(&tx).and_then(|()| {
            tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![migration.version, migration.name, Utc::now()],
            )?;
            Ok(())
        });

        let result = match result {
            Ok(()) => tx.commit().map_err(DbError::from),
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::error!(version = migration.version, error = %rollback, "rollback of failed migration failed");
                }
                Err(e)
            }
        };

        let timed_out = watchdog.map(Watchdog::disarm).unwrap_or(false);
        result.map_err(|e| match e {
            DbError::Sqlite(ref inner) if timed_out && is_interrupt(inner) => DbError::Migration {
                version: migration.version,
                reason: format!("timed out after {:?}", self.timeout.unwrap_or_default()),
            },
            DbError::Migration { .. } => e,
            other => DbError::Migration {
                version: migration.version,
                reason: other.to_string(),
            },
        })
    }

    /// Undo one migration and remove its record in a single transaction
    pub fn rollback(&self, conn: &Connection, migration: &Migration) -> DbResult<()> {
        let down = migration.down.as_ref().ok_or_else(|| DbError::Migration {
            version: migration.version,
            reason: "no down procedure defined".to_string(),
        })?;

        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(|e| migration_error(migration.version, "failed to begin rollback", e))?;
        let result = down.run(&tx).and_then(|()| {
            let removed = tx.execute(
                "DELETE FROM schema_migrations WHERE version = ?1",
                params![migration.version],
            )?;
            if removed == 0 {
                return Err(DbError::Migration {
                    version: migration.version,
                    reason: "migration is not recorded as applied".to_string(),
                });
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                tx.commit()
                    .map_err(|e| migration_error(migration.version, "failed to commit rollback", e))?;
                tracing::info!(version = migration.version, name = %migration.name, "rolled back migration");
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::error!(version = migration.version, error = %rollback, "undoing a failed down procedure failed");
                }
                Err(match e {
                    DbError::Migration { .. } => e,
                    other => DbError::Migration {
                        version: migration.version,
                        reason: format!("rollback failed: {}", other),
                    },
                })
            }
        }
    }

    /// Roll back applied migrations newest first until `target` is current
    pub fn rollback_to(&self, conn: &Connection, target: u32) -> DbResult<u32> {
        Self::ensure_table(conn)?;
        let current = self.current_version(conn)?;
        let mut rolled_back = 0;
        for migration in self
            .migrations
            .iter()
            .rev()
            .filter(|m| m.version > target && m.version <= current)
        {
            self.rollback(conn, migration)?;
            rolled_back += 1;
        }
        tracing::info!(from = current, to = target, rolled_back, "rolled back migrations");
        self.current_version(conn)
    }
}

/// Highest applied version without creating the record table; `None` when
/// the database has never been migrated
pub fn recorded_schema_version(conn: &Connection) -> DbResult<Option<u32>> {
    if !crate::connection::table_exists(conn, MIGRATIONS_TABLE)? {
        return Ok(None);
    }
    let version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(Some(version))
}

fn migration_error(version: u32, context: &str, e: rusqlite::Error) -> DbError {
    DbError::Migration {
        version,
        reason: format!("{}: {}", context, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::table_exists;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn three_tables() -> Vec<Migration> {
        vec![
            Migration::sql(
                1,
                "create users",
                "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL)",
                "DROP TABLE users",
            ),
            Migration::sql(
                2,
                "create sessions",
                "CREATE TABLE sessions (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id))",
                "DROP TABLE sessions",
            ),
            Migration::sql(
                3,
                "index sessions",
                "CREATE INDEX idx_sessions_user ON sessions(user_id)",
                "DROP INDEX idx_sessions_user",
            ),
        ]
    }

    #[test]
    fn fresh_database_is_version_zero() {
        let conn = Connection::open_in_memory().unwrap();
        let runner = MigrationRunner::new(three_tables());
        assert_eq!(runner.current_version(&conn).unwrap(), 0);
        assert!(table_exists(&conn, MIGRATIONS_TABLE).unwrap());
    }

    #[test]
    fn run_pending_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let runner = MigrationRunner::new(three_tables());

        let first = runner.run_pending(&conn).unwrap();
        assert!(first.success);
        assert_eq!(first.applied_count, 3);
        assert_eq!(first.current_version, 3);

        let second = runner.run_pending(&conn).unwrap();
        assert!(second.success);
        assert_eq!(second.applied_count, 0);
        assert_eq!(second.current_version, 3);
        assert_eq!(runner.applied(&conn).unwrap().len(), 3);
    }

    #[test]
    fn stops_at_first_failure() {
        let conn = Connection::open_in_memory().unwrap();
        let v3_attempted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&v3_attempted);

        let runner = MigrationRunner::new(vec![
            Migration::sql(1, "one", "CREATE TABLE one (id INTEGER)", "DROP TABLE one"),
            Migration::new(
                2,
                "two",
                MigrationStep::function(|conn| {
                    conn.execute_batch("CREATE TABLE two (id INTEGER)")?;
                    Err(DbError::Transaction("forward procedure threw".into()))
                }),
                Some(MigrationStep::sql("DROP TABLE two")),
            ),
            Migration::new(
                3,
                "three",
                MigrationStep::function(move |_| {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }),
                Some(MigrationStep::sql("SELECT 1")),
            ),
        ]);

        let report = runner.run_pending(&conn).unwrap();
        assert!(!report.success);
        assert_eq!(report.applied_count, 1);
        assert_eq!(report.current_version, 1);
        assert!(!report.errors.is_empty());
        assert!(!v3_attempted.load(Ordering::SeqCst));
        // partial DDL from v2 was rolled back
        assert!(!table_exists(&conn, "two").unwrap());
    }

    #[test]
    fn retries_only_the_remainder() {
        let conn = Connection::open_in_memory().unwrap();
        let broken = MigrationRunner::new(vec![
            Migration::sql(1, "one", "CREATE TABLE one (id INTEGER)", "DROP TABLE one"),
            Migration::sql(2, "two", "CREATE TABLE two (id INTEGER", "DROP TABLE two"),
        ]);
        assert_eq!(broken.run_pending(&conn).unwrap().current_version, 1);

        let fixed = MigrationRunner::new(vec![
            Migration::sql(1, "one", "CREATE TABLE one (id INTEGER)", "DROP TABLE one"),
            Migration::sql(2, "two", "CREATE TABLE two (id INTEGER)", "DROP TABLE two"),
        ]);
        let report = fixed.run_pending(&conn).unwrap();
        assert!(report.success);
        assert_eq!(report.applied_count, 1);
        assert_eq!(report.current_version, 2);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut migrations = three_tables();
        migrations.push(Migration::sql(3, "dup", "SELECT 1", "SELECT 1"));
        migrations.push(Migration::new(5, "", MigrationStep::sql(" "), None));

        let report = MigrationRunner::validate_set(&migrations);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("duplicate migration version 3")));
        assert!(report.errors.iter().any(|e| e.contains("gap")));
        assert!(report.errors.iter().any(|e| e.contains("no name")));
        assert!(report.errors.iter().any(|e| e.contains("no up procedure")));
        assert!(report.errors.iter().any(|e| e.contains("no down procedure")));
    }

    #[test]
    fn invalid_set_is_not_applied() {
        let conn = Connection::open_in_memory().unwrap();
        let runner = MigrationRunner::new(vec![Migration::sql(2, "late", "SELECT 1", "SELECT 1")]);
        let report = runner.run_pending(&conn).unwrap();
        assert!(!report.success);
        assert_eq!(report.applied_count, 0);
    }

    #[test]
    fn rollback_removes_record_and_schema() {
        let conn = Connection::open_in_memory().unwrap();
        let runner = MigrationRunner::new(three_tables());
        runner.run_pending(&conn).unwrap();

        let version = runner.rollback_to(&conn, 1).unwrap();
        assert_eq!(version, 1);
        assert!(!table_exists(&conn, "sessions").unwrap());
        assert!(table_exists(&conn, "users").unwrap());

        let status = runner.status(&conn).unwrap();
        assert_eq!(status.pending, vec![2, 3]);
        assert_eq!(status.latest_version, 3);
    }

    #[test]
    fn rollback_of_unapplied_migration_fails() {
        let conn = Connection::open_in_memory().unwrap();
        let runner = MigrationRunner::new(three_tables());
        let err = runner.rollback(&conn, &runner.migrations()[0].clone());
        assert!(matches!(err, Err(DbError::Migration { version: 1, .. })));
    }

    #[test]
    fn failed_rollback_leaves_schema_as_it_was() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL)")
            .unwrap();
        let runner = MigrationRunner::new(three_tables());

        // the down procedure drops the table, then the missing record aborts it
        let err = runner.rollback(&conn, &runner.migrations()[0].clone());
        assert!(matches!(err, Err(DbError::Migration { version: 1, .. })));
        assert!(table_exists(&conn, "users").unwrap());
        assert!(conn.is_autocommit());
    }

    #[test]
    fn newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationRunner::new(three_tables()).run_pending(&conn).unwrap();

        let older_build = MigrationRunner::new(three_tables().into_iter().take(2).collect());
        assert!(matches!(
            older_build.ensure_compatible(&conn),
            Err(DbError::Migration { version: 3, .. })
        ));
    }

    #[test]
    fn slow_migration_times_out() {
        let conn = Connection::open_in_memory().unwrap();
        let runner = MigrationRunner::new(vec![Migration::sql(
            1,
            "endless",
            "CREATE TABLE t AS WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT x FROM c",
            "DROP TABLE t",
        )])
        .with_timeout(Duration::from_millis(50));

        let report = runner.run_pending(&conn).unwrap();
        assert!(!report.success);
        assert!(report.errors[0].contains("timed out"));
        assert_eq!(runner.current_version(&conn).unwrap(), 0);
    }
}
