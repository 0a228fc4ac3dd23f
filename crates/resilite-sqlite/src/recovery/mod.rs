//! Error recovery
//!
//! [`ErrorRecoveryManager`] owns every action that changes the database in
//! response to a failure. Actions are tried in order of increasing
//! destructiveness, and each one produces a [`RecoveryResult`] whether it
//! succeeds or not, so the caller always gets the full trail.
//!
//! Only one recovery runs at a time. A second caller (for example the health
//! monitor while an operator-triggered recovery is underway) gets
//! [`DbError::RecoveryInProgress`] instead of a competing repair.

pub mod consistency;
pub mod corruption;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use resilite_core::config::RecoveryConfig;
use resilite_core::error::{DbError, DbResult};
use resilite_core::retry::{RetryPolicy, retry};

use crate::backup::{BackupManager, remove_if_exists, sidecar};
use crate::connection::{probe, rollback_open_transaction};
use crate::migration::MigrationRunner;
use crate::pool::ConnectionPool;

use self::consistency::{ConsistencyReport, ConsistencyRules};
use self::corruption::{CorruptionReport, connection_is_healthy};

/// The action a recovery step performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-open connections
    Reconnect,
    /// Roll back and re-run a failed transaction once
    Retry,
    /// Rebuild indexes and compact the file
    Repair,
    /// Apply deterministic consistency corrections
    Correct,
    /// Replace the file with the latest valid backup
    Restore,
    /// Rebuild the database from an external snapshot source
    Recreate,
    /// Remove the file so an empty database can be initialized
    Reset,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryAction::Reconnect => "reconnect",
            RecoveryAction::Retry => "retry",
            RecoveryAction::Repair => "repair",
            RecoveryAction::Correct => "correct",
            RecoveryAction::Restore => "restore",
            RecoveryAction::Recreate => "recreate",
            RecoveryAction::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Outcome of one recovery action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub action: RecoveryAction,
    pub details: String,
    pub error: Option<String>,
    pub attempts: u32,
}

impl RecoveryResult {
    pub(crate) fn succeeded(action: RecoveryAction, details: impl Into<String>, attempts: u32) -> Self {
        Self {
            success: true,
            action,
            details: details.into(),
            error: None,
            attempts,
        }
    }

    pub(crate) fn failed(action: RecoveryAction, details: impl Into<String>, error: impl fmt::Display, attempts: u32) -> Self {
        Self {
            success: false,
            action,
            details: details.into(),
            error: Some(error.to_string()),
            attempts,
        }
    }
}

/// Trail of a comprehensive recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub success: bool,
    /// The action that brought the database back, if any
    pub final_action: Option<RecoveryAction>,
    /// Every step attempted, in order
    pub steps: Vec<RecoveryResult>,
    pub elapsed_ms: u64,
}

impl RecoveryReport {
    /// Whether the recovered database may be missing data or schema
    pub fn requires_reinitialization(&self) -> bool {
        matches!(
            self.final_action,
            Some(RecoveryAction::Restore | RecoveryAction::Recreate | RecoveryAction::Reset)
        )
    }

    pub fn into_error(self) -> DbError {
        let details = self
            .steps
            .iter()
            .map(|s| {
                format!(
                    "{}: {}",
                    s.action,
                    s.error.as_deref().unwrap_or(s.details.as_str())
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        DbError::RecoveryExhausted {
            attempts: self.steps.len(),
            details,
        }
    }
}

/// Source of truth outside the database file, used to rebuild it
///
/// Implemented by collaborators that can re-import data, such as a JSON
/// importer. `rebuild` runs against a fresh database with the schema applied.
pub trait SnapshotSource: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool {
        true
    }

    fn rebuild(&self, conn: &Connection) -> DbResult<()>;
}

/// Outcome of [`ErrorRecoveryManager::handle_transaction_failure`]
#[derive(Debug)]
pub struct TransactionRecovery<T> {
    pub result: RecoveryResult,
    /// Value produced by the retried work, when the retry succeeded
    pub value: Option<T>,
}

struct RecoveryGuard<'a>(&'a AtomicBool);

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Detects and repairs failures of one database
pub struct ErrorRecoveryManager {
    pool: Arc<ConnectionPool>,
    backups: Arc<BackupManager>,
    config: RecoveryConfig,
    rules: ConsistencyRules,
    migrations: Option<Arc<MigrationRunner>>,
    snapshot_source: Option<Arc<dyn SnapshotSource>>,
    in_progress: AtomicBool,
    failed_reconnects: AtomicU32,
}

impl fmt::Debug for ErrorRecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorRecoveryManager")
            .field("config", &self.config)
            .field("in_progress", &self.in_progress.load(Ordering::SeqCst))
            .field(
                "snapshot_source",
                &self.snapshot_source.as_ref().map(|s| s.name().to_string()),
            )
            .finish_non_exhaustive()
    }
}

impl ErrorRecoveryManager {
    pub fn new(pool: Arc<ConnectionPool>, backups: Arc<BackupManager>, config: RecoveryConfig) -> Self {
        Self {
            pool,
            backups,
            config,
            rules: ConsistencyRules::default(),
            migrations: None,
            snapshot_source: None,
            in_progress: AtomicBool::new(false),
            failed_reconnects: AtomicU32::new(0),
        }
    }

    pub fn with_rules(mut self, rules: ConsistencyRules) -> Self {
        self.rules = rules;
        self
    }

    /// Schema to re-apply before a snapshot source rebuilds the database
    pub fn with_migrations(mut self, migrations: Arc<MigrationRunner>) -> Self {
        self.migrations = Some(migrations);
        self
    }

    pub fn with_snapshot_source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.snapshot_source = Some(source);
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn rules(&self) -> &ConsistencyRules {
        &self.rules
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Consecutive failed reconnect attempts since the last success
    pub fn failed_reconnects(&self) -> u32 {
        self.failed_reconnects.load(Ordering::SeqCst)
    }

    fn begin(&self) -> DbResult<RecoveryGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| DbError::RecoveryInProgress)?;
        Ok(RecoveryGuard(&self.in_progress))
    }

    fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.config.max_retries,
            Duration::from_millis(self.config.retry_delay_ms),
            self.config.backoff_multiplier,
        )
    }

    /// Retry `connect` with exponential backoff until it succeeds or
    /// `max_retries` attempts have failed
    pub fn reconnect_with<F>(&self, connect: F) -> DbResult<RecoveryResult>
    where
        F: FnMut() -> DbResult<()>,
    {
        let _guard = self.begin()?;
        Ok(self.reconnect_inner(connect))
    }

    /// Re-open the pool and verify a connection answers
    pub fn reconnect(&self) -> DbResult<RecoveryResult> {
        let _guard = self.begin()?;
        Ok(self.reconnect_pool())
    }

    fn reconnect_pool(&self) -> RecoveryResult {
        self.reconnect_inner(|| {
            self.pool.reset()?;
            let conn = self.pool.acquire()?;
            probe(&conn)?;
            let problems = corruption::quick_check(&conn)?;
            if !problems.is_empty() {
                return Err(DbError::Corruption(problems.join("; ")));
            }
            Ok(())
        })
    }

    fn reconnect_inner<F>(&self, mut connect: F) -> RecoveryResult
    where
        F: FnMut() -> DbResult<()>,
    {
        let outcome = retry(&self.reconnect_policy(), |attempt| {
            let result = connect();
            match &result {
                Ok(()) => self.failed_reconnects.store(0, Ordering::SeqCst),
                Err(e) => {
                    let failed = self.failed_reconnects.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::warn!(attempt, failed, error = %e, "reconnect attempt failed");
                }
            }
            result
        });

        match outcome.result {
            Ok(()) => {
                tracing::info!(attempts = outcome.attempts, "reconnected");
                RecoveryResult::succeeded(
                    RecoveryAction::Reconnect,
                    format!("connected after {} attempt(s)", outcome.attempts),
                    outcome.attempts,
                )
            }
            Err(e) => {
                tracing::error!(attempts = outcome.attempts, error = %e, "reconnect failed");
                RecoveryResult::failed(
                    RecoveryAction::Reconnect,
                    format!("gave up after {} attempt(s)", outcome.attempts),
                    e,
                    outcome.attempts,
                )
            }
        }
    }

    /// Run the engine checks without modifying the database
    pub fn check_corruption(&self, conn: &Connection) -> DbResult<CorruptionReport> {
        corruption::check(conn)
    }

    /// Run the engine checks and repair when configured to
    pub fn detect_and_repair(&self, conn: &Connection) -> DbResult<CorruptionReport> {
        let _guard = self.begin()?;
        corruption::detect_and_repair(conn, self.config.auto_repair)
    }

    /// Treat a failed rollback as a corruption signal: check and repair
    pub fn handle_rollback_failure(&self, conn: &Connection, error: &DbError) -> DbResult<RecoveryResult> {
        tracing::error!(error = %error, "rollback failed, checking for corruption");
        self.repair_corruption(conn)
    }

    /// [`detect_and_repair`](Self::detect_and_repair) summarized as a recovery result
    pub fn repair_corruption(&self, conn: &Connection) -> DbResult<RecoveryResult> {
        let _guard = self.begin()?;
        Ok(repair_result(corruption::detect_and_repair(conn, self.config.auto_repair)))
    }

    /// [`verify_and_correct`](Self::verify_and_correct) summarized as a recovery result
    pub fn correct_consistency(&self, conn: &Connection) -> DbResult<RecoveryResult> {
        let report = self.verify_and_correct(conn)?;
        Ok(if report.is_consistent() {
            RecoveryResult::succeeded(RecoveryAction::Correct, report.summary(), 1)
        } else {
            RecoveryResult::failed(
                RecoveryAction::Correct,
                report.summary(),
                format!("{} of {} inconsistencies corrected", report.corrected, report.found),
                1,
            )
        })
    }

    /// Count consistency violations without changing anything
    pub fn verify_consistency(&self, conn: &Connection) -> ConsistencyReport {
        consistency::verify(conn, &self.rules)
    }

    /// Find and correct consistency violations
    pub fn verify_and_correct(&self, conn: &Connection) -> DbResult<ConsistencyReport> {
        let _guard = self.begin()?;
        Ok(consistency::verify_and_correct(conn, &self.rules))
    }

    /// Recover from a transaction that failed after its own retries.
    ///
    /// Rolls back whatever is still open, then checks the connection. A
    /// healthy connection gets exactly one more run of `retry`; an unhealthy
    /// one is escalated to corruption detection and repair.
    pub fn handle_transaction_failure<T, F>(
        &self,
        conn: &Connection,
        error: &DbError,
        retry: F,
    ) -> DbResult<TransactionRecovery<T>>
    where
        F: FnOnce(&Connection) -> DbResult<T>,
    {
        let _guard = self.begin()?;
        tracing::warn!(error = %error, "handling transaction failure");

        if let Err(e) = rollback_open_transaction(conn) {
            tracing::error!(error = %e, "rollback during transaction recovery failed");
        }

        if connection_is_healthy(conn) {
            return Ok(match retry(conn) {
                Ok(value) => TransactionRecovery {
                    result: RecoveryResult::succeeded(
                        RecoveryAction::Retry,
                        "connection healthy, retried work once",
                        1,
                    ),
                    value: Some(value),
                },
                Err(e) => TransactionRecovery {
                    result: RecoveryResult::failed(
                        RecoveryAction::Retry,
                        "connection healthy, but the retried work failed again",
                        e,
                        1,
                    ),
                    value: None,
                },
            });
        }

        tracing::warn!("connection unhealthy after rollback, escalating to corruption repair");
        Ok(TransactionRecovery {
            result: repair_result(corruption::detect_and_repair(conn, self.config.auto_repair)),
            value: None,
        })
    }

    /// Try every recovery tier in order, stopping at the first that works:
    /// reconnect, repair, restore from backup, recreate from the snapshot
    /// source, and finally reset to an empty file.
    pub fn comprehensive_recovery(&self) -> DbResult<RecoveryReport> {
        let _guard = self.begin()?;
        let started = Instant::now();
        tracing::warn!(path = %self.pool.path().display(), "starting comprehensive recovery");

        let tiers: [(&str, fn(&Self) -> RecoveryResult); 5] = [
            ("reconnect", Self::reconnect_pool),
            ("repair", Self::repair_tier),
            ("restore", Self::restore_tier),
            ("recreate", Self::recreate_tier),
            ("reset", Self::reset_tier),
        ];

        let mut steps = Vec::new();
        for (name, tier) in tiers {
            let result = tier(self);
            let success = result.success;
            tracing::info!(tier = name, success, details = %result.details, "recovery tier finished");
            let action = result.action;
            steps.push(result);
            if success {
                return Ok(RecoveryReport {
                    success: true,
                    final_action: Some(action),
                    steps,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
        }

        tracing::error!(attempts = steps.len(), "every recovery tier failed");
        Ok(RecoveryReport {
            success: false,
            final_action: None,
            steps,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn repair_tier(&self) -> RecoveryResult {
        if !self.config.auto_repair {
            return RecoveryResult::failed(RecoveryAction::Repair, "skipped", "auto repair disabled", 0);
        }
        let conn = match crate::connection::open_existing(self.pool.path()) {
            Ok(conn) => conn,
            Err(e) => return RecoveryResult::failed(RecoveryAction::Repair, "could not open database", e, 1),
        };
        let result = match corruption::detect_and_repair(&conn, true) {
            Ok(report) if report.is_healthy() => {
                RecoveryResult::succeeded(RecoveryAction::Repair, "integrity checks pass after repair", 1)
            }
            Ok(report) => RecoveryResult::failed(
                RecoveryAction::Repair,
                "repair did not clear corruption",
                corruption::corruption_error(&report),
                1,
            ),
            Err(e) => RecoveryResult::failed(RecoveryAction::Repair, "integrity check failed", e, 1),
        };
        drop(conn);

        if result.success {
            if let Err(e) = self.pool.reset() {
                return RecoveryResult::failed(RecoveryAction::Repair, "repaired, but the pool did not reopen", e, 1);
            }
        }
        result
    }

    fn restore_tier(&self) -> RecoveryResult {
        let backup = match self.backups.latest_valid() {
            Ok(Some(backup)) => backup,
            Ok(None) => {
                return RecoveryResult::failed(RecoveryAction::Restore, "skipped", "no valid backup available", 0);
            }
            Err(e) => return RecoveryResult::failed(RecoveryAction::Restore, "could not list backups", e, 0),
        };

        let restored = self
            .pool
            .close_all()
            .and_then(|()| self.backups.restore(&backup.database_path()))
            .and_then(|()| self.reopen_and_verify());
        match restored {
            Ok(()) => RecoveryResult::succeeded(
                RecoveryAction::Restore,
                format!(
                    "restored backup {} from {}",
                    backup.manifest.id, backup.manifest.created_at
                ),
                1,
            ),
            Err(e) => RecoveryResult::failed(
                RecoveryAction::Restore,
                format!("restoring backup {} failed", backup.manifest.id),
                e,
                1,
            ),
        }
    }

    fn recreate_tier(&self) -> RecoveryResult {
        let Some(source) = self.snapshot_source.as_ref().filter(|s| s.is_available()) else {
            return RecoveryResult::failed(RecoveryAction::Recreate, "skipped", "no snapshot source available", 0);
        };

        let rebuilt = self.remove_database_files("pre-recreate").and_then(|()| {
            self.pool.reset()?;
            let conn = self.pool.acquire()?;
            if let Some(runner) = &self.migrations {
                let report = runner.run_pending(&conn)?;
                if !report.success {
                    return Err(DbError::Migration {
                        version: report.current_version + 1,
                        reason: report.errors.join("; "),
                    });
                }
            }
            source.rebuild(&conn)?;
            let problems = corruption::quick_check(&conn)?;
            if !problems.is_empty() {
                return Err(DbError::Corruption(problems.join("; ")));
            }
            Ok(())
        });

        match rebuilt {
            Ok(()) => RecoveryResult::succeeded(
                RecoveryAction::Recreate,
                format!("rebuilt from snapshot source '{}'", source.name()),
                1,
            ),
            Err(e) => RecoveryResult::failed(
                RecoveryAction::Recreate,
                format!("rebuild from '{}' failed", source.name()),
                e,
                1,
            ),
        }
    }

    fn reset_tier(&self) -> RecoveryResult {
        if !self.config.allow_reset {
            return RecoveryResult::failed(RecoveryAction::Reset, "skipped", "reset to empty database not allowed", 0);
        }
        match self
            .remove_database_files("pre-reset")
            .and_then(|()| self.reopen_and_verify())
        {
            Ok(()) => {
                tracing::error!(
                    path = %self.pool.path().display(),
                    "database reset to empty; previous file kept in backups"
                );
                RecoveryResult::succeeded(
                    RecoveryAction::Reset,
                    "corrupt file moved to backups; empty database created",
                    1,
                )
            }
            Err(e) => RecoveryResult::failed(RecoveryAction::Reset, "could not reset database", e, 1),
        }
    }

    /// Close the pool, keep a raw copy of the current files, then delete them
    fn remove_database_files(&self, reason: &str) -> DbResult<()> {
        self.pool.close_all()?;
        if let Err(e) = self.backups.snapshot_file(reason) {
            tracing::warn!(error = %e, reason, "could not snapshot database before removing it");
        }
        let path = self.pool.path();
        remove_if_exists(path)?;
        remove_if_exists(&sidecar(path, "-wal"))?;
        remove_if_exists(&sidecar(path, "-shm"))?;
        Ok(())
    }

    fn reopen_and_verify(&self) -> DbResult<()> {
        self.pool.reset()?;
        let conn = self.pool.acquire()?;
        probe(&conn)?;
        let problems = corruption::quick_check(&conn)?;
        if !problems.is_empty() {
            return Err(DbError::Corruption(problems.join("; ")));
        }
        Ok(())
    }
}

fn repair_result(outcome: DbResult<CorruptionReport>) -> RecoveryResult {
    match outcome {
        Ok(report) if report.is_healthy() => RecoveryResult::succeeded(
            RecoveryAction::Repair,
            if report.repair_attempted {
                "corruption repaired"
            } else {
                "no corruption found"
            },
            1,
        ),
        Ok(report) => RecoveryResult::failed(
            RecoveryAction::Repair,
            "corruption not repaired",
            corruption::corruption_error(&report),
            1,
        ),
        Err(e) => RecoveryResult::failed(RecoveryAction::Repair, "corruption check failed", e, 1),
    }
}
