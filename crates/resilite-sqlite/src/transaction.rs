//! Transactions with deadlines, retries and recovery hand-off
//!
//! Every unit of work runs inside an `IMMEDIATE` transaction so the write
//! lock is taken up front. Work that fails is always rolled back. Failed
//! attempts are retried with linear backoff, and the last failure can be
//! handed to the [`ErrorRecoveryManager`].
//!
//! # Example
//!
//! ```rust,no_run
//! use resilite_sqlite::transaction::{TransactionManager, TransactionOptions};
//! # fn run(conn: &rusqlite::Connection) -> resilite_core::DbResult<()> {
//! let manager = TransactionManager::new(TransactionOptions::default());
//! let inserted = manager
//!     .run(conn, |tx| Ok(tx.execute("INSERT INTO notes (body) VALUES ('hi')", [])?))
//!     .into_result()?;
//! assert_eq!(inserted, 1);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use resilite_core::config::TransactionConfig;
use resilite_core::error::{DbError, DbResult};
use resilite_core::identifier::SqlIdentifier;
use resilite_core::retry::{RetryPolicy, retry_with};

use crate::connection::rollback_open_transaction;
use crate::recovery::{ErrorRecoveryManager, RecoveryAction, RecoveryResult};
use crate::timeout::Watchdog;

/// Per-call transaction settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOptions {
    pub timeout: Duration,
    /// Total attempts, including the first
    pub retry_attempts: u32,
    /// Linear backoff step: attempt `n` waits `n * retry_base_delay`
    pub retry_base_delay: Duration,
    /// Roll back a transaction left open on the connection instead of failing
    pub auto_rollback: bool,
    pub enable_recovery: bool,
}

impl From<&TransactionConfig> for TransactionOptions {
    fn from(config: &TransactionConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            retry_attempts: config.retry_attempts.max(1),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            auto_rollback: config.auto_rollback,
            enable_recovery: config.enable_recovery,
        }
    }
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self::from(&TransactionConfig::default())
    }
}

impl TransactionOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, attempts: u32, base_delay: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_base_delay = base_delay;
        self
    }

    pub fn with_auto_rollback(mut self, auto_rollback: bool) -> Self {
        self.auto_rollback = auto_rollback;
        self
    }

    pub fn with_recovery(mut self, enable_recovery: bool) -> Self {
        self.enable_recovery = enable_recovery;
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.retry_attempts, self.retry_base_delay)
    }
}

/// Result of [`TransactionManager::execute`]
///
/// Carries the trail of what happened even on failure: how many attempts
/// ran and what recovery, if any, did.
#[derive(Debug)]
pub struct TransactionOutcome<T> {
    pub success: bool,
    pub value: Option<T>,
    pub error: Option<DbError>,
    pub attempts: u32,
    pub recovery_attempted: bool,
    pub recovery_result: Option<RecoveryResult>,
}

impl<T> TransactionOutcome<T> {
    fn succeeded(value: T, attempts: u32) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
            attempts,
            recovery_attempted: false,
            recovery_result: None,
        }
    }

    fn failed(error: DbError, attempts: u32) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error),
            attempts,
            recovery_attempted: false,
            recovery_result: None,
        }
    }

    pub fn into_result(self) -> DbResult<T> {
        match (self.value, self.error) {
            (Some(value), _) => Ok(value),
            (None, Some(error)) => Err(error),
            (None, None) => Err(DbError::Transaction("transaction produced no value".to_string())),
        }
    }
}

/// What a nested step does when its operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    /// Abort the whole outer transaction
    #[default]
    Rollback,
    /// Undo this step only and carry on
    Continue,
}

/// Boxed operation for [`TransactionManager::execute_batch`]
pub type BatchOperation<'a> = Box<dyn FnMut(&Connection) -> DbResult<()> + 'a>;

/// One savepoint-scoped step of a nested transaction
pub struct NestedStep<'a> {
    pub savepoint: String,
    pub operation: Box<dyn FnOnce(&Connection) -> DbResult<()> + 'a>,
    pub on_error: OnError,
}

impl<'a> NestedStep<'a> {
    pub fn new<F>(savepoint: impl Into<String>, on_error: OnError, operation: F) -> Self
    where
        F: FnOnce(&Connection) -> DbResult<()> + 'a,
    {
        Self {
            savepoint: savepoint.into(),
            operation: Box::new(operation),
            on_error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub savepoint: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedOutcome {
    /// Whether the outer transaction committed
    pub committed: bool,
    pub steps: Vec<StepResult>,
}

/// Runs caller work inside transactions
#[derive(Debug, Clone, Default)]
pub struct TransactionManager {
    defaults: TransactionOptions,
    recovery: Option<Arc<ErrorRecoveryManager>>,
}

impl TransactionManager {
    pub fn new(defaults: TransactionOptions) -> Self {
        Self {
            defaults,
            recovery: None,
        }
    }

    pub fn with_recovery(mut self, recovery: Arc<ErrorRecoveryManager>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn defaults(&self) -> &TransactionOptions {
        &self.defaults
    }

    /// [`execute`](Self::execute) with the default options
    pub fn run<T, F>(&self, conn: &Connection, work: F) -> TransactionOutcome<T>
    where
        F: FnMut(&Connection) -> DbResult<T>,
    {
        self.execute(conn, &self.defaults, work)
    }

    /// Run `work` in a transaction, retrying failed attempts.
    ///
    /// Timeouts and failed rollbacks are not retried: the first is reported
    /// as [`DbError::TransactionTimeout`], the second is treated as
    /// corruption and forwarded to recovery.
    pub fn execute<T, F>(&self, conn: &Connection, options: &TransactionOptions, mut work: F) -> TransactionOutcome<T>
    where
        F: FnMut(&Connection) -> DbResult<T>,
    {
        let outcome = retry_with(
            &options.retry_policy(),
            |attempt| {
                let result = attempt_once(conn, options, &mut work);
                if let Err(e) = &result {
                    tracing::warn!(attempt, max_attempts = options.retry_attempts, error = %e, "transaction attempt failed");
                }
                result
            },
            |err, _| is_retryable(err),
        );

        let attempts = outcome.attempts;
        let error = match outcome.result {
            Ok(value) => return TransactionOutcome::succeeded(value, attempts),
            Err(e) => e,
        };

        let recovery = match (&self.recovery, options.enable_recovery) {
            (Some(recovery), true) => recovery,
            _ => return TransactionOutcome::failed(error, attempts),
        };

        if matches!(error, DbError::Corruption(_)) {
            let recovery_result = match recovery.handle_rollback_failure(conn, &error) {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::warn!(error = %e, "recovery unavailable for failed rollback");
                    None
                }
            };
            let mut outcome = TransactionOutcome::failed(error, attempts);
            outcome.recovery_attempted = true;
            outcome.recovery_result = recovery_result;
            return outcome;
        }

        let handled = recovery.handle_transaction_failure(conn, &error, |conn| attempt_once(conn, options, &mut work));
        match handled {
            Ok(recovered) => {
                let retried = recovered.result.action == RecoveryAction::Retry;
                let attempts = attempts + u32::from(retried);
                let mut outcome = match recovered.value {
                    Some(value) => {
                        tracing::info!(attempts, "transaction succeeded after recovery");
                        TransactionOutcome::succeeded(value, attempts)
                    }
                    None => TransactionOutcome::failed(error, attempts),
                };
                outcome.recovery_attempted = true;
                outcome.recovery_result = Some(recovered.result);
                outcome
            }
            Err(e) => {
                tracing::warn!(error = %e, "transaction recovery skipped");
                let mut outcome = TransactionOutcome::failed(error, attempts);
                outcome.recovery_attempted = true;
                outcome
            }
        }
    }

    /// Run `operations` in order inside one transaction; all commit or none do
    pub fn execute_batch(
        &self,
        conn: &Connection,
        options: &TransactionOptions,
        mut operations: Vec<BatchOperation<'_>>,
    ) -> TransactionOutcome<usize> {
        self.execute(conn, options, |tx| {
            for (index, operation) in operations.iter_mut().enumerate() {
                operation(tx).map_err(|e| DbError::Transaction(format!("batch operation {} failed: {}", index, e)))?;
            }
            Ok(operations.len())
        })
    }

    /// Run `steps` inside one transaction, each under its own savepoint.
    ///
    /// A failing step with [`OnError::Continue`] is rolled back to its
    /// savepoint and the remaining steps still run. A failing step with
    /// [`OnError::Rollback`] aborts the whole transaction.
    pub fn execute_nested(&self, conn: &Connection, steps: Vec<NestedStep<'_>>) -> DbResult<NestedOutcome> {
        let names = steps
            .iter()
            .map(|step| SqlIdentifier::new(step.savepoint.as_str()))
            .collect::<DbResult<Vec<_>>>()?;

        prepare_connection(conn, self.defaults.auto_rollback)?;
        let watchdog = Watchdog::arm(conn, self.defaults.timeout);
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

        let mut results = Vec::with_capacity(steps.len());
        let mut aborted = false;
        for (step, name) in steps.into_iter().zip(names) {
            let savepoint = step.savepoint;
            create_savepoint_sql(&tx, &name)?;
            match (step.operation)(&tx) {
                Ok(()) => {
                    release_savepoint_sql(&tx, &name)?;
                    results.push(StepResult {
                        savepoint,
                        success: true,
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(savepoint = %savepoint, on_error = ?step.on_error, error = %e, "nested step failed");
                    rollback_to_savepoint_sql(&tx, &name)?;
                    release_savepoint_sql(&tx, &name)?;
                    results.push(StepResult {
                        savepoint,
                        success: false,
                        error: Some(e.to_string()),
                    });
                    if step.on_error == OnError::Rollback {
                        aborted = true;
                        break;
                    }
                }
            }
        }

        let timed_out = watchdog.disarm();
        if aborted || timed_out {
            tx.rollback().map_err(|e| DbError::Corruption(format!("rollback failed: {}", e)))?;
            if timed_out {
                return Err(DbError::TransactionTimeout(self.defaults.timeout));
            }
            return Ok(NestedOutcome {
                committed: false,
                steps: results,
            });
        }

        tx.commit()?;
        Ok(NestedOutcome {
            committed: true,
            steps: results,
        })
    }

    /// Emergency abort of whatever transaction is open on `conn`
    pub fn force_rollback_all(&self, conn: &Connection) -> DbResult<bool> {
        let rolled_back = rollback_open_transaction(conn)?;
        if rolled_back {
            tracing::warn!("forced rollback of open transaction");
        }
        Ok(rolled_back)
    }
}

/// `SAVEPOINT <name>`
pub fn create_savepoint(conn: &Connection, name: &str) -> DbResult<()> {
    create_savepoint_sql(conn, &SqlIdentifier::new(name)?)
}

/// `ROLLBACK TO SAVEPOINT <name>`; the savepoint stays open
pub fn rollback_to_savepoint(conn: &Connection, name: &str) -> DbResult<()> {
    rollback_to_savepoint_sql(conn, &SqlIdentifier::new(name)?)
}

/// `RELEASE SAVEPOINT <name>`
pub fn release_savepoint(conn: &Connection, name: &str) -> DbResult<()> {
    release_savepoint_sql(conn, &SqlIdentifier::new(name)?)
}

fn create_savepoint_sql(conn: &Connection, name: &SqlIdentifier) -> DbResult<()> {
    conn.execute_batch(&format!("SAVEPOINT {}", name.quoted()))?;
    Ok(())
}

fn rollback_to_savepoint_sql(conn: &Connection, name: &SqlIdentifier) -> DbResult<()> {
    conn.execute_batch(&format!("ROLLBACK TO SAVEPOINT {}", name.quoted()))?;
    Ok(())
}

fn release_savepoint_sql(conn: &Connection, name: &SqlIdentifier) -> DbResult<()> {
    conn.execute_batch(&format!("RELEASE SAVEPOINT {}", name.quoted()))?;
    Ok(())
}

fn is_retryable(err: &DbError) -> bool {
    !matches!(err, DbError::TransactionTimeout(_) | DbError::Corruption(_))
}

fn prepare_connection(conn: &Connection, auto_rollback: bool) -> DbResult<()> {
    if conn.is_autocommit() {
        return Ok(());
    }
    if !auto_rollback {
        return Err(DbError::Transaction(
            "a transaction is already open on this connection".to_string(),
        ));
    }
    tracing::warn!("rolling back transaction left open on connection");
    rollback_open_transaction(conn)?;
    Ok(())
}

fn attempt_once<T, F>(conn: &Connection, options: &TransactionOptions, work: &mut F) -> DbResult<T>
where
    F: FnMut(&Connection) -> DbResult<T>,
{
    prepare_connection(conn, options.auto_rollback)?;

    let watchdog = Watchdog::arm(conn, options.timeout);
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let result = work(&tx);
    let timed_out = watchdog.disarm();

    match result {
        Ok(value) if !timed_out => {
            tx.commit().map_err(|e| DbError::Transaction(format!("commit failed: {}", e)))?;
            Ok(value)
        }
        result => {
            tx.rollback()
                .map_err(|e| DbError::Corruption(format!("rollback failed: {}", e)))?;
            if timed_out {
                return Err(DbError::TransactionTimeout(options.timeout));
            }
            result
        }
    }
}
