//! Periodic health monitoring with automatic recovery
//!
//! The monitor is idle until [`DatabaseHealthMonitor::start`] spawns its
//! background thread. Each tick runs one [`health_check`], records the
//! sample, publishes a [`HealthEvent`], and when the database is unhealthy
//! and auto-recovery is enabled, hands every critical issue to the matching
//! [`ErrorRecoveryManager`] action.
//!
//! [`health_check`]: DatabaseHealthMonitor::health_check

use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;

use resilite_core::config::MonitorConfig;
use resilite_core::error::{DbError, DbResult};
use resilite_core::health::{
    ConnectionStatus, HealthCheckResult, HealthIssue, HealthMetrics, HealthTrends, IssueSeverity,
    IssueType,
};

use crate::connection::{database_size, probe};
use crate::events::{EventBus, HealthEvent};
use crate::pool::ConnectionPool;
use crate::recovery::{ErrorRecoveryManager, RecoveryResult};

struct MonitorState {
    pool: Arc<ConnectionPool>,
    recovery: Arc<ErrorRecoveryManager>,
    config: MonitorConfig,
    events: EventBus,
    history: Mutex<VecDeque<HealthMetrics>>,
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Background health checker for one database
pub struct DatabaseHealthMonitor {
    state: Arc<MonitorState>,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for DatabaseHealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHealthMonitor")
            .field("config", &self.state.config)
            .field("monitoring", &self.is_monitoring())
            .finish_non_exhaustive()
    }
}

impl DatabaseHealthMonitor {
    pub fn new(
        pool: Arc<ConnectionPool>,
        recovery: Arc<ErrorRecoveryManager>,
        config: MonitorConfig,
        events: EventBus,
    ) -> Self {
        Self {
            state: Arc::new(MonitorState {
                pool,
                recovery,
                history: Mutex::new(VecDeque::with_capacity(config.history_size)),
                config,
                events,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.state.config
    }

    /// Spawn the background tick loop. Starting a running monitor is a no-op.
    pub fn start(&self) -> DbResult<()> {
        let mut worker = self.lock_worker()?;
        if worker.is_some() {
            return Ok(());
        }

        let (stop, rx) = mpsc::channel::<()>();
        let state = Arc::clone(&self.state);
        let interval = state.config.interval();
        let handle = thread::Builder::new()
            .name("resilite-health-monitor".to_string())
            .spawn(move || {
                state.events.publish(HealthEvent::MonitoringStarted {
                    interval_ms: state.config.interval_ms,
                });
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            state.tick();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        *worker = Some(Worker { stop, handle });
        tracing::info!(interval_ms = self.state.config.interval_ms, "health monitoring started");
        Ok(())
    }

    /// Stop the tick loop and wait for an in-flight tick to finish
    pub fn stop(&self) -> DbResult<()> {
        let worker = self.lock_worker()?.take();
        let Some(Worker { stop, handle }) = worker else {
            return Ok(());
        };

        drop(stop);
        if handle.join().is_err() {
            tracing::error!("health monitor thread panicked");
        }
        tracing::info!("health monitoring stopped");
        self.state.events.publish(HealthEvent::MonitoringStopped);
        Ok(())
    }

    pub fn is_monitoring(&self) -> bool {
        self.worker
            .lock()
            .map(|worker| worker.is_some())
            .unwrap_or(false)
    }

    /// Run one check now and record its sample
    pub fn health_check(&self) -> HealthCheckResult {
        self.state.health_check()
    }

    /// Run one full tick now: check, publish, and auto-recover when needed
    pub fn check_and_recover(&self) -> HealthCheckResult {
        self.state.tick()
    }

    /// Trends over every retained sample
    pub fn get_health_trends(&self) -> HealthTrends {
        HealthTrends::from_samples(&self.history())
    }

    /// Trends over the most recent `samples` samples
    pub fn recent_trends(&self, samples: usize) -> HealthTrends {
        let history = self.history();
        let skip = history.len().saturating_sub(samples);
        HealthTrends::from_samples(&history[skip..])
    }

    /// Retained samples, oldest first
    pub fn history(&self) -> Vec<HealthMetrics> {
        self.state
            .history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lock_worker(&self) -> DbResult<std::sync::MutexGuard<'_, Option<Worker>>> {
        self.worker
            .lock()
            .map_err(|e| DbError::Connection(format!("monitor lock poisoned: {}", e)))
    }
}

impl Drop for DatabaseHealthMonitor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "failed to stop health monitor");
        }
    }
}

impl MonitorState {
    fn tick(&self) -> HealthCheckResult {
        let result = self.health_check();
        if result.healthy {
            self.events.publish(HealthEvent::HealthOk(Box::new(result.clone())));
            return result;
        }

        tracing::warn!(
            issues = result.issues.len(),
            worst = ?result.worst_severity(),
            "database health degraded"
        );
        if result.metrics.connection_status == ConnectionStatus::Failed {
            let error = result
                .issues
                .first()
                .map(|issue| issue.message.clone())
                .unwrap_or_default();
            self.events.publish(HealthEvent::HealthCheckFailed { error });
        } else {
            self.events.publish(HealthEvent::HealthDegraded(Box::new(result.clone())));
        }

        if self.config.auto_recovery {
            let mut handled = Vec::new();
            for issue in result.critical_issues() {
                if handled.contains(&issue.issue_type) {
                    continue;
                }
                handled.push(issue.issue_type);
                self.auto_recover(issue.issue_type);
            }
        }
        result
    }

    fn auto_recover(&self, issue: IssueType) {
        let outcome = match issue {
            IssueType::Connection => self.recovery.reconnect(),
            IssueType::Corruption => self.with_connection(|conn| self.recovery.repair_corruption(conn)),
            IssueType::Consistency => self.with_connection(|conn| self.recovery.correct_consistency(conn)),
            IssueType::Performance => return,
        };

        let event = match outcome {
            Ok(result) if result.success => {
                tracing::info!(issue = %issue, action = %result.action, "auto-recovery succeeded");
                HealthEvent::AutoRecoverySuccess { issue, result }
            }
            Ok(result) => {
                tracing::error!(issue = %issue, action = %result.action, error = ?result.error, "auto-recovery failed");
                HealthEvent::AutoRecoveryFailed { issue, result }
            }
            Err(e) => {
                tracing::error!(issue = %issue, error = %e, "auto-recovery could not run");
                HealthEvent::AutoRecoveryError {
                    issue,
                    error: e.to_string(),
                }
            }
        };
        self.events.publish(event);
    }

    fn with_connection<F>(&self, f: F) -> DbResult<RecoveryResult>
    where
        F: FnOnce(&Connection) -> DbResult<RecoveryResult>,
    {
        let conn = self.pool.acquire()?;
        f(&conn)
    }

    fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let mut issues = Vec::new();

        let metrics = match self.pool.acquire() {
            Err(e) => {
                issues.push(unreachable_issue(&e));
                HealthMetrics::failed(elapsed_ms(started))
            }
            Ok(conn) => match probe(&conn) {
                Err(e) => {
                    issues.push(unreachable_issue(&e));
                    HealthMetrics::failed(elapsed_ms(started))
                }
                Ok(()) => self.inspect(&conn, started, &mut issues),
            },
        };

        let error_rate = self.record(metrics.clone());
        if error_rate > self.config.error_rate_threshold {
            issues.push(
                HealthIssue::new(
                    IssueSeverity::High,
                    IssueType::Connection,
                    format!(
                        "error rate {:.0}% over the last {} checks exceeds {:.0}%",
                        error_rate * 100.0,
                        self.config.error_window,
                        self.config.error_rate_threshold * 100.0
                    ),
                )
                .with_details(json!({ "error_rate": error_rate })),
            );
        }

        let healthy = !issues
            .iter()
            .any(|issue| issue.severity >= IssueSeverity::High);
        let recommendations = recommendations(&issues);
        if !healthy {
            tracing::debug!(issues = issues.len(), "health check found problems");
        }
        HealthCheckResult {
            healthy,
            metrics,
            issues,
            recommendations,
        }
    }

    /// Latency, size, corruption and consistency checks on a live connection
    fn inspect(&self, conn: &Connection, started: Instant, issues: &mut Vec<HealthIssue>) -> HealthMetrics {
        // representative read: schema plus page accounting
        let size = database_size(conn);
        let response_time_ms = elapsed_ms(started);

        let database_size_bytes = match size {
            Ok(bytes) => bytes,
            Err(e) => {
                issues.push(HealthIssue::new(
                    IssueSeverity::Medium,
                    IssueType::Performance,
                    format!("could not read database size: {}", e),
                ));
                0
            }
        };

        if response_time_ms > self.config.latency_critical_ms as f64 {
            issues.push(latency_issue(IssueSeverity::High, response_time_ms, self.config.latency_critical_ms));
        } else if response_time_ms > self.config.latency_warning_ms as f64 {
            issues.push(latency_issue(IssueSeverity::Medium, response_time_ms, self.config.latency_warning_ms));
        }

        let mut corruption_detected = false;
        match self.recovery.check_corruption(conn) {
            Ok(report) if report.is_corrupted => {
                corruption_detected = true;
                issues.push(
                    HealthIssue::new(IssueSeverity::Critical, IssueType::Corruption, "integrity checks failed")
                        .with_details(json!({ "errors": report.errors })),
                );
            }
            Ok(_) => {}
            Err(e) if e.is_corruption() => {
                corruption_detected = true;
                issues.push(HealthIssue::new(
                    IssueSeverity::Critical,
                    IssueType::Corruption,
                    format!("integrity checks could not run: {}", e),
                ));
            }
            Err(e) => issues.push(HealthIssue::new(
                IssueSeverity::Medium,
                IssueType::Corruption,
                format!("integrity checks could not run: {}", e),
            )),
        }

        if self.config.check_consistency && !self.recovery.rules().is_empty() {
            let report = self.recovery.verify_consistency(conn);
            if report.found > 0 {
                issues.push(
                    HealthIssue::new(IssueSeverity::Critical, IssueType::Consistency, report.summary())
                        .with_details(json!({ "found": report.found, "findings": report.findings })),
                );
            }
            if !report.errors.is_empty() {
                issues.push(
                    HealthIssue::new(
                        IssueSeverity::Medium,
                        IssueType::Consistency,
                        "some consistency rules could not be checked",
                    )
                    .with_details(json!({ "errors": report.errors })),
                );
            }
        }

        let error_count = issues
            .iter()
            .filter(|issue| issue.severity >= IssueSeverity::High)
            .count() as u32;
        let warning_count = issues.len() as u32 - error_count;
        HealthMetrics {
            timestamp: Utc::now(),
            connection_status: if issues.is_empty() {
                ConnectionStatus::Healthy
            } else {
                ConnectionStatus::Degraded
            },
            response_time_ms,
            error_count,
            warning_count,
            database_size_bytes,
            corruption_detected,
        }
    }

    /// Store a sample and return the error rate over the configured window
    fn record(&self, sample: HealthMetrics) -> f64 {
        let Ok(mut history) = self.history.lock() else {
            return 0.0;
        };
        history.push_back(sample);
        while history.len() > self.config.history_size {
            history.pop_front();
        }

        let window = self.config.error_window.min(history.len());
        if window == 0 {
            return 0.0;
        }
        let errors = history
            .iter()
            .rev()
            .take(window)
            .filter(|s| s.is_error())
            .count();
        errors as f64 / window as f64
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1_000.0
}

fn unreachable_issue(error: &DbError) -> HealthIssue {
    HealthIssue::new(
        IssueSeverity::Critical,
        IssueType::Connection,
        format!("database unreachable: {}", error),
    )
}

fn latency_issue(severity: IssueSeverity, actual_ms: f64, limit_ms: u64) -> HealthIssue {
    HealthIssue::new(
        severity,
        IssueType::Performance,
        format!("response time {:.1}ms exceeds {}ms", actual_ms, limit_ms),
    )
    .with_details(json!({ "response_time_ms": actual_ms, "limit_ms": limit_ms }))
}

fn recommendations(issues: &[HealthIssue]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for issue in issues {
        let text = match issue.issue_type {
            IssueType::Connection => "Check that the database file is reachable and not locked by another process",
            IssueType::Corruption => "Run an integrity check and restore from the latest backup if repair fails",
            IssueType::Consistency => "Run consistency correction or review the reported rows",
            IssueType::Performance => "Review slow queries, pool size and cache settings",
        };
        if !out.iter().any(|r| r == text) {
            out.push(text.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupManager;
    use crate::recovery::consistency::{ConsistencyRules, UniqueRule};
    use resilite_core::config::{PoolConfig, PragmaConfig, RecoveryConfig};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn monitor(dir: &Path, config: MonitorConfig, rules: ConsistencyRules) -> DatabaseHealthMonitor {
        let path = dir.join("health.db");
        let pool = Arc::new(
            ConnectionPool::new(&path, PoolConfig::new(1, 3, 200), PragmaConfig::default()).unwrap(),
        );
        pool.initialize().unwrap();
        pool.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT);
                 INSERT INTO tags (name) VALUES ('a'), ('b');",
            )?;
            Ok(())
        })
        .unwrap();
        let backups = Arc::new(BackupManager::new(dir.join("backups"), &path, 3));
        let recovery = Arc::new(
            ErrorRecoveryManager::new(
                Arc::clone(&pool),
                backups,
                RecoveryConfig {
                    max_retries: 1,
                    retry_delay_ms: 1,
                    ..RecoveryConfig::default()
                },
            )
            .with_rules(rules),
        );
        DatabaseHealthMonitor::new(pool, recovery, config, EventBus::default())
    }

    fn quick() -> MonitorConfig {
        MonitorConfig {
            interval_ms: 20,
            latency_warning_ms: 5_000,
            latency_critical_ms: 10_000,
            history_size: 5,
            ..MonitorConfig::default()
        }
    }

    #[test]
    fn healthy_database_reports_no_issues() {
        let dir = tempdir().unwrap();
        let monitor = monitor(dir.path(), quick(), ConsistencyRules::default());

        let result = monitor.health_check();
        assert!(result.healthy, "{:?}", result.issues);
        assert!(result.issues.is_empty());
        assert_eq!(result.metrics.connection_status, ConnectionStatus::Healthy);
        assert!(result.metrics.database_size_bytes > 0);
        assert_eq!(monitor.history().len(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let dir = tempdir().unwrap();
        let monitor = monitor(dir.path(), quick(), ConsistencyRules::default());
        for _ in 0..8 {
            monitor.health_check();
        }
        assert_eq!(monitor.history().len(), 5);
        let trends = monitor.get_health_trends();
        assert_eq!(trends.sample_count, 5);
        assert_eq!(trends.percent_healthy, 100.0);
        assert_eq!(monitor.recent_trends(2).sample_count, 2);
    }

    #[test]
    fn closed_pool_is_a_critical_connection_issue() {
        let dir = tempdir().unwrap();
        let monitor = monitor(
            dir.path(),
            MonitorConfig {
                auto_recovery: false,
                ..quick()
            },
            ConsistencyRules::default(),
        );
        monitor.state.pool.close_all().unwrap();

        let result = monitor.health_check();
        assert!(!result.healthy);
        assert_eq!(result.metrics.connection_status, ConnectionStatus::Failed);
        assert!(result.critical_issues().any(|i| i.issue_type == IssueType::Connection));
        assert!(!result.recommendations.is_empty());
    }

    #[test]
    fn auto_recovery_reconnects_closed_pool() {
        let dir = tempdir().unwrap();
        let monitor = monitor(dir.path(), quick(), ConsistencyRules::default());
        let mut events = monitor.state.events.subscribe();
        monitor.state.pool.close_all().unwrap();

        let result = monitor.check_and_recover();
        assert!(!result.healthy);
        assert!(!monitor.state.pool.is_closed());

        let names: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(names, vec!["health-check-failed", "auto-recovery-success"]);
        assert_eq!(monitor.health_check().critical_issues().count(), 0);
    }

    #[test]
    fn auto_recovery_corrects_consistency() {
        let dir = tempdir().unwrap();
        let rules = ConsistencyRules::new().unique(UniqueRule::new("tags", "name").unwrap());
        let monitor = monitor(dir.path(), quick(), rules);
        monitor
            .state
            .pool
            .with_connection(|conn| {
                conn.execute("INSERT INTO tags (name) VALUES ('a')", [])?;
                Ok(())
            })
            .unwrap();

        let result = monitor.check_and_recover();
        assert!(result.critical_issues().any(|i| i.issue_type == IssueType::Consistency));
        let after = monitor.health_check();
        assert!(after.issues.iter().all(|i| i.issue_type != IssueType::Consistency));
    }

    #[test]
    fn error_rate_above_threshold_is_reported() {
        let dir = tempdir().unwrap();
        let monitor = monitor(
            dir.path(),
            MonitorConfig {
                auto_recovery: false,
                error_rate_threshold: 0.5,
                error_window: 2,
                ..quick()
            },
            ConsistencyRules::default(),
        );
        monitor.state.pool.close_all().unwrap();
        monitor.health_check();
        let result = monitor.health_check();
        assert!(result
            .issues
            .iter()
            .any(|i| i.severity == IssueSeverity::High && i.message.contains("error rate")));
    }

    #[test]
    fn start_and_stop_publish_events() {
        let dir = tempdir().unwrap();
        let monitor = monitor(dir.path(), quick(), ConsistencyRules::default());
        let mut events = monitor.state.events.subscribe();

        monitor.start().unwrap();
        monitor.start().unwrap();
        assert!(monitor.is_monitoring());
        std::thread::sleep(Duration::from_millis(120));
        monitor.stop().unwrap();
        assert!(!monitor.is_monitoring());
        monitor.stop().unwrap();

        let names: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(names.first(), Some(&"monitoring-started"));
        assert_eq!(names.last(), Some(&"monitoring-stopped"));
        assert!(names.contains(&"health-ok"));
        assert!(!monitor.history().is_empty());
    }
}
