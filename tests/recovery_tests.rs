//! Recovery Scenarios
//!
//! Startup against damaged files, tiered recovery escalation and health
//! event delivery, exercised through `DatabaseManager`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use resilite::rusqlite::Connection;
use resilite::{
    DatabaseConfig, DatabaseManager, DbError, DbResult, HealthEvent, Migration, MonitorConfig,
    RecoveryAction, SnapshotSource,
};
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

fn schema() -> Vec<Migration> {
    vec![Migration::sql(
        1,
        "create notes",
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)",
        "DROP TABLE notes",
    )]
}

fn notes(db: &DatabaseManager) -> i64 {
    db.with_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?))
        .expect("count notes")
}

fn seeded(config: DatabaseConfig, rows: usize) -> DatabaseManager {
    let db = DatabaseManager::builder(config)
        .migrations(schema())
        .initialize()
        .expect("initialize");
    for i in 0..rows {
        db.run_transaction(|tx| {
            tx.execute("INSERT INTO notes (body) VALUES (?1)", [format!("note {}", i)])?;
            Ok(())
        })
        .into_result()
        .expect("insert");
    }
    db
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Overwrite the database with bytes SQLite will not recognize
fn clobber(path: &Path) {
    std::fs::write(path, vec![0xA5u8; 32 * 1024]).expect("clobber");
    let _ = std::fs::remove_file(sidecar(path, "-wal"));
    let _ = std::fs::remove_file(sidecar(path, "-shm"));
}

struct FixtureSnapshot;

impl SnapshotSource for FixtureSnapshot {
    fn name(&self) -> &str {
        "fixtures"
    }

    fn rebuild(&self, conn: &Connection) -> DbResult<()> {
        conn.execute_batch(
            "INSERT INTO notes (body) VALUES ('rebuilt one'), ('rebuilt two'), ('rebuilt three')",
        )?;
        Ok(())
    }
}

/// A damaged file is replaced by the latest backup during startup
#[test]
fn test_startup_restores_from_backup() {
    let dir = tempdir().expect("tempdir");
    let db = seeded(config(dir.path()), 4);
    let backup = db.backup().expect("backup");
    assert!(backup.is_file());
    let path = db.path().to_path_buf();
    db.shutdown().expect("shutdown");
    drop(db);

    clobber(&path);

    let db = DatabaseManager::builder(config(dir.path()))
        .migrations(schema())
        .initialize()
        .expect("startup recovers");
    let report = db.startup_report().recovery.clone().expect("recovery ran");
    assert!(report.success);
    assert_eq!(report.final_action, Some(RecoveryAction::Restore));
    assert!(report.requires_reinitialization());
    assert_eq!(notes(&db), 4);
    assert_eq!(db.current_schema_version().expect("version"), 1);
}

/// With no backup and no snapshot source, reset is the last resort
#[test]
fn test_startup_resets_when_nothing_else_works() {
    let dir = tempdir().expect("tempdir");
    let db = seeded(config(dir.path()), 2);
    let path = db.path().to_path_buf();
    db.shutdown().expect("shutdown");
    drop(db);

    clobber(&path);

    let db = DatabaseManager::builder(config(dir.path()))
        .migrations(schema())
        .initialize()
        .expect("startup resets");
    let report = db.startup_report().recovery.clone().expect("recovery ran");
    assert_eq!(report.final_action, Some(RecoveryAction::Reset));
    assert_eq!(notes(&db), 0);

    // the damaged bytes are kept aside before the file is removed
    let backups = db.list_backups().expect("list");
    assert!(backups.iter().any(|b| b.manifest.reason == "pre-reset"));
}

/// A snapshot source rebuilds the data set when no backup exists
#[test]
fn test_startup_recreates_from_snapshot_source() {
    let dir = tempdir().expect("tempdir");
    let db = seeded(config(dir.path()), 1);
    let path = db.path().to_path_buf();
    db.shutdown().expect("shutdown");
    drop(db);

    clobber(&path);

    let db = DatabaseManager::builder(config(dir.path()))
        .migrations(schema())
        .snapshot_source(std::sync::Arc::new(FixtureSnapshot))
        .initialize()
        .expect("startup recreates");
    let report = db.startup_report().recovery.clone().expect("recovery ran");
    assert_eq!(report.final_action, Some(RecoveryAction::Recreate));
    assert_eq!(notes(&db), 3);
}

/// Every tier fails: startup refuses with an actionable message
#[test]
fn test_startup_exhausts_recovery_without_reset() {
    let dir = tempdir().expect("tempdir");
    let db = seeded(config(dir.path()), 1);
    let path = db.path().to_path_buf();
    db.shutdown().expect("shutdown");
    drop(db);

    clobber(&path);

    let mut strict = config(dir.path());
    strict.recovery.allow_reset = false;
    let err = DatabaseManager::builder(strict)
        .migrations(schema())
        .initialize()
        .expect_err("no tier can succeed");

    assert!(matches!(err, DbError::RecoveryExhausted { .. }));
    assert!(err.user_message().contains("check the backups"));
    // nothing was deleted
    assert!(path.is_file());
}

/// Reconnect: two refusals then success, reported as three attempts
#[test]
fn test_reconnect_after_transient_failures() {
    let dir = tempdir().expect("tempdir");
    let db = seeded(config(dir.path()), 1);
    let calls = AtomicUsize::new(0);

    let result = db
        .recovery()
        .reconnect_with(|| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DbError::Connection("connection refused".into()))
            } else {
                Ok(())
            }
        })
        .expect("reconnect runs");

    assert!(result.success);
    assert_eq!(result.action, RecoveryAction::Reconnect);
    assert_eq!(result.attempts, 3);
    assert_eq!(notes(&db), 1);
}

/// Manual recovery on a healthy database stops at the first tier
#[test]
fn test_manual_recovery_on_healthy_database() {
    let dir = tempdir().expect("tempdir");
    let db = seeded(config(dir.path()), 2);

    let report = db.recover().expect("recover");
    assert!(report.success);
    assert_eq!(report.final_action, Some(RecoveryAction::Reconnect));
    assert_eq!(notes(&db), 2);
}

/// Subscribers see monitoring start, periodic checks and the stop
#[test]
fn test_health_events_are_delivered() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(dir.path());
    config.monitor.interval_ms = 20;
    let db = seeded(config, 1);
    let mut events = db.subscribe();

    db.start_monitoring().expect("start");
    assert!(db.is_monitoring());
    let first = tokio_test::block_on(events.recv()).expect("first event");
    assert_eq!(first.name(), "monitoring-started");
    let second = tokio_test::block_on(events.recv()).expect("second event");
    assert!(matches!(second, HealthEvent::HealthOk(_)), "got {:?}", second);

    db.stop_monitoring().expect("stop");
    assert!(!db.is_monitoring());

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(names.last(), Some(&"monitoring-stopped"));

    std::thread::sleep(Duration::from_millis(60));
    assert!(events.try_recv().is_err());
    assert!(db.health_trends().sample_count >= 1);
}
