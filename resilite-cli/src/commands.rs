//! Subcommand implementations

use std::path::{Path, PathBuf};
use std::time::Duration;

use resilite_core::config::DatabaseConfig;
use resilite_core::error::DbError;
use resilite_sqlite::{BackupManager, DatabaseManager, RecoveryReport};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Database(#[from] DbError),

    #[error("failed to encode output: {0}")]
    Output(#[from] serde_json::Error),

    /// The command ran but found problems the operator has to look at
    #[error("{0}")]
    Unhealthy(String),
}

impl CliError {
    pub fn user_message(&self) -> String {
        match self {
            CliError::Database(e) => e.user_message(),
            other => other.to_string(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Unhealthy(_) => 2,
            _ => 1,
        }
    }
}

/// Text or JSON result printing
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<(), CliError> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}

/// Defaults, then the TOML file, then `RESILITE_*` variables, then flags
pub fn load_config(
    path: Option<&Path>,
    dir: Option<PathBuf>,
    file: Option<String>,
) -> Result<DatabaseConfig, CliError> {
    let config = match path {
        Some(path) => DatabaseConfig::from_toml_file(path)?,
        None => DatabaseConfig::default(),
    };
    let mut config = config.apply_env_overrides()?;
    if let Some(dir) = dir {
        config.directory = dir;
    }
    if let Some(file) = file {
        config.file_name = file;
    }
    // one-shot commands never keep a background thread around
    config.monitor.enabled = false;
    config.validate()?;
    Ok(config)
}

/// What a command is allowed to do to the database file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Report problems, never restore, recreate or delete
    Inspect,
    /// Startup recovery may run, but never the reset tier
    Restore,
    /// The configured recovery tiers may run
    Repair,
}

pub fn open(mut config: DatabaseConfig, access: Access) -> Result<DatabaseManager, CliError> {
    if access != Access::Repair {
        config.recovery.allow_reset = false;
    }
    if access == Access::Inspect {
        config.monitor.auto_recovery = false;
    }
    let db = DatabaseManager::builder(config)
        .unmanaged_schema()
        .startup_recovery(access != Access::Inspect)
        .initialize()?;
    if let Some(report) = &db.startup_report().recovery {
        tracing::warn!(action = ?report.final_action, "database needed recovery while opening");
    }
    Ok(db)
}

#[derive(Serialize)]
struct StatusView {
    path: PathBuf,
    schema_version: u32,
    applied: usize,
    pool: resilite_sqlite::PoolStats,
    backups: usize,
    startup_ms: u64,
    recovered: Option<RecoveryReport>,
}

pub fn status(db: &DatabaseManager, out: &Output) -> Result<(), CliError> {
    let applied = db.applied_migrations()?;
    let view = StatusView {
        path: db.path().to_path_buf(),
        schema_version: db.current_schema_version()?,
        applied: applied.len(),
        pool: db.pool_stats()?,
        backups: db.list_backups()?.len(),
        startup_ms: db.startup_report().elapsed_ms,
        recovered: db.startup_report().recovery.clone(),
    };
    out.emit(&view, || {
        let mut lines = vec![
            format!("database:       {}", view.path.display()),
            format!("schema version: {} ({} migrations recorded)", view.schema_version, view.applied),
            format!(
                "pool:           {} open, {} idle, {} in use (max {})",
                view.pool.total, view.pool.available, view.pool.in_use, view.pool.max
            ),
            format!("backups:        {}", view.backups),
            format!(
                "opened in:      {}",
                humantime::format_duration(Duration::from_millis(view.startup_ms))
            ),
        ];
        if let Some(report) = &view.recovered {
            lines.push(format!("recovered by:   {:?}", report.final_action));
        }
        lines.join("\n")
    })
}

pub fn health(db: &DatabaseManager, out: &Output) -> Result<(), CliError> {
    let result = db.health_check();
    out.emit(&result, || {
        let mut lines = vec![format!(
            "{} ({}, {:.1} ms, {} bytes)",
            if result.healthy { "healthy" } else { "unhealthy" },
            result.metrics.connection_status,
            result.metrics.response_time_ms,
            result.metrics.database_size_bytes
        )];
        for issue in &result.issues {
            lines.push(format!("  [{:?}] {}: {}", issue.severity, issue.issue_type, issue.message));
        }
        for recommendation in &result.recommendations {
            lines.push(format!("  -> {}", recommendation));
        }
        lines.join("\n")
    })?;

    if result.healthy {
        Ok(())
    } else {
        Err(CliError::Unhealthy(format!("{} health issue(s) found", result.issues.len())))
    }
}

#[derive(Serialize)]
struct CheckView {
    integrity: resilite_sqlite::IntegrityReport,
    consistency: resilite_sqlite::ConsistencyReport,
    recovery: Option<RecoveryReport>,
}

pub fn check(db: &DatabaseManager, out: &Output, repair: bool) -> Result<(), CliError> {
    let mut recovery = None;
    let mut integrity = db.integrity_report()?;
    if repair && !integrity.is_ok() {
        tracing::warn!("integrity problems found, running recovery");
        recovery = Some(db.recover()?);
        integrity = db.integrity_report()?;
    }
    let consistency = db.verify_consistency(repair)?;
    let view = CheckView {
        integrity,
        consistency,
        recovery,
    };

    out.emit(&view, || {
        let mut lines = vec![
            format!(
                "integrity:   {}",
                if view.integrity.is_ok() { "ok" } else { "FAILED" }
            ),
            format!(
                "pages:       {} ({} free)",
                view.integrity.page_count, view.integrity.freelist_count
            ),
        ];
        for message in view
            .integrity
            .integrity_messages
            .iter()
            .chain(&view.integrity.quick_check_messages)
        {
            lines.push(format!("  {}", message));
        }
        if !view.integrity.foreign_key_violations.is_empty() {
            lines.push(format!(
                "  {} foreign key violation(s)",
                view.integrity.foreign_key_violations.len()
            ));
        }
        lines.push(format!("consistency: {}", view.consistency.summary()));
        if let Some(report) = &view.recovery {
            lines.push(format!(
                "recovery:    {} via {:?}",
                if report.success { "succeeded" } else { "failed" },
                report.final_action
            ));
        }
        lines.join("\n")
    })?;

    if view.integrity.is_ok() && view.consistency.is_consistent() {
        Ok(())
    } else {
        Err(CliError::Unhealthy("check found problems".to_string()))
    }
}

#[derive(Serialize)]
struct BackupView {
    path: PathBuf,
}

pub fn backup(db: &DatabaseManager, out: &Output) -> Result<(), CliError> {
    let view = BackupView { path: db.backup()? };
    out.emit(&view, || format!("backup written to {}", view.path.display()))
}

/// Reads manifests only, so it works while the database itself is unusable
pub fn backups(config: &DatabaseConfig, out: &Output) -> Result<(), CliError> {
    let backups = BackupManager::new(
        config.backup_directory(),
        config.database_path(),
        config.backup.max_backups,
    )
    .list()?;
    out.emit(&backups, || {
        if backups.is_empty() {
            return "no backups".to_string();
        }
        backups
            .iter()
            .map(|b| {
                let version = b
                    .manifest
                    .schema_version
                    .map(|v| format!("v{}", v))
                    .unwrap_or_else(|| "v?".to_string());
                format!(
                    "{}  {:<14} {:>4}  {:>10} bytes  {}",
                    b.manifest.created_at.format("%Y-%m-%d %H:%M:%S"),
                    b.manifest.reason,
                    version,
                    b.size_bytes(),
                    b.directory.display()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

#[derive(Serialize)]
struct RestoreView {
    restored_from: PathBuf,
    schema_version: u32,
}

pub fn restore(db: &DatabaseManager, out: &Output, path: &Path) -> Result<(), CliError> {
    let source = if path.is_dir() {
        db.list_backups()?
            .into_iter()
            .find(|b| b.directory == path)
            .map(|b| b.database_path())
            .unwrap_or_else(|| path.to_path_buf())
    } else {
        path.to_path_buf()
    };
    db.restore(&source)?;
    let view = RestoreView {
        restored_from: source,
        schema_version: db.current_schema_version()?,
    };
    out.emit(&view, || {
        format!(
            "restored from {} (schema version {})",
            view.restored_from.display(),
            view.schema_version
        )
    })
}

pub fn trends(db: &DatabaseManager, out: &Output, samples: usize) -> Result<(), CliError> {
    for _ in 0..samples.max(1) {
        db.health_check();
    }
    let trends = db.recent_health_trends(samples.max(1));
    out.emit(&trends, || {
        [
            format!("samples:        {}", trends.sample_count),
            format!("avg response:   {:.2} ms ({:?})", trends.average_response_time_ms, trends.response_time_trend),
            format!("error rate:     {:.1}% ({:?})", trends.error_rate * 100.0, trends.error_rate_trend),
            format!("healthy:        {:.0}%", trends.percent_healthy),
        ]
        .join("\n")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn flags_override_config_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("resilite.toml");
        std::fs::write(
            &file,
            "directory = \"/srv/from-file\"\nfile_name = \"file.db\"\n[monitor]\nenabled = true\n",
        )
        .unwrap();

        let config = load_config(Some(&file), Some(dir.path().to_path_buf()), None).unwrap();
        assert_eq!(config.directory, dir.path());
        assert_eq!(config.file_name, "file.db");
        assert!(!config.monitor.enabled);
    }

    #[test]
    fn commands_run_against_a_fresh_database() {
        let dir = tempdir().unwrap();
        let config = load_config(None, Some(dir.path().to_path_buf()), Some("cli.db".into())).unwrap();
        let db = open(config.clone(), Access::Inspect).unwrap();
        let out = Output::new(true);

        status(&db, &out).unwrap();
        health(&db, &out).unwrap();
        check(&db, &out, false).unwrap();
        backup(&db, &out).unwrap();
        assert_eq!(db.list_backups().unwrap().len(), 1);
        backups(&config, &out).unwrap();
        trends(&db, &out, 3).unwrap();
        assert_eq!(db.health_trends().sample_count, 4);
    }

    #[test]
    fn restore_accepts_a_backup_directory() {
        let dir = tempdir().unwrap();
        let config = load_config(None, Some(dir.path().to_path_buf()), None).unwrap();
        let db = open(config, Access::Restore).unwrap();
        db.with_connection(|conn| {
            conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")?;
            Ok(())
        })
        .unwrap();
        db.backup().unwrap();
        let backup_dir = db.list_backups().unwrap()[0].directory.clone();
        db.with_connection(|conn| {
            conn.execute_batch("DELETE FROM t")?;
            Ok(())
        })
        .unwrap();

        restore(&db, &Output::new(false), &backup_dir).unwrap();
        let rows: i64 = db
            .with_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn unhealthy_results_exit_with_two() {
        let err = CliError::Unhealthy("x".into());
        assert_eq!(err.exit_code(), 2);
        let err = CliError::from(DbError::PoolClosed);
        assert_eq!(err.exit_code(), 1);
        assert!(!err.user_message().is_empty());
    }

    #[test]
    fn inspection_leaves_a_damaged_file_alone() {
        let dir = tempdir().unwrap();
        let config = load_config(None, Some(dir.path().to_path_buf()), None).unwrap();
        let db = open(config.clone(), Access::Repair).unwrap();
        db.backup().unwrap();
        db.shutdown().unwrap();
        drop(db);
        let garbage = vec![0x5Au8; 16 * 1024];
        std::fs::write(config.database_path(), &garbage).unwrap();

        let err = open(config.clone(), Access::Inspect).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert_eq!(std::fs::read(config.database_path()).unwrap(), garbage);

        // backups can still be listed for the operator
        backups(&config, &Output::new(true)).unwrap();
    }
}
