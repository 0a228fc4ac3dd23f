//! Validated configuration for the database layer
//!
//! Configuration is plain serde data so it can be loaded from TOML, built in
//! code, or adjusted from environment variables. Engine pragmas are modelled as
//! enums: only values listed here can ever reach the database.
//!
//! # Example
//!
//! ```rust
//! use resilite_core::config::{DatabaseConfig, JournalMode};
//!
//! let config = DatabaseConfig::from_toml_str(r#"
//!     directory = "/tmp/app-data"
//!     file_name = "app.db"
//!
//!     [pool]
//!     min = 1
//!     max = 4
//!
//!     [pragmas]
//!     journal_mode = "wal"
//! "#).unwrap();
//!
//! assert_eq!(config.pool.max, 4);
//! assert_eq!(config.pragmas.journal_mode, JournalMode::Wal);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DbError, DbResult};

/// Upper bound for the pool size; beyond this SQLite gains nothing
pub const MAX_POOL_SIZE: usize = 100;

/// Top-level configuration for a managed database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Directory holding the database file (created if missing)
    pub directory: PathBuf,
    /// File name of the database inside `directory`
    pub file_name: String,
    /// Schema version this build expects; `None` accepts the latest declared migration
    pub schema_version: Option<u32>,
    pub pool: PoolConfig,
    pub pragmas: PragmaConfig,
    pub transactions: TransactionConfig,
    pub recovery: RecoveryConfig,
    pub monitor: MonitorConfig,
    pub backup: BackupConfig,
    /// Run consistency verification and correction once during startup
    pub consistency_sweep_on_start: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
            file_name: "app.db".to_string(),
            schema_version: None,
            pool: PoolConfig::default(),
            pragmas: PragmaConfig::default(),
            transactions: TransactionConfig::default(),
            recovery: RecoveryConfig::default(),
            monitor: MonitorConfig::default(),
            backup: BackupConfig::default(),
            consistency_sweep_on_start: true,
        }
    }
}

impl DatabaseConfig {
    /// Create a configuration for `directory/file_name` with default tuning
    pub fn new(directory: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            file_name: file_name.into(),
            ..Self::default()
        }
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> DbResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| DbError::config(format!("failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> DbResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Override selected fields from `RESILITE_*` environment variables
    pub fn apply_env_overrides(mut self) -> DbResult<Self> {
        if let Ok(dir) = std::env::var("RESILITE_DB_DIR") {
            self.directory = PathBuf::from(dir);
        }
        if let Ok(file) = std::env::var("RESILITE_DB_FILE") {
            self.file_name = file;
        }
        if let Ok(max) = std::env::var("RESILITE_POOL_MAX") {
            self.pool.max = max
                .parse()
                .map_err(|_| DbError::config(format!("RESILITE_POOL_MAX is not a number: {}", max)))?;
        }
        if let Ok(timeout) = std::env::var("RESILITE_POOL_TIMEOUT_MS") {
            self.pool.timeout_ms = timeout.parse().map_err(|_| {
                DbError::config(format!(
                    "RESILITE_POOL_TIMEOUT_MS is not a number: {}",
                    timeout
                ))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Full path of the database file
    pub fn database_path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }

    /// Directory where backups are written
    pub fn backup_directory(&self) -> PathBuf {
        self.backup
            .directory
            .clone()
            .unwrap_or_else(|| self.directory.join("backups"))
    }

    /// Check every invariant the layer relies on
    pub fn validate(&self) -> DbResult<()> {
        if self.file_name.trim().is_empty() {
            return Err(DbError::config("file_name cannot be empty"));
        }
        if self.file_name.contains('/') || self.file_name.contains('\\') {
            return Err(DbError::config(
                "file_name must not contain path separators; use directory instead",
            ));
        }
        if self.file_name.contains("..") {
            return Err(DbError::config("file_name must not contain '..'"));
        }
        if self.schema_version == Some(0) {
            return Err(DbError::config("schema_version must be at least 1"));
        }
        self.pool.validate()?;
        self.pragmas.validate()?;
        self.transactions.validate()?;
        self.recovery.validate()?;
        self.monitor.validate()?;
        Ok(())
    }
}

/// Connection pool bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections opened eagerly at initialization
    pub min: usize,
    /// Hard ceiling on open connections
    pub max: usize,
    /// How long `acquire` waits for a free connection
    pub timeout_ms: u64,
    /// How often a blocked `acquire` re-checks the pool
    pub poll_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 2,
            max: 10,
            timeout_ms: 30_000,
            poll_interval_ms: 10,
        }
    }
}

impl PoolConfig {
    pub fn new(min: usize, max: usize, timeout_ms: u64) -> Self {
        Self {
            min,
            max,
            timeout_ms,
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.max == 0 || self.max > MAX_POOL_SIZE {
            return Err(DbError::config(format!(
                "pool.max must be between 1 and {} (got {})",
                MAX_POOL_SIZE, self.max
            )));
        }
        if self.min > self.max {
            return Err(DbError::config(format!(
                "pool.min ({}) cannot exceed pool.max ({})",
                self.min, self.max
            )));
        }
        if self.timeout_ms == 0 {
            return Err(DbError::config("pool.timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// SQLite `journal_mode` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    Wal,
    Off,
}

impl JournalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
            JournalMode::Persist => "PERSIST",
            JournalMode::Memory => "MEMORY",
            JournalMode::Wal => "WAL",
            JournalMode::Off => "OFF",
        }
    }
}

/// SQLite `synchronous` levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynchronousMode {
    Off,
    Normal,
    Full,
    Extra,
}

impl SynchronousMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynchronousMode::Off => "OFF",
            SynchronousMode::Normal => "NORMAL",
            SynchronousMode::Full => "FULL",
            SynchronousMode::Extra => "EXTRA",
        }
    }
}

/// SQLite `temp_store` locations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TempStore {
    Default,
    File,
    Memory,
}

impl TempStore {
    pub fn as_str(&self) -> &'static str {
        match self {
            TempStore::Default => "DEFAULT",
            TempStore::File => "FILE",
            TempStore::Memory => "MEMORY",
        }
    }
}

/// Per-connection engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PragmaConfig {
    pub journal_mode: JournalMode,
    pub synchronous: SynchronousMode,
    /// Negative values are KiB, positive values are pages (SQLite semantics)
    pub cache_size: i64,
    pub temp_store: TempStore,
    /// Bytes of the file to memory-map; 0 disables mmap
    pub mmap_size: u64,
    pub busy_timeout_ms: u64,
    pub foreign_keys: bool,
}

impl Default for PragmaConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            synchronous: SynchronousMode::Normal,
            cache_size: -64 * 1024, // 64MB
            temp_store: TempStore::Memory,
            mmap_size: 256 * 1024 * 1024,
            busy_timeout_ms: 5_000,
            foreign_keys: true,
        }
    }
}

impl PragmaConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.mmap_size > i64::MAX as u64 {
            return Err(DbError::config("pragmas.mmap_size is too large"));
        }
        Ok(())
    }
}

/// Defaults for `TransactionManager`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub timeout_ms: u64,
    /// Total attempts, including the first one
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub auto_rollback: bool,
    pub enable_recovery: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retry_attempts: 3,
            retry_base_delay_ms: 100,
            auto_rollback: true,
            enable_recovery: true,
        }
    }
}

impl TransactionConfig {
    pub fn validate(&self) -> DbResult<()> {
        if self.timeout_ms == 0 {
            return Err(DbError::config("transactions.timeout_ms must be positive"));
        }
        if self.retry_attempts == 0 {
            return Err(DbError::config(
                "transactions.retry_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Tuning for `ErrorRecoveryManager`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Reconnect attempts before giving up
    pub max_retries: u32,
    /// Delay before the second reconnect attempt
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Attempt REINDEX/VACUUM when corruption is detected
    pub auto_repair: bool,
    /// Apply deterministic consistency corrections automatically
    pub auto_correct: bool,
    /// Permit the last-resort tier that removes the database file
    pub allow_reset: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            auto_repair: true,
            auto_correct: true,
            allow_reset: true,
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> DbResult<()> {
        if self.max_retries == 0 {
            return Err(DbError::config("recovery.max_retries must be at least 1"));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(DbError::config(
                "recovery.backoff_multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }
}

/// Tuning for `DatabaseHealthMonitor`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Start the background monitor during initialization
    pub enabled: bool,
    pub interval_ms: u64,
    /// Latency above this raises a medium performance issue
    pub latency_warning_ms: u64,
    /// Latency above this raises a high performance issue
    pub latency_critical_ms: u64,
    /// Error rate (0.0-1.0) over the window above which the database is unhealthy
    pub error_rate_threshold: f64,
    /// Samples used for the rolling error rate
    pub error_window: usize,
    /// Samples retained for trend computation
    pub history_size: usize,
    /// Dispatch critical issues to recovery automatically
    pub auto_recovery: bool,
    /// Include the application-level consistency check in each tick
    pub check_consistency: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
            latency_warning_ms: 100,
            latency_critical_ms: 1_000,
            error_rate_threshold: 0.1,
            error_window: 10,
            history_size: 100,
            auto_recovery: true,
            check_consistency: true,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.interval_ms == 0 {
            return Err(DbError::config("monitor.interval_ms must be positive"));
        }
        if self.latency_warning_ms > self.latency_critical_ms {
            return Err(DbError::config(
                "monitor.latency_warning_ms cannot exceed monitor.latency_critical_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err(DbError::config(
                "monitor.error_rate_threshold must be between 0.0 and 1.0",
            ));
        }
        if self.history_size == 0 || self.error_window == 0 {
            return Err(DbError::config(
                "monitor.history_size and monitor.error_window must be positive",
            ));
        }
        Ok(())
    }
}

/// Where and how many backups are kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Defaults to `<directory>/backups`
    pub directory: Option<PathBuf>,
    /// Oldest backups beyond this count are pruned; 0 keeps everything
    pub max_backups: usize,
    /// Snapshot the database before applying pending migrations
    pub before_migrations: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: None,
            max_backups: 10,
            before_migrations: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        DatabaseConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case(PoolConfig::new(0, 1, 100), true)]
    #[case(PoolConfig::new(2, 5, 50), true)]
    #[case(PoolConfig::new(6, 5, 50), false)]
    #[case(PoolConfig::new(0, 0, 50), false)]
    #[case(PoolConfig::new(1, MAX_POOL_SIZE + 1, 50), false)]
    #[case(PoolConfig::new(1, 2, 0), false)]
    fn pool_bounds(#[case] pool: PoolConfig, #[case] valid: bool) {
        assert_eq!(pool.validate().is_ok(), valid);
    }

    #[rstest]
    #[case("")]
    #[case("nested/app.db")]
    #[case("..app.db")]
    fn rejects_bad_file_names(#[case] name: &str) {
        let config = DatabaseConfig::new("/tmp", name);
        assert!(matches!(config.validate(), Err(DbError::Config(_))));
    }

    #[test]
    fn parses_toml_with_enum_pragmas() {
        let config = DatabaseConfig::from_toml_str(
            r#"
            directory = "/var/lib/app"
            file_name = "store.sqlite"
            schema_version = 3

            [pool]
            min = 1
            max = 3
            timeout_ms = 250

            [pragmas]
            journal_mode = "truncate"
            synchronous = "full"
            temp_store = "file"

            [monitor]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.database_path(), PathBuf::from("/var/lib/app/store.sqlite"));
        assert_eq!(config.schema_version, Some(3));
        assert_eq!(config.pragmas.journal_mode, JournalMode::Truncate);
        assert_eq!(config.pragmas.synchronous, SynchronousMode::Full);
        assert_eq!(config.pragmas.temp_store, TempStore::File);
        assert!(!config.monitor.enabled);
        // untouched sections keep their defaults
        assert_eq!(config.transactions, TransactionConfig::default());
    }

    #[test]
    fn rejects_unknown_pragma_values() {
        let err = DatabaseConfig::from_toml_str(
            r#"
            [pragmas]
            journal_mode = "wal; DROP TABLE users"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, DbError::Config(_)));
    }

    #[test]
    fn backup_directory_defaults_under_data_dir() {
        let config = DatabaseConfig::new("/data", "app.db");
        assert_eq!(config.backup_directory(), PathBuf::from("/data/backups"));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.toml");
        std::fs::write(&path, "file_name = \"notes.db\"\n").unwrap();

        let config = DatabaseConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.file_name, "notes.db");
    }
}
