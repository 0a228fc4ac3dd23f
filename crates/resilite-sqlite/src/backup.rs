//! File backups with manifests
//!
//! Each backup is a directory `backup-<UTC timestamp>-<id>/` under the backup
//! root, holding the database snapshot and a `manifest.json` describing it.
//! Online snapshots use `VACUUM INTO`, which produces a consistent, compacted
//! copy without blocking readers.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use resilite_core::error::{DbError, DbResult};

use crate::connection::open_existing;
use crate::migration::recorded_schema_version;

pub const MANIFEST_FILE: &str = "manifest.json";

/// One file captured by a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub name: String,
    pub size_bytes: u64,
}

/// Contents of `manifest.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Database file the backup was taken from
    pub source: PathBuf,
    /// Applied schema version at backup time, when it could be read
    pub schema_version: Option<u32>,
    pub reason: String,
    pub files: Vec<BackupFile>,
    /// Byte copy of a file that may be damaged, kept under its own retention budget
    #[serde(default)]
    pub raw: bool,
}

/// A backup on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub directory: PathBuf,
    pub manifest: BackupManifest,
}

impl BackupInfo {
    /// Path of the database snapshot inside the backup directory
    pub fn database_path(&self) -> PathBuf {
        let name = self
            .manifest
            .files
            .first()
            .map(|f| f.name.as_str())
            .unwrap_or("database.db");
        self.directory.join(name)
    }

    pub fn size_bytes(&self) -> u64 {
        self.manifest.files.iter().map(|f| f.size_bytes).sum()
    }
}

/// Creates, lists, prunes and restores backups of one database file
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
    source: PathBuf,
    max_backups: usize,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>, source: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            root: root.into(),
            source: source.into(),
            max_backups,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    fn file_name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "database.db".to_string())
    }

    fn new_directory(&self) -> DbResult<(String, DateTime<Utc>, PathBuf)> {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let created_at = Utc::now();
        let dir = self.root.join(format!(
            "backup-{}-{}",
            created_at.format("%Y%m%dT%H%M%S%.3fZ"),
            id
        ));
        fs::create_dir_all(&dir)?;
        Ok((id, created_at, dir))
    }

    /// Take an online snapshot through `conn`
    pub fn create(&self, conn: &Connection, reason: &str) -> DbResult<BackupInfo> {
        let (id, created_at, dir) = self.new_directory()?;
        let target = dir.join(self.file_name());

        let path = target.to_string_lossy().into_owned();
        if let Err(e) = conn.execute("VACUUM INTO ?1", [path.as_str()]) {
            let _ = fs::remove_dir_all(&dir);
            return Err(DbError::Backup(format!(
                "failed to snapshot {}: {}",
                self.source.display(),
                e
            )));
        }

        let schema_version = recorded_schema_version(conn).ok().flatten();
        let info = self.finish(id, created_at, dir, schema_version, reason, &[target], false)?;
        tracing::info!(
            id = %info.manifest.id,
            reason,
            size_bytes = info.size_bytes(),
            path = %info.directory.display(),
            "backup created"
        );
        self.prune()?;
        Ok(info)
    }

    /// Copy the raw database file (and its WAL, if any) without opening it.
    ///
    /// Used when the file may be damaged and cannot be read through SQLite.
    /// Returns `None` when there is nothing to copy.
    pub fn snapshot_file(&self, reason: &str) -> DbResult<Option<BackupInfo>> {
        if !self.source.exists() {
            return Ok(None);
        }
        let (id, created_at, dir) = self.new_directory()?;
        let mut files = Vec::new();
        for source in [self.source.clone(), sidecar(&self.source, "-wal")] {
            if source.exists() {
                let Some(name) = source.file_name() else {
                    continue;
                };
                let target = dir.join(name);
                fs::copy(&source, &target)?;
                files.push(target);
            }
        }

        let info = self.finish(id, created_at, dir, None, reason, &files, true)?;
        tracing::info!(id = %info.manifest.id, reason, "raw file snapshot created");
        self.prune()?;
        Ok(Some(info))
    }

    fn finish(
        &self,
        id: String,
        created_at: DateTime<Utc>,
        directory: PathBuf,
        schema_version: Option<u32>,
        reason: &str,
        files: &[PathBuf],
        raw: bool,
    ) -> DbResult<BackupInfo> {
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            entries.push(BackupFile {
                name: file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size_bytes: fs::metadata(file)?.len(),
            });
        }

        let manifest = BackupManifest {
            id,
            created_at,
            source: self.source.clone(),
            schema_version,
            reason: reason.to_string(),
            files: entries,
            raw,
        };
        fs::write(
            directory.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )?;
        Ok(BackupInfo {
            directory,
            manifest,
        })
    }

    /// Every readable backup, newest first
    pub fn list(&self) -> DbResult<Vec<BackupInfo>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let directory = entry?.path();
            let manifest_path = directory.join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                continue;
            }
            match fs::read(&manifest_path)
                .map_err(DbError::from)
                .and_then(|bytes| serde_json::from_slice::<BackupManifest>(&bytes).map_err(DbError::from))
            {
                Ok(manifest) => backups.push(BackupInfo {
                    directory,
                    manifest,
                }),
                Err(e) => {
                    tracing::warn!(path = %manifest_path.display(), error = %e, "skipping unreadable backup manifest")
                }
            }
        }

        backups.sort_by(|a, b| b.manifest.created_at.cmp(&a.manifest.created_at));
        Ok(backups)
    }

    /// Most recent backup, if any
    pub fn latest(&self) -> DbResult<Option<BackupInfo>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Most recent backup that passes validation
    pub fn latest_valid(&self) -> DbResult<Option<BackupInfo>> {
        for backup in self.list()? {
            match self.validate(&backup.database_path()) {
                Ok(()) => return Ok(Some(backup)),
                Err(e) => {
                    tracing::warn!(id = %backup.manifest.id, error = %e, "skipping invalid backup")
                }
            }
        }
        Ok(None)
    }

    /// Delete the oldest backups beyond `max_backups`; returns how many were removed.
    ///
    /// Online backups and raw file snapshots are counted separately, so
    /// snapshots of damaged files never push a usable backup out.
    pub fn prune(&self) -> DbResult<usize> {
        if self.max_backups == 0 {
            return Ok(0);
        }
        let (raw, online): (Vec<_>, Vec<_>) = self.list()?.into_iter().partition(|b| b.manifest.raw);
        let mut removed = 0;
        for old in online
            .into_iter()
            .skip(self.max_backups)
            .chain(raw.into_iter().skip(self.max_backups))
        {
            fs::remove_dir_all(&old.directory)?;
            tracing::debug!(id = %old.manifest.id, raw = old.manifest.raw, "pruned backup");
            removed += 1;
        }
        Ok(removed)
    }

    /// Check that `path` is a readable, structurally sound database
    pub fn validate(&self, path: &Path) -> DbResult<()> {
        if !path.is_file() {
            return Err(DbError::Backup(format!(
                "backup file does not exist: {}",
                path.display()
            )));
        }
        let conn = open_existing(path)?;
        let result: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| DbError::Backup(format!("backup {} is unreadable: {}", path.display(), e)))?;
        if result != "ok" {
            return Err(DbError::Backup(format!(
                "backup {} failed quick_check: {}",
                path.display(),
                result
            )));
        }
        Ok(())
    }

    /// Replace the live database file with `backup`.
    ///
    /// Every connection to the database must be closed first. The backup is
    /// staged next to the database before the current file is copied aside
    /// as a `pre-restore` snapshot, so pruning cannot remove the source.
    pub fn restore(&self, backup: &Path) -> DbResult<()> {
        self.validate(backup)?;

        let staging = sidecar(&self.source, ".restore");
        fs::copy(backup, &staging)?;
        let backup_wal = sidecar(backup, "-wal");
        let staged_wal = sidecar(&staging, "-wal");
        if backup_wal.is_file() {
            fs::copy(&backup_wal, &staged_wal)?;
        }

        if let Err(e) = self.snapshot_file("pre-restore") {
            tracing::warn!(error = %e, "failed to snapshot database before restore");
        }

        remove_if_exists(&sidecar(&self.source, "-wal"))?;
        remove_if_exists(&sidecar(&self.source, "-shm"))?;
        fs::rename(&staging, &self.source)?;

        // raw snapshots may carry committed pages in a WAL
        if staged_wal.is_file() {
            fs::rename(&staged_wal, sidecar(&self.source, "-wal"))?;
        }

        tracing::info!(
            from = %backup.display(),
            to = %self.source.display(),
            "database restored from backup"
        );
        Ok(())
    }
}

/// `app.db` -> `app.db-wal` and friends
pub(crate) fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) fn remove_if_exists(path: &Path) -> DbResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
