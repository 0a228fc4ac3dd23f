//! Engine-level corruption detection and repair

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use resilite_core::error::{DbError, DbResult};

use crate::connection::rollback_open_transaction;

/// Rows reported by `integrity_check` before it stops scanning
const INTEGRITY_CHECK_LIMIT: u32 = 100;

/// Outcome of a corruption check, optionally followed by a repair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptionReport {
    pub is_corrupted: bool,
    pub errors: Vec<String>,
    pub repair_attempted: bool,
    /// Set only when a repair was attempted
    pub repair_successful: Option<bool>,
}

impl CorruptionReport {
    /// Whether the database is usable after this check/repair
    pub fn is_healthy(&self) -> bool {
        !self.is_corrupted || self.repair_successful == Some(true)
    }
}

/// A row of `PRAGMA foreign_key_check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
    pub fk_index: i64,
}

/// Full diagnostic report for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub checked_at: DateTime<Utc>,
    pub integrity_ok: bool,
    pub integrity_messages: Vec<String>,
    pub quick_check_ok: bool,
    pub quick_check_messages: Vec<String>,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub page_count: i64,
    pub freelist_count: i64,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.integrity_ok && self.quick_check_ok && self.foreign_key_violations.is_empty()
    }
}

fn pragma_messages(conn: &Connection, sql: &str) -> DbResult<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let messages = rows.collect::<Result<Vec<_>, _>>()?;
    if messages.len() == 1 && messages[0].eq_ignore_ascii_case("ok") {
        return Ok(Vec::new());
    }
    Ok(messages)
}

/// Problems reported by `PRAGMA integrity_check`; empty when clean
pub fn integrity_check(conn: &Connection) -> DbResult<Vec<String>> {
    pragma_messages(conn, &format!("PRAGMA integrity_check({})", INTEGRITY_CHECK_LIMIT))
}

/// Problems reported by `PRAGMA quick_check`; empty when clean
pub fn quick_check(conn: &Connection) -> DbResult<Vec<String>> {
    pragma_messages(conn, "PRAGMA quick_check")
}

pub fn foreign_key_check(conn: &Connection) -> DbResult<Vec<ForeignKeyViolation>> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let rows = stmt.query_map([], |row| {
        Ok(ForeignKeyViolation {
            table: row.get(0)?,
            rowid: row.get(1)?,
            parent: row.get(2)?,
            fk_index: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Run both engine checks without modifying anything.
///
/// A check that cannot even run because the file is unreadable counts as
/// corruption; any other failure is returned as an error.
pub fn check(conn: &Connection) -> DbResult<CorruptionReport> {
    let mut errors = Vec::new();
    for (name, result) in [
        ("integrity_check", integrity_check(conn)),
        ("quick_check", quick_check(conn)),
    ] {
        match result {
            Ok(messages) => errors.extend(messages.into_iter().map(|m| format!("{}: {}", name, m))),
            Err(e) if e.is_corruption() => errors.push(format!("{}: {}", name, e)),
            Err(e) => return Err(e),
        }
    }
    errors.dedup();

    Ok(CorruptionReport {
        is_corrupted: !errors.is_empty(),
        errors,
        repair_attempted: false,
        repair_successful: None,
    })
}

/// Rebuild indexes and compact the file
pub fn repair(conn: &Connection) -> DbResult<()> {
    // VACUUM refuses to run inside a transaction
    rollback_open_transaction(conn)?;
    conn.execute_batch("REINDEX;")?;
    conn.execute_batch("VACUUM;")?;
    Ok(())
}

/// Check, and when corruption is found and `auto_repair` is set, repair and
/// check again
pub fn detect_and_repair(conn: &Connection, auto_repair: bool) -> DbResult<CorruptionReport> {
    let mut report = check(conn)?;
    if !report.is_corrupted {
        return Ok(report);
    }

    tracing::error!(errors = ?report.errors, "database corruption detected");
    if !auto_repair {
        return Ok(report);
    }

    report.repair_attempted = true;
    if let Err(e) = repair(conn) {
        tracing::error!(error = %e, "repair failed");
        report.errors.push(format!("repair: {}", e));
        report.repair_successful = Some(false);
        return Ok(report);
    }

    match check(conn) {
        Ok(after) if !after.is_corrupted => {
            tracing::info!("corruption repaired by REINDEX and VACUUM");
            report.repair_successful = Some(true);
        }
        Ok(after) => {
            report.errors.extend(after.errors.into_iter().map(|e| format!("after repair: {}", e)));
            report.repair_successful = Some(false);
        }
        Err(e) => {
            report.errors.push(format!("after repair: {}", e));
            report.repair_successful = Some(false);
        }
    }
    Ok(report)
}

/// Collect every integrity diagnostic in one report
pub fn integrity_report(conn: &Connection) -> DbResult<IntegrityReport> {
    let integrity_messages = integrity_check(conn)?;
    let quick_check_messages = quick_check(conn)?;
    let foreign_key_violations = foreign_key_check(conn)?;
    let page_count = crate::connection::pragma_i64(conn, "page_count")?;
    let freelist_count = crate::connection::pragma_i64(conn, "freelist_count")?;

    Ok(IntegrityReport {
        checked_at: Utc::now(),
        integrity_ok: integrity_messages.is_empty(),
        integrity_messages,
        quick_check_ok: quick_check_messages.is_empty(),
        quick_check_messages,
        foreign_key_violations,
        page_count,
        freelist_count,
    })
}

/// Whether the connection answers and the file passes a quick check
pub fn connection_is_healthy(conn: &Connection) -> bool {
    crate::connection::probe(conn).is_ok() && quick_check(conn).map(|m| m.is_empty()).unwrap_or(false)
}

pub(crate) fn corruption_error(report: &CorruptionReport) -> DbError {
    DbError::Corruption(report.errors.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "PRAGMA foreign_keys = OFF;
             CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);
             CREATE TABLE sessions (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id));
             CREATE INDEX idx_users_email ON users(email);
             INSERT INTO users (email) VALUES ('a@example.com'), ('b@example.com');
             INSERT INTO sessions (user_id) VALUES (1), (42);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn clean_database_reports_nothing() {
        let conn = seeded();
        let report = check(&conn).unwrap();
        assert!(!report.is_corrupted);
        assert!(report.errors.is_empty());
        assert!(report.is_healthy());
    }

    #[test]
    fn repair_on_clean_database_is_harmless() {
        let conn = seeded();
        repair(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn repair_rolls_back_dangling_transaction() {
        let conn = seeded();
        conn.execute_batch("BEGIN; INSERT INTO users (email) VALUES ('c@example.com');")
            .unwrap();
        repair(&conn).unwrap();
        assert!(conn.is_autocommit());
    }

    #[test]
    fn integrity_report_lists_foreign_key_violations() {
        let conn = seeded();
        let report = integrity_report(&conn).unwrap();
        assert!(report.integrity_ok);
        assert!(report.quick_check_ok);
        assert_eq!(report.foreign_key_violations.len(), 1);
        assert_eq!(report.foreign_key_violations[0].table, "sessions");
        assert!(!report.is_ok());
    }

    #[test]
    fn detects_damaged_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("damaged.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE t (id INTEGER PRIMARY KEY, body TEXT);
                 CREATE INDEX idx_t_body ON t(body);",
            )
            .unwrap();
            let mut stmt = conn.prepare("INSERT INTO t (body) VALUES (?1)").unwrap();
            for i in 0..2_000 {
                stmt.execute([format!("row-{:06}-{}", i, "x".repeat(64))]).unwrap();
            }
        }

        // scribble over the middle of the file, leaving the header intact
        let mut bytes = std::fs::read(&path).unwrap();
        let start = bytes.len() / 2;
        for b in bytes.iter_mut().skip(start).take(8_192) {
            *b = 0xA5;
        }
        std::fs::write(&path, bytes).unwrap();

        let conn = Connection::open(&path).unwrap();
        let report = detect_and_repair(&conn, false).unwrap();
        assert!(report.is_corrupted);
        assert!(!report.errors.is_empty());
        assert!(!report.repair_attempted);
        assert!(!connection_is_healthy(&conn));
    }
}
