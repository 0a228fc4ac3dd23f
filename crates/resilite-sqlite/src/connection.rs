//! Opening and configuring physical SQLite connections

use std::path::Path;

use rusqlite::{Connection, OpenFlags};

use resilite_core::config::PragmaConfig;
use resilite_core::error::{DbError, DbResult};

/// Open a read/write connection to `path` and apply the full pragma set
pub fn open_connection(path: &Path, pragmas: &PragmaConfig) -> DbResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let conn = Connection::open_with_flags(path, flags).map_err(|e| {
        DbError::Connection(format!("failed to open {}: {}", path.display(), e))
    })?;

    apply_pragmas(&conn, pragmas)?;
    Ok(conn)
}

/// Open a file that must already exist, without applying pragmas
pub fn open_existing(path: &Path) -> DbResult<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| DbError::Connection(format!("failed to open {}: {}", path.display(), e)))
}

/// Apply every configured pragma to `conn`
///
/// Statement text is assembled only from enum constants and integers, so no
/// caller-provided string ever reaches SQL.
pub fn apply_pragmas(conn: &Connection, pragmas: &PragmaConfig) -> DbResult<()> {
    conn.busy_timeout(pragmas.busy_timeout())?;

    let mode: String = conn
        .query_row(
            &format!("PRAGMA journal_mode = {}", pragmas.journal_mode.as_str()),
            [],
            |row| row.get(0),
        )
        .map_err(|e| DbError::Connection(format!("failed to set journal_mode: {}", e)))?;
    if !mode.eq_ignore_ascii_case(pragmas.journal_mode.as_str()) {
        // in-memory databases cannot use WAL; SQLite keeps its own mode
        tracing::warn!(requested = pragmas.journal_mode.as_str(), actual = %mode, "journal mode not applied");
    }

    // mmap_size echoes the new value back as a row, except where there is no file to map
    let mmap = conn.query_row(
        &format!("PRAGMA mmap_size = {}", pragmas.mmap_size),
        [],
        |row| row.get::<_, i64>(0),
    );
    match mmap {
        Ok(_) | Err(rusqlite::Error::QueryReturnedNoRows) => {}
        Err(e) => {
            tracing::warn!(requested = pragmas.mmap_size, error = %e, "mmap_size not applied");
        }
    }

    conn.execute_batch(&format!(
        "PRAGMA synchronous = {};\nPRAGMA cache_size = {};\nPRAGMA temp_store = {};\nPRAGMA foreign_keys = {};",
        pragmas.synchronous.as_str(),
        pragmas.cache_size,
        pragmas.temp_store.as_str(),
        if pragmas.foreign_keys { "ON" } else { "OFF" },
    ))
    .map_err(|e| DbError::Connection(format!("failed to configure connection: {}", e)))?;
    Ok(())
}

/// Read a single integer-valued pragma
pub fn pragma_i64(conn: &Connection, pragma: &'static str) -> DbResult<i64> {
    Ok(conn.query_row(&format!("PRAGMA {}", pragma), [], |row| row.get(0))?)
}

/// Cheapest query that still touches the database file
pub fn probe(conn: &Connection) -> DbResult<()> {
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(|e| DbError::Connection(format!("connectivity probe failed: {}", e)))?;
    Ok(())
}

/// Size of the main database in bytes (`page_count * page_size`)
pub fn database_size(conn: &Connection) -> DbResult<u64> {
    let page_count = pragma_i64(conn, "page_count")?;
    let page_size = pragma_i64(conn, "page_size")?;
    Ok((page_count.max(0) as u64) * (page_size.max(0) as u64))
}

/// Roll back whatever transaction is open on `conn`; returns whether one was
pub fn rollback_open_transaction(conn: &Connection) -> DbResult<bool> {
    if conn.is_autocommit() {
        return Ok(false);
    }
    conn.execute_batch("ROLLBACK")?;
    Ok(true)
}

/// Whether a table exists in the main schema
pub fn table_exists(conn: &Connection, table: &str) -> DbResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
