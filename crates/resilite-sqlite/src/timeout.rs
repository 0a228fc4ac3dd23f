//! Deadline enforcement for long-running database work
//!
//! SQLite statements cannot be cancelled from the calling thread while they
//! run, so a watchdog thread waits on a channel and interrupts the connection
//! when the deadline passes. The interrupted statement fails with
//! `SQLITE_INTERRUPT`, and the caller checks [`Watchdog::disarm`] to tell a
//! timeout apart from an ordinary failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::Connection;

/// Interrupts a connection if it is still busy when the deadline passes
pub struct Watchdog {
    cancel: Option<Sender<()>>,
    fired: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    timeout: Duration,
}

impl Watchdog {
    /// Start a watchdog for `conn` that fires after `timeout`
    pub fn arm(conn: &Connection, timeout: Duration) -> Self {
        let (cancel, rx) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let interrupt = conn.get_interrupt_handle();

        let flag = Arc::clone(&fired);
        let thread = thread::Builder::new()
            .name("resilite-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
                    flag.store(true, Ordering::SeqCst);
                    interrupt.interrupt();
                    tracing::warn!(timeout_ms = timeout.as_millis() as u64, "deadline exceeded, interrupting connection");
                }
            });

        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn watchdog thread, running without deadline");
                None
            }
        };

        Self {
            cancel: Some(cancel),
            fired,
            thread,
            timeout,
        }
    }

    /// Whether the deadline has already passed
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Stop the watchdog and report whether it fired
    pub fn disarm(mut self) -> bool {
        self.stop();
        self.fired()
    }

    fn stop(&mut self) {
        // dropping the sender wakes the thread with Disconnected
        self.cancel.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Whether `err` is SQLite reporting an interrupted statement
pub fn is_interrupt(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(rusqlite::ErrorCode::OperationInterrupted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    // recursive CTE that runs far longer than any test deadline
    const SLOW_QUERY: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                              SELECT COUNT(*) FROM c";

    #[test]
    fn quiet_when_work_finishes_in_time() {
        let conn = Connection::open_in_memory().unwrap();
        let watchdog = Watchdog::arm(&conn, Duration::from_secs(5));
        conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
        assert!(!watchdog.disarm());
    }

    #[test]
    fn interrupts_runaway_statement() {
        let conn = Connection::open_in_memory().unwrap();
        let started = Instant::now();
        let watchdog = Watchdog::arm(&conn, Duration::from_millis(50));

        let err = conn
            .query_row(SLOW_QUERY, [], |row| row.get::<_, i64>(0))
            .unwrap_err();

        assert!(is_interrupt(&err));
        assert!(watchdog.disarm());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn connection_usable_after_interrupt() {
        let conn = Connection::open_in_memory().unwrap();
        let watchdog = Watchdog::arm(&conn, Duration::from_millis(20));
        let _ = conn.query_row(SLOW_QUERY, [], |row| row.get::<_, i64>(0));
        assert!(watchdog.disarm());

        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(one, 1);
    }
}
