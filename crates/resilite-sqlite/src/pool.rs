//! Bounded connection pool with blocking acquire
//!
//! The pool is the sole owner of physical connections. Callers borrow a
//! [`PooledConnection`] and the guard returns it on drop, so every acquire is
//! paired with a release on all exit paths.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use resilite_core::config::{PoolConfig, PragmaConfig};
use resilite_core::error::{DbError, DbResult};

use crate::connection::open_connection;

/// Bookkeeping for one physical connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub use_count: u64,
}

impl ConnectionInfo {
    fn new(id: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_used: now,
            use_count: 0,
        }
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub min: usize,
    pub max: usize,
}

struct IdleConnection {
    conn: Connection,
    info: ConnectionInfo,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleConnection>,
    in_use: HashMap<u64, ConnectionInfo>,
    next_id: u64,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len()
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    released: Condvar,
}

impl PoolShared {
    fn lock(&self) -> DbResult<MutexGuard<'_, PoolState>> {
        self.state
            .lock()
            .map_err(|e| DbError::Connection(format!("failed to lock connection pool: {}", e)))
    }

    fn check_in(&self, id: u64, conn: Connection) {
        let Ok(mut state) = self.state.lock() else {
            tracing::error!(connection_id = id, "failed to lock pool for connection return, closing connection");
            return;
        };

        match state.in_use.remove(&id) {
            Some(mut info) if !state.closed => {
                info.last_used = Utc::now();
                state.idle.push(IdleConnection { conn, info });
                drop(state);
                self.released.notify_one();
            }
            Some(_) => {
                // pool shut down while the handle was out
                drop(state);
                close_quietly(id, conn);
            }
            None => {
                drop(state);
                tracing::warn!(connection_id = id, "released connection is not tracked by this pool, ignoring");
                close_quietly(id, conn);
            }
        }
    }
}

fn close_quietly(id: u64, conn: Connection) {
    if let Err((_, e)) = conn.close() {
        tracing::warn!(connection_id = id, error = %e, "error while closing connection");
    }
}

/// Bounded pool of connections to one database file
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    path: PathBuf,
    config: PoolConfig,
    pragmas: PragmaConfig,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create an empty pool; call [`initialize`](Self::initialize) to pre-warm it
    pub fn new(path: impl AsRef<Path>, config: PoolConfig, pragmas: PragmaConfig) -> DbResult<Self> {
        config.validate()?;
        pragmas.validate()?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
                released: Condvar::new(),
            }),
            path: path.as_ref().to_path_buf(),
            config,
            pragmas,
        })
    }

    /// Open connections until `min` exist. Reopens a pool that was closed.
    pub fn initialize(&self) -> DbResult<()> {
        let mut state = self.shared.lock()?;
        state.closed = false;
        while state.total() < self.config.min {
            let conn = open_connection(&self.path, &self.pragmas)?;
            let id = state.allocate_id();
            state.idle.push(IdleConnection {
                conn,
                info: ConnectionInfo::new(id),
            });
        }
        tracing::info!(
            path = %self.path.display(),
            min = self.config.min,
            max = self.config.max,
            "connection pool initialized"
        );
        Ok(())
    }

    /// Borrow a connection, waiting up to the configured timeout
    pub fn acquire(&self) -> DbResult<PooledConnection> {
        let started = Instant::now();
        let timeout = self.config.timeout();
        let mut state = self.shared.lock()?;

        loop {
            if state.closed {
                return Err(DbError::PoolClosed);
            }

            if let Some(IdleConnection { conn, mut info }) = state.idle.pop() {
                info.use_count += 1;
                info.last_used = Utc::now();
                let id = info.id;
                state.in_use.insert(id, info);
                return Ok(PooledConnection::new(id, conn, Arc::clone(&self.shared)));
            }

            if state.total() < self.config.max {
                // opened under the lock so concurrent callers cannot overshoot max
                let conn = open_connection(&self.path, &self.pragmas)?;
                let id = state.allocate_id();
                let mut info = ConnectionInfo::new(id);
                info.use_count = 1;
                state.in_use.insert(id, info);
                tracing::debug!(connection_id = id, total = state.total(), "opened pooled connection");
                return Ok(PooledConnection::new(id, conn, Arc::clone(&self.shared)));
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                tracing::warn!(
                    waited_ms = elapsed.as_millis() as u64,
                    max = self.config.max,
                    "timed out waiting for a pooled connection"
                );
                return Err(DbError::PoolTimeout {
                    waited: elapsed,
                    max: self.config.max,
                });
            }

            let wait = (timeout - elapsed).min(self.config.poll_interval());
            state = self
                .shared
                .released
                .wait_timeout(state, wait)
                .map_err(|e| DbError::Connection(format!("connection pool lock poisoned: {}", e)))?
                .0;
        }
    }

    /// Return a connection explicitly; equivalent to dropping the guard
    pub fn release(&self, conn: PooledConnection) {
        conn.release();
    }

    /// Run `f` with a borrowed connection, releasing it on every exit path
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> DbResult<T>) -> DbResult<T> {
        let conn = self.acquire()?;
        f(&conn)
    }

    /// Close every idle connection and mark the pool closed. Idempotent.
    ///
    /// Handles still borrowed are closed when their guard drops.
    pub fn close_all(&self) -> DbResult<()> {
        let (idle, outstanding) = {
            let mut state = self.shared.lock()?;
            if state.closed && state.idle.is_empty() {
                return Ok(());
            }
            state.closed = true;
            (std::mem::take(&mut state.idle), state.in_use.len())
        };

        let closed = idle.len();
        for entry in idle {
            close_quietly(entry.info.id, entry.conn);
        }
        self.shared.released.notify_all();
        tracing::info!(closed, outstanding, "connection pool closed");
        Ok(())
    }

    /// Close everything and re-open `min` fresh connections
    pub fn reset(&self) -> DbResult<()> {
        self.close_all()?;
        {
            let mut state = self.shared.lock()?;
            // outstanding guards become untracked and close themselves on drop
            state.in_use.clear();
        }
        self.initialize()
    }

    pub fn stats(&self) -> DbResult<PoolStats> {
        let state = self.shared.lock()?;
        Ok(PoolStats {
            total: state.total(),
            available: state.idle.len(),
            in_use: state.in_use.len(),
            min: self.config.min,
            max: self.config.max,
        })
    }

    /// Details of every tracked connection, idle and borrowed
    pub fn connections(&self) -> DbResult<Vec<ConnectionInfo>> {
        let state = self.shared.lock()?;
        let mut infos: Vec<_> = state
            .idle
            .iter()
            .map(|entry| entry.info.clone())
            .chain(state.in_use.values().cloned())
            .collect();
        infos.sort_by_key(|info| info.id);
        Ok(infos)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().map(|state| state.closed).unwrap_or(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            tracing::error!(error = %e, "failed to close connection pool on drop");
        }
    }
}

/// RAII guard for a borrowed connection; returns it to the pool on drop
pub struct PooledConnection {
    id: u64,
    connection: Option<Connection>,
    pool: Arc<PoolShared>,
}

impl PooledConnection {
    fn new(id: u64, connection: Connection, pool: Arc<PoolShared>) -> Self {
        Self {
            id,
            connection: Some(connection),
            pool,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Give the connection back to the pool now
    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").field("id", &self.id).finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        // only taken in Drop
        self.connection
            .as_ref()
            .expect("PooledConnection used after release")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("PooledConnection used after release")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            self.pool.check_in(self.id, conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn pool(min: usize, max: usize, timeout_ms: u64) -> (TempDir, ConnectionPool) {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::new(
            dir.path().join("pool.db"),
            PoolConfig::new(min, max, timeout_ms),
            PragmaConfig::default(),
        )
        .unwrap();
        pool.initialize().unwrap();
        (dir, pool)
    }

    fn assert_accounting(pool: &ConnectionPool) {
        let stats = pool.stats().unwrap();
        assert_eq!(stats.available + stats.in_use, stats.total);
        assert!(stats.total <= stats.max);
    }

    #[test]
    fn initialize_opens_min_connections() {
        let (_dir, pool) = pool(2, 5, 1_000);
        let stats = pool.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.available, 2);
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn grows_on_demand_and_reuses() {
        let (_dir, pool) = pool(1, 3, 1_000);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.stats().unwrap().total, 2);

        let reused_id = a.id();
        drop(a);
        let c = pool.acquire().unwrap();
        assert_eq!(c.id(), reused_id);
        assert_eq!(pool.stats().unwrap().in_use, 2);

        drop(b);
        drop(c);
        assert_accounting(&pool);
    }

    #[test]
    fn times_out_when_saturated() {
        let (_dir, pool) = pool(2, 5, 50);
        let held: Vec<_> = (0..5).map(|_| pool.acquire().unwrap()).collect();

        let started = Instant::now();
        let err = pool.acquire().unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, DbError::PoolTimeout { max: 5, .. }));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(1_000));
        drop(held);
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let (_dir, pool) = pool(1, 1, 2_000);
        let pool = Arc::new(pool);
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|conn| conn.id()))
        };
        thread::sleep(Duration::from_millis(30));
        let id = held.id();
        pool.release(held);

        assert_eq!(waiter.join().unwrap().unwrap(), id);
    }

    #[test]
    fn second_concurrent_acquire_times_out() {
        let (_dir, pool) = pool(1, 1, 100);
        let pool = Arc::new(pool);
        let _held = pool.acquire().unwrap();

        let started = Instant::now();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|conn| conn.id()))
        };
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(DbError::PoolTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn close_all_is_idempotent_and_rejects_acquire() {
        let (_dir, pool) = pool(2, 4, 100);
        let outstanding = pool.acquire().unwrap();

        pool.close_all().unwrap();
        pool.close_all().unwrap();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire(), Err(DbError::PoolClosed)));

        // a handle returned after shutdown is closed, not pooled
        drop(outstanding);
        assert_eq!(pool.stats().unwrap().available, 0);
    }

    #[test]
    fn reset_reopens_the_pool() {
        let (_dir, pool) = pool(2, 4, 100);
        let stale = pool.acquire().unwrap();
        pool.reset().unwrap();

        // untracked handle is ignored on return
        drop(stale);
        let stats = pool.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.in_use, 0);
        assert!(!pool.is_closed());
    }

    #[test]
    fn tracks_use_counts() {
        let (_dir, pool) = pool(1, 1, 100);
        for _ in 0..3 {
            let conn = pool.acquire().unwrap();
            conn.execute_batch("SELECT 1").unwrap();
        }
        let infos = pool.connections().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].use_count, 3);
    }

    #[test]
    fn with_connection_releases_on_error() {
        let (_dir, pool) = pool(1, 1, 100);
        let result: DbResult<()> =
            pool.with_connection(|_| Err(DbError::Transaction("boom".into())));
        assert!(result.is_err());
        assert_eq!(pool.stats().unwrap().in_use, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn accounting_holds_for_any_sequence(
            min in 0usize..3,
            extra in 0usize..4,
            ops in proptest::collection::vec(any::<bool>(), 1..40),
        ) {
            let (_dir, pool) = pool(min, min + extra + 1, 5);
            let mut held = Vec::new();
            for acquire in ops {
                if acquire {
                    if let Ok(conn) = pool.acquire() {
                        held.push(conn);
                    }
                } else if let Some(conn) = held.pop() {
                    conn.release();
                }
                let stats = pool.stats().unwrap();
                prop_assert_eq!(stats.available + stats.in_use, stats.total);
                prop_assert!(stats.total <= stats.max);
                prop_assert!(stats.total >= stats.min);
                prop_assert_eq!(stats.in_use, held.len());
            }
        }
    }
}
