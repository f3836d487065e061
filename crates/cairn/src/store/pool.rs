//! Bounded pool of transactional SQLite connections.
//!
//! Every component that touches the structured store acquires a
//! [`PooledConnection`] here and returns it by dropping it (or through
//! [`Pool::release`]). The pool performs no business logic.
//!
//! # Fairness
//!
//! Checkout is gated by a `tokio::sync::Semaphore` with `max_connections`
//! permits. The semaphore queues waiters in FIFO order, so releasing one
//! connection wakes exactly one waiter: the one that has waited longest.
//!
//! # Sizing
//!
//! `min_connections` are opened eagerly and never retired. Connections opened
//! above that floor are closed once they sit idle for `idle_timeout`, either
//! lazily on the next checkout or by the background reaper started with
//! [`Pool::spawn_reaper`].

use crate::error::{Error, Result};
use rusqlite::{Connection, OpenFlags};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// How long SQLite waits on a locked database before reporting `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lower bound for the reaper tick so tiny idle timeouts don't spin.
const MIN_REAPER_INTERVAL: Duration = Duration::from_millis(10);

static MEMORY_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Where the pooled connections point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A database file on disk (opened in WAL mode)
    File(PathBuf),

    /// A named, shared-cache in-memory database
    Memory(String),
}

impl StoreLocation {
    /// A fresh in-memory database name, unique within this process.
    #[must_use]
    pub fn unique_memory() -> Self {
        let n = MEMORY_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::Memory(format!("cairn-{}-{n}", std::process::id()))
    }

    fn open(&self) -> Result<Connection> {
        let conn = match self {
            Self::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let conn = Connection::open(path)?;
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn
            }
            Self::Memory(name) => Connection::open_with_flags(
                format!("file:{name}?mode=memory&cache=shared"),
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?,
        };
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }
}

/// Pool sizing and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections kept open at all times
    pub min_connections: usize,

    /// Upper bound on simultaneously open connections
    pub max_connections: usize,

    /// How long `acquire` waits before failing with `PoolExhausted`
    pub acquire_timeout: Duration,

    /// Idle time after which connections above `min_connections` are closed
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 4,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Check the bounds are usable.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `max_connections` is zero or smaller than
    /// `min_connections`.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::Config(format!(
                "min_connections ({}) cannot exceed max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections (idle and checked out)
    pub open: usize,
    /// Connections waiting in the idle list
    pub idle: usize,
    /// Connections currently checked out
    pub in_use: usize,
}

struct IdleConnection {
    conn: Connection,
    since: Instant,
}

struct PoolInner {
    location: StoreLocation,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
    open: AtomicUsize,
    /// Keeps a shared in-memory database alive while the pool exists.
    _anchor: Option<Mutex<Connection>>,
}

impl PoolInner {
    fn lock_idle(&self) -> MutexGuard<'_, Vec<IdleConnection>> {
        // The idle list holds no invariants a panic could break.
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle to a bounded connection pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("location", &self.inner.location)
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl Pool {
    /// Open a pool, eagerly creating `min_connections` connections.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for invalid bounds, or a database/IO error if a
    /// connection cannot be opened.
    pub fn open(location: StoreLocation, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let anchor = match &location {
            StoreLocation::Memory(_) => Some(Mutex::new(location.open()?)),
            StoreLocation::File(_) => None,
        };

        let mut idle = Vec::with_capacity(config.max_connections);
        for _ in 0..config.min_connections {
            idle.push(IdleConnection {
                conn: location.open()?,
                since: Instant::now(),
            });
        }

        tracing::debug!(
            location = ?location,
            min = config.min_connections,
            max = config.max_connections,
            "Opened connection pool"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.max_connections)),
                open: AtomicUsize::new(idle.len()),
                idle: Mutex::new(idle),
                location,
                config,
                _anchor: anchor,
            }),
        })
    }

    /// The configuration this pool was opened with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquire a connection, waiting at most the configured `acquire_timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Error::PoolExhausted` if no connection frees up in time.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_timeout(self.inner.config.acquire_timeout)
            .await
    }

    /// Acquire a connection, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Error::PoolExhausted` if no connection frees up in time, or a
    /// database error if a new connection cannot be opened.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Config("connection pool is closed".to_string())),
            Err(_) => {
                tracing::warn!(?timeout, "Timed out waiting for a pooled connection");
                return Err(Error::PoolExhausted { timeout });
            }
        };

        self.retire_idle();

        let reused = self.inner.lock_idle().pop();
        let conn = match reused {
            Some(idle) => idle.conn,
            None => {
                let conn = self.inner.location.open()?;
                self.inner.open.fetch_add(1, Ordering::SeqCst);
                tracing::trace!(open = self.inner.open.load(Ordering::SeqCst), "Opened pooled connection");
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            in_transaction: false,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Return a connection to the pool. Equivalent to dropping the handle.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Close idle connections above `min_connections` that have been idle
    /// for at least `idle_timeout`. Returns how many were closed.
    pub fn retire_idle(&self) -> usize {
        let min = self.inner.config.min_connections;
        let idle_timeout = self.inner.config.idle_timeout;
        let now = Instant::now();
        let mut retired = 0;

        // Oldest entries sit at the front; checkout pops from the back.
        self.inner.lock_idle().retain(|entry| {
            let open = self.inner.open.load(Ordering::SeqCst);
            if open > min && now.duration_since(entry.since) >= idle_timeout {
                self.inner.open.fetch_sub(1, Ordering::SeqCst);
                retired += 1;
                false
            } else {
                true
            }
        });

        if retired > 0 {
            tracing::debug!(retired, "Retired idle connections");
        }
        retired
    }

    /// Spawn a task that periodically retires idle connections.
    ///
    /// The task holds only a weak reference and exits once every `Pool`
    /// handle has been dropped.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let period = (self.inner.config.idle_timeout / 2).max(MIN_REAPER_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => {
                        Pool { inner }.retire_idle();
                    }
                    None => break,
                }
            }
        })
    }

    /// Current occupancy.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            open: self.inner.open.load(Ordering::SeqCst),
            idle: self.inner.lock_idle().len(),
            in_use: self.inner.config.max_connections - self.inner.permits.available_permits(),
        }
    }
}

/// Exclusive handle to a pooled connection.
///
/// Dereferences to [`rusqlite::Connection`] for statements. Transactions are
/// driven explicitly through [`begin`](Self::begin), [`commit`](Self::commit)
/// and [`rollback`](Self::rollback); nesting is rejected. A handle dropped
/// with an open transaction rolls it back before the connection goes back to
/// the pool.
pub struct PooledConnection {
    conn: Option<Connection>,
    in_transaction: bool,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn conn(&self) -> &Connection {
        self.conn
            .as_ref()
            .expect("connection is only taken in Drop")
    }

    /// Returns `true` while a transaction started by [`begin`](Self::begin) is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Start a write transaction.
    ///
    /// # Errors
    ///
    /// Returns `Error::TransactionInProgress` if a transaction is already open
    /// on this connection.
    pub fn begin(&mut self) -> Result<()> {
        if self.in_transaction || !self.conn().is_autocommit() {
            return Err(Error::TransactionInProgress);
        }
        self.conn().execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        Ok(())
    }

    /// Commit the open transaction.
    ///
    /// If the commit itself fails the transaction is rolled back so the
    /// connection is never left half-open.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` without an open transaction, or the
    /// database error that made the commit fail.
    pub fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::Validation(
                "commit called without an open transaction".to_string(),
            ));
        }
        let result = self.conn().execute_batch("COMMIT");
        if result.is_err() && !self.conn().is_autocommit() {
            if let Err(e) = self.conn().execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "Rollback after failed commit also failed");
            }
        }
        self.in_transaction = false;
        result.map_err(Error::from)
    }

    /// Roll back the open transaction.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` without an open transaction.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::Validation(
                "rollback called without an open transaction".to_string(),
            ));
        }
        self.in_transaction = false;
        self.conn().execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Run `f` inside a transaction, committing on `Ok` and rolling back on `Err`.
    ///
    /// # Errors
    ///
    /// Propagates errors from `begin`, from `f`, or from `commit`.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.begin()?;
        let outcome = f(self.conn());
        match outcome {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback() {
                    tracing::warn!(error = %rollback_err, "Rollback after failed transaction also failed");
                }
                Err(e)
            }
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if self.in_transaction || !conn.is_autocommit() {
            tracing::warn!("Pooled connection released with an open transaction; rolling back");
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "Rollback on release failed; discarding connection");
                self.pool.open.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }

        self.pool.lock_idle().push(IdleConnection {
            conn,
            since: Instant::now(),
        });
        // `_permit` is released after this body, once the connection is back.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory_pool(min: usize, max: usize) -> Pool {
        Pool::open(
            StoreLocation::unique_memory(),
            PoolConfig {
                min_connections: min,
                max_connections: max,
                acquire_timeout: Duration::from_millis(50),
                idle_timeout: Duration::from_millis(20),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        let config = PoolConfig {
            min_connections: 3,
            max_connections: 2,
            ..PoolConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = PoolConfig {
            min_connections: 0,
            max_connections: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_min_connections_opened_eagerly() {
        let pool = memory_pool(2, 4);
        let status = pool.status();
        assert_eq!(status.open, 2);
        assert_eq!(status.idle, 2);
        assert_eq!(status.in_use, 0);
    }

    #[tokio::test]
    async fn test_acquire_and_release_reuses_connection() {
        let pool = memory_pool(1, 2);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.status().in_use, 1);
        pool.release(conn);

        let status = pool.status();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.open, 1);
        assert_eq!(status.idle, 1);
    }

    #[tokio::test]
    async fn test_acquire_beyond_max_times_out() {
        let pool = memory_pool(0, 1);
        let _held = pool.acquire().await.unwrap();

        let err = pool
            .acquire_timeout(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_release_wakes_waiters_in_fifo_order() {
        let pool = memory_pool(0, 1);
        let held = pool.acquire().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut waiters = Vec::new();
        for id in 0..3 {
            let pool = pool.clone();
            let tx = tx.clone();
            waiters.push(tokio::spawn(async move {
                let conn = pool.acquire_timeout(Duration::from_secs(5)).await.unwrap();
                tx.send(id).unwrap();
                drop(conn);
            }));
            // Let each waiter enqueue before spawning the next one.
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(rx.try_recv().is_err(), "no waiter may proceed while the connection is held");
        drop(held);

        for waiter in waiters {
            waiter.await.unwrap();
        }
        let order: Vec<i32> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_nested_begin_is_rejected() {
        let pool = memory_pool(1, 1);
        let mut conn = pool.acquire().await.unwrap();

        conn.begin().unwrap();
        assert!(matches!(conn.begin(), Err(Error::TransactionInProgress)));
        conn.rollback().unwrap();
        assert!(!conn.in_transaction());
        assert!(matches!(conn.commit(), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_transaction_closure_rolls_back_on_error() {
        let pool = memory_pool(1, 1);
        let mut conn = pool.acquire().await.unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();

        let result: Result<()> = conn.transaction(|c| {
            c.execute("INSERT INTO t (v) VALUES (1)", [])?;
            Err(Error::Validation("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back() {
        let pool = memory_pool(1, 1);
        let mut conn = pool.acquire().await.unwrap();
        conn.execute_batch(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY);
             CREATE TABLE child (parent_id INTEGER REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED);",
        )
        .unwrap();

        conn.begin().unwrap();
        conn.execute("INSERT INTO child (parent_id) VALUES (42)", []).unwrap();
        assert!(matches!(conn.commit(), Err(Error::Database(_))));

        assert!(!conn.in_transaction());
        assert!(conn.is_autocommit());
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM child", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
        conn.begin().unwrap();
        conn.rollback().unwrap();
    }

    #[tokio::test]
    async fn test_drop_mid_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let pool = Pool::open(
            StoreLocation::File(dir.path().join("store.db")),
            PoolConfig::default(),
        )
        .unwrap();

        {
            let mut conn = pool.acquire().await.unwrap();
            conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();
            conn.begin().unwrap();
            conn.execute("INSERT INTO t (v) VALUES (1)", []).unwrap();
        }

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_autocommit());
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_idle_connections_above_min_are_retired() {
        let pool = memory_pool(1, 3);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.status().open, 3);
        drop((a, b, c));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pool.retire_idle(), 2);

        let status = pool.status();
        assert_eq!(status.open, 1);
        assert_eq!(status.idle, 1);
    }
}
