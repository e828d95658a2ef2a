//! Bounded connection pool.
//!
//! [`ConnectionPool`] is generic over a [`ManageConnection`] connector so the
//! same accounting drives real dialect sessions and the fake connectors used
//! in tests.
//!
//! # Concurrency Safety
//!
//! ## Size accounting
//! - `open`, the idle set and the in-use registry live under one
//!   `std::sync::Mutex`, which is never held across an `.await`
//! - A connect slot is reserved under the lock before connecting, so the
//!   number of live sockets never exceeds `max_size`
//! - A closed connection gives its slot back only after `close` finishes
//!
//! ## Cancellation
//! - A slot reserved for a connect attempt is returned by [`SlotReservation`]
//!   if the acquiring future is dropped mid-connect
//! - Dropping a [`PoolGuard`] without calling `release` counts as an
//!   unhealthy release, so panics and dropped futures never leak a slot.
//!   The backend session is terminated first, since a statement may still
//!   be running on it
//! - The liveness check on an idle connection is bounded by the connect
//!   timeout and the acquire deadline. A check that does not answer in time
//!   counts as failed
//!
//! ## Waiters
//! - Waiters park on a `Notify`. `notify_one` stores a permit, so a release
//!   that lands between the size check and the wait is not lost

use crate::error::{DbError, DbResult};
use crate::models::BackendConfig;
use schemars::JsonSchema;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

/// Opens, checks and closes connections for a [`ConnectionPool`].
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn connect(&self) -> impl Future<Output = DbResult<Self::Connection>> + Send;

    /// Cheap liveness check run before an idle connection is reused.
    fn is_valid(&self, conn: &mut Self::Connection) -> impl Future<Output = bool> + Send;

    fn close(&self, conn: Self::Connection) -> impl Future<Output = ()> + Send;

    /// Backend session identifier used to terminate the session from outside.
    fn session_id(&self, conn: &Self::Connection) -> Option<u64>;

    /// Force-close a session that is still checked out.
    fn terminate(&self, session_id: u64) -> impl Future<Output = DbResult<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_size: usize,
    pub connect_timeout: Duration,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub test_before_acquire: bool,
}

impl PoolSettings {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            max_size: config.max_pool_size.max(1) as usize,
            connect_timeout: config.connect_timeout,
            acquire_timeout: config.acquire_timeout,
            idle_timeout: config.idle_timeout,
            test_before_acquire: config.test_before_acquire,
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
pub struct PoolStats {
    /// Live connections, idle or checked out
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_size: usize,
    pub closed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionMeta {
    /// Pool-local identifier
    pub id: u64,
    pub created_at: Instant,
    pub last_used: Instant,
    pub in_use: bool,
    pub session_id: Option<u64>,
}

/// A live connection plus its bookkeeping.
pub struct PooledConnection<C> {
    conn: C,
    meta: ConnectionMeta,
}

impl<C> PooledConnection<C> {
    fn new(id: u64, conn: C, session_id: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            conn,
            meta: ConnectionMeta {
                id,
                created_at: now,
                last_used: now,
                in_use: true,
                session_id,
            },
        }
    }
}

struct PoolState<C> {
    /// Most recently used at the back
    idle: VecDeque<PooledConnection<C>>,
    open: usize,
    closed: bool,
    /// Checked-out connection id -> session id
    in_use: HashMap<u64, Option<u64>>,
    next_id: u64,
}

struct PoolInner<M: ManageConnection> {
    backend_id: String,
    manager: M,
    settings: PoolSettings,
    state: Mutex<PoolState<M::Connection>>,
    /// Woken when a slot or idle connection becomes available.
    available: Notify,
    /// Woken when a checked-out connection comes back.
    returned: Notify,
}

impl<M: ManageConnection> PoolInner<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(self: &Arc<Self>, mut pooled: PooledConnection<M::Connection>, healthy: bool) {
        let mut state = self.lock();
        state.in_use.remove(&pooled.meta.id);

        if healthy && !state.closed {
            pooled.meta.in_use = false;
            pooled.meta.last_used = Instant::now();
            state.idle.push_back(pooled);
            drop(state);
            self.available.notify_one();
        } else {
            drop(state);
            debug!(
                backend_id = %self.backend_id,
                connection_id = pooled.meta.id,
                "Discarding connection"
            );
            self.discard(pooled.conn);
        }
        self.returned.notify_waiters();
    }

    /// A guard was dropped while checked out. Terminate the backend session
    /// from a side connection, then close and free the slot.
    fn abandon(self: &Arc<Self>, pooled: PooledConnection<M::Connection>) {
        self.lock().in_use.remove(&pooled.meta.id);
        let connection_id = pooled.meta.id;
        let session_id = pooled.meta.session_id;
        debug!(
            backend_id = %self.backend_id,
            connection_id,
            session_id = ?session_id,
            "Connection dropped while checked out"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move {
                    if let Some(session_id) = session_id {
                        if let Err(e) = inner.manager.terminate(session_id).await {
                            warn!(
                                backend_id = %inner.backend_id,
                                connection_id,
                                session_id,
                                error = %e,
                                "Failed to terminate abandoned session"
                            );
                        }
                    }
                    inner.manager.close(pooled.conn).await;
                    inner.slot_freed();
                });
            }
            Err(_) => {
                drop(pooled);
                self.slot_freed();
            }
        }
        self.returned.notify_waiters();
    }

    /// Close a connection off the caller's task. The slot frees once the
    /// close finishes.
    fn discard(self: &Arc<Self>, conn: M::Connection) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move {
                    inner.manager.close(conn).await;
                    inner.slot_freed();
                });
            }
            Err(_) => {
                drop(conn);
                self.slot_freed();
            }
        }
    }

    fn slot_freed(&self) {
        {
            let mut state = self.lock();
            state.open = state.open.saturating_sub(1);
        }
        self.available.notify_one();
    }
}

/// Returns a reserved connect slot unless disarmed.
struct SlotReservation<'a, M: ManageConnection> {
    inner: &'a Arc<PoolInner<M>>,
    armed: bool,
}

impl<M: ManageConnection> SlotReservation<'_, M> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<M: ManageConnection> Drop for SlotReservation<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.slot_freed();
        }
    }
}

enum AcquireStep<C> {
    Reuse(PooledConnection<C>),
    Connect(u64),
    Wait,
}

/// A bounded pool of connections for one backend.
pub struct ConnectionPool<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    pub fn new(backend_id: impl Into<String>, manager: M, settings: PoolSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                backend_id: backend_id.into(),
                manager,
                settings,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    open: 0,
                    closed: false,
                    in_use: HashMap::new(),
                    next_id: 1,
                }),
                available: Notify::new(),
                returned: Notify::new(),
            }),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.inner.backend_id
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Check out a connection, waiting up to `acquire_timeout` for one.
    pub async fn acquire(&self) -> DbResult<PoolGuard<M>> {
        let started = Instant::now();
        let deadline = started + self.inner.settings.acquire_timeout;

        loop {
            let step = {
                let mut state = self.inner.lock();
                if state.closed {
                    return Err(self.closed_error());
                }
                if let Some(mut pooled) = state.idle.pop_back() {
                    pooled.meta.in_use = true;
                    state.in_use.insert(pooled.meta.id, pooled.meta.session_id);
                    AcquireStep::Reuse(pooled)
                } else if state.open < self.inner.settings.max_size {
                    state.open += 1;
                    let id = state.next_id;
                    state.next_id += 1;
                    AcquireStep::Connect(id)
                } else {
                    AcquireStep::Wait
                }
            };

            match step {
                AcquireStep::Reuse(pooled) => {
                    let mut guard = PoolGuard::new(Arc::clone(&self.inner), pooled);
                    if !self.inner.settings.test_before_acquire {
                        return Ok(guard);
                    }
                    let budget = self
                        .inner
                        .settings
                        .connect_timeout
                        .min(deadline.saturating_duration_since(Instant::now()));
                    let valid = timeout(budget, self.inner.manager.is_valid(&mut *guard))
                        .await
                        .unwrap_or(false);
                    if valid {
                        return Ok(guard);
                    }
                    warn!(
                        backend_id = %self.inner.backend_id,
                        connection_id = guard.meta().id,
                        "Idle connection failed liveness check, discarding"
                    );
                    guard.release(false);
                }
                AcquireStep::Connect(id) => return self.open_connection(id).await,
                AcquireStep::Wait => {
                    tokio::select! {
                        _ = self.inner.available.notified() => {}
                        _ = sleep_until(deadline) => {
                            let waited_ms = started.elapsed().as_millis() as u64;
                            warn!(
                                backend_id = %self.inner.backend_id,
                                elapsed_ms = waited_ms,
                                "Connection pool exhausted"
                            );
                            return Err(DbError::pool_exhausted(
                                self.inner.backend_id.clone(),
                                waited_ms,
                            ));
                        }
                    }
                }
            }
        }
    }

    async fn open_connection(&self, id: u64) -> DbResult<PoolGuard<M>> {
        let reservation = SlotReservation {
            inner: &self.inner,
            armed: true,
        };
        let connect_timeout = self.inner.settings.connect_timeout;

        let conn = match timeout(connect_timeout, self.inner.manager.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DbError::connection_failed(
                    format!(
                        "Timed out connecting to backend '{}' after {}s",
                        self.inner.backend_id,
                        connect_timeout.as_secs()
                    ),
                    "Check that the database host is reachable or raise the connect timeout",
                ));
            }
        };

        let session_id = self.inner.manager.session_id(&conn);
        reservation.disarm();
        let pooled = PooledConnection::new(id, conn, session_id);

        let closed = {
            let mut state = self.inner.lock();
            if !state.closed {
                state.in_use.insert(id, session_id);
            }
            state.closed
        };
        if closed {
            self.inner.discard(pooled.conn);
            return Err(self.closed_error());
        }

        debug!(
            backend_id = %self.inner.backend_id,
            connection_id = id,
            session_id = ?session_id,
            "Opened new connection"
        );
        Ok(PoolGuard::new(Arc::clone(&self.inner), pooled))
    }

    fn closed_error(&self) -> DbError {
        DbError::connection_failed(
            format!("Connection pool for '{}' is shut down", self.inner.backend_id),
            "The server is shutting down",
        )
    }

    /// Close idle connections unused for longer than `idle_timeout`.
    /// Returns how many were closed.
    pub async fn reap_idle(&self) -> usize {
        let Some(idle_timeout) = self.inner.settings.idle_timeout else {
            return 0;
        };

        let expired: VecDeque<_> = {
            let mut state = self.inner.lock();
            let now = Instant::now();
            let (keep, expired): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|p| now.saturating_duration_since(p.meta.last_used) < idle_timeout);
            state.idle = keep;
            expired
        };

        let count = expired.len();
        for pooled in expired {
            self.inner.manager.close(pooled.conn).await;
            self.inner.slot_freed();
        }
        if count > 0 {
            debug!(
                backend_id = %self.inner.backend_id,
                closed = count,
                "Reaped idle connections"
            );
        }
        count
    }

    /// Close the pool. Idle connections close immediately; checked-out ones
    /// get `grace` to come back before their sessions are terminated.
    /// Returns the number of sessions force-terminated.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let idle: Vec<_> = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.inner.available.notify_waiters();

        for pooled in idle {
            self.inner.manager.close(pooled.conn).await;
            self.inner.slot_freed();
        }

        let deadline = Instant::now() + grace;
        loop {
            let returned = self.inner.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();

            if self.inner.lock().in_use.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = returned => {}
                _ = sleep_until(deadline) => {}
            }
        }

        let stragglers: Vec<(u64, Option<u64>)> = self
            .inner
            .lock()
            .in_use
            .iter()
            .map(|(id, session)| (*id, *session))
            .collect();

        let mut terminated = 0;
        for (connection_id, session_id) in stragglers {
            let Some(session_id) = session_id else {
                warn!(
                    backend_id = %self.inner.backend_id,
                    connection_id,
                    "Connection still in use after grace period, no session id to terminate"
                );
                continue;
            };
            match self.inner.manager.terminate(session_id).await {
                Ok(()) => {
                    terminated += 1;
                    info!(
                        backend_id = %self.inner.backend_id,
                        connection_id,
                        session_id,
                        "Terminated session still in use after grace period"
                    );
                }
                Err(e) => warn!(
                    backend_id = %self.inner.backend_id,
                    connection_id,
                    session_id,
                    error = %e,
                    "Failed to terminate session"
                ),
            }
        }
        terminated
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            open: state.open,
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            max_size: self.inner.settings.max_size,
            closed: state.closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl<M: ManageConnection> std::fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("backend_id", &self.inner.backend_id)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Exclusive handle to a checked-out connection.
///
/// Call [`PoolGuard::release`] with the connection's health when done.
/// Dropping the guard instead discards the connection.
pub struct PoolGuard<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
    conn: Option<PooledConnection<M::Connection>>,
}

impl<M: ManageConnection> PoolGuard<M> {
    fn new(inner: Arc<PoolInner<M>>, conn: PooledConnection<M::Connection>) -> Self {
        Self {
            inner,
            conn: Some(conn),
        }
    }

    pub fn meta(&self) -> ConnectionMeta {
        self.pooled().meta
    }

    pub fn backend_id(&self) -> &str {
        &self.inner.backend_id
    }

    /// Hand the connection back. Healthy connections return to the idle set;
    /// unhealthy ones are closed.
    pub fn release(mut self, healthy: bool) {
        if let Some(pooled) = self.conn.take() {
            self.inner.give_back(pooled, healthy);
        }
    }

    fn pooled(&self) -> &PooledConnection<M::Connection> {
        self.conn
            .as_ref()
            .expect("PoolGuard connection missing (already released)")
    }
}

impl<M: ManageConnection> Deref for PoolGuard<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.pooled().conn
    }
}

impl<M: ManageConnection> DerefMut for PoolGuard<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .conn
            .as_mut()
            .expect("PoolGuard connection missing (already released)")
            .conn
    }
}

impl<M: ManageConnection> Drop for PoolGuard<M> {
    fn drop(&mut self) {
        if let Some(pooled) = self.conn.take() {
            self.inner.abandon(pooled);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    /// Connector that counts live connections instead of opening sockets.
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub live: Arc<AtomicUsize>,
        pub peak: Arc<AtomicUsize>,
        pub next_session: AtomicU64,
        pub fail_connect: AtomicBool,
        pub invalid: AtomicBool,
        pub hang_is_valid: AtomicBool,
        pub connect_delay: Duration,
        pub terminated: Mutex<Vec<u64>>,
    }

    pub(crate) struct FakeConn {
        pub session: u64,
    }

    impl ManageConnection for FakeConnector {
        type Connection = FakeConn;

        async fn connect(&self) -> DbResult<FakeConn> {
            if !self.connect_delay.is_zero() {
                tokio::time::sleep(self.connect_delay).await;
            }
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(DbError::connection_failed("refused", "check host"));
            }
            let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let session = self.next_session.fetch_add(1, Ordering::SeqCst) + 100;
            Ok(FakeConn { session })
        }

        async fn is_valid(&self, _conn: &mut FakeConn) -> bool {
            if self.hang_is_valid.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            !self.invalid.load(Ordering::SeqCst)
        }

        async fn close(&self, _conn: FakeConn) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }

        fn session_id(&self, conn: &FakeConn) -> Option<u64> {
            Some(conn.session)
        }

        async fn terminate(&self, session_id: u64) -> DbResult<()> {
            self.terminated.lock().unwrap().push(session_id);
            Ok(())
        }
    }

    pub(crate) fn settings(max_size: usize, acquire_ms: u64) -> PoolSettings {
        PoolSettings {
            max_size,
            connect_timeout: Duration::from_secs(1),
            acquire_timeout: Duration::from_millis(acquire_ms),
            idle_timeout: Some(Duration::from_secs(600)),
            test_before_acquire: true,
        }
    }

    async fn wait_for_open(pool: &ConnectionPool<FakeConnector>, expected: usize) {
        for _ in 0..100 {
            if pool.stats().open == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool never reached open={expected}: {:?}", pool.stats());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_never_exceeds_max() {
        let pool = ConnectionPool::new("fake", FakeConnector::default(), settings(3, 5000));
        let peak = Arc::clone(&pool.manager().peak);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let guard = pool.acquire().await.unwrap();
                assert!(pool.stats().open <= 3);
                tokio::time::sleep(Duration::from_millis(20)).await;
                guard.release(true);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let stats = pool.stats();
        assert!(stats.open <= 3);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_pool_exhausted_after_wait() {
        let pool = ConnectionPool::new("fake", FakeConnector::default(), settings(1, 50));
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    }

    #[tokio::test]
    async fn test_healthy_release_reuses_connection() {
        let pool = ConnectionPool::new("fake", FakeConnector::default(), settings(1, 100));
        let guard = pool.acquire().await.unwrap();
        let session = guard.session;
        guard.release(true);
        assert_eq!(pool.stats().idle, 1);

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.session, session);
    }

    #[tokio::test]
    async fn test_unhealthy_release_frees_slot() {
        let pool = ConnectionPool::new("fake", FakeConnector::default(), settings(1, 1000));
        let guard = pool.acquire().await.unwrap();
        let session = guard.session;
        guard.release(false);

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.session, session);
        assert_eq!(pool.stats().open, 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_is_discarded() {
        let pool = ConnectionPool::new("fake", FakeConnector::default(), settings(2, 100));
        let guard = pool.acquire().await.unwrap();
        let session = guard.session;
        drop(guard);

        wait_for_open(&pool, 0).await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.manager().live.load(Ordering::SeqCst), 0);
        // The session may still be running a statement
        assert_eq!(*pool.manager().terminated.lock().unwrap(), vec![session]);
    }

    #[tokio::test]
    async fn test_cancelled_query_terminates_session() {
        let pool = ConnectionPool::new("fake", FakeConnector::default(), settings(1, 1000));
        let worker = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let guard = pool.acquire().await.unwrap();
                let session = guard.session;
                std::future::pending::<()>().await;
                drop(guard);
                session
            })
        };
        while pool.stats().in_use == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        worker.abort();
        assert!(worker.await.unwrap_err().is_cancelled());

        wait_for_open(&pool, 0).await;
        assert_eq!(pool.manager().terminated.lock().unwrap().len(), 1);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_released_guard_is_not_terminated() {
        let pool = ConnectionPool::new("fake", FakeConnector::default(), settings(1, 100));
        pool.acquire().await.unwrap().release(false);
        wait_for_open(&pool, 0).await;
        assert!(pool.manager().terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_idle_connection_replaced() {
        let pool = ConnectionPool::new("fake", FakeConnector::default(), settings(1, 1000));
        let guard = pool.acquire().await.unwrap();
        let session = guard.session;
        guard.release(true);

        pool.manager().invalid.store(true, Ordering::SeqCst);
        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.session, session);
    }

    #[tokio::test]
    async fn test_hung_liveness_check_is_bounded() {
        let s = PoolSettings {
            max_size: 1,
            connect_timeout: Duration::from_millis(50),
            acquire_timeout: Duration::from_millis(500),
            idle_timeout: None,
            test_before_acquire: true,
        };
        let pool = ConnectionPool::new("fake", FakeConnector::default(), s);
        let guard = pool.acquire().await.unwrap();
        let session = guard.session;
        guard.release(true);

        pool.manager().hang_is_valid.store(true, Ordering::SeqCst);
        let fresh = tokio::time::timeout(Duration::from_secs(2), pool.acquire())
            .await
            .expect("acquire must not outlive its timeouts")
            .unwrap();
        assert_ne!(fresh.session, session);
    }

    #[tokio::test]
    async fn test_hung_liveness_check_respects_acquire_deadline() {
        let s = PoolSettings {
            max_size: 1,
            connect_timeout: Duration::from_millis(50),
            acquire_timeout: Duration::from_millis(50),
            idle_timeout: None,
            test_before_acquire: true,
        };
        let pool = ConnectionPool::new("fake", FakeConnector::default(), s);
        pool.acquire().await.unwrap().release(true);

        pool.manager().hang_is_valid.store(true, Ordering::SeqCst);
        let outcome = tokio::time::timeout(Duration::from_secs(2), pool.acquire()).await;
        assert!(outcome.is_ok(), "acquire still blocked after 2s");
    }

    #[tokio::test]
    async fn test_connect_failure_returns_slot() {
        let connector = FakeConnector::default();
        connector.fail_connect.store(true, Ordering::SeqCst);
        let pool = ConnectionPool::new("fake", connector, settings(1, 100));

        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_returns_slot() {
        let connector = FakeConnector {
            connect_delay: Duration::from_millis(500),
            ..Default::default()
        };
        let pool = ConnectionPool::new("fake", connector, settings(1, 1000));

        let attempt = tokio::time::timeout(Duration::from_millis(10), pool.acquire()).await;
        assert!(attempt.is_err());
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_held_connections() {
        let pool = ConnectionPool::new("fake", FakeConnector::default(), settings(2, 100));
        let held = pool.acquire().await.unwrap();
        let session = held.session;
        let idle = pool.acquire().await.unwrap();
        idle.release(true);

        let terminated = pool.shutdown(Duration::from_millis(30)).await;
        assert_eq!(terminated, 1);
        assert_eq!(*pool.manager().terminated.lock().unwrap(), vec![session]);
        assert!(pool.stats().closed);

        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);

        held.release(true);
        wait_for_open(&pool, 0).await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_release() {
        let pool = ConnectionPool::new("fake", FakeConnector::default(), settings(1, 100));
        let held = pool.acquire().await.unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            held.release(true);
        });

        let terminated = pool.shutdown(Duration::from_secs(2)).await;
        releaser.await.unwrap();
        assert_eq!(terminated, 0);
        assert!(pool.manager().terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reap_idle() {
        let mut s = settings(2, 100);
        s.idle_timeout = Some(Duration::ZERO);
        let pool = ConnectionPool::new("fake", FakeConnector::default(), s);
        pool.acquire().await.unwrap().release(true);
        assert_eq!(pool.stats().idle, 1);

        assert_eq!(pool.reap_idle().await, 1);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.open, 0);
    }
}
