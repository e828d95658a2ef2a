//! Pool manager.
//!
//! Owns one [`ConnectionPool`] per configured backend. The set of backends
//! is fixed at construction; pools connect lazily on first use.
//!
//! # Concurrency Safety
//!
//! - The backend map is immutable after construction, so lookups take no lock
//! - Each pool does its own accounting (see [`crate::db::pool`])
//! - The reaper task holds only a `Weak` reference and exits once the
//!   manager is dropped
//! - The reaper handle is stored in a `std::sync::Mutex` so it can be aborted
//!   from synchronous code

use crate::db::dialect::DialectConnection;
use crate::db::pool::{ConnectionPool, ManageConnection, PoolGuard, PoolSettings, PoolStats};
use crate::error::{DbError, DbResult};
use crate::models::BackendConfig;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Opens real dialect sessions for one backend.
#[derive(Debug, Clone)]
pub struct DialectConnector {
    config: Arc<BackendConfig>,
}

impl DialectConnector {
    pub fn new(config: Arc<BackendConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }
}

impl ManageConnection for DialectConnector {
    type Connection = DialectConnection;

    async fn connect(&self) -> DbResult<DialectConnection> {
        let conn = DialectConnection::connect(&self.config).await?;
        debug!(
            backend_id = %self.config.id,
            session_id = ?conn.session_id(),
            "Opened backend session"
        );
        Ok(conn)
    }

    async fn is_valid(&self, conn: &mut DialectConnection) -> bool {
        conn.ping().await.is_ok()
    }

    async fn close(&self, conn: DialectConnection) {
        conn.close().await;
    }

    fn session_id(&self, conn: &DialectConnection) -> Option<u64> {
        conn.session_id()
    }

    async fn terminate(&self, session_id: u64) -> DbResult<()> {
        DialectConnection::terminate(&self.config, session_id).await
    }
}

/// Checked-out connection to a configured backend.
pub type BackendGuard = PoolGuard<DialectConnector>;

/// Registry of backend pools, keyed by backend id.
pub struct PoolManager {
    pools: BTreeMap<String, ConnectionPool<DialectConnector>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    /// Build one pool per backend. Duplicate ids are rejected.
    pub fn new(configs: Vec<BackendConfig>) -> DbResult<Self> {
        let mut pools = BTreeMap::new();
        for config in configs {
            if pools.contains_key(&config.id) {
                return Err(DbError::config(format!(
                    "Duplicate backend id '{}'",
                    config.id
                )));
            }
            let settings = PoolSettings::from_config(&config);
            let id = config.id.clone();
            let connector = DialectConnector::new(Arc::new(config));
            pools.insert(id.clone(), ConnectionPool::new(id, connector, settings));
        }
        Ok(Self {
            pools,
            reaper: Mutex::new(None),
        })
    }

    fn pool(&self, backend_id: &str) -> DbResult<&ConnectionPool<DialectConnector>> {
        self.pools
            .get(backend_id)
            .ok_or_else(|| DbError::backend_not_found(backend_id))
    }

    /// Check out a connection. Unknown ids give `NotFound`.
    pub async fn acquire(&self, backend_id: &str) -> DbResult<BackendGuard> {
        self.pool(backend_id)?.acquire().await
    }

    pub fn backend(&self, backend_id: &str) -> DbResult<&BackendConfig> {
        Ok(self.pool(backend_id)?.manager().config())
    }

    /// All backends, ordered by id.
    pub fn backends(&self) -> impl Iterator<Item = &BackendConfig> {
        self.pools.values().map(|p| p.manager().config())
    }

    pub fn stats(&self, backend_id: &str) -> DbResult<PoolStats> {
        Ok(self.pool(backend_id)?.stats())
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Open and return one connection per backend so configuration problems
    /// show up at startup. Failures are logged, never fatal.
    pub async fn warm_up(&self) {
        for (id, pool) in &self.pools {
            match pool.acquire().await {
                Ok(guard) => {
                    info!(
                        backend_id = %id,
                        target = %pool.manager().config().masked_url(),
                        "Backend reachable"
                    );
                    guard.release(true);
                }
                Err(e) => warn!(
                    backend_id = %id,
                    kind = %e.kind(),
                    error = %e,
                    "Backend not reachable at startup"
                ),
            }
        }
    }

    /// Spawn the idle reaper. Calling this twice replaces the old task.
    pub fn start_reaper(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            Self::reaper_task(weak, interval).await;
        });
        let previous = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn reaper_task(weak: Weak<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            let Some(manager) = weak.upgrade() else {
                info!("Pool manager dropped, reaper exiting");
                return;
            };

            for (id, pool) in &manager.pools {
                let closed = pool.reap_idle().await;
                if closed > 0 {
                    debug!(backend_id = %id, closed, "Closed idle connections");
                }
            }

            // Release the strong reference before sleeping
            drop(manager);
        }
    }

    /// Shut every pool down, giving checked-out connections `grace` to come
    /// back. Returns the number of sessions force-terminated.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let shutdowns = self.pools.values().map(|pool| pool.shutdown(grace));
        let terminated: usize = futures_util::future::join_all(shutdowns)
            .await
            .into_iter()
            .sum();
        info!(
            backends = self.pools.len(),
            terminated, "All backend pools shut down"
        );
        terminated
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        if let Some(handle) = self
            .reaper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("backends", &self.pools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{BackendKind, Credentials};

    fn backend(id: &str, kind: BackendKind) -> BackendConfig {
        BackendConfig::new(
            id,
            kind,
            "127.0.0.1",
            kind.default_port(),
            Credentials::new("app", Some("secret".into())),
        )
        .unwrap()
        .with_database("shop")
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = PoolManager::new(vec![
            backend("main", BackendKind::PostgreSQL),
            backend("main", BackendKind::MySQL),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(err.to_string().contains("main"));
    }

    #[test]
    fn test_backends_ordered_and_looked_up() {
        let manager = PoolManager::new(vec![
            backend("reports", BackendKind::MySQL),
            backend("analytics", BackendKind::PostgreSQL),
        ])
        .unwrap();

        let ids: Vec<_> = manager.backends().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["analytics", "reports"]);
        assert_eq!(manager.len(), 2);
        assert_eq!(
            manager.backend("reports").unwrap().kind,
            BackendKind::MySQL
        );

        let stats = manager.stats("analytics").unwrap();
        assert_eq!(stats.open, 0);
        assert!(!stats.closed);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_not_found() {
        let manager = PoolManager::new(vec![backend("main", BackendKind::PostgreSQL)]).unwrap();
        let err = manager.acquire("missing").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(manager.stats("missing").is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_pool() {
        let manager = Arc::new(
            PoolManager::new(vec![
                backend("a", BackendKind::PostgreSQL),
                backend("b", BackendKind::MySQL),
            ])
            .unwrap(),
        );
        manager.start_reaper(Duration::from_secs(60));

        let terminated = manager.shutdown(Duration::from_millis(10)).await;
        assert_eq!(terminated, 0);
        assert!(manager.stats("a").unwrap().closed);
        assert!(manager.stats("b").unwrap().closed);

        let err = manager.acquire("a").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    }
}
