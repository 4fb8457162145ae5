use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::{Connection, ConnectionFactory, SearchScope, ServerEndpoint};
use crate::error::{PtaError, ServiceErrorClassifier};

/// Up/down flag for one pool's server, plus the failure that took it down.
#[derive(Debug)]
pub struct HealthState {
    healthy: AtomicBool,
    last_failure: Mutex<Option<PtaError>>,
}

impl HealthState {
    fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            last_failure: Mutex::new(None),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn last_failure(&self) -> Option<PtaError> {
        self.last_failure.lock().clone()
    }

    fn mark_healthy(&self, endpoint: &ServerEndpoint) {
        if !self.healthy.swap(true, Ordering::AcqRel) {
            info!("Remote LDAP server {} is available again", endpoint);
        }
    }

    fn mark_unhealthy(&self, endpoint: &ServerEndpoint, cause: PtaError) {
        // The cause is written before the flag is published.
        *self.last_failure.lock() = Some(cause.clone());
        if self.healthy.swap(false, Ordering::AcqRel) {
            warn!("Remote LDAP server {} marked unavailable: {}", endpoint, cause);
        }
    }
}

/// Idle connections to a single server, bounded by `max_size` lent at once.
pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    endpoint: ServerEndpoint,
    idle: Mutex<VecDeque<Box<dyn Connection>>>,
    permits: Arc<Semaphore>,
    max_size: usize,
    closed: AtomicBool,
    health: HealthState,
    classifier: Arc<ServiceErrorClassifier>,
}

impl ConnectionPool {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        max_size: usize,
        classifier: Arc<ServiceErrorClassifier>,
    ) -> Self {
        let endpoint = factory.endpoint().clone();
        Self {
            factory,
            endpoint,
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(max_size)),
            max_size,
            closed: AtomicBool::new(false),
            health: HealthState::new(),
            classifier,
        }
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn mark_unhealthy(&self, cause: PtaError) {
        self.health.mark_unhealthy(&self.endpoint, cause);
    }

    /// Lend a connection: an idle one if there is one, otherwise a new one.
    pub async fn get(self: &Arc<Self>) -> Result<PooledConnection, PtaError> {
        if self.is_closed() {
            return Err(PtaError::PoolClosed(self.endpoint.clone()));
        }
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PtaError::PoolClosed(self.endpoint.clone()))?;

        let cached = self.idle.lock().pop_front();
        let connection = match cached {
            Some(connection) => connection,
            None => self.open().await?,
        };

        Ok(PooledConnection {
            connection: Some(connection),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    async fn open(&self) -> Result<Box<dyn Connection>, PtaError> {
        match self.factory.connect().await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                if self.classifier.is_connection_failure(&e) {
                    self.mark_unhealthy(e.clone());
                }
                Err(e)
            }
        }
    }

    /// Open a fresh connection to find out whether the server is usable.
    ///
    /// A successful probe restores the server and keeps the connection idle
    /// in the pool when there is room for it.
    pub async fn probe(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.factory.connect().await {
            Ok(connection) => {
                self.health.mark_healthy(&self.endpoint);
                self.offer(connection).await;
                true
            }
            Err(e) => {
                debug!("Probe of {} failed: {}", self.endpoint, e);
                self.mark_unhealthy(e);
                false
            }
        }
    }

    /// Return a healthy connection to the idle set, or close it when the pool
    /// is closed or full.
    async fn offer(&self, connection: Box<dyn Connection>) {
        if let Some(mut rejected) = self.try_offer(connection) {
            rejected.close().await;
        }
    }

    fn try_offer(&self, connection: Box<dyn Connection>) -> Option<Box<dyn Connection>> {
        let mut idle = self.idle.lock();
        // Checked under the idle lock so close() cannot miss this connection.
        if self.is_closed() || idle.len() >= self.max_size {
            return Some(connection);
        }
        idle.push_back(connection);
        None
    }

    /// Close every idle connection. Connections still lent out are closed
    /// when they come back.
    pub async fn close(&self) {
        let drained: Vec<_> = {
            let mut idle = self.idle.lock();
            self.closed.store(true, Ordering::Release);
            idle.drain(..).collect()
        };
        debug!("Closing {} idle connection(s) to {}", drained.len(), self.endpoint);
        for mut connection in drained {
            connection.close().await;
        }
    }
}

/// A connection lent by a [`ConnectionPool`].
///
/// Dropping it returns the connection to the pool; [`PooledConnection::release`]
/// does the same and awaits the close when the pool has shut down.
pub struct PooledConnection {
    connection: Option<Box<dyn Connection>>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn endpoint(&self) -> &ServerEndpoint {
        self.pool.endpoint()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    fn live(&mut self) -> Result<&mut Box<dyn Connection>, PtaError> {
        let endpoint = self.pool.endpoint.clone();
        self.connection.as_mut().ok_or_else(|| {
            PtaError::connection(
                &endpoint,
                crate::error::ResultCode::ClientSideServerDown,
                "connection was discarded after a failure",
            )
        })
    }

    pub async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<(), PtaError> {
        let first = self.live()?.simple_bind(dn, password).await;
        let Err(e) = first else {
            return Ok(());
        };
        self.reconnect_if_connection_failure(e).await?;

        let second = self.live()?.simple_bind(dn, password).await;
        if let Err(e) = &second {
            self.close_if_connection_failure(e).await;
        }
        second
    }

    pub async fn search(
        &mut self,
        base_dn: &str,
        scope: SearchScope,
        filter: &str,
    ) -> Result<String, PtaError> {
        let first = self.live()?.search(base_dn, scope, filter).await;
        let e = match first {
            Ok(dn) => return Ok(dn),
            Err(e) => e,
        };
        self.reconnect_if_connection_failure(e).await?;

        let second = self.live()?.search(base_dn, scope, filter).await;
        if let Err(e) = &second {
            self.close_if_connection_failure(e).await;
        }
        second
    }

    /// Pass non-connection failures straight back. Otherwise replace the
    /// failed connection with a fresh one so the operation can be retried
    /// exactly once.
    async fn reconnect_if_connection_failure(&mut self, e: PtaError) -> Result<(), PtaError> {
        if !self.pool.classifier.is_connection_failure(&e) {
            return Err(e);
        }
        debug!("Connection to {} failed, retrying on a new connection: {}", self.pool.endpoint, e);
        self.discard().await;
        let fresh = self.pool.open().await?;
        self.connection = Some(fresh);
        Ok(())
    }

    async fn close_if_connection_failure(&mut self, e: &PtaError) {
        if self.pool.classifier.is_connection_failure(e) {
            self.discard().await;
        }
    }

    async fn discard(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
    }

    /// Give the connection back to the pool, or close it if the pool has
    /// been closed meanwhile.
    pub async fn release(mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.offer(connection).await;
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if let Some(mut rejected) = self.pool.try_offer(connection) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { rejected.close().await });
                }
                Err(_) => debug!("No runtime to close a connection to {}; dropping it", self.pool.endpoint),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_err, assert_ok};

    /// Connections that fail their first `failures` operations.
    struct FlakyFactory {
        endpoint: ServerEndpoint,
        connects: AtomicUsize,
        closes: Arc<AtomicUsize>,
        op_failures: Arc<AtomicUsize>,
        refuse: AtomicBool,
    }

    struct FlakyConnection {
        op_failures: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        endpoint: ServerEndpoint,
    }

    #[async_trait]
    impl Connection for FlakyConnection {
        async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<(), PtaError> {
            if self
                .op_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PtaError::protocol(&self.endpoint, ResultCode::Unavailable, "down"));
            }
            if password == "password" {
                Ok(())
            } else {
                Err(PtaError::Credentials {
                    identity: dn.to_string(),
                })
            }
        }

        async fn search(&mut self, _: &str, _: SearchScope, _: &str) -> Result<String, PtaError> {
            Err(PtaError::protocol(&self.endpoint, ResultCode::TimeLimitExceeded, "slow"))
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ConnectionFactory for FlakyFactory {
        fn endpoint(&self) -> &ServerEndpoint {
            &self.endpoint
        }

        async fn connect(&self) -> Result<Box<dyn Connection>, PtaError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(PtaError::connection(&self.endpoint, ResultCode::ClientSideConnectError, "refused"));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakyConnection {
                op_failures: self.op_failures.clone(),
                closes: self.closes.clone(),
                endpoint: self.endpoint.clone(),
            }))
        }
    }

    fn pool(op_failures: usize) -> (Arc<FlakyFactory>, Arc<ConnectionPool>) {
        let factory = Arc::new(FlakyFactory {
            endpoint: ServerEndpoint::new("remote", 389),
            connects: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            op_failures: Arc::new(AtomicUsize::new(op_failures)),
            refuse: AtomicBool::new(false),
        });
        let pool = Arc::new(ConnectionPool::new(
            factory.clone(),
            4,
            Arc::new(ServiceErrorClassifier::default()),
        ));
        (factory, pool)
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let (factory, pool) = pool(0);

        let mut conn = pool.get().await.unwrap();
        assert_ok!(conn.simple_bind("cn=user", "password").await);
        conn.release().await;
        assert_eq!(pool.idle_count(), 1);

        let mut conn = pool.get().await.unwrap();
        assert_err!(conn.simple_bind("cn=user", "wrong").await);
        drop(conn);

        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_single_retry_on_connection_failure() {
        let (factory, pool) = pool(1);

        let mut conn = pool.get().await.unwrap();
        assert_ok!(conn.simple_bind("cn=user", "password").await);
        conn.release().await;

        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
        assert_eq!(factory.closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 1);
        assert!(pool.is_healthy());
    }

    #[tokio::test]
    async fn test_second_failure_discards_connection() {
        let (factory, pool) = pool(2);

        let mut conn = pool.get().await.unwrap();
        let err = conn.simple_bind("cn=user", "password").await.unwrap_err();
        assert_eq!(err.result_code(), ResultCode::Unavailable);
        conn.release().await;

        // Exactly one retry: two connections opened, both closed, none kept.
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
        assert_eq!(factory.closes.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let (factory, pool) = pool(0);

        let mut conn = pool.get().await.unwrap();
        let err = conn
            .search("o=ad", SearchScope::WholeSubtree, "(uid=aduser)")
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::TimeLimitExceeded);
        conn.release().await;

        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_failure_marks_unhealthy() {
        let (factory, pool) = pool(1);

        let mut conn = pool.get().await.unwrap();
        factory.refuse.store(true, Ordering::SeqCst);
        let err = conn.simple_bind("cn=user", "password").await.unwrap_err();
        assert_eq!(err.result_code(), ResultCode::ClientSideConnectError);
        conn.release().await;

        assert!(!pool.is_healthy());
        assert!(pool.health().last_failure().is_some());
        assert_eq!(pool.idle_count(), 0);

        factory.refuse.store(false, Ordering::SeqCst);
        assert!(pool.probe().await);
        assert!(pool.is_healthy());
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_release_after_close_closes_connection() {
        let (factory, pool) = pool(0);

        let conn = pool.get().await.unwrap();
        pool.close().await;
        conn.release().await;

        assert_eq!(factory.closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 0);
        assert!(matches!(pool.get().await, Err(PtaError::PoolClosed(_))));
    }
}
