use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::pool::{ConnectionPool, PooledConnection};
use super::SearchScope;
use crate::error::{PtaError, ResultCode, ServiceErrorClassifier};

/// Round robin over the healthy pools of one server list.
pub struct LoadBalancer {
    pools: Vec<Arc<ConnectionPool>>,
    next: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(pools: Vec<Arc<ConnectionPool>>) -> Self {
        Self {
            pools,
            next: AtomicUsize::new(0),
        }
    }

    pub fn pools(&self) -> &[Arc<ConnectionPool>] {
        &self.pools
    }

    /// Healthy pools in configured order, starting at the cursor. Every call
    /// advances the cursor by one.
    pub fn rotation(&self) -> Vec<Arc<ConnectionPool>> {
        if self.pools.is_empty() {
            return Vec::new();
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.pools.len();
        (0..self.pools.len())
            .map(|i| &self.pools[(start + i) % self.pools.len()])
            .filter(|pool| pool.is_healthy())
            .cloned()
            .collect()
    }

    async fn close(&self) {
        for pool in &self.pools {
            pool.close().await;
        }
    }
}

/// A primary server list with an optional secondary list that is only used
/// while no primary server is healthy.
pub struct FailoverGroup {
    primary: LoadBalancer,
    secondary: Option<LoadBalancer>,
    classifier: Arc<ServiceErrorClassifier>,
}

impl FailoverGroup {
    pub fn new(
        primary: LoadBalancer,
        secondary: Option<LoadBalancer>,
        classifier: Arc<ServiceErrorClassifier>,
    ) -> Self {
        let secondary = secondary.filter(|lb| !lb.pools.is_empty());
        Self {
            primary,
            secondary,
            classifier,
        }
    }

    /// Every pool, primary first.
    pub fn pools(&self) -> impl Iterator<Item = &Arc<ConnectionPool>> {
        self.primary
            .pools()
            .iter()
            .chain(self.secondary.iter().flat_map(|lb| lb.pools().iter()))
    }

    /// Borrow a connection from the first server that will give one.
    pub async fn get_connection(self: &Arc<Self>) -> Result<FailoverConnection, PtaError> {
        let mut connection = FailoverConnection {
            group: Arc::clone(self),
            candidates: self.primary.rotation().into(),
            secondary_tried: false,
            current: None,
            last_failure: None,
        };
        connection.acquire().await?;
        Ok(connection)
    }

    pub async fn close(&self) {
        self.primary.close().await;
        if let Some(secondary) = &self.secondary {
            secondary.close().await;
        }
    }

    /// The failure reported when no server is left to try.
    fn exhausted(&self, last: Option<PtaError>) -> PtaError {
        let last = last
            .or_else(|| self.pools().find_map(|pool| pool.health().last_failure()))
            .unwrap_or_else(|| {
                let endpoint = self
                    .pools()
                    .next()
                    .map(|pool| pool.endpoint().clone())
                    .unwrap_or_else(|| super::ServerEndpoint::new("", 0));
                PtaError::connection(
                    &endpoint,
                    ResultCode::ClientSideConnectError,
                    "no healthy remote LDAP server",
                )
            });
        PtaError::NoServerAvailable {
            last: Box::new(last),
        }
    }
}

/// A connection that moves on to the next healthy server whenever the
/// current one fails with a connection-class error.
pub struct FailoverConnection {
    group: Arc<FailoverGroup>,
    candidates: VecDeque<Arc<ConnectionPool>>,
    secondary_tried: bool,
    current: Option<PooledConnection>,
    last_failure: Option<PtaError>,
}

impl FailoverConnection {
    fn next_pool(&mut self) -> Option<Arc<ConnectionPool>> {
        loop {
            if let Some(pool) = self.candidates.pop_front() {
                if pool.is_healthy() {
                    return Some(pool);
                }
                continue;
            }
            if self.secondary_tried {
                return None;
            }
            self.secondary_tried = true;
            let secondary = self.group.secondary.as_ref()?;
            debug!("No primary remote LDAP server available, trying secondary servers");
            self.candidates = secondary.rotation().into();
        }
    }

    async fn acquire(&mut self) -> Result<&mut PooledConnection, PtaError> {
        while self.current.is_none() {
            let Some(pool) = self.next_pool() else {
                return Err(self.group.exhausted(self.last_failure.take()));
            };
            match pool.get().await {
                Ok(connection) => self.current = Some(connection),
                Err(e) if self.group.classifier.is_connection_failure(&e) => {
                    pool.mark_unhealthy(e.clone());
                    self.last_failure = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        let group = &self.group;
        self.current
            .as_mut()
            .ok_or_else(|| group.exhausted(None))
    }

    /// Drop the current server after a connection-class failure.
    async fn fail_over(&mut self, e: PtaError) {
        if let Some(connection) = self.current.take() {
            warn!("Remote LDAP server {} failed, trying the next server: {}", connection.endpoint(), e);
            connection.pool().mark_unhealthy(e.clone());
            connection.release().await;
        }
        self.last_failure = Some(e);
    }

    pub fn endpoint(&self) -> Option<&super::ServerEndpoint> {
        self.current.as_ref().map(|c| c.endpoint())
    }

    pub async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<(), PtaError> {
        loop {
            let connection = self.acquire().await?;
            let result = connection.simple_bind(dn, password).await;
            match result {
                Err(e) if self.group.classifier.is_connection_failure(&e) => self.fail_over(e).await,
                other => return other,
            }
        }
    }

    pub async fn search(
        &mut self,
        base_dn: &str,
        scope: SearchScope,
        filter: &str,
    ) -> Result<String, PtaError> {
        loop {
            let connection = self.acquire().await?;
            let result = connection.search(base_dn, scope, filter).await;
            match result {
                Err(e) if self.group.classifier.is_connection_failure(&e) => self.fail_over(e).await,
                other => return other,
            }
        }
    }

    pub async fn release(mut self) {
        if let Some(connection) = self.current.take() {
            connection.release().await;
        }
    }
}
