use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cache::PasswordCache;
use super::mapping::{check_mapped_attributes, IdentityMapper};
use super::{AuthenticationPolicy, AuthenticationPolicyState};
use crate::config::{ConfigError, MappingPolicy, PolicyConfig};
use crate::connection::{
    AuthenticatedConnectionFactory, ConnectionFactory, ConnectionPool, FailoverGroup,
    LoadBalancer, ServerEndpoint,
};
use crate::entry::{Entry, EntryStore, Schema};
use crate::error::{DirectoryError, PtaError, ResultCode, ServiceErrorClassifier};
use crate::monitor::{HealthMonitor, MonitorHandle};
use crate::provider::Provider;

/// Result of one remote validation attempt.
#[derive(Debug, Clone)]
pub enum AuthenticationOutcome {
    Success,
    InvalidCredentials,
    ServiceError(PtaError),
}

impl AuthenticationOutcome {
    fn from_bind(result: Result<(), PtaError>) -> Self {
        match result {
            Ok(()) => AuthenticationOutcome::Success,
            Err(PtaError::Credentials { .. }) => AuthenticationOutcome::InvalidCredentials,
            Err(e) if e.result_code() == ResultCode::NoSuchObject => {
                AuthenticationOutcome::InvalidCredentials
            }
            Err(e) => AuthenticationOutcome::ServiceError(e),
        }
    }
}

/// Builds pass-through policies from configuration.
pub struct PassThroughPolicyFactory {
    provider: Arc<dyn Provider>,
    schema: Arc<dyn Schema>,
    entry_store: Arc<dyn EntryStore>,
}

impl PassThroughPolicyFactory {
    pub fn new(
        provider: Arc<dyn Provider>,
        schema: Arc<dyn Schema>,
        entry_store: Arc<dyn EntryStore>,
    ) -> Self {
        Self {
            provider,
            schema,
            entry_store,
        }
    }

    pub fn is_configuration_acceptable(&self, config: &PolicyConfig) -> Result<(), ConfigError> {
        let mut reasons = match config.validate(|name| self.provider.property(name)) {
            Ok(()) => Vec::new(),
            Err(e) => e.reasons,
        };
        if let Err(e) = check_mapped_attributes(config, self.schema.as_ref()) {
            reasons.push(e);
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { reasons })
        }
    }

    /// Build a policy and start its health monitor. Must be called from
    /// within the runtime the provider's scheduler uses.
    pub fn create_authentication_policy(
        &self,
        config: PolicyConfig,
    ) -> Result<PassThroughPolicy, ConfigError> {
        self.is_configuration_acceptable(&config)?;
        let reject = |reason: String| ConfigError {
            reasons: vec![reason],
        };

        let classifier = Arc::new(config.classifier());

        let search_group = if config.mapping_policy == MappingPolicy::MappedSearch {
            let password = if config.has_search_bind_dn() {
                let source = config.password_source().map_err(reject)?;
                let property = |name: &str| self.provider.property(name);
                Some(source.resolve(&property).map_err(reject)?)
            } else {
                None
            };
            let bind_dn = config.mapped_search_bind_dn.clone();
            Some(self.build_group(&config, &classifier, |factory| {
                let authenticated: Arc<dyn ConnectionFactory> = Arc::new(
                    AuthenticatedConnectionFactory::new(factory, bind_dn.clone(), password.clone()),
                );
                authenticated
            }))
        } else {
            None
        };
        let bind_group = self.build_group(&config, &classifier, |factory| factory);

        let mapper = IdentityMapper::new(&config, self.schema.as_ref(), search_group.clone())
            .map_err(reject)?;

        let cache = config.use_password_caching.then(|| {
            PasswordCache::new(
                config.cached_password_storage_scheme,
                config.cached_password_ttl(),
                self.entry_store.clone(),
            )
        });

        let pools: Vec<Arc<ConnectionPool>> = search_group
            .iter()
            .flat_map(|group| group.pools())
            .chain(bind_group.pools())
            .cloned()
            .collect();
        let monitor = Arc::new(HealthMonitor::new(pools))
            .start(self.provider.scheduler().as_ref(), config.monitor_interval());

        info!(
            "Pass-through authentication policy created for {} primary and {} secondary server(s)",
            config.primary_remote_ldap_servers.len(),
            config.secondary_remote_ldap_servers.len()
        );

        Ok(PassThroughPolicy {
            inner: Arc::new(PolicyInner {
                provider: self.provider.clone(),
                mapper,
                search_group,
                bind_group,
                cache,
                monitor: Mutex::new(Some(monitor)),
                closed: AtomicBool::new(false),
                config,
            }),
        })
    }

    /// Replace `current` with a policy built from `config`. An unacceptable
    /// configuration leaves `current` untouched.
    pub async fn apply_configuration_change(
        &self,
        current: &PassThroughPolicy,
        config: PolicyConfig,
    ) -> Result<PassThroughPolicy, ConfigError> {
        self.is_configuration_acceptable(&config)?;
        current.finalize_authentication_policy().await;
        self.create_authentication_policy(config)
    }

    fn build_group<F>(
        &self,
        config: &PolicyConfig,
        classifier: &Arc<ServiceErrorClassifier>,
        wrap: F,
    ) -> Arc<FailoverGroup>
    where
        F: Fn(Arc<dyn ConnectionFactory>) -> Arc<dyn ConnectionFactory>,
    {
        let balancer = |endpoints: Vec<ServerEndpoint>| {
            LoadBalancer::new(
                endpoints
                    .iter()
                    .map(|endpoint| {
                        let factory = wrap(self.provider.connection_factory(endpoint, config));
                        Arc::new(ConnectionPool::new(factory, config.pool_size, classifier.clone()))
                    })
                    .collect(),
            )
        };
        Arc::new(FailoverGroup::new(
            balancer(config.primary_endpoints()),
            Some(balancer(config.secondary_endpoints())),
            classifier.clone(),
        ))
    }
}

struct PolicyInner {
    config: PolicyConfig,
    provider: Arc<dyn Provider>,
    mapper: IdentityMapper,
    search_group: Option<Arc<FailoverGroup>>,
    bind_group: Arc<FailoverGroup>,
    cache: Option<PasswordCache>,
    monitor: Mutex<Option<MonitorHandle>>,
    closed: AtomicBool,
}

/// Validates local entries' passwords against remote LDAP servers.
#[derive(Clone)]
pub struct PassThroughPolicy {
    inner: Arc<PolicyInner>,
}

impl PassThroughPolicy {
    pub fn config(&self) -> &PolicyConfig {
        &self.inner.config
    }

    /// Pools used for binding as the mapped identity, primary first.
    pub fn bind_pools(&self) -> Vec<Arc<ConnectionPool>> {
        self.inner.bind_group.pools().cloned().collect()
    }

    /// Pools used for mapped searches; empty unless the mapping policy
    /// searches.
    pub fn search_pools(&self) -> Vec<Arc<ConnectionPool>> {
        self.inner
            .search_group
            .iter()
            .flat_map(|group| group.pools())
            .cloned()
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn create_state(&self, entry: Entry) -> PassThroughState {
        PassThroughState {
            policy: self.inner.clone(),
            entry,
            pending: None,
        }
    }
}

#[async_trait]
impl AuthenticationPolicy for PassThroughPolicy {
    fn create_authentication_policy_state(&self, entry: Entry) -> Box<dyn AuthenticationPolicyState> {
        Box::new(self.create_state(entry))
    }

    async fn finalize_authentication_policy(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let monitor = self.inner.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.cancel().await;
        }
        if let Some(search) = &self.inner.search_group {
            search.close().await;
        }
        self.inner.bind_group.close().await;
        info!("Pass-through authentication policy finalized");
    }
}

/// Authentication state for one local entry.
pub struct PassThroughState {
    policy: Arc<PolicyInner>,
    entry: Entry,
    /// Password validated remotely and the time it was validated, waiting
    /// to be cached.
    pending: Option<(String, DateTime<Utc>)>,
}

impl PassThroughState {
    async fn authenticate(&self, password: &str) -> AuthenticationOutcome {
        let identity = match self.policy.mapper.map(&self.entry).await {
            Ok(identity) => identity,
            Err(PtaError::Mapping(reason)) => {
                debug!("Pass-through authentication of {} failed: {}", self.entry.dn(), reason);
                return AuthenticationOutcome::InvalidCredentials;
            }
            Err(e) => return AuthenticationOutcome::ServiceError(e),
        };

        let mut connection = match self.policy.bind_group.get_connection().await {
            Ok(connection) => connection,
            Err(e) => return AuthenticationOutcome::ServiceError(e),
        };
        let result = connection.simple_bind(&identity, password).await;
        connection.release().await;

        let outcome = AuthenticationOutcome::from_bind(result);
        debug!("Remote bind of {} as {}: {:?}", self.entry.dn(), identity, outcome);
        outcome
    }
}

#[async_trait]
impl AuthenticationPolicyState for PassThroughState {
    async fn password_matches(&mut self, password: &str) -> Result<bool, DirectoryError> {
        if self.policy.closed.load(Ordering::Acquire) {
            return Err(DirectoryError::unavailable());
        }
        // An empty password would be an unauthenticated simple bind.
        if password.is_empty() {
            debug!("Rejecting empty password for {}", self.entry.dn());
            return Ok(false);
        }
        let now = self.policy.provider.now();

        if let Some(cache) = &self.policy.cache {
            if cache.matches(&self.entry, password.as_bytes(), now).await {
                debug!("Cached password matched for {}", self.entry.dn());
                return Ok(true);
            }
        }

        match self.authenticate(password).await {
            AuthenticationOutcome::Success => {
                if self.policy.cache.is_some() {
                    self.pending = Some((password.to_string(), now));
                }
                Ok(true)
            }
            AuthenticationOutcome::InvalidCredentials => Ok(false),
            AuthenticationOutcome::ServiceError(e) => {
                warn!("Pass-through authentication of {} failed: {}", self.entry.dn(), e);
                Err(DirectoryError::unavailable())
            }
        }
    }

    async fn finalize_state_after_bind(&mut self) {
        let Some((password, time)) = self.pending.take() else {
            return;
        };
        let Some(cache) = &self.policy.cache else {
            return;
        };
        if let Err(e) = cache.store(&mut self.entry, password.as_bytes(), time).await {
            warn!("Could not update the cached password of {}: {}", self.entry.dn(), e);
        }
    }

    fn entry(&self) -> &Entry {
        &self.entry
    }
}
