use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PolicyConfig;
use crate::connection::{ConnectionFactory, LdapConnectionFactory, ServerEndpoint};
use crate::monitor::{Scheduler, TokioScheduler};

/// Everything a policy needs from its environment: connection factories,
/// a scheduler for background work, the clock and named properties.
pub trait Provider: Send + Sync {
    fn connection_factory(
        &self,
        endpoint: &ServerEndpoint,
        config: &PolicyConfig,
    ) -> Arc<dyn ConnectionFactory>;

    fn scheduler(&self) -> Arc<dyn Scheduler>;

    fn now(&self) -> DateTime<Utc>;

    fn property(&self, name: &str) -> Option<String>;
}

/// Real LDAP connections, tokio timers and the system clock.
#[derive(Debug, Default, Clone)]
pub struct LdapProvider {
    properties: HashMap<String, String>,
}

impl LdapProvider {
    pub fn new(properties: HashMap<String, String>) -> Self {
        Self { properties }
    }
}

impl Provider for LdapProvider {
    fn connection_factory(
        &self,
        endpoint: &ServerEndpoint,
        config: &PolicyConfig,
    ) -> Arc<dyn ConnectionFactory> {
        Arc::new(LdapConnectionFactory::new(endpoint, config))
    }

    fn scheduler(&self) -> Arc<dyn Scheduler> {
        Arc::new(TokioScheduler)
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn property(&self, name: &str) -> Option<String> {
        self.properties.get(name).cloned()
    }
}
