//! Remote LDAP connections: the raw session contract, the ldap3-backed
//! factory, pooling and load balancing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::PtaError;

pub mod balancer;
pub mod ldap;
pub mod pool;

pub use balancer::{FailoverConnection, FailoverGroup, LoadBalancer};
pub use ldap::LdapConnectionFactory;
pub use pool::{ConnectionPool, HealthState, PooledConnection};

/// A remote server address. Identity key for pools and health state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServerEndpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// Parse `host:port`. The last colon separates the port.
    pub fn parse(host_port: &str) -> Result<Self, String> {
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid server address {}: expected host:port", host_port))?;
        if host.is_empty() {
            return Err(format!("invalid server address {}: empty host", host_port));
        }
        let port: u32 = port
            .parse()
            .map_err(|_| format!("invalid port number in server address {}", host_port))?;
        if !(1..=65535).contains(&port) {
            return Err(format!("invalid port number in server address {}", host_port));
        }
        Ok(Self::new(host, port as u16))
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject,
    SingleLevel,
    WholeSubtree,
}

/// One session with a single remote server.
///
/// Every operation is bounded by the configured timeout. A session that
/// reported a connection-class failure must not be reused.
#[async_trait]
pub trait Connection: Send {
    /// Simple bind. Invalid credentials are reported as
    /// [`PtaError::Credentials`].
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<(), PtaError>;

    /// Search for exactly one entry and return its DN.
    async fn search(
        &mut self,
        base_dn: &str,
        scope: SearchScope,
        filter: &str,
    ) -> Result<String, PtaError>;

    /// Unbind and release the session. Idempotent.
    async fn close(&mut self);
}

/// Opens connections to one fixed endpoint.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    fn endpoint(&self) -> &ServerEndpoint;

    async fn connect(&self) -> Result<Box<dyn Connection>, PtaError>;
}

/// Factory whose connections are bound as a fixed identity before they are
/// handed out. Used for mapped-search pools.
pub struct AuthenticatedConnectionFactory {
    factory: Arc<dyn ConnectionFactory>,
    bind_dn: Option<String>,
    password: Option<String>,
}

impl AuthenticatedConnectionFactory {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        bind_dn: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            factory,
            bind_dn,
            password,
        }
    }
}

#[async_trait]
impl ConnectionFactory for AuthenticatedConnectionFactory {
    fn endpoint(&self) -> &ServerEndpoint {
        self.factory.endpoint()
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, PtaError> {
        let mut connection = self.factory.connect().await?;
        if let (Some(dn), Some(password)) = (&self.bind_dn, &self.password) {
            if !dn.is_empty() && !password.is_empty() {
                if let Err(e) = connection.simple_bind(dn, password).await {
                    debug!("Search bind as {} on {} failed: {}", dn, self.endpoint(), e);
                    connection.close().await;
                    return Err(e);
                }
            }
        }
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        let ep = ServerEndpoint::parse("ldap.example.com:636").unwrap();
        assert_eq!(ep, ServerEndpoint::new("ldap.example.com", 636));
        assert_eq!(ep.to_string(), "ldap.example.com:636");

        let v6 = ServerEndpoint::parse("[::1]:389").unwrap();
        assert_eq!(v6.host, "[::1]");

        assert!(ServerEndpoint::parse("ldap.example.com").is_err());
        assert!(ServerEndpoint::parse(":389").is_err());
        assert!(ServerEndpoint::parse("host:0").is_err());
        assert!(ServerEndpoint::parse("host:65536").is_err());
        assert!(ServerEndpoint::parse("host:port").is_err());
    }
}
