use async_trait::async_trait;
use ldap3::{DerefAliases, Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry, SearchOptions, SearchResult};
use native_tls::{Certificate, Protocol, TlsConnector};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::{Connection, ConnectionFactory, SearchScope, ServerEndpoint};
use crate::config::{DerefPolicy, PolicyConfig, TrustManager};
use crate::error::{PtaError, ResultCode};

/// Requests no attributes in search results.
const NO_ATTRIBUTES: &str = "1.1";

/// Opens ldap3 sessions to one endpoint, plain or over TLS.
pub struct LdapConnectionFactory {
    endpoint: ServerEndpoint,
    url: String,
    timeout: Duration,
    time_limit: i32,
    deref: DerefAliases,
    tls: Option<Result<TlsConnector, String>>,
}

impl LdapConnectionFactory {
    pub fn new(endpoint: &ServerEndpoint, config: &PolicyConfig) -> Self {
        let scheme = if config.use_ssl { "ldaps" } else { "ldap" };
        let tls = config.use_ssl.then(|| build_tls_connector(config));
        if let Some(Err(e)) = &tls {
            warn!("TLS configuration for {} is unusable: {}", endpoint, e);
        }

        Self {
            endpoint: endpoint.clone(),
            url: format!("{}://{}:{}", scheme, endpoint.host, endpoint.port),
            timeout: config.connection_timeout(),
            time_limit: config.search_time_limit_secs(),
            deref: match config.search_deref_aliases {
                DerefPolicy::Never => DerefAliases::Never,
                DerefPolicy::Searching => DerefAliases::Searching,
                DerefPolicy::Finding => DerefAliases::Finding,
                DerefPolicy::Always => DerefAliases::Always,
            },
            tls,
        }
    }

    fn settings(&self) -> Result<LdapConnSettings, PtaError> {
        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
        match &self.tls {
            None => Ok(settings),
            Some(Ok(connector)) => Ok(settings.set_connector(connector.clone())),
            Some(Err(e)) => Err(PtaError::connection(
                &self.endpoint,
                ResultCode::ClientSideConnectError,
                format!("TLS configuration error: {}", e),
            )),
        }
    }
}

#[async_trait]
impl ConnectionFactory for LdapConnectionFactory {
    fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, PtaError> {
        let settings = self.settings()?;
        debug!("Connecting to LDAP server {}", self.url);

        let connected = tokio::time::timeout(
            self.timeout,
            LdapConnAsync::with_settings(settings, &self.url),
        )
        .await;

        let (conn, ldap) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(LdapError::Timeout { .. })) | Err(_) => {
                return Err(PtaError::connection(
                    &self.endpoint,
                    ResultCode::ClientSideTimeout,
                    "timed out while connecting",
                ));
            }
            Ok(Err(e)) => {
                return Err(PtaError::connection(
                    &self.endpoint,
                    ResultCode::ClientSideConnectError,
                    e.to_string(),
                ));
            }
        };

        ldap3::drive!(conn);

        Ok(Box::new(LdapConnection {
            endpoint: self.endpoint.clone(),
            ldap,
            timeout: self.timeout,
            time_limit: self.time_limit,
            deref: self.deref.clone(),
            closed: false,
        }))
    }
}

pub(crate) const CIPHER_SUITES_UNSUPPORTED: &str =
    "ssl_cipher_suites cannot be applied: cipher selection is left to the platform TLS library";

/// Builds the connector used for `ldaps` connections.
pub(crate) fn build_tls_connector(config: &PolicyConfig) -> Result<TlsConnector, String> {
    let mut builder = TlsConnector::builder();

    match &config.trust_manager {
        TrustManager::System => {}
        TrustManager::Blind => {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        TrustManager::File(path) => {
            let pem = std::fs::read(path).map_err(|e| format!("cannot read {}: {}", path, e))?;
            let cert = Certificate::from_pem(&pem).map_err(|e| format!("invalid certificate in {}: {}", path, e))?;
            builder.add_root_certificate(cert);
        }
    }

    if !config.ssl_protocols.is_empty() {
        let mut versions = Vec::new();
        for name in &config.ssl_protocols {
            versions.push(parse_protocol(name)?);
        }
        // None stands for TLSv1.3, which native-tls cannot name.
        let min = versions.iter().min_by_key(|v| protocol_rank(**v)).copied().flatten();
        let max = versions.iter().max_by_key(|v| protocol_rank(**v)).copied().flatten();
        builder.min_protocol_version(min);
        builder.max_protocol_version(max);
    }

    if !config.ssl_cipher_suites.is_empty() {
        return Err(CIPHER_SUITES_UNSUPPORTED.to_string());
    }

    builder.build().map_err(|e| e.to_string())
}

fn parse_protocol(name: &str) -> Result<Option<Protocol>, String> {
    match name {
        "SSLv3" => Ok(Some(Protocol::Sslv3)),
        "TLSv1" | "TLSv1.0" => Ok(Some(Protocol::Tlsv10)),
        "TLSv1.1" => Ok(Some(Protocol::Tlsv11)),
        "TLSv1.2" => Ok(Some(Protocol::Tlsv12)),
        "TLSv1.3" => Ok(None),
        other => Err(format!("unsupported TLS protocol {}", other)),
    }
}

fn protocol_rank(protocol: Option<Protocol>) -> u8 {
    match protocol {
        Some(Protocol::Sslv3) => 0,
        Some(Protocol::Tlsv10) => 1,
        Some(Protocol::Tlsv11) => 2,
        Some(Protocol::Tlsv12) => 3,
        _ => 4,
    }
}

struct LdapConnection {
    endpoint: ServerEndpoint,
    ldap: Ldap,
    timeout: Duration,
    time_limit: i32,
    deref: DerefAliases,
    closed: bool,
}

impl LdapConnection {
    /// Client-side failures: the session is unusable from here on. A Notice
    /// of Disconnection ends the session and surfaces here too.
    fn client_error(&self, e: LdapError) -> PtaError {
        match e {
            LdapError::Timeout { .. } => PtaError::connection(
                &self.endpoint,
                ResultCode::ClientSideTimeout,
                "timed out waiting for a response",
            ),
            other => PtaError::connection(
                &self.endpoint,
                ResultCode::ClientSideServerDown,
                other.to_string(),
            ),
        }
    }
}

#[async_trait]
impl Connection for LdapConnection {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<(), PtaError> {
        let result = self
            .ldap
            .with_timeout(self.timeout)
            .simple_bind(dn, password)
            .await;
        let result = result.map_err(|e| self.client_error(e))?;

        match ResultCode::from_rc(result.rc) {
            ResultCode::Success => {
                trace!("Bind as {} on {} succeeded", dn, self.endpoint);
                Ok(())
            }
            ResultCode::InvalidCredentials => Err(PtaError::Credentials {
                identity: dn.to_string(),
            }),
            code => Err(PtaError::protocol(
                &self.endpoint,
                code,
                format!("bind as {} failed: {}", dn, result.text),
            )),
        }
    }

    async fn search(
        &mut self,
        base_dn: &str,
        scope: SearchScope,
        filter: &str,
    ) -> Result<String, PtaError> {
        let options = SearchOptions::new()
            .deref(self.deref.clone())
            .sizelimit(1)
            .timelimit(self.time_limit)
            .typesonly(true);
        let scope = match scope {
            SearchScope::BaseObject => Scope::Base,
            SearchScope::SingleLevel => Scope::OneLevel,
            SearchScope::WholeSubtree => Scope::Subtree,
        };

        let searched = self
            .ldap
            .with_search_options(options)
            .with_timeout(self.timeout)
            .search(base_dn, scope, filter, vec![NO_ATTRIBUTES])
            .await;
        let SearchResult(entries, result) = searched.map_err(|e| self.client_error(e))?;

        // Referrals say nothing about whether a matching entry exists.
        let mut matches = entries.into_iter().filter(|e| !e.is_ref() && !e.is_intermediate());

        match ResultCode::from_rc(result.rc) {
            ResultCode::Success => {}
            ResultCode::SizeLimitExceeded => {
                return Err(PtaError::protocol(
                    &self.endpoint,
                    ResultCode::ClientSideMoreResultsToReturn,
                    format!("search of {} with {} matched more than one entry", base_dn, filter),
                ));
            }
            code => {
                return Err(PtaError::protocol(
                    &self.endpoint,
                    code,
                    format!("search of {} with {} failed: {}", base_dn, filter, result.text),
                ));
            }
        }

        match (matches.next(), matches.next()) {
            (Some(entry), None) => Ok(SearchEntry::construct(entry).dn),
            (Some(_), Some(_)) => Err(PtaError::protocol(
                &self.endpoint,
                ResultCode::ClientSideMoreResultsToReturn,
                format!("search of {} with {} matched more than one entry", base_dn, filter),
            )),
            (None, _) => Err(PtaError::protocol(
                &self.endpoint,
                ResultCode::ClientSideNoResultsReturned,
                format!("search of {} with {} matched no entries", base_dn, filter),
            )),
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.ldap.unbind().await {
            debug!("Unbind from {} failed: {}", self.endpoint, e);
        }
    }
}
