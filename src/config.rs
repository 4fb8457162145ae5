use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::auth::utils::StorageScheme;
use crate::connection::ServerEndpoint;
use crate::error::{ResultCode, ServiceErrorClassifier};

pub mod bind_password;

pub use bind_password::PasswordSource;

/// Top-level configuration file: one policy plus process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub policy: PolicyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Named properties a search bind password may be read from.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            console: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingPolicy {
    #[serde(rename = "unmapped")]
    Unmapped,
    #[serde(rename = "mapped-bind")]
    MappedBind,
    #[serde(rename = "mapped-search")]
    MappedSearch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DerefPolicy {
    #[serde(rename = "never")]
    Never,
    #[serde(rename = "searching")]
    Searching,
    #[serde(rename = "finding")]
    Finding,
    #[serde(rename = "always")]
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustManager {
    /// Platform trust store.
    System,
    /// Trust any certificate.
    Blind,
    /// PEM bundle of trusted CA certificates.
    File(String),
}

/// Configuration of one pass-through authentication policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub primary_remote_ldap_servers: Vec<String>,
    #[serde(default)]
    pub secondary_remote_ldap_servers: Vec<String>,
    pub mapping_policy: MappingPolicy,
    #[serde(default)]
    pub mapped_attributes: Vec<String>,
    #[serde(default)]
    pub mapped_search_base_dns: Vec<String>,
    #[serde(default)]
    pub mapped_search_filter_template: Option<String>,
    #[serde(default)]
    pub mapped_search_bind_dn: Option<String>,
    #[serde(default)]
    pub mapped_search_bind_password: Option<String>,
    #[serde(default)]
    pub mapped_search_bind_password_environment_variable: Option<String>,
    #[serde(default)]
    pub mapped_search_bind_password_file: Option<String>,
    #[serde(default)]
    pub mapped_search_bind_password_property: Option<String>,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub ssl_protocols: Vec<String>,
    /// Must stay empty. The platform TLS library picks the cipher suites and
    /// a configured list is rejected rather than silently ignored.
    #[serde(default)]
    pub ssl_cipher_suites: Vec<String>,
    #[serde(default = "default_trust_manager")]
    pub trust_manager: TrustManager,
    #[serde(default)]
    pub use_password_caching: bool,
    #[serde(default = "default_cached_password_ttl_secs")]
    pub cached_password_ttl_secs: u64,
    #[serde(default = "default_storage_scheme")]
    pub cached_password_storage_scheme: StorageScheme,
    #[serde(default = "default_deref_policy")]
    pub search_deref_aliases: DerefPolicy,
    #[serde(default = "ServiceErrorClassifier::default_codes")]
    pub connection_class_result_codes: Vec<ResultCode>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
}

fn default_connection_timeout_ms() -> u64 {
    3000
}

fn default_trust_manager() -> TrustManager {
    TrustManager::System
}

fn default_cached_password_ttl_secs() -> u64 {
    86400
}

fn default_storage_scheme() -> StorageScheme {
    StorageScheme::Argon2
}

fn default_deref_policy() -> DerefPolicy {
    DerefPolicy::Always
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
}

fn default_monitor_interval_secs() -> u64 {
    5
}

/// Reasons a configuration was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unacceptable pass-through policy configuration: {}", reasons.join("; "))]
pub struct ConfigError {
    pub reasons: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            primary_remote_ldap_servers: vec!["localhost:389".to_string()],
            secondary_remote_ldap_servers: vec![],
            mapping_policy: MappingPolicy::Unmapped,
            mapped_attributes: vec![],
            mapped_search_base_dns: vec![],
            mapped_search_filter_template: None,
            mapped_search_bind_dn: None,
            mapped_search_bind_password: None,
            mapped_search_bind_password_environment_variable: None,
            mapped_search_bind_password_file: None,
            mapped_search_bind_password_property: None,
            connection_timeout_ms: default_connection_timeout_ms(),
            use_ssl: false,
            ssl_protocols: vec![],
            ssl_cipher_suites: vec![],
            trust_manager: default_trust_manager(),
            use_password_caching: false,
            cached_password_ttl_secs: default_cached_password_ttl_secs(),
            cached_password_storage_scheme: default_storage_scheme(),
            search_deref_aliases: default_deref_policy(),
            connection_class_result_codes: ServiceErrorClassifier::default_codes(),
            pool_size: default_pool_size(),
            monitor_interval_secs: default_monitor_interval_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            logging: LoggingConfig::default(),
            properties: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            reasons.push(format!("invalid log level: {}", self.logging.level));
        }
        if let Err(e) = self.policy.validate(|name| self.properties.get(name).cloned()) {
            reasons.extend(e.reasons);
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { reasons })
        }
    }
}

impl PolicyConfig {
    /// Checks everything that can be checked without contacting a server.
    ///
    /// `property` resolves named properties for
    /// `mapped_search_bind_password_property`.
    pub fn validate<F>(&self, property: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut reasons = Vec::new();

        if self.primary_remote_ldap_servers.is_empty() {
            reasons.push("at least one primary remote LDAP server is required".to_string());
        }
        for server in self
            .primary_remote_ldap_servers
            .iter()
            .chain(&self.secondary_remote_ldap_servers)
        {
            if let Err(e) = ServerEndpoint::parse(server) {
                reasons.push(e);
            }
        }

        if self.mapping_policy != MappingPolicy::Unmapped && self.mapped_attributes.is_empty() {
            reasons.push("mapped policies require at least one mapped attribute".to_string());
        }

        if self.mapping_policy == MappingPolicy::MappedSearch {
            if self.mapped_search_base_dns.is_empty() {
                reasons.push("mapped-search requires at least one base DN".to_string());
            }
            if let Some(template) = &self.mapped_search_filter_template {
                if let Err(e) = crate::auth::mapping::validate_filter_template(template) {
                    reasons.push(e);
                }
            }
            if self.has_search_bind_dn() {
                if let Err(e) = self.password_source().and_then(|s| s.resolve(&property)) {
                    reasons.push(e);
                }
            }
        }

        if self.connection_timeout_ms == 0 {
            reasons.push("connection timeout must be greater than 0".to_string());
        }
        if self.pool_size == 0 {
            reasons.push("pool size must be greater than 0".to_string());
        }
        if self.monitor_interval_secs == 0 {
            reasons.push("monitor interval must be greater than 0".to_string());
        }
        if self.use_password_caching && self.cached_password_ttl_secs == 0 {
            reasons.push("cached password TTL must be greater than 0".to_string());
        }

        if self.use_ssl {
            if let Err(e) = crate::connection::ldap::build_tls_connector(self) {
                reasons.push(format!("invalid TLS configuration: {}", e));
            }
        } else if !self.ssl_cipher_suites.is_empty() {
            reasons.push(crate::connection::ldap::CIPHER_SUITES_UNSUPPORTED.to_string());
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { reasons })
        }
    }

    pub fn has_search_bind_dn(&self) -> bool {
        self.mapped_search_bind_dn
            .as_deref()
            .is_some_and(|dn| !dn.trim().is_empty())
    }

    /// The single configured source of the search bind password.
    pub fn password_source(&self) -> Result<PasswordSource, String> {
        let mut sources = Vec::new();
        if let Some(name) = &self.mapped_search_bind_password_property {
            sources.push(PasswordSource::Property(name.clone()));
        }
        if let Some(name) = &self.mapped_search_bind_password_environment_variable {
            sources.push(PasswordSource::Environment(name.clone()));
        }
        if let Some(path) = &self.mapped_search_bind_password_file {
            sources.push(PasswordSource::File(path.into()));
        }
        if let Some(password) = &self.mapped_search_bind_password {
            sources.push(PasswordSource::Direct(password.clone()));
        }
        match sources.len() {
            0 => Err("no search bind password source is configured".to_string()),
            1 => Ok(sources.remove(0)),
            _ => Err("more than one search bind password source is configured".to_string()),
        }
    }

    pub fn primary_endpoints(&self) -> Vec<ServerEndpoint> {
        parse_endpoints(&self.primary_remote_ldap_servers)
    }

    pub fn secondary_endpoints(&self) -> Vec<ServerEndpoint> {
        parse_endpoints(&self.secondary_remote_ldap_servers)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Server-side search time limit, in whole seconds.
    pub fn search_time_limit_secs(&self) -> i32 {
        (self.connection_timeout_ms / 1000).min(i32::MAX as u64) as i32
    }

    pub fn cached_password_ttl(&self) -> Duration {
        Duration::from_secs(self.cached_password_ttl_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn classifier(&self) -> ServiceErrorClassifier {
        ServiceErrorClassifier::new(self.connection_class_result_codes.iter().copied())
    }
}

fn parse_endpoints(servers: &[String]) -> Vec<ServerEndpoint> {
    servers
        .iter()
        .filter_map(|s| ServerEndpoint::parse(s).ok())
        .collect()
}
