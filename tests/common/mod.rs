//! In-memory remote directory, clock and scheduler for driving policies
//! without a network.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use ldap_passthrough::config::{MappingPolicy, PolicyConfig};
use ldap_passthrough::connection::{Connection, ConnectionFactory, SearchScope, ServerEndpoint};
use ldap_passthrough::entry::{EntryStore, StaticSchema};
use ldap_passthrough::monitor::{MonitorHandle, MonitorTask, Scheduler};
use ldap_passthrough::{PassThroughPolicyFactory, Provider, PtaError, ResultCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect(String),
    Bind(String, String),
    Search(String, String, String),
    Close(String),
}

pub fn connect(server: &str) -> Event {
    Event::Connect(server.to_string())
}

pub fn bind(server: &str, dn: &str) -> Event {
    Event::Bind(server.to_string(), dn.to_string())
}

pub fn search(server: &str, base: &str, filter: &str) -> Event {
    Event::Search(server.to_string(), base.to_string(), filter.to_string())
}

/// How one fake server behaves. Servers nobody configured are up and empty.
#[derive(Debug, Clone, Default)]
pub struct ServerBehavior {
    pub down: bool,
    /// Result code for every bind, overriding the user table.
    pub bind_error: Option<ResultCode>,
    /// Result code for every search, overriding the result table.
    pub search_error: Option<ResultCode>,
    /// The next this-many operations fail with `Unavailable`.
    pub transient_failures: usize,
    pub users: HashMap<String, String>,
    pub search_results: HashMap<(String, String), Vec<String>>,
}

impl ServerBehavior {
    pub fn with_user(mut self, dn: &str, password: &str) -> Self {
        self.users.insert(dn.to_string(), password.to_string());
        self
    }

    pub fn with_search_result(mut self, base: &str, filter: &str, dns: &[&str]) -> Self {
        self.search_results.insert(
            (base.to_string(), filter.to_string()),
            dns.iter().map(|dn| dn.to_string()).collect(),
        );
        self
    }
}

struct State {
    events: Mutex<Vec<Event>>,
    servers: Mutex<HashMap<String, ServerBehavior>>,
    now: Mutex<DateTime<Utc>>,
}

impl State {
    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn behavior(&self, server: &str) -> ServerBehavior {
        self.servers.lock().get(server).cloned().unwrap_or_default()
    }

    /// Consume one transient failure of `server`, if any are left.
    fn take_transient_failure(&self, server: &str) -> bool {
        let mut servers = self.servers.lock();
        match servers.get_mut(server) {
            Some(b) if b.transient_failures > 0 => {
                b.transient_failures -= 1;
                true
            }
            _ => false,
        }
    }
}

fn error_for(endpoint: &ServerEndpoint, code: ResultCode, message: &str) -> PtaError {
    match code {
        ResultCode::InvalidCredentials => PtaError::Credentials {
            identity: message.to_string(),
        },
        ResultCode::ClientSideServerDown
        | ResultCode::ClientSideTimeout
        | ResultCode::ClientSideConnectError => PtaError::connection(endpoint, code, message),
        code => PtaError::protocol(endpoint, code, message),
    }
}

/// Provider backed by in-memory servers. Records every connection event.
#[derive(Clone)]
pub struct FakeDirectory {
    state: Arc<State>,
    scheduler: Arc<ManualScheduler>,
    properties: HashMap<String, String>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self {
            state: Arc::new(State {
                events: Mutex::new(Vec::new()),
                servers: Mutex::new(HashMap::new()),
                now: Mutex::new(time("20100101120000Z")),
            }),
            scheduler: Arc::new(ManualScheduler::default()),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: &str) -> Self {
        self.properties.insert(name.to_string(), value.to_string());
        self
    }

    pub fn set_server(&self, server: &str, behavior: ServerBehavior) {
        self.state.servers.lock().insert(server.to_string(), behavior);
    }

    pub fn update_server(&self, server: &str, update: impl FnOnce(&mut ServerBehavior)) {
        let mut servers = self.state.servers.lock();
        update(servers.entry(server.to_string()).or_default());
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.events.lock().clone()
    }

    /// Return and forget the events recorded so far.
    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.state.events.lock())
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        *self.state.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.state.now.lock();
        *now = *now + ChronoDuration::from_std(by).unwrap();
    }

    pub fn scheduler(&self) -> Arc<ManualScheduler> {
        self.scheduler.clone()
    }
}

impl Provider for FakeDirectory {
    fn connection_factory(
        &self,
        endpoint: &ServerEndpoint,
        _config: &PolicyConfig,
    ) -> Arc<dyn ConnectionFactory> {
        Arc::new(FakeFactory {
            endpoint: endpoint.clone(),
            state: self.state.clone(),
        })
    }

    fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }

    fn now(&self) -> DateTime<Utc> {
        *self.state.now.lock()
    }

    fn property(&self, name: &str) -> Option<String> {
        self.properties.get(name).cloned()
    }
}

struct FakeFactory {
    endpoint: ServerEndpoint,
    state: Arc<State>,
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, PtaError> {
        let server = self.endpoint.to_string();
        self.state.record(Event::Connect(server.clone()));
        if self.state.behavior(&server).down {
            return Err(PtaError::connection(
                &self.endpoint,
                ResultCode::ClientSideConnectError,
                "connection refused",
            ));
        }
        Ok(Box::new(FakeConnection {
            endpoint: self.endpoint.clone(),
            server,
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct FakeConnection {
    endpoint: ServerEndpoint,
    server: String,
    state: Arc<State>,
    closed: bool,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<(), PtaError> {
        self.state.record(Event::Bind(self.server.clone(), dn.to_string()));
        if self.state.take_transient_failure(&self.server) {
            return Err(PtaError::protocol(&self.endpoint, ResultCode::Unavailable, "unavailable"));
        }
        let behavior = self.state.behavior(&self.server);
        if let Some(code) = behavior.bind_error {
            return Err(error_for(&self.endpoint, code, dn));
        }
        match behavior.users.get(dn) {
            Some(expected) if expected == password => Ok(()),
            Some(_) => Err(PtaError::Credentials {
                identity: dn.to_string(),
            }),
            None => Err(PtaError::protocol(&self.endpoint, ResultCode::NoSuchObject, "no such entry")),
        }
    }

    async fn search(
        &mut self,
        base_dn: &str,
        _scope: SearchScope,
        filter: &str,
    ) -> Result<String, PtaError> {
        self.state.record(Event::Search(
            self.server.clone(),
            base_dn.to_string(),
            filter.to_string(),
        ));
        if self.state.take_transient_failure(&self.server) {
            return Err(PtaError::protocol(&self.endpoint, ResultCode::Unavailable, "unavailable"));
        }
        let behavior = self.state.behavior(&self.server);
        if let Some(code) = behavior.search_error {
            return Err(error_for(&self.endpoint, code, "forced search failure"));
        }
        let results = behavior
            .search_results
            .get(&(base_dn.to_string(), filter.to_string()))
            .cloned()
            .unwrap_or_default();
        match results.as_slice() {
            [] => Err(PtaError::protocol(
                &self.endpoint,
                ResultCode::ClientSideNoResultsReturned,
                "no results",
            )),
            [dn] => Ok(dn.clone()),
            _ => Err(PtaError::protocol(
                &self.endpoint,
                ResultCode::ClientSideMoreResultsToReturn,
                "more than one result",
            )),
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.record(Event::Close(self.server.clone()));
        }
    }
}

/// Scheduler whose tasks only run when the test says so.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<Vec<(CancellationToken, MonitorTask)>>,
}

impl ManualScheduler {
    /// Run every task that has not been cancelled, once.
    pub async fn run_pending(&self) {
        let tasks: Vec<MonitorTask> = self
            .tasks
            .lock()
            .iter()
            .filter(|(token, _)| !token.is_cancelled())
            .map(|(_, task)| task.clone())
            .collect();
        for task in tasks {
            task().await;
        }
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|(token, _)| !token.is_cancelled())
            .count()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_with_fixed_delay(
        &self,
        _initial_delay: Duration,
        _delay: Duration,
        task: MonitorTask,
    ) -> MonitorHandle {
        let token = CancellationToken::new();
        self.tasks.lock().push((token.clone(), task));
        MonitorHandle::detached(token)
    }
}

/// Records cache writes; can be told to fail them.
#[derive(Default)]
pub struct MemoryEntryStore {
    pub writes: Mutex<Vec<(String, Vec<(String, Vec<String>)>)>>,
    pub fail: AtomicBool,
}

impl MemoryEntryStore {
    pub fn writes(&self) -> Vec<(String, Vec<(String, Vec<String>)>)> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    async fn replace_attributes(
        &self,
        dn: &str,
        attributes: Vec<(String, Vec<String>)>,
    ) -> Result<(), PtaError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PtaError::Cache("entry store is read-only".to_string()));
        }
        self.writes.lock().push((dn.to_string(), attributes));
        Ok(())
    }
}

pub struct Harness {
    pub directory: FakeDirectory,
    pub store: Arc<MemoryEntryStore>,
    pub factory: PassThroughPolicyFactory,
}

pub fn harness() -> Harness {
    harness_with(FakeDirectory::new())
}

pub fn harness_with(directory: FakeDirectory) -> Harness {
    let store = Arc::new(MemoryEntryStore::default());
    let factory = PassThroughPolicyFactory::new(
        Arc::new(directory.clone()),
        Arc::new(StaticSchema::permissive()),
        store.clone(),
    );
    Harness {
        directory,
        store,
        factory,
    }
}

pub fn policy_config(primary: &[&str], secondary: &[&str], mapping: MappingPolicy) -> PolicyConfig {
    PolicyConfig {
        primary_remote_ldap_servers: primary.iter().map(|s| s.to_string()).collect(),
        secondary_remote_ldap_servers: secondary.iter().map(|s| s.to_string()).collect(),
        mapping_policy: mapping,
        pool_size: 4,
        ..PolicyConfig::default()
    }
}

pub fn time(value: &str) -> DateTime<Utc> {
    let naive = chrono::NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%SZ").unwrap();
    Utc.from_utc_datetime(&naive)
}
