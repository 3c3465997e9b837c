//! The asynchronous event-driven convention.
//!
//! An application is invoked once per connection scope with an [`Inbox`] of
//! incoming events and an [`Outbox`] for outgoing ones. A long-lived
//! lifespan scope frames the server's startup and shutdown.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tether_core::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::{GatewayConfig, ServiceConfig};
use crate::error::{GatewayError, Result};
use crate::instance::{Exchange, InstancePool};
use crate::lifespan::Lifespan;
use crate::types::{Request, Response};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub version: &'static str,
    pub spec_version: &'static str,
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self {
            version: "3.0",
            spec_version: "2.0",
        }
    }
}

/// Application state carried from the lifespan scope into every request.
///
/// The lifespan scope holds the live map; each request scope gets a copy
/// taken when the request arrives.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries().clone()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct LifespanScope {
    pub protocol: ProtocolVersion,
    pub state: SharedState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpScope {
    pub protocol: ProtocolVersion,
    pub http_version: String,
    pub method: String,
    pub scheme: String,
    pub path: String,
    pub raw_path: Vec<u8>,
    pub query_string: Vec<u8>,
    pub root_path: String,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub client: Option<(String, u16)>,
    pub server: Option<(String, u16)>,
    pub state: BTreeMap<String, Value>,
}

impl HttpScope {
    /// First value of a request header, by lower-case name.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k.as_slice() == name.as_bytes())
            .map(|(_, v)| v.as_slice())
    }
}

#[derive(Debug, Clone)]
pub enum Scope {
    Lifespan(LifespanScope),
    Http(HttpScope),
}

impl Scope {
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Lifespan(_) => "lifespan",
            Scope::Http(_) => "http",
        }
    }
}

/// Events delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    LifespanStartup,
    LifespanShutdown,
    HttpRequest { body: Vec<u8>, more_body: bool },
    HttpDisconnect,
}

impl Incoming {
    pub fn kind(&self) -> &'static str {
        match self {
            Incoming::LifespanStartup => "lifespan.startup",
            Incoming::LifespanShutdown => "lifespan.shutdown",
            Incoming::HttpRequest { .. } => "http.request",
            Incoming::HttpDisconnect => "http.disconnect",
        }
    }
}

/// Events the application emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    StartupComplete,
    StartupFailed { message: Option<String> },
    ShutdownComplete,
    ShutdownFailed { message: Option<String> },
    ResponseStart {
        status: u16,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
    },
    ResponseBody { body: Vec<u8>, more_body: bool },
}

impl Outgoing {
    pub fn kind(&self) -> &'static str {
        match self {
            Outgoing::StartupComplete => "lifespan.startup.complete",
            Outgoing::StartupFailed { .. } => "lifespan.startup.failed",
            Outgoing::ShutdownComplete => "lifespan.shutdown.complete",
            Outgoing::ShutdownFailed { .. } => "lifespan.shutdown.failed",
            Outgoing::ResponseStart { .. } => "http.response.start",
            Outgoing::ResponseBody { .. } => "http.response.body",
        }
    }

    /// A response head with textual headers.
    pub fn start<I, K, V>(status: u16, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        Outgoing::ResponseStart {
            status,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_vec(), v.as_ref().to_vec()))
                .collect(),
        }
    }

    /// The final body chunk.
    pub fn body(body: impl Into<Vec<u8>>) -> Self {
        Outgoing::ResponseBody {
            body: body.into(),
            more_body: false,
        }
    }
}

/// Receiving half handed to the application.
#[derive(Debug)]
pub struct Inbox {
    receiver: mpsc::UnboundedReceiver<Incoming>,
    on_close: Incoming,
}

impl Inbox {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<Incoming>, on_close: Incoming) -> Self {
        Self { receiver, on_close }
    }

    /// The next event. Once the server side lets go this keeps yielding the
    /// scope's closing event (`http.disconnect` for requests).
    pub async fn receive(&mut self) -> Incoming {
        match self.receiver.recv().await {
            Some(event) => event,
            None => self.on_close.clone(),
        }
    }
}

/// Where an [`Outbox`] delivers events. Each implementation enforces its
/// scope's ordering rules.
pub(crate) trait MessageSink: Send + Sync {
    fn accept(&self, message: Outgoing) -> Result<()>;
}

/// Sending half handed to the application.
#[derive(Clone)]
pub struct Outbox {
    sink: Arc<dyn MessageSink>,
}

impl Outbox {
    pub(crate) fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self { sink }
    }

    /// Emit an event. Out-of-order events fail with [`GatewayError::Protocol`].
    pub async fn send(&self, message: Outgoing) -> Result<()> {
        self.sink.accept(message)
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox").finish_non_exhaustive()
    }
}

/// An application following the asynchronous convention.
#[async_trait]
pub trait AsyncApplication: Send + Sync + 'static {
    async fn call(&self, scope: Scope, inbox: Inbox, outbox: Outbox) -> Result<()>;
}

#[async_trait]
impl<F, Fut> AsyncApplication for F
where
    F: Fn(Scope, Inbox, Outbox) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self, scope: Scope, inbox: Inbox, outbox: Outbox) -> Result<()> {
        self(scope, inbox, outbox).await
    }
}

/// Serves requests against an asynchronous application.
pub struct AsyncServer {
    pool: Arc<InstancePool>,
    lifespan: Lifespan,
    mount_prefix: String,
    server_header: String,
    sweeper: JoinHandle<()>,
}

impl AsyncServer {
    /// Run lifespan startup and begin sweeping finished instances.
    ///
    /// Fails only when the application reports `lifespan.startup.failed`.
    pub async fn start(
        app: Arc<dyn AsyncApplication>,
        service: &ServiceConfig,
        config: &GatewayConfig,
    ) -> Result<Self> {
        let lifespan = Lifespan::spawn(app.clone(), SharedState::new());
        lifespan.startup().await?;

        let pool = Arc::new(InstancePool::new(app, config.max_app_count));
        let sweeper = tokio::spawn(sweep(Arc::downgrade(&pool), config.sweep_interval()));

        Ok(Self {
            pool,
            lifespan,
            mount_prefix: service.mount_prefix(),
            server_header: config.server_header(),
            sweeper,
        })
    }

    pub fn build_scope(&self, request: &Request) -> HttpScope {
        let headers = request
            .headers
            .merged()
            .into_iter()
            .map(|(k, v)| (k.into_bytes(), v.into_bytes()))
            .collect();

        HttpScope {
            protocol: ProtocolVersion::default(),
            http_version: "1.1".to_string(),
            method: request.method.to_string(),
            scheme: request.scheme.clone(),
            path: request.path.clone(),
            raw_path: request.path.clone().into_bytes(),
            query_string: request.query.clone().into_bytes(),
            root_path: self.mount_prefix.clone(),
            headers,
            client: None,
            server: Some((request.host.clone(), request.port)),
            state: self.lifespan.state().snapshot(),
        }
    }

    /// Drive one request through a fresh application instance.
    pub async fn handle_request(&self, request: Request) -> Result<Response> {
        let scope = self.build_scope(&request);
        let id = self.pool.next_instance_id();
        debug!(instance = %id, method = %scope.method, path = %scope.path, "dispatching request");

        let (settle, settled) = oneshot::channel();
        let exchange = Arc::new(Exchange::new(&scope, &self.server_header, settle));
        let input = self.pool.spawn(id.clone(), Scope::Http(scope), exchange);
        let _ = input.send(Incoming::HttpRequest {
            body: request.body,
            more_body: false,
        });

        let result = settled
            .await
            .unwrap_or_else(|_| Err(GatewayError::application("application instance dropped")));
        self.pool.remove(&id);
        result
    }

    /// Run lifespan shutdown. Skipped when the lifespan scope already failed.
    pub async fn shutdown(&self) -> Result<()> {
        self.lifespan.shutdown().await
    }

    pub fn state(&self) -> &SharedState {
        self.lifespan.state()
    }

    pub fn instance_count(&self) -> usize {
        self.pool.len()
    }
}

impl Drop for AsyncServer {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

async fn sweep(pool: Weak<InstancePool>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match pool.upgrade() {
            Some(pool) => pool.sweep(),
            None => return,
        }
    }
}
