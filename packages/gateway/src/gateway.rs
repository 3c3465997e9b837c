//! The per-replica gateway and the object a replica exposes for it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tether_core::Value;
use tether_rpc::{Function, Gettable, Object, Thrown, Val};
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::async_app::{AsyncApplication, AsyncServer};
use crate::config::{GatewayConfig, ServiceConfig};
use crate::error::{GatewayError, Result};
use crate::sync_app::{SyncApplication, SyncServer};
use crate::types::{Request, Response};

/// Status of the synthetic response for a synchronous call that overran
/// its deadline.
pub const TIMEOUT_STATUS: u16 = 504;

/// The two invocation conventions a gateway can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    Sync,
    Async,
}

/// A loaded application, tagged with its convention.
#[derive(Clone)]
pub enum Application {
    Sync(Arc<dyn SyncApplication>),
    Async(Arc<dyn AsyncApplication>),
}

impl Application {
    pub fn sync(app: impl SyncApplication) -> Self {
        Application::Sync(Arc::new(app))
    }

    pub fn asynchronous(app: impl AsyncApplication) -> Self {
        Application::Async(Arc::new(app))
    }

    pub fn convention(&self) -> Convention {
        match self {
            Application::Sync(_) => Convention::Sync,
            Application::Async(_) => Convention::Async,
        }
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Application::{:?}", self.convention())
    }
}

/// Loads the application a replica serves.
#[async_trait]
pub trait Bootstrap: Send + Sync {
    async fn load(&self, service: &ServiceConfig) -> Result<Application>;
}

/// An already-loaded application bootstraps to itself.
#[async_trait]
impl Bootstrap for Application {
    async fn load(&self, _service: &ServiceConfig) -> Result<Application> {
        Ok(self.clone())
    }
}

enum Server {
    Sync(SyncServer),
    Async(AsyncServer),
}

/// Adapts canonical requests to one loaded application.
pub struct Gateway {
    server: Server,
}

impl Gateway {
    /// Load the application and bring it up. For the asynchronous convention
    /// this includes lifespan startup.
    pub async fn start(
        bootstrap: &dyn Bootstrap,
        service: &ServiceConfig,
        config: &GatewayConfig,
    ) -> Result<Self> {
        let app = bootstrap.load(service).await?;
        info!(service = %service.name, convention = ?app.convention(), "application loaded");

        let server = match app {
            Application::Sync(app) => Server::Sync(SyncServer::new(app, service, config)),
            Application::Async(app) => {
                Server::Async(AsyncServer::start(app, service, config).await?)
            }
        };
        Ok(Self { server })
    }

    pub fn convention(&self) -> Convention {
        match self.server {
            Server::Sync(_) => Convention::Sync,
            Server::Async(_) => Convention::Async,
        }
    }

    /// Handle a request, surfacing faults as errors.
    pub async fn try_handle(&self, request: Request) -> Result<Response> {
        match &self.server {
            Server::Sync(server) => server.handle_request(request).await,
            Server::Async(server) => server.handle_request(request).await,
        }
    }

    /// Handle a request. Faults become synthetic responses: `504` for a
    /// synchronous deadline, `500` for everything else.
    pub async fn handle_request(&self, request: Request) -> Response {
        let method = request.method.clone();
        let path = request.path.clone();
        match self.try_handle(request).await {
            Ok(response) => response,
            Err(GatewayError::Timeout) => {
                warn!(%method, %path, "application timed out");
                Response::text(TIMEOUT_STATUS, "gateway timeout")
            }
            Err(err) => {
                error!(%method, %path, error = %err, "request failed");
                Response::text(500, "server internal error")
            }
        }
    }

    /// Run lifespan shutdown. A no-op for the synchronous convention.
    pub async fn shutdown(&self) -> Result<()> {
        match &self.server {
            Server::Sync(_) => Ok(()),
            Server::Async(server) => server.shutdown().await,
        }
    }

    /// Live application instances; always 0 for the synchronous convention.
    pub fn instance_count(&self) -> usize {
        match &self.server {
            Server::Sync(_) => 0,
            Server::Async(server) => server.instance_count(),
        }
    }
}

struct ServiceState {
    bootstrap: Arc<dyn Bootstrap>,
    config: GatewayConfig,
    gateway: OnceCell<Arc<Gateway>>,
}

impl ServiceState {
    fn convention(&self) -> Option<Convention> {
        self.gateway.get().map(|gateway| gateway.convention())
    }

    fn flags(&self) -> Val {
        let convention = self.convention();
        let mut map = BTreeMap::new();
        map.insert(
            "is_sync_convention".to_string(),
            Value::from(convention == Some(Convention::Sync)),
        );
        map.insert(
            "is_async_convention".to_string(),
            Value::from(convention == Some(Convention::Async)),
        );
        Val::from(Value::Map(map))
    }

    async fn start(&self, arguments: Vec<Val>) -> std::result::Result<Val, Thrown> {
        let service = match arguments.first().and_then(Val::as_data) {
            Some(value) => ServiceConfig::from_value(value)
                .map_err(|e| Thrown::type_error(e.to_string()))?,
            None => ServiceConfig::default(),
        };

        self.gateway
            .get_or_try_init(|| async {
                Gateway::start(self.bootstrap.as_ref(), &service, &self.config)
                    .await
                    .map(Arc::new)
            })
            .await
            .map_err(|e| Thrown::error("StartupError", e.to_string()))?;
        Ok(self.flags())
    }

    async fn handle_request(&self, arguments: Vec<Val>) -> std::result::Result<Val, Thrown> {
        let request = arguments
            .first()
            .and_then(Val::as_data)
            .ok_or_else(|| Thrown::type_error("handle_request expects a request"))
            .and_then(|value| {
                Request::from_value(value).map_err(|e| Thrown::type_error(e.to_string()))
            })?;

        let response = match self.gateway.get() {
            Some(gateway) => gateway.handle_request(request).await,
            None => Response::text(500, "server not started"),
        };
        Ok(Val::from(response.to_value()))
    }

    async fn shutdown(&self) -> std::result::Result<Val, Thrown> {
        if let Some(gateway) = self.gateway.get() {
            gateway
                .shutdown()
                .await
                .map_err(|e| Thrown::error("ShutdownError", e.to_string()))?;
        }
        Ok(Val::null())
    }
}

/// The object a replica exposes over its endpoint.
///
/// Properties: `start(service)`, `handle_request(request)`, `shutdown()`,
/// and the `is_sync_convention` / `is_async_convention` flags.
#[derive(Clone)]
pub struct GatewayService {
    state: Arc<ServiceState>,
}

impl GatewayService {
    pub fn new(bootstrap: Arc<dyn Bootstrap>, config: GatewayConfig) -> Self {
        Self {
            state: Arc::new(ServiceState {
                bootstrap,
                config,
                gateway: OnceCell::new(),
            }),
        }
    }

    pub fn gateway(&self) -> Option<Arc<Gateway>> {
        self.state.gateway.get().cloned()
    }
}

impl Gettable for GatewayService {
    fn get(&self, name: &str) -> Option<Val> {
        let state = self.state.clone();
        let val = match name {
            "start" => Function::new(move |args| {
                let state = state.clone();
                async move { state.start(args).await }
            })
            .into(),
            "handle_request" => Function::new(move |args| {
                let state = state.clone();
                async move { state.handle_request(args).await }
            })
            .into(),
            "shutdown" => Function::new(move |_| {
                let state = state.clone();
                async move { state.shutdown().await }
            })
            .into(),
            "is_sync_convention" => Val::from(state.convention() == Some(Convention::Sync)),
            "is_async_convention" => Val::from(state.convention() == Some(Convention::Async)),
            _ => return None,
        };
        Some(val)
    }
}

impl Object for GatewayService {
    fn gettable(&self) -> Option<&dyn Gettable> {
        Some(self)
    }

    fn type_name(&self) -> &'static str {
        "GatewayService"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_app::{Inbox, Outbox, Outgoing, Scope};
    use crate::sync_app::{AppOutput, Environ, StartResponse};
    use tether_rpc::{expose, Endpoint, Proxy};

    fn hello() -> Application {
        Application::sync(|_: &mut Environ, start: &mut StartResponse| -> Result<AppOutput> {
            start.start("200 OK", [("content-type", "text/plain")], None)?;
            Ok(AppOutput::chunks(vec![b"hi".to_vec()]))
        })
    }

    #[tokio::test]
    async fn sync_application_is_detected() {
        let gateway = Gateway::start(&hello(), &ServiceConfig::default(), &GatewayConfig::default())
            .await
            .unwrap();
        assert_eq!(gateway.convention(), Convention::Sync);
        assert_eq!(gateway.handle_request(Request::get("/")).await.body, b"hi");
    }

    #[tokio::test]
    async fn faults_become_500() {
        let app = Application::sync(|_: &mut Environ, _: &mut StartResponse| -> Result<AppOutput> {
            Err(GatewayError::application("template missing"))
        });
        let gateway = Gateway::start(&app, &ServiceConfig::default(), &GatewayConfig::default())
            .await
            .unwrap();
        let response = gateway.handle_request(Request::get("/")).await;
        assert_eq!(response.status, 500);
        assert_eq!(response.body_text(), "server internal error");
    }

    #[tokio::test]
    async fn async_application_is_detected() {
        let app = Application::asynchronous(|scope: Scope, _: Inbox, outbox: Outbox| async move {
            if let Scope::Http(_) = scope {
                outbox.send(Outgoing::start(200, [("a", "b")])).await?;
                outbox.send(Outgoing::body("ok")).await?;
            }
            Ok::<_, GatewayError>(())
        });
        let gateway = Gateway::start(&app, &ServiceConfig::default(), &GatewayConfig::default())
            .await
            .unwrap();
        assert_eq!(gateway.convention(), Convention::Async);
        assert_eq!(gateway.handle_request(Request::get("/")).await.body_text(), "ok");
    }

    #[tokio::test]
    async fn service_answers_over_an_endpoint() {
        let service = GatewayService::new(Arc::new(hello()), GatewayConfig::default());
        let (local, remote) = Endpoint::pair();
        let _server = expose(Arc::new(service), remote);
        let proxy = Proxy::wrap(local);

        let early = proxy
            .get("handle_request")
            .unwrap()
            .call(vec![Val::from(Request::get("/").to_value())])
            .await
            .unwrap();
        let early = Response::from_value(early.as_data().unwrap()).unwrap();
        assert_eq!(early.status, 500);
        assert_eq!(early.body_text(), "server not started");

        let flags = proxy
            .get("start")
            .unwrap()
            .call(vec![Val::from(ServiceConfig::new("svc", "").to_value())])
            .await
            .unwrap();
        let flags = flags.into_data().unwrap();
        assert_eq!(flags.as_map().unwrap()["is_sync_convention"], Value::from(true));

        let reply = proxy
            .get("handle_request")
            .unwrap()
            .call(vec![Val::from(Request::get("/hello").to_value())])
            .await
            .unwrap();
        let response = Response::from_value(reply.as_data().unwrap()).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body_text(), "hi");
    }
}
