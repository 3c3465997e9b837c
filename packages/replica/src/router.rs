//! Heartbeat-based routing of requests to announced hosts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use rand::Rng;
use tether_gateway::{from_transport, into_transport, Request, Response};
use tether_rpc::{expose, Function, ObjectMap, Proxy, Thrown, Val};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::announce::Announcement;
use crate::config::RouterConfig;
use crate::error::RouteError;

const FIRST_SERVER_ID: u64 = 1000;

/// Whether a registration last heard from at `last` is live at `now`.
///
/// Live means `now` falls in `[last, last + window)`.
pub fn is_live(last: Instant, now: Instant, window: Duration) -> bool {
    now >= last && now < last + window
}

/// Whether the window opened at `last` has closed by `now`.
fn is_expired(last: Instant, now: Instant, window: Duration) -> bool {
    now >= last + window
}

struct Registration {
    name: String,
    last_heartbeat: Instant,
    requests: Proxy,
    listener: JoinHandle<()>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

type Registry = Mutex<BTreeMap<String, Registration>>;

fn lock(registry: &Registry) -> MutexGuard<'_, BTreeMap<String, Registration>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Maps service names to live announced hosts.
pub struct Router {
    config: RouterConfig,
    registry: Arc<Registry>,
    next_id: AtomicU64,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: AtomicU64::new(FIRST_SERVER_ID),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Accept an announcement and return its `server-<n>` id.
    ///
    /// Starts the heartbeat listener on the heartbeat sub-channel, wraps the
    /// request sub-channel, and tells the host its id.
    pub async fn register(&self, announcement: Announcement) -> String {
        self.prune(Instant::now());
        let id = format!("server-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = expose(
            Arc::new(heartbeat_listener(Arc::downgrade(&self.registry))),
            announcement.heartbeat,
        );
        let requests = Proxy::wrap(announcement.requests);

        lock(&self.registry).insert(
            id.clone(),
            Registration {
                name: announcement.name.clone(),
                last_heartbeat: Instant::now(),
                requests: requests.clone(),
                listener,
            },
        );
        info!(server = %id, name = %announcement.name, "server registered");

        let assigned = match requests.get("ready_go") {
            Ok(ready_go) => ready_go.call(vec![Val::from(id.clone())]).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = assigned {
            warn!(server = %id, error = %e, "host did not accept its server id");
        }
        id
    }

    /// Record a heartbeat for `id` at `at`.
    pub fn touch(&self, id: &str, at: Instant) -> Result<(), RouteError> {
        touch(&self.registry, id, at)
    }

    pub fn is_live_at(&self, id: &str, now: Instant) -> Result<bool, RouteError> {
        lock(&self.registry)
            .get(id)
            .map(|r| is_live(r.last_heartbeat, now, self.config.heartbeat_window()))
            .ok_or_else(|| RouteError::UnknownServer { id: id.to_string() })
    }

    /// Live registrations for `name` at `now`.
    pub fn live(&self, name: &str, now: Instant) -> Vec<String> {
        let window = self.config.heartbeat_window();
        lock(&self.registry)
            .iter()
            .filter(|(_, r)| r.name == name && is_live(r.last_heartbeat, now, window))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Pick uniformly at random among the live registrations for `name`.
    pub fn select(&self, name: &str, now: Instant) -> Result<(String, Proxy), RouteError> {
        let window = self.config.heartbeat_window();
        let registry = lock(&self.registry);
        let live: Vec<(&String, &Registration)> = registry
            .iter()
            .filter(|(_, r)| r.name == name && is_live(r.last_heartbeat, now, window))
            .collect();

        if live.is_empty() {
            return Err(RouteError::NoLiveReplica {
                name: name.to_string(),
            });
        }
        let (id, registration) = live[rand::thread_rng().gen_range(0..live.len())];
        Ok((id.clone(), registration.requests.clone()))
    }

    /// Drop registrations whose window closed by `now`, returning their ids.
    ///
    /// Runs on every registration and relayed request. A heartbeat stamped
    /// after `now` is kept.
    pub fn prune(&self, now: Instant) -> Vec<String> {
        let window = self.config.heartbeat_window();
        let mut registry = lock(&self.registry);
        let stale: Vec<String> = registry
            .iter()
            .filter(|(_, r)| is_expired(r.last_heartbeat, now, window))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(registration) = registry.remove(id) {
                info!(server = %id, name = %registration.name, "heartbeat expired");
            }
        }
        stale
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Relay a request to a live host serving `name`.
    ///
    /// No live host yields `500 Server not Started`.
    pub async fn handle_request(&self, name: &str, request: Request) -> Response {
        let now = Instant::now();
        self.prune(now);
        let (id, requests) = match self.select(name, now) {
            Ok(selected) => selected,
            Err(e) => {
                info!(error = %e, "Server not Started");
                return Response::text(500, "Server not Started");
            }
        };
        debug!(server = %id, method = %request.method, path = %request.path, "relaying request");

        let reply = match requests.get("handle_request") {
            Ok(handle) => handle.call(vec![Val::from(request.to_value())]).await,
            Err(e) => Err(e),
        };
        let response = reply.map_err(|e| e.to_string()).and_then(|val| match val.as_data() {
            Some(value) => Response::from_value(value).map_err(|e| e.to_string()),
            None => Err(format!("expected data, got {}", val.kind())),
        });
        match response {
            Ok(response) => response,
            Err(e) => {
                error!(server = %id, error = %e, "relay failed");
                Response::text(500, "server internal error")
            }
        }
    }

    /// Serve a transport-level request. The first path segment names the
    /// service.
    pub async fn fetch(&self, request: http::Request<Vec<u8>>) -> http::Response<Vec<u8>> {
        let response = match from_transport(request) {
            Ok(request) => {
                let name = service_name(&request.path).to_string();
                self.handle_request(&name, request).await
            }
            Err(e) => {
                warn!(error = %e, "rejecting malformed request");
                Response::text(400, "bad request")
            }
        };

        into_transport(response).unwrap_or_else(|e| {
            error!(error = %e, "response could not be converted");
            let mut fallback = http::Response::new(b"server internal error".to_vec());
            *fallback.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

/// The service a request path belongs to: its first segment.
pub fn service_name(path: &str) -> &str {
    path.trim_start_matches('/').split('/').next().unwrap_or_default()
}

fn touch(registry: &Registry, id: &str, at: Instant) -> Result<(), RouteError> {
    match lock(registry).get_mut(id) {
        Some(registration) => {
            registration.last_heartbeat = at;
            Ok(())
        }
        None => Err(RouteError::UnknownServer { id: id.to_string() }),
    }
}

fn heartbeat_listener(registry: Weak<Registry>) -> ObjectMap {
    ObjectMap::new().with(
        "ping",
        Function::new(move |args| {
            let registry = registry.clone();
            async move {
                let id = args
                    .first()
                    .and_then(Val::as_str)
                    .ok_or_else(|| Thrown::type_error("ping expects a server id"))?;
                let registry = registry
                    .upgrade()
                    .ok_or_else(|| Thrown::message("router stopped"))?;
                touch(&registry, id, Instant::now())
                    .map_err(|e| Thrown::error("RouteError", e.to_string()))?;
                Ok(Val::null())
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_half_open() {
        let t0 = Instant::now();
        let window = Duration::from_millis(1000);
        assert!(is_live(t0, t0, window));
        assert!(is_live(t0, t0 + window - Duration::from_millis(1), window));
        assert!(!is_live(t0, t0 + window, window));
        assert!(!is_live(t0 + Duration::from_millis(5), t0, window));
    }

    #[test]
    fn only_closed_windows_expire() {
        let t0 = Instant::now();
        let window = Duration::from_millis(1000);
        assert!(!is_expired(t0, t0, window));
        assert!(!is_expired(t0 + Duration::from_millis(5), t0, window));
        assert!(is_expired(t0, t0 + window, window));
    }

    #[test]
    fn service_name_is_the_first_segment() {
        assert_eq!(service_name("/blog/posts/1"), "blog");
        assert_eq!(service_name("/blog"), "blog");
        assert_eq!(service_name("/"), "");
    }

    #[test]
    fn empty_router_selects_nothing() {
        let router = Router::default();
        assert!(router.is_empty());
        assert_eq!(
            router.select("svc", Instant::now()).unwrap_err(),
            RouteError::NoLiveReplica {
                name: "svc".to_string()
            }
        );
        assert!(router.touch("server-1000", Instant::now()).is_err());
    }
}
