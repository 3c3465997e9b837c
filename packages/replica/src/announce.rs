//! Announcing a request handler to a router.
//!
//! An announcement carries two sub-channels: the router exposes a heartbeat
//! listener on one, and the host exposes its request handler on the other.
//! Once the router assigns a server id, the host pings with it on a fixed
//! period until the [`Announcer`] is dropped.

use std::sync::Arc;
use std::time::Duration;

use tether_gateway::Request;
use tether_rpc::{expose, Endpoint, Function, ObjectMap, Proxy, Thrown, Val};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::pool::RequestHandler;

/// The message type a host sends when it is ready to serve.
pub const SERVER_READY: &str = "server-ready";

/// A host's offer to serve requests for `name`.
#[derive(Debug)]
pub struct Announcement {
    pub name: String,
    /// Router end of the heartbeat sub-channel.
    pub heartbeat: Endpoint,
    /// Router end of the request-relay sub-channel.
    pub requests: Endpoint,
}

impl Announcement {
    pub fn kind(&self) -> &'static str {
        SERVER_READY
    }
}

/// Host side of an announcement. Dropping it stops heartbeats and closes the
/// request sub-channel.
pub struct Announcer {
    server_id: watch::Receiver<Option<String>>,
    heartbeat: JoinHandle<()>,
    exposed: JoinHandle<()>,
}

impl Announcer {
    /// The id the router assigned, once it has.
    pub fn server_id(&self) -> Option<String> {
        self.server_id.borrow().clone()
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.heartbeat.abort();
        self.exposed.abort();
    }
}

/// Offer `handler` under `name`. Send the [`Announcement`] to a router and
/// keep the [`Announcer`] for as long as the host should stay routable.
pub fn announce(
    name: impl Into<String>,
    handler: Arc<dyn RequestHandler>,
    period: Duration,
) -> (Announcement, Announcer) {
    let (heartbeat_host, heartbeat_router) = Endpoint::pair();
    let (requests_host, requests_router) = Endpoint::pair();
    let (assign, assigned) = watch::channel(None::<String>);
    let assign = Arc::new(assign);

    let host = ObjectMap::new()
        .with(
            "handle_request",
            Function::new(move |args| {
                let handler = handler.clone();
                async move {
                    let request = args
                        .first()
                        .and_then(Val::as_data)
                        .ok_or_else(|| Thrown::type_error("handle_request expects a request"))
                        .and_then(|value| {
                            Request::from_value(value).map_err(|e| Thrown::type_error(e.to_string()))
                        })?;
                    Ok(Val::from(handler.handle_request(request).await.to_value()))
                }
            }),
        )
        .with(
            "ready_go",
            Function::new(move |args| {
                let assign = assign.clone();
                async move {
                    let id = args
                        .first()
                        .and_then(Val::as_str)
                        .ok_or_else(|| Thrown::type_error("ready_go expects a server id"))?
                        .to_string();
                    assign.send_replace(Some(id));
                    Ok(Val::null())
                }
            }),
        );

    let exposed = expose(Arc::new(host), requests_host);
    let heartbeat = tokio::spawn(send_heartbeats(
        Proxy::wrap(heartbeat_host),
        assigned.clone(),
        period,
    ));

    let announcement = Announcement {
        name: name.into(),
        heartbeat: heartbeat_router,
        requests: requests_router,
    };
    let announcer = Announcer {
        server_id: assigned,
        heartbeat,
        exposed,
    };
    (announcement, announcer)
}

async fn send_heartbeats(
    listener: Proxy,
    mut assigned: watch::Receiver<Option<String>>,
    period: Duration,
) {
    let server_id = match assigned.wait_for(Option::is_some).await {
        Ok(id) => id.as_ref().cloned().unwrap_or_default(),
        Err(_) => return,
    };
    debug!(server = %server_id, ?period, "heartbeats started");

    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let ping = match listener.get("ping") {
            Ok(ping) => ping,
            Err(e) => {
                warn!(server = %server_id, error = %e, "heartbeat channel gone");
                return;
            }
        };
        if let Err(e) = ping.call(vec![Val::from(server_id.clone())]).await {
            warn!(server = %server_id, error = %e, "heartbeat failed");
            return;
        }
    }
}
