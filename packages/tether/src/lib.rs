//! Tether: serve applications from isolated replicas behind a router.
//!
//! A request enters the [`Router`], which picks a live host by service name
//! and relays it over an RPC channel. The host is usually a [`ReplicaPool`],
//! which admits the request onto a [`Replica`]: an application running behind
//! a [`Gateway`] on its own thread, reachable only through message passing.
//!
//! This crate re-exports the layered crates:
//!
//! - `tether-core`: the [`Value`] tree and validated [`Path`]s
//! - `tether-rpc`: the wire codec, endpoints, the exposer and proxies
//! - `tether-gateway`: the synchronous and asynchronous conventions
//! - `tether-replica`: replicas, the pool, announcements and routing
//!
//! and adds [`Config`] for loading every tuning knob at once and
//! [`telemetry::init`] for installing a log subscriber.
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether::{announce, Application, Config, ReplicaPool, Router};
//!
//! tether::telemetry::init("info");
//! let config = Config::from_path("tether.json")?;
//!
//! let pool = ReplicaPool::new(Arc::new(app), config.service.clone(), config.gateway.clone(), config.pool.clone());
//! let router = Router::new(config.router.clone());
//! let (announcement, _host) = announce(&config.service.name, Arc::new(pool), config.router.heartbeat_period());
//! router.register(announcement).await;
//!
//! let response = router.fetch(request).await;
//! ```

pub mod config;
pub mod telemetry;

pub use config::{Config, ConfigError};

pub use tether_core::{Error as CoreError, Path, Value};
pub use tether_gateway::{
    AppOutput, Application, AsyncApplication, Bootstrap, Convention, Environ, Gateway,
    GatewayConfig, GatewayError, GatewayService, HeaderValue, Headers, Inbox, Incoming, Method,
    Outbox, Outgoing, Request, Response, Scope, ServiceConfig, StartResponse, SyncApplication,
};
pub use tether_replica::{
    announce, Announcement, Announcer, PoolConfig, Replica, ReplicaError, ReplicaPool,
    RequestHandler, RouteError, Router, RouterConfig,
};
pub use tether_rpc::{expose, Endpoint, Proxy, RpcError, Val};
