//! # tether-gateway
//!
//! Adapts canonical [`Request`]s to a downstream application and collects a
//! canonical [`Response`].
//!
//! Two conventions are supported, picked once when the application loads:
//!
//! - **synchronous** ([`SyncApplication`]): one call per request with an
//!   environment record and a response-start callback; the body is the
//!   iterator the application returns.
//! - **asynchronous** ([`AsyncApplication`]): the application is driven by
//!   events over an [`Inbox`]/[`Outbox`] pair, one instance per request, with
//!   a lifespan scope framing startup and shutdown.
//!
//! [`GatewayService`] wraps a [`Gateway`] as an object a replica exposes over
//! a `tether-rpc` endpoint.

pub mod async_app;
pub mod config;
pub mod error;
pub mod gateway;
pub mod headers;
mod instance;
mod lifespan;
pub mod sync_app;
pub mod transport;
pub mod types;

pub use async_app::{
    AsyncApplication, AsyncServer, HttpScope, Inbox, Incoming, LifespanScope, Outbox, Outgoing,
    ProtocolVersion, Scope, SharedState,
};
pub use config::{GatewayConfig, ServiceConfig};
pub use error::{GatewayError, Result};
pub use gateway::{Application, Bootstrap, Convention, Gateway, GatewayService, TIMEOUT_STATUS};
pub use headers::{default_server_header, normalize_headers};
pub use sync_app::{AppOutput, BodyWriter, Environ, ErrorStream, StartResponse, SyncApplication, SyncServer};
pub use transport::{from_transport, into_transport};
pub use types::{HeaderValue, Headers, Method, Request, Response, ResponseHeaders};
