//! # tether-replica
//!
//! Isolated execution contexts and the layers that route requests to them.
//!
//! - [`Replica`]: one application behind a gateway, on its own thread and
//!   runtime, reached only through a `tether-rpc` endpoint
//! - [`ReplicaPool`]: hands out admission slots, spawning replicas on demand
//! - [`announce`]: offers a request handler to a router over two
//!   sub-channels, with periodic heartbeats
//! - [`Router`]: selects a live host by service name and relays requests

pub mod announce;
pub mod config;
pub mod error;
pub mod pool;
pub mod replica;
pub mod router;

pub use announce::{announce, Announcement, Announcer, SERVER_READY};
pub use config::{PoolConfig, RouterConfig};
pub use error::{ReplicaError, Result, RouteError};
pub use pool::{Lease, ReplicaPool, RequestHandler};
pub use replica::Replica;
pub use router::{is_live, service_name, Router};
