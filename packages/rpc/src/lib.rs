//! # tether-rpc
//!
//! A structural remote-proxy protocol over asynchronous message channels.
//!
//! One side *exposes* a local object graph on an [`Endpoint`]; the other side
//! *wraps* the far end in a [`Proxy`]. Every interaction with the proxy
//! (property read, assignment, call, construction) becomes an [`Operation`]
//! message that the exposer interprets against the real objects, answered by a
//! correlated response.
//!
//! ```ignore
//! use tether_rpc::{expose, Endpoint, Function, ObjectMap, Proxy, Val};
//!
//! let (local, remote) = Endpoint::pair();
//! let root = ObjectMap::new()
//!     .with("greet", Function::new(|args| async move {
//!         let name = args.first().and_then(Val::as_str).unwrap_or("world").to_string();
//!         Ok(Val::from(format!("hello, {name}")))
//!     }));
//! expose(Arc::new(root), local);
//!
//! let proxy = Proxy::wrap(remote);
//! let reply = proxy.get("greet")?.call(vec![Val::from("tether")]).await?;
//! ```
//!
//! Values cross the channel through a [`WireCodec`]: plain data is copied,
//! objects marked with [`Val::Proxied`] stay resident behind a fresh
//! sub-channel, and thrown faults are re-raised at the caller.

pub mod endpoint;
pub mod error;
pub mod expose;
pub mod message;
pub mod object;
pub mod proxy;
pub mod wire;

pub use endpoint::{Endpoint, EndpointReceiver, EndpointSender, Envelope};
pub use error::{Result, RpcError};
pub use expose::{expose, expose_with};
pub use message::{CallId, Message, Operation, OperationKind, WireValue};
pub use object::{
    Callable, Class, Constructible, Function, Gettable, Object, ObjectMap, Settable, Thrown, Val,
};
pub use proxy::Proxy;
pub use wire::{ProxyHandler, ThrowHandler, TransferHandler, Transfers, WireCodec};
