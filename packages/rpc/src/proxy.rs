//! The caller side: a handle that turns property access into messages.
//!
//! A [`Proxy`] is a path into the object graph exposed on the far end of an
//! endpoint. Reading a property (`get`) only extends the path; nothing is sent
//! until the proxy is awaited, assigned, called, or constructed.
//!
//! All proxies derived from one endpoint share one connection: a pending-call
//! table, a background pump that routes responses back by correlation id, a
//! reference count, and a released flag. When the last proxy is dropped, or
//! when [`Proxy::release`] is called, the connection sends RELEASE, fails any
//! call still waiting, and closes the endpoint.

use std::collections::HashMap;
use std::fmt;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tether_core::Path;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::endpoint::{Endpoint, EndpointSender, Envelope};
use crate::error::{Result, RpcError};
use crate::message::{CallId, Message, Operation, WireValue};
use crate::object::{BoxFuture, Val};
use crate::wire::{Transfers, WireCodec};

struct Reply {
    value: WireValue,
    transfer: Vec<Endpoint>,
}

type Waiter = oneshot::Sender<Result<Reply>>;

struct Connection {
    sender: Mutex<Option<EndpointSender>>,
    pending: Mutex<HashMap<CallId, Waiter>>,
    refs: AtomicUsize,
    released: AtomicBool,
    codec: WireCodec,
    pump: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    fn ensure_live(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            Err(RpcError::Released)
        } else {
            Ok(())
        }
    }

    async fn request(&self, operation: Operation, transfer: Vec<Endpoint>) -> Result<Reply> {
        self.ensure_live()?;
        self.send_request(operation, transfer).await
    }

    async fn send_request(&self, operation: Operation, transfer: Vec<Endpoint>) -> Result<Reply> {
        let id = Uuid::new_v4();
        let kind = operation.kind();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let sent = {
            let sender = lock(&self.sender);
            match sender.as_ref() {
                Some(sender) => sender.send(Envelope::with_transfer(
                    Message::Request { id, operation },
                    transfer,
                )),
                None => Err(RpcError::Released),
            }
        };
        if let Err(e) = sent {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        trace!(%id, %kind, "awaiting reply");
        rx.await.unwrap_or(Err(RpcError::Disconnected))
    }

    fn deliver(&self, envelope: Envelope) {
        let Envelope { message, transfer } = envelope;
        match message {
            Message::Response { id, value } => match lock(&self.pending).remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(Ok(Reply { value, transfer }));
                }
                None => debug!(%id, "dropping response with no pending call"),
            },
            Message::Request { id, .. } => {
                warn!(%id, "proxy endpoint received a request; ignoring");
            }
        }
    }

    fn fail_pending(&self, error: RpcError) {
        let waiters: Vec<Waiter> = lock(&self.pending).drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn close(&self) {
        lock(&self.sender).take();
    }

    fn decode(&self, reply: Reply) -> Result<Val> {
        let mut transfers = Transfers::new(reply.transfer);
        self.codec.decode(reply.value, &mut transfers)
    }

    /// Send RELEASE once, then fail what is still waiting and close.
    async fn release_endpoint(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let ack = self.send_request(Operation::Release, Vec::new()).await;
        self.fail_pending(RpcError::Released);
        self.close();
        debug!("proxy endpoint released");

        match ack {
            Ok(_) | Err(RpcError::Disconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let pump = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }
    }
}

/// A remote reference to a value exposed on the other end of an endpoint.
///
/// Awaiting a proxy reads the value at its path. Awaiting a proxy at the root
/// resolves to the proxy itself, so a freshly wrapped endpoint can be handed
/// through async code without triggering a GET of the whole root.
pub struct Proxy {
    conn: Arc<Connection>,
    path: Path,
}

impl Proxy {
    /// Wrap an endpoint using the default codec.
    pub fn wrap(endpoint: Endpoint) -> Proxy {
        Self::wrap_with(endpoint, WireCodec::default())
    }

    /// Wrap an endpoint, spawning its response pump on the current runtime.
    pub fn wrap_with(endpoint: Endpoint, codec: WireCodec) -> Proxy {
        let (sender, mut receiver) = endpoint.split();
        let conn = Arc::new(Connection {
            sender: Mutex::new(Some(sender)),
            pending: Mutex::new(HashMap::new()),
            refs: AtomicUsize::new(1),
            released: AtomicBool::new(false),
            codec,
            pump: Mutex::new(None),
        });

        let weak = Arc::downgrade(&conn);
        let pump = tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let Some(conn) = weak.upgrade() else {
                    return;
                };
                conn.deliver(envelope);
            }
            if let Some(conn) = weak.upgrade() {
                conn.fail_pending(RpcError::Disconnected);
            }
        });
        *lock(&conn.pump) = Some(pump);

        Proxy {
            conn,
            path: Path::root(),
        }
    }

    fn retain(conn: &Arc<Connection>, path: Path) -> Proxy {
        conn.refs.fetch_add(1, Ordering::AcqRel);
        Proxy {
            conn: conn.clone(),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.conn.released.load(Ordering::Acquire)
    }

    /// Live proxies sharing this endpoint.
    pub fn ref_count(&self) -> usize {
        self.conn.refs.load(Ordering::Acquire)
    }

    /// A proxy one property further along. Sends nothing.
    pub fn get(&self, name: &str) -> Result<Proxy> {
        self.conn.ensure_live()?;
        let path = self.path.child(name)?;
        Ok(Proxy::retain(&self.conn, path))
    }

    /// Read the value at this path.
    pub async fn value(&self) -> Result<Val> {
        self.conn.ensure_live()?;
        if self.path.is_empty() {
            return Ok(Val::Remote(self.clone()));
        }

        let reply = self
            .conn
            .request(
                Operation::Get {
                    path: self.path.clone(),
                },
                Vec::new(),
            )
            .await?;
        self.conn.decode(reply)
    }

    /// Assign to the property at this path.
    pub async fn set(&self, value: impl Into<Val>) -> Result<()> {
        self.conn.ensure_live()?;
        let (wire, transfer) = self.conn.codec.encode(value.into())?;
        let reply = self
            .conn
            .request(
                Operation::Set {
                    path: self.path.clone(),
                    value: wire,
                },
                transfer,
            )
            .await?;
        self.conn.decode(reply).map(|_| ())
    }

    /// Invoke the function at this path with its parent as receiver.
    ///
    /// Calling a proxy whose last component is `bind` sends nothing and
    /// yields a proxy for the parent path.
    pub async fn call(&self, arguments: Vec<Val>) -> Result<Val> {
        self.conn.ensure_live()?;
        if self.path.last() == Some("bind") {
            return Ok(Val::Remote(Proxy::retain(&self.conn, self.path.parent())));
        }

        let (wire, transfer) = self.conn.codec.encode_all(arguments)?;
        let reply = self
            .conn
            .request(
                Operation::Apply {
                    path: self.path.clone(),
                    arguments: wire,
                },
                transfer,
            )
            .await?;
        self.conn.decode(reply)
    }

    /// Construct the class at this path; the instance stays remote.
    pub async fn construct(&self, arguments: Vec<Val>) -> Result<Proxy> {
        self.conn.ensure_live()?;
        let (wire, transfer) = self.conn.codec.encode_all(arguments)?;
        let reply = self
            .conn
            .request(
                Operation::Construct {
                    path: self.path.clone(),
                    arguments: wire,
                },
                transfer,
            )
            .await?;
        self.conn
            .decode(reply)?
            .into_remote()
            .ok_or_else(|| RpcError::protocol("constructor result was not remoted"))
    }

    /// Ask the far side for a fresh endpoint exposing the same root.
    pub async fn endpoint(&self) -> Result<Endpoint> {
        let reply = self.conn.request(Operation::Endpoint, Vec::new()).await?;
        let mut transfers = Transfers::new(reply.transfer);
        self.conn.codec.decode(reply.value, &mut transfers)?;
        transfers
            .into_remaining()
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::protocol("ENDPOINT reply carried no endpoint"))
    }

    /// Release the endpoint. Every proxy sharing it becomes unusable.
    ///
    /// Releasing twice is harmless.
    pub async fn release(self) -> Result<()> {
        self.conn.release_endpoint().await
    }
}

impl Clone for Proxy {
    fn clone(&self) -> Self {
        Proxy::retain(&self.conn, self.path.clone())
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if self.conn.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if self.is_released() {
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                let conn = self.conn.clone();
                handle.spawn(async move {
                    if let Err(e) = conn.release_endpoint().await {
                        debug!(error = %e, "release on drop failed");
                    }
                });
            }
            Err(_) => {
                self.conn.released.store(true, Ordering::Release);
                self.conn.fail_pending(RpcError::Released);
                self.conn.close();
            }
        }
    }
}

impl IntoFuture for Proxy {
    type Output = Result<Val>;
    type IntoFuture = BoxFuture<Result<Val>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.value().await })
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("path", &self.path.to_string())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expose::expose;
    use crate::object::{Function, ObjectMap, Thrown};
    use std::time::Duration;
    use tether_core::{path, Value};

    fn echo_root() -> ObjectMap {
        ObjectMap::new()
            .with(
                "echo",
                Function::new(|args| async move {
                    Ok(args.into_iter().next().unwrap_or_else(Val::null))
                }),
            )
            .with(
                "slow",
                Function::new(|args| async move {
                    let ms = args
                        .first()
                        .and_then(|a| a.as_data())
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                    Ok(Val::from(ms))
                }),
            )
            .with(
                "fail",
                Function::new(|_| async move { Err(Thrown::message("nope")) }),
            )
    }

    #[tokio::test]
    async fn awaiting_root_yields_the_proxy() {
        let (local, remote) = Endpoint::pair();
        expose(Arc::new(echo_root()), local);
        let proxy = Proxy::wrap(remote);

        let resolved = proxy.clone().await.unwrap();
        let again = resolved.into_remote().unwrap();
        assert!(again.path().is_empty());
        assert!(!again.is_released());
    }

    #[tokio::test]
    async fn get_sends_nothing_until_awaited() {
        let (mut server, client) = Endpoint::pair();
        let proxy = Proxy::wrap(client);

        let deep = proxy.get("a").unwrap().get("b").unwrap();
        assert_eq!(deep.path(), &path!("a/b"));
        assert_eq!(proxy.ref_count(), 2);

        let pending = tokio::spawn(deep.into_future());
        let envelope = server.recv().await.unwrap();
        let Message::Request { id, operation } = envelope.message else {
            panic!("expected a request");
        };
        assert_eq!(operation, Operation::Get { path: path!("a/b") });

        server
            .post(Message::Response {
                id,
                value: WireValue::Raw(Value::from("found")),
            })
            .unwrap();
        let value = pending.await.unwrap().unwrap();
        assert_eq!(value.as_str(), Some("found"));
    }

    #[tokio::test]
    async fn concurrent_calls_correlate_independently() {
        let (local, remote) = Endpoint::pair();
        expose(Arc::new(echo_root()), local);
        let proxy = Proxy::wrap(remote);
        let slow = proxy.get("slow").unwrap();

        let (long, short) = tokio::join!(
            slow.call(vec![Val::from(50i64)]),
            slow.call(vec![Val::from(1i64)])
        );
        assert_eq!(long.unwrap().into_data(), Some(Value::from(50i64)));
        assert_eq!(short.unwrap().into_data(), Some(Value::from(1i64)));
    }

    #[tokio::test]
    async fn remote_faults_reraise() {
        let (local, remote) = Endpoint::pair();
        expose(Arc::new(echo_root()), local);
        let proxy = Proxy::wrap(remote);

        let err = proxy.get("fail").unwrap().call(vec![]).await.unwrap_err();
        assert_eq!(err.thrown(), Some(&Thrown::message("nope")));
    }

    #[tokio::test]
    async fn bind_returns_parent_without_sending() {
        let (mut server, client) = Endpoint::pair();
        let proxy = Proxy::wrap(client);

        let bound = proxy
            .get("obj")
            .unwrap()
            .get("bind")
            .unwrap()
            .call(vec![])
            .await
            .unwrap();
        assert_eq!(bound.into_remote().unwrap().path(), &path!("obj"));

        drop(proxy);
        // Only the RELEASE from dropping the last proxy reaches the server.
        let envelope = server.recv().await.unwrap();
        assert!(matches!(
            envelope.message,
            Message::Request {
                operation: Operation::Release,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_responses_are_dropped() {
        let (mut server, client) = Endpoint::pair();
        let proxy = Proxy::wrap(client);
        let target = proxy.get("x").unwrap();
        let pending = tokio::spawn(target.into_future());

        let envelope = server.recv().await.unwrap();
        let id = envelope.message.id();
        server
            .post(Message::Response {
                id: Uuid::new_v4(),
                value: WireValue::Raw(Value::from("stray")),
            })
            .unwrap();
        server
            .post(Message::Response {
                id,
                value: WireValue::Raw(Value::from("real")),
            })
            .unwrap();

        assert_eq!(pending.await.unwrap().unwrap().as_str(), Some("real"));
    }

    #[tokio::test]
    async fn release_fails_pending_and_later_calls() {
        let (mut server, client) = Endpoint::pair();
        let proxy = Proxy::wrap(client);
        let target = proxy.get("work").unwrap();

        let in_flight = {
            let target = target.clone();
            tokio::spawn(async move { target.call(vec![]).await })
        };
        let apply = server.recv().await.unwrap();
        assert!(matches!(
            apply.message,
            Message::Request {
                operation: Operation::Apply { .. },
                ..
            }
        ));

        let responder = tokio::spawn(async move {
            let envelope = server.recv().await.unwrap();
            assert!(matches!(
                envelope.message,
                Message::Request {
                    operation: Operation::Release,
                    ..
                }
            ));
            server
                .post(Message::Response {
                    id: envelope.message.id(),
                    value: WireValue::null(),
                })
                .unwrap();
            server
        });

        proxy.clone().release().await.unwrap();
        let mut server = responder.await.unwrap();

        assert!(matches!(in_flight.await.unwrap(), Err(RpcError::Released)));
        assert!(target.is_released());
        assert!(matches!(target.call(vec![]).await, Err(RpcError::Released)));
        assert!(matches!(target.get("more"), Err(RpcError::Released)));
        assert!(matches!(proxy.clone().await, Err(RpcError::Released)));

        // The released side sent nothing further and closed its end.
        assert!(server.recv().await.is_none());

        // A second release is a no-op.
        proxy.release().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_last_proxy_releases() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let hits = finalized.clone();
        let root = ObjectMap::new().on_finalize(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        let (local, remote) = Endpoint::pair();
        let served = expose(Arc::new(root), local);
        let proxy = Proxy::wrap(remote);
        let child = proxy.get("x").unwrap();

        drop(proxy);
        assert_eq!(child.ref_count(), 1);
        drop(child);

        served.await.unwrap();
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn endpoint_yields_independent_channel() {
        let (local, remote) = Endpoint::pair();
        expose(Arc::new(echo_root()), local);
        let proxy = Proxy::wrap(remote);

        let sub = Proxy::wrap(proxy.endpoint().await.unwrap());
        let reply = sub
            .get("echo")
            .unwrap()
            .call(vec![Val::from("sub")])
            .await
            .unwrap();
        assert_eq!(reply.as_str(), Some("sub"));

        sub.release().await.unwrap();
        let still = proxy
            .get("echo")
            .unwrap()
            .call(vec![Val::from("main")])
            .await
            .unwrap();
        assert_eq!(still.as_str(), Some("main"));
    }

    #[tokio::test]
    async fn closed_peer_fails_pending_calls() {
        let (mut server, client) = Endpoint::pair();
        let proxy = Proxy::wrap(client);
        let pending = tokio::spawn(proxy.get("x").unwrap().into_future());

        let _ = server.recv().await.unwrap();
        server.close();

        assert!(matches!(
            pending.await.unwrap(),
            Err(RpcError::Disconnected)
        ));
    }
}
