//! Serving a local object over an endpoint.
//!
//! The exposer reads operations off its endpoint and interprets them against
//! the root object. GET and SET are answered in arrival order; APPLY and
//! CONSTRUCT run on their own tasks so a slow call never blocks the channel.
//! Every request gets exactly one response, carrying either the result or a
//! thrown fault.

use std::sync::Arc;

use tether_core::{Path, Value};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::endpoint::{Endpoint, EndpointSender, Envelope};
use crate::message::{CallId, Message, Operation, WireValue};
use crate::object::{Object, Thrown, Val};
use crate::wire::{Transfers, WireCodec};

/// Expose `root` on `endpoint` with the default codec.
pub fn expose(root: Arc<dyn Object>, endpoint: Endpoint) -> JoinHandle<()> {
    expose_with(root, endpoint, WireCodec::default())
}

/// Expose `root` on `endpoint`, spawning the listener on the current runtime.
///
/// The returned handle completes once the endpoint is released or closed.
pub fn expose_with(root: Arc<dyn Object>, endpoint: Endpoint, codec: WireCodec) -> JoinHandle<()> {
    tokio::spawn(serve(root, endpoint, codec))
}

async fn serve(root: Arc<dyn Object>, endpoint: Endpoint, codec: WireCodec) {
    let (sender, mut receiver) = endpoint.split();

    while let Some(Envelope { message, transfer }) = receiver.recv().await {
        let (id, operation) = match message {
            Message::Request { id, operation } => (id, operation),
            Message::Response { id, .. } => {
                warn!(%id, "exposer received a response; ignoring");
                continue;
            }
        };

        trace!(%id, kind = %operation.kind(), path = ?operation.path(), "operation");
        let mut transfer = Transfers::new(transfer);

        match operation {
            Operation::Get { path } => {
                let result = resolve(&root, &path);
                reply(&sender, &codec, id, result, Vec::new());
            }
            Operation::Set { path, value } => {
                let result = codec
                    .decode(value, &mut transfer)
                    .map_err(Thrown::from)
                    .and_then(|value| assign(&root, &path, value))
                    .map(|()| Val::from(true));
                reply(&sender, &codec, id, result, Vec::new());
            }
            Operation::Apply { path, arguments } => {
                let arguments = codec.decode_all(arguments, &mut transfer);
                let (root, sender, codec) = (root.clone(), sender.clone(), codec.clone());
                tokio::spawn(async move {
                    let result = match arguments {
                        Ok(arguments) => apply(&root, &path, arguments).await,
                        Err(e) => Err(Thrown::from(e)),
                    };
                    reply(&sender, &codec, id, result, Vec::new());
                });
            }
            Operation::Construct { path, arguments } => {
                let arguments = codec.decode_all(arguments, &mut transfer);
                let (root, sender, codec) = (root.clone(), sender.clone(), codec.clone());
                tokio::spawn(async move {
                    let result = match arguments {
                        Ok(arguments) => construct(&root, &path, arguments).await,
                        Err(e) => Err(Thrown::from(e)),
                    };
                    reply(&sender, &codec, id, result, Vec::new());
                });
            }
            Operation::Endpoint => {
                let (local, remote) = Endpoint::pair();
                expose_with(root.clone(), local, codec.clone());
                reply(&sender, &codec, id, Ok(Val::null()), vec![remote]);
            }
            Operation::Release => {
                reply(&sender, &codec, id, Ok(Val::null()), Vec::new());
                receiver.close();
                debug!("endpoint released");
                root.finalize();
                return;
            }
        }
    }

    debug!("endpoint closed by peer");
}

fn reply(
    sender: &EndpointSender,
    codec: &WireCodec,
    id: CallId,
    result: Result<Val, Thrown>,
    transfer: Vec<Endpoint>,
) {
    let value = match result {
        Ok(value) => value,
        Err(thrown) => Val::Thrown(thrown),
    };

    let (wire, transfer) = match codec.encode_with(value, transfer) {
        Ok(encoded) => encoded,
        Err(e) => {
            debug!(%id, error = %e, "result could not be encoded");
            let fault = Val::Thrown(Thrown::type_error("Unserializable return value"));
            match codec.encode(fault) {
                Ok(encoded) => encoded,
                Err(_) => (WireValue::Raw(Value::Null), Vec::new()),
            }
        }
    };

    let envelope = Envelope::with_transfer(Message::Response { id, value: wire }, transfer);
    if sender.send(envelope).is_err() {
        debug!(%id, "caller went away before the reply");
    }
}

/// Read one property of a resolved value.
fn lookup(current: &Val, name: &str) -> Result<Val, Thrown> {
    let found = match current {
        Val::Object(o) | Val::Proxied(o) => o.gettable().and_then(|g| g.get(name)),
        Val::Data(v) => v.get_component(name).cloned().map(Val::Data),
        _ => None,
    };
    found.ok_or_else(|| {
        Thrown::type_error(format!(
            "cannot read property '{}' of {}",
            name,
            current.kind()
        ))
    })
}

fn resolve(root: &Arc<dyn Object>, path: &Path) -> Result<Val, Thrown> {
    path.iter()
        .try_fold(Val::Object(root.clone()), |current, name| lookup(&current, name))
}

fn assign(root: &Arc<dyn Object>, path: &Path, value: Val) -> Result<(), Thrown> {
    let Some(name) = path.last() else {
        return Err(Thrown::type_error("cannot assign to the root"));
    };
    let target = resolve(root, &path.parent())?;
    let settable = target
        .as_object()
        .and_then(|o| o.settable())
        .ok_or_else(|| {
            Thrown::type_error(format!(
                "cannot set property '{}' on {}",
                name,
                target.kind()
            ))
        })?;
    settable.set(name, value)
}

async fn apply(root: &Arc<dyn Object>, path: &Path, arguments: Vec<Val>) -> Result<Val, Thrown> {
    let receiver = resolve(root, &path.parent())?;
    let callee = match path.last() {
        Some(name) => lookup(&receiver, name)?,
        None => Val::Object(root.clone()),
    };

    match &callee {
        Val::Object(o) | Val::Proxied(o) => match o.callable() {
            Some(callable) => callable.call(receiver, arguments).await,
            None => Err(not_a_function(path)),
        },
        Val::Remote(proxy) => proxy.call(arguments).await.map_err(Thrown::from),
        _ => Err(not_a_function(path)),
    }
}

async fn construct(
    root: &Arc<dyn Object>,
    path: &Path,
    arguments: Vec<Val>,
) -> Result<Val, Thrown> {
    let target = resolve(root, path)?;
    let constructible = target
        .as_object()
        .and_then(|o| o.constructible())
        .ok_or_else(|| Thrown::type_error(format!("'{}' is not a constructor", path)))?;
    let instance = constructible.construct(arguments).await?;
    Ok(Val::Proxied(instance))
}

fn not_a_function(path: &Path) -> Thrown {
    Thrown::type_error(format!("'{}' is not a function", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Class, Function, ObjectMap};
    use crate::proxy::Proxy;
    use crate::RpcError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_core::path;
    use uuid::Uuid;

    fn counter_root() -> ObjectMap {
        ObjectMap::new()
            .with("count", 0i64)
            .with("config", Value::from(vec!["a", "b"]))
            .with(
                "double",
                Function::new(|args| async move {
                    let n = args
                        .first()
                        .and_then(|a| a.as_data())
                        .and_then(Value::as_i64)
                        .ok_or_else(|| Thrown::type_error("expected a number"))?;
                    Ok(Val::from(n * 2))
                }),
            )
            .with_object("nested", ObjectMap::new().with("deep", "value"))
            .with("secret", Val::object(ObjectMap::new()))
    }

    async fn request(endpoint: &mut Endpoint, operation: Operation) -> Envelope {
        endpoint
            .post(Message::Request {
                id: Uuid::new_v4(),
                operation,
            })
            .unwrap();
        endpoint.recv().await.unwrap()
    }

    #[tokio::test]
    async fn get_resolves_nested_paths() {
        let (local, remote) = Endpoint::pair();
        expose(Arc::new(counter_root()), local);
        let proxy = Proxy::wrap(remote);

        let deep = proxy.get("nested").unwrap().get("deep").unwrap().await.unwrap();
        assert_eq!(deep.as_str(), Some("value"));

        let second = proxy.get("config").unwrap().get("1").unwrap().await.unwrap();
        assert_eq!(second.as_str(), Some("b"));
    }

    #[tokio::test]
    async fn missing_intermediate_throws() {
        let (local, remote) = Endpoint::pair();
        expose(Arc::new(counter_root()), local);
        let proxy = Proxy::wrap(remote);

        let err = proxy
            .get("absent")
            .unwrap()
            .get("deeper")
            .unwrap()
            .await
            .unwrap_err();
        let thrown = err.thrown().unwrap();
        assert!(matches!(thrown, Thrown::Error { name, .. } if name == "TypeError"));
    }

    #[tokio::test]
    async fn set_then_get() {
        let (local, remote) = Endpoint::pair();
        expose(Arc::new(counter_root()), local);
        let proxy = Proxy::wrap(remote);

        proxy.get("count").unwrap().set(Val::from(5i64)).await.unwrap();
        let count = proxy.get("count").unwrap().await.unwrap();
        assert_eq!(count.into_data(), Some(Value::from(5i64)));
    }

    #[tokio::test]
    async fn apply_invokes_functions() {
        let (local, remote) = Endpoint::pair();
        expose(Arc::new(counter_root()), local);
        let proxy = Proxy::wrap(remote);

        let result = proxy
            .get("double")
            .unwrap()
            .call(vec![Val::from(21i64)])
            .await
            .unwrap();
        assert_eq!(result.into_data(), Some(Value::from(42i64)));

        let err = proxy.get("double").unwrap().call(vec![]).await.unwrap_err();
        assert!(err.thrown().is_some());

        let err = proxy.get("count").unwrap().call(vec![]).await.unwrap_err();
        assert!(err.to_string().contains("not a function"));
    }

    #[tokio::test]
    async fn unserializable_results_become_faults() {
        let (local, remote) = Endpoint::pair();
        expose(Arc::new(counter_root()), local);
        let proxy = Proxy::wrap(remote);

        let err = proxy.get("secret").unwrap().await.unwrap_err();
        assert!(err.to_string().contains("Unserializable return value"));
    }

    #[tokio::test]
    async fn construct_returns_a_proxy() {
        let root = ObjectMap::new().with(
            "Counter",
            Class::new(|args| async move {
                let start = args.first().cloned().unwrap_or_else(|| Val::from(0i64));
                let instance: Arc<dyn Object> = Arc::new(ObjectMap::new().with("value", start));
                Ok(instance)
            }),
        );
        let (local, remote) = Endpoint::pair();
        expose(Arc::new(root), local);
        let proxy = Proxy::wrap(remote);

        let instance = proxy
            .get("Counter")
            .unwrap()
            .construct(vec![Val::from(9i64)])
            .await
            .unwrap();
        let value = instance.get("value").unwrap().await.unwrap();
        assert_eq!(value.into_data(), Some(Value::from(9i64)));
    }

    #[tokio::test]
    async fn release_acks_then_finalizes_once() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let hits = finalized.clone();
        let root = ObjectMap::new().on_finalize(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        let (local, mut remote) = Endpoint::pair();
        let handle = expose(Arc::new(root), local);

        let ack = request(&mut remote, Operation::Release).await;
        assert!(matches!(ack.message, Message::Response { value: WireValue::Raw(Value::Null), .. }));

        handle.await.unwrap();
        assert_eq!(finalized.load(Ordering::SeqCst), 1);

        // The exposer is gone; nothing answers any more.
        let late = remote.post(Message::Request {
            id: Uuid::new_v4(),
            operation: Operation::Get { path: path!("x") },
        });
        assert!(matches!(late, Err(RpcError::Disconnected)));
    }

    #[tokio::test]
    async fn endpoint_opens_a_sub_channel() {
        let (local, mut remote) = Endpoint::pair();
        expose(Arc::new(counter_root()), local);

        let mut reply = request(&mut remote, Operation::Endpoint).await;
        assert_eq!(reply.transfer.len(), 1);

        let sub = Proxy::wrap(reply.transfer.remove(0));
        let count = sub.get("count").unwrap().await.unwrap();
        assert_eq!(count.into_data(), Some(Value::from(0i64)));
    }
}
