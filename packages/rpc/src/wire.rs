//! Converting local values to and from their wire form.
//!
//! Plain data crosses as [`WireValue::Raw`]. Everything else must be claimed
//! by a registered [`TransferHandler`], consulted in registration order. Two
//! handlers are built in:
//!
//! - `"proxy"` keeps an object resident. It opens a fresh endpoint pair,
//!   exposes the object on one end and transfers the other; the receiver
//!   wraps what it gets in a [`Proxy`].
//! - `"throw"` carries a fault. The receiver re-raises it as
//!   [`RpcError::Thrown`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tether_core::Value;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use crate::expose::expose_with;
use crate::message::WireValue;
use crate::object::{Thrown, Val};
use crate::proxy::Proxy;

/// A named, pluggable serializer for values that are not plain data.
pub trait TransferHandler: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, value: &Val) -> bool;

    /// Produce the wire payload, pushing any endpoints that must travel along.
    fn serialize(
        &self,
        value: Val,
        codec: &WireCodec,
        transfer: &mut Vec<Endpoint>,
    ) -> Result<Value>;

    fn deserialize(&self, value: Value, codec: &WireCodec, transfer: &mut Transfers)
        -> Result<Val>;
}

/// Endpoints that arrived with a message, claimed by index.
#[derive(Debug, Default)]
pub struct Transfers {
    slots: Vec<Option<Endpoint>>,
}

impl Transfers {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            slots: endpoints.into_iter().map(Some).collect(),
        }
    }

    /// Take the endpoint at `index`. Each slot can be claimed once.
    pub fn take(&mut self, index: usize) -> Result<Endpoint> {
        self.slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| {
                RpcError::protocol(format!("no transferred endpoint at index {}", index))
            })
    }

    /// Endpoints nobody claimed, in their original order.
    pub fn into_remaining(self) -> Vec<Endpoint> {
        self.slots.into_iter().flatten().collect()
    }
}

/// The ordered handler registry used by both ends of a connection.
#[derive(Clone)]
pub struct WireCodec {
    handlers: Arc<Vec<Arc<dyn TransferHandler>>>,
}

impl WireCodec {
    /// A codec with no handlers at all: only plain data can cross.
    pub fn empty() -> Self {
        Self {
            handlers: Arc::new(Vec::new()),
        }
    }

    /// Append a handler after the ones already registered.
    #[must_use]
    pub fn with_handler(self, handler: Arc<dyn TransferHandler>) -> Self {
        let mut handlers: Vec<_> = self.handlers.iter().cloned().collect();
        handlers.push(handler);
        Self {
            handlers: Arc::new(handlers),
        }
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Encode a value, returning its wire form and the endpoints to transfer.
    pub fn encode(&self, value: Val) -> Result<(WireValue, Vec<Endpoint>)> {
        self.encode_with(value, Vec::new())
    }

    /// Encode a value whose caller already has endpoints to send along.
    /// Those pre-declared endpoints come first in the transfer list.
    pub fn encode_with(
        &self,
        value: Val,
        mut transfer: Vec<Endpoint>,
    ) -> Result<(WireValue, Vec<Endpoint>)> {
        if let Some(handler) = self.handlers.iter().find(|h| h.can_handle(&value)) {
            let name = handler.name().to_string();
            let payload = handler.serialize(value, self, &mut transfer)?;
            return Ok((
                WireValue::Handler {
                    name,
                    value: payload,
                },
                transfer,
            ));
        }

        match value {
            Val::Data(v) => Ok((WireValue::Raw(v), transfer)),
            other => Err(RpcError::Unserializable(format!(
                "{} is not plain data and no handler claims it",
                other.kind()
            ))),
        }
    }

    pub fn encode_all(&self, values: Vec<Val>) -> Result<(Vec<WireValue>, Vec<Endpoint>)> {
        let mut transfer = Vec::new();
        let mut wire = Vec::with_capacity(values.len());
        for value in values {
            let (encoded, t) = self.encode_with(value, transfer)?;
            transfer = t;
            wire.push(encoded);
        }
        Ok((wire, transfer))
    }

    /// Decode one wire value. A thrown payload comes back as `Err(Thrown)`.
    pub fn decode(&self, value: WireValue, transfer: &mut Transfers) -> Result<Val> {
        match value {
            WireValue::Raw(v) => Ok(Val::Data(v)),
            WireValue::Handler { name, value } => {
                let handler = self
                    .handlers
                    .iter()
                    .find(|h| h.name() == name)
                    .ok_or_else(|| {
                        RpcError::protocol(format!("unknown wire handler '{}'", name))
                    })?;
                handler.deserialize(value, self, transfer)
            }
        }
    }

    pub fn decode_all(&self, values: Vec<WireValue>, transfer: &mut Transfers) -> Result<Vec<Val>> {
        values
            .into_iter()
            .map(|v| self.decode(v, transfer))
            .collect()
    }
}

impl Default for WireCodec {
    /// `"proxy"` then `"throw"`.
    fn default() -> Self {
        Self::empty()
            .with_handler(Arc::new(ProxyHandler))
            .with_handler(Arc::new(ThrowHandler))
    }
}

impl fmt::Debug for WireCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireCodec")
            .field("handlers", &self.handler_names())
            .finish()
    }
}

/// Remotes objects marked with [`Val::Proxied`] by reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyHandler;

impl TransferHandler for ProxyHandler {
    fn name(&self) -> &str {
        "proxy"
    }

    fn can_handle(&self, value: &Val) -> bool {
        matches!(value, Val::Proxied(_))
    }

    fn serialize(
        &self,
        value: Val,
        codec: &WireCodec,
        transfer: &mut Vec<Endpoint>,
    ) -> Result<Value> {
        let Val::Proxied(object) = value else {
            return Err(RpcError::Unserializable(
                "proxy handler given an unmarked value".to_string(),
            ));
        };

        let (local, remote) = Endpoint::pair();
        expose_with(object, local, codec.clone());

        let index = transfer.len() as i64;
        transfer.push(remote);
        debug!(index, "remoting object over a new sub-channel");
        Ok(Value::Integer(index))
    }

    fn deserialize(&self, value: Value, codec: &WireCodec, transfer: &mut Transfers) -> Result<Val> {
        let index = value
            .as_i64()
            .and_then(|i| usize::try_from(i).ok())
            .ok_or_else(|| RpcError::protocol("proxy payload must be an endpoint index"))?;
        let endpoint = transfer.take(index)?;
        Ok(Val::Remote(Proxy::wrap_with(endpoint, codec.clone())))
    }
}

/// Carries thrown faults; decoding re-raises them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrowHandler;

impl TransferHandler for ThrowHandler {
    fn name(&self) -> &str {
        "throw"
    }

    fn can_handle(&self, value: &Val) -> bool {
        matches!(value, Val::Thrown(_))
    }

    fn serialize(&self, value: Val, _: &WireCodec, _: &mut Vec<Endpoint>) -> Result<Value> {
        let Val::Thrown(thrown) = value else {
            return Err(RpcError::Unserializable(
                "throw handler given a non-thrown value".to_string(),
            ));
        };

        let mut payload = BTreeMap::new();
        match thrown {
            Thrown::Error {
                name,
                message,
                stack,
            } => {
                let mut error = BTreeMap::new();
                error.insert("name".to_string(), Value::String(name));
                error.insert("message".to_string(), Value::String(message));
                error.insert("stack".to_string(), Value::from(stack));
                payload.insert("is_error".to_string(), Value::Bool(true));
                payload.insert("value".to_string(), Value::Map(error));
            }
            Thrown::Value(v) => {
                payload.insert("is_error".to_string(), Value::Bool(false));
                payload.insert("value".to_string(), v);
            }
        }
        Ok(Value::Map(payload))
    }

    fn deserialize(&self, value: Value, _: &WireCodec, _: &mut Transfers) -> Result<Val> {
        let malformed = || RpcError::protocol("malformed thrown payload");

        let Value::Map(mut payload) = value else {
            return Err(malformed());
        };
        let is_error = payload
            .get("is_error")
            .and_then(Value::as_bool)
            .ok_or_else(malformed)?;
        let inner = payload.remove("value").unwrap_or_default();

        let thrown = if is_error {
            let text = |key: &str| inner.get_component(key).and_then(Value::as_str).map(str::to_string);
            Thrown::Error {
                name: text("name").unwrap_or_else(|| "Error".to_string()),
                message: text("message").unwrap_or_default(),
                stack: text("stack"),
            }
        } else {
            Thrown::Value(inner)
        };

        Err(RpcError::Thrown(thrown))
    }
}
