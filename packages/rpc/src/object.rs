//! The local object model that an exposer serves.
//!
//! An [`Object`] advertises what it can do through capability accessors:
//! property reads, assignments, invocation, construction. The exposer asks for
//! the capability an operation needs and reports a thrown `TypeError` when the
//! object does not provide it.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tether_core::Value;

use crate::proxy::Proxy;

/// A fault raised by application code, carried back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Thrown {
    /// An error object; `stack` is kept when the thrower had one.
    Error {
        name: String,
        message: String,
        stack: Option<String>,
    },
    /// Anything else that was thrown.
    Value(Value),
}

impl Thrown {
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Thrown::Error {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// A plain `Error` with the given message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::error("Error", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::error("TypeError", message)
    }

    #[must_use]
    pub fn with_stack(self, stack: impl Into<String>) -> Self {
        match self {
            Thrown::Error { name, message, .. } => Thrown::Error {
                name,
                message,
                stack: Some(stack.into()),
            },
            other => other,
        }
    }
}

impl fmt::Display for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Thrown::Error { name, message, .. } => write!(f, "{}: {}", name, message),
            Thrown::Value(v) => write!(f, "thrown {}", v.kind()),
        }
    }
}

impl std::error::Error for Thrown {}

impl From<crate::RpcError> for Thrown {
    fn from(e: crate::RpcError) -> Self {
        match e {
            crate::RpcError::Thrown(t) => t,
            other => Thrown::message(other.to_string()),
        }
    }
}

/// A dynamically typed local value.
///
/// `Object` and `Proxied` both hold a resident object; only `Proxied` may be
/// sent, and it travels as a handle to a fresh sub-channel rather than a copy.
#[derive(Clone)]
pub enum Val {
    Data(Value),
    Object(Arc<dyn Object>),
    Proxied(Arc<dyn Object>),
    Remote(Proxy),
    Thrown(Thrown),
}

impl Val {
    pub fn null() -> Self {
        Val::Data(Value::Null)
    }

    pub fn object(object: impl Object + 'static) -> Self {
        Val::Object(Arc::new(object))
    }

    /// Mark an object for remoting by reference.
    pub fn proxied(object: impl Object + 'static) -> Self {
        Val::Proxied(Arc::new(object))
    }

    pub fn as_data(&self) -> Option<&Value> {
        match self {
            Val::Data(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<Value> {
        match self {
            Val::Data(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_data().and_then(Value::as_str)
    }

    pub fn as_object(&self) -> Option<&Arc<dyn Object>> {
        match self {
            Val::Object(o) | Val::Proxied(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&Proxy> {
        match self {
            Val::Remote(p) => Some(p),
            _ => None,
        }
    }

    pub fn into_remote(self) -> Option<Proxy> {
        match self {
            Val::Remote(p) => Some(p),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Val::Data(v) => v.kind(),
            Val::Object(o) | Val::Proxied(o) => o.type_name(),
            Val::Remote(_) => "proxy",
            Val::Thrown(_) => "thrown",
        }
    }
}

impl fmt::Debug for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Data(v) => f.debug_tuple("Data").field(v).finish(),
            Val::Object(o) => f.debug_tuple("Object").field(&o.type_name()).finish(),
            Val::Proxied(o) => f.debug_tuple("Proxied").field(&o.type_name()).finish(),
            Val::Remote(p) => f.debug_tuple("Remote").field(p).finish(),
            Val::Thrown(t) => f.debug_tuple("Thrown").field(t).finish(),
        }
    }
}

impl From<Value> for Val {
    fn from(v: Value) -> Self {
        Val::Data(v)
    }
}

macro_rules! data_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Val {
                fn from(v: $t) -> Self {
                    Val::Data(Value::from(v))
                }
            }
        )*
    };
}

data_from!(bool, i64, i32, u16, f64, String, &str, Vec<u8>);

impl From<Thrown> for Val {
    fn from(t: Thrown) -> Self {
        Val::Thrown(t)
    }
}

impl From<Proxy> for Val {
    fn from(p: Proxy) -> Self {
        Val::Remote(p)
    }
}

/// Something that can be exposed over an endpoint.
pub trait Object: Send + Sync {
    fn gettable(&self) -> Option<&dyn Gettable> {
        None
    }

    fn settable(&self) -> Option<&dyn Settable> {
        None
    }

    fn callable(&self) -> Option<&dyn Callable> {
        None
    }

    fn constructible(&self) -> Option<&dyn Constructible> {
        None
    }

    /// Runs once when a RELEASE tears down an endpoint exposing this object.
    fn finalize(&self) {}

    fn type_name(&self) -> &'static str {
        "object"
    }
}

pub trait Gettable: Send + Sync {
    fn get(&self, name: &str) -> Option<Val>;
}

pub trait Settable: Send + Sync {
    fn set(&self, name: &str, value: Val) -> Result<(), Thrown>;
}

#[async_trait]
pub trait Callable: Send + Sync {
    /// Invoke with `receiver` bound as the object the callee was read from.
    async fn call(&self, receiver: Val, arguments: Vec<Val>) -> Result<Val, Thrown>;
}

#[async_trait]
pub trait Constructible: Send + Sync {
    async fn construct(&self, arguments: Vec<Val>) -> Result<Arc<dyn Object>, Thrown>;
}

type Finalizer = Box<dyn Fn() + Send + Sync>;

/// A mutable bag of named properties.
#[derive(Default)]
pub struct ObjectMap {
    properties: RwLock<BTreeMap<String, Val>>,
    finalizer: Option<Finalizer>,
}

impl ObjectMap {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(self, name: impl Into<String>, value: impl Into<Val>) -> Self {
        self.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_object(self, name: impl Into<String>, object: impl Object + 'static) -> Self {
        self.with(name, Val::object(object))
    }

    #[must_use]
    pub fn on_finalize(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.finalizer = Some(Box::new(f));
        self
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<Val>) {
        let mut properties = self
            .properties
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        properties.insert(name.into(), value.into());
    }

    pub fn read(&self, name: &str) -> Option<Val> {
        let properties = self
            .properties
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        properties.get(name).cloned()
    }
}

impl Gettable for ObjectMap {
    fn get(&self, name: &str) -> Option<Val> {
        self.read(name)
    }
}

impl Settable for ObjectMap {
    fn set(&self, name: &str, value: Val) -> Result<(), Thrown> {
        self.insert(name, value);
        Ok(())
    }
}

impl Object for ObjectMap {
    fn gettable(&self) -> Option<&dyn Gettable> {
        Some(self)
    }

    fn settable(&self) -> Option<&dyn Settable> {
        Some(self)
    }

    fn finalize(&self) {
        if let Some(f) = &self.finalizer {
            f();
        }
    }
}

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type CallFn = dyn Fn(Val, Vec<Val>) -> BoxFuture<Result<Val, Thrown>> + Send + Sync;

/// A callable built from an async closure.
pub struct Function {
    f: Arc<CallFn>,
}

impl Function {
    /// A function that ignores its receiver.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Val>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Val, Thrown>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |_receiver, args| Box::pin(f(args))),
        }
    }

    /// A function that sees the object it was read from.
    pub fn method<F, Fut>(f: F) -> Self
    where
        F: Fn(Val, Vec<Val>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Val, Thrown>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |receiver, args| Box::pin(f(receiver, args))),
        }
    }
}

#[async_trait]
impl Callable for Function {
    async fn call(&self, receiver: Val, arguments: Vec<Val>) -> Result<Val, Thrown> {
        (self.f)(receiver, arguments).await
    }
}

impl Object for Function {
    fn callable(&self) -> Option<&dyn Callable> {
        Some(self)
    }

    fn type_name(&self) -> &'static str {
        "function"
    }
}

impl From<Function> for Val {
    fn from(f: Function) -> Self {
        Val::object(f)
    }
}

type ConstructFn = dyn Fn(Vec<Val>) -> BoxFuture<Result<Arc<dyn Object>, Thrown>> + Send + Sync;

/// A constructor built from an async closure.
pub struct Class {
    f: Arc<ConstructFn>,
}

impl Class {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Val>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Object>, Thrown>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |args| Box::pin(f(args))),
        }
    }
}

#[async_trait]
impl Constructible for Class {
    async fn construct(&self, arguments: Vec<Val>) -> Result<Arc<dyn Object>, Thrown> {
        (self.f)(arguments).await
    }
}

impl Object for Class {
    fn constructible(&self) -> Option<&dyn Constructible> {
        Some(self)
    }

    fn type_name(&self) -> &'static str {
        "class"
    }
}

impl From<Class> for Val {
    fn from(c: Class) -> Self {
        Val::object(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn object_map_reads_and_writes() {
        let map = ObjectMap::new().with("name", "tether");
        assert_eq!(map.read("name").unwrap().as_str(), Some("tether"));

        map.set("count", Val::from(2i64)).unwrap();
        assert_eq!(
            map.get("count").and_then(Val::into_data),
            Some(Value::from(2i64))
        );
        assert!(map.get("missing").is_none());
    }

    #[test]
    fn finalizer_runs_on_finalize() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let map = ObjectMap::new().on_finalize(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        map.finalize();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn function_calls_closure() {
        let add = Function::new(|args| async move {
            let sum: i64 = args
                .iter()
                .filter_map(|a| a.as_data().and_then(Value::as_i64))
                .sum();
            Ok(Val::from(sum))
        });

        let result = add
            .call(Val::null(), vec![Val::from(2i64), Val::from(3i64)])
            .await
            .unwrap();
        assert_eq!(result.into_data(), Some(Value::from(5i64)));
        assert_eq!(add.type_name(), "function");
        assert!(add.gettable().is_none());
    }

    #[test]
    fn thrown_from_rpc_error_unwraps() {
        let inner = Thrown::type_error("boom");
        let back: Thrown = crate::RpcError::Thrown(inner.clone()).into();
        assert_eq!(back, inner);

        let other: Thrown = crate::RpcError::Released.into();
        assert!(matches!(other, Thrown::Error { ref name, .. } if name == "Error"));
    }
}
