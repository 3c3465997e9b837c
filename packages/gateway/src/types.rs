use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tether_core::{Error as CoreError, Value};

use crate::error::GatewayError;

/// HTTP method of a canonical request.
///
/// Any valid method token is carried through, so extension methods such as
/// `PROPFIND` reach the application unchanged. The standard methods are
/// matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Method(http::Method);

impl Method {
    pub const GET: Method = Method(http::Method::GET);
    pub const POST: Method = Method(http::Method::POST);
    pub const PUT: Method = Method(http::Method::PUT);
    pub const DELETE: Method = Method(http::Method::DELETE);
    pub const PATCH: Method = Method(http::Method::PATCH);
    pub const HEAD: Method = Method(http::Method::HEAD);
    pub const OPTIONS: Method = Method(http::Method::OPTIONS);
    pub const CONNECT: Method = Method(http::Method::CONNECT);
    pub const TRACE: Method = Method(http::Method::TRACE);

    const STANDARD: [Method; 9] = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::PATCH,
        Method::HEAD,
        Method::OPTIONS,
        Method::CONNECT,
        Method::TRACE,
    ];

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(standard) = Method::STANDARD
            .iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
        {
            return Ok(standard.clone());
        }
        http::Method::from_bytes(s.as_bytes())
            .map(Method)
            .map_err(|_| GatewayError::InvalidMethod {
                method: s.to_string(),
            })
    }
}

impl TryFrom<String> for Method {
    type Error = GatewayError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Method> for String {
    fn from(method: Method) -> Self {
        method.as_str().to_string()
    }
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        method.0
    }
}

impl From<http::Method> for Method {
    fn from(method: http::Method) -> Self {
        Method(method)
    }
}

/// An ordered, multi-valued header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Every value for `name`, in arrival order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// The values for `name` comma-joined, or `None` when absent.
    pub fn get(&self, name: &str) -> Option<String> {
        let values = self.get_all(name);
        if values.is_empty() {
            None
        } else {
            Some(values.join(","))
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One entry per lower-cased name in first-seen order, repeated values
    /// comma-joined. `set-cookie` keeps one entry per value.
    pub fn merged(&self) -> Vec<(String, String)> {
        let mut merged: Vec<(String, String)> = Vec::new();
        for (name, value) in &self.entries {
            let name = name.to_ascii_lowercase();
            if name != "set-cookie" {
                if let Some((_, existing)) = merged.iter_mut().find(|(k, _)| *k == name) {
                    existing.push(',');
                    existing.push_str(value);
                    continue;
                }
            }
            merged.push((name, value.clone()));
        }
        merged
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// The canonical request handed to a gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Without the leading `?`.
    pub query: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: 80,
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Encode as plain data for the trip across an endpoint.
    pub fn to_value(&self) -> Value {
        let headers: Vec<Value> = self
            .headers
            .iter()
            .map(|(k, v)| Value::Array(vec![Value::from(k), Value::from(v)]))
            .collect();

        let mut map = BTreeMap::new();
        map.insert("method".to_string(), Value::from(self.method.as_str()));
        map.insert("scheme".to_string(), Value::from(self.scheme.as_str()));
        map.insert("host".to_string(), Value::from(self.host.as_str()));
        map.insert("port".to_string(), Value::from(self.port));
        map.insert("path".to_string(), Value::from(self.path.as_str()));
        map.insert("query".to_string(), Value::from(self.query.as_str()));
        map.insert("headers".to_string(), Value::Array(headers));
        map.insert("body".to_string(), Value::Bytes(self.body.clone()));
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, GatewayError> {
        let map = value
            .as_map()
            .ok_or_else(|| CoreError::type_mismatch("request", "map", value.kind()))?;

        let method = string_field(map, "method")?.parse()?;
        let port = match map.get("port") {
            Some(Value::Integer(p)) => u16::try_from(*p).map_err(|_| GatewayError::InvalidRequest {
                message: format!("port out of range: {}", p),
            })?,
            Some(other) => return Err(CoreError::type_mismatch("port", "integer", other.kind()).into()),
            None => 0,
        };

        let mut headers = Headers::new();
        if let Some(list) = map.get("headers") {
            let pairs = list
                .as_array()
                .ok_or_else(|| CoreError::type_mismatch("headers", "array", list.kind()))?;
            for pair in pairs {
                match pair.as_array() {
                    Some([Value::String(k), Value::String(v)]) => headers.append(k.clone(), v.clone()),
                    _ => return Err(CoreError::type_mismatch("headers", "[name, value]", pair.kind()).into()),
                }
            }
        }

        let body = match map.get("body") {
            Some(Value::Bytes(b)) => b.clone(),
            Some(Value::String(s)) => s.clone().into_bytes(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => return Err(CoreError::type_mismatch("body", "bytes", other.kind()).into()),
        };

        Ok(Request {
            method,
            scheme: optional_string(map, "scheme")?.unwrap_or_else(|| "http".to_string()),
            host: optional_string(map, "host")?.unwrap_or_default(),
            port,
            path: string_field(map, "path")?,
            query: optional_string(map, "query")?.unwrap_or_default(),
            headers,
            body,
        })
    }
}

/// A response header: one value, or a list for `set-cookie`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    List(Vec<String>),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Single(s) => Some(s),
            HeaderValue::List(_) => None,
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            HeaderValue::Single(s) => vec![s.as_str()],
            HeaderValue::List(list) => list.iter().map(String::as_str).collect(),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            HeaderValue::Single(s) => Value::from(s.as_str()),
            HeaderValue::List(list) => Value::from(list.clone()),
        }
    }

    fn from_value(field: &str, value: &Value) -> Result<Self, CoreError> {
        match value {
            Value::String(s) => Ok(HeaderValue::Single(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| CoreError::type_mismatch(field, "string", item.kind()))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(HeaderValue::List),
            other => Err(CoreError::type_mismatch(field, "string or list", other.kind())),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Single(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Single(s)
    }
}

pub type ResponseHeaders = BTreeMap<String, HeaderValue>;

/// The canonical response a gateway produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: ResponseHeaders,
    pub body: Vec<u8>,
}

impl Response {
    /// A plain-text response, as used for synthetic errors.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let mut headers = ResponseHeaders::new();
        headers.insert(
            "content-type".to_string(),
            HeaderValue::from("text/plain; charset=utf-8"),
        );
        Self {
            status,
            headers,
            body: body.into().into_bytes(),
        }
    }

    /// Header lookup; names are stored lower-cased.
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }

    pub fn to_value(&self) -> Value {
        let headers: BTreeMap<String, Value> = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.to_value()))
            .collect();

        let mut map = BTreeMap::new();
        map.insert("status".to_string(), Value::from(self.status));
        map.insert("headers".to_string(), Value::Map(headers));
        map.insert("body".to_string(), Value::Bytes(self.body.clone()));
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, GatewayError> {
        let map = value
            .as_map()
            .ok_or_else(|| CoreError::type_mismatch("response", "map", value.kind()))?;

        let status = match map.get("status") {
            Some(Value::Integer(s)) => u16::try_from(*s).map_err(|_| GatewayError::InvalidRequest {
                message: format!("status out of range: {}", s),
            })?,
            Some(other) => return Err(CoreError::type_mismatch("status", "integer", other.kind()).into()),
            None => {
                return Err(GatewayError::InvalidRequest {
                    message: "response has no status".to_string(),
                })
            }
        };

        let mut headers = ResponseHeaders::new();
        if let Some(raw) = map.get("headers") {
            let entries = raw
                .as_map()
                .ok_or_else(|| CoreError::type_mismatch("headers", "map", raw.kind()))?;
            for (name, value) in entries {
                headers.insert(name.to_ascii_lowercase(), HeaderValue::from_value(name, value)?);
            }
        }

        let body = match map.get("body") {
            Some(Value::Bytes(b)) => b.clone(),
            Some(Value::String(s)) => s.clone().into_bytes(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => return Err(CoreError::type_mismatch("body", "bytes", other.kind()).into()),
        };

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

fn string_field(map: &BTreeMap<String, Value>, field: &str) -> Result<String, CoreError> {
    match map.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(CoreError::type_mismatch(field, "string", other.kind())),
        None => Err(CoreError::missing(field)),
    }
}

fn optional_string(map: &BTreeMap<String, Value>, field: &str) -> Result<Option<String>, CoreError> {
    match map.get(field) {
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(CoreError::type_mismatch(field, "string", other.kind())),
    }
}
