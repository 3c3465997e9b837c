//! Conversion between transport-level `http` messages and canonical records.

use tracing::trace;
use url::Url;

use crate::error::{GatewayError, Result};
use crate::types::{Headers, Method, Request, Response};

/// Response headers that must not be forwarded to the original caller.
const UNFORWARDABLE_HEADERS: &[&str] = &["x-frame-options"];

/// Build a canonical request from an inbound transport request.
///
/// Origin-form targets (`/path?query`) are resolved against the `Host`
/// header; absolute-form targets are used as-is.
pub fn from_transport(request: http::Request<Vec<u8>>) -> Result<Request> {
    let (parts, body) = request.into_parts();
    let url = request_url(&parts)?;
    let method = Method::from(parts.method.clone());

    let mut headers = Headers::new();
    for (name, value) in parts.headers.iter() {
        let value = value.to_str().map_err(|e| GatewayError::InvalidHeader {
            message: format!("{}: {}", name, e),
        })?;
        headers.append(name.as_str(), value);
    }

    Ok(Request {
        method,
        scheme: url.scheme().to_string(),
        host: url.host_str().unwrap_or_default().to_string(),
        port: url.port_or_known_default().unwrap_or(0),
        path: url.path().to_string(),
        query: url.query().unwrap_or_default().to_string(),
        headers,
        body,
    })
}

fn request_url(parts: &http::request::Parts) -> Result<Url> {
    if parts.uri.scheme().is_some() {
        return Ok(Url::parse(&parts.uri.to_string())?);
    }

    let host = parts
        .uri
        .authority()
        .map(|a| a.as_str())
        .or_else(|| {
            parts
                .headers
                .get(http::header::HOST)
                .and_then(|h| h.to_str().ok())
        })
        .unwrap_or("localhost");
    let base = Url::parse(&format!("http://{}/", host))?;
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Ok(base.join(target)?)
}

/// Build the transport response delivered to the original caller.
///
/// List-valued headers (`set-cookie`) are re-expanded into repeated headers.
pub fn into_transport(response: Response) -> Result<http::Response<Vec<u8>>> {
    let mut builder = http::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        if UNFORWARDABLE_HEADERS
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
        {
            trace!(header = %name, "dropping unforwardable header");
            continue;
        }
        for v in value.values() {
            builder = builder.header(name.as_str(), v);
        }
    }
    Ok(builder.body(response.body)?)
}
