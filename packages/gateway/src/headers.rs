//! Response header normalization shared by both conventions.

use crate::types::{HeaderValue, ResponseHeaders};

/// The identifying `server` header every response starts with.
pub fn default_server_header() -> String {
    format!("Tether/{}", env!("CARGO_PKG_VERSION"))
}

/// Fold a raw header list into a response header map.
///
/// Names are lower-cased and values trimmed. Repeated headers are
/// comma-joined, except `set-cookie`, which becomes a list; each cookie loses
/// its `HttpOnly` attribute so the page the response is delivered to can
/// still read it.
pub fn normalize_headers<I, K, V>(headers: I) -> ResponseHeaders
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut out = ResponseHeaders::new();
    for (name, value) in headers {
        let name = name.as_ref().to_ascii_lowercase();
        let value = value.as_ref().trim();

        if name == "set-cookie" {
            let cookie = strip_http_only(value);
            match out.get_mut(&name) {
                Some(HeaderValue::List(list)) => list.push(cookie),
                Some(existing) => {
                    let mut values: Vec<String> =
                        existing.values().into_iter().map(str::to_string).collect();
                    values.push(cookie);
                    *existing = HeaderValue::List(values);
                }
                None => {
                    out.insert(name, HeaderValue::List(vec![cookie]));
                }
            }
            continue;
        }

        match out.get_mut(&name) {
            Some(HeaderValue::Single(existing)) => {
                existing.push(',');
                existing.push_str(value);
            }
            Some(HeaderValue::List(list)) => list.push(value.to_string()),
            None => {
                out.insert(name, HeaderValue::Single(value.to_string()));
            }
        }
    }
    out
}

/// Merge freshly normalized headers over `base`, replacing same-named entries.
pub fn update_headers<I, K, V>(base: &mut ResponseHeaders, headers: I)
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    base.extend(normalize_headers(headers));
}

fn strip_http_only(cookie: &str) -> String {
    cookie
        .split(';')
        .map(str::trim)
        .filter(|part| !part.eq_ignore_ascii_case("httponly"))
        .collect::<Vec<_>>()
        .join("; ")
}
