//! The synchronous call-and-collect convention.
//!
//! The application is called once per request with an environment record and
//! a [`StartResponse`] callback. It returns an iterator of body chunks; the
//! gateway drains it, runs the close hook, and assembles a [`Response`].

use std::collections::BTreeMap;
use std::io::{self, Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error};

use crate::config::{GatewayConfig, ServiceConfig};
use crate::error::{GatewayError, Result};
use crate::headers::update_headers;
use crate::types::{HeaderValue, Request, Response, ResponseHeaders};

/// The per-request environment record.
#[derive(Debug)]
pub struct Environ {
    vars: BTreeMap<String, String>,
    pub url_scheme: String,
    pub input: Cursor<Vec<u8>>,
    pub errors: ErrorStream,
    pub version: (u8, u8),
    pub multithread: bool,
    pub multiprocess: bool,
    pub run_once: bool,
}

impl Environ {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Read the whole request body.
    pub fn read_body(&mut self) -> Vec<u8> {
        let start = self.input.position() as usize;
        let body = self.input.get_ref().get(start..).unwrap_or_default().to_vec();
        self.input.set_position(self.input.get_ref().len() as u64);
        body
    }
}

/// The application's error stream. Each line goes to the log.
#[derive(Debug, Clone, Default)]
pub struct ErrorStream;

impl Write for ErrorStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for line in String::from_utf8_lossy(buf).lines() {
            if !line.is_empty() {
                error!(target: "tether::app", "{}", line);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The response-start callback handed to the application.
#[derive(Debug)]
pub struct StartResponse {
    status: Option<u16>,
    restarted: bool,
    headers: ResponseHeaders,
    output: Vec<u8>,
}

impl StartResponse {
    fn new(server_header: &str) -> Self {
        let mut headers = ResponseHeaders::new();
        headers.insert("server".to_string(), HeaderValue::from(server_header));
        Self {
            status: None,
            restarted: false,
            headers,
            output: Vec::new(),
        }
    }

    /// Begin the response with a status line such as `"200 OK"`.
    ///
    /// May be called once, plus at most one more time while handling an
    /// error (`exc_info` present). Returns a writer for body bytes that
    /// precede whatever the application's iterator yields.
    pub fn start<I, K, V>(
        &mut self,
        status: &str,
        headers: I,
        exc_info: Option<&dyn std::error::Error>,
    ) -> Result<BodyWriter<'_>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        if self.status.is_some() {
            match exc_info {
                None => return Err(GatewayError::protocol("Headers already set")),
                Some(_) if self.restarted => {
                    return Err(GatewayError::protocol("response already restarted"))
                }
                Some(cause) => {
                    debug!(error = %cause, "response restarted with exception info");
                    self.restarted = true;
                }
            }
        }

        let code = status
            .split_whitespace()
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| GatewayError::protocol(format!("invalid status line '{}'", status)))?;

        self.status = Some(code);
        update_headers(&mut self.headers, headers);
        Ok(BodyWriter {
            output: &mut self.output,
        })
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }
}

/// The legacy `write` callable.
pub struct BodyWriter<'a> {
    output: &'a mut Vec<u8>,
}

impl Write for BodyWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type Chunks = Box<dyn Iterator<Item = Result<Vec<u8>>> + Send>;
type CloseHook = Box<dyn FnOnce() + Send>;

/// What the application returns: body chunks plus an optional close hook.
///
/// The hook runs when the output is dropped, so it runs even when draining
/// stops on an error.
pub struct AppOutput {
    chunks: Chunks,
    close: Option<CloseHook>,
}

impl AppOutput {
    pub fn empty() -> Self {
        Self::chunks(Vec::<Vec<u8>>::new())
    }

    pub fn chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            chunks: Box::new(chunks.into_iter().map(Ok)),
            close: None,
        }
    }

    /// Chunks that may fail part-way through.
    pub fn fallible<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Result<Vec<u8>>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            chunks: Box::new(chunks.into_iter()),
            close: None,
        }
    }

    #[must_use]
    pub fn on_close(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.close = Some(Box::new(f));
        self
    }
}

impl Iterator for AppOutput {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.chunks.next()
    }
}

impl Drop for AppOutput {
    fn drop(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

/// An application following the synchronous convention.
pub trait SyncApplication: Send + Sync + 'static {
    fn call(&self, environ: &mut Environ, start_response: &mut StartResponse) -> Result<AppOutput>;
}

impl<F> SyncApplication for F
where
    F: Fn(&mut Environ, &mut StartResponse) -> Result<AppOutput> + Send + Sync + 'static,
{
    fn call(&self, environ: &mut Environ, start_response: &mut StartResponse) -> Result<AppOutput> {
        self(environ, start_response)
    }
}

/// Serves requests against a synchronous application.
///
/// At most one application call runs at a time. A call abandoned by the
/// deadline keeps its turn until it actually returns.
#[derive(Clone)]
pub struct SyncServer {
    app: Arc<dyn SyncApplication>,
    mount_prefix: String,
    server_header: String,
    timeout: Option<Duration>,
    turn: Arc<Semaphore>,
}

impl SyncServer {
    pub fn new(app: Arc<dyn SyncApplication>, service: &ServiceConfig, config: &GatewayConfig) -> Self {
        Self {
            app,
            mount_prefix: service.mount_prefix(),
            server_header: config.server_header(),
            timeout: config.sync_request_timeout(),
            turn: Arc::new(Semaphore::new(1)),
        }
    }

    /// Whether an application call, possibly an abandoned one, is running.
    pub fn is_busy(&self) -> bool {
        self.turn.available_permits() == 0
    }

    pub fn build_environ(&self, request: &Request) -> Environ {
        let path_info = request
            .path
            .strip_prefix(self.mount_prefix.as_str())
            .unwrap_or(&request.path);

        let mut vars = BTreeMap::new();
        vars.insert("REQUEST_METHOD".to_string(), request.method.to_string());
        vars.insert("SCRIPT_NAME".to_string(), self.mount_prefix.clone());
        vars.insert("PATH_INFO".to_string(), path_info.to_string());
        vars.insert("QUERY_STRING".to_string(), request.query.clone());
        vars.insert("SERVER_NAME".to_string(), request.host.clone());
        vars.insert("SERVER_PORT".to_string(), request.port.to_string());
        vars.insert("SERVER_PROTOCOL".to_string(), "HTTP/1.0".to_string());
        vars.insert(
            "CONTENT_TYPE".to_string(),
            request
                .headers
                .get("content-type")
                .unwrap_or_else(|| "text/plain".to_string()),
        );
        vars.insert(
            "CONTENT_LENGTH".to_string(),
            request
                .headers
                .get("content-length")
                .unwrap_or_else(|| request.body.len().to_string()),
        );

        for (name, value) in request.headers.merged() {
            let key = name.replace('-', "_").to_ascii_uppercase();
            if vars.contains_key(&key) {
                continue;
            }
            let value = value.trim();
            vars.entry(format!("HTTP_{}", key))
                .and_modify(|existing: &mut String| {
                    existing.push(',');
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        Environ {
            vars,
            url_scheme: request.scheme.clone(),
            input: Cursor::new(request.body.clone()),
            errors: ErrorStream,
            version: (1, 0),
            multithread: false,
            multiprocess: true,
            run_once: false,
        }
    }

    /// Call the application and collect its output. Blocks.
    pub fn run(&self, request: &Request) -> Result<Response> {
        let mut environ = self.build_environ(request);
        let mut start = StartResponse::new(&self.server_header);

        let output = self.app.call(&mut environ, &mut start)?;
        for chunk in output {
            start.output.extend(chunk?);
        }

        let status = start.status.ok_or_else(|| {
            GatewayError::protocol("application finished without starting a response")
        })?;
        Ok(Response {
            status,
            headers: start.headers,
            body: start.output,
        })
    }

    /// Run the application on the blocking pool, honouring the configured
    /// deadline. The deadline covers waiting for the previous call too. A
    /// timed-out call is abandoned, not interrupted.
    pub async fn handle_request(&self, request: Request) -> Result<Response> {
        let server = self.clone();
        let call = async move {
            let turn = server
                .turn
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| GatewayError::protocol("synchronous server closed"))?;
            let task = tokio::task::spawn_blocking(move || {
                let _turn = turn;
                server.run(&request)
            });
            task.await
                .map_err(|e| GatewayError::application(format!("application panicked: {}", e)))?
        };

        match self.timeout {
            Some(deadline) => tokio::time::timeout(deadline, call)
                .await
                .map_err(|_| GatewayError::Timeout)?,
            None => call.await,
        }
    }
}
