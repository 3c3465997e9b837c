//! Per-request application instances under the asynchronous convention.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::async_app::{
    AsyncApplication, HttpScope, Inbox, Incoming, MessageSink, Outbox, Outgoing, Scope,
};
use crate::error::{GatewayError, Result};
use crate::headers::update_headers;
use crate::types::{HeaderValue, Response, ResponseHeaders};

const FIRST_INSTANCE_ID: u64 = 1000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Started,
    ResponseStarted,
    ResponseComplete,
}

struct ExchangeState {
    phase: Phase,
    status: u16,
    headers: ResponseHeaders,
    body: Vec<u8>,
    settle: Option<oneshot::Sender<Result<Response>>>,
}

/// The response being assembled for one request.
///
/// Accepts `http.response.start` once, then body chunks until one arrives
/// with `more_body` unset. Any other order is a protocol violation, which
/// fails the pending request.
pub(crate) struct Exchange {
    head_only: bool,
    method: String,
    target: String,
    http_version: String,
    state: Mutex<ExchangeState>,
    last_used: Mutex<Instant>,
}

impl Exchange {
    pub(crate) fn new(
        scope: &HttpScope,
        server_header: &str,
        settle: oneshot::Sender<Result<Response>>,
    ) -> Self {
        let mut target = scope.path.clone();
        if !scope.query_string.is_empty() {
            target.push('?');
            target.push_str(&String::from_utf8_lossy(&scope.query_string));
        }

        let mut headers = ResponseHeaders::new();
        headers.insert("server".to_string(), HeaderValue::from(server_header));

        Self {
            head_only: scope.method.eq_ignore_ascii_case("HEAD"),
            method: scope.method.clone(),
            target,
            http_version: scope.http_version.clone(),
            state: Mutex::new(ExchangeState {
                phase: Phase::Started,
                status: 0,
                headers,
                body: Vec::new(),
                settle: Some(settle),
            }),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn last_used(&self) -> Instant {
        *lock(&self.last_used)
    }

    /// Fail the pending request, unless a response was already delivered.
    pub(crate) fn fail(&self, err: GatewayError) {
        let mut state = lock(&self.state);
        if let Some(settle) = state.settle.take() {
            let _ = settle.send(Err(err));
        }
    }

    fn violation(state: &mut ExchangeState, message: String) -> GatewayError {
        let err = GatewayError::protocol(message);
        if let Some(settle) = state.settle.take() {
            let _ = settle.send(Err(err.clone()));
        }
        err
    }
}

impl MessageSink for Exchange {
    fn accept(&self, message: Outgoing) -> Result<()> {
        *lock(&self.last_used) = Instant::now();
        let mut state = lock(&self.state);

        match (state.phase, message) {
            (Phase::Started, Outgoing::ResponseStart { status, headers }) => {
                let headers: Vec<(String, String)> = headers
                    .iter()
                    .map(|(k, v)| {
                        (
                            String::from_utf8_lossy(k).into_owned(),
                            String::from_utf8_lossy(v).into_owned(),
                        )
                    })
                    .collect();
                update_headers(&mut state.headers, headers);
                state.status = status;
                state.phase = Phase::ResponseStarted;
                info!(
                    target: "tether::access",
                    "- - \"{} {} HTTP/{}\" {}",
                    self.method,
                    self.target,
                    self.http_version,
                    status
                );
                Ok(())
            }
            (Phase::Started, other) => Err(Self::violation(
                &mut state,
                format!(
                    "Expected message \"http.response.start\", but got \"{}\"",
                    other.kind()
                ),
            )),
            (Phase::ResponseStarted, Outgoing::ResponseBody { body, more_body }) => {
                if !self.head_only {
                    state.body.extend_from_slice(&body);
                }
                if !more_body {
                    state.phase = Phase::ResponseComplete;
                    let response = Response {
                        status: state.status,
                        headers: std::mem::take(&mut state.headers),
                        body: std::mem::take(&mut state.body),
                    };
                    if let Some(settle) = state.settle.take() {
                        let _ = settle.send(Ok(response));
                    }
                }
                Ok(())
            }
            (Phase::ResponseStarted, other) => Err(Self::violation(
                &mut state,
                format!(
                    "Expected message \"http.response.body\", but got \"{}\"",
                    other.kind()
                ),
            )),
            (Phase::ResponseComplete, other) => Err(GatewayError::protocol(format!(
                "Unexpected message \"{}\" sent after response already completed",
                other.kind()
            ))),
        }
    }
}

struct Instance {
    exchange: Arc<Exchange>,
    task: JoinHandle<()>,
}

/// Live application instances keyed by `inst-<n>` ids.
///
/// Holds at most `max_app_count` instances; spawning past the cap evicts the
/// least recently used one.
pub(crate) struct InstancePool {
    app: Arc<dyn AsyncApplication>,
    max_app_count: usize,
    instances: Mutex<HashMap<String, Instance>>,
    next_id: AtomicU64,
}

impl InstancePool {
    pub(crate) fn new(app: Arc<dyn AsyncApplication>, max_app_count: usize) -> Self {
        Self {
            app,
            max_app_count: max_app_count.max(1),
            instances: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(FIRST_INSTANCE_ID),
        }
    }

    pub(crate) fn next_instance_id(&self) -> String {
        format!("inst-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Start the application on `scope`, returning the instance's input queue.
    pub(crate) fn spawn(
        &self,
        id: String,
        scope: Scope,
        exchange: Arc<Exchange>,
    ) -> mpsc::UnboundedSender<Incoming> {
        let mut instances = lock(&self.instances);
        while instances.len() >= self.max_app_count {
            if !Self::evict_oldest(&mut instances) {
                break;
            }
        }

        let (input, receiver) = mpsc::unbounded_channel();
        let inbox = Inbox::new(receiver, Incoming::HttpDisconnect);
        let outbox = Outbox::new(exchange.clone());
        let app = self.app.clone();
        let watched = exchange.clone();
        let instance_id = id.clone();

        let task = tokio::spawn(async move {
            match app.call(scope, inbox, outbox).await {
                Ok(()) => watched.fail(GatewayError::protocol(
                    "application returned without completing the response",
                )),
                Err(err) => {
                    error!(instance = %instance_id, error = %err, "Exception inside application");
                    watched.fail(err);
                }
            }
        });

        instances.insert(id, Instance { exchange, task });
        input
    }

    /// Drop an instance, cancelling it if still running.
    pub(crate) fn remove(&self, id: &str) {
        if let Some(instance) = lock(&self.instances).remove(id) {
            if !instance.task.is_finished() {
                instance.task.abort();
            }
        }
    }

    fn evict_oldest(instances: &mut HashMap<String, Instance>) -> bool {
        let oldest = instances
            .iter()
            .min_by_key(|(_, instance)| instance.exchange.last_used())
            .map(|(id, _)| id.clone());

        match oldest.and_then(|id| instances.remove(&id).map(|instance| (id, instance))) {
            Some((id, instance)) => {
                warn!(instance = %id, "evicting application instance");
                instance.task.abort();
                instance
                    .exchange
                    .fail(GatewayError::application("application instance evicted"));
                true
            }
            None => false,
        }
    }

    /// Reap instances whose tasks have finished.
    pub(crate) fn sweep(&self) {
        let mut instances = lock(&self.instances);
        let before = instances.len();
        instances.retain(|_, instance| !instance.task.is_finished());
        let reaped = before - instances.len();
        if reaped > 0 {
            debug!(reaped, remaining = instances.len(), "swept finished instances");
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.instances).len()
    }
}
