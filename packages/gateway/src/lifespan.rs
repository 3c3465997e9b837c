//! Startup and shutdown handshake for asynchronous applications.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::async_app::{
    AsyncApplication, Inbox, Incoming, LifespanScope, MessageSink, Outbox, Outgoing,
    ProtocolVersion, Scope, SharedState,
};
use crate::error::{GatewayError, Result};

pub(crate) const STATE_TRANSITION_ERROR: &str = "Got invalid state transition on lifespan protocol.";

/// A one-shot flag that can be awaited.
#[derive(Clone)]
pub(crate) struct Event {
    flag: Arc<watch::Sender<bool>>,
}

impl Event {
    pub(crate) fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    pub(crate) fn set(&self) {
        self.flag.send_replace(true);
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.flag.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.flag.subscribe();
        let _ = rx.wait_for(|set| *set).await;
    }
}

#[derive(Default)]
struct Flags {
    startup_failed: bool,
    shutdown_failed: bool,
    error_occurred: bool,
    failure: Option<String>,
}

struct LifespanState {
    flags: Mutex<Flags>,
    startup: Event,
    shutdown: Event,
}

impl LifespanState {
    fn flags(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageSink for LifespanState {
    fn accept(&self, message: Outgoing) -> Result<()> {
        match message {
            Outgoing::StartupComplete | Outgoing::StartupFailed { .. } => {
                if self.startup.is_set() || self.shutdown.is_set() {
                    return Err(GatewayError::protocol(STATE_TRANSITION_ERROR));
                }
                if let Outgoing::StartupFailed { message } = message {
                    let mut flags = self.flags();
                    flags.startup_failed = true;
                    if let Some(message) = message.filter(|m| !m.is_empty()) {
                        error!("{}", message);
                        flags.failure = Some(message);
                    }
                }
                self.startup.set();
                Ok(())
            }
            Outgoing::ShutdownComplete | Outgoing::ShutdownFailed { .. } => {
                if !self.startup.is_set() || self.shutdown.is_set() {
                    return Err(GatewayError::protocol(STATE_TRANSITION_ERROR));
                }
                if let Outgoing::ShutdownFailed { message } = message {
                    let mut flags = self.flags();
                    flags.shutdown_failed = true;
                    if let Some(message) = message.filter(|m| !m.is_empty()) {
                        error!("{}", message);
                        flags.failure = Some(message);
                    }
                }
                self.shutdown.set();
                Ok(())
            }
            other => Err(GatewayError::protocol(format!(
                "Unexpected message \"{}\" on lifespan scope",
                other.kind()
            ))),
        }
    }
}

/// The long-lived lifespan scope of one asynchronous application.
pub(crate) struct Lifespan {
    state: Arc<LifespanState>,
    shared: SharedState,
    input: mpsc::UnboundedSender<Incoming>,
    task: JoinHandle<()>,
}

impl Lifespan {
    /// Invoke the application on a lifespan scope. Nothing is sent until
    /// [`Lifespan::startup`].
    pub(crate) fn spawn(app: Arc<dyn AsyncApplication>, shared: SharedState) -> Self {
        let state = Arc::new(LifespanState {
            flags: Mutex::new(Flags::default()),
            startup: Event::new(),
            shutdown: Event::new(),
        });
        let (input, receiver) = mpsc::unbounded_channel();
        let scope = Scope::Lifespan(LifespanScope {
            protocol: ProtocolVersion::default(),
            state: shared.clone(),
        });
        let inbox = Inbox::new(receiver, Incoming::LifespanShutdown);
        let outbox = Outbox::new(state.clone());

        let watched = state.clone();
        let task = tokio::spawn(async move {
            let result = app.call(scope, inbox, outbox).await;
            if let Err(err) = result {
                let mut flags = watched.flags();
                flags.error_occurred = true;
                if flags.startup_failed || flags.shutdown_failed {
                    error!(error = %err, "Exception in lifespan protocol");
                } else {
                    info!("Lifespan protocol appears unsupported.");
                    debug!(error = %err, "lifespan scope raised");
                }
            }
            watched.startup.set();
            watched.shutdown.set();
        });

        Self {
            state,
            shared,
            input,
            task,
        }
    }

    pub(crate) fn state(&self) -> &SharedState {
        &self.shared
    }

    /// Send `lifespan.startup` and wait for the application's verdict.
    pub(crate) async fn startup(&self) -> Result<()> {
        info!("Waiting for application startup.");
        let _ = self.input.send(Incoming::LifespanStartup);
        self.state.startup.wait().await;

        let flags = self.state.flags();
        if flags.startup_failed {
            error!("Application startup failed. Exiting.");
            let message = flags
                .failure
                .clone()
                .unwrap_or_else(|| "application startup failed".to_string());
            return Err(GatewayError::Application(message));
        }
        info!("Application startup complete.");
        Ok(())
    }

    /// Send `lifespan.shutdown` and wait. Skipped once the scope has raised.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        if self.state.flags().error_occurred {
            return Ok(());
        }
        info!("Waiting for application shutdown.");
        let _ = self.input.send(Incoming::LifespanShutdown);
        self.state.shutdown.wait().await;

        let flags = self.state.flags();
        if flags.shutdown_failed {
            error!("Application shutdown failed.");
            let message = flags
                .failure
                .clone()
                .unwrap_or_else(|| "application shutdown failed".to_string());
            return Err(GatewayError::Application(message));
        }
        info!("Application shutdown complete.");
        Ok(())
    }
}

impl Drop for Lifespan {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn expect_startup(inbox: &mut Inbox) -> Result<()> {
        match inbox.receive().await {
            Incoming::LifespanStartup => Ok(()),
            other => Err(GatewayError::protocol(format!("unexpected {}", other.kind()))),
        }
    }

    #[tokio::test]
    async fn event_wakes_waiters() {
        let event = Event::new();
        let waiter = {
            let event = event.clone();
            tokio::spawn(async move { event.wait().await })
        };
        assert!(!event.is_set());
        event.set();
        waiter.await.unwrap();
        assert!(event.is_set());
        event.wait().await;
    }

    #[tokio::test]
    async fn full_handshake() {
        let shut_down = Arc::new(AtomicBool::new(false));
        let flag = shut_down.clone();
        let app = move |scope: Scope, mut inbox: Inbox, outbox: Outbox| {
            let flag = flag.clone();
            async move {
                if let Scope::Lifespan(scope) = scope {
                    scope.state.insert("pool", "open");
                }
                expect_startup(&mut inbox).await?;
                outbox.send(Outgoing::StartupComplete).await?;
                if inbox.receive().await == Incoming::LifespanShutdown {
                    flag.store(true, Ordering::SeqCst);
                    outbox.send(Outgoing::ShutdownComplete).await?;
                }
                Ok::<_, GatewayError>(())
            }
        };

        let lifespan = Lifespan::spawn(Arc::new(app), SharedState::new());
        lifespan.startup().await.unwrap();
        assert_eq!(lifespan.state().get("pool"), Some(tether_core::Value::from("open")));
        lifespan.shutdown().await.unwrap();
        assert!(shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn startup_failure_is_reported() {
        let app = |_: Scope, mut inbox: Inbox, outbox: Outbox| async move {
            expect_startup(&mut inbox).await?;
            outbox
                .send(Outgoing::StartupFailed {
                    message: Some("database unreachable".to_string()),
                })
                .await
        };

        let lifespan = Lifespan::spawn(Arc::new(app), SharedState::new());
        let err = lifespan.startup().await.unwrap_err();
        assert!(matches!(err, GatewayError::Application(ref m) if m == "database unreachable"));
    }

    #[tokio::test]
    async fn raising_app_counts_as_unsupported() {
        let app = |_: Scope, _: Inbox, _: Outbox| async {
            Err::<(), _>(GatewayError::application("only http is handled"))
        };

        let lifespan = Lifespan::spawn(Arc::new(app), SharedState::new());
        lifespan.startup().await.unwrap();
        // The scope already raised, so shutdown returns without waiting.
        lifespan.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_acknowledgement_is_rejected() {
        let (seen, result) = tokio::sync::oneshot::channel();
        let seen = Arc::new(Mutex::new(Some(seen)));
        let app = move |_: Scope, mut inbox: Inbox, outbox: Outbox| {
            let seen = seen.clone();
            async move {
                expect_startup(&mut inbox).await?;
                outbox.send(Outgoing::StartupComplete).await?;
                let second = outbox.send(Outgoing::StartupComplete).await;
                if let Some(seen) = seen.lock().unwrap().take() {
                    let _ = seen.send(second);
                }
                Ok::<_, GatewayError>(())
            }
        };

        let lifespan = Lifespan::spawn(Arc::new(app), SharedState::new());
        lifespan.startup().await.unwrap();
        let second = result.await.unwrap();
        assert!(matches!(second, Err(GatewayError::Protocol(ref m)) if m == STATE_TRANSITION_ERROR));
    }

    #[tokio::test]
    async fn shutdown_before_startup_is_rejected() {
        let state = LifespanState {
            flags: Mutex::new(Flags::default()),
            startup: Event::new(),
            shutdown: Event::new(),
        };
        assert!(state.accept(Outgoing::ShutdownComplete).is_err());
        assert!(state.accept(Outgoing::start(200, [("a", "b")])).is_err());
        assert!(state.accept(Outgoing::StartupComplete).is_ok());
        assert!(state.accept(Outgoing::ShutdownComplete).is_ok());
        assert!(state.accept(Outgoing::ShutdownComplete).is_err());
    }
}
