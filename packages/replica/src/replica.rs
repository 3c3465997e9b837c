//! One replica: an isolated execution context serving one application.
//!
//! Each replica owns an OS thread running a single-threaded tokio runtime.
//! The thread exposes a [`GatewayService`] on one end of an endpoint pair;
//! the caller holds a [`Proxy`] on the other and never shares memory with it.

use std::sync::Arc;
use std::thread;

use tether_core::Value;
use tether_gateway::{
    Bootstrap, Convention, GatewayConfig, GatewayService, Request, Response, ServiceConfig,
};
use tether_rpc::{expose, Endpoint, Proxy, Val};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::error::{ReplicaError, Result};

/// Handle to a running replica.
pub struct Replica {
    id: u64,
    proxy: Proxy,
    convention: Convention,
    stop: Option<oneshot::Sender<()>>,
}

impl Replica {
    /// Spawn the replica's thread and run the start handshake.
    ///
    /// A replica whose application fails to load or start is torn down
    /// before this returns.
    pub async fn spawn(
        id: u64,
        bootstrap: Arc<dyn Bootstrap>,
        service: &ServiceConfig,
        config: &GatewayConfig,
    ) -> Result<Self> {
        let (local, remote) = Endpoint::pair();
        let (stop, stopped) = oneshot::channel();
        let gateway_config = config.clone();

        thread::Builder::new()
            .name(format!("tether-replica-{}", id))
            .spawn(move || run(id, bootstrap, gateway_config, remote, stopped))
            .map_err(|e| ReplicaError::Spawn(e.to_string()))?;

        let mut replica = Replica {
            id,
            proxy: Proxy::wrap(local),
            convention: Convention::Sync,
            stop: Some(stop),
        };
        replica.convention = replica.handshake(service).await?;
        info!(replica = id, convention = ?replica.convention, "replica ready");
        Ok(replica)
    }

    async fn handshake(&self, service: &ServiceConfig) -> Result<Convention> {
        let reply = self
            .proxy
            .get("start")?
            .call(vec![Val::from(service.to_value())])
            .await
            .map_err(|e| ReplicaError::Handshake(e.to_string()))?;

        let flags = reply
            .as_data()
            .and_then(Value::as_map)
            .ok_or_else(|| ReplicaError::Handshake("start returned no convention flags".into()))?;
        let flag = |name: &str| flags.get(name).and_then(Value::as_bool).unwrap_or(false);

        match (flag("is_sync_convention"), flag("is_async_convention")) {
            (true, false) => Ok(Convention::Sync),
            (false, true) => Ok(Convention::Async),
            _ => Err(ReplicaError::Handshake(
                "application matches neither convention".into(),
            )),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn convention(&self) -> Convention {
        self.convention
    }

    /// Relay a request into the replica.
    pub async fn handle_request(&self, request: Request) -> Result<Response> {
        let reply = self
            .proxy
            .get("handle_request")?
            .call(vec![Val::from(request.to_value())])
            .await?;
        let value = reply
            .as_data()
            .ok_or_else(|| ReplicaError::Malformed(format!("expected data, got {}", reply.kind())))?;
        Ok(Response::from_value(value)?)
    }

    /// Ask the replica to run lifespan shutdown and stop its thread.
    pub async fn shutdown(mut self) -> Result<()> {
        let result = self.proxy.get("shutdown")?.call(Vec::new()).await;
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        result.map(|_| ()).map_err(ReplicaError::from)
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("convention", &self.convention)
            .finish()
    }
}

fn run(
    id: u64,
    bootstrap: Arc<dyn Bootstrap>,
    config: GatewayConfig,
    endpoint: Endpoint,
    stopped: oneshot::Receiver<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            // Dropping the endpoint fails the caller's handshake.
            error!(replica = id, error = %e, "failed to build replica runtime");
            return;
        }
    };

    runtime.block_on(async move {
        let service = GatewayService::new(bootstrap, config);
        let server = expose(Arc::new(service.clone()), endpoint);

        tokio::select! {
            _ = stopped => debug!(replica = id, "replica stop requested"),
            _ = server => debug!(replica = id, "replica endpoint closed"),
        }
    });
    debug!(replica = id, "replica thread exiting");
}
