//! The replica pool.
//!
//! Keeps an ordered list of replicas and hands out admission slots. A
//! synchronous replica blocks its whole context per request, so it admits
//! one exchange at a time; an asynchronous one interleaves and admits many.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tether_gateway::{
    Bootstrap, Convention, GatewayConfig, Request, Response, ServiceConfig, TIMEOUT_STATUS,
};
use tracing::{debug, error, warn};

use crate::config::PoolConfig;
use crate::error::Result;
use crate::replica::Replica;

/// Anything that can turn a canonical request into a response.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, request: Request) -> Response;
}

struct Slot {
    replica: Arc<Replica>,
    in_flight: usize,
    cap: usize,
}

struct PoolInner {
    bootstrap: Arc<dyn Bootstrap>,
    service: ServiceConfig,
    gateway: GatewayConfig,
    config: PoolConfig,
    slots: Mutex<Vec<Slot>>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cap_for(&self, convention: Convention) -> usize {
        let cap = match convention {
            Convention::Sync => self.config.sync_max_in_flight,
            Convention::Async => self.config.async_max_in_flight,
        };
        cap.max(1)
    }

    /// Take a replica out of rotation. Leases still held on it stay valid
    /// and release as no-ops.
    fn retire(&self, replica_id: u64) {
        self.slots().retain(|s| s.replica.id() != replica_id);
    }

    fn release(&self, replica_id: u64) {
        let mut slots = self.slots();
        if let Some(slot) = slots.iter_mut().find(|s| s.replica.id() == replica_id) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
    }
}

/// A reserved admission slot. Dropping it releases the slot.
pub struct Lease {
    pool: Arc<PoolInner>,
    replica: Arc<Replica>,
}

impl Lease {
    pub fn replica(&self) -> &Replica {
        &self.replica
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.release(self.replica.id());
    }
}

/// Obtains usable replicas for incoming requests.
#[derive(Clone)]
pub struct ReplicaPool {
    inner: Arc<PoolInner>,
}

impl ReplicaPool {
    pub fn new(
        bootstrap: Arc<dyn Bootstrap>,
        service: ServiceConfig,
        gateway: GatewayConfig,
        config: PoolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                bootstrap,
                service,
                gateway,
                config,
                slots: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Reserve a slot on the first replica under its cap, spawning a new
    /// replica when none qualifies.
    ///
    /// A replica that fails its handshake is discarded; the pool is left as
    /// it was.
    pub async fn acquire(&self) -> Result<Lease> {
        if let Some(replica) = self.try_reserve() {
            return Ok(self.lease(replica));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(replica = id, "spawning replica");
        let replica = Replica::spawn(
            id,
            self.inner.bootstrap.clone(),
            &self.inner.service,
            &self.inner.gateway,
        )
        .await
        .map_err(|e| {
            warn!(replica = id, error = %e, "discarding replica");
            e
        })?;

        let replica = Arc::new(replica);
        let cap = self.inner.cap_for(replica.convention());
        self.inner.slots().push(Slot {
            replica: replica.clone(),
            in_flight: 1,
            cap,
        });
        Ok(self.lease(replica))
    }

    fn try_reserve(&self) -> Option<Arc<Replica>> {
        let mut slots = self.inner.slots();
        let slot = slots.iter_mut().find(|s| s.in_flight < s.cap)?;
        slot.in_flight += 1;
        Some(slot.replica.clone())
    }

    fn lease(&self, replica: Arc<Replica>) -> Lease {
        Lease {
            pool: self.inner.clone(),
            replica,
        }
    }

    /// Return a slot on `replica_id`. Never drops a counter below zero.
    pub fn release(&self, replica_id: u64) {
        self.inner.release(replica_id);
    }

    pub fn replica_count(&self) -> usize {
        self.inner.slots().len()
    }

    /// In-flight exchanges per replica, in pool order.
    pub fn in_flight(&self) -> Vec<usize> {
        self.inner.slots().iter().map(|s| s.in_flight).collect()
    }
}

#[async_trait]
impl RequestHandler for ReplicaPool {
    async fn handle_request(&self, request: Request) -> Response {
        let lease = match self.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                error!(error = %e, "no replica available");
                return Response::text(500, "server internal error");
            }
        };

        match lease.replica().handle_request(request).await {
            Ok(response) => {
                // A timed-out synchronous call is still running inside the
                // replica, so it cannot take new work.
                if response.status == TIMEOUT_STATUS
                    && lease.replica().convention() == Convention::Sync
                {
                    warn!(replica = lease.replica().id(), "retiring stalled replica");
                    self.inner.retire(lease.replica().id());
                }
                response
            }
            Err(e) => {
                error!(replica = lease.replica().id(), error = %e, "replica request failed");
                Response::text(500, "server internal error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_gateway::{
        AppOutput, Application, Environ, GatewayError, Inbox, Outbox, Outgoing, Scope,
        StartResponse,
    };

    fn sync_pool() -> ReplicaPool {
        let app = Application::sync(|_: &mut Environ, start: &mut StartResponse| {
            start.start("200 OK", [("a", "b")], None)?;
            Ok::<_, GatewayError>(AppOutput::chunks(vec![b"sync".to_vec()]))
        });
        ReplicaPool::new(
            Arc::new(app),
            ServiceConfig::default(),
            GatewayConfig::default(),
            PoolConfig::default(),
        )
    }

    fn async_pool(cap: usize) -> ReplicaPool {
        let app = Application::asynchronous(|scope: Scope, _: Inbox, outbox: Outbox| async move {
            if let Scope::Http(_) = scope {
                outbox.send(Outgoing::start(200, [("a", "b")])).await?;
                outbox.send(Outgoing::body("async")).await?;
            }
            Ok::<_, GatewayError>(())
        });
        ReplicaPool::new(
            Arc::new(app),
            ServiceConfig::default(),
            GatewayConfig::default(),
            PoolConfig {
                async_max_in_flight: cap,
                ..PoolConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn sync_replicas_admit_one_exchange() {
        let pool = sync_pool();
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_ne!(first.replica().id(), second.replica().id());
        assert_eq!(pool.in_flight(), vec![1, 1]);

        drop(first);
        assert_eq!(pool.in_flight(), vec![0, 1]);
        let third = pool.acquire().await.unwrap();
        assert_eq!(third.replica().id(), 1);
        assert_eq!(pool.replica_count(), 2);
    }

    #[tokio::test]
    async fn async_replicas_interleave_up_to_cap() {
        let pool = async_pool(3);
        let leases: Vec<Lease> = {
            let mut leases = Vec::new();
            for _ in 0..3 {
                leases.push(pool.acquire().await.unwrap());
            }
            leases
        };
        assert_eq!(pool.replica_count(), 1);
        assert_eq!(pool.in_flight(), vec![3]);

        let fourth = pool.acquire().await.unwrap();
        assert_eq!(pool.replica_count(), 2);
        drop(leases);
        drop(fourth);
        assert_eq!(pool.in_flight(), vec![0, 0]);
    }

    #[tokio::test]
    async fn release_never_goes_negative() {
        let pool = sync_pool();
        let lease = pool.acquire().await.unwrap();
        let id = lease.replica().id();
        drop(lease);
        pool.release(id);
        pool.release(id);
        assert_eq!(pool.in_flight(), vec![0]);
    }

    #[tokio::test]
    async fn handshake_failure_leaves_pool_empty() {
        struct Broken;

        #[async_trait]
        impl Bootstrap for Broken {
            async fn load(&self, _: &ServiceConfig) -> tether_gateway::Result<Application> {
                Err(GatewayError::application("import failed"))
            }
        }

        let pool = ReplicaPool::new(
            Arc::new(Broken),
            ServiceConfig::default(),
            GatewayConfig::default(),
            PoolConfig::default(),
        );
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.replica_count(), 0);

        let response = pool.handle_request(Request::get("/")).await;
        assert_eq!(response.status, 500);
        assert_eq!(response.body_text(), "server internal error");
    }

    #[tokio::test]
    async fn stalled_sync_replica_is_retired() {
        use std::sync::atomic::AtomicUsize;
        use std::time::Duration;

        let calls = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let app = {
            let (calls, running, peak) = (calls.clone(), running.clone(), peak.clone());
            Application::sync(move |_: &mut Environ, start: &mut StartResponse| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    std::thread::sleep(Duration::from_millis(300));
                }
                running.fetch_sub(1, Ordering::SeqCst);
                start.start("200 OK", [("a", "b")], None)?;
                Ok::<_, GatewayError>(AppOutput::chunks(vec![b"done".to_vec()]))
            })
        };
        let pool = ReplicaPool::new(
            Arc::new(app),
            ServiceConfig::default(),
            GatewayConfig {
                sync_request_timeout_ms: 50,
                ..GatewayConfig::default()
            },
            PoolConfig::default(),
        );

        let first = pool.handle_request(Request::get("/")).await;
        assert_eq!(first.status, 504);
        assert_eq!(pool.replica_count(), 0);

        let second = pool.handle_request(Request::get("/")).await;
        assert_eq!(second.status, 200);
        assert_eq!(second.body_text(), "done");
        assert_eq!(pool.replica_count(), 1);
        assert_eq!(pool.in_flight(), vec![0]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // The second call ran on a fresh replica while the first was stuck.
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn requests_flow_through_the_pool() {
        assert_eq!(sync_pool().handle_request(Request::get("/")).await.body_text(), "sync");
        assert_eq!(async_pool(100).handle_request(Request::get("/")).await.body_text(), "async");
    }
}
