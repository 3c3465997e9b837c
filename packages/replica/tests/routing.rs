use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tether_gateway::{
    AppOutput, Application, Environ, GatewayConfig, GatewayError, HeaderValue, Request, Response,
    ServiceConfig, StartResponse,
};
use tether_replica::{
    announce, Announcer, PoolConfig, ReplicaPool, RequestHandler, Router, RouterConfig,
    SERVER_READY,
};

struct Named(String);

#[async_trait]
impl RequestHandler for Named {
    async fn handle_request(&self, _request: Request) -> Response {
        Response::text(200, self.0.clone())
    }
}

async fn register(router: &Router, name: &str, label: &str) -> (String, Announcer) {
    let (announcement, announcer) = announce(
        name,
        Arc::new(Named(label.to_string())),
        router.config().heartbeat_period(),
    );
    assert_eq!(announcement.kind(), SERVER_READY);
    let id = router.register(announcement).await;
    (id, announcer)
}

#[tokio::test]
async fn routing_only_selects_matching_names() {
    let router = Router::default();
    let mut hosts = Vec::new();
    for label in ["svc-a", "svc-b", "svc-c"] {
        hosts.push(register(&router, "svc", label).await);
    }
    hosts.push(register(&router, "other", "other").await);
    assert_eq!(router.len(), 4);
    assert_eq!(router.live("svc", Instant::now()).len(), 3);

    let mut seen = BTreeSet::new();
    for _ in 0..60 {
        let response = router.handle_request("svc", Request::get("/svc/")).await;
        assert_eq!(response.status, 200);
        let body = response.body_text();
        assert!(body.starts_with("svc-"), "routed to {}", body);
        seen.insert(body);
    }
    assert!(seen.len() > 1, "selection never varied: {:?}", seen);
}

#[tokio::test]
async fn server_ids_count_from_one_thousand() {
    let router = Router::default();
    let (first, _a) = register(&router, "svc", "a").await;
    let (second, _b) = register(&router, "svc", "b").await;
    assert_eq!(first, "server-1000");
    assert_eq!(second, "server-1001");
}

#[tokio::test]
async fn liveness_window_bounds_a_heartbeat() {
    let router = Router::new(RouterConfig {
        heartbeat_window_ms: 1000,
        heartbeat_period_ms: 100,
    });
    let (id, host) = register(&router, "svc", "a").await;
    // Stop pings so only explicit touches move the heartbeat.
    drop(host);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let window = router.config().heartbeat_window();

    let t0 = Instant::now() + Duration::from_secs(60);
    router.touch(&id, t0).unwrap();
    assert!(router
        .is_live_at(&id, t0 + window - Duration::from_millis(1))
        .unwrap());
    assert!(!router
        .is_live_at(&id, t0 + window + Duration::from_millis(1))
        .unwrap());

    assert!(router.live("svc", t0 + window * 2).is_empty());
    assert_eq!(router.prune(t0 + window * 2), vec![id]);
    assert!(router.is_empty());
}

#[tokio::test]
async fn silent_hosts_are_forgotten_on_later_traffic() {
    let router = Router::new(RouterConfig {
        heartbeat_window_ms: 100,
        heartbeat_period_ms: 20,
    });
    let (_, gone) = register(&router, "svc", "gone").await;
    drop(gone);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(router.len(), 1);

    let (fresh, _host) = register(&router, "svc", "fresh").await;
    assert_eq!(router.len(), 1);
    assert_eq!(router.live("svc", Instant::now()), vec![fresh]);

    let (_, other) = register(&router, "other", "other").await;
    drop(other);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(router.len(), 2);
    let response = router.handle_request("svc", Request::get("/svc/")).await;
    assert_eq!(response.body_text(), "fresh");
    assert_eq!(router.len(), 1);
}

#[tokio::test]
async fn no_live_host_is_a_synthetic_500() {
    let router = Router::default();
    let response = router.handle_request("svc", Request::get("/svc/")).await;
    assert_eq!(response.status, 500);
    assert_eq!(response.body_text(), "Server not Started");
    assert_eq!(
        response.header("content-type"),
        Some(&HeaderValue::from("text/plain; charset=utf-8"))
    );
}

#[tokio::test]
async fn heartbeats_keep_a_host_live_until_it_stops() {
    let router = Router::new(RouterConfig {
        heartbeat_window_ms: 150,
        heartbeat_period_ms: 20,
    });
    let (id, host) = register(&router, "svc", "a").await;
    assert_eq!(host.server_id().as_deref(), Some(id.as_str()));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(router.is_live_at(&id, Instant::now()).unwrap());

    drop(host);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!router.is_live_at(&id, Instant::now()).unwrap());
    let response = router.handle_request("svc", Request::get("/svc/")).await;
    assert_eq!(response.body_text(), "Server not Started");
}

#[tokio::test]
async fn fetch_reaches_a_pooled_replica() {
    let app = Application::sync(|environ: &mut Environ, start: &mut StartResponse| {
        let path = environ.get("PATH_INFO").unwrap_or_default().to_string();
        start.start(
            "200 OK",
            [("content-type", "text/plain"), ("x-frame-options", "DENY")],
            None,
        )?;
        Ok::<_, GatewayError>(AppOutput::chunks(vec![path.into_bytes()]))
    });
    let pool = ReplicaPool::new(
        Arc::new(app),
        ServiceConfig::new("blog", "http://localhost/blog/"),
        GatewayConfig::default(),
        PoolConfig::default(),
    );

    let router = Router::default();
    let (announcement, _host) = announce("blog", Arc::new(pool.clone()), Duration::from_millis(50));
    router.register(announcement).await;

    let request = http::Request::builder()
        .method("GET")
        .uri("http://localhost/blog/posts/7")
        .body(Vec::new())
        .unwrap();
    let response = router.fetch(request).await;

    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(response.body(), b"/posts/7");
    assert!(response.headers().get("x-frame-options").is_none());
    assert!(response.headers().get("server").is_some());
    assert_eq!(pool.replica_count(), 1);
}
