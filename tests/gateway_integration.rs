//! End-to-end tests for the admission pipeline: an in-process gateway in
//! front of an in-process upstream, using the memory window store so no
//! external services are needed.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use portcullis_gateway::analytics::NoopAnalyticsStore;
use portcullis_gateway::config::GatewayConfig;
use portcullis_gateway::events::Event;
use portcullis_gateway::limiter::{
    LimitDecision, MemoryWindowStore, StoreError, WindowStore,
};
use portcullis_gateway::rules::{RuleConfig, RuleSet};
use portcullis_gateway::server::{serve_admin, serve_proxy, GatewayState};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Minimal upstream: 200 with a recognizable body and header.
async fn spawn_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let svc = service_fn(|_req: Request<Incoming>| async {
                    // The keep-alive header is hop-by-hop; the gateway must
                    // not forward it downstream.
                    Ok::<_, hyper::Error>(
                        Response::builder()
                            .status(200)
                            .header("x-upstream", "true")
                            .header("keep-alive", "timeout=5")
                            .body(Full::new(Bytes::from_static(b"hello from upstream")))
                            .unwrap(),
                    )
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    addr
}

struct TestGateway {
    proxy_addr: SocketAddr,
    admin_addr: SocketAddr,
    state: GatewayState,
    _shutdown: Arc<Notify>,
}

async fn spawn_gateway(
    upstream: SocketAddr,
    store: Arc<dyn WindowStore>,
    rules: Vec<RuleConfig>,
) -> TestGateway {
    let mut config = GatewayConfig::default();
    config.upstream.url = format!("http://{}", upstream);
    config.store.backend = "memory".into();
    config.limiter.limit = 1000;
    config.analytics.enabled = false;

    let state = GatewayState::new(config, store, Arc::new(NoopAnalyticsStore)).unwrap();
    state.set_rule_set(RuleSet::compile(&rules).unwrap());

    let shutdown = Arc::new(Notify::new());

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move {
            let _ = serve_proxy(proxy_listener, state, shutdown).await;
        }
    });

    let admin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_addr = admin_listener.local_addr().unwrap();
    tokio::spawn({
        let state = state.clone();
        async move {
            let _ = serve_admin(admin_listener, state).await;
        }
    });

    TestGateway {
        proxy_addr,
        admin_addr,
        state,
        _shutdown: shutdown,
    }
}

fn http_client() -> Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn get(
    client: &Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>>,
    addr: SocketAddr,
    path: &str,
    headers: &[(&str, &str)],
) -> (StatusCode, http::HeaderMap, String) {
    let mut builder = Request::builder()
        .method("GET")
        .uri(format!("http://{}{}", addr, path));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder.body(Full::new(Bytes::new())).unwrap();

    let resp = client.request(req).await.unwrap();
    let status = resp.status();
    let resp_headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, resp_headers, String::from_utf8_lossy(&body).into())
}

fn users_rule() -> RuleConfig {
    RuleConfig {
        name: "R".into(),
        pattern: "/api/users/:id".into(),
        methods: vec!["GET".into()],
        priority: 0,
        limit: 2,
        window: "60s".into(),
        identify_by: "ip".into(),
        header_name: None,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_per_rule_limit_enforced_with_headers() {
    let upstream = spawn_upstream().await;
    let store: Arc<dyn WindowStore> = Arc::new(MemoryWindowStore::new());
    let gw = spawn_gateway(upstream, store, vec![users_rule()]).await;
    let client = http_client();

    // Requests 1 and 2 are admitted and proxied, with decreasing quota.
    let (status, headers, body) = get(&client, gw.proxy_addr, "/api/users/42", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hello from upstream");
    assert_eq!(headers.get("x-upstream").unwrap(), "true");
    assert!(headers.get("keep-alive").is_none(), "hop-by-hop header leaked");
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "2");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "1");
    assert_eq!(headers.get("x-ratelimit-rule").unwrap(), "R");
    assert!(headers.get("x-ratelimit-reset").is_some());

    let (status, headers, _) = get(&client, gw.proxy_addr, "/api/users/42", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");

    // Request 3 is rejected with the structured body.
    let (status, headers, body) = get(&client, gw.proxy_addr, "/api/users/42", &[]).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");

    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["error"], "rate limit exceeded");
    assert_eq!(parsed["rule"], "R");
    assert_eq!(parsed["limit"], 2);
    assert_eq!(parsed["remaining"], 0);
    assert!(parsed["reset_at"].as_str().unwrap().contains('T'));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_header_identity_partitions_counters() {
    let upstream = spawn_upstream().await;
    let store: Arc<dyn WindowStore> = Arc::new(MemoryWindowStore::new());

    let mut rule = users_rule();
    rule.pattern = "/api/*".into();
    rule.identify_by = "header".into();
    rule.header_name = Some("X-API-Key".into());

    let gw = spawn_gateway(upstream, store, vec![rule]).await;
    let client = http_client();

    // Same socket, different keys: separate counters.
    for key in ["key-a", "key-b"] {
        let (status, _, _) =
            get(&client, gw.proxy_addr, "/api/x", &[("x-api-key", key)]).await;
        assert_eq!(status, StatusCode::OK, "first request for {key}");
    }

    // Third request on one key is denied; the other key still has quota.
    let (status, _, _) =
        get(&client, gw.proxy_addr, "/api/x", &[("x-api-key", "key-a")]).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) =
        get(&client, gw.proxy_addr, "/api/x", &[("x-api-key", "key-a")]).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let (status, _, _) =
        get(&client, gw.proxy_addr, "/api/x", &[("x-api-key", "key-b")]).await;
    assert_eq!(status, StatusCode::OK);
}

/// Window store that always fails, for the degraded-limiter path.
struct FailingStore;

#[async_trait::async_trait]
impl WindowStore for FailingStore {
    async fn check_sliding_window(
        &self,
        _key: &str,
        _limit: u64,
        _window: std::time::Duration,
    ) -> Result<LimitDecision, StoreError> {
        Err(StoreError("connection refused".into()))
    }

    async fn increment(
        &self,
        _key: &str,
        _window: std::time::Duration,
    ) -> Result<i64, StoreError> {
        Err(StoreError("connection refused".into()))
    }

    async fn get_count(
        &self,
        _key: &str,
        _window: std::time::Duration,
    ) -> Result<i64, StoreError> {
        Err(StoreError("connection refused".into()))
    }

    async fn reset(&self, _key: &str, _window: std::time::Duration) -> Result<(), StoreError> {
        Err(StoreError("connection refused".into()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(StoreError("connection refused".into()))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_failure_fails_open() {
    let upstream = spawn_upstream().await;
    let gw = spawn_gateway(upstream, Arc::new(FailingStore), vec![users_rule()]).await;
    let client = http_client();

    let (mut events, _sub) = gw.state.broker.subscribe();

    // Far beyond the limit of 2, every request is still admitted.
    for _ in 0..5 {
        let (status, headers, body) = get(&client, gw.proxy_addr, "/api/users/42", &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hello from upstream");
        // No rate-limit metadata when the decision could not be made.
        assert!(headers.get("x-ratelimit-limit").is_none());
    }

    let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(event.allowed);
    assert_eq!(event.limit, 0);
    assert_eq!(event.remaining, 0);
    assert_eq!(event.rule_name, "R");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_global_fallback_when_no_rule_matches() {
    let upstream = spawn_upstream().await;
    let store: Arc<dyn WindowStore> = Arc::new(MemoryWindowStore::new());
    let gw = spawn_gateway(upstream, store, vec![users_rule()]).await;
    let client = http_client();

    let (status, headers, _) = get(&client, gw.proxy_addr, "/unmatched", &[]).await;
    assert_eq!(status, StatusCode::OK);
    // Global limiter headers, but no rule header.
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "1000");
    assert!(headers.get("x-ratelimit-rule").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_denied_events_reach_subscribers() {
    let upstream = spawn_upstream().await;
    let store: Arc<dyn WindowStore> = Arc::new(MemoryWindowStore::new());
    let mut rule = users_rule();
    rule.limit = 1;
    let gw = spawn_gateway(upstream, store, vec![rule]).await;
    let client = http_client();

    let (mut events, _sub) = gw.state.broker.subscribe();

    let (status, _, _) = get(&client, gw.proxy_addr, "/api/users/1", &[]).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = get(&client, gw.proxy_addr, "/api/users/1", &[]).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let collect = async {
        let mut got: Vec<Event> = Vec::new();
        while got.len() < 2 {
            got.push(events.recv().await.unwrap());
        }
        got
    };
    let got = tokio::time::timeout(std::time::Duration::from_secs(2), collect)
        .await
        .unwrap();

    assert!(got[0].allowed);
    assert_eq!(got[0].status, 200);
    assert_eq!(got[0].rule_name, "R");

    assert!(!got[1].allowed);
    assert_eq!(got[1].status, 429);
    assert_eq!(got[1].response_ms, 0);
    assert_eq!(got[1].limit, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rule_swap_applies_to_new_requests() {
    let upstream = spawn_upstream().await;
    let store: Arc<dyn WindowStore> = Arc::new(MemoryWindowStore::new());
    let mut s1_rule = users_rule();
    s1_rule.pattern = "/api/*".into();
    s1_rule.name = "S1-rule".into();
    s1_rule.limit = 1000;
    let gw = spawn_gateway(upstream, store, vec![s1_rule.clone()]).await;
    let client = http_client();

    let (_, headers, _) = get(&client, gw.proxy_addr, "/api/a", &[]).await;
    assert_eq!(headers.get("x-ratelimit-rule").unwrap(), "S1-rule");

    // Swap in a new set through the admin surface.
    let mut s2_rule = s1_rule;
    s2_rule.name = "S2-rule".into();
    let body = serde_json::to_vec(&vec![s2_rule]).unwrap();
    let req = Request::builder()
        .method("PUT")
        .uri(format!("http://{}/rules", gw.admin_addr))
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap();
    let resp = client.request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let (_, headers, _) = get(&client, gw.proxy_addr, "/api/a", &[]).await;
    assert_eq!(headers.get("x-ratelimit-rule").unwrap(), "S2-rule");
    assert_eq!(gw.state.rule_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_rule_set_rejected_names_offender() {
    let upstream = spawn_upstream().await;
    let store: Arc<dyn WindowStore> = Arc::new(MemoryWindowStore::new());
    let gw = spawn_gateway(upstream, store, vec![users_rule()]).await;
    let client = http_client();

    let mut bad = users_rule();
    bad.name = "bad-rule".into();
    bad.pattern = "/api/*/x".into();
    let body = serde_json::to_vec(&vec![bad]).unwrap();

    let req = Request::builder()
        .method("PUT")
        .uri(format!("http://{}/rules", gw.admin_addr))
        .body(Full::new(Bytes::from(body)))
        .unwrap();
    let resp = client.request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["rule"], "bad-rule");

    // The previous set survives a rejected swap.
    assert_eq!(gw.state.rule_count(), 1);
    let (_, headers, _) = get(&client, gw.proxy_addr, "/api/users/7", &[]).await;
    assert_eq!(headers.get("x-ratelimit-rule").unwrap(), "R");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upstream_down_yields_bad_gateway() {
    // Bind-then-drop to get a port nothing listens on.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let store: Arc<dyn WindowStore> = Arc::new(MemoryWindowStore::new());
    let gw = spawn_gateway(dead_addr, store, vec![]).await;
    let client = http_client();

    let (mut events, _sub) = gw.state.broker.subscribe();

    let (status, _, body) = get(&client, gw.proxy_addr, "/anything", &[]).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["error"], "bad gateway");

    // Transport failures emit no outcome event.
    let got = tokio::time::timeout(std::time::Duration::from_millis(300), events.recv()).await;
    assert!(got.is_err(), "no event expected for transport failure");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_live_event_stream_over_admin() {
    let upstream = spawn_upstream().await;
    let store: Arc<dyn WindowStore> = Arc::new(MemoryWindowStore::new());
    let gw = spawn_gateway(upstream, store, vec![users_rule()]).await;
    let client = http_client();

    // Open the NDJSON stream first, then drive one request through.
    let stream_req = Request::builder()
        .method("GET")
        .uri(format!("http://{}/events", gw.admin_addr))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let stream_resp = client.request(stream_req).await.unwrap();
    assert_eq!(stream_resp.status(), StatusCode::OK);
    assert_eq!(
        stream_resp.headers().get("content-type").unwrap(),
        "application/x-ndjson"
    );
    let mut stream_body = stream_resp.into_body();

    let (status, _, _) = get(&client, gw.proxy_addr, "/api/users/9", &[]).await;
    assert_eq!(status, StatusCode::OK);

    let frame = tokio::time::timeout(std::time::Duration::from_secs(2), stream_body.frame())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let line = frame.into_data().unwrap();
    let event: serde_json::Value = serde_json::from_slice(&line).unwrap();
    assert_eq!(event["path"], "/api/users/9");
    assert_eq!(event["allowed"], true);
    assert_eq!(event["rule_name"], "R");
}
