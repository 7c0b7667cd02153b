//! End-to-end tests driving the HTTP surface of a fully assembled service.

use std::future::pending;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use floodgate::config::{FileConfig, ServiceConfig};
use floodgate::http;
use floodgate::limiter::{fnv1a32, LimiterSet, DEFAULT_SHARDS};

fn test_service_config() -> ServiceConfig {
    ServiceConfig {
        port: 0,
        max_requests: 100,
        max_requests_in_queue: 100,
        window_millis: 10_000,
        requests_can_set_rate: true,
        requests_can_mod_queue: true,
        config_file: None,
        shards: DEFAULT_SHARDS,
        peer_urls: Vec::new(),
        log_format: "json".to_string(),
        log_level: "warn".to_string(),
    }
}

/// Assemble the whole service on an already-bound listener.
async fn spawn_service(listener: TcpListener, config: ServiceConfig) {
    let validated = Arc::new(config.validate().unwrap());

    let (_cfg_tx, cfg_rx) = mpsc::channel(1);
    let limiter = Arc::new(LimiterSet::new(
        validated.service.limiter_config(),
        FileConfig::default(),
        cfg_rx,
        validated.service.shards,
    ));

    let router = http::build_router(Arc::clone(&limiter), validated);
    tokio::spawn(async move {
        http::serve(listener, router, pending()).await.unwrap();
    });
}

/// Assemble the whole service on an ephemeral port and return its base url.
async fn start_app(config: ServiceConfig) -> String {
    let listener = http::bind(0).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    spawn_service(listener, config).await;
    format!("http://127.0.0.1:{port}")
}

/// Start two services that consider each other peers. Both loopback
/// addresses reach this process, but they read as two different hosts,
/// which is what the peer routing compares.
async fn start_peer_pair() -> (String, String) {
    let listener_a = http::bind(0).await.unwrap();
    let listener_b = http::bind(0).await.unwrap();
    let port_a = listener_a.local_addr().unwrap().port();
    let port_b = listener_b.local_addr().unwrap().port();

    let base_a = format!("http://127.0.0.1:{port_a}");
    let base_b = format!("http://127.0.0.2:{port_b}");
    let peers = vec![base_a.clone(), base_b.clone()];

    let mut config_a = test_service_config();
    config_a.peer_urls = peers.clone();
    let mut config_b = test_service_config();
    config_b.peer_urls = peers;

    spawn_service(listener_a, config_a).await;
    spawn_service(listener_b, config_b).await;

    (base_a, base_b)
}

/// A key that hashes onto the peer at `peer_index` in a `peer_count`-entry
/// peer list.
fn key_owned_by_peer(peer_index: usize, peer_count: usize) -> String {
    (0..)
        .map(|i| format!("routed-key-{i}"))
        .find(|k| fnv1a32(k.as_bytes()) as usize % peer_count == peer_index)
        .expect("some key hashes onto every peer")
}

#[tokio::test]
async fn healthz_responds_ok() {
    let base = start_app(test_service_config()).await;
    let resp = reqwest::get(format!("{base}/healthz")).await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn rate_returns_request_ids_until_the_window_is_full() {
    let mut config = test_service_config();
    config.max_requests = 3;
    let base = start_app(config).await;

    for _ in 0..3 {
        let resp = reqwest::get(format!("{base}/rate/my-key")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body = resp.text().await.unwrap();
        assert!(body.parse::<u64>().is_ok(), "body should be a request id, got '{body}'");
    }

    let resp = reqwest::get(format!("{base}/rate/my-key")).await.unwrap();
    assert_eq!(resp.status(), 429);
}

#[tokio::test]
async fn different_keys_have_independent_windows() {
    let mut config = test_service_config();
    config.max_requests = 1;
    let base = start_app(config).await;

    for i in 0..10 {
        let resp = reqwest::get(format!("{base}/rate/key-{i}")).await.unwrap();
        assert_eq!(resp.status(), 200);
    }
}

#[tokio::test]
async fn release_frees_a_slot() {
    let mut config = test_service_config();
    config.max_requests = 1;
    let base = start_app(config).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/rate/k")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let id = resp.text().await.unwrap();

    let resp = client.get(format!("{base}/rate/k")).send().await.unwrap();
    assert_eq!(resp.status(), 429);

    let resp = client
        .delete(format!("{base}/rate/k/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(format!("{base}/rate/k")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn malformed_query_parameters_are_rejected() {
    let base = start_app(test_service_config()).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base}/rate/k?canWait=banana"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(format!("{base}/rate/k?maxRequests=abc"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Zero would force the limit to nothing; it is out of bounds by policy.
    let resp = client
        .get(format!("{base}/rate/k?maxRequests=0"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(format!("{base}/rate/k?maxRequestsInQueue=-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn disabled_overrides_are_forbidden() {
    let mut config = test_service_config();
    config.requests_can_set_rate = false;
    config.requests_can_mod_queue = false;
    let base = start_app(config).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base}/rate/k?maxRequests=5"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .get(format!("{base}/rate/k?maxRequestsInQueue=5"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // Plain requests still work.
    let resp = client.get(format!("{base}/rate/k")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn override_raises_the_limit_mid_window() {
    let mut config = test_service_config();
    config.max_requests = 1;
    let base = start_app(config).await;
    let client = reqwest::Client::new();

    assert_eq!(client.get(format!("{base}/rate/k")).send().await.unwrap().status(), 200);
    assert_eq!(client.get(format!("{base}/rate/k")).send().await.unwrap().status(), 429);

    let resp = client
        .get(format!("{base}/rate/k?maxRequests=5"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn debug_endpoints_expose_instance_state() {
    let base = start_app(test_service_config()).await;
    let client = reqwest::Client::new();

    for key in ["id1", "id2", "id3", "id4"] {
        let resp = client.get(format!("{base}/rate/{key}")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    // Per-key snapshot.
    let resp = client.get(format!("{base}/debug/id1")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let snap: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(snap["key"], "id1");
    assert_eq!(snap["num_approved_this_window"], 1);
    assert_eq!(snap["found"], true);

    // Unknown key.
    let resp = client.get(format!("{base}/debug/id5")).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    // Everything at once.
    let resp = client.get(format!("{base}/debug")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let all: serde_json::Value = resp.json().await.unwrap();
    let instances = all["instances"].as_object().unwrap();
    assert_eq!(instances.len(), 4);
    for key in ["id1", "id2", "id3", "id4"] {
        assert!(instances.contains_key(key), "missing {key}");
    }
}

#[tokio::test]
async fn peer_routing_handles_owned_keys_locally() {
    let (base_a, base_b) = start_peer_pair().await;
    let client = reqwest::Client::new();

    // The request host matches the owning peer, so no forwarding happens.
    let key = key_owned_by_peer(0, 2);
    let resp = client.get(format!("{base_a}/rate/{key}")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.parse::<u64>().is_ok(), "body should be a request id, got '{body}'");

    // The instance lives on the owner, and only there.
    let resp = client.get(format!("{base_a}/debug/{key}")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client.get(format!("{base_b}/debug/{key}")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn peer_routing_forwards_to_the_owning_peer() {
    let (base_a, base_b) = start_peer_pair().await;
    let client = reqwest::Client::new();

    // Ask the wrong peer; the decision must come from the owner, with the
    // request id relayed back through the first hop.
    let key = key_owned_by_peer(1, 2);
    let resp = client.get(format!("{base_a}/rate/{key}")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.parse::<u64>().is_ok(), "body should be a request id, got '{body}'");

    // The counter moved on the owner, not on the peer that was asked.
    let resp = client.get(format!("{base_b}/debug/{key}")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let snap: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(snap["num_approved_this_window"], 1);

    let resp = client.get(format!("{base_a}/debug/{key}")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn peer_routing_loop_guard_short_circuits() {
    let (base_a, base_b) = start_peer_pair().await;
    let client = reqwest::Client::new();

    // A key owned by peer A, sent to peer B already marked as routed: B must
    // handle it itself rather than bounce it onward.
    let key = key_owned_by_peer(0, 2);
    let resp = client
        .get(format!("{base_b}/rate/{key}?ik=true"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(format!("{base_b}/debug/{key}")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client.get(format!("{base_a}/debug/{key}")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn peer_routing_reports_bad_gateway_when_the_owner_is_down() {
    let listener = http::bind(0).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut config = test_service_config();
    config.peer_urls = vec![
        format!("http://127.0.0.1:{port}"),
        // Nothing listens here; the forward must fail cleanly.
        "http://127.0.0.2:9".to_string(),
    ];
    spawn_service(listener, config).await;
    let base = format!("http://127.0.0.1:{port}");

    let key = key_owned_by_peer(1, 2);
    let resp = reqwest::get(format!("{base}/rate/{key}")).await.unwrap();
    assert_eq!(resp.status(), 502);
}

#[tokio::test]
async fn waiting_request_is_served_from_the_next_window() {
    let mut config = test_service_config();
    config.max_requests = 1;
    config.window_millis = 300;
    let base = start_app(config).await;
    let client = reqwest::Client::new();

    assert_eq!(client.get(format!("{base}/rate/k")).send().await.unwrap().status(), 200);

    let started = std::time::Instant::now();
    let resp = client
        .get(format!("{base}/rate/k?canWait=true"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(
        started.elapsed() >= std::time::Duration::from_millis(100),
        "the second request should have waited for the next window"
    );
}
