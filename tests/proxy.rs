use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use pantry::application::worker::WorkerHost;
use pantry::cache::{
    CacheConfig, CacheController, FetchRequest, GenerationId, MemoryStore, Network, NetworkError,
    ResponseSnapshot, StoreBackend,
};
use pantry::infra::http::{CACHE_HEADER, ProxyState, STATUS_PATH, build_router};
use serde_json::Value;
use tower::ServiceExt;
use url::Url;

/// Storefront stand-in: `/offline/*` is unreachable, everything else is 200.
/// Keeps every request it receives.
#[derive(Default)]
struct Storefront {
    calls: AtomicUsize,
    seen: Mutex<Vec<FetchRequest>>,
}

impl Storefront {
    fn last_request(&self) -> Option<FetchRequest> {
        self.seen.lock().expect("request log lock").last().cloned()
    }
}

#[async_trait]
impl Network for Storefront {
    async fn fetch(&self, request: &FetchRequest) -> Result<ResponseSnapshot, NetworkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .expect("request log lock")
            .push(request.clone());
        if request.url().path().starts_with("/offline/") {
            return Err(NetworkError::transport(request, "connection refused"));
        }
        Ok(ResponseSnapshot::new(
            200,
            vec![
                ("content-type".to_string(), "text/plain".to_string()),
                ("connection".to_string(), "close".to_string()),
            ],
            format!("{} {}", request.method(), request.url().path()),
        ))
    }
}

async fn started_router() -> (Router, Arc<Storefront>) {
    let network = Arc::new(Storefront::default());
    let config = CacheConfig::new(
        GenerationId::new("lakshmi-dairy-v1").expect("valid generation"),
        Url::parse("https://dairy.example/").expect("valid origin"),
        StoreBackend::Memory,
    )
    .expect("valid config")
    .with_manifest_paths(["/", "/styles.css", "/assets/milk.jpg"])
    .expect("valid manifest");

    let controller = CacheController::new(Arc::new(MemoryStore::new()), network.clone());
    let host = WorkerHost::new(Arc::new(controller), config);
    host.start().await.expect("startup");

    (build_router(ProxyState { host: Arc::new(host) }), network)
}

async fn send(router: &Router, method: Method, uri: &str) -> axum::response::Response {
    router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("router response")
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

#[tokio::test]
async fn manifest_asset_is_a_cache_hit() {
    let (router, network) = started_router().await;
    let calls = network.calls.load(Ordering::SeqCst);

    let response = send(&router, Method::GET, "/styles.css").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(CACHE_HEADER)
            .and_then(|value| value.to_str().ok()),
        Some("hit")
    );
    assert!(response.headers().get("connection").is_none());
    assert_eq!(body_text(response).await, "GET /styles.css");
    assert_eq!(network.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn unknown_asset_is_a_miss() {
    let (router, network) = started_router().await;
    let calls = network.calls.load(Ordering::SeqCst);

    let response = send(&router, Method::GET, "/products.json?page=2").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(CACHE_HEADER)
            .and_then(|value| value.to_str().ok()),
        Some("miss")
    );
    assert_eq!(body_text(response).await, "GET /products.json");
    assert_eq!(network.calls.load(Ordering::SeqCst), calls + 1);
}

#[tokio::test]
async fn non_get_requests_bypass_the_cache() {
    let (router, _network) = started_router().await;

    let response = send(&router, Method::POST, "/styles.css").await;

    assert_eq!(
        response
            .headers()
            .get(CACHE_HEADER)
            .and_then(|value| value.to_str().ok()),
        Some("miss")
    );
    assert_eq!(body_text(response).await, "POST /styles.css");
}

#[tokio::test]
async fn scheme_relative_target_is_rejected_without_upstream_call() {
    let (router, network) = started_router().await;
    let calls = network.calls.load(Ordering::SeqCst);

    let response = send(&router, Method::GET, "//evil.example/steal").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.headers().get(CACHE_HEADER).is_none());
    assert_eq!(network.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn post_body_and_headers_reach_the_network() {
    let (router, network) = started_router().await;

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/cart?store=lakshmi")
                .header("host", "127.0.0.1:4173")
                .header("content-type", "application/json")
                .header("x-basket", "b-17")
                .header("connection", "keep-alive")
                .body(Body::from(r#"{"qty":3}"#))
                .expect("request"),
        )
        .await
        .expect("router response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "POST /cart");

    let forwarded = network.last_request().expect("request reached the network");
    assert_eq!(forwarded.method(), &Method::POST);
    assert_eq!(
        forwarded.url().as_str(),
        "https://dairy.example/cart?store=lakshmi"
    );
    assert_eq!(forwarded.body().as_ref(), br#"{"qty":3}"#);
    assert_eq!(forwarded.header("content-type"), Some("application/json"));
    assert_eq!(forwarded.header("x-basket"), Some("b-17"));
    assert_eq!(forwarded.header("host"), None);
    assert_eq!(forwarded.header("connection"), None);
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let (router, _network) = started_router().await;

    let response = send(&router, Method::GET, "/offline/cart").await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(response.headers().get(CACHE_HEADER).is_none());
}

#[tokio::test]
async fn status_reports_active_generation() {
    let (router, _network) = started_router().await;

    let response = send(&router, Method::GET, STATUS_PATH).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = serde_json::from_str(&body_text(response).await).expect("json body");
    assert_eq!(body["active"], "lakshmi-dairy-v1");
    assert_eq!(body["generations"][0]["generation"], "lakshmi-dairy-v1");
    assert_eq!(body["generations"][0]["state"], "active");
    assert_eq!(body["generations"][0]["entries"], 3);
}
