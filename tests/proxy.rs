//! End-to-end tests for the proxy server against in-process stub upstreams.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    Json, Router,
    http::{StatusCode, header},
    routing::get,
};
use serde_json::{Value, json};

use infold_proxy::fingerprint::DeviceIdProvider;
use infold_proxy::registry::ClientRegistry;
use infold_proxy::server::{AppState, build_app};

const PNG_BYTES: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

struct StubProvider;

#[async_trait]
impl DeviceIdProvider for StubProvider {
    async fn produce_device_id(&self) -> Result<String> {
        Ok("stub-device".to_string())
    }
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Stub of the upstream game API.
fn upstream_app() -> Router {
    Router::new()
        .route(
            "/web/v1/auth/refresh",
            get(|| async { Json(json!({ "data": { "token": "new-token" } })) }),
        )
        .route(
            "/web/v1/item/list",
            get(|| async { Json(json!({ "data": { "items": [] } })) }),
        )
        .route(
            "/logo.png",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], PNG_BYTES.to_vec()) }),
        )
}

/// Upstream whose refresh endpoint always fails.
fn broken_upstream_app() -> Router {
    Router::new().route(
        "/web/v1/auth/refresh",
        get(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "refresh unavailable" })),
            )
        }),
    )
}

async fn spawn_proxy(api_base: String) -> (SocketAddr, Arc<ClientRegistry>) {
    let registry = Arc::new(ClientRegistry::new(Arc::new(StubProvider), api_base));
    let state = AppState::new(registry.clone()).unwrap();
    let addr = serve(build_app(state)).await;
    (addr, registry)
}

#[tokio::test]
async fn test_health_reports_ok_with_cors() {
    let (proxy, _registry) = spawn_proxy("http://127.0.0.1:1".into()).await;

    let response = reqwest::get(format!("http://{proxy}/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["service"], json!("infold-proxy"));
    assert!(body["time"].as_str().is_some());
}

#[tokio::test]
async fn test_image_proxy_without_url_is_400() {
    let (proxy, _registry) = spawn_proxy("http://127.0.0.1:1".into()).await;

    let response = reqwest::get(format!("http://{proxy}/api/proxy/image"))
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn test_image_proxy_rejects_non_http_scheme() {
    let (proxy, _registry) = spawn_proxy("http://127.0.0.1:1".into()).await;

    let response = reqwest::get(format!(
        "http://{proxy}/api/proxy/image?url=ftp://example.test/a.png"
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_image_proxy_mirrors_binary_response() {
    let upstream = serve(upstream_app()).await;
    let (proxy, _registry) = spawn_proxy(format!("http://{upstream}")).await;

    let response = reqwest::get(format!(
        "http://{proxy}/api/proxy/image?url=http://{upstream}/logo.png"
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("image/png")
    );
    assert_eq!(
        response
            .headers()
            .get("cache-control")
            .and_then(|v| v.to_str().ok()),
        Some("public, max-age=3600")
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), PNG_BYTES);
}

#[tokio::test]
async fn test_image_proxy_translates_upstream_404() {
    let upstream = serve(upstream_app()).await;
    let (proxy, _registry) = spawn_proxy(format!("http://{upstream}")).await;

    let response = reqwest::get(format!(
        "http://{proxy}/api/proxy/image?url=http://{upstream}/missing.png"
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["status"], json!(404));
    assert!(body["url"].as_str().unwrap().contains("/missing.png"));
}

#[tokio::test]
async fn test_proxy_request_query_url_is_transparent_passthrough() {
    let upstream = serve(upstream_app()).await;
    let (proxy, registry) = spawn_proxy(format!("http://{upstream}")).await;

    let response = reqwest::get(format!(
        "http://{proxy}/proxy-request?url=http://{upstream}/logo.png"
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), PNG_BYTES);
    // no session was created, nothing was signed
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_signed_proxy_refresh_updates_session_token() {
    let upstream = serve(upstream_app()).await;
    let (proxy, registry) = spawn_proxy(format!("http://{upstream}")).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{proxy}/proxy-request"))
        .header("X-Url", format!("http://{upstream}/web/v1/auth/refresh"))
        .header("X-Method", "GET")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({ "success": true, "data": { "data": { "token": "new-token" } } })
    );

    let session = registry.client_for("").await.unwrap();
    assert_eq!(session.current_token().await, "new-token");
}

#[tokio::test]
async fn test_signed_proxy_dispatches_get_after_refresh() {
    let upstream = serve(upstream_app()).await;
    let (proxy, _registry) = spawn_proxy(format!("http://{upstream}")).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{proxy}/proxy-request"))
        .header("X-Url", format!("http://{upstream}/web/v1/item/list?page=1"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["data"]["items"], json!([]));
}

#[tokio::test]
async fn test_signed_proxy_rejects_unsupported_method() {
    let upstream = serve(upstream_app()).await;
    let (proxy, registry) = spawn_proxy(format!("http://{upstream}")).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{proxy}/proxy-request"))
        .header("X-Url", format!("http://{upstream}/web/v1/item/list"))
        .header("X-Method", "PATCH")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    // rejected before any session work
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_signed_proxy_rejects_malformed_data() {
    let upstream = serve(upstream_app()).await;
    let (proxy, _registry) = spawn_proxy(format!("http://{upstream}")).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{proxy}/proxy-request"))
        .header("X-Url", format!("http://{upstream}/web/v1/item/list"))
        .header("X-Method", "POST")
        .header("X-Data", "{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], json!(false));
    assert!(body["error"].as_str().unwrap().contains("Malformed JSON"));
}

#[tokio::test]
async fn test_failed_refresh_rolls_back_token_and_surfaces_body() {
    let upstream = serve(broken_upstream_app()).await;
    let (proxy, registry) = spawn_proxy(format!("http://{upstream}")).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{proxy}/proxy-request"))
        .header("X-Url", format!("http://{upstream}/web/v1/item/list"))
        .header("X-Token", "seed-token")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["details"]["error"], json!("refresh unavailable"));

    // rollback invariant: the failed refresh left the token untouched
    let session = registry.client_for("seed-token").await.unwrap();
    assert_eq!(session.current_token().await, "seed-token");
}

#[tokio::test]
async fn test_sessions_are_cached_per_token() {
    let upstream = serve(upstream_app()).await;
    let (proxy, registry) = spawn_proxy(format!("http://{upstream}")).await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        client
            .get(format!("http://{proxy}/proxy-request"))
            .header("X-Url", format!("http://{upstream}/web/v1/item/list"))
            .header("X-Token", "tab-token")
            .send()
            .await
            .unwrap();
    }

    assert_eq!(registry.len().await, 1);
}
