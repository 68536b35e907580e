//! Stateless HTTP front door for the browser application.
//!
//! Routes requests to a cached per-token [`UpstreamClient`], or passes raw
//! binary responses through untouched for image URLs. Every response carries
//! permissive CORS so the browser app can call the proxy from any origin.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use url::Url;
use wreq::Client;
use wreq_util::Emulation;

use crate::client::{DEFAULT_API_BASE, UpstreamError};
use crate::registry::ClientRegistry;

/// Name reported by the health route.
pub const SERVICE_NAME: &str = "infold-proxy";

/// Default port for the local proxy.
pub const DEFAULT_PORT: u16 = 12345;

/// User agent for the raw passthrough when the caller didn't supply one.
const PASSTHROUGH_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";

const PASSTHROUGH_ACCEPT: &str = "image/avif,image/webp,image/png,image/*,*/*;q=0.8";

const DEFAULT_CACHE_CONTROL: &str = "public, max-age=3600";

/// Custom headers the signed-proxy route reads; all must be CORS-allowed.
const CUSTOM_HEADERS: [&str; 7] = [
    "x-method",
    "x-url",
    "x-token",
    "x-data",
    "x-path",
    "x-params",
    "x-device-id",
];

/// Server configuration read from the environment.
pub struct ServerConfig {
    pub port: u16,
    pub api_base: String,
    pub fingerprint_script: PathBuf,
    pub proxy_debug: bool,
    pub sign_debug: bool,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            api_base: env::var("UPSTREAM_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.into()),
            fingerprint_script: env::var("FINGERPRINT_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("fingerprint-sdk.js")),
            proxy_debug: env_flag("PROXY_DEBUG"),
            sign_debug: env_flag("SIGN_DEBUG"),
        }
    }

    /// Default tracing directives honoring the two debug flags.
    pub fn env_filter(&self) -> String {
        let mut filter = if self.proxy_debug {
            "infold_proxy=debug,tower_http=debug".to_string()
        } else {
            "infold_proxy=info,tower_http=info".to_string()
        };
        if self.sign_debug {
            filter.push_str(",infold_proxy::sign=debug");
        }
        filter
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| {
            let v = v.to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes"
        })
        .unwrap_or(false)
}

/// Application state shared across all requests.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    passthrough: Client,
}

impl AppState {
    pub fn new(registry: Arc<ClientRegistry>) -> Result<Self> {
        let passthrough = Client::builder()
            .emulation(Emulation::Chrome143)
            .gzip(true)
            .brotli(true)
            .zstd(true)
            .build()?;
        Ok(Self {
            registry,
            passthrough,
        })
    }
}

/// Build the Axum application with routes and middleware.
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(CUSTOM_HEADERS.map(HeaderName::from_static));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/proxy/image", get(image_proxy))
        .route("/proxy-request", get(proxy_request))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

/// Health check endpoint, polled by the process supervisor.
async fn health_check() -> Json<Value> {
    Json(json!({
        "ok": true,
        "service": SERVICE_NAME,
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Raw binary passthrough for `<img>`-style fetches.
///
/// The target comes from the `url` query parameter or the `X-Url` header;
/// the query parameter takes precedence because browsers cannot set custom
/// headers on image tags.
async fn image_proxy(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let url = params
        .get("url")
        .cloned()
        .or_else(|| header_string(&headers, "x-url"))
        .ok_or_else(|| ApiError::BadRequest("Missing url parameter or X-Url header".into()))?;

    fetch_passthrough(&state, &url, &headers).await
}

/// Signed proxy: forwards an arbitrary call to the upstream API on behalf of
/// the browser, refreshing the session token first.
async fn proxy_request(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let query_url = params.get("url").cloned();
    let url = query_url
        .clone()
        .or_else(|| header_string(&headers, "x-url"))
        .ok_or_else(|| ApiError::BadRequest("Missing url parameter or X-Url header".into()))?;

    // A query-supplied URL is a transparent <img>-style fetch, never signed
    if query_url.is_some() {
        return fetch_passthrough(&state, &url, &headers).await;
    }

    validate_scheme(&url)?;

    let method = header_string(&headers, "x-method")
        .unwrap_or_else(|| "GET".into())
        .to_ascii_uppercase();
    let token = header_string(&headers, "x-token").unwrap_or_default();
    let data = header_string(&headers, "x-data");

    if !matches!(method.as_str(), "GET" | "POST" | "PUT" | "DELETE") {
        return Err(ApiError::BadRequest(format!(
            "Unsupported method: {method}"
        )));
    }

    if let Some(ref data) = data {
        serde_json::from_str::<Value>(data)
            .map_err(|e| ApiError::BadRequest(format!("Malformed JSON in X-Data: {e}")))?;
    }

    let client = state
        .registry
        .client_for(&token)
        .await
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;

    client.refresh_token().await.map_err(ApiError::upstream)?;

    let result = match method.as_str() {
        "GET" => client.get(&url).await,
        "DELETE" => client.delete(&url).await,
        "POST" => {
            let body = data
                .as_deref()
                .ok_or_else(|| ApiError::BadRequest("X-Data is required for POST".into()))?;
            client.post(&url, Some(body)).await
        }
        "PUT" => {
            let body = data
                .as_deref()
                .ok_or_else(|| ApiError::BadRequest("X-Data is required for PUT".into()))?;
            client.put(&url, Some(body)).await
        }
        _ => unreachable!("method validated above"),
    }
    .map_err(ApiError::upstream)?;

    Ok(Json(json!({ "success": true, "data": result })).into_response())
}

/// Fetch `url` and mirror the interesting response headers back.
async fn fetch_passthrough(
    state: &AppState,
    url: &str,
    inbound: &HeaderMap,
) -> Result<Response, ApiError> {
    validate_scheme(url)?;

    let user_agent = header_string(inbound, "user-agent")
        .unwrap_or_else(|| PASSTHROUGH_USER_AGENT.to_string());
    let accept =
        header_string(inbound, "accept").unwrap_or_else(|| PASSTHROUGH_ACCEPT.to_string());

    let response = state
        .passthrough
        .get(url)
        .header("user-agent", user_agent)
        .header("accept", accept)
        .send()
        .await
        .map_err(|e| ApiError::Internal(format!("Passthrough fetch failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::UpstreamStatus {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }

    let content_type = passthrough_header(&response, "content-type")
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let cache_control = passthrough_header(&response, "cache-control")
        .unwrap_or_else(|| DEFAULT_CACHE_CONTROL.to_string());

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to read passthrough body: {e}")))?;

    let mut mirrored = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        mirrored.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&cache_control) {
        mirrored.insert(header::CACHE_CONTROL, value);
    }

    Ok((StatusCode::OK, mirrored, bytes.to_vec()).into_response())
}

fn validate_scheme(url: &str) -> Result<(), ApiError> {
    let parsed =
        Url::parse(url).map_err(|_| ApiError::BadRequest(format!("Invalid url: {url}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ApiError::BadRequest(format!(
            "url must be http(s), got scheme '{}'",
            parsed.scheme()
        )));
    }
    Ok(())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn passthrough_header(response: &wreq::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// API error types, mapped to JSON error envelopes.
pub enum ApiError {
    BadRequest(String),
    UpstreamStatus { status: u16, url: String },
    Upstream { message: String, details: Option<Value> },
    Internal(String),
}

impl ApiError {
    /// Classify an upstream-client failure, carrying the upstream response
    /// body verbatim when present.
    fn upstream(err: anyhow::Error) -> Self {
        if let Some(upstream) = err.downcast_ref::<UpstreamError>() {
            let details = serde_json::from_str(&upstream.body)
                .ok()
                .or_else(|| Some(Value::String(upstream.body.clone())));
            ApiError::Upstream {
                message: upstream.to_string(),
                details,
            }
        } else {
            ApiError::Upstream {
                message: format!("{err:#}"),
                details: None,
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                json!({ "success": false, "error": message }),
            ),
            ApiError::UpstreamStatus { status, url } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "success": false,
                    "error": format!("Upstream returned status {status}"),
                    "status": status,
                    "url": url,
                }),
            ),
            ApiError::Upstream { message, details } => {
                tracing::error!("Upstream error: {}", message);
                let mut body = json!({ "success": false, "error": message });
                if let Some(details) = details {
                    body["details"] = details;
                }
                (StatusCode::INTERNAL_SERVER_ERROR, body)
            }
            ApiError::Internal(message) => {
                tracing::error!("Proxy error: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "success": false, "error": message }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
