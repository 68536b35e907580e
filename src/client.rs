//! Signed HTTP client for the upstream game API.
//!
//! One `UpstreamClient` owns one bearer token and one lazily-created device
//! identity. Every outbound call is signed with the token that is current at
//! call time; there is no implicit retry-with-new-token on signature
//! rejection, that is the caller's responsibility.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell, RwLock};
use url::Url;
use wreq::{Client, Method, header};
use wreq_util::Emulation;

use crate::fingerprint::DeviceIdProvider;
use crate::sign;

/// Unauthenticated endpoint that mints/refreshes the bearer token.
pub const REFRESH_PATH: &str = "/web/v1/auth/refresh";

/// Default upstream API origin; tests and deployments can override it.
pub const DEFAULT_API_BASE: &str = "https://api.papegames.com";

/// Non-2xx upstream response, carrying the body verbatim for debuggability.
#[derive(Debug)]
pub struct UpstreamError {
    pub status: u16,
    pub body: String,
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upstream API returned status {}", self.status)
    }
}

impl std::error::Error for UpstreamError {}

pub struct UpstreamClient {
    http: Client,
    api_base: String,
    token: RwLock<String>,
    device_id: OnceCell<String>,
    provider: Arc<dyn DeviceIdProvider>,
    // refreshes mutate shared session state and must not interleave
    refresh_lock: Mutex<()>,
}

impl UpstreamClient {
    pub fn new(
        provider: Arc<dyn DeviceIdProvider>,
        api_base: impl Into<String>,
        token: String,
    ) -> Result<Self> {
        let http = Client::builder()
            .emulation(Emulation::Chrome143)
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .zstd(true)
            .build()?;

        Ok(Self {
            http,
            api_base: api_base.into(),
            token: RwLock::new(token),
            device_id: OnceCell::new(),
            provider,
            refresh_lock: Mutex::new(()),
        })
    }

    /// The session's current bearer token (may be empty).
    pub async fn current_token(&self) -> String {
        self.token.read().await.clone()
    }

    /// Lazily create the device identity, sharing one in-flight sandbox run
    /// between concurrent callers. A failed run leaves the cell empty so a
    /// later call can retry fingerprinting.
    pub async fn device_id(&self) -> Result<String> {
        let id = self
            .device_id
            .get_or_try_init(|| async {
                tracing::info!("Generating device identity...");
                let id = self.provider.produce_device_id().await?;
                tracing::info!("Device identity ready ({} chars)", id.len());
                Ok::<String, anyhow::Error>(id)
            })
            .await?;
        Ok(id.clone())
    }

    /// Refresh the bearer token via the unauthenticated refresh endpoint.
    ///
    /// The refresh call signs with the *empty* token. On success the session
    /// token is replaced when the response carries `data.token`; on failure
    /// the previous token is preserved and the error propagates.
    pub async fn refresh_token(&self) -> Result<Value> {
        let _guard = self.refresh_lock.lock().await;

        let device_id = self.device_id().await?;
        let url = format!("{}{}", self.api_base, REFRESH_PATH);
        let path = Url::parse(&url)
            .context("Invalid upstream API base")?
            .path()
            .to_string();

        let ts = sign::timestamp_now();
        let sig = sign::sign(&path, "", Some(&device_id), "", ts);

        let body = self
            .send_signed(Method::GET, &url, &device_id, &sig, None)
            .await?;

        if let Some(new_token) = body.pointer("/data/token").and_then(|v| v.as_str()) {
            *self.token.write().await = new_token.to_string();
            tracing::debug!("Session token refreshed");
        }

        Ok(body)
    }

    pub async fn get(&self, url: &str) -> Result<Value> {
        self.dispatch(Method::GET, url, None).await
    }

    pub async fn post(&self, url: &str, data: Option<&str>) -> Result<Value> {
        self.dispatch(Method::POST, url, data).await
    }

    pub async fn put(&self, url: &str, data: Option<&str>) -> Result<Value> {
        self.dispatch(Method::PUT, url, data).await
    }

    pub async fn delete(&self, url: &str) -> Result<Value> {
        self.dispatch(Method::DELETE, url, None).await
    }

    /// Sign and issue one call with the token current at call time.
    ///
    /// GET/DELETE sign over the raw query string (no leading `?`); POST/PUT
    /// sign over the exact serialized body string, or empty if none.
    pub async fn dispatch(&self, method: Method, url: &str, data: Option<&str>) -> Result<Value> {
        let device_id = self.device_id().await?;
        let parsed = Url::parse(url).context("Invalid upstream URL")?;
        let path = parsed.path().to_string();

        let mutating = method == Method::POST || method == Method::PUT;
        let material = if mutating {
            data.unwrap_or("").to_string()
        } else {
            parsed.query().unwrap_or("").to_string()
        };

        let token = self.token.read().await.clone();
        let ts = sign::timestamp_now();
        let sig = sign::sign(&path, &material, Some(&device_id), &token, ts);

        let body = if mutating { data } else { None };
        self.send_signed(method, url, &device_id, &sig, body).await
    }

    async fn send_signed(
        &self,
        method: Method,
        url: &str,
        device_id: &str,
        sig: &sign::Signature,
        body: Option<&str>,
    ) -> Result<Value> {
        let mut request = self
            .http
            .request(method, url)
            .header("platform", sign::PLATFORM)
            .header("timestamp", &sig.timestamp)
            .header("dId", device_id)
            .header("vName", sign::CLIENT_VERSION)
            .header("sign", &sig.signature)
            .header(header::CONTENT_TYPE, "application/json");

        if let Some(body) = body {
            request = request.body(body.to_string());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Upstream request to {} failed", url))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read upstream response body")?;

        if !status.is_success() {
            return Err(anyhow::Error::new(UpstreamError {
                status: status.as_u16(),
                body: text,
            }));
        }

        // Upstream responses are JSON; tolerate the odd plain-text body
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}
