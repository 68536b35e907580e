//! V8-based sandbox for the vendor device-fingerprinting script.
//!
//! Uses `deno_core` to embed a V8 engine that runs the fingerprint SDK the
//! upstream mobile/web client ships, against mocked browser globals
//! (navigator, screen, document, canvas). The SDK probes canvas APIs for
//! entropy; the mocks provide no-op drawing primitives, zero-size text
//! measurement, and an empty pixel buffer, which is enough for the SDK to
//! initialize and report a device id.
//!
//! The SDK config and a ready-callback list are installed *before* the vendor
//! script executes. Once initialized, the SDK drains the callback list; our
//! callback stores `SMSdk.getDeviceId()` into a global we read back after the
//! event loop settles.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use deno_core::{JsRuntime, PollEventLoopOptions, RuntimeOptions};

/// SDK configuration injected as `_smConf` before the vendor script runs.
pub const SDK_ORGANIZATION: &str = "UlONVMDKrhpjeSV2g3gG";
pub const SDK_APP_ID: &str = "default";
pub const SDK_PUBLIC_KEY: &str = "MIGfMA0GCSqGSIb3DQEBAQUAA4GNADCBiQKBgQDHC1NbzuOpSHmE\
t5iyr4hIdB7vsLklCJOFsDfbHvnTIfvHgNEVSwHKENLMB3TUiTpFuLHZtGWFMHqDaZtjBEzv70heCBU\
2E39MGl3Ep3i7XCyO866nG1kRTMmkN0WYGpAR5XF0i7cDqmqYnSN8mUZprkbJhT5B0rYiVLRae10rGwIDAQAB";
pub const SDK_PROTOCOL: &str = "https";

/// Browser mocks providing the DOM surface the fingerprint SDK probes.
///
/// Drawing is entirely no-op: the SDK only needs the calls to exist, not to
/// produce real pixels. Non-fatal environment errors (layout, rendering,
/// missing APIs) are swallowed via the global error hook so only a failure to
/// compile or execute the vendor script itself surfaces to Rust.
const BROWSER_MOCKS: &str = r#"
// DOM constructors for instanceof checks
globalThis.HTMLElement = function HTMLElement() {};
globalThis.HTMLCanvasElement = function HTMLCanvasElement() {};
HTMLCanvasElement.prototype = Object.create(HTMLElement.prototype);
globalThis.CanvasRenderingContext2D = function CanvasRenderingContext2D() {};

globalThis.window = globalThis;
globalThis.self = globalThis;
globalThis.top = globalThis;
globalThis.parent = globalThis;

// Swallow non-fatal environment errors raised by the isolated context
globalThis.onerror = function() { return true; };

globalThis.navigator = {
    userAgent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36",
    language: "en-US",
    languages: ["en-US", "en"],
    platform: "Win32",
    hardwareConcurrency: 8,
    maxTouchPoints: 0,
    webdriver: false,
    cookieEnabled: true,
    vendor: "Google Inc.",
    appName: "Netscape",
    appVersion: "5.0 (Windows NT 10.0; Win64; x64)",
    onLine: true,
    plugins: { length: 0 },
    mimeTypes: { length: 0 },
    javaEnabled: function() { return false; },
};

globalThis.screen = {
    width: 1920, height: 1080,
    availWidth: 1920, availHeight: 1040,
    colorDepth: 24, pixelDepth: 24,
};

globalThis.location = {
    href: "https://localhost/",
    hostname: "localhost",
    host: "localhost",
    origin: "https://localhost",
    protocol: "https:",
    pathname: "/",
    search: "",
    hash: "",
};

function _mock2dContext() {
    var ctx = Object.create(CanvasRenderingContext2D.prototype);
    ctx.fillStyle = ""; ctx.strokeStyle = ""; ctx.font = "10px sans-serif";
    ctx.textBaseline = "alphabetic"; ctx.globalCompositeOperation = "source-over";
    ctx.fillRect = function(){}; ctx.strokeRect = function(){}; ctx.clearRect = function(){};
    ctx.beginPath = function(){}; ctx.closePath = function(){};
    ctx.moveTo = function(){}; ctx.lineTo = function(){}; ctx.arc = function(){};
    ctx.rect = function(){}; ctx.fill = function(){}; ctx.stroke = function(){};
    ctx.fillText = function(){}; ctx.strokeText = function(){};
    ctx.rotate = function(){}; ctx.translate = function(){}; ctx.save = function(){};
    ctx.restore = function(){}; ctx.drawImage = function(){};
    ctx.measureText = function() { return { width: 0 }; };
    ctx.getImageData = function(x, y, w, h) {
        return { data: new Uint8ClampedArray(w * h * 4), width: w, height: h };
    };
    ctx.putImageData = function(){};
    ctx.createLinearGradient = function(){ return { addColorStop: function(){} }; };
    ctx.canvas = { width: 300, height: 150 };
    return ctx;
}

function _mockCanvas() {
    var canvas = Object.create(HTMLCanvasElement.prototype);
    canvas.width = 300;
    canvas.height = 150;
    canvas.style = {};
    canvas.getContext = function(type) {
        if ((type || "").indexOf("2d") !== -1) return _mock2dContext();
        return null;
    };
    canvas.toDataURL = function() { return "data:image/png;base64,"; };
    canvas.setAttribute = function(){};
    canvas.getAttribute = function(){ return null; };
    return canvas;
}

globalThis.document = {
    cookie: "",
    referrer: "",
    title: "",
    documentElement: { style: {}, getAttribute: function(){ return null; } },
    head: { appendChild: function(){}, removeChild: function(){} },
    body: { appendChild: function(){}, removeChild: function(){}, style: {} },
    createElement: function(tag) {
        if ((tag || "").toLowerCase() === "canvas") return _mockCanvas();
        return {
            style: {},
            setAttribute: function(){}, getAttribute: function(){ return null; },
            appendChild: function(){ return this; }, removeChild: function(){},
            addEventListener: function(){}, removeEventListener: function(){},
        };
    },
    getElementById: function() { return null; },
    getElementsByTagName: function() { return []; },
    querySelector: function() { return null; },
    querySelectorAll: function() { return []; },
    addEventListener: function(){},
    removeEventListener: function(){},
    hidden: false,
    visibilityState: "visible",
};

globalThis.localStorage = {
    _data: {},
    getItem: function(k){ return Object.prototype.hasOwnProperty.call(this._data, k) ? this._data[k] : null; },
    setItem: function(k, v){ this._data[k] = String(v); },
    removeItem: function(k){ delete this._data[k]; },
    clear: function(){ this._data = {}; },
};
globalThis.sessionStorage = Object.create(globalThis.localStorage);
globalThis.sessionStorage._data = {};

// Network is disabled in the sandbox; the SDK falls back to local entropy
globalThis.XMLHttpRequest = function() {
    this.open = function(){}; this.send = function(){};
    this.setRequestHeader = function(){};
    this.readyState = 0; this.status = 0; this.responseText = "";
};
globalThis.fetch = async function() {
    return { ok: false, status: 0, text: async function(){ return ""; } };
};

// Timer stubs (bare V8 has no browser timers); callbacks run inline
(function() {
    var _id = 0;
    if (typeof globalThis.setTimeout === 'undefined') {
        globalThis.setTimeout = function(cb) { if (typeof cb === 'function') { try { cb(); } catch(e) {} } return ++_id; };
    }
    if (typeof globalThis.clearTimeout === 'undefined') globalThis.clearTimeout = function() {};
    if (typeof globalThis.setInterval === 'undefined') globalThis.setInterval = function() { return ++_id; };
    if (typeof globalThis.clearInterval === 'undefined') globalThis.clearInterval = function() {};
})();

globalThis.addEventListener = function(){};
globalThis.removeEventListener = function(){};
globalThis.innerWidth = 1920; globalThis.innerHeight = 1080;
globalThis.devicePixelRatio = 1;
globalThis.Image = function() { this.src = ""; this.width = 0; this.height = 0; };

if (typeof console === 'undefined') {
    globalThis.console = {
        log: function(){}, warn: function(){}, error: function(){},
        info: function(){}, debug: function(){},
    };
}
"#;

/// Device-id extraction wired through the SDK's ready-callback list.
///
/// The vendor script reads `_smConf` during initialization and invokes every
/// function queued in `_smReadyFuncs` once `SMSdk` is usable.
const SDK_BOOTSTRAP: &str = r#"
globalThis.__deviceId = null;
globalThis.__deviceIdError = null;
globalThis._smReadyFuncs = [function() {
    try {
        globalThis.__deviceId = SMSdk.getDeviceId();
    } catch (e) {
        globalThis.__deviceIdError = String(e);
    }
}];
"#;

/// Narrow seam between the Upstream Client and device-id production.
///
/// The sandbox is one implementation; tests inject counting doubles.
#[async_trait]
pub trait DeviceIdProvider: Send + Sync {
    async fn produce_device_id(&self) -> Result<String>;
}

/// Isolated V8 context that runs the vendor fingerprint script once.
pub struct DeviceIdSandbox {
    runtime: JsRuntime,
}

impl DeviceIdSandbox {
    /// Create a fresh V8 runtime with browser mocks and the SDK config
    /// installed ahead of the vendor script.
    pub fn new() -> Result<Self> {
        let mut runtime = JsRuntime::new(RuntimeOptions::default());

        runtime
            .execute_script("[browser_mocks]", BROWSER_MOCKS)
            .map_err(|e| anyhow::anyhow!("Failed to install browser mocks: {}", e))?;

        runtime
            .execute_script("[sdk_bootstrap]", SDK_BOOTSTRAP)
            .map_err(|e| anyhow::anyhow!("Failed to install SDK bootstrap: {}", e))?;

        let conf = format!(
            "globalThis._smConf = {};",
            serde_json::json!({
                "organization": SDK_ORGANIZATION,
                "appId": SDK_APP_ID,
                "publicKey": SDK_PUBLIC_KEY,
                "protocol": SDK_PROTOCOL,
            })
        );
        runtime
            .execute_script("[sdk_conf]", conf)
            .map_err(|e| anyhow::anyhow!("Failed to install SDK config: {}", e))?;

        Ok(Self { runtime })
    }

    /// Execute the vendor script and return the device id it reports.
    ///
    /// Only a compile/execution error of the vendor script itself rejects;
    /// environment noise inside the sandbox is swallowed by the mocks.
    pub async fn execute(&mut self, vendor_script: &str) -> Result<String> {
        self.runtime
            .execute_script("[vendor_fingerprint]", vendor_script.to_string())
            .map_err(|e| anyhow::anyhow!("Fingerprint script failed: {}", e))?;

        // Drain any async work the SDK queued before reading the result
        self.runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await
            .map_err(|e| anyhow::anyhow!("Event loop error during fingerprinting: {}", e))?;

        let read_script = r#"
            (function() {
                if (globalThis.__deviceIdError) {
                    return JSON.stringify({ "error": globalThis.__deviceIdError });
                }
                if (globalThis.__deviceId === null || globalThis.__deviceId === undefined) {
                    return JSON.stringify({ "error": "SDK never invoked the ready callback" });
                }
                return JSON.stringify({ "deviceId": String(globalThis.__deviceId) });
            })()
        "#;

        let result = self
            .runtime
            .execute_script("[read_device_id]", read_script)
            .map_err(|e| anyhow::anyhow!("Failed to read device id: {}", e))?;

        let json_str: String = {
            let context = self.runtime.main_context();
            let isolate = self.runtime.v8_isolate();
            let mut handle_scope = deno_core::v8::HandleScope::new(isolate);
            let handle_scope = unsafe { std::pin::Pin::new_unchecked(&mut handle_scope) };
            let handle_scope = &mut handle_scope.init();
            let context_local = deno_core::v8::Local::new(handle_scope, context);
            let scope = &mut deno_core::v8::ContextScope::new(handle_scope, context_local);
            let local = deno_core::v8::Local::new(scope, &result);
            let str_val = local
                .to_string(scope)
                .ok_or_else(|| anyhow::anyhow!("V8 result is not a string"))?;
            str_val.to_rust_string_lossy(scope)
        };

        let parsed: serde_json::Value = serde_json::from_str(&json_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse device id result: {} (raw: {})", e, json_str))?;

        if let Some(error) = parsed.get("error").and_then(|v| v.as_str()) {
            anyhow::bail!("Fingerprinting error: {}", error);
        }

        parsed
            .get("deviceId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Device id missing from result: {}", json_str))
    }
}

/// Run the vendor script from `script_path` in a fresh sandbox.
///
/// V8 isolates are not `Send`, so the whole sandbox lifetime lives on a
/// dedicated blocking thread.
pub async fn create_device_id(script_path: PathBuf) -> Result<String> {
    let vendor_script = tokio::fs::read_to_string(&script_path)
        .await
        .with_context(|| format!("Failed to read fingerprint script {}", script_path.display()))?;

    tokio::task::spawn_blocking(move || {
        use futures::executor::block_on;

        let mut sandbox = DeviceIdSandbox::new().context("Failed to create V8 sandbox")?;
        block_on(sandbox.execute(&vendor_script))
    })
    .await
    .context("Fingerprint task panicked")?
}

/// Production [`DeviceIdProvider`] backed by the sandbox and a script file
/// supplied at startup.
pub struct SandboxDeviceIdProvider {
    script_path: PathBuf,
}

impl SandboxDeviceIdProvider {
    pub fn new(script_path: PathBuf) -> Self {
        Self { script_path }
    }
}

#[async_trait]
impl DeviceIdProvider for SandboxDeviceIdProvider {
    async fn produce_device_id(&self) -> Result<String> {
        create_device_id(self.script_path.clone()).await
    }
}
