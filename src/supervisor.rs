//! Process supervision for the local proxy server.
//!
//! The supervisor ensures a healthy proxy is reachable before delegating to
//! the crawler, and guarantees the proxy it started is torn down on every
//! exit path, including interrupt signals.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tokio::process::{Child, Command};
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:12345/proxy-request";

/// Overall startup budget for a freshly spawned proxy.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const MIN_START_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Per-attempt budget for one health probe, distinct from the startup budget.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_millis(1_300);
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long to wait after SIGTERM before force-killing the proxy.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Name of the proxy server binary built from this crate.
pub const SERVER_BIN: &str = "server";

/// Supervisor configuration parsed from the command line.
#[derive(Debug)]
pub struct SupervisorConfig {
    /// Resolved proxy-request endpoint forwarded to the crawler.
    pub endpoint: String,
    pub start_timeout: Duration,
    pub skip_install: bool,
    /// Crawler command and arguments, passed through verbatim.
    pub delegate: Vec<String>,
}

/// Parse supervisor flags; everything unrecognized begins the delegate
/// command line and is forwarded untouched.
pub fn parse_args<I: Iterator<Item = String>>(mut args: I) -> Result<SupervisorConfig> {
    let mut endpoint: Option<String> = None;
    let mut host: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut timeout_ms: Option<u64> = None;
    let mut skip_install = false;
    let mut delegate: Vec<String> = Vec::new();

    while let Some(arg) = args.next() {
        if !delegate.is_empty() {
            delegate.push(arg);
            continue;
        }
        match arg.as_str() {
            "--proxy-endpoint" => {
                endpoint = Some(args.next().context("--proxy-endpoint requires a value")?);
            }
            "--proxy-host" => {
                host = Some(args.next().context("--proxy-host requires a value")?);
            }
            "--proxy-port" => {
                let value = args.next().context("--proxy-port requires a value")?;
                port = Some(
                    value
                        .parse()
                        .with_context(|| format!("Invalid --proxy-port: {value}"))?,
                );
            }
            "--proxy-start-timeout-ms" => {
                let value = args
                    .next()
                    .context("--proxy-start-timeout-ms requires a value")?;
                timeout_ms = Some(
                    value
                        .parse()
                        .with_context(|| format!("Invalid --proxy-start-timeout-ms: {value}"))?,
                );
            }
            "--skip-proxy-install" => skip_install = true,
            _ => delegate.push(arg),
        }
    }

    let endpoint = endpoint.unwrap_or_else(|| {
        format!(
            "http://{}:{}/proxy-request",
            host.as_deref().unwrap_or("127.0.0.1"),
            port.unwrap_or(crate::server::DEFAULT_PORT),
        )
    });

    let start_timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_START_TIMEOUT)
        .max(MIN_START_TIMEOUT);

    Ok(SupervisorConfig {
        endpoint,
        start_timeout,
        skip_install,
        delegate,
    })
}

/// Derive the health route from the proxy-request endpoint.
pub fn health_url(endpoint: &str) -> Result<String> {
    let mut url = Url::parse(endpoint).context("Invalid proxy endpoint")?;
    url.set_path("/health");
    url.set_query(None);
    Ok(url.to_string())
}

/// Port the endpoint targets, for the spawned server's PORT env.
pub fn endpoint_port(endpoint: &str) -> Result<u16> {
    let url = Url::parse(endpoint).context("Invalid proxy endpoint")?;
    url.port_or_known_default()
        .context("Proxy endpoint has no port")
}

/// Whether the endpoint host is loopback; non-loopback endpoints get no
/// local process management at all.
pub fn is_loopback(endpoint: &str) -> Result<bool> {
    let url = Url::parse(endpoint).context("Invalid proxy endpoint")?;
    Ok(match url.host() {
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        None => false,
    })
}

/// One bounded health probe; any error or timeout counts as unhealthy.
pub async fn probe_health(http: &wreq::Client, url: &str) -> bool {
    match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, http.get(url).send()).await {
        Ok(Ok(response)) => response.status().is_success(),
        _ => false,
    }
}

/// Poll the health route until it answers, the child dies, or `timeout`
/// elapses. Returns `Ok(false)` only once the full timeout has passed.
pub async fn wait_for_health(
    http: &wreq::Client,
    url: &str,
    timeout: Duration,
    mut child: Option<&mut Child>,
) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if probe_health(http, url).await {
            return Ok(true);
        }
        if let Some(child) = child.as_deref_mut()
            && let Some(status) = child.try_wait().context("Failed to poll proxy process")?
        {
            bail!("Proxy server exited before becoming healthy: {status}");
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
}

/// Locate the proxy server binary: next to the current executable first,
/// then the usual cargo target directories.
pub fn find_server_binary() -> Option<PathBuf> {
    let name = format!("{}{}", SERVER_BIN, std::env::consts::EXE_SUFFIX);

    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let sibling = dir.join(&name);
        if sibling.is_file() {
            return Some(sibling);
        }
    }

    for dir in ["target/release", "target/debug"] {
        let candidate = PathBuf::from(dir).join(&name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    None
}

/// Ensure the proxy server binary exists, building it when missing.
///
/// Build candidates run in order; the first exit-zero attempt wins. On
/// exhaustion the error lists every attempt and its outcome.
pub fn ensure_server_binary(skip_install: bool) -> Result<PathBuf> {
    if let Some(binary) = find_server_binary() {
        return Ok(binary);
    }
    if skip_install {
        bail!("Proxy server binary not found and --skip-proxy-install was given");
    }

    let candidates: [(&str, &[&str], &str); 2] = [
        (
            "cargo",
            &["build", "--release", "--bin", SERVER_BIN],
            "cargo release build",
        ),
        ("cargo", &["build", "--bin", SERVER_BIN], "cargo debug build"),
    ];

    let mut attempts: Vec<String> = Vec::new();
    for (command, args, label) in candidates {
        tracing::info!("Provisioning proxy server: {} {}", command, args.join(" "));
        let outcome = match std::process::Command::new(command).args(args).status() {
            Ok(status) if status.success() => {
                if let Some(binary) = find_server_binary() {
                    return Ok(binary);
                }
                "succeeded but binary still missing".to_string()
            }
            Ok(status) => format!("exited with {status}"),
            Err(e) => format!("failed to spawn: {e}"),
        };
        attempts.push(format!("{label} ({command} {}): {outcome}", args.join(" ")));
    }

    bail!(
        "Could not provision the proxy server binary; attempts:\n  {}",
        attempts.join("\n  ")
    )
}

/// Spawn the proxy server detached with inherited standard streams.
pub fn spawn_proxy(binary: &Path, port: u16) -> Result<Child> {
    Command::new(binary)
        .env("PORT", port.to_string())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(false)
        .spawn()
        .with_context(|| format!("Failed to spawn proxy server {}", binary.display()))
}

/// Scoped ownership of the proxy process the supervisor started.
///
/// `shutdown` is idempotent: multiple triggers (delegate completion, abort,
/// interrupt signal) result in one graceful-then-forced teardown.
pub struct ProxyGuard {
    child: Option<Child>,
    cleaned: bool,
}

impl ProxyGuard {
    /// Guard for a proxy we did not start; shutdown is a no-op.
    pub fn not_started() -> Self {
        Self {
            child: None,
            cleaned: false,
        }
    }

    pub fn started(child: Child) -> Self {
        Self {
            child: Some(child),
            cleaned: false,
        }
    }

    pub fn started_by_us(&self) -> bool {
        self.child.is_some()
    }

    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    /// Graceful stop: termination signal, poll for exit up to the grace
    /// period, then force-kill if still alive.
    pub async fn shutdown(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        let Some(mut child) = self.child.take() else {
            return;
        };

        tracing::info!("Stopping proxy server...");

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!("Failed to signal proxy server: {}", e);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!("Proxy server exited: {}", status);
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Failed to poll proxy server: {}", e);
                    break;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        tracing::warn!("Proxy server still alive after grace period, force-killing");
        if let Err(e) = child.kill().await {
            tracing::warn!("Force-kill failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{Router, http::StatusCode, routing::get};

    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_parse_args_defaults() {
        let config = parse_args(args(&["crawl", "--depth", "2"])).unwrap();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.start_timeout, DEFAULT_START_TIMEOUT);
        assert!(!config.skip_install);
        assert_eq!(config.delegate, vec!["crawl", "--depth", "2"]);
    }

    #[test]
    fn test_parse_args_host_port_combine() {
        let config = parse_args(args(&[
            "--proxy-host",
            "127.0.0.2",
            "--proxy-port",
            "9000",
            "crawl",
        ]))
        .unwrap();
        assert_eq!(config.endpoint, "http://127.0.0.2:9000/proxy-request");
    }

    #[test]
    fn test_parse_args_endpoint_wins_over_host_port() {
        let config = parse_args(args(&[
            "--proxy-endpoint",
            "http://10.0.0.5:4000/proxy-request",
            "--proxy-port",
            "9000",
            "crawl",
        ]))
        .unwrap();
        assert_eq!(config.endpoint, "http://10.0.0.5:4000/proxy-request");
    }

    #[test]
    fn test_parse_args_timeout_floor() {
        let config =
            parse_args(args(&["--proxy-start-timeout-ms", "100", "crawl"])).unwrap();
        assert_eq!(config.start_timeout, MIN_START_TIMEOUT);
    }

    #[test]
    fn test_parse_args_flags_after_delegate_pass_through() {
        let config = parse_args(args(&["crawl", "--proxy-port", "9000"])).unwrap();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.delegate, vec!["crawl", "--proxy-port", "9000"]);
    }

    #[test]
    fn test_health_url_and_port() {
        assert_eq!(
            health_url("http://127.0.0.1:12345/proxy-request?x=1").unwrap(),
            "http://127.0.0.1:12345/health"
        );
        assert_eq!(endpoint_port("http://127.0.0.1:12345/proxy-request").unwrap(), 12345);
        assert_eq!(endpoint_port("https://proxy.example.test/proxy-request").unwrap(), 443);
    }

    #[test]
    fn test_is_loopback() {
        assert!(is_loopback("http://127.0.0.1:12345/proxy-request").unwrap());
        assert!(is_loopback("http://localhost:12345/proxy-request").unwrap());
        assert!(!is_loopback("http://proxy.example.test/proxy-request").unwrap());
    }

    async fn serve(app: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_wait_for_health_succeeds_on_third_poll() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/health",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        );
        let addr = serve(app).await;

        let http = wreq::Client::builder().build().unwrap();
        let url = format!("http://{addr}/health");
        let healthy = wait_for_health(&http, &url, Duration::from_secs(5), None)
            .await
            .unwrap();

        assert!(healthy);
        assert!(hits.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_wait_for_health_times_out_no_earlier() {
        // Bind then drop to get a port that refuses connections
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let http = wreq::Client::builder().build().unwrap();
        let url = format!("http://{addr}/health");
        let timeout = Duration::from_millis(1200);

        let start = Instant::now();
        let healthy = wait_for_health(&http, &url, timeout, None).await.unwrap();

        assert!(!healthy);
        assert!(start.elapsed() >= timeout);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_guard_terminates_spawned_child() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id().unwrap() as i32);
        let mut guard = ProxyGuard::started(child);
        assert!(guard.started_by_us());

        guard.shutdown().await;

        // signal 0 probes for existence; the child must be gone, not merely
        // signaled
        assert!(kill(pid, None).is_err());

        // second trigger is a no-op
        guard.shutdown().await;
        assert!(!guard.started_by_us());
    }

    #[tokio::test]
    async fn test_guard_noop_when_not_started() {
        let mut guard = ProxyGuard::not_started();
        assert!(!guard.started_by_us());
        guard.shutdown().await;
    }
}
