use std::process::Stdio;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use infold_proxy::supervisor::{self, ProxyGuard, SupervisorConfig};

fn usage(program: &str) {
    eprintln!("Usage: {program} [flags] <crawler command> [crawler args...]");
    eprintln!("  --proxy-endpoint <url>          proxy-request endpoint (default {})", supervisor::DEFAULT_ENDPOINT);
    eprintln!("  --proxy-host <host>             host for the default endpoint");
    eprintln!("  --proxy-port <port>             port for the default endpoint");
    eprintln!("  --proxy-start-timeout-ms <ms>   startup budget (floor 3000, default 30000)");
    eprintln!("  --skip-proxy-install            never try to build the server binary");
    eprintln!("Everything after the first non-flag argument is forwarded to the crawler.");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "infold_proxy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "infold-proxy".into());

    let config = match supervisor::parse_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}\n");
            usage(&program);
            std::process::exit(1);
        }
    };

    if config.delegate.is_empty() {
        eprintln!("Error: no crawler command given\n");
        usage(&program);
        std::process::exit(1);
    }

    let code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("Supervisor failed: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(config: SupervisorConfig) -> Result<i32> {
    let http = wreq::Client::builder().build()?;
    let health = supervisor::health_url(&config.endpoint)?;
    let mut guard = ProxyGuard::not_started();

    if supervisor::is_loopback(&config.endpoint)? {
        if supervisor::probe_health(&http, &health).await {
            tracing::info!("Reusing healthy proxy at {}", config.endpoint);
        } else {
            let binary = supervisor::ensure_server_binary(config.skip_install)?;
            let port = supervisor::endpoint_port(&config.endpoint)?;
            tracing::info!("Starting proxy server {} on port {}", binary.display(), port);

            let child = supervisor::spawn_proxy(&binary, port)?;
            guard = ProxyGuard::started(child);

            match supervisor::wait_for_health(&http, &health, config.start_timeout, guard.child_mut())
                .await
            {
                Ok(true) => tracing::info!("Proxy server healthy"),
                Ok(false) => {
                    guard.shutdown().await;
                    anyhow::bail!(
                        "Proxy server did not become healthy within {:?}",
                        config.start_timeout
                    );
                }
                Err(e) => {
                    guard.shutdown().await;
                    return Err(e);
                }
            }
        }
    } else {
        tracing::info!(
            "Endpoint {} is not loopback, skipping local proxy management",
            config.endpoint
        );
    }

    // Delegate to the crawler, forwarding the resolved endpoint
    let mut command = tokio::process::Command::new(&config.delegate[0]);
    command
        .args(&config.delegate[1..])
        .arg("--proxy-endpoint")
        .arg(&config.endpoint)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let mut crawler = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            guard.shutdown().await;
            return Err(e).with_context(|| format!("Failed to spawn crawler {}", config.delegate[0]));
        }
    };

    let code = tokio::select! {
        status = crawler.wait() => {
            match status.context("Failed waiting for crawler") {
                Ok(status) => {
                    tracing::info!("Crawler exited: {}", status);
                    status.code().unwrap_or(1)
                }
                Err(e) => {
                    guard.shutdown().await;
                    return Err(e);
                }
            }
        }
        signal_code = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
            let _ = crawler.start_kill();
            let _ = crawler.wait().await;
            signal_code
        }
    };

    guard.shutdown().await;
    Ok(code)
}

/// Resolve to the conventional exit code for the signal received.
async fn shutdown_signal() -> i32 {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => 130,
        _ = terminate => 143,
    }
}
