//! TCP rerouter
//!
//! Forwards TCP connections from local listen endpoints to remote targets.
//!
//! This service:
//! - Loads routes from a TOML file
//! - Opens one listener per route and relays each client to its target
//! - Reaps sessions whose peers stop responding
//! - Reloads the routes file on SIGHUP

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tcp_rerouter::config::Config;
use tcp_rerouter::{routes_file, ProxyController, Route, SessionObserver, StartReport};

/// Logs session open and close.
struct LogObserver;

impl SessionObserver for LogObserver {
    fn session_started(&self, route: &Route, client_addr: SocketAddr) {
        info!(route = %route.name, client_addr = %client_addr, target = %route.target(), "Session opened");
    }

    fn session_closed(&self, route: &Route, client_addr: SocketAddr) {
        info!(route = %route.name, client_addr = %client_addr, "Session closed");
    }
}

enum Signal {
    Shutdown,
    Reload,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to REROUTER_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tcp rerouter");
    info!(
        routes_file = %config.routes_file.display(),
        sweep_interval_ms = config.sweep_interval.as_millis() as u64,
        probe_timeout_ms = config.probe_timeout.as_millis() as u64,
        connect_timeout_ms = config.connect_timeout.as_millis() as u64,
        buffer_size = config.buffer_size,
        keepalive_secs = config.keepalive_time.as_secs(),
        "Configuration loaded"
    );

    let routes = routes_file::load(&config.routes_file)?;
    let controller =
        ProxyController::with_observer(routes, config.proxy_options(), Arc::new(LogObserver));

    let report = controller.start().await?;
    log_report(&report);

    loop {
        match wait_for_signal().await? {
            Signal::Shutdown => {
                info!("Received shutdown signal");
                break;
            }
            Signal::Reload => {
                info!("Received reload signal");
                let routes = match routes_file::load(&config.routes_file) {
                    Ok(routes) => routes,
                    Err(e) => {
                        error!(error = %format!("{:#}", e), "Keeping current routes");
                        continue;
                    }
                };
                match controller.reload(routes).await {
                    Ok(report) => log_report(&report),
                    Err(e) => error!(error = %e, reason = e.reason_code(), "Keeping current routes"),
                }
            }
        }
    }

    controller.stop().await;

    info!("Rerouter shutdown complete");
    Ok(())
}

fn log_report(report: &StartReport) {
    for (route, result) in &report.results {
        match result {
            Ok(addr) => info!(route = %route, bind_addr = %addr, "Route listening"),
            Err(e) => warn!(route = %route, error = %e, reason = e.reason_code(), "Route disabled"),
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<Signal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok(Signal::Shutdown)
        }
        _ = sigterm.recv() => Ok(Signal::Shutdown),
        _ = sighup.recv() => Ok(Signal::Reload),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<Signal> {
    tokio::signal::ctrl_c().await?;
    Ok(Signal::Shutdown)
}
