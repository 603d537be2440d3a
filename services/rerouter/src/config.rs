//! Rerouter configuration.
//!
//! Routes come from a TOML file; proxy tunables come from the environment.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::proxy::ProxyOptions;

/// Rerouter configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the TOML routes file.
    pub routes_file: PathBuf,

    /// Liveness sweep period.
    pub sweep_interval: Duration,

    /// Bound on one liveness probe.
    pub probe_timeout: Duration,

    /// Bound on the outbound connect per accepted client.
    pub connect_timeout: Duration,

    /// Per-direction read chunk size in bytes.
    pub buffer_size: usize,

    /// Idle time before TCP keepalive probes start.
    pub keepalive_time: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let routes_file = var("REROUTER_ROUTES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("rerouter.toml"));

        let sweep_interval_ms: u64 = var("REROUTER_SWEEP_INTERVAL_MS")
            .map(|v| v.parse())
            .transpose()
            .context("REROUTER_SWEEP_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(500);
        let sweep_interval = Duration::from_millis(sweep_interval_ms.max(50));

        let probe_timeout_ms: u64 = var("REROUTER_PROBE_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("REROUTER_PROBE_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(250);
        let probe_timeout = Duration::from_millis(probe_timeout_ms.max(10));

        let connect_timeout_ms: u64 = var("REROUTER_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("REROUTER_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(100));

        let buffer_size: usize = var("REROUTER_BUFFER_SIZE")
            .map(|v| v.parse())
            .transpose()
            .context("REROUTER_BUFFER_SIZE must be an integer (bytes).")?
            .unwrap_or(8192)
            .clamp(1024, 1024 * 1024);

        let keepalive_secs: u64 = var("REROUTER_KEEPALIVE_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("REROUTER_KEEPALIVE_SECS must be an integer (seconds).")?
            .unwrap_or(15);
        let keepalive_time = Duration::from_secs(keepalive_secs.max(1));

        let log_level = var("REROUTER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            routes_file,
            sweep_interval,
            probe_timeout,
            connect_timeout,
            buffer_size,
            keepalive_time,
            log_level,
        })
    }

    /// Proxy tunables derived from this configuration.
    pub fn proxy_options(&self) -> ProxyOptions {
        ProxyOptions {
            sweep_interval: self.sweep_interval,
            probe_timeout: self.probe_timeout,
            connect_timeout: self.connect_timeout,
            buffer_size: self.buffer_size,
            keepalive_time: self.keepalive_time,
        }
    }
}
