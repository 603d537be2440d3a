//! Error types for the proxy core.
//!
//! `ConfigError` is fatal at load time. Every `ProxyError` other than
//! `Config`, `Stopped` and `AlreadyRunning` is scoped to a single route or session and is
//! logged by the task that observed it rather than propagated.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use super::session::Direction;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Invalid or ambiguous route configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A port value was not an integer in range.
    #[error("route {route}: invalid {field} {value:?}")]
    InvalidPort {
        route: String,
        field: &'static str,
        value: String,
    },

    /// A host name could not be resolved.
    #[error("route {route}: cannot resolve host {host}: {source}")]
    Resolve {
        route: String,
        host: String,
        #[source]
        source: io::Error,
    },

    /// No usable local address to listen on.
    #[error("route {route}: no local address available to listen on")]
    NoListenAddress { route: String },

    /// Listen endpoint equals target endpoint.
    #[error("route {route}: listen endpoint {endpoint} is also the target endpoint")]
    SelfRoute { route: String, endpoint: SocketAddr },

    /// Two routes share a name.
    #[error("duplicate route name: {0}")]
    DuplicateName(String),
}

/// Errors raised by the listener, session and controller layers.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Route table rejected.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A route's listener could not bind.
    #[error("route {route}: bind {addr} failed: {source}")]
    Bind {
        route: String,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Outbound connect to a route target failed.
    #[error("route {route}: connect to {target} failed: {source}")]
    Connect {
        route: String,
        target: String,
        #[source]
        source: io::Error,
    },

    /// Read or write failure while forwarding.
    #[error("{direction} transfer failed: {source}")]
    Transfer {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// A connection failed the liveness probe.
    #[error("liveness check failed on {side} connection: {reason}")]
    LivenessTimeout { side: &'static str, reason: String },

    /// A route was started on a listener manager that has been stopped.
    #[error("route {route}: listener manager is stopped")]
    Stopped { route: String },

    /// `start` called on a running controller.
    #[error("proxy is already running")]
    AlreadyRunning,
}

impl ProxyError {
    /// Short machine-readable code for structured logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "config_error",
            ProxyError::Bind { .. } => "bind_error",
            ProxyError::Connect { .. } => "connect_error",
            ProxyError::Transfer { .. } => "transfer_error",
            ProxyError::LivenessTimeout { .. } => "liveness_timeout",
            ProxyError::Stopped { .. } => "stopped",
            ProxyError::AlreadyRunning => "already_running",
        }
    }
}
