//! Route-driven TCP forwarding.
//!
//! This module provides:
//! - Route descriptor resolution and validation
//! - One listener per route
//! - Bidirectional byte relay per accepted client
//! - Session tracking with a periodic liveness sweep
//! - Start/stop/reload orchestration
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Session -> Target
//!                          |
//!                   SessionRegistry <- liveness sweep
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use tcp_rerouter::{ProxyController, ProxyOptions, RouteDescriptor};
//!
//! let routes = vec![RouteDescriptor::new(8080).with_target("10.0.0.5", 80)];
//! let controller = ProxyController::new(routes, ProxyOptions::default());
//! controller.start().await?;
//! // ...
//! controller.stop().await;
//! ```

mod controller;
mod error;
mod listener;
mod observer;
mod registry;
mod route;
mod session;

pub use controller::{
    ProxyController, ProxyOptions, DEFAULT_BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_KEEPALIVE_TIME, DEFAULT_PROBE_TIMEOUT, DEFAULT_SWEEP_INTERVAL,
};
pub use error::{ConfigError, ProxyError, Result};
pub use listener::{ListenerManager, ListenerStats, ListenerStatsSnapshot, StartReport};
pub use observer::{NoopObserver, SessionEvent, SessionObserver};
pub use registry::SessionRegistry;
pub use route::{
    default_listen_addr, HostResolver, PortValue, Route, RouteDescriptor, RouteTable,
    SystemResolver,
};
pub use session::{Direction, Session, SessionContext, SessionId};
