//! Start/stop orchestration for the proxy core.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::error::{ProxyError, Result};
use super::listener::{ListenerManager, ListenerStatsSnapshot, StartReport};
use super::observer::{NoopObserver, SessionObserver};
use super::registry::SessionRegistry;
use super::route::{HostResolver, RouteDescriptor, RouteTable, SystemResolver};

/// Default liveness sweep period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Default bound on a single liveness probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Default connect timeout for target connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default per-direction read buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default idle time before TCP keepalive probes start.
pub const DEFAULT_KEEPALIVE_TIME: Duration = Duration::from_secs(15);

/// Tunables for the proxy core.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// How often active sessions are probed.
    pub sweep_interval: Duration,
    /// How long a connection may take to report writable before it is
    /// considered dead.
    pub probe_timeout: Duration,
    /// Bound on the outbound connect for each accepted client.
    pub connect_timeout: Duration,
    /// Largest chunk a forwarding loop reads at once.
    pub buffer_size: usize,
    /// Idle time before TCP keepalive probes start on session connections.
    /// Probes are then sent every third of this, at least once a second.
    pub keepalive_time: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            keepalive_time: DEFAULT_KEEPALIVE_TIME,
        }
    }
}

/// State of one start..stop cycle.
struct Running {
    listeners: ListenerManager,
    registry: Arc<SessionRegistry>,
    sweep_shutdown: watch::Sender<bool>,
    sweep: JoinHandle<()>,
}

/// Owns the route table, listeners, sessions and sweep for a set of routes.
pub struct ProxyController {
    descriptors: Mutex<Vec<RouteDescriptor>>,
    routes: ArcSwap<RouteTable>,
    options: ProxyOptions,
    observer: Arc<dyn SessionObserver>,
    resolver: Arc<dyn HostResolver>,
    running: Mutex<Option<Running>>,
}

impl ProxyController {
    /// Controller with no observer and the system resolver.
    pub fn new(descriptors: Vec<RouteDescriptor>, options: ProxyOptions) -> Self {
        Self::with_observer(descriptors, options, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        descriptors: Vec<RouteDescriptor>,
        options: ProxyOptions,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            descriptors: Mutex::new(descriptors),
            routes: ArcSwap::from_pointee(RouteTable::new()),
            options,
            observer,
            resolver: Arc::new(SystemResolver),
            running: Mutex::new(None),
        }
    }

    /// Replace the host resolver used when loading routes.
    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Load routes, open listeners and start the liveness sweep.
    ///
    /// A `ConfigError` aborts before any listener is opened. Bind failures
    /// are reported per route in the returned [`StartReport`].
    pub async fn start(&self) -> Result<StartReport> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }

        let table = {
            let descriptors = self.descriptors.lock().await;
            RouteTable::load(&descriptors, self.resolver.as_ref()).await?
        };
        let table = Arc::new(table);
        self.routes.store(Arc::clone(&table));

        let registry = Arc::new(SessionRegistry::new(Arc::clone(&self.observer)));
        let listeners = ListenerManager::new(Arc::clone(&registry), &self.options);
        let report = listeners.start_all(&table).await;

        let (sweep_shutdown, sweep_rx) = watch::channel(false);
        let sweep = tokio::spawn(Arc::clone(&registry).run_sweep(
            self.options.sweep_interval,
            self.options.probe_timeout,
            sweep_rx,
        ));

        info!(
            route_count = table.len(),
            listening = report.bound(),
            "Proxy started"
        );

        *running = Some(Running {
            listeners,
            registry,
            sweep_shutdown,
            sweep,
        });

        Ok(report)
    }

    /// Close all listeners, then all sessions, then stop the sweep.
    ///
    /// Does nothing if the proxy is not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.listeners.stop_all().await;

        running.sweep_shutdown.send_replace(true);
        if let Err(e) = running.sweep.await {
            warn!(error = %e, "Liveness sweep task failed");
        }

        info!("Proxy stopped");
    }

    /// Swap in a new set of routes.
    ///
    /// The new descriptors are validated first; if they are rejected the
    /// running configuration is left untouched. Otherwise every listener and
    /// session is closed and the proxy restarts with the new table.
    pub async fn reload(&self, descriptors: Vec<RouteDescriptor>) -> Result<StartReport> {
        RouteTable::load(&descriptors, self.resolver.as_ref()).await?;

        let was_running = self.is_running().await;
        self.stop().await;
        *self.descriptors.lock().await = descriptors;

        info!(was_running, "Routes reloaded");
        self.start().await
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Route table of the current (or last) run.
    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.load_full()
    }

    /// Bound address of a running route listener.
    pub async fn listen_addr(&self, route_name: &str) -> Option<SocketAddr> {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(running) => running.listeners.local_addr(route_name).await,
            None => None,
        }
    }

    /// Number of active sessions.
    pub async fn session_count(&self) -> usize {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(running) => running.registry.len().await,
            None => 0,
        }
    }

    /// Counters of a running route listener.
    pub async fn listener_stats(&self, route_name: &str) -> Option<ListenerStatsSnapshot> {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(running) => running
                .listeners
                .stats(route_name)
                .await
                .map(|stats| stats.snapshot()),
            None => None,
        }
    }
}
