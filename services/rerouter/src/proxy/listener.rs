//! Route listeners and connection acceptance.
//!
//! One listening socket per route. Each accepted client is handled on its own
//! task: connect to the route target, then hand both connections to a
//! [`Session`]. Failures stay local to the route or connection that hit them:
//!
//! - A bind failure skips that route; other routes still start
//! - A connect failure drops the accepted client; the accept loop continues

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::controller::ProxyOptions;
use super::error::ProxyError;
use super::registry::SessionRegistry;
use super::route::{Route, RouteTable};
use super::session::{Direction, Session, SessionContext};

/// Pause after an accept error before accepting again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Counters for one route listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Client connections accepted.
    pub connections_accepted: AtomicU64,
    /// Accepted clients dropped because the target connect failed.
    pub connect_failed: AtomicU64,
    /// Sessions established.
    pub sessions_opened: AtomicU64,
    /// Bytes forwarded client -> target.
    pub bytes_to_target: AtomicU64,
    /// Bytes forwarded target -> client.
    pub bytes_from_target: AtomicU64,
}

impl ListenerStats {
    pub fn record_bytes(&self, direction: Direction, bytes: usize) {
        let counter = match direction {
            Direction::ClientToTarget => &self.bytes_to_target,
            Direction::TargetToClient => &self.bytes_from_target,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connect_failed: self.connect_failed.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            bytes_to_target: self.bytes_to_target.load(Ordering::Relaxed),
            bytes_from_target: self.bytes_from_target.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStatsSnapshot {
    pub connections_accepted: u64,
    pub connect_failed: u64,
    pub sessions_opened: u64,
    pub bytes_to_target: u64,
    pub bytes_from_target: u64,
}

/// Per-route outcome of [`ListenerManager::start_all`].
#[derive(Debug, Default)]
pub struct StartReport {
    /// Route name and bound address or bind error, in route order.
    pub results: Vec<(String, Result<SocketAddr, ProxyError>)>,
}

impl StartReport {
    /// Number of routes with a running listener.
    pub fn bound(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    /// Routes that failed to start.
    pub fn failed(&self) -> impl Iterator<Item = (&str, &ProxyError)> {
        self.results
            .iter()
            .filter_map(|(name, r)| r.as_ref().err().map(|e| (name.as_str(), e)))
    }
}

struct ListenerEntry {
    local_addr: SocketAddr,
    stats: Arc<ListenerStats>,
    handle: JoinHandle<()>,
}

/// Owns the listening socket of every started route.
pub struct ListenerManager {
    listeners: RwLock<HashMap<String, ListenerEntry>>,
    registry: Arc<SessionRegistry>,
    connect_timeout: Duration,
    buffer_size: usize,
    keepalive_time: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl ListenerManager {
    pub fn new(registry: Arc<SessionRegistry>, options: &ProxyOptions) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            listeners: RwLock::new(HashMap::new()),
            registry,
            connect_timeout: options.connect_timeout,
            buffer_size: options.buffer_size,
            keepalive_time: options.keepalive_time,
            shutdown_tx,
        }
    }

    /// Start a listener for every route, in table order.
    ///
    /// Bind failures are logged and reported; they never abort the rest.
    pub async fn start_all(&self, table: &RouteTable) -> StartReport {
        let mut report = StartReport::default();

        for route in table.iter() {
            let result = self.start_route(Arc::clone(route)).await;
            report.results.push((route.name.clone(), result));
        }

        info!(
            route_count = table.len(),
            bound = report.bound(),
            "Listeners started"
        );
        report
    }

    /// Bind one route and spawn its accept loop.
    ///
    /// Fails with [`ProxyError::Stopped`] once [`stop_all`](Self::stop_all)
    /// has run.
    pub async fn start_route(&self, route: Arc<Route>) -> Result<SocketAddr, ProxyError> {
        if *self.shutdown_tx.borrow() {
            return Err(ProxyError::Stopped {
                route: route.name.clone(),
            });
        }

        let bind_addr = route.listen_endpoint();

        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let err = ProxyError::Bind {
                    route: route.name.clone(),
                    addr: bind_addr,
                    source,
                };
                error!(route = %route.name, error = %err, "Failed to bind listener");
                return Err(err);
            }
        };

        let local_addr = listener.local_addr().map_err(|source| ProxyError::Bind {
            route: route.name.clone(),
            addr: bind_addr,
            source,
        })?;

        let stats = Arc::new(ListenerStats::default());
        let ctx = SessionContext {
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&stats),
            connect_timeout: self.connect_timeout,
            buffer_size: self.buffer_size,
            keepalive_time: self.keepalive_time,
        };

        info!(
            route = %route.name,
            bind_addr = %local_addr,
            target = %route.target(),
            "Listener bound"
        );

        let span = tracing::info_span!("listener", route = %route.name);
        let name = route.name.clone();
        let handle = tokio::spawn(
            accept_loop(listener, route, ctx, self.shutdown_tx.subscribe()).instrument(span),
        );

        let previous = self.listeners.write().await.insert(
            name,
            ListenerEntry {
                local_addr,
                stats,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }

        Ok(local_addr)
    }

    /// Close every listener, then every active session. Idempotent.
    ///
    /// The manager cannot start routes afterwards.
    pub async fn stop_all(&self) {
        self.shutdown_tx.send_replace(true);

        let entries: Vec<_> = self.listeners.write().await.drain().collect();
        for (name, entry) in entries {
            if let Err(e) = entry.handle.await {
                if !e.is_cancelled() {
                    warn!(route = %name, error = %e, "Listener task failed");
                }
            }
            debug!(route = %name, bind_addr = %entry.local_addr, "Listener closed");
        }

        self.registry.close_all().await;
    }

    /// Bound address of a running route listener.
    pub async fn local_addr(&self, route_name: &str) -> Option<SocketAddr> {
        self.listeners
            .read()
            .await
            .get(route_name)
            .map(|entry| entry.local_addr)
    }

    /// Counters of a running route listener.
    pub async fn stats(&self, route_name: &str) -> Option<Arc<ListenerStats>> {
        self.listeners
            .read()
            .await
            .get(route_name)
            .map(|entry| Arc::clone(&entry.stats))
    }

    /// Number of running listeners.
    pub async fn len(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.listeners.read().await.is_empty()
    }
}

async fn accept_loop(
    listener: TcpListener,
    route: Arc<Route>,
    ctx: SessionContext,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                ctx.stats
                    .connections_accepted
                    .fetch_add(1, Ordering::Relaxed);

                let route = Arc::clone(&route);
                let ctx = ctx.clone();
                tokio::spawn(
                    async move {
                        match Session::begin(route, stream, peer_addr, &ctx).await {
                            Ok(Some(session)) => {
                                ctx.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
                                debug!(session_id = session.id(), "Session established");
                            }
                            Ok(None) => {
                                debug!("Shutting down, discarded new session");
                            }
                            Err(e) => {
                                ctx.stats.connect_failed.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    error = %e,
                                    reason = e.reason_code(),
                                    "Dropping client connection"
                                );
                            }
                        }
                    }
                    .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                );
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                // Brief sleep to avoid tight loop on persistent errors
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    info!(route = %route.name, "Listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::observer::NoopObserver;
    use crate::proxy::route::{RouteDescriptor, SystemResolver};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn manager() -> (ListenerManager, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new(Arc::new(NoopObserver)));
        let manager = ListenerManager::new(Arc::clone(&registry), &ProxyOptions::default());
        (manager, registry)
    }

    async fn echo_target() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = ListenerStats::default();
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        stats.record_bytes(Direction::ClientToTarget, 10);
        stats.record_bytes(Direction::TargetToClient, 4);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_accepted, 1);
        assert_eq!(snapshot.bytes_to_target, 10);
        assert_eq!(snapshot.bytes_from_target, 4);
    }

    #[tokio::test]
    async fn test_start_report_isolates_bind_failure() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let occupied_port = occupied.local_addr().unwrap().port();
        let target = echo_target().await;

        let descriptors = vec![
            RouteDescriptor::new(occupied_port)
                .with_name("taken")
                .with_listen_ip("127.0.0.1")
                .with_target("127.0.0.1", target.port()),
            RouteDescriptor::new(0)
                .with_name("free")
                .with_listen_ip("127.0.0.1")
                .with_target("127.0.0.1", target.port()),
        ];
        let table = RouteTable::load(&descriptors, &SystemResolver).await.unwrap();

        let (manager, _registry) = manager();
        let report = manager.start_all(&table).await;

        assert_eq!(report.bound(), 1);
        let failed: Vec<_> = report.failed().map(|(name, e)| (name, e.reason_code())).collect();
        assert_eq!(failed, vec![("taken", "bind_error")]);
        assert!(manager.local_addr("taken").await.is_none());

        let addr = manager.local_addr("free").await.unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_all_closes_listeners_and_sessions() {
        let target = echo_target().await;
        let descriptors = vec![RouteDescriptor::new(0)
            .with_name("echo")
            .with_listen_ip("127.0.0.1")
            .with_target("127.0.0.1", target.port())];
        let table = RouteTable::load(&descriptors, &SystemResolver).await.unwrap();

        let (manager, registry) = manager();
        manager.start_all(&table).await;
        let addr = manager.local_addr("echo").await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(registry.len().await, 1);

        manager.stop_all().await;
        manager.stop_all().await;

        assert!(manager.is_empty().await);
        assert!(registry.is_empty().await);
        assert!(TcpStream::connect(addr).await.is_err());

        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_start_route_after_stop_all_is_rejected() {
        let target = echo_target().await;
        let descriptors = vec![RouteDescriptor::new(0)
            .with_name("late")
            .with_listen_ip("127.0.0.1")
            .with_target("127.0.0.1", target.port())];
        let table = RouteTable::load(&descriptors, &SystemResolver).await.unwrap();

        let (manager, _registry) = manager();
        manager.stop_all().await;

        let route = Arc::clone(table.get("late").unwrap());
        let err = manager.start_route(route).await.unwrap_err();

        assert_eq!(err.reason_code(), "stopped");
        assert!(manager.is_empty().await);
        assert!(manager.local_addr("late").await.is_none());
    }

    #[tokio::test]
    async fn test_session_rejected_by_registry_is_not_counted() {
        let target = echo_target().await;
        let descriptors = vec![RouteDescriptor::new(0)
            .with_name("draining")
            .with_listen_ip("127.0.0.1")
            .with_target("127.0.0.1", target.port())];
        let table = RouteTable::load(&descriptors, &SystemResolver).await.unwrap();

        let (manager, registry) = manager();
        manager.start_all(&table).await;
        registry.close_all().await;

        let addr = manager.local_addr("draining").await.unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = manager.stats("draining").await.unwrap().snapshot();
        assert_eq!(stats.connections_accepted, 1);
        assert_eq!(stats.sessions_opened, 0);
        assert_eq!(stats.connect_failed, 0);

        manager.stop_all().await;
    }
}
