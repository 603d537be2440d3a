//! Active session registry and liveness sweep.
//!
//! Sessions are added by the listener that created them and removed only by
//! their own close notification, so a session leaves the registry exactly
//! once no matter which component closed it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::observer::SessionObserver;
use super::session::{Session, SessionId};

/// Tracks live sessions and reaps the ones that fail liveness checks.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    observer: Arc<dyn SessionObserver>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl SessionRegistry {
    pub fn new(observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            observer,
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn observer(&self) -> Arc<dyn SessionObserver> {
        Arc::clone(&self.observer)
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a session.
    ///
    /// Returns false once [`close_all`](Self::close_all) has run; the caller
    /// owns closing the rejected session.
    pub async fn add(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        if self.shut_down.load(Ordering::SeqCst) {
            return false;
        }
        sessions.insert(session.id(), session);
        true
    }

    /// Remove a session by id.
    pub async fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(&id)
    }

    /// Close notification from a session. Removes it, then tells the observer.
    pub(crate) async fn session_closed(&self, session: &Session) {
        if self.remove(session.id()).await.is_some() {
            debug!(session_id = session.id(), "Session removed from registry");
        }
        self.observer
            .session_closed(session.route(), session.client_addr());
    }

    pub async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Current sessions, in no particular order.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Refuse new sessions and close every active one.
    pub async fn close_all(&self) {
        self.shut_down.store(true, Ordering::SeqCst);

        let sessions = self.snapshot().await;
        if !sessions.is_empty() {
            info!(session_count = sessions.len(), "Closing active sessions");
        }
        for session in sessions {
            session.close().await;
        }
    }

    /// Probe every active session concurrently and close those that fail.
    ///
    /// Returns the number of sessions closed.
    pub async fn sweep_once(&self, probe_timeout: Duration) -> usize {
        let sessions = self.snapshot().await;

        let checks = sessions.into_iter().map(|session| async move {
            match session.check_liveness(probe_timeout).await {
                Ok(()) => false,
                Err(e) if session.is_closed() => {
                    debug!(session_id = session.id(), error = %e, "Session already closed");
                    false
                }
                Err(e) => {
                    info!(
                        session_id = session.id(),
                        route = %session.route().name,
                        client = %session.client_addr(),
                        error = %e,
                        reason = e.reason_code(),
                        "Closing unresponsive session"
                    );
                    session.close().await;
                    true
                }
            }
        });

        join_all(checks).await.into_iter().filter(|&reaped| reaped).count()
    }

    /// Run the liveness sweep every `interval` until shutdown.
    pub async fn run_sweep(
        self: Arc<Self>,
        interval: Duration,
        probe_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_ms = interval.as_millis() as u64,
            probe_timeout_ms = probe_timeout.as_millis() as u64,
            "Starting liveness sweep"
        );

        let mut interval_timer = tokio::time::interval(interval);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    let reaped = self.sweep_once(probe_timeout).await;
                    if reaped > 0 {
                        debug!(reaped, "Liveness sweep closed sessions");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Liveness sweep shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::listener::ListenerStats;
    use crate::proxy::observer::SessionEvent;
    use crate::proxy::route::Route;
    use crate::proxy::session::SessionContext;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, connected.unwrap())
    }

    fn context() -> (SessionContext, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            registry: Arc::new(SessionRegistry::new(Arc::new(tx))),
            stats: Arc::new(ListenerStats::default()),
            connect_timeout: Duration::from_secs(1),
            buffer_size: 4096,
            keepalive_time: Duration::from_secs(15),
        };
        (ctx, rx)
    }

    fn route() -> Arc<Route> {
        Arc::new(Route {
            name: "sweep".to_string(),
            listen_addr: "127.0.0.1".parse().unwrap(),
            listen_port: 0,
            target_host: "127.0.0.1".to_string(),
            target_port: 9,
        })
    }

    /// Registered, running session plus the remote ends of its connections.
    async fn session(ctx: &SessionContext) -> (Arc<Session>, TcpStream, TcpStream) {
        let (proxy_client, client) = socket_pair().await;
        let (target, proxy_target) = socket_pair().await;
        let client_addr = client.local_addr().unwrap();
        let session = Session::new(route(), proxy_client, client_addr, proxy_target, ctx);
        assert!(ctx.registry.add(Arc::clone(&session)).await);
        session.start();
        (session, client, target)
    }

    #[tokio::test]
    async fn test_add_and_remove_via_close() {
        let (ctx, mut events) = context();
        let (first, _c1, _t1) = session(&ctx).await;
        let (second, _c2, _t2) = session(&ctx).await;

        assert_ne!(first.id(), second.id());
        assert_eq!(ctx.registry.len().await, 2);

        first.close().await;
        assert_eq!(ctx.registry.len().await, 1);
        assert!(ctx.registry.get(second.id()).await.is_some());

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            SessionEvent::Closed {
                route: "sweep".to_string(),
                client_addr: first.client_addr(),
            }
        );
    }

    #[tokio::test]
    async fn test_close_all_rejects_late_sessions() {
        let (ctx, _events) = context();
        let (active, _c, _t) = session(&ctx).await;

        ctx.registry.close_all().await;
        assert!(active.is_closed());
        assert!(ctx.registry.is_empty().await);

        let (proxy_client, client) = socket_pair().await;
        let (_target, proxy_target) = socket_pair().await;
        let late = Session::new(
            route(),
            proxy_client,
            client.local_addr().unwrap(),
            proxy_target,
            &ctx,
        );
        assert!(!ctx.registry.add(late).await);
        assert!(ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep_keeps_idle_sessions() {
        let (ctx, _events) = context();
        let (idle, _c, _t) = session(&ctx).await;

        let reaped = ctx.registry.sweep_once(Duration::from_millis(100)).await;

        assert_eq!(reaped, 0);
        assert!(!idle.is_closed());
    }

    #[tokio::test]
    async fn test_sweep_reaps_stalled_target() {
        let (ctx, mut events) = context();
        // The target end is held but never read.
        let (stalled, mut client, _target) = session(&ctx).await;

        tokio::spawn(async move {
            let chunk = vec![0x5au8; 64 * 1024];
            while client.write_all(&chunk).await.is_ok() {}
        });

        let registry = Arc::clone(&ctx.registry);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweep = tokio::spawn(registry.run_sweep(
            Duration::from_millis(50),
            Duration::from_millis(100),
            shutdown_rx,
        ));

        timeout(Duration::from_secs(20), async {
            while let Some(event) = events.recv().await {
                if matches!(event, SessionEvent::Closed { .. }) {
                    return;
                }
            }
        })
        .await
        .expect("stalled session was not reaped");
        assert!(stalled.is_closed());
        assert!(ctx.registry.is_empty().await);

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(1), sweep).await.unwrap().unwrap();
    }
}
