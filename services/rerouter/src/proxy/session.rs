//! Forwarding sessions.
//!
//! A session owns one accepted client connection and one outbound target
//! connection, and runs one forwarding loop per direction. Each loop reads a
//! chunk from its source and writes exactly that chunk to its destination
//! before reading again, so a slow destination only stalls its own direction.
//!
//! `Active -> Closed` is the only transition. [`Session::close`] is the single
//! path to `Closed`; whichever caller gets there first (either loop, the
//! liveness sweep, or shutdown) wins and the rest are no-ops.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace, warn, Instrument};

use super::error::ProxyError;
use super::listener::ListenerStats;
use super::observer::SessionObserver;
use super::registry::SessionRegistry;
use super::route::Route;

/// Registry-assigned session identifier.
pub type SessionId = u64;

/// Direction of a forwarding loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToTarget => f.write_str("client->target"),
            Direction::TargetToClient => f.write_str("target->client"),
        }
    }
}

/// Per-listener settings shared by every session the listener creates.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<SessionRegistry>,
    pub stats: Arc<ListenerStats>,
    pub connect_timeout: Duration,
    pub buffer_size: usize,
    /// Idle time before TCP keepalive probes start on both connections.
    pub keepalive_time: Duration,
}

struct Connections {
    client: Arc<TcpStream>,
    target: Arc<TcpStream>,
}

/// One client connection relayed to one target connection.
pub struct Session {
    id: SessionId,
    route: Arc<Route>,
    client_addr: SocketAddr,
    conns: ArcSwapOption<Connections>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    registry: Weak<SessionRegistry>,
    observer: Arc<dyn SessionObserver>,
    stats: Arc<ListenerStats>,
    buffer_size: usize,
}

impl Session {
    /// Connect to the route's target and start forwarding for `client`.
    ///
    /// On connect failure the client connection is dropped and no session
    /// exists. Returns `None` if the registry is already shutting down; the
    /// session is then closed before any forwarding starts.
    pub async fn begin(
        route: Arc<Route>,
        client: TcpStream,
        client_addr: SocketAddr,
        ctx: &SessionContext,
    ) -> Result<Option<Arc<Session>>, ProxyError> {
        let target = connect_target(&route, ctx.connect_timeout).await?;

        let session = Session::new(route, client, client_addr, target, ctx);
        session
            .observer
            .session_started(&session.route, session.client_addr);

        if !ctx.registry.add(Arc::clone(&session)).await {
            debug!(session_id = session.id, "Registry shut down, closing new session");
            session.close().await;
            return Ok(None);
        }

        session.start();
        Ok(Some(session))
    }

    /// Wrap an already connected client/target pair and enable TCP
    /// keepalive on both.
    ///
    /// The session is not registered and does not forward until
    /// [`start`](Self::start) is called.
    pub fn new(
        route: Arc<Route>,
        client: TcpStream,
        client_addr: SocketAddr,
        target: TcpStream,
        ctx: &SessionContext,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);

        for (side, stream) in [("client", &client), ("target", &target)] {
            if let Err(e) = enable_keepalive(stream, ctx.keepalive_time) {
                warn!(route = %route.name, side, error = %e, "Failed to enable TCP keepalive");
            }
        }

        Arc::new(Self {
            id: ctx.registry.next_session_id(),
            route,
            client_addr,
            conns: ArcSwapOption::from_pointee(Connections {
                client: Arc::new(client),
                target: Arc::new(target),
            }),
            closed: AtomicBool::new(false),
            shutdown_tx,
            registry: Arc::downgrade(&ctx.registry),
            observer: ctx.registry.observer(),
            stats: Arc::clone(&ctx.stats),
            buffer_size: ctx.buffer_size.max(1),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn route(&self) -> &Arc<Route> {
        &self.route
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Launch both forwarding loops. Does nothing on a closed session.
    pub fn start(self: &Arc<Self>) {
        let Some(conns) = self.conns.load_full() else {
            return;
        };
        if self.is_closed() {
            return;
        }

        let span = tracing::info_span!(
            "session",
            session_id = self.id,
            route = %self.route.name,
            client = %self.client_addr
        );

        for (direction, source, dest) in [
            (
                Direction::ClientToTarget,
                Arc::clone(&conns.client),
                Arc::clone(&conns.target),
            ),
            (
                Direction::TargetToClient,
                Arc::clone(&conns.target),
                Arc::clone(&conns.client),
            ),
        ] {
            let session = Arc::clone(self);
            let shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(
                forward(session, direction, source, dest, shutdown).instrument(span.clone()),
            );
        }

        debug!(
            session_id = self.id,
            route = %self.route.name,
            client = %self.client_addr,
            "Session started"
        );
    }

    /// Close the session. Idempotent.
    ///
    /// Stops both loops without draining, releases both connections and
    /// fires the close notification once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown_tx.send_replace(true);
        self.conns.store(None);

        debug!(
            session_id = self.id,
            route = %self.route.name,
            client = %self.client_addr,
            "Session closed"
        );

        match self.registry.upgrade() {
            Some(registry) => registry.session_closed(self).await,
            None => self.observer.session_closed(&self.route, self.client_addr),
        }
    }

    /// Probe both connections.
    ///
    /// Each connection must still have a peer, carry no pending socket error,
    /// and become writable within `probe_timeout`. Idle connections pass; a
    /// connection whose peer stopped consuming fails once its send buffer is
    /// full. A peer that vanished while idle is caught by TCP keepalive, which
    /// leaves `ETIMEDOUT` as the pending socket error.
    pub async fn check_liveness(&self, probe_timeout: Duration) -> Result<(), ProxyError> {
        let Some(conns) = self.conns.load_full() else {
            return Err(ProxyError::LivenessTimeout {
                side: "session",
                reason: "session closed".to_string(),
            });
        };

        probe(&conns.client, "client", probe_timeout).await?;
        probe(&conns.target, "target", probe_timeout).await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("route", &self.route.name)
            .field("client_addr", &self.client_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn connect_target(route: &Route, connect_timeout: Duration) -> Result<TcpStream, ProxyError> {
    let target = (route.target_host.as_str(), route.target_port);

    let result = match timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
    };

    result.map_err(|source| ProxyError::Connect {
        route: route.name.clone(),
        target: route.target(),
        source,
    })
}

fn enable_keepalive(stream: &TcpStream, time: Duration) -> io::Result<()> {
    let interval = (time / 3).max(Duration::from_secs(1));
    let keepalive = TcpKeepalive::new().with_time(time).with_interval(interval);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

async fn probe(
    stream: &TcpStream,
    side: &'static str,
    probe_timeout: Duration,
) -> Result<(), ProxyError> {
    let fail = |reason: String| ProxyError::LivenessTimeout { side, reason };

    stream
        .peer_addr()
        .map_err(|e| fail(format!("not connected: {}", e)))?;

    if let Some(err) = stream.take_error().map_err(|e| fail(e.to_string()))? {
        return Err(fail(format!("socket error: {}", err)));
    }

    match timeout(probe_timeout, stream.ready(Interest::WRITABLE)).await {
        Ok(Ok(ready)) if ready.is_write_closed() || ready.is_error() => {
            Err(fail("write side closed".to_string()))
        }
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(fail(e.to_string())),
        Err(_) => Err(fail(format!("not writable within {:?}", probe_timeout))),
    }
}

/// One direction of a session: read a chunk, write it, repeat.
async fn forward(
    session: Arc<Session>,
    direction: Direction,
    source: Arc<TcpStream>,
    dest: Arc<TcpStream>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; session.buffer_size];

    loop {
        if *shutdown.borrow_and_update() {
            return;
        }

        let step = tokio::select! {
            _ = shutdown.changed() => return,
            step = relay_chunk(&source, &dest, &mut buf) => step,
        };

        match step {
            Ok(0) => {
                debug!(%direction, "Source closed");
                break;
            }
            Ok(n) => {
                session.stats.record_bytes(direction, n);
                trace!(
                    %direction,
                    bytes = n,
                    summary = %summarize_chunk(&buf[..n]),
                    "Forwarded chunk"
                );
                session
                    .observer
                    .bytes_forwarded(&session, direction, &buf[..n]);
            }
            Err(e) => {
                let err = ProxyError::Transfer {
                    direction,
                    source: e,
                };
                debug!(error = %err, reason = err.reason_code(), "Forwarding stopped");
                break;
            }
        }
    }

    // Release our handles before closing so the sockets drop promptly.
    drop(source);
    drop(dest);
    session.close().await;
}

/// First line of an HTTP request or status line, otherwise `[data]`.
fn summarize_chunk(chunk: &[u8]) -> String {
    const HTTP_PREFIXES: [&[u8]; 3] = [b"GET", b"POST", b"HTTP"];
    const MAX_SUMMARY: usize = 200;

    if !HTTP_PREFIXES.iter().any(|prefix| chunk.starts_with(prefix)) {
        return "[data]".to_string();
    }

    let line = chunk.split(|&b| b == b'\n').next().unwrap_or_default();
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(&line[..line.len().min(MAX_SUMMARY)]).into_owned()
}

/// Read one chunk from `source` and write all of it to `dest`.
///
/// Returns the chunk length, or 0 when `source` reached end of stream.
async fn relay_chunk(source: &TcpStream, dest: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    let n = loop {
        source.readable().await?;
        match source.try_read(buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    };

    let mut pending = &buf[..n];
    while !pending.is_empty() {
        dest.writable().await?;
        match dest.try_write(pending) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(written) => pending = &pending[written..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(n)
}
