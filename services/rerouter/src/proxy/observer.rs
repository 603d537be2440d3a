//! Session lifecycle observation points.
//!
//! Observers are injected into the [`SessionRegistry`](super::SessionRegistry)
//! at construction. Every hook has a no-op default, so implementations only
//! override what they need. Hooks are called inline on proxy tasks and must
//! not block.

use std::net::SocketAddr;

use tokio::sync::mpsc;

use super::route::Route;
use super::session::{Direction, Session, SessionId};

/// Receives session lifecycle and traffic notifications.
pub trait SessionObserver: Send + Sync {
    /// A session was established and is about to start forwarding.
    fn session_started(&self, _route: &Route, _client_addr: SocketAddr) {}

    /// A session closed. Fires exactly once per started session.
    fn session_closed(&self, _route: &Route, _client_addr: SocketAddr) {}

    /// A chunk was written to the destination side of `direction`.
    fn bytes_forwarded(&self, _session: &Session, _direction: Direction, _payload: &[u8]) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Owned form of an observer notification, for channel-based observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started {
        route: String,
        client_addr: SocketAddr,
    },
    Closed {
        route: String,
        client_addr: SocketAddr,
    },
    BytesForwarded {
        session_id: SessionId,
        direction: Direction,
        payload: Vec<u8>,
    },
}

/// Forwards notifications into a channel. Send failures (receiver dropped)
/// are ignored.
impl SessionObserver for mpsc::UnboundedSender<SessionEvent> {
    fn session_started(&self, route: &Route, client_addr: SocketAddr) {
        let _ = self.send(SessionEvent::Started {
            route: route.name.clone(),
            client_addr,
        });
    }

    fn session_closed(&self, route: &Route, client_addr: SocketAddr) {
        let _ = self.send(SessionEvent::Closed {
            route: route.name.clone(),
            client_addr,
        });
    }

    fn bytes_forwarded(&self, session: &Session, direction: Direction, payload: &[u8]) {
        let _ = self.send(SessionEvent::BytesForwarded {
            session_id: session.id(),
            direction,
            payload: payload.to_vec(),
        });
    }
}
