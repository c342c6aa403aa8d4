//! Connection handles and the in-memory subscriber index.
//!
//! The index is the per-tenant routing table:
//! `sessionName → topic → connections` (insertion order preserved, which is
//! also the delivery order) and `sessionName → userId → connection` for
//! offline detection. All mutations for one session serialize behind that
//! session's mutex; fan-out readers take a cloned snapshot and iterate with
//! the lock released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::debug;

use crate::core::protocol::{self, ServerFrame};
use crate::metrics;

/// Cheap, cloneable handle to a live client connection.
///
/// Sends go through a bounded outbound queue drained by the connection's
/// writer task; a full queue drops the frame (counted, logged) rather than
/// blocking one subscriber on another.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    id: u64,
    outbound: mpsc::Sender<Bytes>,
    authenticated: AtomicBool,
    closed: AtomicBool,
    shutdown: Notify,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionHandle {
    pub fn new(id: u64, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                id,
                outbound,
                authenticated: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_authenticated(&self, value: bool) {
        self.inner.authenticated.store(value, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Marks the connection closing and wakes its read loop. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.shutdown.notify_waiters();
        }
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called.
    pub async fn closed_signal(&self) {
        let notified = self.inner.shutdown.notified();
        tokio::pin!(notified);
        // Register interest before the flag check, so a shutdown landing
        // in between cannot be missed.
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Queues a text frame. Returns `true` when the frame was accepted by
    /// the outbound queue.
    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        self.send_wire(protocol::server_frame_to_wire(frame))
    }

    /// Queues a pre-encoded wire frame (shared fan-out encoding or binary
    /// chunk relay).
    pub fn send_wire(&self, wire: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.inner.outbound.try_send(wire) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::inc_dropped_sub_queue_full(1);
                debug!(conn = self.inner.id, "outbound queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Default)]
struct SessionSubs {
    /// Subscription lists in insertion order.
    topics: HashMap<String, Vec<ConnectionHandle>>,
    /// Live user bindings.
    users: HashMap<String, ConnectionHandle>,
    /// Every connection bound to the session, subscribed or not.
    connections: Vec<ConnectionHandle>,
}

/// In-memory per-session subscriber index.
#[derive(Default)]
pub struct SubscriberIndex {
    sessions: DashMap<String, Arc<Mutex<SessionSubs>>>,
}

impl SubscriberIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self, session: &str) -> Arc<Mutex<SessionSubs>> {
        self.sessions
            .entry(session.to_string())
            .or_default()
            .clone()
    }

    /// Binds an authenticated connection to its tenant.
    pub fn register_connection(&self, session: &str, conn: &ConnectionHandle) {
        let subs = self.session(session);
        let mut subs = subs.lock();
        if !subs.connections.iter().any(|c| c.id() == conn.id()) {
            subs.connections.push(conn.clone());
        }
    }

    /// Removes a connection from the tenant wholesale: connection list,
    /// every topic, and any user binding it holds. Idempotent.
    pub fn unregister_connection(&self, session: &str, conn_id: u64) {
        let Some(subs) = self.sessions.get(session).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let mut subs = subs.lock();
        subs.connections.retain(|c| c.id() != conn_id);
        for conns in subs.topics.values_mut() {
            conns.retain(|c| c.id() != conn_id);
        }
        subs.topics.retain(|_, conns| !conns.is_empty());
        subs.users.retain(|_, c| c.id() != conn_id);
    }

    pub fn subscribe(&self, session: &str, topic: &str, conn: &ConnectionHandle) {
        let subs = self.session(session);
        let mut subs = subs.lock();
        let conns = subs.topics.entry(topic.to_string()).or_default();
        if !conns.iter().any(|c| c.id() == conn.id()) {
            conns.push(conn.clone());
        }
    }

    pub fn unsubscribe(&self, session: &str, topic: &str, conn_id: u64) {
        let Some(subs) = self.sessions.get(session).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let mut subs = subs.lock();
        if let Some(conns) = subs.topics.get_mut(topic) {
            conns.retain(|c| c.id() != conn_id);
            if conns.is_empty() {
                subs.topics.remove(topic);
            }
        }
    }

    pub fn register_user(&self, session: &str, user_id: &str, conn: &ConnectionHandle) {
        let subs = self.session(session);
        subs.lock().users.insert(user_id.to_string(), conn.clone());
    }

    pub fn unregister_user(&self, session: &str, user_id: &str) {
        if let Some(subs) = self.sessions.get(session).map(|s| Arc::clone(s.value())) {
            subs.lock().users.remove(user_id);
        }
    }

    /// Stable snapshot of the current subscribers of `(session, topic)`,
    /// in insertion order. Iterate after this call returns; the lock is
    /// already released.
    pub fn subscribers_of(&self, session: &str, topic: &str) -> Vec<ConnectionHandle> {
        self.sessions
            .get(session)
            .map(|subs| {
                subs.lock()
                    .topics
                    .get(topic)
                    .cloned()
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Whether `user_id` currently has a live bound connection.
    pub fn user_online(&self, session: &str, user_id: &str) -> bool {
        self.sessions
            .get(session)
            .map(|subs| {
                subs.lock()
                    .users
                    .get(user_id)
                    .is_some_and(|c| !c.is_closed())
            })
            .unwrap_or(false)
    }

    /// Tears down a tenant's routing state and returns every connection
    /// that was bound to it, for the caller to close.
    pub fn drop_session_state(&self, session: &str) -> Vec<ConnectionHandle> {
        match self.sessions.remove(session) {
            Some((_, subs)) => {
                let mut subs = subs.lock();
                subs.topics.clear();
                subs.users.clear();
                std::mem::take(&mut subs.connections)
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: u64) -> (ConnectionHandle, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(id, tx), rx)
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let index = SubscriberIndex::new();
        let (c1, _rx1) = handle(1);
        let (c2, _rx2) = handle(2);
        let (c3, _rx3) = handle(3);
        index.subscribe("s", "t", &c2);
        index.subscribe("s", "t", &c1);
        index.subscribe("s", "t", &c3);
        index.subscribe("s", "t", &c1); // duplicate subscribe is a no-op

        let ids: Vec<u64> = index
            .subscribers_of("s", "t")
            .iter()
            .map(|c| c.id())
            .collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn sessions_are_isolated() {
        let index = SubscriberIndex::new();
        let (c1, _rx1) = handle(1);
        index.subscribe("a", "shared", &c1);
        assert!(index.subscribers_of("b", "shared").is_empty());
    }

    #[test]
    fn unregister_clears_everything() {
        let index = SubscriberIndex::new();
        let (c1, _rx1) = handle(1);
        index.register_connection("s", &c1);
        index.subscribe("s", "t1", &c1);
        index.subscribe("s", "t2", &c1);
        index.register_user("s", "u1", &c1);

        index.unregister_connection("s", 1);
        assert!(index.subscribers_of("s", "t1").is_empty());
        assert!(index.subscribers_of("s", "t2").is_empty());
        assert!(!index.user_online("s", "u1"));
        assert!(index.drop_session_state("s").is_empty());
    }

    #[test]
    fn drop_session_returns_bound_connections() {
        let index = SubscriberIndex::new();
        let (c1, _rx1) = handle(1);
        let (c2, _rx2) = handle(2);
        index.register_connection("s", &c1);
        index.register_connection("s", &c2);
        index.subscribe("s", "t", &c1);

        let dropped = index.drop_session_state("s");
        assert_eq!(dropped.len(), 2);
        assert!(index.subscribers_of("s", "t").is_empty());
    }

    #[tokio::test]
    async fn full_outbound_queue_drops_frame() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ConnectionHandle::new(9, tx);
        assert!(conn.send_frame(&ServerFrame::error("one")));
        // second frame exceeds capacity and is dropped, not blocked on
        assert!(!conn.send_frame(&ServerFrame::error("two")));
    }
}
