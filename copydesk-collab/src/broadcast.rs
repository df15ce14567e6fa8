//! Fan-out of server events to the sessions of one content item.
//!
//! Every session owns an outbound [`Connection`]: a bounded mpsc queue
//! drained by that client's socket task. An event is encoded once and the
//! same `Arc<str>` is pushed into each queue with `try_send`, so a slow
//! reader never blocks the channel lock the broadcast runs under.
//!
//! - queue full: the frame is dropped for that session and counted
//! - queue closed: the session is marked disconnected
//!
//! Delivery always happens while the caller holds the channel's write lock,
//! which gives every session the same event order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::channel::ChannelMap;
use crate::protocol::ServerEvent;
use crate::session::Session;

/// Outbound queue to one client.
#[derive(Debug, Clone)]
pub struct Connection {
    id: Uuid,
    tx: mpsc::Sender<Arc<str>>,
}

impl Connection {
    /// Create a connection and the receiver its socket task drains.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn try_send(&self, frame: Arc<str>) -> Result<(), mpsc::error::TrySendError<Arc<str>>> {
        self.tx.try_send(frame)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Events encoded and fanned out
    pub events: u64,
    /// Frames queued to a session
    pub messages_sent: u64,
    /// Frames dropped because a session's queue was full
    pub messages_dropped: u64,
    /// Sessions found with a closed queue during delivery
    pub disconnects: u64,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    events: AtomicU64,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    disconnects: AtomicU64,
}

pub struct BroadcastHub {
    channels: Arc<ChannelMap>,
    stats: AtomicBroadcastStats,
}

impl BroadcastHub {
    pub fn new(channels: Arc<ChannelMap>) -> Self {
        Self {
            channels,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Deliver `event` to every connected session in `sessions` except
    /// `exclude`. Returns the number of sessions the frame was queued to.
    ///
    /// Callers must hold the owning channel's write lock.
    pub fn deliver(
        &self,
        sessions: &mut HashMap<Uuid, Session>,
        event: &ServerEvent,
        exclude: Option<Uuid>,
    ) -> usize {
        let frame: Arc<str> = match event.encode() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                log::error!("Failed to encode {} event: {e}", event.kind());
                return 0;
            }
        };
        self.stats.events.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        for session in sessions.values_mut() {
            if Some(session.id) == exclude {
                continue;
            }
            if self.push(session, frame.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send an event to a single session.
    pub fn send_to(&self, session: &mut Session, event: &ServerEvent) -> bool {
        match event.encode() {
            Ok(json) => self.push(session, Arc::from(json)),
            Err(e) => {
                log::error!("Failed to encode {} event: {e}", event.kind());
                false
            }
        }
    }

    /// Lock `content_id` and deliver `event` to its sessions.
    ///
    /// Must not be called while already holding that channel's lock.
    pub async fn broadcast_to_content_sessions(
        &self,
        content_id: &str,
        event: &ServerEvent,
        exclude: Option<Uuid>,
    ) -> usize {
        match self.channels.read(content_id).await {
            // Cheap check first: no point taking the write lock for nobody.
            Some(channel) if channel.sessions.is_empty() => 0,
            None => 0,
            Some(channel) => {
                drop(channel);
                let mut channel = self.channels.write(content_id).await;
                self.deliver(&mut channel.sessions, event, exclude)
            }
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events: self.stats.events.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            disconnects: self.stats.disconnects.load(Ordering::Relaxed),
        }
    }

    fn push(&self, session: &mut Session, frame: Arc<str>) -> bool {
        let Some(connection) = session.connection() else {
            return false;
        };
        match connection.try_send(frame) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Outbound queue full for session {} (user {}), dropping frame",
                    session.id,
                    session.user_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                log::info!("Session {} connection closed, marking disconnected", session.id);
                session.detach();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnectionState, Permissions};

    fn connected(user: &str, buffer: usize) -> (Session, mpsc::Receiver<Arc<str>>) {
        let mut session = Session::new("c1", user, Permissions::full(), 4, 0);
        let (conn, rx) = Connection::channel(buffer);
        session.attach(conn);
        (session, rx)
    }

    fn heartbeat() -> ServerEvent {
        ServerEvent::HeartbeatAck { head_sequence: 0 }
    }

    #[tokio::test]
    async fn test_deliver_excludes_sender() {
        let hub = BroadcastHub::new(Arc::new(ChannelMap::new(16)));
        let (alice, mut rx_a) = connected("alice", 8);
        let (bob, mut rx_b) = connected("bob", 8);
        let alice_id = alice.id;

        let mut sessions = HashMap::new();
        sessions.insert(alice.id, alice);
        sessions.insert(bob.id, bob);

        let n = hub.deliver(&mut sessions, &heartbeat(), Some(alice_id));
        assert_eq!(n, 1);
        assert!(rx_a.try_recv().is_err());
        let frame = rx_b.try_recv().unwrap();
        assert!(frame.contains("\"type\":\"heartbeat_ack\""));
        assert!(frame.contains("\"timestamp\""));
    }

    #[tokio::test]
    async fn test_full_queue_drops_frame() {
        let hub = BroadcastHub::new(Arc::new(ChannelMap::new(16)));
        let (bob, _rx) = connected("bob", 1);
        let mut sessions = HashMap::new();
        sessions.insert(bob.id, bob);

        assert_eq!(hub.deliver(&mut sessions, &heartbeat(), None), 1);
        assert_eq!(hub.deliver(&mut sessions, &heartbeat(), None), 0);

        let stats = hub.stats();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_closed_queue_marks_disconnected() {
        let hub = BroadcastHub::new(Arc::new(ChannelMap::new(16)));
        let (bob, rx) = connected("bob", 4);
        let bob_id = bob.id;
        drop(rx);

        let mut sessions = HashMap::new();
        sessions.insert(bob.id, bob);
        assert_eq!(hub.deliver(&mut sessions, &heartbeat(), None), 0);
        assert_eq!(sessions[&bob_id].state, ConnectionState::Disconnected);
        assert_eq!(hub.stats().disconnects, 1);
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_content_is_noop() {
        let hub = BroadcastHub::new(Arc::new(ChannelMap::new(16)));
        assert_eq!(hub.broadcast_to_content_sessions("nope", &heartbeat(), None).await, 0);
        assert_eq!(hub.stats().events, 0);
    }

    #[tokio::test]
    async fn test_broadcast_to_content_sessions() {
        let channels = Arc::new(ChannelMap::new(16));
        let hub = BroadcastHub::new(channels.clone());
        let (bob, mut rx) = connected("bob", 4);
        channels.write("c1").await.sessions.insert(bob.id, bob);

        assert_eq!(hub.broadcast_to_content_sessions("c1", &heartbeat(), None).await, 1);
        assert!(rx.try_recv().is_ok());
    }
}
