//! Client transports.
//!
//! A session never owns a socket. It holds a [`TransportHandle`]: the
//! sending half of the connection task's outbound queue. The connection task
//! owns the socket and drains the queue in order.

pub mod websocket;

use std::sync::atomic::{AtomicU64, Ordering};
use termrelay_core::ServerMessage;
use tokio::sync::mpsc;
use tracing::debug;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Items queued for a connection's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Close the socket after everything queued before it was sent.
    Close { reason: String },
}

/// Exclusive reference to a live client transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl TransportHandle {
    /// Create a handle and the queue the connection task drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the connection task is still draining the queue.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a message. Returns `false` if the transport is gone; the failure
    /// is not an error.
    pub fn send(&self, msg: ServerMessage) -> bool {
        if !self.is_open() {
            debug!(transport_id = self.id, "dropping message for closed transport");
            return false;
        }
        self.tx.send(Outbound::Message(msg)).is_ok()
    }

    /// Ask the connection task to close the socket.
    pub fn close(&self, reason: &str) {
        if self.is_open() {
            let _ = self.tx.send(Outbound::Close {
                reason: reason.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let (a, _ra) = TransportHandle::new();
        let (b, _rb) = TransportHandle::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn send_after_receiver_dropped_is_swallowed() {
        let (t, rx) = TransportHandle::new();
        assert!(t.send(ServerMessage::output("a")));
        drop(rx);
        assert!(!t.is_open());
        assert!(!t.send(ServerMessage::output("b")));
        t.close("gone");
    }

    #[test]
    fn close_is_queued_after_messages() {
        let (t, mut rx) = TransportHandle::new();
        t.send(ServerMessage::output("x"));
        t.close("evicted");
        assert_eq!(rx.try_recv().unwrap(), Outbound::Message(ServerMessage::output("x")));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close {
                reason: "evicted".into()
            }
        );
    }
}
