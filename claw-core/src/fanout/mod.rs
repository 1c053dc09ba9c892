//! Status Fan-out: a broadcast-only registry for `/ws/status` viewers.
//!
//! Each connected viewer gets its own unbounded channel; `broadcast` just
//! pushes onto every channel (never blocks — an unbounded `send` cannot
//! back up the dispatcher). The actual socket write, and its per-client
//! send timeout, live in `claw-server`'s WebSocket handler: if a write
//! stalls past the timeout, that handler drops its receiver and exits,
//! and the next `broadcast` call notices the closed channel and evicts it.
//! One stalled viewer never blocks delivery to the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};

use protocol::StatusServerMessage;

pub struct StatusFanout {
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<StatusServerMessage>>>,
    next_id: AtomicU64,
}

impl StatusFanout {
    pub fn new() -> StatusFanout {
        StatusFanout { clients: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    /// Register a new viewer, returning its id (for `unregister`) and the
    /// receiving half it should drain and forward to its socket.
    pub async fn register(&self) -> (u64, mpsc::UnboundedReceiver<StatusServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.lock().await.insert(id, tx);
        tracing::info!(viewer_count = self.clients.lock().await.len(), "status viewer connected");
        (id, rx)
    }

    pub async fn unregister(&self, id: u64) {
        let mut clients = self.clients.lock().await;
        clients.remove(&id);
        tracing::info!(viewer_count = clients.len(), "status viewer disconnected");
    }

    pub async fn viewer_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Push `message` to every connected viewer, pruning any whose
    /// channel has since closed.
    pub async fn broadcast(&self, message: StatusServerMessage) {
        let mut clients = self.clients.lock().await;
        let mut dead = Vec::new();
        for (id, tx) in clients.iter() {
            if tx.send(message.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            clients.remove(&id);
        }
    }
}

impl Default for StatusFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_registered_viewers() {
        let fanout = StatusFanout::new();
        let (_id_a, mut rx_a) = fanout.register().await;
        let (_id_b, mut rx_b) = fanout.register().await;

        fanout.broadcast(StatusServerMessage::Ping).await;

        assert!(matches!(rx_a.recv().await, Some(StatusServerMessage::Ping)));
        assert!(matches!(rx_b.recv().await, Some(StatusServerMessage::Ping)));
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_broadcast() {
        let fanout = StatusFanout::new();
        let (_id, rx) = fanout.register().await;
        drop(rx);
        assert_eq!(fanout.viewer_count().await, 1);

        fanout.broadcast(StatusServerMessage::Ping).await;
        assert_eq!(fanout.viewer_count().await, 0);
    }

    #[tokio::test]
    async fn unregister_removes_viewer() {
        let fanout = StatusFanout::new();
        let (id, _rx) = fanout.register().await;
        assert_eq!(fanout.viewer_count().await, 1);
        fanout.unregister(id).await;
        assert_eq!(fanout.viewer_count().await, 0);
    }
}
