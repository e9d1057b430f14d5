//! WebSocket Broadcaster
//!
//! Broadcasts merged price updates to all connected WebSocket clients.

use super::types::WsMessage;
use crate::oracle::store::{sorted_records, PriceStore};
use tokio::sync::broadcast;

/// Channel for broadcasting updates to WebSocket clients
#[derive(Debug, Clone)]
pub struct WebSocketBroadcaster {
    tx: broadcast::Sender<String>,
}

impl WebSocketBroadcaster {
    /// Create a new broadcaster with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to receive broadcast messages
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Broadcast a message to all connected clients
    pub fn broadcast(&self, msg: &WsMessage) {
        if let Ok(json) = serde_json::to_string(msg) {
            // Ignore send errors (no receivers is fine)
            let _ = self.tx.send(json);
        }
    }

    /// Forward every store change to connected clients; the store skips
    /// building snapshots while nobody is connected
    pub fn attach(&self, store: &PriceStore) {
        let gate = self.tx.clone();
        let broadcaster = self.clone();
        store.subscribe_while(
            move || gate.receiver_count() > 0,
            move |table| broadcaster.broadcast(&WsMessage::Prices(sorted_records(table))),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceUpdate;

    #[tokio::test]
    async fn test_store_updates_are_broadcast() {
        let store = PriceStore::new();
        let broadcaster = WebSocketBroadcaster::new(8);
        broadcaster.attach(&store);
        let mut rx = broadcaster.subscribe();

        store.update_from_binance(&[PriceUpdate::new("BTC", 50000.0)]);

        let msg: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "prices");
        assert_eq!(msg["data"][0]["symbol"], "BTC");
        assert_eq!(msg["data"][0]["source"], "binance");
    }

    #[test]
    fn test_no_receivers_is_fine() {
        let store = PriceStore::new();
        WebSocketBroadcaster::new(1).attach(&store);
        store.update_from_coinranking(&[PriceUpdate::new("ETH", 1.0)]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_updates_before_first_client_are_not_queued() {
        let store = PriceStore::new();
        let broadcaster = WebSocketBroadcaster::new(8);
        broadcaster.attach(&store);

        store.update_from_binance(&[PriceUpdate::new("BTC", 1.0)]);
        let mut rx = broadcaster.subscribe();
        store.update_from_binance(&[PriceUpdate::new("ETH", 2.0)]);

        let msg: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["data"].as_array().unwrap().len(), 2);
        assert!(rx.try_recv().is_err());
    }
}
