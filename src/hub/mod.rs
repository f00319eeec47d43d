//! Connection registry
//!
//! Maps a client id to the outbound queue of the one connection currently
//! registered under it. The hub holds the only sender of each registered
//! queue, so removing an entry is what closes that queue, and an entry can
//! only be removed once.

use crate::error::Result;
use crate::metrics;
use crate::protocol::TranslateResponse;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Process-unique serial of one accepted transport connection
pub type ConnectionId = u64;

struct ClientHandle {
    conn_id: ConnectionId,
    tx: mpsc::Sender<Bytes>,
}

/// Outcome of a best-effort delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the client's outbound queue
    Queued,
    /// Queue full; the message was discarded
    Dropped,
    /// No connection registered under the id
    Unknown,
    /// The connection is shutting down
    Closed,
}

/// Concurrent client registry
pub struct Hub {
    clients: DashMap<String, ClientHandle>,
    next_conn_id: AtomicU64,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate a serial for a newly accepted connection
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `tx` as the delivery queue for `client_id`.
    ///
    /// A connection already registered under the same id is displaced and its
    /// queue closed. Returns the displaced connection's serial.
    pub fn add_client(
        &self,
        client_id: impl Into<String>,
        conn_id: ConnectionId,
        tx: mpsc::Sender<Bytes>,
    ) -> Option<ConnectionId> {
        let client_id = client_id.into();
        let displaced = self
            .clients
            .insert(client_id.clone(), ClientHandle { conn_id, tx })
            .map(|old| old.conn_id);

        match displaced {
            Some(old_conn) => warn!(
                client_id = %client_id,
                conn_id,
                displaced = old_conn,
                "Client id re-registered, closing previous connection"
            ),
            None => info!(client_id = %client_id, conn_id, "Client registered"),
        }
        metrics::set_active_clients(self.clients.len());
        displaced
    }

    /// Remove `client_id` whichever connection holds it
    pub fn remove_client(&self, client_id: &str) -> bool {
        let removed = self.clients.remove(client_id).is_some();
        if removed {
            info!(client_id, "Client removed");
            metrics::set_active_clients(self.clients.len());
        }
        removed
    }

    /// Remove `client_id` only while it still belongs to `conn_id`
    pub fn remove_if_current(&self, client_id: &str, conn_id: ConnectionId) -> bool {
        let removed = self
            .clients
            .remove_if(client_id, |_, handle| handle.conn_id == conn_id)
            .is_some();
        if removed {
            info!(client_id, conn_id, "Client removed");
            metrics::set_active_clients(self.clients.len());
        }
        removed
    }

    /// Queue `payload` for `client_id` without waiting
    pub fn send_to_client(&self, client_id: &str, payload: Bytes) -> Delivery {
        let Some(handle) = self.clients.get(client_id) else {
            debug!(client_id, "Delivery to unknown client skipped");
            return Delivery::Unknown;
        };

        match handle.tx.try_send(payload) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                warn!(client_id, conn_id = handle.conn_id, "Outbound queue full, message dropped");
                metrics::record_message_dropped();
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                debug!(client_id, "Connection closing, message discarded");
                Delivery::Closed
            }
        }
    }

    /// Serialize and deliver a result envelope to its client
    pub fn send_response(&self, response: &TranslateResponse) -> Result<Delivery> {
        let payload = serde_json::to_vec(response)?;
        Ok(self.send_to_client(&response.client_id, Bytes::from(payload)))
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Number of registered clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_to_unknown_client_is_noop() {
        let hub = Hub::new();
        assert_eq!(
            hub.send_to_client("ghost", Bytes::from_static(b"x")),
            Delivery::Unknown
        );
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_add_send_remove() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(4);
        let conn = hub.next_connection_id();

        assert!(hub.add_client("c1", conn, tx).is_none());
        assert_eq!(
            hub.send_to_client("c1", Bytes::from_static(b"hello")),
            Delivery::Queued
        );
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));

        assert!(hub.remove_client("c1"));
        assert!(!hub.remove_client("c1"));

        // the hub held the only sender, so the queue is now closed
        assert!(rx.recv().await.is_none());
        assert_eq!(
            hub.send_to_client("c1", Bytes::from_static(b"late")),
            Delivery::Unknown
        );
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(1);
        hub.add_client("slow", hub.next_connection_id(), tx);

        assert_eq!(
            hub.send_to_client("slow", Bytes::from_static(b"first")),
            Delivery::Queued
        );
        assert_eq!(
            hub.send_to_client("slow", Bytes::from_static(b"second")),
            Delivery::Dropped
        );

        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"first"));
        assert!(rx.try_recv().is_err());
        assert!(hub.contains("slow"));
    }

    #[tokio::test]
    async fn test_reregistration_displaces_previous_connection() {
        let hub = Hub::new();
        let (old_tx, mut old_rx) = mpsc::channel(4);
        let (new_tx, mut new_rx) = mpsc::channel(4);
        let old_conn = hub.next_connection_id();
        let new_conn = hub.next_connection_id();

        hub.add_client("c1", old_conn, old_tx);
        assert_eq!(hub.add_client("c1", new_conn, new_tx), Some(old_conn));
        assert!(old_rx.recv().await.is_none());

        // late cleanup from the displaced connection leaves the new one alone
        assert!(!hub.remove_if_current("c1", old_conn));
        assert_eq!(hub.client_count(), 1);

        hub.send_to_client("c1", Bytes::from_static(b"to-new"));
        assert_eq!(new_rx.recv().await.unwrap(), Bytes::from_static(b"to-new"));

        assert!(hub.remove_if_current("c1", new_conn));
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn test_send_response_targets_client_id() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(1);
        hub.add_client("c1", hub.next_connection_id(), tx);

        let response = TranslateResponse {
            client_id: "c1".to_string(),
            request_id: "r1".to_string(),
            result: "ok".to_string(),
            ..Default::default()
        };
        assert_eq!(hub.send_response(&response).unwrap(), Delivery::Queued);

        let delivered: TranslateResponse =
            serde_json::from_slice(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(delivered, response);
    }

    #[tokio::test]
    async fn test_concurrent_registration() {
        let hub = std::sync::Arc::new(Hub::new());
        let mut tasks = Vec::new();
        for i in 0..100 {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::channel(1);
                let conn = hub.next_connection_id();
                hub.add_client(format!("c{}", i), conn, tx);
                if i % 2 == 0 {
                    hub.remove_if_current(&format!("c{}", i), conn);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(hub.client_count(), 50);
    }
}
