//! Live per-user transport handles.
//!
//! The hub owns the only reference to each user's transport. At most one
//! handle per user: registering a new one supersedes the old, which is told
//! to close. Delivery to an absent or closed handle logs and drops; offline
//! users catch up through the persistence layer on reconnect, not here.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::metrics::{ConnectionMetrics, FanoutMetrics};

/// Frame headed for a connection's writer task.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// Serialized JSON to send as a text frame
    Payload(String),
    /// Close the socket (used when a newer connection supersedes this one)
    Close,
}

/// Handle for a single live transport connection.
pub struct ConnectionHandle {
    pub id: Uuid,
    pub user_id: String,
    sender: mpsc::Sender<OutboundFrame>,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    fn new(user_id: String, sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            sender,
            connected_at: Utc::now(),
        }
    }

    /// Non-blocking send to the writer task.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        self.sender.try_send(frame).is_ok()
    }
}

/// Registry of live connections, keyed by user id.
#[derive(Default)]
pub struct ConnectionHub {
    connections: DashMap<String, Arc<ConnectionHandle>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `user`, superseding any prior one.
    ///
    /// The prior handle, if any, is sent a close frame; its socket task will
    /// observe the closure and unregister itself (id-checked, so it cannot
    /// evict the successor).
    pub fn register(&self, user: &str, sender: mpsc::Sender<OutboundFrame>) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle::new(user.to_string(), sender));

        if let Some(prior) = self.connections.insert(user.to_string(), handle.clone()) {
            tracing::info!(
                user_id = %user,
                prior_connection = %prior.id,
                new_connection = %handle.id,
                "Superseding existing connection"
            );
            let _ = prior.send(OutboundFrame::Close);
        } else {
            ConnectionMetrics::record_opened();
        }

        tracing::info!(connection_id = %handle.id, user_id = %user, "Connection registered");
        handle
    }

    /// Remove `user`'s handle, but only if it is still `connection_id`.
    ///
    /// Returns true if a handle was actually removed. A stale close from a
    /// superseded socket is a no-op.
    pub fn unregister(&self, user: &str, connection_id: Uuid) -> bool {
        let removed = self
            .connections
            .remove_if(user, |_, handle| handle.id == connection_id)
            .is_some();

        if removed {
            ConnectionMetrics::record_closed();
            tracing::info!(connection_id = %connection_id, user_id = %user, "Connection unregistered");
        }
        removed
    }

    /// Serialize `payload` to `user`'s live handle. Absent or closed handles
    /// log and drop; there is no delivery guarantee to disconnected users.
    pub fn deliver(&self, user: &str, payload: &serde_json::Value) {
        let handle = match self.connections.get(user) {
            Some(h) => h.clone(),
            None => {
                FanoutMetrics::record_dropped();
                tracing::debug!(user_id = %user, "No live connection, dropping payload");
                return;
            }
        };

        let text = match serde_json::to_string(payload) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(user_id = %user, error = %e, "Failed to serialize payload");
                return;
            }
        };

        if handle.send(OutboundFrame::Payload(text)) {
            FanoutMetrics::record_delivered();
        } else {
            FanoutMetrics::record_dropped();
            tracing::debug!(
                user_id = %user,
                connection_id = %handle.id,
                "Send buffer closed or full, dropping payload"
            );
        }
    }

    pub fn get(&self, user: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(user).map(|h| h.clone())
    }

    /// User ids with a live connection.
    pub fn online_users(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
