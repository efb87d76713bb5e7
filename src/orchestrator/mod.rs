//! Subscription orchestrator: the server-side public contract.
//!
//! Composes the channel registry, broker bridge and connection hub. All
//! "first interest" / "last interest" decisions come from the registry; the
//! broker call then happens outside the registry lock.

pub mod channels;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broker::{BrokerBridge, BrokerEvent};
use crate::hub::{ConnectionHandle, ConnectionHub, OutboundFrame};
use crate::registry::ChannelRegistry;

pub struct SubscriptionOrchestrator {
    registry: Arc<ChannelRegistry>,
    bridge: Arc<BrokerBridge>,
    hub: Arc<ConnectionHub>,
}

impl SubscriptionOrchestrator {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        bridge: Arc<BrokerBridge>,
        hub: Arc<ConnectionHub>,
    ) -> Self {
        Self { registry, bridge, hub }
    }

    /// Register a user's transport and subscribe their personal channels.
    pub async fn on_connect(
        &self,
        user: &str,
        sender: mpsc::Sender<OutboundFrame>,
    ) -> Arc<ConnectionHandle> {
        let handle = self.hub.register(user, sender);

        for channel in channels::personal_channels(user) {
            if self.registry.add_interest(user, &channel) {
                self.bridge.ensure_subscribed(&channel).await;
            }
        }

        handle
    }

    /// Subscribe `user` to a conversation's channels. Idempotent.
    pub async fn join_conversation(&self, user: &str, conversation_id: &str) {
        for channel in channels::conversation_channels(conversation_id) {
            if self.registry.add_interest(user, &channel) {
                self.bridge.ensure_subscribed(&channel).await;
            }
        }
        tracing::debug!(user_id = %user, conversation_id = %conversation_id, "Joined conversation");
    }

    /// Remove `user` from a conversation's channels, releasing each one whose
    /// interest set empties. Leaving without having joined is a no-op.
    pub async fn leave_conversation(&self, user: &str, conversation_id: &str) {
        for channel in channels::conversation_channels(conversation_id) {
            if self.registry.remove_interest(user, &channel) {
                self.bridge.release(&channel).await;
            }
        }
        tracing::debug!(user_id = %user, conversation_id = %conversation_id, "Left conversation");
    }

    /// Full session teardown for one transport connection.
    ///
    /// Id-checked: a stale disconnect from a superseded socket must not tear
    /// down the interests of the connection that replaced it.
    pub async fn on_disconnect(&self, user: &str, connection_id: Uuid) {
        if !self.hub.unregister(user, connection_id) {
            tracing::debug!(
                user_id = %user,
                connection_id = %connection_id,
                "Stale disconnect ignored"
            );
            return;
        }

        let emptied = self.registry.drop_user(user);
        for channel in emptied {
            self.bridge.release(&channel).await;
        }
    }

    /// Publish an opaque payload to a channel through the bridge.
    pub async fn publish(&self, channel: &str, payload: &serde_json::Value) {
        self.bridge.publish(channel, payload).await;
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            connected_users: self.hub.connection_count(),
            interested_users: self.registry.user_count(),
            active_channels: self.registry.channel_count(),
            broker_subscriptions: self.bridge.held_channels().len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FanoutStats {
    pub connected_users: usize,
    pub interested_users: usize,
    pub active_channels: usize,
    pub broker_subscriptions: usize,
}

/// Fan broker messages out to every locally interested user.
///
/// One message on a channel with N interested users results in exactly N
/// deliveries; users without interest see nothing. The payload is passed
/// through unchanged.
pub fn spawn_fanout_router(
    registry: Arc<ChannelRegistry>,
    hub: Arc<ConnectionHub>,
    mut events_rx: mpsc::Receiver<BrokerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let payload: serde_json::Value = match serde_json::from_str(&event.payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(
                        channel = %event.channel,
                        error = %e,
                        "Malformed broker payload, dropping"
                    );
                    continue;
                }
            };

            let users = registry.users_for(&event.channel);
            if users.is_empty() {
                tracing::debug!(channel = %event.channel, "No interested users for broker message");
                continue;
            }

            tracing::debug!(
                channel = %event.channel,
                recipients = users.len(),
                "Fanning out broker message"
            );
            for user in users {
                hub.deliver(&user, &payload);
            }
        }
        tracing::info!("Fanout router stopped");
    })
}
