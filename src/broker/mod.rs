//! Broker bridge: translates registry-level intent into backend calls.
//!
//! The registry's ref-counting guarantees callers only ask for a subscribe on
//! first interest and a release on last interest; the bridge additionally
//! keeps its own held set so repeated calls stay idempotent and the backend
//! sees at most one subscription per channel name. Backend failures are
//! logged, never propagated: the registry reflects intent, and the backend's
//! reconnect pump re-establishes every held channel.

mod backend;
mod backoff;

pub use backend::{BrokerBackend, BrokerEvent, RedisBackend};
pub use backoff::ReconnectBackoff;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::metrics::BrokerMetrics;

/// Whether a channel name is a glob pattern (Redis `PSUBSCRIBE` syntax).
pub fn is_pattern(channel: &str) -> bool {
    channel.contains('*') || channel.contains('?') || channel.contains('[')
}

pub struct BrokerBridge {
    backend: Arc<dyn BrokerBackend>,
    held: Mutex<HashSet<String>>,
}

impl BrokerBridge {
    pub fn new(backend: Arc<dyn BrokerBackend>) -> Self {
        Self {
            backend,
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Subscribe `channel` at the backend unless already held.
    ///
    /// Safe to call repeatedly; the decision is made on local bridge state,
    /// never by re-querying the broker.
    pub async fn ensure_subscribed(&self, channel: &str) {
        let newly_held = {
            let mut held = self.held.lock().expect("bridge lock poisoned");
            held.insert(channel.to_string())
        };
        if !newly_held {
            return;
        }

        let result = if is_pattern(channel) {
            self.backend.psubscribe(channel).await
        } else {
            self.backend.subscribe(channel).await
        };

        if let Err(e) = result {
            // Stay held: intent stands, the backend pump retries on reconnect
            tracing::warn!(channel = %channel, error = %e, "Broker subscribe failed");
        }
    }

    /// Unsubscribe `channel` at the backend. Idempotent; pattern names go
    /// through the pattern-unsubscribe path.
    pub async fn release(&self, channel: &str) {
        let was_held = {
            let mut held = self.held.lock().expect("bridge lock poisoned");
            held.remove(channel)
        };
        if !was_held {
            return;
        }

        let result = if is_pattern(channel) {
            self.backend.punsubscribe(channel).await
        } else {
            self.backend.unsubscribe(channel).await
        };

        if let Err(e) = result {
            tracing::warn!(channel = %channel, error = %e, "Broker unsubscribe failed");
        }
    }

    /// Fire-and-forget publish. Failures are logged, not retried.
    pub async fn publish(&self, channel: &str, payload: &serde_json::Value) {
        let text = match serde_json::to_string(payload) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Failed to serialize publish payload");
                return;
            }
        };

        match self.backend.publish(channel, &text).await {
            Ok(()) => BrokerMetrics::record_publish(),
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Broker publish failed");
            }
        }
    }

    /// Channels the bridge currently holds at the backend.
    pub fn held_channels(&self) -> Vec<String> {
        let held = self.held.lock().expect("bridge lock poisoned");
        held.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde_json::json;

    /// Records every backend call for assertion.
    #[derive(Default)]
    pub struct RecordingBackend {
        pub calls: Mutex<Vec<String>>,
        pub fail_subscribe: std::sync::atomic::AtomicBool,
    }

    impl RecordingBackend {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerBackend for RecordingBackend {
        async fn subscribe(&self, channel: &str) -> anyhow::Result<()> {
            self.record(format!("subscribe:{channel}"));
            if self.fail_subscribe.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("injected failure");
            }
            Ok(())
        }

        async fn psubscribe(&self, pattern: &str) -> anyhow::Result<()> {
            self.record(format!("psubscribe:{pattern}"));
            Ok(())
        }

        async fn unsubscribe(&self, channel: &str) -> anyhow::Result<()> {
            self.record(format!("unsubscribe:{channel}"));
            Ok(())
        }

        async fn punsubscribe(&self, pattern: &str) -> anyhow::Result<()> {
            self.record(format!("punsubscribe:{pattern}"));
            Ok(())
        }

        async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
            self.record(format!("publish:{channel}:{payload}"));
            Ok(())
        }
    }

    #[test]
    fn pattern_detection() {
        assert!(is_pattern("user:*:messages"));
        assert!(is_pattern("conversation:?:typings"));
        assert!(is_pattern("ch[ab]"));
        assert!(!is_pattern("conversation:c1:messages"));
    }

    #[tokio::test]
    async fn repeated_ensure_subscribed_hits_backend_once() {
        let backend = Arc::new(RecordingBackend::default());
        let bridge = BrokerBridge::new(backend.clone());

        bridge.ensure_subscribed("conversation:c1:messages").await;
        bridge.ensure_subscribed("conversation:c1:messages").await;
        bridge.ensure_subscribed("conversation:c1:messages").await;

        assert_eq!(backend.calls(), vec!["subscribe:conversation:c1:messages"]);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let backend = Arc::new(RecordingBackend::default());
        let bridge = BrokerBridge::new(backend.clone());

        bridge.ensure_subscribed("c").await;
        bridge.release("c").await;
        bridge.release("c").await;
        bridge.release("never-held").await;

        assert_eq!(backend.calls(), vec!["subscribe:c", "unsubscribe:c"]);
    }

    #[tokio::test]
    async fn pattern_channels_use_pattern_paths() {
        let backend = Arc::new(RecordingBackend::default());
        let bridge = BrokerBridge::new(backend.clone());

        bridge.ensure_subscribed("user:*:messages").await;
        bridge.release("user:*:messages").await;

        assert_eq!(
            backend.calls(),
            vec!["psubscribe:user:*:messages", "punsubscribe:user:*:messages"]
        );
    }

    #[tokio::test]
    async fn subscribe_failure_keeps_intent() {
        let backend = Arc::new(RecordingBackend::default());
        backend
            .fail_subscribe
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let bridge = BrokerBridge::new(backend.clone());

        bridge.ensure_subscribed("c").await;
        assert_eq!(bridge.held_channels(), vec!["c".to_string()]);

        // Still deduplicated: the failed channel is held, not retried here
        bridge.ensure_subscribed("c").await;
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn publish_serializes_payload() {
        let backend = Arc::new(RecordingBackend::default());
        let bridge = BrokerBridge::new(backend.clone());

        bridge
            .publish("conversation:c1:messages", &json!({"type": "typing"}))
            .await;

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("publish:conversation:c1:messages:"));
        assert!(calls[0].contains("\"typing\""));
    }
}
