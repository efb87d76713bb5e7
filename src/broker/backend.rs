use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc};

use crate::config::BrokerConfig;
use crate::metrics::BrokerMetrics;

use super::backoff::ReconnectBackoff;

/// A message received from the pub/sub backend.
#[derive(Debug, Clone)]
pub struct BrokerEvent {
    pub channel: String,
    pub payload: String,
}

/// Seam between the bridge and the concrete pub/sub backend.
///
/// Implementations must tolerate repeated and unmatched calls; the bridge
/// already deduplicates, this is the raw wire surface.
#[async_trait]
pub trait BrokerBackend: Send + Sync {
    async fn subscribe(&self, channel: &str) -> anyhow::Result<()>;
    async fn psubscribe(&self, pattern: &str) -> anyhow::Result<()>;
    async fn unsubscribe(&self, channel: &str) -> anyhow::Result<()>;
    async fn punsubscribe(&self, pattern: &str) -> anyhow::Result<()>;
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()>;
}

enum PumpCmd {
    Subscribe(String),
    PSubscribe(String),
    Unsubscribe(String),
    PUnsubscribe(String),
}

/// Redis pub/sub backend.
///
/// Subscription changes are forwarded to a background pump task that owns the
/// pub/sub connection. The pump reconnects on its own with exponential
/// backoff and re-subscribes everything it was asked for, so callers never
/// observe backend connection loss. Publishes go through a separate
/// multiplexed connection.
pub struct RedisBackend {
    cmd_tx: mpsc::UnboundedSender<PumpCmd>,
    publisher: redis::aio::ConnectionManager,
}

impl RedisBackend {
    /// Connect to Redis and spawn the pub/sub pump.
    ///
    /// Inbound messages are forwarded to `events_tx`; the pump exits when the
    /// shutdown channel fires.
    pub async fn connect(
        config: &BrokerConfig,
        events_tx: mpsc::Sender<BrokerEvent>,
        shutdown: broadcast::Sender<()>,
    ) -> anyhow::Result<Arc<Self>> {
        let client = redis::Client::open(config.url.as_str())?;
        let publisher = redis::aio::ConnectionManager::new(client.clone()).await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let backoff = ReconnectBackoff::new(
            config.reconnect_initial_delay_ms,
            config.reconnect_max_delay_ms,
        );

        tokio::spawn(pump_task(
            client,
            cmd_rx,
            events_tx,
            shutdown.subscribe(),
            backoff,
        ));

        Ok(Arc::new(Self { cmd_tx, publisher }))
    }

    fn send_cmd(&self, cmd: PumpCmd) -> anyhow::Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| anyhow::anyhow!("Broker pump task is not running"))
    }
}

#[async_trait]
impl BrokerBackend for RedisBackend {
    async fn subscribe(&self, channel: &str) -> anyhow::Result<()> {
        self.send_cmd(PumpCmd::Subscribe(channel.to_string()))
    }

    async fn psubscribe(&self, pattern: &str) -> anyhow::Result<()> {
        self.send_cmd(PumpCmd::PSubscribe(pattern.to_string()))
    }

    async fn unsubscribe(&self, channel: &str) -> anyhow::Result<()> {
        self.send_cmd(PumpCmd::Unsubscribe(channel.to_string()))
    }

    async fn punsubscribe(&self, pattern: &str) -> anyhow::Result<()> {
        self.send_cmd(PumpCmd::PUnsubscribe(pattern.to_string()))
    }

    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        let mut conn = self.publisher.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }
}

/// Desired subscription state, kept across reconnects.
#[derive(Default)]
struct Wanted {
    channels: HashSet<String>,
    patterns: HashSet<String>,
}

async fn pump_task(
    client: redis::Client,
    mut cmd_rx: mpsc::UnboundedReceiver<PumpCmd>,
    events_tx: mpsc::Sender<BrokerEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut backoff: ReconnectBackoff,
) {
    let mut wanted = Wanted::default();

    loop {
        match run_pump(&client, &mut cmd_rx, &events_tx, &mut shutdown_rx, &mut wanted, &mut backoff).await {
            Ok(()) => {
                tracing::info!("Broker pump stopped gracefully");
                break;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                BrokerMetrics::record_reconnect();
                tracing::error!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    attempt = backoff.attempt(),
                    "Broker pub/sub connection lost, reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
        }
    }
}

async fn run_pump(
    client: &redis::Client,
    cmd_rx: &mut mpsc::UnboundedReceiver<PumpCmd>,
    events_tx: &mpsc::Sender<BrokerEvent>,
    shutdown_rx: &mut broadcast::Receiver<()>,
    wanted: &mut Wanted,
    backoff: &mut ReconnectBackoff,
) -> anyhow::Result<()> {
    let pubsub = client.get_async_pubsub().await?;
    let (mut sink, mut stream) = pubsub.split();

    // Re-establish everything callers still want
    for channel in &wanted.channels {
        sink.subscribe(channel).await?;
    }
    for pattern in &wanted.patterns {
        sink.psubscribe(pattern).await?;
    }

    backoff.reset();
    tracing::info!(
        channels = wanted.channels.len(),
        patterns = wanted.patterns.len(),
        "Broker pub/sub connection established"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("Broker pump received shutdown signal");
                return Ok(());
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(PumpCmd::Subscribe(channel)) => {
                        if wanted.channels.insert(channel.clone()) {
                            sink.subscribe(&channel).await?;
                            tracing::debug!(channel = %channel, "Subscribed at broker");
                        }
                    }
                    Some(PumpCmd::PSubscribe(pattern)) => {
                        if wanted.patterns.insert(pattern.clone()) {
                            sink.psubscribe(&pattern).await?;
                            tracing::debug!(pattern = %pattern, "Pattern-subscribed at broker");
                        }
                    }
                    Some(PumpCmd::Unsubscribe(channel)) => {
                        if wanted.channels.remove(&channel) {
                            sink.unsubscribe(&channel).await?;
                            tracing::debug!(channel = %channel, "Unsubscribed at broker");
                        }
                    }
                    Some(PumpCmd::PUnsubscribe(pattern)) => {
                        if wanted.patterns.remove(&pattern) {
                            sink.punsubscribe(&pattern).await?;
                            tracing::debug!(pattern = %pattern, "Pattern-unsubscribed at broker");
                        }
                    }
                    None => {
                        // All senders dropped, nothing left to serve
                        return Ok(());
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(msg) => {
                        let channel = msg.get_channel_name().to_string();
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::warn!(error = %e, channel = %channel, "Failed to read broker payload");
                                continue;
                            }
                        };
                        BrokerMetrics::record_message();
                        if events_tx.send(BrokerEvent { channel, payload }).await.is_err() {
                            tracing::warn!("Broker event consumer gone, stopping pump");
                            return Ok(());
                        }
                    }
                    None => anyhow::bail!("Broker message stream ended"),
                }
            }
        }
    }
}
