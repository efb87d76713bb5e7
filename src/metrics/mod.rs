//! Prometheus metrics for the fanout service.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ripple";

lazy_static! {
    /// Total WebSocket connections opened since startup
    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections opened"
    ).unwrap();

    /// Total WebSocket connections closed since startup
    pub static ref WS_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed"
    ).unwrap();

    /// Currently connected users
    pub static ref USERS_CONNECTED: IntGauge = register_int_gauge!(
        format!("{}_users_connected", METRIC_PREFIX),
        "Number of currently connected users"
    ).unwrap();

    /// Payloads delivered to local connections
    pub static ref FANOUT_DELIVERED: IntCounter = register_int_counter!(
        format!("{}_fanout_delivered_total", METRIC_PREFIX),
        "Payloads delivered to local connections"
    ).unwrap();

    /// Payloads dropped because the target had no open handle
    pub static ref FANOUT_DROPPED: IntCounter = register_int_counter!(
        format!("{}_fanout_dropped_total", METRIC_PREFIX),
        "Payloads dropped for absent or closed connections"
    ).unwrap();

    /// Messages received from the broker
    pub static ref BROKER_MESSAGES: IntCounter = register_int_counter!(
        format!("{}_broker_messages_total", METRIC_PREFIX),
        "Messages received from the pub/sub backend"
    ).unwrap();

    /// Publishes sent to the broker
    pub static ref BROKER_PUBLISHES: IntCounter = register_int_counter!(
        format!("{}_broker_publishes_total", METRIC_PREFIX),
        "Messages published to the pub/sub backend"
    ).unwrap();

    /// Broker pub/sub reconnections
    pub static ref BROKER_RECONNECTS: IntCounter = register_int_counter!(
        format!("{}_broker_reconnects_total", METRIC_PREFIX),
        "Pub/sub backend reconnection attempts"
    ).unwrap();
}

pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        WS_CONNECTIONS_OPENED.inc();
        USERS_CONNECTED.inc();
    }

    pub fn record_closed() {
        WS_CONNECTIONS_CLOSED.inc();
        USERS_CONNECTED.dec();
    }
}

pub struct FanoutMetrics;

impl FanoutMetrics {
    pub fn record_delivered() {
        FANOUT_DELIVERED.inc();
    }

    pub fn record_dropped() {
        FANOUT_DROPPED.inc();
    }
}

pub struct BrokerMetrics;

impl BrokerMetrics {
    pub fn record_message() {
        BROKER_MESSAGES.inc();
    }

    pub fn record_publish() {
        BROKER_PUBLISHES.inc();
    }

    pub fn record_reconnect() {
        BROKER_RECONNECTS.inc();
    }
}

/// Encode all registered metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_prefixed_output() {
        ConnectionMetrics::record_opened();
        FanoutMetrics::record_delivered();
        let output = encode_metrics().unwrap();
        assert!(output.contains("ripple_ws_connections_opened_total"));
        assert!(output.contains("ripple_fanout_delivered_total"));
    }
}
