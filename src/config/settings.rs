use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Initial reconnect delay for the pub/sub pump (ms)
    #[serde(default = "default_broker_initial_delay")]
    pub reconnect_initial_delay_ms: u64,
    /// Maximum reconnect delay for the pub/sub pump (ms)
    #[serde(default = "default_broker_max_delay")]
    pub reconnect_max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Buffer size of the per-connection outbound channel
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
    /// Seconds a socket may sit unidentified before the server closes it
    #[serde(default = "default_identify_timeout")]
    pub identify_timeout: u64,
}

/// Reconnect policy for the client-side connection state machine.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_client_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_broker_initial_delay() -> u64 {
    100
}

fn default_broker_max_delay() -> u64 {
    30_000 // 30 seconds
}

fn default_send_buffer() -> usize {
    32
}

fn default_identify_timeout() -> u64 {
    10
}

fn default_client_base_delay() -> u64 {
    1_000
}

fn default_client_max_delay() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    8
}

fn default_queue_capacity() -> usize {
    100
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8082)?
            .set_default("broker.url", "redis://localhost:6379")?
            .set_default("websocket.send_buffer", 32)?
            .set_default("websocket.identify_timeout", 10)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER_HOST, SERVER_PORT, BROKER_URL, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            reconnect_initial_delay_ms: default_broker_initial_delay(),
            reconnect_max_delay_ms: default_broker_max_delay(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            send_buffer: default_send_buffer(),
            identify_timeout: default_identify_timeout(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_client_base_delay(),
            max_delay_ms: default_client_max_delay(),
            max_reconnect_attempts: default_max_attempts(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings {
            server: ServerConfig::default(),
            broker: BrokerConfig::default(),
            websocket: WebSocketConfig::default(),
            client: ClientConfig::default(),
        };
        assert_eq!(settings.server_addr(), "0.0.0.0:8082");
        assert_eq!(settings.client.queue_capacity, 100);
        assert_eq!(settings.client.base_delay_ms, 1_000);
        assert_eq!(settings.client.max_delay_ms, 10_000);
    }
}
