mod settings;

pub use settings::{
    BrokerConfig, ClientConfig, ServerConfig, Settings, WebSocketConfig,
};
