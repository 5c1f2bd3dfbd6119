use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::DEFAULT_MAX_FRAME_LENGTH;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listen address (default: "0.0.0.0:18866")
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Read idle window in seconds (0 = disabled, default: 180)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// What to do with a connection once it turns idle (default: "log")
    #[serde(default)]
    pub idle_policy: IdlePolicy,

    /// Echo every inbound frame back to its sender (default: true)
    #[serde(default = "default_echo")]
    pub echo: bool,

    /// Largest accepted frame, header included (default: 1 MiB)
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,

    /// Outbound frames buffered per connection before it is dropped (default: 1024)
    #[serde(default = "default_write_queue_capacity")]
    pub write_queue_capacity: usize,

    /// Log filter used when RUST_LOG is not set (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Broker configuration
    #[serde(default)]
    pub broker: BrokerConfig,
}

fn default_listen() -> String {
    "0.0.0.0:18866".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    180 // 3 minutes
}

fn default_echo() -> bool {
    true
}

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

fn default_write_queue_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            idle_timeout_secs: default_idle_timeout_secs(),
            idle_policy: IdlePolicy::default(),
            echo: default_echo(),
            max_frame_length: default_max_frame_length(),
            write_queue_capacity: default_write_queue_capacity(),
            log_level: default_log_level(),
            broker: BrokerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Idle window as Duration, `None` when idle detection is disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_secs))
        }
    }

    /// Per-connection queue capacity (minimum 1)
    pub fn write_queue_capacity(&self) -> usize {
        self.write_queue_capacity.max(1)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdlePolicy {
    /// Log the idle event and keep the connection
    #[default]
    Log,
    /// Close the connection on the idle event
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    #[default]
    Amqp,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker backend: "amqp" or "memory" (default: "amqp")
    #[serde(default)]
    pub backend: BrokerBackend,

    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default = "default_broker_credential")]
    pub username: String,

    #[serde(default = "default_broker_credential")]
    pub password: String,

    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,

    /// Fanout exchange inbound client payloads are published to
    #[serde(default = "default_publish_exchange")]
    pub publish_exchange: String,

    /// Direct exchange the relay consumes broadcasts from
    #[serde(default = "default_subscribe_exchange")]
    pub subscribe_exchange: String,

    #[serde(default = "default_queue")]
    pub queue: String,

    #[serde(default = "default_routing_key")]
    pub routing_key: String,

    /// Payloads waiting for the publisher task (default: 1024)
    #[serde(default = "default_publish_queue_capacity")]
    pub publish_queue_capacity: usize,

    /// Delay between reconnection attempts in milliseconds (default: 5000)
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Consecutive declaration failures before the subscriber gives up (0 = never, default: 5)
    #[serde(default = "default_max_declare_failures")]
    pub max_declare_failures: u32,
}

fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}

fn default_broker_port() -> u16 {
    5672
}

fn default_broker_credential() -> String {
    "guest".to_string()
}

fn default_virtual_host() -> String {
    "/".to_string()
}

fn default_publish_exchange() -> String {
    "NettyMqServerSenderExchange".to_string()
}

fn default_subscribe_exchange() -> String {
    "NettyMqServerListenerExchange".to_string()
}

fn default_queue() -> String {
    "MqListenerQueue".to_string()
}

fn default_routing_key() -> String {
    "mqListener".to_string()
}

fn default_publish_queue_capacity() -> usize {
    1024
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_max_declare_failures() -> u32 {
    5
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            host: default_broker_host(),
            port: default_broker_port(),
            username: default_broker_credential(),
            password: default_broker_credential(),
            virtual_host: default_virtual_host(),
            publish_exchange: default_publish_exchange(),
            subscribe_exchange: default_subscribe_exchange(),
            queue: default_queue(),
            routing_key: default_routing_key(),
            publish_queue_capacity: default_publish_queue_capacity(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_declare_failures: default_max_declare_failures(),
        }
    }
}

impl BrokerConfig {
    /// Reconnect interval with protection (minimum 100ms)
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(100))
    }

    pub fn publish_queue_capacity(&self) -> usize {
        self.publish_queue_capacity.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen, "0.0.0.0:18866");
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(180)));
        assert_eq!(config.idle_policy, IdlePolicy::Log);
        assert!(config.echo);
        assert_eq!(config.broker.backend, BrokerBackend::Amqp);
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.broker.virtual_host, "/");
        assert_eq!(config.broker.reconnect_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.listen, Config::default().listen);
        assert_eq!(config.broker.queue, "MqListenerQueue");
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            listen = "127.0.0.1:0"
            idle_timeout_secs = 0
            idle_policy = "disconnect"
            echo = false

            [broker]
            backend = "memory"
            host = "mq.internal"
            reconnect_interval_ms = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:0");
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.idle_policy, IdlePolicy::Disconnect);
        assert!(!config.echo);
        assert_eq!(config.broker.backend, BrokerBackend::Memory);
        assert_eq!(config.broker.host, "mq.internal");
        assert_eq!(config.broker.username, "guest");
        assert_eq!(config.broker.reconnect_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::from_toml("idle_policy = \"sometimes\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/relayd.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
