use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub relay: RelayConfig,
    pub bus: BusConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Ping cadence for connected clients.
    pub keepalive_seconds: u64,
    /// A connection with no inbound frame for this long is dropped.
    pub idle_timeout_seconds: u64,
    /// Upper bound on a single WebSocket frame. Signaling payloads are
    /// small; anything larger is a misbehaving client.
    pub max_message_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            keepalive_seconds: 30,
            idle_timeout_seconds: 300,
            max_message_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// A room worker with no participants for this long shuts itself down.
    pub idle_room_timeout_seconds: u64,
    /// Upper bound on the ICE gathering wait during offer negotiation.
    pub ice_gathering_timeout_seconds: u64,
    pub stun_servers: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_room_timeout_seconds: 60,
            ice_gathering_timeout_seconds: 10,
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub url: String,
    /// Topic carrying offers from the gateway to the relay dispatcher.
    pub to_relay_topic: String,
    /// Topic carrying answers from room workers back to the gateway.
    pub to_gateway_topic: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            to_relay_topic: "offers".to_string(),
            to_gateway_topic: "answers".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        // Load config file if provided
        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (PARLEY_GATEWAY_PORT, etc.)
        builder = builder.add_source(
            Environment::with_prefix("PARLEY")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get bus URL
    #[must_use]
    pub fn bus_url(&self) -> &str {
        &self.bus.url
    }

    /// Get the gateway listen address
    #[must_use]
    pub fn gateway_address(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }
}
