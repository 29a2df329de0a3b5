//! # Configuration Management Module
//!
//! Startup parameters for the gateway, loaded once from a TOML file and
//! treated as read-only afterwards.
//!
//! ## Configuration Structure
//!
//! - [`GatewayConfig`] - gateway identity and bus topics
//! - [`RadioConfig`] - transceiver parameters handed to the radio driver
//! - [`RegistryConfig`] - ack arbitration tuning
//! - [`DeliveryConfig`] - reliable delivery buffer tuning
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rfgw::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("rfgw.toml").await?;
//!     println!("Gateway: {}", config.gateway.name);
//!     Config::create_default("rfgw.example.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [gateway]
//! name = "rfgw-garage"
//! announce_topic = "rfgw/reports"
//!
//! [radio]
//! node_id = 63
//! group = 6
//! frequency_khz = 912500
//! power_dbm = 10
//!
//! [registry]
//! stale_after_ms = 5000
//! ack_policy = "responsible_or_unknown"
//!
//! [delivery]
//! retransmit_after_ms = 1100
//! max_pending = 100
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::registry::gateways::DEFAULT_MAX_GATEWAYS;
use crate::registry::AckPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Identity announced to peer gateways; also the prefix of the forward topic.
    pub name: String,
    /// Topic shared by all gateways for node reception announcements.
    #[serde(default = "default_announce_topic")]
    pub announce_topic: String,
    /// Appended to `name` to form the packet forwarding topic.
    #[serde(default = "default_forward_suffix")]
    pub forward_suffix: String,
    /// How often the loop polls the radio for frames (ms).
    #[serde(default = "default_radio_poll_ms")]
    pub radio_poll_ms: u64,
    /// Interval for the periodic status log line (s). 0 disables it.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

fn default_announce_topic() -> String {
    "rfgw/reports".to_string()
}

fn default_forward_suffix() -> String {
    "/rx".to_string()
}

fn default_radio_poll_ms() -> u64 {
    2
}

fn default_status_interval_secs() -> u64 {
    20
}

impl GatewayConfig {
    pub fn forward_topic(&self) -> String {
        format!("{}{}", self.name, self.forward_suffix)
    }
}

/// Transceiver settings. Only consumed by the radio driver at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Our node id on the radio network (61 = tx-only, 63 = promiscuous).
    pub node_id: u8,
    pub group: u8,
    pub frequency_khz: u32,
    pub power_dbm: i8,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            node_id: 63,
            group: 6,
            frequency_khz: 912_500,
            power_dbm: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Age after which the recorded best gateway for a node may be replaced
    /// by any fresh observation (ms).
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// Capacity of the gateway name table, local gateway included.
    #[serde(default = "default_max_gateways")]
    pub max_gateways: usize,
    #[serde(default)]
    pub ack_policy: AckPolicy,
}

fn default_stale_after_ms() -> u64 {
    5000
}

fn default_max_gateways() -> usize {
    DEFAULT_MAX_GATEWAYS
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: default_stale_after_ms(),
            max_gateways: default_max_gateways(),
            ack_policy: AckPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Resend an unconfirmed publish after this long (ms).
    #[serde(default = "default_retransmit_after_ms")]
    pub retransmit_after_ms: u64,
    /// Cap on packets held, sent or not.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Packets received longer ago than this are dropped (s).
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Largest forward record the bus accepts (bytes).
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Period of the maintenance pass (ms).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_retransmit_after_ms() -> u64 {
    1100
}

fn default_max_pending() -> usize {
    100
}

fn default_max_age_secs() -> u64 {
    300
}

fn default_max_message_bytes() -> usize {
    512
}

fn default_tick_interval_ms() -> u64 {
    100
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retransmit_after_ms: default_retransmit_after_ms(),
            max_pending: default_max_pending(),
            max_age_secs: default_max_age_secs(),
            max_message_bytes: default_max_message_bytes(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.name.trim().is_empty() {
            return Err(anyhow!("gateway.name must not be empty"));
        }
        if self.gateway.announce_topic.is_empty() {
            return Err(anyhow!("gateway.announce_topic must not be empty"));
        }
        if self.gateway.forward_topic() == self.gateway.announce_topic {
            return Err(anyhow!("forward topic must differ from announce topic"));
        }
        if self.registry.max_gateways < 2 {
            return Err(anyhow!("registry.max_gateways must be at least 2"));
        }
        if self.delivery.max_pending == 0 {
            return Err(anyhow!("delivery.max_pending must be positive"));
        }
        if self.delivery.retransmit_after_ms == 0 || self.delivery.tick_interval_ms == 0 {
            return Err(anyhow!("delivery intervals must be positive"));
        }
        if self.gateway.radio_poll_ms == 0 {
            return Err(anyhow!("gateway.radio_poll_ms must be positive"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway: GatewayConfig {
                name: "rfgw".to_string(),
                announce_topic: default_announce_topic(),
                forward_suffix: default_forward_suffix(),
                radio_poll_ms: default_radio_poll_ms(),
                status_interval_secs: default_status_interval_secs(),
            },
            radio: RadioConfig::default(),
            registry: RegistryConfig::default(),
            delivery: DeliveryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
